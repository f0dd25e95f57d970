//! # Fleet Telematics
//!
//! Vehicle telematics agent: monitors the J1939 and J1587 vehicle buses
//! through a local bus gateway and delivers events to the configured servers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use fleet_telematics::bus::gateway::{self, GatewayMessage};
use fleet_telematics::bus::j1587::J1587Stack;
use fleet_telematics::bus::j1939::{J1939Config, J1939Stack};
use fleet_telematics::codemap::MemoryCodeMap;
use fleet_telematics::config::{Config, LoggingConfig};
use fleet_telematics::delivery::device::{HostDevice, NetworkKind};
use fleet_telematics::delivery::queue::MemoryQueue;
use fleet_telematics::delivery::transport::UdpTransport;
use fleet_telematics::delivery::{DeliveryEngine, DeliveryOptions, NUM_SUPPORTED_SERVERS};
use fleet_telematics::engine::EngineArbiter;
use fleet_telematics::event::ConnectInfo;
use fleet_telematics::scheduler::Millis;
use fleet_telematics::settings::{param, setting, vehicle_buses, SettingStore, Settings};
use fleet_telematics::state::StateStore;

/// Config file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Longest sleep when no timer is pending
const IDLE_WAKE_MS: Millis = 1000;

/// Largest gateway datagram: kind, CAN id and 8 data bytes, or a J1708 frame
const GATEWAY_BUFFER_SIZE: usize = 64;

/// Main entry point for the telematics agent
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging, optionally to a daily rolling file
///    - Open persisted state and settings
///    - Build the bus stacks, engine arbiter and delivery engine
///
/// 2. **Main Loop**
///    - Feed gateway frames to the engine arbiter
///    - Forward frames the stacks transmit to the gateway
///    - Run every component's timers at the nearest deadline
///    - Queue arbiter events for delivery
///
/// 3. **Shutdown**
///    - On Ctrl+C, or when the device asks for a restart or power down
///
/// # Errors
///
/// Returns error if the configuration, state or settings cannot be loaded, or
/// the gateway socket cannot be bound.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);

    info!("Fleet Telematics v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Device {}", config.device.serial_number);

    let state = StateStore::open(&config.device.state_path)
        .with_context(|| format!("Failed to open state {}", config.device.state_path))?
        .shared();
    let settings = SettingStore::open(&config.device.settings_path, config.setting_overrides()?)
        .with_context(|| format!("Failed to open settings {}", config.device.settings_path))?;

    // Vehicle buses
    let (sink, mut outbound) = gateway::channel();
    let buses = vehicle_buses(&settings);

    let j1939 = buses.j1939_bitrate.map(|bitrate| {
        let j1939_config = J1939Config {
            device_id: config.j1939_device_id(),
            bitrate,
            parking_brake_conflict_state: settings
                .read_parameter_int(setting::PARKING_BRAKE, param::PARKING_BRAKE_CONFLICT_STATE)
                != 0,
        };
        J1939Stack::new(j1939_config, Box::new(sink.clone()), Arc::clone(&state))
    });
    let start_bitrate = j1939.as_ref().map(J1939Stack::start_bitrate);
    let j1587 = buses.j1587.then(|| J1587Stack::new(Box::new(sink.clone())));

    let mut arbiter = EngineArbiter::new(Arc::clone(&state), j1939, j1587);
    let fuel_status_seconds =
        settings.read_parameter_int(setting::FUEL_STATUS, param::FUEL_STATUS_SECONDS);

    // Server delivery
    let network = if config.device.cellular {
        NetworkKind::Cellular
    } else {
        NetworkKind::Other
    };
    let mut device = HostDevice::new(
        network,
        ConnectInfo {
            network_operator: config.device.network_operator.clone(),
            ..Default::default()
        },
    );
    if let Some(target) = &config.device.route_check {
        device = device.with_route_check(target.parse().context("Invalid route_check")?);
    }
    let exit = device.exit_handle();

    let options = DeliveryOptions {
        device_id: config.device.serial_number.clone(),
        use_live_connect_info: config.delivery.use_live_connect_info,
        tick_normal_ms: config.delivery.tick_normal_ms,
        tick_after_send_ms: config.delivery.tick_after_send_ms,
    };
    let mut delivery = DeliveryEngine::new(
        options,
        Box::new(settings),
        Box::new(MemoryCodeMap::new()),
        Box::new(MemoryQueue::new(NUM_SUPPORTED_SERVERS)),
        Box::new(device),
        Arc::clone(&state),
        [Box::new(UdpTransport::new()), Box::new(UdpTransport::new())],
    );

    // Gateway link
    let gateway_socket = UdpSocket::bind(("127.0.0.1", config.gateway.listen_port))
        .await
        .with_context(|| format!("Failed to bind gateway port {}", config.gateway.listen_port))?;
    let peer: SocketAddr = config.gateway.peer.parse()?;
    info!("Gateway link :{} <-> {}", config.gateway.listen_port, peer);

    let clock = Instant::now();

    delivery.start(elapsed_ms(clock));
    arbiter.start(elapsed_ms(clock), fuel_status_seconds);
    if let Some(bitrate) = start_bitrate {
        send_to_gateway(&gateway_socket, peer, &GatewayMessage::CanBitrate(bitrate)).await;
    }

    info!("Press Ctrl+C to exit");

    let mut buf = [0u8; GATEWAY_BUFFER_SIZE];

    // Main loop
    loop {
        let now = elapsed_ms(clock);
        let deadline = [arbiter.next_deadline(), delivery.next_deadline()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + IDLE_WAKE_MS)
            .max(now);
        let wake = clock + Duration::from_millis(deadline);

        tokio::select! {
            received = gateway_socket.recv_from(&mut buf) => match received {
                Ok((len, from)) if from == peer => {
                    let now = elapsed_ms(clock);
                    for record in handle_gateway_message(&mut arbiter, &buf[..len], now) {
                        delivery.record_event(record);
                    }
                }
                Ok((len, from)) => debug!("Ignoring {} bytes from {}", len, from),
                Err(e) => warn!("Gateway receive failed: {}", e),
            },

            Some(message) = outbound.recv() => {
                send_to_gateway(&gateway_socket, peer, &message).await;
                drain_outbound(&gateway_socket, peer, &mut outbound).await;
            }

            _ = sleep_until(wake) => {}

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }

        let now = elapsed_ms(clock);
        for record in arbiter.poll(now) {
            delivery.record_event(record);
        }
        delivery.poll(now);

        if let Some(request) = exit.requested() {
            info!("Exiting on device {:?} request", request);
            break;
        }
    }

    arbiter.stop();
    delivery.stop();
    info!("Shutdown complete");

    Ok(())
}

/// Set up console logging plus an optional daily rolling file
///
/// `RUST_LOG` directives are combined with the configured level. The returned
/// guard must be held for the file writer to keep flushing.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fleet-telematics.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Milliseconds since the agent started
fn elapsed_ms(clock: Instant) -> Millis {
    Millis::try_from(clock.elapsed().as_millis()).unwrap_or(Millis::MAX)
}

/// Hand one gateway datagram to the arbiter, returns the events it raised
fn handle_gateway_message(
    arbiter: &mut EngineArbiter,
    data: &[u8],
    now: Millis,
) -> Vec<fleet_telematics::event::EventRecord> {
    match GatewayMessage::decode(data) {
        Ok(GatewayMessage::Can(frame)) => arbiter.handle_can_frame(&frame, now),
        Ok(GatewayMessage::J1708(frame)) => arbiter.handle_j1708_frame(&frame, now),
        Ok(GatewayMessage::CanBitrate(bitrate)) => {
            info!("CAN interface ready at {} b/s", bitrate);
            arbiter.can_bus_ready(bitrate, now);
            Vec::new()
        }
        Err(e) => {
            warn!("Dropping gateway message: {}", e);
            Vec::new()
        }
    }
}

async fn send_to_gateway(socket: &UdpSocket, peer: SocketAddr, message: &GatewayMessage) {
    if let Err(e) = socket.send_to(&message.encode(), peer).await {
        debug!("Failed to send to gateway: {}", e);
    }
}

/// Send everything else the stacks queued in the same pass
async fn drain_outbound(
    socket: &UdpSocket,
    peer: SocketAddr,
    outbound: &mut UnboundedReceiver<GatewayMessage>,
) {
    while let Ok(message) = outbound.try_recv() {
        send_to_gateway(socket, peer, &message).await;
    }
}
