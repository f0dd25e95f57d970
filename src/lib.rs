//! # Fleet Telematics Library
//!
//! Vehicle telematics agent core: reads engine data from J1939 (CAN) and
//! J1587 (J1708) buses, tracks diagnostic trouble codes, and delivers events
//! to one or two servers over a compact binary UDP protocol with
//! acknowledgement, backoff and a communication watchdog.
//!
//! Every state machine is driven by an injected monotonic millisecond clock
//! through [`scheduler::Scheduler`], so the binary owns the only event loop.

pub mod bus;
pub mod codec;
pub mod codemap;
pub mod config;
pub mod delivery;
pub mod dtc;
pub mod engine;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod settings;
pub mod state;
