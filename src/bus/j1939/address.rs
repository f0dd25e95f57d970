//! J1939 address claiming primitives: node name, name priority and the
//! table of addresses seen on the bus.

use std::cmp::Ordering;

use rand::Rng;

use crate::scheduler::Millis;

/// Lowest address claimable by arbitrary address claiming
pub const ADDRESS_RANGE_LOW: u8 = 128;
/// Highest address claimable by arbitrary address claiming
pub const ADDRESS_RANGE_HIGH: u8 = 247;

/// Time to collect claims after requesting every address
pub const ADDRESS_COLLECT_WINDOW_MS: Millis = 1250;
/// Time to wait for objections after broadcasting a claim
pub const ADDRESS_CLAIM_WAIT_MS: Millis = 250;
/// Upper bound (exclusive) of the "cannot claim" response delay
pub const ADDRESS_MAX_CANNOT_CLAIM_DELAY_MS: Millis = 153;

const NAME_ARBITRARY_ADDRESS_CAPABLE: u64 = 1 << 63;
/// Function: trip recorder
const NAME_FUNCTION: u64 = 20;
const NAME_MANUFACTURER_CODE: u64 = 718;
const NAME_IDENTITY_MASK: u64 = 0xFFFFF;

/// 64-bit node name; the identity number takes the low 20 bits of `device_id`
pub fn build_name(device_id: u32) -> u64 {
    NAME_ARBITRARY_ADDRESS_CAPABLE
        | ((NAME_FUNCTION & 0xFF) << 40)
        | ((NAME_MANUFACTURER_CODE & 0x7FF) << 21)
        | (u64::from(device_id) & NAME_IDENTITY_MASK)
}

/// Compare two names, `Less` means `a` has the higher priority
///
/// Lower values win: all bits but the lowest are compared first, then the lowest.
pub fn compare_name_priority(a: u64, b: u64) -> Ordering {
    (a >> 1).cmp(&(b >> 1)).then((a & 1).cmp(&(b & 1)))
}

/// Random delay before answering an address request without an address
pub fn cannot_claim_delay() -> Millis {
    rand::thread_rng().gen_range(0..ADDRESS_MAX_CANNOT_CLAIM_DELAY_MS)
}

/// Addresses in the claimable range not yet seen in use
#[derive(Debug, Clone)]
pub struct AddressTable {
    available: [bool; ADDRESS_RANGE_HIGH as usize + 1],
}

impl Default for AddressTable {
    fn default() -> Self {
        let mut table = Self {
            available: [false; ADDRESS_RANGE_HIGH as usize + 1],
        };
        table.reset();
        table
    }
}

impl AddressTable {
    /// Mark the whole claimable range available
    pub fn reset(&mut self) {
        for (address, slot) in self.available.iter_mut().enumerate() {
            *slot = address >= ADDRESS_RANGE_LOW as usize;
        }
    }

    pub fn mark_in_use(&mut self, address: u8) {
        if let Some(slot) = self.available.get_mut(address as usize) {
            *slot = false;
        }
    }

    pub fn is_available(&self, address: u8) -> bool {
        self.available.get(address as usize).copied().unwrap_or(false)
    }

    /// Lowest available address
    pub fn select(&self) -> Option<u8> {
        (ADDRESS_RANGE_LOW..=ADDRESS_RANGE_HIGH).find(|&a| self.available[a as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::j1939::packet::ADDRESS_NULL;

    #[test]
    fn test_name_fields() {
        let name = build_name(123_456);
        assert_eq!(name >> 63, 1, "Arbitrary address capable");
        assert_eq!((name >> 40) & 0xFF, 20);
        assert_eq!((name >> 21) & 0x7FF, 718);
        assert_eq!(name & 0x1FFFFF, 123_456);

        assert_eq!(build_name(0x3F_FFFF) & 0x1FFFFF, 0xFFFFF, "Identity limited to 20 bits");
    }

    #[test]
    fn test_lower_name_wins() {
        assert_eq!(compare_name_priority(10, 20), Ordering::Less);
        assert_eq!(compare_name_priority(20, 10), Ordering::Greater);
        assert_eq!(compare_name_priority(10, 10), Ordering::Equal);
        assert_eq!(compare_name_priority(10, 11), Ordering::Less, "Low bit decides ties");
        assert_eq!(
            compare_name_priority(0x7FFF_FFFF_FFFF_FFFF, 0x8000_0000_0000_0000),
            Ordering::Less,
            "Compared unsigned"
        );
    }

    #[test]
    fn test_table_selects_lowest_free() {
        let mut table = AddressTable::default();
        assert_eq!(table.select(), Some(ADDRESS_RANGE_LOW));

        table.mark_in_use(128);
        table.mark_in_use(129);
        table.mark_in_use(0x20);
        table.mark_in_use(ADDRESS_NULL);
        assert_eq!(table.select(), Some(130));
        assert!(!table.is_available(0x20), "Outside the claimable range");

        for address in ADDRESS_RANGE_LOW..=ADDRESS_RANGE_HIGH {
            table.mark_in_use(address);
        }
        assert_eq!(table.select(), None);

        table.reset();
        assert_eq!(table.select(), Some(ADDRESS_RANGE_LOW));
    }

    #[test]
    fn test_cannot_claim_delay_range() {
        for _ in 0..100 {
            assert!(cannot_claim_delay() < ADDRESS_MAX_CANNOT_CLAIM_DELAY_MS);
        }
    }
}
