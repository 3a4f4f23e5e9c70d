//! Static layout of the endpoint packet buffer
//!
//! The controller shares one 512-byte SRAM window across the setup packet
//! and all six endpoint slots. The layout is fixed at compile time: the
//! 8-byte setup region sits at offset zero, and each slot owns the next
//! 64 bytes in slot order. Adding a slot means recomputing every
//! downstream offset, so the ladder lives here and nowhere else.

/// Total length of the packet buffer window
pub const LEN: usize = 512;

/// Offset of the setup packet region
pub const SETUP_OFFSET: usize = 0;

/// Length of the setup packet region (always 8 bytes)
pub const SETUP_LEN: usize = 8;

/// Maximum packet size for control, interrupt, and bulk endpoints
pub const MAX_PACKET_LEN: usize = 64;

/// Packet buffer offset of an endpoint slot's region
pub const fn ep_offset(slot: usize) -> usize {
    SETUP_OFFSET + SETUP_LEN + slot * MAX_PACKET_LEN
}

const _: [(); 1] = [(); (ep_offset(crate::EP_COUNT) <= LEN) as usize];

#[cfg(test)]
mod test {
    use super::{ep_offset, LEN, MAX_PACKET_LEN, SETUP_LEN, SETUP_OFFSET};
    use crate::EP_COUNT;

    #[test]
    fn regions_are_increasing_and_disjoint() {
        let mut regions = [(SETUP_OFFSET, SETUP_LEN); EP_COUNT + 1];
        for (slot, region) in regions.iter_mut().skip(1).enumerate() {
            *region = (ep_offset(slot), MAX_PACKET_LEN);
        }

        for pair in regions.windows(2) {
            let (offset, len) = pair[0];
            let (next, _) = pair[1];
            assert!(offset < next);
            assert_eq!(offset + len, next);
        }
    }

    #[test]
    fn last_region_fits_the_window() {
        let (offset, len) = (ep_offset(EP_COUNT - 1), MAX_PACKET_LEN);
        assert_eq!(offset + len, 392);
        assert!(offset + len <= LEN);
    }
}
