//! Endpoint transport over the hardware slots
//!
//! Each endpoint owns one of the six slot register groups and the 64-byte
//! packet buffer region the static layout assigns to that slot. Transfers
//! are synchronous byte copies between the region and caller memory; the
//! caller sequences them against token events (the driver's completion
//! masks enforce this at the bus boundary).

use crate::{buffer, ral};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// CFG.STATE values
const STATE_DISABLED: u32 = 0b00;
const STATE_OUT: u32 = 0b01;
const STATE_IN: u32 = 0b10;

/// A USB endpoint bound to a hardware slot
pub struct Endpoint {
    address: EndpointAddress,
    slot: usize,
    kind: EndpointType,
    /// An armed transaction that hasn't completed yet. Set when MXPLD is
    /// written, cleared by the dispatcher on the matching token event.
    busy: bool,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, slot: usize, kind: EndpointType) -> Self {
        Endpoint {
            address,
            slot,
            kind,
            busy: false,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// Returns the maximum packet length supported by this endpoint
    pub fn max_packet_len(&self) -> usize {
        buffer::MAX_PACKET_LEN
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn clear_busy(&mut self) {
        self.busy = false;
    }

    /// Program the slot's configuration register
    ///
    /// Control endpoints are live immediately; everything else stays
    /// disabled until [`enable()`](Endpoint::enable).
    pub fn initialize(&self, usb: &ral::usbd::Instance) {
        let state = if self.kind == EndpointType::Control {
            self.direction_state()
        } else {
            STATE_DISABLED
        };
        ral::write_reg!(
            ral::usbd::ep,
            &usb.EP[self.slot],
            CFG,
            EP_NUM: self.address.index() as u32,
            STATE: state,
            DSQ_SYNC: 0
        );
        ral::write_reg!(ral::usbd::ep, &usb.EP[self.slot], CFGP, CLRRDY: 0, SSTALL: 0);
    }

    fn direction_state(&self) -> u32 {
        match self.address.direction() {
            UsbDirection::In => STATE_IN,
            UsbDirection::Out => STATE_OUT,
        }
    }

    pub fn enable(&self, usb: &ral::usbd::Instance) {
        ral::modify_reg!(ral::usbd::ep, &usb.EP[self.slot], CFG, STATE: self.direction_state(), DSQ_SYNC: 0);
    }

    pub fn disable(&self, usb: &ral::usbd::Instance) {
        ral::modify_reg!(ral::usbd::ep, &usb.EP[self.slot], CFG, STATE: STATE_DISABLED);
    }

    /// Pointer to this slot's region of the packet buffer
    fn region(&self, usb: &ral::usbd::Instance) -> *mut u8 {
        usb.buffer().wrapping_add(buffer::ep_offset(self.slot))
    }

    /// Read the last received packet from the slot's buffer region
    ///
    /// Returns the number of bytes read into `buf`, constrained by the max
    /// packet length and the received length the hardware reports.
    pub fn read(&mut self, usb: &ral::usbd::Instance, buf: &mut [u8]) -> usize {
        let received = ral::read_reg!(ral::usbd::ep, &usb.EP[self.slot], MXPLD, MXPLD) as usize;
        let size = buffer::MAX_PACKET_LEN.min(buf.len()).min(received);
        buf.iter_mut()
            .take(size)
            .fold(self.region(usb), |src, dst| unsafe {
                *dst = src.read_volatile();
                src.add(1)
            });
        size
    }

    /// Write `buf` into the slot's buffer region and arm the transaction
    ///
    /// Returns the number of bytes written, constrained by the max packet
    /// length. The hardware transmits them at the next IN token.
    pub fn write(&mut self, usb: &ral::usbd::Instance, buf: &[u8]) -> usize {
        let size = buffer::MAX_PACKET_LEN.min(buf.len());
        buf.iter()
            .take(size)
            .fold(self.region(usb), |dst, src| unsafe {
                dst.write_volatile(*src);
                dst.add(1)
            });
        ral::write_reg!(ral::usbd::ep, &usb.EP[self.slot], MXPLD, MXPLD: size as u32);
        self.busy = true;
        size
    }

    /// Arm an OUT transaction for a full packet
    pub fn arm(&mut self, usb: &ral::usbd::Instance) {
        ral::write_reg!(
            ral::usbd::ep,
            &usb.EP[self.slot],
            MXPLD,
            MXPLD: self.max_packet_len() as u32
        );
        self.busy = true;
    }

    /// Drop an armed transaction without running it
    pub fn clear_buffer(&mut self, usb: &ral::usbd::Instance) {
        ral::write_reg!(ral::usbd::ep, &usb.EP[self.slot], CFGP, CLRRDY: 1);
        self.busy = false;
    }

    /// Force the next transaction's data toggle
    pub fn set_toggle(&self, usb: &ral::usbd::Instance, data1: bool) {
        ral::modify_reg!(ral::usbd::ep, &usb.EP[self.slot], CFG, DSQ_SYNC: data1 as u32);
    }

    pub fn set_stalled(&self, usb: &ral::usbd::Instance, stall: bool) {
        ral::modify_reg!(ral::usbd::ep, &usb.EP[self.slot], CFGP, SSTALL: stall as u32);
        if !stall {
            // Unstalling restarts the data sequence
            self.set_toggle(usb, false);
        }
    }

    pub fn is_stalled(&self, usb: &ral::usbd::Instance) -> bool {
        ral::read_reg!(ral::usbd::ep, &usb.EP[self.slot], CFGP, SSTALL == 1)
    }
}

#[cfg(test)]
mod test {
    use super::Endpoint;
    use crate::buffer;
    use crate::ral::mock::Mock;
    use usb_device::{endpoint::EndpointAddress, endpoint::EndpointType, UsbDirection};

    #[test]
    fn write_copies_into_the_slot_region() {
        let mock = Mock::new();
        let usb = mock.instance();
        let mut ep = Endpoint::new(
            EndpointAddress::from_parts(2, UsbDirection::In),
            3,
            EndpointType::Interrupt,
        );

        let written = ep.write(&usb, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(written, 3);
        assert!(ep.is_busy());

        let offset = buffer::ep_offset(3);
        assert_eq!(mock.sram[offset..offset + 3], [0xAA, 0xBB, 0xCC]);
        assert_eq!(mock.regs.EP[3].MXPLD.read(), 3);
    }

    #[test]
    fn write_is_bounded_by_the_max_packet_len() {
        let mock = Mock::new();
        let usb = mock.instance();
        let mut ep = Endpoint::new(
            EndpointAddress::from_parts(2, UsbDirection::In),
            2,
            EndpointType::Bulk,
        );

        let written = ep.write(&usb, &[0x55; 100]);
        assert_eq!(written, buffer::MAX_PACKET_LEN);
        assert_eq!(mock.regs.EP[2].MXPLD.read(), 64);
    }

    #[test]
    fn read_returns_the_received_length() {
        let mut mock = Mock::new();
        let offset = buffer::ep_offset(1);
        mock.sram[offset..offset + 4].copy_from_slice(&[1, 2, 3, 4]);
        mock.regs.EP[1].MXPLD.write(4);

        let usb = mock.instance();
        let mut ep = Endpoint::new(
            EndpointAddress::from_parts(1, UsbDirection::Out),
            1,
            EndpointType::Bulk,
        );

        let mut buf = [0; 64];
        assert_eq!(ep.read(&usb, &mut buf), 4);
        assert_eq!(buf[..4], [1, 2, 3, 4]);
    }

    #[test]
    fn stall_and_clear_stall() {
        let mock = Mock::new();
        let usb = mock.instance();
        let ep = Endpoint::new(
            EndpointAddress::from_parts(1, UsbDirection::Out),
            4,
            EndpointType::Bulk,
        );

        ep.set_stalled(&usb, true);
        assert!(ep.is_stalled(&usb));
        ep.set_stalled(&usb, false);
        assert!(!ep.is_stalled(&usb));
    }
}
