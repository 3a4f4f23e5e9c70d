//! Internal USB driver
//!
//! The goal is to keep this somewhat agnostic from the usb-device
//! bus behaviors, so that it could be used separately. The `bus` module
//! adapts it to the `usb-device` interface.

use crate::{buffer, endpoint::Endpoint, ral};
use usb_device::{
    bus::PollResult,
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Direct index to the OUT control endpoint
fn ctrl_ep0_out() -> EndpointAddress {
    // Constructor not currently const. Otherwise, this would
    // be a const.
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
fn ctrl_ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

bitflags::bitflags! {
    /// Bus events observed by the dispatcher
    ///
    /// Attach, detach, timeout, token, and wake-up acknowledgments are
    /// informational; reset, suspend, and resume feed the generic stack
    /// through the bus adapter's `poll()`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Events: u8 {
        const ATTACH = 1 << 0;
        const DETACH = 1 << 1;
        const RESET = 1 << 2;
        const SUSPEND = 1 << 3;
        const RESUME = 1 << 4;
        const TIMEOUT = 1 << 5;
        const TOKEN = 1 << 6;
        const WAKEUP = 1 << 7;
    }
}

/// EPSTS transaction codes
const TOKEN_IN_ACK: u32 = 0b000;
const TOKEN_OUT_DATA0: u32 = 0b010;
const TOKEN_SETUP: u32 = 0b011;
const TOKEN_OUT_DATA1: u32 = 0b110;

/// A SetAddress commits only during the status stage. The parsed value
/// parks here until the EP0 IN handshake completes; writing it earlier
/// would break the in-flight handshake, which still uses the old address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AddressState {
    Idle,
    Pending(u8),
}

const EP_INIT: [Option<Endpoint>; crate::EP_COUNT] = [None, None, None, None, None, None];

/// The USB device-controller driver
///
/// After you allocate a `Usbd` with [`new()`](Usbd::new), you must call
/// [`initialize()`](Usbd::initialize) once before anything else.
pub struct Usbd {
    usb: ral::usbd::Instance,
    endpoints: [Option<Endpoint>; crate::EP_COUNT],
    address: AddressState,
    /// Single-consumer latch; the dispatcher accumulates here, `poll()`
    /// drains.
    events: Events,
    ep_setup: u16,
    ep_in_complete: u16,
    /// Persisting ep_out across poll() calls keeps ep_read results in
    /// sync with what poll() signaled: the bit stays set until the class
    /// actually consumes the packet, and the un-rearmed endpoint NAKs
    /// the host until then.
    ep_out: u16,
}

impl Usbd {
    /// Create a new `Usbd`
    ///
    /// Creation does nothing except take ownership of the register block.
    /// After creating the driver, call [`initialize()`](Usbd::initialize).
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        // Safety: the Peripherals contract puts a valid register block
        // behind the pointer, and hands this driver sole ownership.
        let usb = unsafe { ral::usbd::Instance::new(peripherals.usbd()) };
        Usbd {
            usb,
            endpoints: EP_INIT,
            address: AddressState::Idle,
            events: Events::empty(),
            ep_setup: 0,
            ep_in_complete: 0,
            ep_out: 0,
        }
    }

    /// Initialize the controller and the analog front end
    ///
    /// Brings up the transceiver in byte-transfer mode, signals SE0 while
    /// the packet buffer layout is programmed, resets the device address,
    /// and arms the interrupt groups. Cannot fail by hardware design.
    pub fn initialize(&mut self) {
        ral::write_reg!(
            ral::usbd,
            self.usb,
            ATTR,
            ral::usbd::ATTR::BYTEM::mask
                | ral::usbd::ATTR::PWRDN::mask
                | ral::usbd::ATTR::DPPU_EN::mask
                | ral::usbd::ATTR::USB_EN::mask
                | (1 << 6)
                | ral::usbd::ATTR::PHY_EN::mask
        );

        ral::write_reg!(ral::usbd, self.usb, DRVSE0, DRVSE0: 1);
        ral::write_reg!(ral::usbd, self.usb, FADDR, FADDR: 0);

        ral::write_reg!(ral::usbd, self.usb, STBUFSEG, STBUFSEG: buffer::SETUP_OFFSET as u32);
        for slot in 0..crate::EP_COUNT {
            ral::write_reg!(
                ral::usbd::ep,
                &self.usb.EP[slot],
                BUFSEG,
                BUFSEG: buffer::ep_offset(slot) as u32
            );
        }

        ral::write_reg!(ral::usbd, self.usb, DRVSE0, DRVSE0: 0);

        // Anything latched before this point is stale
        ral::write_reg!(
            ral::usbd,
            self.usb,
            INTSTS,
            WAKEUP_STS: 1,
            FLDET_STS: 1,
            USB_STS: 1,
            BUS_STS: 1
        );
        ral::write_reg!(
            ral::usbd,
            self.usb,
            INTEN,
            WAKEUP_EN: 1,
            WAKEUP_IE: 1,
            FLDET_IE: 1,
            USB_IE: 1,
            BUS_IE: 1
        );
    }

    /// Present (`true`) or withdraw (`false`) the D+ pull-up
    pub fn connect(&mut self, connect: bool) {
        ral::modify_reg!(ral::usbd, self.usb, ATTR, DPPU_EN: connect as u32);
    }

    pub fn attach(&mut self) {
        self.connect(true);
    }

    /// Bus events pending in the latch
    pub fn events(&self) -> Events {
        self.events
    }

    /// Run the bus-event dispatcher on a fresh interrupt snapshot
    ///
    /// Reads the interrupt status and bus attributes once, handles each
    /// asserted group, and acknowledges exactly the bits it tested in one
    /// write — a latched bit left unacknowledged would re-fire the
    /// interrupt indefinitely. A snapshot with no recognized bit is a
    /// silent no-op. The caller re-arms the top-level interrupt line
    /// after this returns.
    pub fn dispatch(&mut self) {
        let intsts = ral::read_reg!(ral::usbd, self.usb, INTSTS);
        let attr = ral::read_reg!(ral::usbd, self.usb, ATTR);
        let mut acked = 0;

        if intsts & ral::usbd::INTSTS::FLDET_STS::mask != 0 {
            acked |= ral::usbd::INTSTS::FLDET_STS::mask;
            if ral::read_reg!(ral::usbd, self.usb, FLDET, FLDET == 1) {
                ral::modify_reg!(ral::usbd, self.usb, ATTR, USB_EN: 1, PHY_EN: 1);
                self.events |= Events::ATTACH;
            } else {
                ral::modify_reg!(ral::usbd, self.usb, ATTR, USB_EN: 0);
                self.events |= Events::DETACH;
            }
        }

        if intsts & ral::usbd::INTSTS::BUS_STS::mask != 0 {
            acked |= ral::usbd::INTSTS::BUS_STS::mask;
            // Bus conditions aren't mutually exclusive; test each one
            if attr & ral::usbd::ATTR::USBRST::mask != 0 {
                self.events |= Events::RESET;
            }
            if attr & ral::usbd::ATTR::SUSPEND::mask != 0 {
                self.events |= Events::SUSPEND;
            }
            if attr & ral::usbd::ATTR::RESUME::mask != 0 {
                self.events |= Events::RESUME;
            }
            if attr & ral::usbd::ATTR::TIMEOUT::mask != 0 {
                self.events |= Events::TIMEOUT;
            }
        }

        if intsts & ral::usbd::INTSTS::USB_STS::mask != 0 {
            acked |= ral::usbd::INTSTS::USB_STS::mask;
            self.events |= Events::TOKEN;
            let epsts = ral::read_reg!(ral::usbd, self.usb, EPSTS);
            if intsts & ral::usbd::INTSTS::SETUP::mask != 0 {
                acked |= ral::usbd::INTSTS::SETUP::mask;
                self.on_setup();
            }
            for slot in 0..crate::EP_COUNT {
                if intsts & ral::usbd::epevt(slot) != 0 {
                    acked |= ral::usbd::epevt(slot);
                    self.on_token(slot, ral::usbd::epsts_field(epsts, slot));
                }
            }
        }

        if intsts & ral::usbd::INTSTS::WAKEUP_STS::mask != 0 {
            acked |= ral::usbd::INTSTS::WAKEUP_STS::mask;
            self.events |= Events::WAKEUP;
        }

        if acked != 0 {
            ral::write_reg!(ral::usbd, self.usb, INTSTS, acked);
        }
    }

    /// A new SETUP packet landed in the setup region
    fn on_setup(&mut self) {
        self.ep_setup |= 1;
        // Stale arms from the previous control transfer can't survive a
        // new SETUP
        let usb = &self.usb;
        for ep in self.endpoints.iter_mut().flatten() {
            if ep.address().index() == 0 {
                ep.clear_buffer(usb);
            }
        }
    }

    /// Classify one slot's completed transaction from the EPSTS snapshot
    fn on_token(&mut self, slot: usize, status: u32) {
        // A token event for a slot nothing claimed is acknowledged and
        // dropped, never escalated
        let Some(ep) = self.endpoints[slot].as_mut() else {
            return;
        };
        let index = ep.address().index() as u16;
        match status {
            TOKEN_IN_ACK => {
                ep.clear_busy();
                self.ep_in_complete |= 1 << index;
                if index == 0 {
                    if let AddressState::Pending(address) = self.address {
                        // The status handshake is done; the old address
                        // is no longer in use
                        ral::write_reg!(ral::usbd, self.usb, FADDR, FADDR: address as u32);
                        self.address = AddressState::Idle;
                        debug!("ADDRESS {}", address);
                    }
                }
            }
            TOKEN_OUT_DATA0 | TOKEN_OUT_DATA1 => {
                ep.clear_busy();
                self.ep_out |= 1 << index;
            }
            TOKEN_SETUP => {
                // Covered by the INTSTS setup bit
            }
            _ => {}
        }
    }

    /// Drain the event latch for the generic stack
    pub fn poll(&mut self) -> PollResult {
        if self.events.contains(Events::RESET) {
            self.events.remove(Events::RESET);
            return PollResult::Reset;
        }

        if self.ep_setup != 0 || self.ep_in_complete != 0 || self.ep_out != 0 {
            return PollResult::Data {
                ep_out: self.ep_out,
                ep_in_complete: core::mem::take(&mut self.ep_in_complete),
                ep_setup: self.ep_setup,
            };
        }

        if self.events.contains(Events::SUSPEND) {
            self.events.remove(Events::SUSPEND);
            return PollResult::Suspend;
        }

        if self.events.intersects(Events::RESUME | Events::WAKEUP) {
            self.events.remove(Events::RESUME | Events::WAKEUP);
            return PollResult::Resume;
        }

        // Everything left is informational
        self.events = Events::empty();
        PollResult::None
    }

    /// The stack parsed a SetAddress; hold the value until the status
    /// stage. An address change outside that window never reaches the
    /// register.
    pub fn set_pending_address(&mut self, address: u8) {
        self.address = AddressState::Pending(address);
    }

    pub fn bus_reset(&mut self) {
        ral::write_reg!(ral::usbd, self.usb, FADDR, FADDR: 0);
        self.address = AddressState::Idle;
        self.ep_setup = 0;
        self.ep_in_complete = 0;
        self.ep_out = 0;

        let usb = &self.usb;
        for ep in self.endpoints.iter_mut().flatten() {
            ep.clear_buffer(usb);
            ep.set_stalled(usb, false);
            if ep.address().index() != 0 {
                // Back to the default state; the next configuration
                // re-enables these
                ep.disable(usb);
            }
        }
    }

    /// Check if the endpoint is valid
    pub fn is_allocated(&self, addr: EndpointAddress) -> bool {
        self.index_of(addr).is_some()
    }

    fn index_of(&self, addr: EndpointAddress) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|ep| ep.as_ref().map(Endpoint::address) == Some(addr))
    }

    /// Bind `addr` to the next free hardware slot
    pub fn allocate_ep(
        &mut self,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), UsbError> {
        if matches!(kind, EndpointType::Isochronous { .. }) {
            return Err(UsbError::Unsupported);
        }
        if max_packet_size as usize > buffer::MAX_PACKET_LEN {
            return Err(UsbError::EndpointMemoryOverflow);
        }
        let slot = self
            .endpoints
            .iter()
            .position(Option::is_none)
            .ok_or(UsbError::EndpointOverflow)?;

        let ep = Endpoint::new(addr, slot, kind);
        ep.initialize(&self.usb);
        self.endpoints[slot] = Some(ep);
        debug!("ALLOC EP{} slot {}", addr.index(), slot);
        Ok(())
    }

    /// Enable all non-zero endpoints, and arm OUT transactions
    ///
    /// This should only be called when the device is configured
    pub fn enable_endpoints(&mut self) {
        let usb = &self.usb;
        for ep in self.endpoints.iter_mut().flatten() {
            if ep.address().index() != 0 {
                ep.enable(usb);
                if ep.address().direction() == UsbDirection::Out {
                    ep.arm(usb);
                }
            }
        }
    }

    /// Read either a setup, or a data buffer, from EP0 OUT
    pub fn ctrl0_read(&mut self, buf: &mut [u8]) -> Result<usize, UsbError> {
        if self.ep_setup & 1 != 0 && buf.len() >= buffer::SETUP_LEN {
            self.ep_setup &= !1;
            let setup = self.read_setup();
            buf[..buffer::SETUP_LEN].copy_from_slice(&setup);

            // Control data starts on DATA1. Arm an OUT transaction for
            // the data or status stage that follows.
            let usb = &self.usb;
            for ep in self.endpoints.iter_mut().flatten() {
                if ep.address() == ctrl_ep0_in() {
                    ep.set_toggle(usb, true);
                } else if ep.address() == ctrl_ep0_out() {
                    ep.set_toggle(usb, true);
                    ep.arm(usb);
                }
            }

            Ok(buffer::SETUP_LEN)
        } else {
            let index = self.index_of(ctrl_ep0_out()).ok_or(UsbError::InvalidEndpoint)?;
            if self.ep_out & 1 == 0 {
                return Err(UsbError::WouldBlock);
            }
            self.ep_out &= !1;

            let ep = self.endpoints[index].as_mut().unwrap();
            let read = ep.read(&self.usb, buf);
            ep.arm(&self.usb);

            Ok(read)
        }
    }

    /// Write to the host from EP0 IN
    pub fn ctrl0_write(&mut self, buf: &[u8]) -> Result<usize, UsbError> {
        let index = self.index_of(ctrl_ep0_in()).ok_or(UsbError::InvalidEndpoint)?;
        let ep = self.endpoints[index].as_mut().unwrap();
        if ep.is_busy() {
            return Err(UsbError::WouldBlock);
        }
        Ok(ep.write(&self.usb, buf))
    }

    /// Read data from an endpoint, and re-arm it for the next packet
    pub fn ep_read(&mut self, buf: &mut [u8], addr: EndpointAddress) -> Result<usize, UsbError> {
        let index = self.index_of(addr).ok_or(UsbError::InvalidEndpoint)?;
        let mask = 1u16 << addr.index();
        if self.ep_out & mask == 0 {
            return Err(UsbError::WouldBlock);
        }
        self.ep_out &= !mask;

        let ep = self.endpoints[index].as_mut().unwrap();
        let read = ep.read(&self.usb, buf);
        ep.arm(&self.usb);

        Ok(read)
    }

    /// Write data to an endpoint
    pub fn ep_write(&mut self, buf: &[u8], addr: EndpointAddress) -> Result<usize, UsbError> {
        let index = self.index_of(addr).ok_or(UsbError::InvalidEndpoint)?;
        let ep = self.endpoints[index].as_mut().unwrap();
        if ep.is_busy() {
            return Err(UsbError::WouldBlock);
        }
        Ok(ep.write(&self.usb, buf))
    }

    /// Stall or unstall an endpoint
    ///
    /// # Panics
    ///
    /// Panics if the endpoint isn't allocated
    pub fn ep_stall(&mut self, stall: bool, addr: EndpointAddress) {
        let index = self.index_of(addr).unwrap();
        let ep = self.endpoints[index].as_mut().unwrap();
        ep.set_stalled(&self.usb, stall);

        // Re-arm any OUT endpoint we're unstalling
        if !stall && addr.direction() == UsbDirection::Out && !ep.is_busy() && addr.index() != 0 {
            ep.arm(&self.usb);
        }
    }

    /// Checks if an endpoint is stalled
    ///
    /// # Panics
    ///
    /// Panics if the endpoint isn't allocated
    pub fn is_ep_stalled(&self, addr: EndpointAddress) -> bool {
        let index = self.index_of(addr).unwrap();
        self.endpoints[index].as_ref().unwrap().is_stalled(&self.usb)
    }

    /// The controller doesn't track frame numbers
    ///
    /// This is the defined not-supported result, rather than a fabricated
    /// value.
    pub fn frame_number(&self) -> Result<u16, UsbError> {
        Err(UsbError::Unsupported)
    }

    /// The controller doesn't latch per-transfer error codes
    ///
    /// This is the defined not-supported result, rather than a fabricated
    /// value.
    pub fn last_error(&self) -> Result<u8, UsbError> {
        Err(UsbError::Unsupported)
    }

    fn read_setup(&self) -> [u8; buffer::SETUP_LEN] {
        let mut setup = [0; buffer::SETUP_LEN];
        let base = self.usb.buffer().wrapping_add(buffer::SETUP_OFFSET);
        setup.iter_mut().fold(base, |src, dst| unsafe {
            *dst = src.read_volatile();
            src.add(1)
        });
        setup
    }
}

#[cfg(test)]
mod test {
    use super::{AddressState, Events, Usbd};
    use crate::ral::mock::{Mock, MockPeripherals};
    use crate::ral::usbd::{epevt, ATTR, INTSTS};
    use usb_device::{
        bus::PollResult,
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection, UsbError,
    };

    fn ep0_out() -> EndpointAddress {
        EndpointAddress::from_parts(0, UsbDirection::Out)
    }

    fn ep0_in() -> EndpointAddress {
        EndpointAddress::from_parts(0, UsbDirection::In)
    }

    fn driver(mock: &Mock) -> Usbd {
        let mut usbd = Usbd::new(MockPeripherals(mock.ptr()));
        usbd.initialize();
        usbd
    }

    fn driver_with_ctrl(mock: &Mock) -> Usbd {
        let mut usbd = driver(mock);
        usbd.allocate_ep(ep0_out(), EndpointType::Control, 64).unwrap();
        usbd.allocate_ep(ep0_in(), EndpointType::Control, 64).unwrap();
        usbd
    }

    #[test]
    fn initialize_programs_the_static_layout() {
        let mock = Mock::new();
        driver(&mock);

        assert_eq!(mock.regs.STBUFSEG.read(), 0);
        for (slot, ep) in mock.regs.EP.iter().enumerate() {
            assert_eq!(ep.BUFSEG.read() as usize, 8 + slot * 64);
        }
        assert_eq!(mock.regs.FADDR.read(), 0);
        // SE0 released once the layout is in place
        assert_eq!(mock.regs.DRVSE0.read(), 0);
    }

    #[test]
    fn dispatch_acknowledges_exactly_the_tested_bits() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        let snapshot = INTSTS::BUS_STS::mask
            | INTSTS::USB_STS::mask
            | INTSTS::FLDET_STS::mask
            | INTSTS::WAKEUP_STS::mask
            | INTSTS::SETUP::mask
            | epevt(2);
        mock.regs.INTSTS.write(snapshot);
        mock.regs.FLDET.write(1);
        mock.regs.ATTR.write(ATTR::USBRST::mask | ATTR::SUSPEND::mask);

        usbd.dispatch();

        // The acknowledgment wrote back the snapshot's tested bits, and
        // only those
        assert_eq!(mock.regs.INTSTS.read(), snapshot);
        assert!(usbd.events().contains(Events::ATTACH));
        assert!(usbd.events().contains(Events::RESET));
        assert!(usbd.events().contains(Events::SUSPEND));
        assert!(usbd.events().contains(Events::TOKEN));
        assert!(usbd.events().contains(Events::WAKEUP));
        assert!(!usbd.events().contains(Events::RESUME));
    }

    #[test]
    fn dispatch_on_a_clear_snapshot_is_a_no_op() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        // Hardware state after every latched bit was acknowledged
        mock.regs.INTSTS.write(0);
        usbd.dispatch();

        assert_eq!(mock.regs.INTSTS.read(), 0);
        assert_eq!(usbd.events(), Events::empty());
        assert!(matches!(usbd.poll(), PollResult::None));
    }

    #[test]
    fn line_detach_disables_the_controller() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        mock.regs.INTSTS.write(INTSTS::FLDET_STS::mask);
        mock.regs.FLDET.write(0);
        usbd.dispatch();

        assert!(usbd.events().contains(Events::DETACH));
        assert_eq!(mock.regs.ATTR.read() & ATTR::USB_EN::mask, 0);
        // The analog front end follows the next attach
        mock.regs.INTSTS.write(INTSTS::FLDET_STS::mask);
        mock.regs.FLDET.write(1);
        usbd.dispatch();
        assert_ne!(mock.regs.ATTR.read() & ATTR::USB_EN::mask, 0);
        assert_ne!(mock.regs.ATTR.read() & ATTR::PHY_EN::mask, 0);
    }

    #[test]
    fn reset_takes_priority_in_poll() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        mock.regs.INTSTS.write(INTSTS::BUS_STS::mask);
        mock.regs.ATTR.write(ATTR::USBRST::mask);
        usbd.dispatch();

        assert!(matches!(usbd.poll(), PollResult::Reset));
        assert!(matches!(usbd.poll(), PollResult::None));
    }

    #[test]
    fn suspend_and_resume_surface_to_the_stack() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        mock.regs.INTSTS.write(INTSTS::BUS_STS::mask);
        mock.regs.ATTR.write(ATTR::SUSPEND::mask);
        usbd.dispatch();
        assert!(matches!(usbd.poll(), PollResult::Suspend));

        mock.regs.INTSTS.write(INTSTS::BUS_STS::mask);
        mock.regs.ATTR.write(ATTR::RESUME::mask);
        usbd.dispatch();
        assert!(matches!(usbd.poll(), PollResult::Resume));
    }

    #[test]
    fn set_address_commits_only_at_the_status_stage() {
        let mock = Mock::new();
        let mut usbd = driver_with_ctrl(&mock);

        usbd.set_pending_address(5);
        // Still addressing the device at 0 during setup
        assert_eq!(mock.regs.FADDR.read(), 0);

        // Status-stage handshake: IN ACK on the EP0 IN slot (slot 1)
        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | epevt(1));
        mock.regs.EPSTS.write(0); // IN ACK code at the slot's field
        usbd.dispatch();

        assert_eq!(mock.regs.FADDR.read(), 5);
        assert_eq!(usbd.address, AddressState::Idle);

        // A later IN completion commits nothing
        mock.regs.FADDR.write(9);
        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | epevt(1));
        usbd.dispatch();
        assert_eq!(mock.regs.FADDR.read(), 9);
    }

    #[test]
    fn bus_reset_clears_a_pending_address() {
        let mock = Mock::new();
        let mut usbd = driver_with_ctrl(&mock);

        usbd.set_pending_address(33);
        usbd.bus_reset();
        assert_eq!(mock.regs.FADDR.read(), 0);

        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | epevt(1));
        mock.regs.EPSTS.write(0);
        usbd.dispatch();
        assert_eq!(mock.regs.FADDR.read(), 0);
    }

    #[test]
    fn setup_flows_from_dispatch_to_ctrl0_read() {
        let mut mock = Mock::new();
        mock.sram[..8].copy_from_slice(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);
        let mut usbd = driver_with_ctrl(&mock);

        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | INTSTS::SETUP::mask);
        usbd.dispatch();

        match usbd.poll() {
            PollResult::Data { ep_setup, .. } => assert_eq!(ep_setup, 1),
            _ => panic!("expected data"),
        }

        let mut setup = [0; 8];
        assert_eq!(usbd.ctrl0_read(&mut setup).unwrap(), 8);
        assert_eq!(setup, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);

        // The setup was consumed; the data stage hasn't happened yet
        assert!(matches!(
            usbd.ctrl0_read(&mut setup),
            Err(UsbError::WouldBlock)
        ));
        // An OUT transaction was armed for the stage that follows
        assert_eq!(mock.regs.EP[0].MXPLD.read(), 64);
    }

    #[test]
    fn ep_read_blocks_until_its_token_event() {
        let mut mock = Mock::new();
        let addr = EndpointAddress::from_parts(2, UsbDirection::Out);
        // Slot 2 receives [1, 2, 3]
        let offset = crate::buffer::ep_offset(2);
        mock.sram[offset..offset + 3].copy_from_slice(&[1, 2, 3]);

        let mut usbd = driver_with_ctrl(&mock);
        usbd.allocate_ep(addr, EndpointType::Bulk, 64).unwrap();

        let mut buf = [0; 64];
        assert!(matches!(
            usbd.ep_read(&mut buf, addr),
            Err(UsbError::WouldBlock)
        ));

        mock.regs.EP[2].MXPLD.write(3);
        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | epevt(2));
        mock.regs.EPSTS.write(0b010 << 14); // OUT DATA0 at slot 2
        usbd.dispatch();

        match usbd.poll() {
            PollResult::Data { ep_out, .. } => assert_eq!(ep_out, 1 << 2),
            _ => panic!("expected data"),
        }

        assert_eq!(usbd.ep_read(&mut buf, addr).unwrap(), 3);
        assert_eq!(buf[..3], [1, 2, 3]);
        // Consumed; the next read blocks again
        assert!(matches!(
            usbd.ep_read(&mut buf, addr),
            Err(UsbError::WouldBlock)
        ));
    }

    #[test]
    fn ep_write_blocks_while_a_transaction_is_armed() {
        let mock = Mock::new();
        let addr = EndpointAddress::from_parts(2, UsbDirection::In);
        let mut usbd = driver_with_ctrl(&mock);
        usbd.allocate_ep(addr, EndpointType::Interrupt, 64).unwrap();

        assert_eq!(usbd.ep_write(&[0xAB; 10], addr).unwrap(), 10);
        assert!(matches!(
            usbd.ep_write(&[0; 1], addr),
            Err(UsbError::WouldBlock)
        ));

        // IN ACK on slot 2 releases the endpoint
        mock.regs.INTSTS.write(INTSTS::USB_STS::mask | epevt(2));
        mock.regs.EPSTS.write(0); // IN ACK
        usbd.dispatch();

        assert_eq!(usbd.ep_write(&[0; 1], addr).unwrap(), 1);
    }

    #[test]
    fn slots_are_exhausted_after_six_allocations() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);

        for index in 0..3 {
            usbd.allocate_ep(
                EndpointAddress::from_parts(index, UsbDirection::Out),
                EndpointType::Bulk,
                64,
            )
            .unwrap();
            usbd.allocate_ep(
                EndpointAddress::from_parts(index, UsbDirection::In),
                EndpointType::Bulk,
                64,
            )
            .unwrap();
        }

        assert!(matches!(
            usbd.allocate_ep(
                EndpointAddress::from_parts(4, UsbDirection::In),
                EndpointType::Bulk,
                64
            ),
            Err(UsbError::EndpointOverflow)
        ));
    }

    #[test]
    fn oversized_packets_are_rejected() {
        let mock = Mock::new();
        let mut usbd = driver(&mock);
        assert!(matches!(
            usbd.allocate_ep(ep0_out(), EndpointType::Control, 128),
            Err(UsbError::EndpointMemoryOverflow)
        ));
    }

    #[test]
    fn unsupported_sentinels() {
        let mock = Mock::new();
        let usbd = driver(&mock);
        assert!(matches!(usbd.frame_number(), Err(UsbError::Unsupported)));
        assert!(matches!(usbd.last_error(), Err(UsbError::Unsupported)));
    }
}
