//! USB bus implementation

use crate::driver::Usbd;
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::{
    bus::{PollResult, UsbBus},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// A `UsbBus` implementation
///
/// The `BusAdapter` owns the controller driver, and exposes a `UsbBus`
/// implementation on top of it.
///
/// # Requirements
///
/// When you build your final `usb-device`, you must set the endpoint 0 max
/// packet size to 64 bytes. See `UsbDeviceBuilder::max_packet_size_0` for
/// more information. Failure to increase the control endpoint max packet
/// size will result in a USB device that cannot communicate with the host.
///
/// Additionally, before polling for class traffic, you must call
/// [`configure()`](BusAdapter::configure) *after* your device has been
/// configured. Poll the USB device and check its state until it's been
/// configured, then call `configure()` once. The transport task in
/// [`task`](crate::task) handles this for you.
///
/// # Interrupts
///
/// The adapter works in polled and interrupt-driven designs. For the
/// latter, have the USB interrupt handler mask its own line, run
/// [`on_interrupt()`](BusAdapter::on_interrupt), signal your transport
/// task, and re-arm the line once the task has polled. Events observed in
/// the handler latch inside the driver until `poll()` drains them, so
/// nothing is lost between contexts.
pub struct BusAdapter {
    usb: Mutex<RefCell<Usbd>>,
}

impl BusAdapter {
    /// Create a USB bus adapter
    ///
    /// The peripherals token proves ownership of the USBD register block.
    /// When this function returns, the `BusAdapter` has initialized the
    /// controller and its analog front end.
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        let mut usb = Usbd::new(peripherals);
        usb.initialize();

        BusAdapter {
            usb: Mutex::new(RefCell::new(usb)),
        }
    }

    /// Interrupt-safe, immutable access to the USB peripheral
    fn with_usb<R>(&self, func: impl FnOnce(&Usbd) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let usb = usb.borrow();
            func(&usb)
        })
    }

    /// Interrupt-safe, mutable access to the USB peripheral
    fn with_usb_mut<R>(&self, func: impl FnOnce(&mut Usbd) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let mut usb = usb.borrow_mut();
            func(&mut usb)
        })
    }

    /// Run the bus-event dispatcher
    ///
    /// Call this from the USB interrupt handler. It classifies and
    /// acknowledges the latched hardware events, and returns quickly; it
    /// never blocks. The caller re-arms the interrupt line.
    pub fn on_interrupt(&self) {
        self.with_usb_mut(|usb| usb.dispatch());
    }

    /// Present or withdraw the D+ pull-up
    ///
    /// The stack calls this through [`UsbBus::enable`]; use it directly to
    /// drop off the bus without tearing down the device.
    pub fn connect(&self, connect: bool) {
        self.with_usb_mut(|usb| usb.connect(connect));
    }

    /// Apply device configurations, and perform other post-configuration
    /// actions
    ///
    /// You must invoke this once, and only after your device has been
    /// configured. See the top-level requirements for how this could be
    /// achieved.
    pub fn configure(&self) {
        self.with_usb_mut(|usb| {
            usb.enable_endpoints();
            debug!("CONFIGURED");
        });
    }

    /// Bus events pending in the driver's latch
    ///
    /// A peek, not a drain; [`poll()`](UsbBus::poll) consumes them. Useful
    /// from an interrupt handler that only wants to wake the transport
    /// task when something actually happened.
    pub fn events(&self) -> crate::Events {
        self.with_usb(|usb| usb.events())
    }

    /// The current USB frame number
    ///
    /// Always returns the not-supported sentinel: the controller doesn't
    /// track frame numbers.
    pub fn frame_number(&self) -> Result<u16, UsbError> {
        self.with_usb(|usb| usb.frame_number())
    }

    /// The last transfer error
    ///
    /// Always returns the not-supported sentinel: the controller doesn't
    /// latch per-transfer error codes.
    pub fn last_error(&self) -> Result<u8, UsbError> {
        self.with_usb(|usb| usb.last_error())
    }
}

impl UsbBus for BusAdapter {
    /// The controller applies a new device address through software, and
    /// the driver holds the write until the status stage completes. We
    /// need the address before the status stage happens, so ask the stack
    /// to hand it over early.
    const QUIRK_SET_ADDRESS_BEFORE_STATUS: bool = true;

    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        self.with_usb_mut(|usb| {
            if let Some(addr) = ep_addr {
                if usb.is_allocated(addr) {
                    return Err(UsbError::InvalidEndpoint);
                }
                usb.allocate_ep(addr, ep_type, max_packet_size)?;
                Ok(addr)
            } else {
                for idx in 1..8 {
                    let addr = EndpointAddress::from_parts(idx, ep_dir);
                    if usb.is_allocated(addr) {
                        continue;
                    }
                    usb.allocate_ep(addr, ep_type, max_packet_size)?;
                    return Ok(addr);
                }
                Err(UsbError::EndpointOverflow)
            }
        })
    }

    fn set_device_address(&self, addr: u8) {
        self.with_usb_mut(|usb| {
            usb.set_pending_address(addr);
        });
    }

    fn enable(&mut self) {
        self.with_usb_mut(|usb| usb.attach());
    }

    fn reset(&self) {
        self.with_usb_mut(|usb| {
            usb.bus_reset();
            debug!("RESET");
        });
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        self.with_usb_mut(|usb| {
            if !usb.is_allocated(ep_addr) {
                return Err(UsbError::InvalidEndpoint);
            }

            let written = if ep_addr.index() == 0 {
                usb.ctrl0_write(buf)
            } else {
                usb.ep_write(buf, ep_addr)
            }
            .map_err(|error| {
                warn!("EP{} WRITE {}", ep_addr.index(), error);
                error
            })?;

            Ok(written)
        })
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        self.with_usb_mut(|usb| {
            if !usb.is_allocated(ep_addr) {
                return Err(UsbError::InvalidEndpoint);
            }

            let read = if ep_addr.index() == 0 {
                usb.ctrl0_read(buf)
            } else {
                usb.ep_read(buf, ep_addr)
            }
            .map_err(|error| {
                warn!("EP{} READ {}", ep_addr.index(), error);
                error
            })?;

            Ok(read)
        })
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        self.with_usb_mut(|usb| {
            if usb.is_allocated(ep_addr) {
                usb.ep_stall(stalled, ep_addr);
            }
        });
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.with_usb(|usb| usb.is_ep_stalled(ep_addr))
    }

    fn suspend(&self) {
        // Nothing to do; the transceiver keeps its own state while the
        // bus idles
    }

    fn resume(&self) {
        // Nothing to do
    }

    fn poll(&self) -> PollResult {
        self.with_usb_mut(|usb| {
            usb.dispatch();
            usb.poll()
        })
    }
}
