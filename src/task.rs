//! The transport task that drives the generic stack
//!
//! One cooperative schedule unit owns the USB state machine end-to-end:
//! it services the stack's event queue, drives the ready indicator from
//! the connection state, and paces itself. When the bus is active and
//! events are pending it re-polls immediately to drain them with minimal
//! latency; when the device is suspended, detached, or idle it yields for
//! a short fixed interval before re-checking.

use crate::bus::BusAdapter;
use crate::hid::{CommandProcessor, HidBridge};
use crate::osal::Delay;
use usb_device::device::{UsbDevice, UsbDeviceState};

/// How long the task yields when there's nothing to drain
pub const YIELD_MS: u32 = 1;

/// Boolean "ready" signal, driven once per task cycle
///
/// On when the device is configured, off otherwise. Typically an LED.
pub trait Indicator {
    fn set_ready(&mut self, ready: bool);
}

/// Pacing decision for the next cycle
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cadence {
    /// Events are pending on an active bus; re-poll immediately
    Immediate,
    /// Yield for [`YIELD_MS`] before re-checking
    Yield,
}

fn cadence(state: UsbDeviceState, events_pending: bool) -> Cadence {
    match (state, events_pending) {
        (UsbDeviceState::Addressed | UsbDeviceState::Configured, true) => Cadence::Immediate,
        _ => Cadence::Yield,
    }
}

/// The cooperative polling task
///
/// Owns the USB device, the HID bridge, and the indicator; everything the
/// USB state machine touches runs on this one schedule unit, so no
/// locking exists beyond the adapter's own critical sections. The task
/// never blocks indefinitely: the yield is its only wait, and it's
/// bounded.
pub struct TransportTask<'a, P: CommandProcessor, I: Indicator, D: Delay> {
    device: UsbDevice<'a, BusAdapter>,
    bridge: HidBridge<'a, BusAdapter, P>,
    indicator: I,
    delay: D,
    configured: bool,
}

impl<'a, P: CommandProcessor, I: Indicator, D: Delay> TransportTask<'a, P, I, D> {
    pub fn new(
        device: UsbDevice<'a, BusAdapter>,
        bridge: HidBridge<'a, BusAdapter, P>,
        indicator: I,
        delay: D,
    ) -> Self {
        TransportTask {
            device,
            bridge,
            indicator,
            delay,
            configured: false,
        }
    }

    /// Service the stack once, then pace the next cycle
    ///
    /// Returns the pacing decision it applied, mostly so callers weaving
    /// other work into the loop can follow the same rhythm.
    pub fn poll(&mut self) -> Cadence {
        let events_pending = self.device.poll(&mut [&mut self.bridge]);
        let state = self.device.state();

        match state {
            UsbDeviceState::Configured => {
                if !self.configured {
                    // One-shot endpoint bring-up, per the bus contract
                    self.device.bus().configure();
                    self.configured = true;
                }
            }
            UsbDeviceState::Default | UsbDeviceState::Addressed => {
                // A reset or re-enumeration dropped the configuration
                self.configured = false;
            }
            _ => {}
        }

        self.indicator.set_ready(state == UsbDeviceState::Configured);

        let cadence = cadence(state, events_pending);
        if cadence == Cadence::Yield {
            self.delay.delay_ms(YIELD_MS);
        }
        cadence
    }

    /// Drive the stack forever
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    pub fn device(&self) -> &UsbDevice<'a, BusAdapter> {
        &self.device
    }

    pub fn bridge(&self) -> &HidBridge<'a, BusAdapter, P> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut HidBridge<'a, BusAdapter, P> {
        &mut self.bridge
    }
}

#[cfg(test)]
mod test {
    use super::{cadence, Cadence};
    use usb_device::device::UsbDeviceState;

    #[test]
    fn pending_events_on_an_active_bus_poll_immediately() {
        assert_eq!(
            cadence(UsbDeviceState::Configured, true),
            Cadence::Immediate
        );
        assert_eq!(cadence(UsbDeviceState::Addressed, true), Cadence::Immediate);
    }

    #[test]
    fn idle_cycles_yield() {
        assert_eq!(cadence(UsbDeviceState::Configured, false), Cadence::Yield);
        assert_eq!(cadence(UsbDeviceState::Addressed, false), Cadence::Yield);
    }

    #[test]
    fn suspended_or_detached_yields_even_with_events() {
        assert_eq!(cadence(UsbDeviceState::Suspend, true), Cadence::Yield);
        assert_eq!(cadence(UsbDeviceState::Default, true), Cadence::Yield);
    }
}
