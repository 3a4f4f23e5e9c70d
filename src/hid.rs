//! HID report bridge
//!
//! The bridge exposes one vendor-defined HID interface whose reports carry
//! raw command and response buffers between the host and an external
//! command processor. Reports use ID 0 and fill a full 64-byte packet in
//! each direction.
//!
//! The exchange is single-buffered: a report is relayed to the
//! [`CommandProcessor`] synchronously, and no new report is consumed until
//! the processor's response has been queued for transmission. While the
//! exchange is busy the OUT endpoint is left un-rearmed, so the hardware
//! NAKs the host and flow control falls out of the transport layer.

use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::Result;

/// Length of a request or response report, fixed to the endpoint max
/// packet size
pub const REPORT_LEN: usize = 64;

const USB_CLASS_HID: u8 = 0x03;
const DESCRIPTOR_TYPE_HID: u8 = 0x21;
const DESCRIPTOR_TYPE_REPORT: u8 = 0x22;

const REQ_GET_REPORT: u8 = 0x01;
const REQ_GET_IDLE: u8 = 0x02;
const REQ_SET_REPORT: u8 = 0x09;
const REQ_SET_IDLE: u8 = 0x0A;

/// Vendor-defined report descriptor: 64 bytes in, 64 bytes out, report
/// ID 0
const REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xFF, // Usage Page (vendor defined)
    0x09, 0x01, // Usage
    0xA1, 0x01, // Collection (Application)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x40, //   Report Count (64)
    0x09, 0x01, //   Usage
    0x81, 0x02, //   Input (Data, Variable, Absolute)
    0x95, 0x40, //   Report Count (64)
    0x09, 0x01, //   Usage
    0x91, 0x02, //   Output (Data, Variable, Absolute)
    0xC0, // End Collection
];

/// The external debug-command processor
///
/// Consumes a raw request buffer and produces a raw response buffer. The
/// semantics of the bytes are opaque to the bridge.
pub trait CommandProcessor {
    /// Handle `request`, writing the reply into `response`
    ///
    /// Returns the number of reply bytes written.
    fn process(&mut self, request: &[u8], response: &mut [u8; REPORT_LEN]) -> usize;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// A response is waiting to be queued on the IN endpoint
    Processing,
}

/// Single-buffered request/response relay
struct Exchange {
    request: [u8; REPORT_LEN],
    response: [u8; REPORT_LEN],
    len: usize,
    state: State,
}

impl Exchange {
    const fn new() -> Self {
        Exchange {
            request: [0; REPORT_LEN],
            response: [0; REPORT_LEN],
            len: 0,
            state: State::Idle,
        }
    }

    fn is_busy(&self) -> bool {
        self.state == State::Processing
    }

    /// Relay one request through the processor
    ///
    /// Returns `false` without touching anything if the prior response
    /// hasn't been queued yet.
    fn run<P: CommandProcessor>(&mut self, data: &[u8], processor: &mut P) -> bool {
        if self.is_busy() {
            return false;
        }
        let received = data.len().min(REPORT_LEN);
        self.request[..received].copy_from_slice(&data[..received]);

        // The reply length the processor reports is deliberately not used:
        // the transmitted response is truncated to the request's length
        // bound, matching the wire contract the host-side tooling expects.
        let _ = processor.process(&self.request[..received], &mut self.response);
        self.len = REPORT_LEN.min(received);
        self.state = State::Processing;
        true
    }

    fn response(&self) -> &[u8] {
        &self.response[..self.len]
    }

    fn mark_queued(&mut self) {
        self.state = State::Idle;
    }

    fn reset(&mut self) {
        self.len = 0;
        self.state = State::Idle;
    }
}

/// A HID class relaying reports to a [`CommandProcessor`]
pub struct HidBridge<'a, B: UsbBus, P: CommandProcessor> {
    interface: InterfaceNumber,
    ep_in: EndpointIn<'a, B>,
    ep_out: EndpointOut<'a, B>,
    processor: P,
    exchange: Exchange,
    idle: u8,
}

impl<'a, B: UsbBus, P: CommandProcessor> HidBridge<'a, B, P> {
    pub fn new(alloc: &'a UsbBusAllocator<B>, processor: P) -> Self {
        HidBridge {
            interface: alloc.interface(),
            ep_in: alloc.interrupt(REPORT_LEN as u16, 1),
            ep_out: alloc.interrupt(REPORT_LEN as u16, 1),
            processor,
            exchange: Exchange::new(),
            idle: 0,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    fn accepts(&self, req: &Request) -> bool {
        req.index == u8::from(self.interface) as u16
    }

    /// Run one request through the exchange and try to queue the response
    fn relay(&mut self, data: &[u8]) {
        if self.exchange.run(data, &mut self.processor) {
            self.flush();
        }
    }

    /// Queue a computed response on the IN endpoint
    ///
    /// Retried from the IN-completion callback when the endpoint was
    /// still transmitting the previous report.
    fn flush(&mut self) {
        if self.exchange.is_busy() && self.ep_in.write(self.exchange.response()).is_ok() {
            self.exchange.mark_queued();
        }
    }
}

impl<B: UsbBus, P: CommandProcessor> UsbClass<B> for HidBridge<'_, B, P> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface(self.interface, USB_CLASS_HID, 0, 0)?;
        writer.write(
            DESCRIPTOR_TYPE_HID,
            &[
                0x11,
                0x01, // bcdHID 1.11
                0x00, // bCountryCode
                0x01, // bNumDescriptors
                DESCRIPTOR_TYPE_REPORT,
                REPORT_DESCRIPTOR.len() as u8,
                (REPORT_DESCRIPTOR.len() >> 8) as u8,
            ],
        )?;
        writer.endpoint(&self.ep_in)?;
        writer.endpoint(&self.ep_out)
    }

    fn reset(&mut self) {
        self.exchange.reset();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        if !self.accepts(&req) {
            return;
        }

        match (req.request_type, req.recipient, req.request) {
            (RequestType::Standard, Recipient::Interface, Request::GET_DESCRIPTOR) => {
                let (descriptor_type, _) = req.descriptor_type_index();
                if descriptor_type == DESCRIPTOR_TYPE_REPORT {
                    xfer.accept_with_static(REPORT_DESCRIPTOR).ok();
                }
            }
            (RequestType::Class, Recipient::Interface, REQ_GET_REPORT) => {
                // Commands flow through SET_REPORT and the OUT endpoint;
                // there is nothing to report back here
                xfer.accept(|_| Ok(0)).ok();
            }
            (RequestType::Class, Recipient::Interface, REQ_GET_IDLE) => {
                xfer.accept_with(&[self.idle]).ok();
            }
            _ => {}
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        if req.request_type != RequestType::Class
            || req.recipient != Recipient::Interface
            || !self.accepts(&req)
        {
            return;
        }

        match req.request {
            REQ_SET_IDLE => {
                self.idle = (req.value >> 8) as u8;
                xfer.accept().ok();
            }
            REQ_SET_REPORT => {
                if self.exchange.is_busy() {
                    // The prior response hasn't been queued; don't
                    // service a new request
                    xfer.reject().ok();
                    return;
                }
                let mut report = [0; REPORT_LEN];
                let len = xfer.data().len().min(REPORT_LEN);
                report[..len].copy_from_slice(&xfer.data()[..len]);
                xfer.accept().ok();
                self.relay(&report[..len]);
            }
            _ => {}
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr != self.ep_out.address() {
            return;
        }
        if self.exchange.is_busy() {
            // Leaving the packet in the endpoint keeps the hardware
            // NAKing; the next poll delivers it once the exchange frees up
            return;
        }
        let mut report = [0; REPORT_LEN];
        if let Ok(len) = self.ep_out.read(&mut report) {
            self.relay(&report[..len]);
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.ep_in.address() {
            self.flush();
        }
    }
}
