//! A USB device driver for Nuvoton NUC100-series processors
//!
//! `nuc1xx-usbd` provides a [`usb-device`] USB bus implementation for the
//! NUC100-series full-speed device controller, plus the transport pipeline
//! a USB debug probe builds on top of it:
//!
//! - [`BusAdapter`], the `usb-device` bus backed by the controller's
//!   six endpoint slots and its 512-byte packet buffer,
//! - [`hid`], a HID report bridge that relays command/response buffers
//!   to an external processor,
//! - [`task`], the cooperative polling task that drives the stack,
//! - [`osal`], adapters for the RTOS primitives the pipeline relies on.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the peripherals documentation for more information.
//!
//! [`usb-device`]: https://crates.io/crates/usb-device

#![no_std]

#[macro_use]
mod log;

mod buffer;
mod endpoint;
mod ral;

mod bus;
mod driver;
pub mod hid;
pub mod osal;
pub mod task;

pub use bus::BusAdapter;
pub use driver::Events;

/// Six endpoint slots share the hardware packet buffer
const EP_COUNT: usize = 6;

/// A type that owns the USB device register block
///
/// An implementation of `Peripherals` is expected to own the USBD core
/// registers, including the endpoint packet buffer window that follows
/// them. The driver derives the buffer window from the base address.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USBD
/// register block. The pointer returned by [`usbd()`](Peripherals::usbd)
/// is assumed to be valid, and will be cast to a register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` for a singleton that represents
/// the one USBD peripheral on the chip:
///
/// ```
/// use nuc1xx_usbd::Peripherals;
///
/// struct Usbd {
///     // Constructed by your device support crate, in a way that
///     // guarantees only one `Usbd` exists.
///     _marker: (),
/// }
///
/// impl Usbd {
///     const BASE: usize = 0x4006_0000;
/// }
///
/// unsafe impl Peripherals for Usbd {
///     fn usbd(&self) -> *const () {
///         Self::BASE as *const ()
///     }
/// }
///
/// let usbd = Usbd { _marker: () };
/// assert_eq!(usbd.usbd() as usize, 0x4006_0000);
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USBD register block
    fn usbd(&self) -> *const ();
}
