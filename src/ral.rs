//! RAL-compatible interface to the USBD register block
//!
//! The NUC100-series device support doesn't ship a register access layer,
//! so this module defines one: a `#[repr(C)]` register block with field
//! modules that work with the `ral-registers` macros, plus the volatile
//! cell that backs each register. The endpoint packet buffer is a 512-byte
//! SRAM window that starts 0x100 bytes after the register block; access it
//! through [`Instance::buffer`].

pub use ral_registers::{modify_reg, read_reg, write_reg};

use core::cell::UnsafeCell;

/// Volatile cell that conforms to the RAL's register API
#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

pub mod usbd {
    use super::VCell;

    /// Registers for one endpoint slot
    #[allow(non_snake_case)]
    #[repr(C)]
    pub struct EpRegs {
        /// Buffer segment: packet buffer offset for this slot
        pub BUFSEG: VCell<u32>,
        /// Maximal payload: arms a transaction (write), reports the
        /// received length (read)
        pub MXPLD: VCell<u32>,
        /// Endpoint configuration
        pub CFG: VCell<u32>,
        /// Extra configuration: stall and buffer-clear controls
        pub CFGP: VCell<u32>,
    }

    #[allow(non_snake_case)]
    #[repr(C)]
    pub struct RegisterBlock {
        pub INTEN: VCell<u32>,
        pub INTSTS: VCell<u32>,
        pub FADDR: VCell<u32>,
        pub EPSTS: VCell<u32>,
        pub ATTR: VCell<u32>,
        pub FLDET: VCell<u32>,
        pub STBUFSEG: VCell<u32>,
        _reserved0: u32,
        pub EP: [EpRegs; crate::EP_COUNT],
        _reserved1: [u32; 4],
        pub DRVSE0: VCell<u32>,
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x94) as usize];

    /// Offset from the register block to the packet buffer window
    const BUFFER_OFFSET: usize = 0x100;

    /// An owned pointer to the USBD register block
    ///
    /// Constructed once from a [`Peripherals`](crate::Peripherals)
    /// implementation, then owned by the driver for the process lifetime.
    pub struct Instance {
        ptr: *const RegisterBlock,
    }

    // Safety: just a pointer to the (singleton) register block; the owning
    // driver serializes all access.
    unsafe impl Send for Instance {}

    impl Instance {
        /// # Safety
        ///
        /// `ptr` must be the address of the USBD register block, and the
        /// caller must be the block's only owner.
        pub unsafe fn new(ptr: *const ()) -> Self {
            Instance {
                ptr: ptr as *const RegisterBlock,
            }
        }

        /// Base of the 512-byte endpoint packet buffer window
        pub fn buffer(&self) -> *mut u8 {
            (self.ptr as *mut u8).wrapping_add(BUFFER_OFFSET)
        }
    }

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            unsafe { &*self.ptr }
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod INTEN {
        pub mod BUS_IE {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod USB_IE {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod FLDET_IE {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod WAKEUP_IE {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod WAKEUP_EN {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod INTSTS {
        pub mod BUS_STS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod USB_STS {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod FLDET_STS {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod WAKEUP_STS {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPEVT {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0x3F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SETUP {
            pub const offset: u32 = 31;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod FADDR {
        pub mod FADDR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod EPSTS {
        pub mod EPSTS0 {
            pub const offset: u32 = 8;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPSTS1 {
            pub const offset: u32 = 11;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPSTS2 {
            pub const offset: u32 = 14;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPSTS3 {
            pub const offset: u32 = 17;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPSTS4 {
            pub const offset: u32 = 20;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EPSTS5 {
            pub const offset: u32 = 23;
            pub const mask: u32 = 0x7 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod ATTR {
        pub mod USBRST {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod SUSPEND {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RESUME {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod TIMEOUT {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PHY_EN {
            pub const offset: u32 = 4;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod RWAKEUP {
            pub const offset: u32 = 5;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod USB_EN {
            pub const offset: u32 = 7;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod DPPU_EN {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod PWRDN {
            pub const offset: u32 = 9;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod BYTEM {
            pub const offset: u32 = 10;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod FLDET {
        pub mod FLDET {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod STBUFSEG {
        pub mod STBUFSEG {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x1FF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod DRVSE0 {
        pub mod DRVSE0 {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    /// Field modules for the per-slot [`EpRegs`] registers
    #[allow(non_snake_case, non_upper_case_globals)]
    pub mod ep {
        pub mod BUFSEG {
            pub mod BUFSEG {
                pub const offset: u32 = 0;
                pub const mask: u32 = 0x1FF << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        }
        pub mod MXPLD {
            pub mod MXPLD {
                pub const offset: u32 = 0;
                pub const mask: u32 = 0x1FF << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        }
        pub mod CFG {
            pub mod STATE {
                pub const offset: u32 = 5;
                pub const mask: u32 = 0x3 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
            pub mod DSQ_SYNC {
                pub const offset: u32 = 7;
                pub const mask: u32 = 1 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
            pub mod EP_NUM {
                pub const offset: u32 = 8;
                pub const mask: u32 = 0xF << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
            pub mod CSTALL {
                pub const offset: u32 = 9;
                pub const mask: u32 = 1 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
            pub mod ISOCH {
                pub const offset: u32 = 12;
                pub const mask: u32 = 1 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        }
        pub mod CFGP {
            pub mod CLRRDY {
                pub const offset: u32 = 0;
                pub const mask: u32 = 1 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
            pub mod SSTALL {
                pub const offset: u32 = 1;
                pub const mask: u32 = 1 << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        }
    }

    /// INTSTS event bit for one endpoint slot
    pub const fn epevt(slot: usize) -> u32 {
        1 << (INTSTS::EPEVT::offset as usize + slot)
    }

    /// Extracts one slot's 3-bit transaction status from an EPSTS snapshot
    pub const fn epsts_field(epsts: u32, slot: usize) -> u32 {
        (epsts >> (EPSTS::EPSTS0::offset as usize + 3 * slot)) & 0x7
    }
}

/// RAM stand-ins for the register block and its packet buffer window,
/// for host-side tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::usbd;

    #[repr(C, align(4))]
    pub struct Mock {
        pub regs: usbd::RegisterBlock,
        _pad: [u8; 0x100 - core::mem::size_of::<usbd::RegisterBlock>()],
        pub sram: [u8; crate::buffer::LEN],
    }

    impl Mock {
        pub fn new() -> Self {
            // Power-on register state is all zeros; so is fresh SRAM.
            unsafe { core::mem::zeroed() }
        }

        pub fn ptr(&self) -> *const () {
            self as *const Self as *const ()
        }

        pub fn instance(&self) -> usbd::Instance {
            unsafe { usbd::Instance::new(self.ptr()) }
        }
    }

    pub struct MockPeripherals(pub *const ());

    unsafe impl crate::Peripherals for MockPeripherals {
        fn usbd(&self) -> *const () {
            self.0
        }
    }
}

#[cfg(test)]
mod test {
    use super::usbd;
    use crate::ral;

    fn block() -> usbd::RegisterBlock {
        // All-zero register state is what the hardware presents after
        // power-on; a zeroed block stands in for it on the host.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn faddr() {
        let usb = block();
        ral::write_reg!(ral::usbd, &usb, FADDR, FADDR: 0xFF);
        assert_eq!(usb.FADDR.read(), 0x7F);
        assert_eq!(ral::read_reg!(ral::usbd, &usb, FADDR, FADDR), 0x7F);
    }

    #[test]
    fn attr_bring_up() {
        let usb = block();
        ral::modify_reg!(ral::usbd, &usb, ATTR, USB_EN: 1, PHY_EN: 1, DPPU_EN: 1);
        assert_eq!(usb.ATTR.read(), (1 << 7) | (1 << 4) | (1 << 8));
        ral::modify_reg!(ral::usbd, &usb, ATTR, USB_EN: 0);
        assert_eq!(usb.ATTR.read(), (1 << 4) | (1 << 8));
    }

    #[test]
    fn intsts_flag_mask() {
        let usb = block();
        ral::write_reg!(ral::usbd, &usb, INTSTS, usbd::INTSTS::BUS_STS::mask);
        assert_eq!(usb.INTSTS.read(), 1);
    }

    #[test]
    fn epevt_bits() {
        assert_eq!(usbd::epevt(0), 1 << 16);
        assert_eq!(usbd::epevt(5), 1 << 21);
    }

    #[test]
    fn epsts_fields() {
        // Slot 3 status lives at bits [19:17]
        let snapshot = 0b101 << 17;
        assert_eq!(usbd::epsts_field(snapshot, 3), 0b101);
        assert_eq!(usbd::epsts_field(snapshot, 0), 0);
        assert_eq!(usbd::epsts_field(snapshot, 5), 0);
    }

    #[test]
    fn ep_cfg() {
        let usb = block();
        ral::write_reg!(ral::usbd::ep, &usb.EP[2], CFG, EP_NUM: 3, STATE: 0b10);
        assert_eq!(usb.EP[2].CFG.read(), (3 << 8) | (0b10 << 5));
        assert_eq!(usb.EP[0].CFG.read(), 0);
    }
}
