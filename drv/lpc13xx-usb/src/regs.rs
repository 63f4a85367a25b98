//! USB device controller register block.
//!
//! The controller is driven almost entirely through the SIE command
//! interface (see `sie`); the registers here are the handful that remain
//! memory mapped: interrupt status, the command/data pair, and the packet
//! FIFOs.

use core::ptr::{read_volatile, write_volatile};

use bitflags::bitflags;

/// Word offsets of the registers we use, relative to the block base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Reg {
    DevIntSt = 0x00,
    DevIntEn = 0x04,
    DevIntClr = 0x08,
    DevIntSet = 0x0C,
    CmdCode = 0x10,
    CmdData = 0x14,
    RxData = 0x18,
    TxData = 0x1C,
    RxPLen = 0x20,
    TxPLen = 0x24,
    Ctrl = 0x28,
}

/// Number of 32-bit words spanned by [`Reg`].
pub const BLOCK_WORDS: usize = 11;

#[cfg(feature = "chip-lpc1343")]
pub const USB_BASE: usize = 0x4002_0000;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DevInt: u32 {
        const FRAME = 1 << 0;
        const EP0 = 1 << 1;
        const EP1 = 1 << 2;
        const EP2 = 1 << 3;
        const EP3 = 1 << 4;
        const EP4 = 1 << 5;
        const EP5 = 1 << 6;
        const EP6 = 1 << 7;
        const EP7 = 1 << 8;
        const DEV_STAT = 1 << 9;
        const CC_EMPTY = 1 << 10;
        const CD_FULL = 1 << 11;
        const RX_END_PKT = 1 << 12;
        const TX_END_PKT = 1 << 13;
    }
}

impl DevInt {
    pub const ALL_ENDPOINTS: Self = Self::from_bits_truncate(0x1FE);

    /// The interrupt bit for a physical endpoint index.
    pub fn endpoint(physical: u8) -> Self {
        Self::from_bits_truncate(1 << (u32::from(physical) + 1))
    }
}

pub const RXPLEN_LENGTH_MASK: u32 = 0x3FF;
pub const RXPLEN_DATA_VALID: u32 = 1 << 10;

pub const CTRL_RD_EN: u32 = 1 << 0;
pub const CTRL_WR_EN: u32 = 1 << 1;

pub fn ctrl_for_endpoint(logical: u8, enable: u32) -> u32 {
    (u32::from(logical & 0xF) << 2) | enable
}

/// Handle to one instance of the register block.
#[derive(Debug)]
pub struct UsbRegs {
    base: *mut u32,
}

impl UsbRegs {
    /// # Safety
    ///
    /// `base` must point at a USB device register block (or at least
    /// [`BLOCK_WORDS`] words of memory standing in for one) that stays valid
    /// for the life of the handle, and no other handle may alias it.
    pub const unsafe fn from_base(base: *mut u32) -> Self {
        Self { base }
    }

    /// # Safety
    ///
    /// Caller must own the USB peripheral; see [`UsbRegs::from_base`].
    #[cfg(feature = "chip-lpc1343")]
    pub const unsafe fn lpc1343() -> Self {
        Self::from_base(USB_BASE as *mut u32)
    }

    pub fn read(&self, reg: Reg) -> u32 {
        // Safety: validity of the block is the constructor's contract, and
        // every `Reg` offset is inside it.
        unsafe { read_volatile(self.base.add(reg as usize / 4)) }
    }

    pub fn write(&self, reg: Reg, value: u32) {
        // Safety: see `read`.
        unsafe { write_volatile(self.base.add(reg as usize / 4), value) }
    }

    pub fn interrupts(&self) -> DevInt {
        DevInt::from_bits_truncate(self.read(Reg::DevIntSt))
    }

    pub fn clear_interrupts(&self, bits: DevInt) {
        self.write(Reg::DevIntClr, bits.bits());
    }

    pub fn enable_interrupts(&self, bits: DevInt) {
        self.write(Reg::DevIntEn, bits.bits());
    }

    /// Raises interrupt flags by software, which is how the host-free code
    /// paths ask the interrupt handler to service an endpoint.
    pub fn set_interrupts(&self, bits: DevInt) {
        self.write(Reg::DevIntSet, bits.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_hit_fixed_offsets() {
        let mut block = [0u32; BLOCK_WORDS];
        let regs = unsafe { UsbRegs::from_base(block.as_mut_ptr()) };
        regs.write(Reg::CmdCode, 0x00D0_0500);
        regs.write(Reg::Ctrl, ctrl_for_endpoint(2, CTRL_WR_EN));
        regs.clear_interrupts(DevInt::EP0 | DevInt::FRAME);
        assert_eq!(block[4], 0x00D0_0500);
        assert_eq!(block[10], (2 << 2) | CTRL_WR_EN);
        assert_eq!(block[2], 0b11);
    }

    #[test]
    fn endpoint_interrupt_bits() {
        assert_eq!(DevInt::endpoint(0), DevInt::EP0);
        assert_eq!(DevInt::endpoint(7), DevInt::EP7);
        assert!(DevInt::ALL_ENDPOINTS.contains(DevInt::EP3));
        assert!(!DevInt::ALL_ENDPOINTS.contains(DevInt::FRAME));
    }
}
