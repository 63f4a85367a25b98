//! LPC1342/1343 GPIO lines and CT16B timer for the bus.
//!
//! The lines are open drain in effect: the output latch is left low and a
//! line is driven by making it an output, released by making it an input.
//! Clock edges come in through the port's edge interrupt.

use core::ptr::{read_volatile, write_volatile};

use crate::{BusTimer, Pin};

/// Byte offsets within a GPIO port block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
enum GpioReg {
    /// All-bits view of the masked data window.
    Data = 0x3FFC,
    Dir = 0x8000,
    /// Level (1) or edge (0) sensitive.
    Is = 0x8004,
    /// Both edges.
    Ibe = 0x8008,
    /// Rising (1) or falling (0).
    Iev = 0x800C,
    Ie = 0x8010,
    Ris = 0x8014,
    Mis = 0x8018,
    Ic = 0x801C,
}

/// Number of 32-bit words spanned by a GPIO port block.
pub const GPIO_BLOCK_WORDS: usize = 0x2008;

#[cfg(feature = "chip-lpc1343")]
pub const GPIO0_BASE: usize = 0x5000_0000;
#[cfg(feature = "chip-lpc1343")]
pub const GPIO_PORT_STRIDE: usize = 0x1_0000;

/// One pin of a GPIO port.
#[derive(Debug)]
pub struct GpioPin {
    base: *mut u32,
    pin: u8,
}

impl GpioPin {
    /// # Safety
    ///
    /// `base` must point at a GPIO port block (or [`GPIO_BLOCK_WORDS`]
    /// words standing in for one) that stays valid for the life of the
    /// handle. Other handles may share the port but not the pin.
    pub const unsafe fn from_base(base: *mut u32, pin: u8) -> Self {
        Self { base, pin: pin & 0xF }
    }

    /// # Safety
    ///
    /// Caller must own `pin` of GPIO `port`, with IOCON already routing it
    /// to GPIO.
    #[cfg(feature = "chip-lpc1343")]
    pub const unsafe fn lpc1343(port: usize, pin: u8) -> Self {
        Self::from_base((GPIO0_BASE + port * GPIO_PORT_STRIDE) as *mut u32, pin)
    }

    fn mask(&self) -> u32 {
        1 << self.pin
    }

    fn word(&self, offset: usize) -> *mut u32 {
        self.base.wrapping_add(offset / 4)
    }

    fn read_reg(&self, reg: GpioReg) -> u32 {
        // Safety: validity of the block is the constructor's contract.
        unsafe { read_volatile(self.word(reg as usize)) }
    }

    fn write_reg(&self, reg: GpioReg, value: u32) {
        // Safety: see `read_reg`.
        unsafe { write_volatile(self.word(reg as usize), value) }
    }

    fn modify_reg(&self, reg: GpioReg, set: bool) {
        let v = self.read_reg(reg);
        let v = if set { v | self.mask() } else { v & !self.mask() };
        self.write_reg(reg, v);
    }

    /// The data window address that only touches this pin.
    fn masked_data(&self) -> *mut u32 {
        self.word((self.mask() as usize) << 2)
    }

    /// Interrupts on falling edges only, with any stale edge cleared.
    pub fn enable_falling_edge_interrupt(&mut self) {
        self.modify_reg(GpioReg::Is, false);
        self.modify_reg(GpioReg::Ibe, false);
        self.modify_reg(GpioReg::Iev, false);
        self.write_reg(GpioReg::Ic, self.mask());
        self.modify_reg(GpioReg::Ie, true);
    }

    /// Whether an edge is pending; clears it if so. Call from the port
    /// interrupt handler.
    pub fn take_edge(&mut self) -> bool {
        if self.read_reg(GpioReg::Mis) & self.mask() == 0 {
            return false;
        }
        self.write_reg(GpioReg::Ic, self.mask());
        true
    }

    /// Raw edge status, regardless of the enable.
    pub fn edge_seen(&self) -> bool {
        self.read_reg(GpioReg::Ris) & self.mask() != 0
    }

    /// Port-wide input levels.
    pub fn port_levels(&self) -> u32 {
        self.read_reg(GpioReg::Data)
    }
}

impl Pin for GpioPin {
    fn set_output(&mut self, output: bool) {
        self.modify_reg(GpioReg::Dir, output);
    }

    fn write(&mut self, high: bool) {
        let v = if high { self.mask() } else { 0 };
        // Safety: see `read_reg`.
        unsafe { write_volatile(self.masked_data(), v) }
    }

    fn read(&self) -> bool {
        // Safety: see `read_reg`.
        unsafe { read_volatile(self.masked_data()) != 0 }
    }
}

/// Byte offsets within a CT16B block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
enum TimerReg {
    Ir = 0x00,
    Tcr = 0x04,
    Tc = 0x08,
    Pr = 0x0C,
    Mcr = 0x14,
    Mr0 = 0x18,
}

pub const TIMER_BLOCK_WORDS: usize = 7;

#[cfg(feature = "chip-lpc1343")]
pub const CT16B0_BASE: usize = 0x4000_C000;
#[cfg(feature = "chip-lpc1343")]
pub const CT16B1_BASE: usize = 0x4001_0000;

const TCR_ENABLE: u32 = 1 << 0;
const TCR_RESET: u32 = 1 << 1;
const MCR_MR0_INTERRUPT: u32 = 1 << 0;
const MCR_MR0_STOP: u32 = 1 << 2;
const IR_MR0: u32 = 1 << 0;

/// A 16-bit timer used one-shot: match 0 interrupts and stops the count.
#[derive(Debug)]
pub struct Ct16bTimer {
    base: *mut u32,
}

impl Ct16bTimer {
    /// # Safety
    ///
    /// `base` must point at a CT16B block (or [`TIMER_BLOCK_WORDS`] words
    /// standing in for one) that stays valid for the life of the handle,
    /// and no other handle may alias it.
    pub const unsafe fn from_base(base: *mut u32) -> Self {
        Self { base }
    }

    /// # Safety
    ///
    /// Caller must own CT16B0 and have clocked it.
    #[cfg(feature = "chip-lpc1343")]
    pub const unsafe fn lpc1343_ct16b0() -> Self {
        Self::from_base(CT16B0_BASE as *mut u32)
    }

    fn read_reg(&self, reg: TimerReg) -> u32 {
        // Safety: validity of the block is the constructor's contract.
        unsafe { read_volatile(self.base.wrapping_add(reg as usize / 4)) }
    }

    fn write_reg(&self, reg: TimerReg, value: u32) {
        // Safety: see `read_reg`.
        unsafe { write_volatile(self.base.wrapping_add(reg as usize / 4), value) }
    }

    /// Stops the timer and sets it counting in microseconds; `prescale` is
    /// the peripheral clock in MHz minus one.
    pub fn init(&mut self, prescale: u16) {
        self.write_reg(TimerReg::Tcr, 0);
        self.write_reg(TimerReg::Pr, u32::from(prescale));
        self.write_reg(TimerReg::Mcr, MCR_MR0_INTERRUPT | MCR_MR0_STOP);
        self.write_reg(TimerReg::Ir, IR_MR0);
    }

    /// Whether match 0 fired; clears it if so. Call from the timer
    /// interrupt handler.
    pub fn take_match(&mut self) -> bool {
        if self.read_reg(TimerReg::Ir) & IR_MR0 == 0 {
            return false;
        }
        self.write_reg(TimerReg::Ir, IR_MR0);
        true
    }

    pub fn count(&self) -> u16 {
        self.read_reg(TimerReg::Tc) as u16
    }
}

impl BusTimer for Ct16bTimer {
    fn start(&mut self, us: u32) {
        self.write_reg(TimerReg::Tcr, 0);
        self.write_reg(TimerReg::Ir, IR_MR0);
        self.write_reg(TimerReg::Tcr, TCR_RESET);
        self.write_reg(TimerReg::Mr0, us.clamp(1, 0xFFFF));
        self.write_reg(TimerReg::Tcr, TCR_ENABLE);
    }

    fn stop(&mut self) {
        self.write_reg(TimerReg::Tcr, 0);
        self.write_reg(TimerReg::Ir, IR_MR0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_uses_its_masked_data_word() {
        let mut block = vec![0u32; GPIO_BLOCK_WORDS];
        let mut pin = unsafe { GpioPin::from_base(block.as_mut_ptr(), 3) };
        pin.write(true);
        pin.set_output(true);
        assert!(pin.read());
        pin.write(false);
        pin.set_output(false);
        assert_eq!(block[1 << 3], 0);
        assert_eq!(block[0x8000 / 4], 0);

        let mut other = unsafe { GpioPin::from_base(block.as_mut_ptr(), 5) };
        other.set_output(true);
        let mut pin = unsafe { GpioPin::from_base(block.as_mut_ptr(), 3) };
        pin.set_output(true);
        pin.set_output(false);
        assert_eq!(block[0x8000 / 4], 1 << 5);
    }

    #[test]
    fn edge_interrupt_setup_and_acknowledge() {
        let mut block = vec![0u32; GPIO_BLOCK_WORDS];
        block[0x8004 / 4] = 0xFFFF;
        let mut pin = unsafe { GpioPin::from_base(block.as_mut_ptr(), 2) };
        pin.enable_falling_edge_interrupt();
        assert!(!pin.take_edge());
        assert_eq!(block[0x8004 / 4], 0xFFFB);
        assert_eq!(block[0x8010 / 4], 1 << 2);
        assert_eq!(block[0x801C / 4], 1 << 2);

        block[0x801C / 4] = 0;
        block[0x8018 / 4] = 1 << 2;
        let mut pin = unsafe { GpioPin::from_base(block.as_mut_ptr(), 2) };
        assert!(pin.take_edge());
        assert_eq!(block[0x801C / 4], 1 << 2);
    }

    #[test]
    fn timer_is_one_shot() {
        let mut block = [0u32; TIMER_BLOCK_WORDS];
        let mut timer = unsafe { Ct16bTimer::from_base(block.as_mut_ptr()) };
        timer.init(71);
        timer.start(100_000);
        assert_eq!(block[0x0C / 4], 71);
        assert_eq!(block[0x14 / 4], 0b101);
        assert_eq!(block[0x18 / 4], 0xFFFF);
        assert_eq!(block[0x04 / 4], TCR_ENABLE);

        block[0] = IR_MR0;
        let mut timer = unsafe { Ct16bTimer::from_base(block.as_mut_ptr()) };
        assert!(timer.take_match());
        timer.stop();
        assert_eq!(block[0x04 / 4], 0);
    }
}
