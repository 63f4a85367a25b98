//! Serial Interface Engine command protocol.
//!
//! Everything that isn't packet data goes through a two-register handshake:
//! write a command phase to `CMDCODE`, then poll `DEVINTST` until the engine
//! reports the command consumed (`CC_EMPTY`) or its result available
//! (`CD_FULL`). The engine has no failure signal of its own, so each poll is
//! bounded and gives up with [`SieError::Timeout`].

use bitflags::bitflags;

use crate::arch;
use crate::regs::{DevInt, Reg, UsbRegs};

/// Polls of `DEVINTST` before a handshake is declared dead. At 72 MHz this
/// is well over a millisecond, against a nominal turnaround of a few bus
/// clocks.
pub const SIE_SPIN_LIMIT: u32 = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SieError {
    Timeout,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum Phase {
    Write = 0x01,
    Read = 0x02,
    Command = 0x05,
}

fn cmdcode(phase: Phase, payload: u8) -> u32 {
    (u32::from(payload) << 16) | ((phase as u32) << 8)
}

mod op {
    pub const SET_ADDRESS: u8 = 0xD0;
    pub const CONFIGURE_DEVICE: u8 = 0xD8;
    pub const SET_MODE: u8 = 0xF3;
    #[cfg(test)]
    pub const READ_FRAME_NUMBER: u8 = 0xF5;
    pub const DEVICE_STATUS: u8 = 0xFE;
    pub const SELECT_ENDPOINT: u8 = 0x00;
    pub const SELECT_ENDPOINT_CLEAR_INTERRUPT: u8 = 0x40;
    pub const SET_ENDPOINT_STATUS: u8 = 0x40;
    pub const CLEAR_BUFFER: u8 = 0xF2;
    pub const VALIDATE_BUFFER: u8 = 0xFA;
}

const ADDRESS_ENABLE: u8 = 0x80;

bitflags! {
    /// Result of SelectEndpoint.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EpSelect: u8 {
        const FULL = 1 << 0;
        const STALLED = 1 << 1;
        const SETUP = 1 << 2;
        const OVERWRITTEN = 1 << 3;
        const NAKED = 1 << 4;
        const BUFFER1_FULL = 1 << 5;
        const BUFFER2_FULL = 1 << 6;
    }

    /// Argument of SetEndpointStatus.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EpStatus: u8 {
        const STALLED = 1 << 0;
        const DISABLED = 1 << 5;
        const RATE_FEEDBACK = 1 << 6;
        const CONDITIONAL_STALL = 1 << 7;
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DeviceStatus: u8 {
        const CONNECT = 1 << 0;
        const CONNECT_CHANGED = 1 << 1;
        const SUSPEND = 1 << 2;
        const SUSPEND_CHANGED = 1 << 3;
        const RESET = 1 << 4;
    }
}

pub struct Sie {
    regs: UsbRegs,
    spin_limit: u32,
}

impl Sie {
    pub fn new(regs: UsbRegs) -> Self {
        Self {
            regs,
            spin_limit: SIE_SPIN_LIMIT,
        }
    }

    pub fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    pub fn regs(&self) -> &UsbRegs {
        &self.regs
    }

    fn wait_for(&self, flag: DevInt) -> Result<(), SieError> {
        for _ in 0..self.spin_limit {
            if self.regs.interrupts().contains(flag) {
                self.regs.clear_interrupts(flag);
                return Ok(());
            }
            arch::relax();
        }
        Err(SieError::Timeout)
    }

    fn command(&self, code: u8) -> Result<(), SieError> {
        self.regs.clear_interrupts(DevInt::CC_EMPTY | DevInt::CD_FULL);
        self.regs.write(Reg::CmdCode, cmdcode(Phase::Command, code));
        self.wait_for(DevInt::CC_EMPTY)
    }

    fn write_data(&self, data: u8) -> Result<(), SieError> {
        self.regs.write(Reg::CmdCode, cmdcode(Phase::Write, data));
        self.wait_for(DevInt::CC_EMPTY)
    }

    fn read_data(&self, code: u8) -> Result<u8, SieError> {
        self.regs.write(Reg::CmdCode, cmdcode(Phase::Read, code));
        self.wait_for(DevInt::CD_FULL)?;
        Ok(self.regs.read(Reg::CmdData) as u8)
    }

    pub fn command_write(&self, code: u8, data: u8) -> Result<(), SieError> {
        self.command(code)?;
        self.write_data(data)
    }

    pub fn command_read(&self, code: u8) -> Result<u8, SieError> {
        self.command(code)?;
        self.read_data(code)
    }

    /// Two-byte reads come back low byte first.
    pub fn command_read16(&self, code: u8) -> Result<u16, SieError> {
        self.command(code)?;
        let lo = self.read_data(code)?;
        let hi = self.read_data(code)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Sets the device address and keeps the function enabled. Takes effect
    /// immediately, so callers defer it past the status stage.
    pub fn set_address(&self, address: u8) -> Result<(), SieError> {
        self.command_write(op::SET_ADDRESS, ADDRESS_ENABLE | (address & 0x7F))
    }

    pub fn configure_device(&self, configured: bool) -> Result<(), SieError> {
        self.command_write(op::CONFIGURE_DEVICE, u8::from(configured))
    }

    pub fn set_mode(&self, mode: u8) -> Result<(), SieError> {
        self.command_write(op::SET_MODE, mode)
    }

    #[cfg(test)]
    pub fn read_frame_number(&self) -> Result<u16, SieError> {
        self.command_read16(op::READ_FRAME_NUMBER)
    }

    pub fn device_status(&self) -> Result<DeviceStatus, SieError> {
        self.command_read(op::DEVICE_STATUS).map(DeviceStatus::from_bits_truncate)
    }

    pub fn set_device_status(&self, status: DeviceStatus) -> Result<(), SieError> {
        self.command_write(op::DEVICE_STATUS, status.bits())
    }

    pub fn select_endpoint(&self, physical: u8) -> Result<EpSelect, SieError> {
        self.command_read(op::SELECT_ENDPOINT + physical).map(EpSelect::from_bits_truncate)
    }

    /// Like [`Sie::select_endpoint`] but also acknowledges the endpoint's
    /// interrupt. This is the only way to learn that an EP0 OUT packet was a
    /// SETUP.
    pub fn select_endpoint_clear_interrupt(&self, physical: u8) -> Result<EpSelect, SieError> {
        self.command_read(op::SELECT_ENDPOINT_CLEAR_INTERRUPT + physical)
            .map(EpSelect::from_bits_truncate)
    }

    pub fn set_endpoint_status(&self, physical: u8, status: EpStatus) -> Result<(), SieError> {
        self.command_write(op::SET_ENDPOINT_STATUS + physical, status.bits())
    }

    /// Releases the selected OUT buffer. Returns true if the packet was
    /// overwritten by a SETUP while we were reading it.
    pub fn clear_buffer(&self) -> Result<bool, SieError> {
        self.command_read(op::CLEAR_BUFFER).map(|r| r & 1 != 0)
    }

    pub fn validate_buffer(&self) -> Result<(), SieError> {
        self.command(op::VALIDATE_BUFFER)
    }
}
