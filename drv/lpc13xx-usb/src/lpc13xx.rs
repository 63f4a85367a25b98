//! LPC1342/1343 USB device controller.
//!
//! Packet data moves through the `RXDATA`/`TXDATA` word FIFOs after
//! selecting an endpoint in `CTRL`; everything else is an SIE command.
//! SIE handshake timeouts are counted and turned into "nothing transferred",
//! which the protocol layer treats like any other short packet.

use crate::arch;
use crate::endpoint::{
    max_packet_size, EndpointIo, Interrupts, UsbController, EP0_OUT, NUM_PHYSICAL_ENDPOINTS,
};
use crate::regs::{
    ctrl_for_endpoint, DevInt, Reg, UsbRegs, CTRL_RD_EN, CTRL_WR_EN, RXPLEN_DATA_VALID,
    RXPLEN_LENGTH_MASK,
};
use crate::sie::{DeviceStatus, EpSelect, EpStatus, Sie, SieError, SIE_SPIN_LIMIT};

pub struct Lpc13xxUsb {
    sie: Sie,
    sie_timeouts: u32,
}

impl Lpc13xxUsb {
    pub fn new(sie: Sie) -> Self {
        Self {
            sie,
            sie_timeouts: 0,
        }
    }

    /// # Safety
    ///
    /// Caller must own the USB peripheral and have powered and clocked it.
    #[cfg(feature = "chip-lpc1343")]
    pub unsafe fn lpc1343() -> Self {
        Self::new(Sie::new(UsbRegs::lpc1343()))
    }

    /// Puts the controller into the default state: address 0, unconfigured,
    /// with frame, device status and endpoint interrupts enabled.
    pub fn init(&mut self) {
        let regs = self.sie.regs();
        regs.clear_interrupts(DevInt::all());
        regs.enable_interrupts(DevInt::FRAME | DevInt::DEV_STAT | DevInt::ALL_ENDPOINTS);
        let r = self
            .sie
            .set_address(0)
            .and_then(|()| self.sie.configure_device(false))
            .and_then(|()| self.sie.set_mode(0));
        self.check(r);
    }

    /// Number of SIE handshakes that never completed.
    pub fn sie_timeouts(&self) -> u32 {
        self.sie_timeouts
    }

    fn check<T>(&mut self, r: Result<T, SieError>) -> Option<T> {
        match r {
            Ok(v) => Some(v),
            Err(SieError::Timeout) => {
                self.sie_timeouts = self.sie_timeouts.wrapping_add(1);
                None
            }
        }
    }

    fn select(&mut self, physical: u8) -> EpSelect {
        let r = self.sie.select_endpoint(physical);
        self.check(r).unwrap_or(EpSelect::empty())
    }

    fn wait_rx_valid(&self) -> Option<u32> {
        let regs = self.sie.regs();
        for _ in 0..SIE_SPIN_LIMIT {
            let plen = regs.read(Reg::RxPLen);
            if plen & RXPLEN_DATA_VALID != 0 {
                return Some(plen);
            }
            arch::relax();
        }
        None
    }
}

impl EndpointIo for Lpc13xxUsb {
    fn read(&mut self, physical: u8, buf: &mut [u8]) -> usize {
        let regs = self.sie.regs();
        regs.write(Reg::Ctrl, ctrl_for_endpoint(physical >> 1, CTRL_RD_EN));
        let Some(plen) = self.wait_rx_valid() else {
            self.sie.regs().write(Reg::Ctrl, 0);
            self.sie_timeouts = self.sie_timeouts.wrapping_add(1);
            return 0;
        };
        let len = (plen & RXPLEN_LENGTH_MASK) as usize;
        let regs = self.sie.regs();
        // The FIFO must be drained by whole words even past what fits.
        for offset in (0..len).step_by(4) {
            let word = regs.read(Reg::RxData).to_le_bytes();
            for (i, b) in word.iter().enumerate().take(len - offset) {
                if let Some(slot) = buf.get_mut(offset + i) {
                    *slot = *b;
                }
            }
        }
        regs.write(Reg::Ctrl, 0);
        let r = self.sie.select_endpoint(physical).and_then(|_| self.sie.clear_buffer());
        self.check(r);
        len.min(buf.len())
    }

    fn write(&mut self, physical: u8, data: &[u8]) -> usize {
        let data = &data[..data.len().min(max_packet_size(physical))];
        let regs = self.sie.regs();
        regs.write(Reg::Ctrl, ctrl_for_endpoint(physical >> 1, CTRL_WR_EN));
        regs.write(Reg::TxPLen, data.len() as u32);
        for chunk in data.chunks(4) {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            regs.write(Reg::TxData, u32::from_le_bytes(word));
        }
        regs.write(Reg::Ctrl, 0);
        let r = self.sie.select_endpoint(physical).and_then(|_| self.sie.validate_buffer());
        match self.check(r) {
            Some(()) => data.len(),
            None => 0,
        }
    }

    fn set_stall(&mut self, physical: u8, stalled: bool) {
        let status = if stalled { EpStatus::STALLED } else { EpStatus::empty() };
        let r = self.sie.set_endpoint_status(physical, status);
        self.check(r);
    }

    fn is_stalled(&mut self, physical: u8) -> bool {
        self.select(physical).contains(EpSelect::STALLED)
    }

    fn is_full(&mut self, physical: u8) -> bool {
        self.select(physical).contains(EpSelect::FULL)
    }
}

impl UsbController for Lpc13xxUsb {
    fn set_address(&mut self, address: u8) {
        let r = self.sie.set_address(address);
        self.check(r);
    }

    fn set_configured(&mut self, configured: bool) {
        let r = self.sie.configure_device(configured);
        self.check(r);
    }

    fn set_connected(&mut self, connected: bool) {
        let status = if connected { DeviceStatus::CONNECT } else { DeviceStatus::empty() };
        let r = self.sie.set_device_status(status);
        self.check(r);
    }

    fn take_interrupts(&mut self) -> Interrupts {
        let mut out = Interrupts::default();
        let pending = self.sie.regs().interrupts();

        if pending.contains(DevInt::FRAME) {
            self.sie.regs().clear_interrupts(DevInt::FRAME);
            out.frame = true;
        }

        if pending.contains(DevInt::DEV_STAT) {
            self.sie.regs().clear_interrupts(DevInt::DEV_STAT);
            let r = self.sie.device_status();
            if let Some(status) = self.check(r) {
                out.reset = status.contains(DeviceStatus::RESET);
                if status.contains(DeviceStatus::SUSPEND_CHANGED) {
                    out.suspend = Some(status.contains(DeviceStatus::SUSPEND));
                }
            }
        }

        for physical in 0..NUM_PHYSICAL_ENDPOINTS {
            let bit = DevInt::endpoint(physical);
            if !pending.contains(bit) {
                continue;
            }
            self.sie.regs().clear_interrupts(bit);
            let r = self.sie.select_endpoint_clear_interrupt(physical);
            let Some(sel) = self.check(r) else {
                continue;
            };
            if physical == EP0_OUT && sel.contains(EpSelect::SETUP) {
                out.setup = true;
            }
            out.endpoints |= 1 << physical;
        }
        out
    }

    fn trigger(&mut self, physical: u8) {
        self.sie.regs().set_interrupts(DevInt::endpoint(physical));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::BLOCK_WORDS;

    const fn word(reg: Reg) -> usize {
        reg as usize / 4
    }

    fn ready_block() -> [u32; BLOCK_WORDS] {
        let mut block = [0u32; BLOCK_WORDS];
        block[word(Reg::DevIntSt)] = (DevInt::CC_EMPTY | DevInt::CD_FULL).bits();
        block
    }

    fn usb(block: &mut [u32; BLOCK_WORDS]) -> Lpc13xxUsb {
        let regs = unsafe { UsbRegs::from_base(block.as_mut_ptr()) };
        Lpc13xxUsb::new(Sie::new(regs).with_spin_limit(8))
    }

    #[test]
    fn read_drains_whole_words() {
        let mut block = ready_block();
        block[word(Reg::RxPLen)] = RXPLEN_DATA_VALID | 5;
        block[word(Reg::RxData)] = 0x4433_2211;
        let mut usb = usb(&mut block);
        let mut buf = [0; 8];
        assert_eq!(usb.read(4, &mut buf), 5);
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44, 0x11, 0, 0, 0]);
        assert_eq!(usb.sie_timeouts(), 0);

        let mut small = [0; 2];
        assert_eq!(usb.read(4, &mut small), 2);
        assert_eq!(small, [0x11, 0x22]);
        assert_eq!(block[word(Reg::Ctrl)], 0);
    }

    #[test]
    fn write_packs_words_and_clamps() {
        let mut block = ready_block();
        let mut usb = usb(&mut block);
        assert_eq!(usb.write(3, &[1, 2, 3, 4, 5]), 5);
        assert_eq!(block[word(Reg::TxPLen)], 5);
        assert_eq!(block[word(Reg::TxData)], 0x0000_0005);

        let big = [0xA5; 100];
        assert_eq!(usb.write(1, &big), 64);
        assert_eq!(block[word(Reg::TxPLen)], 64);
    }

    #[test]
    fn setup_flag_comes_from_select_endpoint() {
        let mut block = ready_block();
        block[word(Reg::DevIntSt)] |= (DevInt::EP0 | DevInt::FRAME).bits();
        block[word(Reg::CmdData)] = (EpSelect::FULL | EpSelect::SETUP).bits().into();
        let mut usb = usb(&mut block);
        let irq = usb.take_interrupts();
        assert!(irq.frame);
        assert!(irq.setup);
        assert!(irq.endpoint(EP0_OUT));
        assert!(!irq.endpoint(1));
        assert!(!irq.reset);
    }

    #[test]
    fn bus_reset_from_device_status() {
        let mut block = ready_block();
        block[word(Reg::DevIntSt)] |= DevInt::DEV_STAT.bits();
        let status = DeviceStatus::CONNECT | DeviceStatus::RESET | DeviceStatus::SUSPEND_CHANGED;
        block[word(Reg::CmdData)] = status.bits().into();
        let mut usb = usb(&mut block);
        let irq = usb.take_interrupts();
        assert!(irq.reset);
        assert_eq!(irq.suspend, Some(false));
        assert_eq!(irq.endpoints, 0);
    }

    #[test]
    fn dead_engine_reads_nothing() {
        let mut block = [0u32; BLOCK_WORDS];
        let mut usb = usb(&mut block);
        let mut buf = [0xEE; 4];
        assert_eq!(usb.read(0, &mut buf), 0);
        assert_eq!(buf, [0xEE; 4]);
        assert!(!usb.is_stalled(1));
        assert_eq!(usb.write(1, &[1]), 0);
        assert!(usb.sie_timeouts() >= 3);
    }
}
