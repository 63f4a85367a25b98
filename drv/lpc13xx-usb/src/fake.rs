//! A recording controller for exercising the protocol layers on the host.

use std::collections::{HashMap, VecDeque};
use std::vec::Vec;

use zerocopy::IntoBytes;

use crate::endpoint::{EndpointIo, Interrupts, UsbController, EP0_OUT};
use crate::protocol::SetupPacket;

#[derive(Default)]
pub struct FakeUsb {
    /// Returned (and cleared) by the next `take_interrupts`.
    pub pending: Interrupts,
    pub address: u8,
    pub configured: bool,
    pub connected: bool,
    pub triggered: Vec<u8>,
    /// IN endpoints reported as having no free buffer.
    pub full: u16,
    stalls: u16,
    rx: HashMap<u8, VecDeque<Vec<u8>>>,
    tx: HashMap<u8, Vec<Vec<u8>>>,
}

impl FakeUsb {
    pub fn setup(&mut self, setup: SetupPacket) {
        self.setup_raw(setup.as_bytes());
    }

    pub fn setup_raw(&mut self, bytes: &[u8]) {
        self.rx.entry(EP0_OUT).or_default().push_back(bytes.to_vec());
        self.pending.setup = true;
        self.pending.endpoints |= 1 << EP0_OUT;
    }

    /// A non-SETUP packet on EP0 OUT.
    pub fn out(&mut self, data: &[u8]) {
        self.out_on(EP0_OUT, data);
    }

    pub fn out_on(&mut self, physical: u8, data: &[u8]) {
        self.rx.entry(physical).or_default().push_back(data.to_vec());
        self.pending.endpoints |= 1 << physical;
    }

    /// The host took the packet queued on `physical`.
    pub fn in_done(&mut self, physical: u8) {
        self.pending.endpoints |= 1 << physical;
    }

    pub fn frame(&mut self) {
        self.pending.frame = true;
    }

    pub fn packets(&self, physical: u8) -> Vec<Vec<u8>> {
        self.tx.get(&physical).cloned().unwrap_or_default()
    }

    pub fn clear_log(&mut self) {
        self.tx.clear();
    }

    pub fn stalled(&self, physical: u8) -> bool {
        self.stalls & (1 << physical) != 0
    }

    pub fn set_stall_flag(&mut self, physical: u8, stalled: bool) {
        self.set_stall(physical, stalled);
    }
}

impl EndpointIo for FakeUsb {
    fn read(&mut self, physical: u8, buf: &mut [u8]) -> usize {
        let Some(packet) = self.rx.get_mut(&physical).and_then(VecDeque::pop_front) else {
            return 0;
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        n
    }

    fn write(&mut self, physical: u8, data: &[u8]) -> usize {
        self.tx.entry(physical).or_default().push(data.to_vec());
        data.len()
    }

    fn set_stall(&mut self, physical: u8, stalled: bool) {
        if stalled {
            self.stalls |= 1 << physical;
        } else {
            self.stalls &= !(1 << physical);
        }
    }

    fn is_stalled(&mut self, physical: u8) -> bool {
        self.stalled(physical)
    }

    fn is_full(&mut self, physical: u8) -> bool {
        self.full & (1 << physical) != 0
    }
}

impl UsbController for FakeUsb {
    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn set_configured(&mut self, configured: bool) {
        self.configured = configured;
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn take_interrupts(&mut self) -> Interrupts {
        core::mem::take(&mut self.pending)
    }

    fn trigger(&mut self, physical: u8) {
        self.triggered.push(physical);
    }
}
