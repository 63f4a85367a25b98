//! Endpoint addressing and the hardware seam the protocol engine runs on.

/// Physical endpoints are numbered `logical * 2 + direction`, with OUT even
/// and IN odd. EP0 OUT is 0 and EP0 IN is 1.
pub const EP0_OUT: u8 = 0;
pub const EP0_IN: u8 = 1;

pub const NUM_PHYSICAL_ENDPOINTS: u8 = 8;

pub const MAX_CONTROL_PACKET: usize = 64;
pub const MAX_BULK_PACKET: usize = 64;
pub const MAX_ISOCHRONOUS_PACKET: usize = 512;

/// `bEndpointAddress` (bit 7 = IN) to physical index.
pub fn physical_from_address(address: u8) -> u8 {
    ((address & 0x0F) << 1) | (address >> 7)
}

/// Physical index to `bEndpointAddress`.
#[cfg(test)]
pub fn address_from_physical(physical: u8) -> u8 {
    ((physical & 1) << 7) | (physical >> 1)
}

#[cfg(test)]
pub fn is_in(physical: u8) -> bool {
    physical & 1 != 0
}

pub fn max_packet_size(physical: u8) -> usize {
    match physical >> 1 {
        0 => MAX_CONTROL_PACKET,
        3 => MAX_ISOCHRONOUS_PACKET,
        _ => MAX_BULK_PACKET,
    }
}

/// Packet-level access to endpoint buffers.
pub trait EndpointIo {
    /// Copies a received packet into `buf`, truncating to `buf.len()`, and
    /// releases the hardware buffer. Returns the number of bytes copied.
    fn read(&mut self, physical: u8, buf: &mut [u8]) -> usize;

    /// Queues `data` as one IN packet and returns the number of bytes
    /// accepted. An empty slice sends a zero-length packet.
    fn write(&mut self, physical: u8, data: &[u8]) -> usize;

    fn set_stall(&mut self, physical: u8, stalled: bool);

    fn is_stalled(&mut self, physical: u8) -> bool;

    /// For OUT endpoints, a packet is waiting; for IN endpoints, no buffer
    /// is free.
    fn is_full(&mut self, physical: u8) -> bool;
}

/// Interrupt causes collected by [`UsbController::take_interrupts`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Interrupts {
    pub frame: bool,
    pub reset: bool,
    /// `Some(true)` on suspend, `Some(false)` on resume.
    pub suspend: Option<bool>,
    /// EP0 OUT carried a SETUP packet.
    pub setup: bool,
    /// One bit per physical endpoint that needs service.
    pub endpoints: u16,
}

impl Interrupts {
    pub fn endpoint(&self, physical: u8) -> bool {
        self.endpoints & (1 << physical) != 0
    }
}

/// Device-level controls the control pipe needs beyond packet I/O.
pub trait UsbController: EndpointIo {
    fn set_address(&mut self, address: u8);

    fn set_configured(&mut self, configured: bool);

    fn set_connected(&mut self, connected: bool);

    /// Reads and acknowledges everything pending. Called once per hardware
    /// interrupt.
    fn take_interrupts(&mut self) -> Interrupts;

    /// Asks for `physical` to be serviced on the next interrupt even though
    /// the host hasn't touched it.
    fn trigger(&mut self, physical: u8);
}
