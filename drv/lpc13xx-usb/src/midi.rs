//! USB-MIDI streaming behaviour.
//!
//! Both directions carry 4-byte event packets: a header holding the cable
//! number and Code Index Number (CIN), then up to three MIDI bytes. Incoming
//! packets are decoded and handed to a [`MidiHandler`]; outgoing ones are
//! queued in a [`MidiState`] and sent whenever the IN endpoint is free or a
//! frame starts.

use core::cell::RefCell;

use heapless::{Deque, Vec};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::behaviour::Behaviour;
use crate::endpoint::{physical_from_address, EndpointIo, MAX_BULK_PACKET};

pub const PACKET_SIZE: usize = 4;

/// SysEx bytes buffered before they are passed on with `more` set.
pub const SYSEX_CHUNK: usize = 32;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;

pub type EventPacket = [u8; PACKET_SIZE];

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CodeIndex {
    Misc = 0x0,
    CableEvent = 0x1,
    SystemCommon2 = 0x2,
    SystemCommon3 = 0x3,
    SysExStart = 0x4,
    SysExEnd1 = 0x5,
    SysExEnd2 = 0x6,
    SysExEnd3 = 0x7,
    NoteOff = 0x8,
    NoteOn = 0x9,
    PolyPressure = 0xA,
    ControlChange = 0xB,
    ProgramChange = 0xC,
    ChannelPressure = 0xD,
    PitchBend = 0xE,
    SingleByte = 0xF,
}

/// Not enough room in the outgoing queue for the whole message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FifoFull;

fn header(cable: u8, cin: CodeIndex) -> u8 {
    (cable & 0xF) << 4 | cin as u8
}

fn channel_packet(cable: u8, cin: CodeIndex, channel: u8, a: u8, b: u8) -> EventPacket {
    [header(cable, cin), (cin as u8) << 4 | (channel & 0xF), a & 0x7F, b & 0x7F]
}

/// Outgoing packet queue shared between the application and the behaviour.
pub struct MidiState<const N: usize> {
    tx: RefCell<Deque<EventPacket, N>>,
}

impl<const N: usize> Default for MidiState<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MidiState<N> {
    pub fn new() -> Self {
        Self {
            tx: RefCell::new(Deque::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn clear(&self) {
        self.tx.borrow_mut().clear();
    }

    pub fn send_packet(&self, packet: EventPacket) -> Result<(), FifoFull> {
        self.tx.borrow_mut().push_back(packet).map_err(|_| FifoFull)
    }

    pub fn note_on(&self, cable: u8, channel: u8, note: u8, velocity: u8) -> Result<(), FifoFull> {
        self.send_packet(channel_packet(cable, CodeIndex::NoteOn, channel, note, velocity))
    }

    pub fn note_off(&self, cable: u8, channel: u8, note: u8, velocity: u8) -> Result<(), FifoFull> {
        self.send_packet(channel_packet(cable, CodeIndex::NoteOff, channel, note, velocity))
    }

    pub fn control_change(
        &self,
        cable: u8,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> Result<(), FifoFull> {
        let packet = channel_packet(cable, CodeIndex::ControlChange, channel, controller, value);
        self.send_packet(packet)
    }

    pub fn program_change(&self, cable: u8, channel: u8, program: u8) -> Result<(), FifoFull> {
        self.send_packet(channel_packet(cable, CodeIndex::ProgramChange, channel, program, 0))
    }

    /// `value` is the 14-bit bend amount, 0x2000 being centered.
    pub fn pitch_bend(&self, cable: u8, channel: u8, value: u16) -> Result<(), FifoFull> {
        let lsb = (value & 0x7F) as u8;
        let msb = ((value >> 7) & 0x7F) as u8;
        self.send_packet(channel_packet(cable, CodeIndex::PitchBend, channel, lsb, msb))
    }

    /// Queues a system exclusive message. `payload` is the data between the
    /// F0 and F7 framing bytes, which are added here.
    pub fn sysex(&self, cable: u8, payload: &[u8]) -> Result<(), FifoFull> {
        let total = payload.len() + 2;
        let packets = total.div_ceil(3);
        let mut tx = self.tx.borrow_mut();
        if N - tx.len() < packets {
            return Err(FifoFull);
        }

        let byte_at = |i: usize| match i {
            0 => SYSEX_START,
            i if i == total - 1 => SYSEX_END,
            i => payload[i - 1] & 0x7F,
        };
        let mut i = 0;
        while i < total {
            let n = (total - i).min(3);
            let cin = match (total - i, n) {
                (rest, _) if rest > 3 => CodeIndex::SysExStart,
                (_, 1) => CodeIndex::SysExEnd1,
                (_, 2) => CodeIndex::SysExEnd2,
                _ => CodeIndex::SysExEnd3,
            };
            let mut p = [header(cable, cin), 0, 0, 0];
            for k in 0..n {
                p[1 + k] = byte_at(i + k);
            }
            // Room was checked above.
            let _ = tx.push_back(p);
            i += n;
        }
        Ok(())
    }
}

/// Receives decoded messages. Channels are 0-based. All methods default to
/// ignoring the message.
pub trait MidiHandler {
    fn note_on(&self, _cable: u8, _channel: u8, _note: u8, _velocity: u8) {}
    fn note_off(&self, _cable: u8, _channel: u8, _note: u8, _velocity: u8) {}
    fn poly_pressure(&self, _cable: u8, _channel: u8, _note: u8, _pressure: u8) {}
    fn control_change(&self, _cable: u8, _channel: u8, _controller: u8, _value: u8) {}
    fn program_change(&self, _cable: u8, _channel: u8, _program: u8) {}
    fn channel_pressure(&self, _cable: u8, _channel: u8, _pressure: u8) {}
    fn pitch_bend(&self, _cable: u8, _channel: u8, _value: u16) {}

    /// A piece of a system exclusive message without its framing bytes.
    /// `more` is false on the final piece.
    fn sysex(&self, _cable: u8, _data: &[u8], _more: bool) {}

    /// Real-time bytes (clock, start, stop...).
    fn realtime(&self, _cable: u8, _status: u8) {}
}

pub struct MidiBehaviour<'a, const N: usize> {
    interface: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    state: &'a MidiState<N>,
    handler: Option<&'a dyn MidiHandler>,
    sysex: Vec<u8, SYSEX_CHUNK>,
    sysex_cable: Option<u8>,
}

impl<'a, const N: usize> MidiBehaviour<'a, N> {
    /// `interface` is the MIDI streaming interface; endpoints are given as
    /// addresses.
    pub fn new(interface: u8, in_endpoint: u8, out_endpoint: u8, state: &'a MidiState<N>) -> Self {
        Self {
            interface,
            in_endpoint: physical_from_address(in_endpoint),
            out_endpoint: physical_from_address(out_endpoint),
            state,
            handler: None,
            sysex: Vec::new(),
            sysex_cable: None,
        }
    }

    pub fn with_handler(mut self, handler: &'a dyn MidiHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    fn drain(&self, io: &mut dyn EndpointIo) {
        if io.is_full(self.in_endpoint) || io.is_stalled(self.in_endpoint) {
            return;
        }
        let mut buf = [0; MAX_BULK_PACKET];
        let mut n = 0;
        for p in self.state.tx.borrow().iter().take(MAX_BULK_PACKET / PACKET_SIZE) {
            buf[n..n + PACKET_SIZE].copy_from_slice(p);
            n += PACKET_SIZE;
        }
        if n == 0 {
            return;
        }
        let sent = io.write(self.in_endpoint, &buf[..n]) / PACKET_SIZE;
        let mut tx = self.state.tx.borrow_mut();
        for _ in 0..sent {
            tx.pop_front();
        }
    }

    fn sysex_bytes(&mut self, handler: &dyn MidiHandler, cable: u8, bytes: &[u8], last: bool) {
        if self.sysex_cable != Some(cable) {
            // A new stream on another cable cuts off the previous one.
            self.sysex_flush(handler, false);
            self.sysex_cable = Some(cable);
        }
        for &b in bytes.iter().filter(|&&b| b < 0x80) {
            if self.sysex.is_full() {
                handler.sysex(cable, &self.sysex, true);
                self.sysex.clear();
            }
            // Can't fail: just made room.
            let _ = self.sysex.push(b);
        }
        if last {
            self.sysex_flush(handler, true);
        }
    }

    fn sysex_flush(&mut self, handler: &dyn MidiHandler, complete: bool) {
        if let Some(cable) = self.sysex_cable.take() {
            if complete || !self.sysex.is_empty() {
                handler.sysex(cable, &self.sysex, false);
            }
        }
        self.sysex.clear();
    }

    fn decode(&mut self, packet: &[u8]) {
        let Some(handler) = self.handler else {
            return;
        };
        let cable = packet[0] >> 4;
        let Some(cin) = CodeIndex::from_u8(packet[0] & 0xF) else {
            return;
        };
        let channel = packet[1] & 0xF;
        let (a, b) = (packet[2], packet[3]);
        match cin {
            CodeIndex::NoteOff => handler.note_off(cable, channel, a, b),
            CodeIndex::NoteOn => handler.note_on(cable, channel, a, b),
            CodeIndex::PolyPressure => handler.poly_pressure(cable, channel, a, b),
            CodeIndex::ControlChange => handler.control_change(cable, channel, a, b),
            CodeIndex::ProgramChange => handler.program_change(cable, channel, a),
            CodeIndex::ChannelPressure => handler.channel_pressure(cable, channel, a),
            CodeIndex::PitchBend => {
                handler.pitch_bend(cable, channel, u16::from(a) | u16::from(b) << 7)
            }
            CodeIndex::SysExStart => self.sysex_bytes(handler, cable, &packet[1..4], false),
            CodeIndex::SysExEnd1 if packet[1] == SYSEX_END || self.sysex_cable == Some(cable) => {
                self.sysex_bytes(handler, cable, &packet[1..2], true)
            }
            CodeIndex::SysExEnd2 => self.sysex_bytes(handler, cable, &packet[1..3], true),
            CodeIndex::SysExEnd3 => self.sysex_bytes(handler, cable, &packet[1..4], true),
            CodeIndex::SingleByte if packet[1] >= 0xF8 => handler.realtime(cable, packet[1]),
            _ => {}
        }
    }

    fn receive(&mut self, io: &mut dyn EndpointIo) {
        let mut buf = [0; MAX_BULK_PACKET];
        let n = io.read(self.out_endpoint, &mut buf);
        for packet in buf[..n].chunks_exact(PACKET_SIZE) {
            self.decode(packet);
        }
    }
}

impl<'a, 'm: 'a, const N: usize> Behaviour<'a> for MidiBehaviour<'m, N> {
    fn endpoint_data(&mut self, io: &mut dyn EndpointIo, physical: u8) -> bool {
        if physical == self.in_endpoint {
            self.drain(io);
            true
        } else if physical == self.out_endpoint {
            self.receive(io);
            true
        } else {
            false
        }
    }

    fn frame(&mut self, io: &mut dyn EndpointIo) {
        self.drain(io);
    }

    fn config_change(&mut self, _configuration: u8) {
        self.state.clear();
        self.sysex.clear();
        self.sysex_cable = None;
    }

    fn interface_alt(&mut self, interface: u8, alt: u8) -> bool {
        interface == self.interface && alt == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbDevice;
    use crate::fake::FakeUsb;
    use crate::protocol::{DeviceDescriptor, DeviceDescriptors};
    use std::vec::Vec as StdVec;
    use zerocopy::IntoBytes;

    // IN 0x81 (physical 3), OUT 0x01 (physical 2).
    const EP_IN: u8 = 3;
    const EP_OUT: u8 = 2;

    #[derive(Debug, Eq, PartialEq)]
    enum Msg {
        On(u8, u8, u8, u8),
        Off(u8, u8, u8),
        Cc(u8, u8, u8),
        Bend(u8, u16),
        SysEx(u8, StdVec<u8>, bool),
        Clock,
    }

    #[derive(Default)]
    struct Log(RefCell<StdVec<Msg>>);

    impl MidiHandler for Log {
        fn note_on(&self, cable: u8, channel: u8, note: u8, velocity: u8) {
            self.0.borrow_mut().push(Msg::On(cable, channel, note, velocity));
        }
        fn note_off(&self, _cable: u8, channel: u8, note: u8, velocity: u8) {
            self.0.borrow_mut().push(Msg::Off(channel, note, velocity));
        }
        fn control_change(&self, _cable: u8, channel: u8, controller: u8, value: u8) {
            self.0.borrow_mut().push(Msg::Cc(channel, controller, value));
        }
        fn pitch_bend(&self, _cable: u8, channel: u8, value: u16) {
            self.0.borrow_mut().push(Msg::Bend(channel, value));
        }
        fn sysex(&self, cable: u8, data: &[u8], more: bool) {
            self.0.borrow_mut().push(Msg::SysEx(cable, data.to_vec(), more));
        }
        fn realtime(&self, _cable: u8, status: u8) {
            if status == 0xF8 {
                self.0.borrow_mut().push(Msg::Clock);
            }
        }
    }

    fn device(desc: &DeviceDescriptor) -> UsbDevice<'_, FakeUsb> {
        UsbDevice::new(
            FakeUsb::default(),
            DeviceDescriptors {
                device: desc.as_bytes(),
                configurations: &[],
                strings: &[],
            },
        )
    }

    #[test]
    fn channel_messages_are_packed() {
        let state = MidiState::<8>::new();
        state.note_on(1, 2, 60, 100).unwrap();
        state.program_change(0, 15, 5).unwrap();
        state.pitch_bend(0, 0, 0x2000).unwrap();
        let tx = state.tx.borrow();
        let got: StdVec<_> = tx.iter().copied().collect();
        assert_eq!(
            got,
            [
                [0x19, 0x92, 60, 100],
                [0x0C, 0xCF, 5, 0],
                [0x0E, 0xE0, 0x00, 0x40],
            ]
        );
    }

    #[test]
    fn sysex_is_split_and_never_partially_queued() {
        let state = MidiState::<4>::new();
        state.sysex(0, &[1, 2, 3, 4]).unwrap();
        {
            let got: StdVec<_> = state.tx.borrow().iter().copied().collect();
            assert_eq!(got, [[0x04, 0xF0, 1, 2], [0x07, 3, 4, 0xF7]]);
        }
        state.clear();
        state.sysex(0, &[]).unwrap();
        assert_eq!(state.tx.borrow().front(), Some(&[0x06, 0xF0, 0xF7, 0]));

        // 9 payload bytes + framing need 4 packets; only 3 slots are left.
        assert_eq!(state.sysex(0, &[0; 9]), Err(FifoFull));
        assert_eq!(state.pending(), 1);
    }

    #[test]
    fn out_packets_reach_the_handler() {
        let desc = DeviceDescriptor::default();
        let state = MidiState::<8>::new();
        let log = Log::default();
        let mut midi = MidiBehaviour::new(1, 0x81, 0x01, &state).with_handler(&log);
        {
            let mut dev = device(&desc);
            dev.add_behaviour(&mut midi).unwrap();
            dev.io_mut().out_on(
                EP_OUT,
                &[
                    0x29, 0x93, 64, 90, // note on, cable 2
                    0x08, 0x83, 64, 0, // note off
                    0x0B, 0xB0, 7, 127, // volume
                    0x0E, 0xE1, 0x7F, 0x7F, // full bend up
                    0x0F, 0xF8, 0, 0, // clock
                ],
            );
            dev.handle_interrupt();
        }
        assert_eq!(
            *log.0.borrow(),
            [
                Msg::On(2, 3, 64, 90),
                Msg::Off(3, 64, 0),
                Msg::Cc(0, 7, 127),
                Msg::Bend(1, 0x3FFF),
                Msg::Clock,
            ]
        );
    }

    #[test]
    fn sysex_is_reassembled_in_chunks() {
        let desc = DeviceDescriptor::default();
        let state = MidiState::<8>::new();
        let log = Log::default();
        let mut midi = MidiBehaviour::new(1, 0x81, 0x01, &state).with_handler(&log);
        let mut dev = device(&desc);
        dev.add_behaviour(&mut midi).unwrap();

        // F0 + 35 data bytes + F7 in 13 packets.
        let mut stream = StdVec::new();
        let mut bytes = vec![0xF0];
        bytes.extend(0..35u8);
        bytes.push(0xF7);
        let chunks: StdVec<_> = bytes.chunks(3).collect();
        for (i, c) in chunks.iter().enumerate() {
            let cin = if i + 1 < chunks.len() { 4 } else { 4 + c.len() as u8 };
            let mut p = [cin, 0, 0, 0];
            p[1..1 + c.len()].copy_from_slice(c);
            stream.extend_from_slice(&p);
        }
        dev.io_mut().out_on(EP_OUT, &stream[..32]);
        dev.io_mut().out_on(EP_OUT, &stream[32..]);
        dev.handle_interrupt();
        dev.service_endpoint(EP_OUT);

        let log = log.0.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], Msg::SysEx(0, (0..32).collect(), true));
        assert_eq!(log[1], Msg::SysEx(0, (32..35).collect(), false));
    }

    #[test]
    fn queue_drains_when_the_endpoint_is_free() {
        let desc = DeviceDescriptor::default();
        let state = MidiState::<32>::new();
        let mut midi = MidiBehaviour::new(1, 0x81, 0x01, &state);
        let mut dev = device(&desc);
        dev.add_behaviour(&mut midi).unwrap();

        for note in 0..20 {
            state.note_on(0, 0, note, 1).unwrap();
        }
        dev.io_mut().full = 1 << EP_IN;
        dev.io_mut().frame();
        dev.handle_interrupt();
        assert_eq!(state.pending(), 20);

        dev.io_mut().full = 0;
        dev.io_mut().frame();
        dev.handle_interrupt();
        assert_eq!(state.pending(), 4);
        assert_eq!(dev.io().packets(EP_IN)[0].len(), 64);

        dev.io_mut().in_done(EP_IN);
        dev.handle_interrupt();
        assert_eq!(state.pending(), 0);
        assert_eq!(dev.io().packets(EP_IN)[1].len(), 16);
    }
}
