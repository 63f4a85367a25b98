//! Device detection, initialization and report decoding.
//!
//! A device announces itself after power-up with a self-test pass (`0xAA`);
//! mice follow it with their id (`0x00`), keyboards say nothing more. Mice
//! are taken through the Intellimouse sample-rate sequence to unlock the
//! wheel and extra buttons, then both kinds get reporting enabled. While
//! running, a device that stays quiet for long enough is pinged, and one
//! that doesn't answer is reset until it comes back.

use bitflags::bitflags;
use heapless::{HistoryBuffer, Vec};
use smart_default::SmartDefault;

use crate::bus::{BusTiming, Ps2Bus};
use crate::cmd::{opcode, CmdEvent, CmdEvents, CmdLimits, Completion, CompletionCode, Ps2Cmd};
use crate::scancodes::{usage, Decoded, ScanDecoder};
use crate::{BusTimer, Pin};

const SELF_TEST_PASSED: u8 = 0xAA;
const MOUSE_ID: u8 = 0x00;
const WHEEL_MOUSE_ID: u8 = 0x03;
const FIVE_BUTTON_MOUSE_ID: u8 = 0x04;

/// Counts are in bus idle heartbeats.
#[derive(Copy, Clone, Debug, Eq, PartialEq, SmartDefault)]
pub struct AppTiming {
    /// Waiting for a mouse id after self-test; after this it's a keyboard.
    #[default = 10]
    pub wait_unknown: u32,
    /// A report still incomplete after this is thrown away.
    #[default = 2]
    pub event_idle_timeout: u32,
    /// Quiet time before a running device is pinged.
    #[default = 20]
    pub idle_ping: u32,
    /// Interval between resets while nothing is connected.
    #[default = 40]
    pub reset_timeout: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    None,
    /// Self-test seen, kind not known yet.
    Unknown,
    InitMouse,
    InitKeyboard,
    RunningMouse,
    RunningKeyboard,
    /// Only before `start`.
    Invalid,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MouseButtons: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const MIDDLE = 1 << 2;
        const BUTTON_4 = 1 << 3;
        const BUTTON_5 = 1 << 4;
    }
}

bitflags! {
    /// Keyboard LEDs, in `SET_LEDS` argument order.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Leds: u8 {
        const SCROLL_LOCK = 1 << 0;
        const NUM_LOCK = 1 << 1;
        const CAPS_LOCK = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MouseInput {
    pub dx: i16,
    pub dy: i16,
    /// Wheel; 0 for mice without one. Taken as the whole signed 4th byte
    /// from wheel mice (id 3), and as a sign-extended low nibble from
    /// five-button mice (id 4), whose upper bits are buttons 4 and 5.
    pub dz: i8,
    pub buttons: MouseButtons,
}

/// Receives what the stack learns. All methods default to doing nothing.
pub trait Ps2Client {
    fn connection_changed(&mut self, _state: ConnectionState) {}
    fn mouse_input(&mut self, _input: MouseInput) {}
    fn keyboard_input(&mut self, _keycode: u8, _down: bool, _leds: Leds) {}
    /// Bus heartbeat while no command is running.
    fn idle(&mut self) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    Connection(ConnectionState),
    UnknownScancode(u8),
    MouseResync(u8),
    Ping,
    Reset,
}

pub const TRACE_DEPTH: usize = 32;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
enum MouseKind {
    #[default]
    Standard,
    Wheel,
    FiveButton,
}

impl MouseKind {
    fn packet_len(self) -> usize {
        match self {
            MouseKind::Standard => 3,
            MouseKind::Wheel | MouseKind::FiveButton => 4,
        }
    }
}

/// The command whose completion we're waiting for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pending {
    Nothing,
    MouseInit(usize),
    KeyboardInit,
    Leds,
    Ping,
    Reset,
}

struct Step {
    command: u8,
    arg: Option<u8>,
    response_len: usize,
}

const fn rate(hz: u8) -> Step {
    Step {
        command: opcode::SET_SAMPLE_RATE,
        arg: Some(hz),
        response_len: 0,
    }
}

const GET_ID: Step = Step {
    command: opcode::GET_DEVICE_ID,
    arg: None,
    response_len: 1,
};

/// Two sample-rate knocks, each followed by an id check, then enable.
static MOUSE_INIT: [Step; 9] = [
    rate(200),
    rate(100),
    rate(80),
    GET_ID,
    rate(200),
    rate(200),
    rate(80),
    GET_ID,
    Step {
        command: opcode::ENABLE_REPORTING,
        arg: None,
        response_len: 0,
    },
];
const FIRST_ID_STEP: usize = 3;
const SECOND_ID_STEP: usize = 7;
const ENABLE_STEP: usize = 8;

pub struct Ps2App<P, T, C> {
    cmd: Ps2Cmd<P, T>,
    client: C,
    timing: AppTiming,
    connection: ConnectionState,
    idle_count: u32,
    pending: Pending,
    mouse: MouseKind,
    packet: Vec<u8, 4>,
    decoder: ScanDecoder,
    leds: Leds,
    leds_dirty: bool,
    trace: HistoryBuffer<Trace, TRACE_DEPTH>,
}

impl<P: Pin, T: BusTimer, C: Ps2Client> Ps2App<P, T, C> {
    pub fn new(
        clock: P,
        data: P,
        timer: T,
        client: C,
        bus_timing: BusTiming,
        limits: CmdLimits,
        timing: AppTiming,
    ) -> Self {
        let bus = Ps2Bus::new(clock, data, timer, bus_timing);
        Self::with_cmd(Ps2Cmd::with_bus(bus, limits), client, timing)
    }

    pub fn with_cmd(cmd: Ps2Cmd<P, T>, client: C, timing: AppTiming) -> Self {
        Self {
            cmd,
            client,
            timing,
            connection: ConnectionState::Invalid,
            idle_count: 0,
            pending: Pending::Nothing,
            mouse: MouseKind::Standard,
            packet: Vec::new(),
            decoder: ScanDecoder::default(),
            leds: Leds::empty(),
            leds_dirty: false,
            trace: HistoryBuffer::new(),
        }
    }

    /// Releases the bus and reports `None` to the client.
    pub fn start(&mut self) {
        self.cmd.start();
        self.goto(ConnectionState::None);
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn leds(&self) -> Leds {
        self.leds
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn cmd(&self) -> &Ps2Cmd<P, T> {
        &self.cmd
    }

    pub fn trace(&self) -> impl Iterator<Item = &Trace> + '_ {
        self.trace.oldest_ordered()
    }

    /// Falling edge on the clock line.
    pub fn on_clock_edge(&mut self) {
        let events = self.cmd.on_clock_edge();
        self.process(events);
    }

    /// Bus timer expiry.
    pub fn on_timer(&mut self) {
        let events = self.cmd.on_timer();
        self.process(events);
    }

    /// Sets the keyboard LEDs, independent of the lock keys.
    pub fn set_leds(&mut self, leds: Leds) {
        self.leds = leds;
        self.send_leds();
    }

    fn process(&mut self, events: CmdEvents) {
        for event in events {
            match event {
                CmdEvent::Completed(done) => self.completed(done),
                CmdEvent::Data(byte) => self.data(byte),
                CmdEvent::Idle => self.idle(),
            }
        }
    }

    fn goto(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        self.connection = state;
        self.idle_count = 0;
        self.packet.clear();
        self.decoder.reset();
        self.trace.write(Trace::Connection(state));
        self.client.connection_changed(state);
        match state {
            ConnectionState::InitKeyboard => {
                if !self.send(opcode::ENABLE_REPORTING, &[], 0, Pending::KeyboardInit) {
                    self.goto(ConnectionState::None);
                }
            }
            ConnectionState::InitMouse => {
                self.mouse = MouseKind::Standard;
                self.mouse_step(0);
            }
            _ => {}
        }
    }

    fn send(&mut self, command: u8, args: &[u8], response_len: usize, pending: Pending) -> bool {
        let sent = self.cmd.send_command(command, args, response_len).is_ok();
        if sent {
            self.pending = pending;
        }
        sent
    }

    fn mouse_step(&mut self, step: usize) {
        let Some(s) = MOUSE_INIT.get(step) else {
            return;
        };
        let args = s.arg.as_slice();
        if !self.send(s.command, args, s.response_len, Pending::MouseInit(step)) {
            self.goto(ConnectionState::None);
        }
    }

    fn completed(&mut self, done: Completion) {
        let pending = core::mem::replace(&mut self.pending, Pending::Nothing);
        let ok = done.code == CompletionCode::Ok;
        match pending {
            Pending::MouseInit(step) if ok => {
                let id = done.response.first().copied();
                let next = match step {
                    FIRST_ID_STEP if id == Some(WHEEL_MOUSE_ID) => {
                        self.mouse = MouseKind::Wheel;
                        step + 1
                    }
                    FIRST_ID_STEP => {
                        if id == Some(FIVE_BUTTON_MOUSE_ID) {
                            self.mouse = MouseKind::FiveButton;
                        }
                        ENABLE_STEP
                    }
                    SECOND_ID_STEP => {
                        if id == Some(FIVE_BUTTON_MOUSE_ID) {
                            self.mouse = MouseKind::FiveButton;
                        }
                        ENABLE_STEP
                    }
                    ENABLE_STEP => {
                        self.goto(ConnectionState::RunningMouse);
                        return;
                    }
                    _ => step + 1,
                };
                self.mouse_step(next);
            }
            Pending::KeyboardInit if ok => {
                self.goto(ConnectionState::RunningKeyboard);
                self.send_leds();
            }
            Pending::MouseInit(_) | Pending::KeyboardInit => self.goto(ConnectionState::None),
            Pending::Ping if !ok => {
                self.goto(ConnectionState::None);
                self.reset_device();
            }
            Pending::Nothing | Pending::Leds | Pending::Ping | Pending::Reset => {}
        }
    }

    fn data(&mut self, byte: u8) {
        self.idle_count = 0;
        match self.connection {
            ConnectionState::None if byte == SELF_TEST_PASSED => {
                self.goto(ConnectionState::Unknown)
            }
            ConnectionState::Unknown if byte == MOUSE_ID => self.goto(ConnectionState::InitMouse),
            ConnectionState::RunningMouse => self.mouse_byte(byte),
            ConnectionState::RunningKeyboard => self.keyboard_byte(byte),
            _ => {}
        }
    }

    fn idle(&mut self) {
        self.idle_count = self.idle_count.saturating_add(1);
        self.client.idle();
        match self.connection {
            ConnectionState::None => {
                if self.idle_count >= self.timing.reset_timeout {
                    self.idle_count = 0;
                    self.reset_device();
                }
            }
            ConnectionState::Unknown => {
                if self.idle_count > self.timing.wait_unknown {
                    self.goto(ConnectionState::InitKeyboard);
                }
            }
            ConnectionState::RunningMouse | ConnectionState::RunningKeyboard => {
                if self.idle_count >= self.timing.event_idle_timeout {
                    self.packet.clear();
                    self.decoder.reset();
                }
                if self.leds_dirty {
                    self.send_leds();
                } else if self.idle_count >= self.timing.idle_ping {
                    self.idle_count = 0;
                    if self.send(opcode::ENABLE_REPORTING, &[], 0, Pending::Ping) {
                        self.trace.write(Trace::Ping);
                    }
                }
            }
            _ => {}
        }
    }

    fn reset_device(&mut self) {
        if self.send(opcode::RESET, &[], 0, Pending::Reset) {
            self.trace.write(Trace::Reset);
        }
    }

    fn send_leds(&mut self) {
        if self.connection != ConnectionState::RunningKeyboard {
            return;
        }
        let leds = self.leds.bits();
        self.leds_dirty = !self.send(opcode::SET_LEDS, &[leds], 0, Pending::Leds);
    }

    fn mouse_byte(&mut self, byte: u8) {
        // Bit 3 of the first byte is always set; use it to find packet
        // boundaries again after a lost byte.
        if self.packet.is_empty() && byte & 0x08 == 0 {
            self.trace.write(Trace::MouseResync(byte));
            return;
        }
        let _ = self.packet.push(byte);
        if self.packet.len() < self.mouse.packet_len() {
            return;
        }
        let p = &self.packet;
        let mut buttons = MouseButtons::from_bits_truncate(p[0] & 0x07);
        let dx = i16::from(p[1]) - if p[0] & 0x10 != 0 { 256 } else { 0 };
        let dy = i16::from(p[2]) - if p[0] & 0x20 != 0 { 256 } else { 0 };
        let dz = match self.mouse {
            MouseKind::Standard => 0,
            MouseKind::Wheel => p[3] as i8,
            MouseKind::FiveButton => {
                if p[3] & 0x10 != 0 {
                    buttons |= MouseButtons::BUTTON_4;
                }
                if p[3] & 0x20 != 0 {
                    buttons |= MouseButtons::BUTTON_5;
                }
                // Sign-extend the low nibble.
                ((p[3] << 4) as i8) >> 4
            }
        };
        self.packet.clear();
        self.client.mouse_input(MouseInput { dx, dy, dz, buttons });
    }

    fn keyboard_byte(&mut self, byte: u8) {
        match self.decoder.feed(byte) {
            Decoded::Key { usage, down } => {
                if down {
                    let lock = match usage {
                        usage::CAPS_LOCK => Leds::CAPS_LOCK,
                        usage::NUM_LOCK => Leds::NUM_LOCK,
                        usage::SCROLL_LOCK => Leds::SCROLL_LOCK,
                        _ => Leds::empty(),
                    };
                    if !lock.is_empty() {
                        self.leds.toggle(lock);
                        self.send_leds();
                    }
                }
                self.client.keyboard_input(usage, down, self.leds);
            }
            Decoded::Pause => {
                self.client.keyboard_input(usage::PAUSE, true, self.leds);
                self.client.keyboard_input(usage::PAUSE, false, self.leds);
            }
            Decoded::Unknown(code) => self.trace.write(Trace::UnknownScancode(code)),
            Decoded::Pending | Decoded::Ignored => {}
        }
    }
}
