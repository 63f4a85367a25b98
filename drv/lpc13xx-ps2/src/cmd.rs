//! Command transactions on top of the bus.
//!
//! A command is an opcode plus up to three argument bytes. Each byte has to
//! make it across the wire and then be acknowledged by the device with
//! `0xFA`; after the last one, the device may owe us a fixed number of
//! response bytes. A `RESEND` or a framing error costs one retry, an `ERROR`
//! fails the command outright, and a command that sees too many idle
//! heartbeats times out.
//!
//! Bytes the device sends while no command is running are unsolicited data
//! and are passed up as such.

use heapless::{HistoryBuffer, Vec};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use smart_default::SmartDefault;

use crate::bus::{BusEvent, BusEvents, BusTiming, Ps2Bus};
use crate::{BusTimer, Pin};

pub const MAX_COMMAND_LEN: usize = 4;
pub const MAX_RESPONSE_LEN: usize = 4;

/// Command opcodes understood by keyboards and mice.
pub mod opcode {
    pub const RESET: u8 = 0xFF;
    pub const SET_DEFAULTS: u8 = 0xF6;
    pub const DISABLE_REPORTING: u8 = 0xF5;
    pub const ENABLE_REPORTING: u8 = 0xF4;
    /// Keyboard; one argument, see `app::Leds`.
    pub const SET_LEDS: u8 = 0xED;
    /// Mouse sample rate, or keyboard typematic rate/delay.
    pub const SET_SAMPLE_RATE: u8 = 0xF3;
    pub const SET_RESOLUTION: u8 = 0xE8;
    pub const SET_SCALING_2_1: u8 = 0xE7;
    pub const SET_SCALING_1_1: u8 = 0xE6;
    /// Mouse; one response byte.
    pub const GET_DEVICE_ID: u8 = 0xF2;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ack = 0xFA,
    Resend = 0xFE,
    Error = 0xFC,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, SmartDefault)]
pub struct CmdLimits {
    /// Retries (resends, framing errors, NACKs) before a command fails.
    #[default = 3]
    pub max_errors: u8,
    /// Idle heartbeats a command may span before it times out.
    #[default = 5]
    pub max_idle: u8,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CmdState {
    #[default]
    Idle,
    ReadyToSend,
    WaitForSendAck,
    WaitForDeviceAck,
    WaitForDeviceResponse,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompletionCode {
    Ok,
    Timeout,
    /// Too many errors, or the device answered `ERROR`.
    Fail,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub code: CompletionCode,
    /// Response bytes received so far; complete only when `code` is `Ok`.
    pub response: Vec<u8, MAX_RESPONSE_LEN>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CmdEvent {
    Completed(Completion),
    /// Unsolicited byte from the device.
    Data(u8),
    /// Idle heartbeat with no command running.
    Idle,
}

pub type CmdEvents = Vec<CmdEvent, 2>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendError {
    /// A command is already running.
    Busy,
    CommandTooLong,
    ResponseTooLong,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    Send(u8),
    Retry { errors: u8, idles: u8 },
    Completed(CompletionCode),
}

pub const TRACE_DEPTH: usize = 32;

pub struct Ps2Cmd<P, T> {
    bus: Ps2Bus<P, T>,
    limits: CmdLimits,
    state: CmdState,
    command: Vec<u8, MAX_COMMAND_LEN>,
    offset: usize,
    response: Vec<u8, MAX_RESPONSE_LEN>,
    response_len: usize,
    errors: u8,
    idles: u8,
    trace: HistoryBuffer<Trace, TRACE_DEPTH>,
}

impl<P: Pin, T: BusTimer> Ps2Cmd<P, T> {
    pub fn new(clock: P, data: P, timer: T, timing: BusTiming, limits: CmdLimits) -> Self {
        Self::with_bus(Ps2Bus::new(clock, data, timer, timing), limits)
    }

    pub fn with_bus(bus: Ps2Bus<P, T>, limits: CmdLimits) -> Self {
        Self {
            bus,
            limits,
            state: CmdState::Idle,
            command: Vec::new(),
            offset: 0,
            response: Vec::new(),
            response_len: 0,
            errors: 0,
            idles: 0,
            trace: HistoryBuffer::new(),
        }
    }

    pub fn start(&mut self) {
        self.bus.start();
    }

    pub fn bus(&self) -> &Ps2Bus<P, T> {
        &self.bus
    }

    pub fn state(&self) -> CmdState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != CmdState::Idle
    }

    pub fn trace(&self) -> impl Iterator<Item = &Trace> + '_ {
        self.trace.oldest_ordered()
    }

    /// Starts `command` with `args`, expecting `response_len` bytes back
    /// after the last acknowledge. The result arrives as a
    /// [`CmdEvent::Completed`].
    pub fn send_command(
        &mut self,
        command: u8,
        args: &[u8],
        response_len: usize,
    ) -> Result<(), SendError> {
        if self.is_running() {
            return Err(SendError::Busy);
        }
        if args.len() + 1 > MAX_COMMAND_LEN {
            return Err(SendError::CommandTooLong);
        }
        if response_len > MAX_RESPONSE_LEN {
            return Err(SendError::ResponseTooLong);
        }
        self.command.clear();
        // Lengths were checked above.
        let _ = self.command.push(command);
        let _ = self.command.extend_from_slice(args);
        self.offset = 0;
        self.response.clear();
        self.response_len = response_len;
        self.errors = 0;
        self.idles = 0;
        self.state = CmdState::ReadyToSend;
        self.try_send();
        Ok(())
    }

    pub fn on_clock_edge(&mut self) -> CmdEvents {
        let bus = self.bus.on_clock_edge();
        self.process(bus)
    }

    pub fn on_timer(&mut self) -> CmdEvents {
        let bus = self.bus.on_timer();
        self.process(bus)
    }

    fn process(&mut self, bus: BusEvents) -> CmdEvents {
        let mut events = CmdEvents::new();
        for event in bus {
            match event {
                BusEvent::GoingIdle => self.try_send(),
                BusEvent::Idling => {
                    if self.state == CmdState::Idle {
                        let _ = events.push(CmdEvent::Idle);
                    } else {
                        self.idles = self.idles.saturating_add(1);
                        if self.check_continue(&mut events) {
                            self.try_send();
                        }
                    }
                }
                BusEvent::FrameAcked => {
                    if self.state == CmdState::WaitForSendAck {
                        self.state = CmdState::WaitForDeviceAck;
                    }
                }
                // The frame is gone; the device will resend it.
                BusEvent::StartError | BusEvent::ParityError | BusEvent::StopError => {
                    self.errors = self.errors.saturating_add(1);
                    self.check_continue(&mut events);
                }
                BusEvent::TimeoutError => {
                    self.idles = self.limits.max_idle;
                    self.check_continue(&mut events);
                }
                BusEvent::NackError => {
                    self.errors = self.errors.saturating_add(1);
                    if self.check_continue(&mut events) {
                        self.state = CmdState::ReadyToSend;
                    }
                }
                BusEvent::ByteReceived(byte) => self.byte_received(byte, &mut events),
            }
        }
        events
    }

    fn byte_received(&mut self, byte: u8, events: &mut CmdEvents) {
        match self.state {
            CmdState::WaitForDeviceAck => match ResponseCode::from_u8(byte) {
                Some(ResponseCode::Ack) => {
                    self.offset += 1;
                    if self.offset < self.command.len() {
                        self.state = CmdState::ReadyToSend;
                    } else if self.response_len > 0 {
                        self.state = CmdState::WaitForDeviceResponse;
                    } else {
                        self.finish(CompletionCode::Ok, events);
                    }
                }
                Some(ResponseCode::Resend) => {
                    self.errors = self.errors.saturating_add(1);
                    if self.check_continue(events) {
                        self.state = CmdState::ReadyToSend;
                    }
                }
                _ => {
                    self.errors = self.limits.max_errors;
                    self.check_continue(events);
                }
            },
            CmdState::WaitForDeviceResponse => {
                let _ = self.response.push(byte);
                if self.response.len() >= self.response_len {
                    self.finish(CompletionCode::Ok, events);
                }
            }
            CmdState::Idle => {
                let _ = events.push(CmdEvent::Data(byte));
            }
            // Nothing is expected from the device while we're sending.
            CmdState::ReadyToSend | CmdState::WaitForSendAck => {}
        }
    }

    /// Sends the current command byte if we're due to and the bus is free.
    /// Otherwise it goes out when the bus next goes idle.
    fn try_send(&mut self) {
        if self.state != CmdState::ReadyToSend {
            return;
        }
        let Some(&byte) = self.command.get(self.offset) else {
            return;
        };
        if self.bus.send_byte(byte).is_ok() {
            self.trace.write(Trace::Send(byte));
            self.state = CmdState::WaitForSendAck;
        }
    }

    /// Fails the running command if a limit was reached. Returns whether it
    /// may continue.
    fn check_continue(&mut self, events: &mut CmdEvents) -> bool {
        if self.state == CmdState::Idle {
            return false;
        }
        if self.errors >= self.limits.max_errors {
            self.finish(CompletionCode::Fail, events);
            false
        } else if self.idles >= self.limits.max_idle {
            self.finish(CompletionCode::Timeout, events);
            false
        } else {
            self.trace.write(Trace::Retry {
                errors: self.errors,
                idles: self.idles,
            });
            true
        }
    }

    fn finish(&mut self, code: CompletionCode, events: &mut CmdEvents) {
        self.state = CmdState::Idle;
        self.trace.write(Trace::Completed(code));
        let _ = events.push(CmdEvent::Completed(Completion {
            code,
            response: self.response.clone(),
        }));
    }
}
