//! Bit-level framing.
//!
//! The device generates the clock in both directions; we sample or change
//! the data line on each falling edge. To send, we first hold the clock low
//! for a while (request-to-send) with the data line low as the start bit,
//! then let the device clock the rest of the frame out of us. Any protocol
//! error aborts the frame by holding the clock low again, which makes the
//! device give up too.
//!
//! Every state change re-arms the timer. Expiry during a frame is a timeout;
//! expiry while idle is reported as [`BusEvent::Idling`] and re-armed, so
//! upper layers get a steady heartbeat when nothing is happening.

use heapless::{HistoryBuffer, Vec};
use smart_default::SmartDefault;

use crate::{BusTimer, Pin};

#[derive(Copy, Clone, Debug, Eq, PartialEq, SmartDefault)]
pub struct BusTiming {
    /// Heartbeat period while nothing is on the wire.
    #[default = 50_000]
    pub idle_us: u32,
    /// A whole device-to-host frame.
    #[default = 2_000]
    pub max_read_frame_us: u32,
    /// A host-to-device frame, counted from the end of request-to-send.
    #[default = 20_000]
    pub max_write_frame_us: u32,
    /// How long the clock is held low to request-to-send or abort.
    #[default = 100]
    pub rts_us: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum BusState {
    #[default]
    Idle,
    Reading,
    Writing,
    RequestToSend,
    Aborting,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusEvent {
    /// A frame finished, one way or another, and the bus is free again.
    GoingIdle,
    /// Heartbeat while idle.
    Idling,
    /// The device acknowledged a frame we sent.
    FrameAcked,
    ByteReceived(u8),
    StartError,
    ParityError,
    StopError,
    TimeoutError,
    /// The device didn't acknowledge a frame we sent.
    NackError,
}

/// A frame is already in progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusBusy;

/// Most events one edge or timer expiry can produce.
pub const MAX_BUS_EVENTS: usize = 2;

pub type BusEvents = Vec<BusEvent, MAX_BUS_EVENTS>;

pub const TRACE_DEPTH: usize = 32;

pub struct Ps2Bus<P, T> {
    clock: P,
    data: P,
    timer: T,
    timing: BusTiming,
    state: BusState,
    frame: u8,
    bits: u8,
    odd: bool,
    trace: HistoryBuffer<BusEvent, TRACE_DEPTH>,
}

impl<P: Pin, T: BusTimer> Ps2Bus<P, T> {
    pub fn new(clock: P, data: P, timer: T, timing: BusTiming) -> Self {
        Self {
            clock,
            data,
            timer,
            timing,
            state: BusState::Idle,
            frame: 0,
            bits: 0,
            odd: false,
            trace: HistoryBuffer::new(),
        }
    }

    /// Releases both lines and starts the idle heartbeat.
    pub fn start(&mut self) {
        self.release();
        self.state = BusState::Idle;
        self.timer.start(self.timing.idle_us);
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn trace(&self) -> impl Iterator<Item = &BusEvent> + '_ {
        self.trace.oldest_ordered()
    }

    /// Starts sending `byte`. The outcome arrives later as `FrameAcked` or
    /// an error event.
    pub fn send_byte(&mut self, byte: u8) -> Result<(), BusBusy> {
        if self.state != BusState::Idle {
            return Err(BusBusy);
        }
        self.state = BusState::RequestToSend;
        // Data low doubles as the start bit once the clock is released.
        self.data.set_output(true);
        self.data.write(false);
        self.clock.set_output(true);
        self.clock.write(false);
        self.frame = byte;
        self.bits = 0;
        self.odd = false;
        self.timer.start(self.timing.rts_us);
        Ok(())
    }

    /// Call on every falling edge of the clock line.
    pub fn on_clock_edge(&mut self) -> BusEvents {
        let mut events = BusEvents::new();
        let bit = self.data.read();
        match self.state {
            BusState::Idle => {
                if bit {
                    self.push(&mut events, BusEvent::StartError);
                    self.abort();
                } else {
                    self.state = BusState::Reading;
                    self.frame = 0;
                    self.odd = false;
                    self.bits = 0;
                    self.timer.start(self.timing.max_read_frame_us);
                }
            }
            BusState::Reading => {
                self.bits += 1;
                match self.bits {
                    1..=8 => {
                        if bit {
                            self.frame |= 1 << (self.bits - 1);
                            self.odd = !self.odd;
                        }
                    }
                    9 => {
                        if bit == self.odd {
                            self.push(&mut events, BusEvent::ParityError);
                            self.abort();
                        }
                    }
                    _ => {
                        if bit {
                            self.push(&mut events, BusEvent::ByteReceived(self.frame));
                            self.go_idle(&mut events);
                        } else {
                            self.push(&mut events, BusEvent::StopError);
                            self.abort();
                        }
                    }
                }
            }
            BusState::Writing => {
                // The start bit went out with request-to-send.
                self.bits += 1;
                match self.bits {
                    1..=8 => {
                        let out = self.frame & (1 << (self.bits - 1)) != 0;
                        self.data.write(out);
                        if out {
                            self.odd = !self.odd;
                        }
                    }
                    9 => self.data.write(!self.odd),
                    10 => {
                        // Stop bit: let the pull-up provide it.
                        self.data.write(true);
                        self.data.set_output(false);
                    }
                    _ => {
                        let nack = bit;
                        let event = if nack { BusEvent::NackError } else { BusEvent::FrameAcked };
                        self.push(&mut events, event);
                        self.go_idle(&mut events);
                    }
                }
            }
            // Those edges are our own doing.
            BusState::RequestToSend | BusState::Aborting => {}
        }
        events
    }

    /// Call when the timer expires.
    pub fn on_timer(&mut self) -> BusEvents {
        let mut events = BusEvents::new();
        match self.state {
            BusState::RequestToSend => {
                self.state = BusState::Writing;
                self.clock.write(true);
                self.clock.set_output(false);
                self.timer.start(self.timing.max_write_frame_us);
            }
            BusState::Aborting => self.go_idle(&mut events),
            BusState::Reading | BusState::Writing => {
                self.push(&mut events, BusEvent::TimeoutError);
                self.abort();
            }
            BusState::Idle => {
                self.push(&mut events, BusEvent::Idling);
                self.timer.start(self.timing.idle_us);
            }
        }
        events
    }

    fn push(&mut self, events: &mut BusEvents, event: BusEvent) {
        self.trace.write(event);
        // Each handler produces at most MAX_BUS_EVENTS.
        let _ = events.push(event);
    }

    fn release(&mut self) {
        self.data.write(true);
        self.clock.write(true);
        self.data.set_output(false);
        self.clock.set_output(false);
    }

    fn abort(&mut self) {
        self.data.set_output(false);
        self.clock.set_output(true);
        self.clock.write(false);
        self.state = BusState::Aborting;
        self.timer.start(self.timing.rts_us);
    }

    fn go_idle(&mut self, events: &mut BusEvents) {
        if self.state == BusState::Idle {
            return;
        }
        self.timer.stop();
        self.release();
        self.state = BusState::Idle;
        self.timer.start(self.timing.idle_us);
        // Last, so whoever reacts finds the bus free.
        self.push(events, BusEvent::GoingIdle);
    }
}
