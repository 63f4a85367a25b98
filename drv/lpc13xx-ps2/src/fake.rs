//! Shared-line fakes and a scripted device for host tests.

use std::cell::Cell;
use std::rc::Rc;

use crate::{BusTimer, Pin};

#[derive(Default)]
struct LineState {
    output: Cell<bool>,
    host_level: Cell<bool>,
    device_low: Cell<bool>,
}

/// Both ends of one wire. Clones share the wire.
#[derive(Clone, Default)]
pub struct Line(Rc<LineState>);

impl Line {
    pub fn level(&self) -> bool {
        let host_high = !self.0.output.get() || self.0.host_level.get();
        host_high && !self.0.device_low.get()
    }

    pub fn host_pulls_low(&self) -> bool {
        self.0.output.get() && !self.0.host_level.get()
    }

    pub fn device_drive(&self, low: bool) {
        self.0.device_low.set(low);
    }
}

impl Pin for Line {
    fn set_output(&mut self, output: bool) {
        self.0.output.set(output);
    }

    fn write(&mut self, high: bool) {
        self.0.host_level.set(high);
    }

    fn read(&self) -> bool {
        self.level()
    }
}

/// Records the armed duration; `None` when stopped.
#[derive(Clone, Default)]
pub struct FakeTimer(Rc<Cell<Option<u32>>>);

impl FakeTimer {
    pub fn armed(&self) -> Option<u32> {
        self.0.get()
    }
}

impl BusTimer for FakeTimer {
    fn start(&mut self, us: u32) {
        self.0.set(Some(us));
    }

    fn stop(&mut self) {
        self.0.set(None);
    }
}

fn odd_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// The device clocks `byte` to the host: start, data, parity, stop, one
/// falling edge each.
pub fn clock_in(data: &Line, byte: u8, edge: impl FnMut()) {
    clock_in_with_parity(data, byte, odd_parity(byte), edge);
}

pub fn clock_in_with_parity(data: &Line, byte: u8, parity: bool, mut edge: impl FnMut()) {
    let mut bits = [false; 11];
    for (i, bit) in bits[1..9].iter_mut().enumerate() {
        *bit = byte & (1 << i) != 0;
    }
    bits[9] = parity;
    bits[10] = true;
    for bit in bits {
        data.device_drive(!bit);
        edge();
    }
    data.device_drive(false);
}

/// The device clocks a host frame out after request-to-send: reads the data
/// bits and parity the host presents, then answers with `ack`. Returns the
/// byte and whether its parity was right.
pub fn clock_out(data: &Line, ack: bool, mut edge: impl FnMut()) -> (u8, bool) {
    assert!(data.host_pulls_low(), "no start bit");
    let mut byte = 0u8;
    for i in 0..8 {
        edge();
        if data.level() {
            byte |= 1 << i;
        }
    }
    edge();
    let parity = data.level();
    edge();
    assert!(!data.host_pulls_low(), "data not released for stop bit");
    data.device_drive(ack);
    edge();
    data.device_drive(false);
    (byte, parity == odd_parity(byte))
}
