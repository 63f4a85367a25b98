//! Per-transfer state of the default control pipe.
//!
//! A control transfer is a SETUP, an optional data stage in the direction
//! given by `bmRequestType` bit 7, and a zero-length status stage in the
//! opposite direction. Whoever accepts the SETUP describes the data stage
//! here and may leave completion work in `on_data`/`on_status`.

use crate::endpoint::MAX_CONTROL_PACKET;
use crate::protocol::SetupPacket;

/// Largest data stage we buffer in RAM (both directions). IN transfers
/// from borrowed slices, such as descriptors, are not limited by this.
pub const MAX_COMMAND_DATA: usize = 64;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Phase {
    /// No transfer in progress.
    #[default]
    Idle,
    /// Sending data to the host.
    DataIn,
    /// Receiving data from the host.
    DataOut,
    /// We queued the zero-length status packet and are waiting for the host
    /// to take it.
    StatusIn,
    /// Waiting for the host's zero-length status packet.
    StatusOut,
}

#[derive(Copy, Clone, Debug, Default)]
enum Source<'a> {
    #[default]
    None,
    Borrowed(&'a [u8]),
    Buffer,
}

/// Work to run once an OUT data stage has fully arrived. The behaviour in
/// `slot` decides whether the transfer is acknowledged or stalled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataCompletion {
    pub slot: usize,
    pub tag: u8,
}

/// Work to run once the status stage has completed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatusCompletion {
    SetAddress(u8),
    Behaviour { slot: usize, tag: u8 },
}

#[derive(Debug)]
pub struct ControlState<'a> {
    pub(crate) setup: SetupPacket,
    pub(crate) phase: Phase,
    source: Source<'a>,
    cursor: usize,
    remaining: usize,
    zlp_pending: bool,
    buffer: [u8; MAX_COMMAND_DATA],
    pub(crate) on_data: Option<DataCompletion>,
    pub(crate) on_status: Option<StatusCompletion>,
}

impl Default for ControlState<'_> {
    fn default() -> Self {
        Self {
            setup: SetupPacket::default(),
            phase: Phase::Idle,
            source: Source::None,
            cursor: 0,
            remaining: 0,
            zlp_pending: false,
            buffer: [0; MAX_COMMAND_DATA],
            on_data: None,
            on_status: None,
        }
    }
}

impl<'a> ControlState<'a> {
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Starts a new transfer, dropping anything left from the previous one.
    pub(crate) fn begin(&mut self, setup: SetupPacket) {
        *self = Self {
            setup,
            ..Self::default()
        };
    }

    /// Forgets a data stage a handler described before declining the
    /// request.
    pub(crate) fn discard_response(&mut self) {
        self.source = Source::None;
        self.cursor = 0;
        self.remaining = 0;
        self.zlp_pending = false;
        self.on_data = None;
        self.on_status = None;
    }

    fn start_in(&mut self, source: Source<'a>, available: usize) {
        let requested = self.setup.length();
        let len = available.min(requested);
        self.source = source;
        self.cursor = 0;
        self.remaining = len;
        // A short transfer that ends on a packet boundary needs an explicit
        // zero-length packet so the host sees it end.
        self.zlp_pending = len > 0 && len < requested && len % MAX_CONTROL_PACKET == 0;
    }

    /// Answers an IN request from a borrowed slice, clamped to `wLength`.
    pub fn respond(&mut self, data: &'a [u8]) {
        self.start_in(Source::Borrowed(data), data.len());
    }

    /// Answers an IN request by copying `data` into the command buffer.
    pub fn respond_bytes(&mut self, data: &[u8]) {
        let n = data.len().min(MAX_COMMAND_DATA);
        self.buffer[..n].copy_from_slice(&data[..n]);
        self.start_in(Source::Buffer, n);
    }

    /// Answers an IN request by letting `fill` write into the command buffer
    /// and return how many bytes it produced.
    pub fn respond_with(&mut self, fill: impl FnOnce(&mut [u8]) -> usize) {
        let n = fill(&mut self.buffer).min(MAX_COMMAND_DATA);
        self.start_in(Source::Buffer, n);
    }

    /// Arranges to receive the full `wLength` OUT data stage into the command
    /// buffer. Fails if it won't fit or there is nothing to receive.
    pub(crate) fn receive(&mut self, completion: Option<DataCompletion>) -> bool {
        let len = self.setup.length();
        if len == 0 || len > MAX_COMMAND_DATA {
            return false;
        }
        self.source = Source::Buffer;
        self.cursor = 0;
        self.remaining = len;
        self.on_data = completion;
        true
    }

    /// The next IN packet.
    pub(crate) fn in_chunk(&self) -> &[u8] {
        let n = self.remaining.min(MAX_CONTROL_PACKET);
        let range = self.cursor..self.cursor + n;
        match self.source {
            Source::Borrowed(data) => &data[range],
            Source::Buffer => &self.buffer[range],
            Source::None => &[],
        }
    }

    /// Where the next OUT packet goes.
    pub(crate) fn out_window(&mut self) -> &mut [u8] {
        let n = self.remaining.min(MAX_CONTROL_PACKET);
        &mut self.buffer[self.cursor..self.cursor + n]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        let n = n.min(self.remaining);
        self.cursor += n;
        self.remaining -= n;
    }

    pub(crate) fn take_zlp(&mut self) -> bool {
        core::mem::take(&mut self.zlp_pending)
    }

    /// OUT data received so far.
    pub fn received(&self) -> &[u8] {
        match self.source {
            Source::Buffer => &self.buffer[..self.cursor],
            _ => &[],
        }
    }
}

/// The view of a SETUP a behaviour gets while deciding whether to accept it.
pub struct ControlRequest<'r, 'a> {
    state: &'r mut ControlState<'a>,
    slot: usize,
}

impl<'r, 'a> ControlRequest<'r, 'a> {
    pub(crate) fn new(state: &'r mut ControlState<'a>, slot: usize) -> Self {
        Self { state, slot }
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.state.setup
    }

    pub fn respond(&mut self, data: &'a [u8]) {
        self.state.respond(data);
    }

    pub fn respond_bytes(&mut self, data: &[u8]) {
        self.state.respond_bytes(data);
    }

    pub fn respond_with(&mut self, fill: impl FnOnce(&mut [u8]) -> usize) {
        self.state.respond_with(fill);
    }

    /// Accepts the OUT data stage; once it has all arrived, the behaviour's
    /// `control_data` runs with `tag`.
    pub fn receive(&mut self, tag: u8) -> bool {
        self.state.receive(Some(DataCompletion { slot: self.slot, tag }))
    }

    /// Runs the behaviour's `control_status` with `tag` after the status
    /// stage.
    pub fn on_status(&mut self, tag: u8) {
        self.state.on_status = Some(StatusCompletion::Behaviour { slot: self.slot, tag });
    }
}
