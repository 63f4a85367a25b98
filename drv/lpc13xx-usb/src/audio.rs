//! USB Audio class 1.0 behaviour.
//!
//! Only the control plumbing lives here. Class requests addressed to the
//! audio control interface or to one of the streaming endpoints are handed to
//! an [`AudioHandler`]; the isochronous data itself is moved by the handler
//! from its `frame` callback.

use core::cell::Cell;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::behaviour::Behaviour;
use crate::control::ControlRequest;
use crate::endpoint::{physical_from_address, EndpointIo};
use crate::protocol::{Dir, Recipient, RequestTypeType, SetupPacket};

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum AudioRequest {
    SetCur = 0x01,
    SetMin = 0x02,
    SetMax = 0x03,
    SetRes = 0x04,
    SetMem = 0x05,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetMem = 0x85,
    GetStat = 0xFF,
}

/// Addresses a control on a unit or terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControlAddress {
    /// Unit or terminal id (`wIndex` high byte).
    pub entity: u8,
    /// Control selector (`wValue` high byte).
    pub selector: u8,
    /// Channel number (`wValue` low byte), 0 being the master channel.
    pub channel: u8,
}

/// The application side of an audio function. SET requests are refused and
/// GET requests declined unless overridden.
pub trait AudioHandler {
    fn set_control(&self, _request: AudioRequest, _control: ControlAddress, _data: &[u8]) -> bool {
        false
    }

    /// Writes the value into `buf` and returns its length, or `None` to
    /// stall.
    fn get_control(
        &self,
        _request: AudioRequest,
        _control: ControlAddress,
        _buf: &mut [u8],
    ) -> Option<usize> {
        None
    }

    /// `endpoint` is the endpoint address from `wIndex`.
    fn set_endpoint(
        &self,
        _request: AudioRequest,
        _endpoint: u8,
        _selector: u8,
        _data: &[u8],
    ) -> bool {
        false
    }

    fn get_endpoint(
        &self,
        _request: AudioRequest,
        _endpoint: u8,
        _selector: u8,
        _buf: &mut [u8],
    ) -> Option<usize> {
        None
    }

    /// One of our interfaces switched alternate setting. Returning false
    /// refuses the switch.
    fn alt_changed(&self, _interface: u8, _alt: u8) -> bool {
        true
    }

    /// Start of frame, the point to move isochronous data.
    fn frame(&self, _io: &mut dyn EndpointIo) {}

    fn config_changed(&self, _configuration: u8) {}
}

/// Streaming flags shared with the application.
#[derive(Default)]
pub struct AudioState {
    in_streaming: Cell<bool>,
    out_streaming: Cell<bool>,
}

impl AudioState {
    /// The host selected a non-zero alternate setting on the IN streaming
    /// interface.
    pub fn in_streaming(&self) -> bool {
        self.in_streaming.get()
    }

    pub fn out_streaming(&self) -> bool {
        self.out_streaming.get()
    }
}

/// Interface and endpoint numbers of one audio function. Unused streaming
/// directions are `None`; endpoints are addresses (`0x81` etc.).
#[derive(Copy, Clone, Debug, Default)]
pub struct AudioLayout {
    pub control_interface: u8,
    pub in_stream: Option<(u8, u8)>,
    pub out_stream: Option<(u8, u8)>,
}

impl AudioLayout {
    fn is_stream_endpoint(&self, address: u8) -> bool {
        [self.in_stream, self.out_stream]
            .iter()
            .flatten()
            .any(|&(_, ep)| ep == address)
    }

    fn is_stream_interface(&self, interface: u8) -> Option<bool> {
        match (self.in_stream, self.out_stream) {
            (Some((i, _)), _) if i == interface => Some(true),
            (_, Some((i, _))) if i == interface => Some(false),
            _ => None,
        }
    }
}

const TAG_SET: u8 = 0;

pub struct AudioBehaviour<'a> {
    layout: AudioLayout,
    state: &'a AudioState,
    handler: &'a dyn AudioHandler,
}

impl<'a> AudioBehaviour<'a> {
    pub fn new(layout: AudioLayout, state: &'a AudioState, handler: &'a dyn AudioHandler) -> Self {
        Self { layout, state, handler }
    }

    fn addressed_to_us(&self, setup: &SetupPacket) -> bool {
        match setup.request_type.recipient() {
            Recipient::Interface => setup.index_low() == self.layout.control_interface,
            Recipient::Endpoint => self.layout.is_stream_endpoint(setup.index_low()),
            _ => false,
        }
    }

    fn get(
        &self,
        req: &mut ControlRequest<'_, '_>,
        setup: &SetupPacket,
        request: AudioRequest,
    ) -> bool {
        let handler = self.handler;
        let len = setup.length();
        let mut handled = false;
        req.respond_with(|buf| {
            let buf_len = buf.len();
            let buf = &mut buf[..len.min(buf_len)];
            let n = match setup.request_type.recipient() {
                Recipient::Interface => handler.get_control(request, control_address(setup), buf),
                _ => handler.get_endpoint(request, setup.index_low(), setup.value_high(), buf),
            };
            handled = n.is_some();
            n.unwrap_or(0)
        });
        handled
    }
}

fn control_address(setup: &SetupPacket) -> ControlAddress {
    ControlAddress {
        entity: setup.index_high(),
        selector: setup.value_high(),
        channel: setup.value_low(),
    }
}

impl<'a, 'h: 'a> Behaviour<'a> for AudioBehaviour<'h> {
    fn control_setup(&mut self, req: &mut ControlRequest<'_, 'a>) -> bool {
        let setup = *req.setup();
        if setup.request_type.type_() != RequestTypeType::Class || !self.addressed_to_us(&setup) {
            return false;
        }
        let Some(request) = AudioRequest::from_u8(setup.request) else {
            return false;
        };
        match setup.request_type.data_phase_direction() {
            // Values are applied once the data stage is in.
            Dir::HostToDevice => req.receive(TAG_SET),
            Dir::DeviceToHost => self.get(req, &setup, request),
        }
    }

    fn control_data(&mut self, setup: &SetupPacket, tag: u8, data: &[u8]) -> bool {
        if tag != TAG_SET {
            return false;
        }
        let Some(request) = AudioRequest::from_u8(setup.request) else {
            return false;
        };
        match setup.request_type.recipient() {
            Recipient::Interface => self.handler.set_control(request, control_address(setup), data),
            Recipient::Endpoint => self
                .handler
                .set_endpoint(request, setup.index_low(), setup.value_high(), data),
            _ => false,
        }
    }

    fn endpoint_data(&mut self, _io: &mut dyn EndpointIo, physical: u8) -> bool {
        // Isochronous endpoints are serviced from the frame callback.
        [self.layout.in_stream, self.layout.out_stream]
            .iter()
            .flatten()
            .any(|&(_, ep)| physical_from_address(ep) == physical)
    }

    fn frame(&mut self, io: &mut dyn EndpointIo) {
        self.handler.frame(io);
    }

    fn config_change(&mut self, configuration: u8) {
        self.state.in_streaming.set(false);
        self.state.out_streaming.set(false);
        self.handler.config_changed(configuration);
    }

    fn interface_alt(&mut self, interface: u8, alt: u8) -> bool {
        let stream = self.layout.is_stream_interface(interface);
        if stream.is_none() && interface != self.layout.control_interface {
            return false;
        }
        if !self.handler.alt_changed(interface, alt) {
            return false;
        }
        match stream {
            Some(true) => self.state.in_streaming.set(alt != 0),
            Some(false) => self.state.out_streaming.set(alt != 0),
            None => {}
        }
        true
    }
}
