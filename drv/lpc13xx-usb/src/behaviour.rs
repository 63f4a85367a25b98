//! Plug-in point for device classes.
//!
//! A device is a fixed list of behaviours. Each one sees every class or
//! vendor SETUP before the standard handlers do, every non-control endpoint
//! event, every frame, and every configuration change. Methods default to
//! "not mine".

use crate::control::ControlRequest;
use crate::endpoint::EndpointIo;
use crate::protocol::SetupPacket;

/// Behaviours a single device can hold.
pub const MAX_BEHAVIOURS: usize = 4;

/// `UsbDevice::add_behaviour` ran out of slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegistryFull;

pub trait Behaviour<'a> {
    /// Offered every SETUP. Return true to take it; describe any data stage
    /// through `req`.
    fn control_setup(&mut self, _req: &mut ControlRequest<'_, 'a>) -> bool {
        false
    }

    /// The OUT data stage accepted with `ControlRequest::receive(tag)` has
    /// arrived. Returning false stalls the status stage.
    fn control_data(&mut self, _setup: &SetupPacket, _tag: u8, _data: &[u8]) -> bool {
        false
    }

    /// The status stage registered with `ControlRequest::on_status(tag)`
    /// completed.
    fn control_status(&mut self, _tag: u8) {}

    /// A non-control endpoint needs service. Return true if it is ours.
    fn endpoint_data(&mut self, _io: &mut dyn EndpointIo, _physical: u8) -> bool {
        false
    }

    /// Start of frame, once per millisecond while the bus is active.
    fn frame(&mut self, _io: &mut dyn EndpointIo) {}

    /// The host selected `configuration` (0 after a reset).
    fn config_change(&mut self, _configuration: u8) {}

    /// SET_INTERFACE. Return true to accept the alternate setting.
    fn interface_alt(&mut self, _interface: u8, _alt: u8) -> bool {
        false
    }
}
