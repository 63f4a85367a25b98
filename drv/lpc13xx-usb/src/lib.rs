//! USB device stack for the LPC1342/1343.
//!
//! The layering, bottom up:
//!
//! - `regs` and `sie` talk to the controller's register block and its Serial
//!   Interface Engine command protocol.
//! - `endpoint` defines the packet I/O traits the rest of the stack is written
//!   against; `lpc13xx` implements them for the real hardware.
//! - `control` and `device` run endpoint 0's Setup/Data/Status sequence and
//!   fan interrupts out; `standard` answers the chapter 9 requests.
//! - `behaviour` is the plug-in point for device classes, of which `hid`,
//!   `cdc`, `midi` and `audio` are provided.
//!
//! Everything above `lpc13xx` runs on the host against a fake controller.

#![cfg_attr(not(test), no_std)]

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        #[path = "arch/arm_m.rs"]
        mod arch;
    } else {
        #[path = "arch/host.rs"]
        mod arch;
    }
}

pub mod audio;
pub mod behaviour;
pub mod cdc;
pub mod control;
pub mod device;
pub mod endpoint;
pub mod hid;
pub mod lpc13xx;
pub mod midi;
pub mod protocol;
pub mod regs;
pub mod sie;
mod standard;

#[cfg(test)]
mod fake;

pub use behaviour::{Behaviour, RegistryFull};
pub use control::{ControlRequest, Phase};
pub use device::{DeviceState, Event, UsbDevice};
pub use endpoint::{EndpointIo, UsbController};
pub use lpc13xx::Lpc13xxUsb;
pub use protocol::{DeviceDescriptors, SetupPacket};
