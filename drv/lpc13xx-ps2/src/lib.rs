//! PS/2 host for one keyboard or mouse, bit-banged on two GPIO lines.
//!
//! Three layers, each a state machine driven from interrupt context:
//!
//! - [`bus::Ps2Bus`] clocks single 11-bit frames in and out, using falling
//!   edges on the clock line and a one-shot timer for timeouts.
//! - [`cmd::Ps2Cmd`] turns frames into command/acknowledge/response
//!   transactions, retrying resends and giving up after too many errors.
//! - [`app::Ps2App`] works out what is plugged in, initializes it, and
//!   decodes its reports for a [`app::Ps2Client`].
//!
//! Each layer returns what happened as a short list of events for the layer
//! above to act on, so there is never more than one `&mut` to any of them.

#![cfg_attr(not(test), no_std)]

pub mod app;
pub mod bus;
pub mod cmd;
pub mod lpc13xx;
pub mod scancodes;

#[cfg(test)]
mod fake;

pub use app::{AppTiming, ConnectionState, Leds, MouseButtons, MouseInput, Ps2App, Ps2Client};
pub use bus::{BusBusy, BusEvent, BusTiming, Ps2Bus};
pub use cmd::{CmdEvent, CmdLimits, Completion, CompletionCode, Ps2Cmd, SendError};

/// One open-drain line. Released, the line is pulled high by the bus.
pub trait Pin {
    /// Drive the line (`true`) or release it (`false`).
    fn set_output(&mut self, output: bool);

    /// Level driven while the line is an output.
    fn write(&mut self, high: bool);

    /// Current level on the wire.
    fn read(&self) -> bool;
}

/// A one-shot microsecond timer. Expiry is reported by calling the bus's
/// `on_timer`.
pub trait BusTimer {
    /// (Re)starts the timer, cancelling any pending expiry.
    fn start(&mut self, us: u32);

    fn stop(&mut self);
}
