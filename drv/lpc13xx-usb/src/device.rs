//! The control pipe state machine and interrupt dispatch.

use heapless::HistoryBuffer;
use zerocopy::{FromZeros, IntoBytes};

use crate::behaviour::{Behaviour, RegistryFull, MAX_BEHAVIOURS};
use crate::control::{ControlRequest, ControlState, DataCompletion, Phase, StatusCompletion};
use crate::endpoint::{UsbController, EP0_IN, EP0_OUT, NUM_PHYSICAL_ENDPOINTS};
use crate::protocol::{DeviceDescriptors, Dir, SetupPacket};

/// Interfaces we keep an alternate setting for.
pub const MAX_INTERFACES: usize = 8;

pub const TRACE_DEPTH: usize = 64;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DeviceState {
    #[default]
    Powered,
    Default,
    Address,
    Configured,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Reset,
    Suspend(bool),
    Setup(SetupPacket),
    ShortSetup(usize),
    Abandoned(Phase),
    Unhandled { request_type: u8, request: u8 },
    Stall,
    AddressPending(u8),
    Address(u8),
    Configured(u8),
    DataRejected,
    UnexpectedOut(Phase),
    EndpointUnclaimed(u8),
}

pub struct UsbDevice<'a, C: UsbController> {
    usb: C,
    pub(crate) descriptors: DeviceDescriptors<'a>,
    pub(crate) behaviours: heapless::Vec<&'a mut dyn Behaviour<'a>, MAX_BEHAVIOURS>,
    pub(crate) control: ControlState<'a>,
    pub(crate) state: DeviceState,
    pub(crate) configuration: u8,
    pub(crate) alt_settings: [u8; MAX_INTERFACES],
    suspended: bool,
    trace: HistoryBuffer<Event, TRACE_DEPTH>,
}

impl<'a, C: UsbController> UsbDevice<'a, C> {
    pub fn new(usb: C, descriptors: DeviceDescriptors<'a>) -> Self {
        Self {
            usb,
            descriptors,
            behaviours: heapless::Vec::new(),
            control: ControlState::default(),
            state: DeviceState::Powered,
            configuration: 0,
            alt_settings: [0; MAX_INTERFACES],
            suspended: false,
            trace: HistoryBuffer::new(),
        }
    }

    /// Registers a behaviour. SETUPs and endpoint events are offered to
    /// behaviours in the order they were added.
    pub fn add_behaviour(
        &mut self,
        behaviour: &'a mut dyn Behaviour<'a>,
    ) -> Result<(), RegistryFull> {
        self.behaviours.push(behaviour).map_err(|_| RegistryFull)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.alt_settings.get(usize::from(interface)).copied()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn control_phase(&self) -> Phase {
        self.control.phase
    }

    pub fn io(&self) -> &C {
        &self.usb
    }

    pub fn io_mut(&mut self) -> &mut C {
        &mut self.usb
    }

    /// Recorded events, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &Event> + '_ {
        self.trace.oldest_ordered()
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.trace.write(event);
    }

    /// Soft connect/disconnect of the D+ pull-up.
    pub fn connect(&mut self, connected: bool) {
        self.usb.set_connected(connected);
    }

    /// Services every pending interrupt cause.
    pub fn handle_interrupt(&mut self) {
        let irq = self.usb.take_interrupts();

        if irq.reset {
            self.reset();
            return;
        }
        if let Some(suspended) = irq.suspend {
            self.emit(Event::Suspend(suspended));
            self.suspended = suspended;
        }
        if irq.frame {
            for b in self.behaviours.iter_mut() {
                b.frame(&mut self.usb);
            }
        }

        if irq.endpoint(EP0_OUT) {
            if irq.setup {
                self.on_setup();
            } else {
                self.on_control_out();
            }
        }
        if irq.endpoint(EP0_IN) {
            self.on_control_in();
        }
        for physical in 2..NUM_PHYSICAL_ENDPOINTS {
            if irq.endpoint(physical) {
                self.service_endpoint(physical);
            }
        }
    }

    /// Bus reset: back to address 0, unconfigured, with every behaviour told
    /// so.
    pub fn reset(&mut self) {
        self.emit(Event::Reset);
        self.usb.set_address(0);
        self.usb.set_configured(false);
        self.control = ControlState::default();
        self.state = DeviceState::Default;
        self.configuration = 0;
        self.alt_settings = [0; MAX_INTERFACES];
        self.suspended = false;
        for b in self.behaviours.iter_mut() {
            b.config_change(0);
        }
    }

    /// Runs the behaviours' handler for `physical` now, e.g. after queueing
    /// data for an IN endpoint that is idle. The first behaviour to claim
    /// it wins; an endpoint nobody claims is stalled.
    pub fn service_endpoint(&mut self, physical: u8) {
        for b in self.behaviours.iter_mut() {
            if b.endpoint_data(&mut self.usb, physical) {
                return;
            }
        }
        self.emit(Event::EndpointUnclaimed(physical));
        self.usb.set_stall(physical, true);
    }

    /// Asks the controller to raise an interrupt for `physical`, so it gets
    /// serviced from the interrupt handler instead of the caller.
    pub fn trigger_endpoint(&mut self, physical: u8) {
        self.usb.trigger(physical);
    }

    fn stall_control(&mut self) {
        self.emit(Event::Stall);
        self.usb.set_stall(EP0_IN, true);
        self.usb.set_stall(EP0_OUT, true);
        self.control.phase = Phase::Idle;
        self.control.on_data = None;
        self.control.on_status = None;
    }

    fn send_status(&mut self) {
        self.usb.write(EP0_IN, &[]);
        self.control.phase = Phase::StatusIn;
    }

    fn send_next_in(&mut self) {
        let chunk = self.control.in_chunk();
        let n = self.usb.write(EP0_IN, chunk);
        self.control.advance(n);
    }

    fn on_setup(&mut self) {
        if self.control.phase != Phase::Idle {
            self.emit(Event::Abandoned(self.control.phase));
        }

        let mut setup = SetupPacket::new_zeroed();
        let n = self.usb.read(EP0_OUT, setup.as_mut_bytes());
        if n != SetupPacket::SIZE {
            self.emit(Event::ShortSetup(n));
            self.control.begin(SetupPacket::default());
            self.stall_control();
            return;
        }
        self.emit(Event::Setup(setup));
        self.control.begin(setup);

        if !self.dispatch_setup() {
            self.emit(Event::Unhandled {
                request_type: setup.request_type.0,
                request: setup.request,
            });
            self.stall_control();
            return;
        }

        if setup.length() == 0 {
            self.send_status();
            return;
        }
        match setup.request_type.data_phase_direction() {
            Dir::DeviceToHost => {
                self.control.phase = Phase::DataIn;
                self.send_next_in();
            }
            Dir::HostToDevice => {
                if self.control.remaining() > 0 {
                    self.control.phase = Phase::DataOut;
                } else {
                    // Accepted without asking for the data; nothing to wait
                    // for.
                    self.send_status();
                }
            }
        }
    }

    /// Behaviours first, then chapter 9.
    fn dispatch_setup(&mut self) -> bool {
        for (slot, b) in self.behaviours.iter_mut().enumerate() {
            let mut req = ControlRequest::new(&mut self.control, slot);
            if b.control_setup(&mut req) {
                return true;
            }
            self.control.discard_response();
        }
        let handled = self.handle_standard();
        if !handled {
            self.control.discard_response();
        }
        handled
    }

    fn on_control_out(&mut self) {
        match self.control.phase {
            Phase::DataOut => {
                let window = self.control.out_window();
                let n = self.usb.read(EP0_OUT, window);
                self.control.advance(n);
                if self.control.remaining() > 0 {
                    return;
                }
                if self.complete_data() {
                    self.send_status();
                } else {
                    self.emit(Event::DataRejected);
                    self.stall_control();
                }
            }
            Phase::DataIn | Phase::StatusOut => {
                // The host's status packet, possibly cutting a long IN
                // transfer short.
                self.usb.read(EP0_OUT, &mut []);
                self.control.phase = Phase::Idle;
                self.complete_status();
            }
            phase @ (Phase::Idle | Phase::StatusIn) => {
                self.usb.read(EP0_OUT, &mut []);
                self.emit(Event::UnexpectedOut(phase));
                self.stall_control();
            }
        }
    }

    fn on_control_in(&mut self) {
        match self.control.phase {
            Phase::DataIn => {
                if self.control.remaining() > 0 {
                    self.send_next_in();
                } else if self.control.take_zlp() {
                    self.usb.write(EP0_IN, &[]);
                } else {
                    self.control.phase = Phase::StatusOut;
                }
            }
            Phase::StatusIn => {
                self.control.phase = Phase::Idle;
                self.complete_status();
            }
            // Our status packet was already consumed, or nothing is queued.
            Phase::Idle | Phase::DataOut | Phase::StatusOut => {}
        }
    }

    fn complete_data(&mut self) -> bool {
        let Some(DataCompletion { slot, tag }) = self.control.on_data.take() else {
            return true;
        };
        let setup = self.control.setup;
        let data = self.control.received();
        match self.behaviours.get_mut(slot) {
            Some(b) => b.control_data(&setup, tag, data),
            None => false,
        }
    }

    fn complete_status(&mut self) {
        match self.control.on_status.take() {
            Some(StatusCompletion::SetAddress(address)) => {
                self.usb.set_address(address);
                self.emit(Event::Address(address));
                self.state = if address == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Address
                };
            }
            Some(StatusCompletion::Behaviour { slot, tag }) => {
                if let Some(b) = self.behaviours.get_mut(slot) {
                    b.control_status(tag);
                }
            }
            None => {}
        }
    }
}
