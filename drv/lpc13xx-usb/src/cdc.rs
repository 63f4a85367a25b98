//! CDC ACM (virtual serial port) behaviour.
//!
//! Bytes move between the bulk endpoints and a pair of FIFOs in a
//! [`CdcState`] that the application shares. After writing into the transmit
//! FIFO or draining the receive FIFO, the application asks the device to
//! service the corresponding endpoint so data starts moving again.

use core::cell::{Cell, RefCell};

use bitflags::bitflags;
use heapless::Deque;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use smart_default::SmartDefault;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, Unaligned};

use crate::behaviour::Behaviour;
use crate::control::ControlRequest;
use crate::endpoint::{physical_from_address, EndpointIo, MAX_BULK_PACKET};
use crate::protocol::{Dir, Recipient, RequestTypeType, SetupPacket};

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CdcRequestCode {
    SendEncapsulatedCommand = 0x00,
    GetEncapsulatedResponse = 0x01,
    SetCommFeature = 0x02,
    GetCommFeature = 0x03,
    ClearCommFeature = 0x04,
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
    SendBreak = 0x23,
}

/// Comm feature selector for the abstract control model state.
pub const COMM_FEATURE_ABSTRACT_STATE: u8 = 0x01;
const ABSTRACT_STATE_IDLE: u8 = 0x01;

/// Line coding as it travels over the wire: 7 bytes, little endian.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, Unaligned, SmartDefault,
)]
#[repr(C)]
pub struct LineCoding {
    #[default(U32::new(9600))]
    pub rate: U32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2.
    pub char_format: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space.
    pub parity_type: u8,
    #[default = 8]
    pub data_bits: u8,
}

bitflags! {
    /// SET_CONTROL_LINE_STATE `wValue`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ControlLines: u8 {
        const DTR = 1 << 0;
        const RTS = 1 << 1;
    }
}

/// State shared between the behaviour and the application.
pub struct CdcState<const N: usize> {
    rx: RefCell<Deque<u8, N>>,
    tx: RefCell<Deque<u8, N>>,
    line_coding: Cell<LineCoding>,
    control_lines: Cell<ControlLines>,
    idle: Cell<bool>,
}

impl<const N: usize> CdcState<N> {
    pub fn new(line_coding: LineCoding) -> Self {
        Self {
            rx: RefCell::new(Deque::new()),
            tx: RefCell::new(Deque::new()),
            line_coding: Cell::new(line_coding),
            control_lines: Cell::new(ControlLines::empty()),
            idle: Cell::new(false),
        }
    }

    /// Takes up to `buf.len()` received bytes.
    pub fn read_bytes(&self, buf: &mut [u8]) -> usize {
        let mut rx = self.rx.borrow_mut();
        let mut n = 0;
        for slot in buf.iter_mut() {
            let Some(b) = rx.pop_front() else {
                break;
            };
            *slot = b;
            n += 1;
        }
        n
    }

    /// Queues as much of `data` as fits and returns how much that was.
    pub fn write_bytes(&self, data: &[u8]) -> usize {
        let mut tx = self.tx.borrow_mut();
        let mut n = 0;
        for &b in data {
            if tx.push_back(b).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    pub fn rx_len(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn tx_len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn line_coding(&self) -> LineCoding {
        self.line_coding.get()
    }

    pub fn control_lines(&self) -> ControlLines {
        self.control_lines.get()
    }

    pub fn is_idle(&self) -> bool {
        self.idle.get()
    }

    fn reset(&self, line_coding: LineCoding) {
        self.rx.borrow_mut().clear();
        self.tx.borrow_mut().clear();
        self.line_coding.set(line_coding);
        self.control_lines.set(ControlLines::empty());
        self.idle.set(false);
    }

    fn rx_free(&self) -> usize {
        N - self.rx_len()
    }
}

/// Optional notifications. All methods default to doing nothing.
pub trait CdcHandler {
    /// The host asked for a new line coding; returning false rejects it.
    fn line_coding_changed(&self, _coding: &LineCoding) -> bool {
        true
    }

    fn control_lines_changed(&self, _lines: ControlLines) {}

    /// `duration_ms` of 0xFFFF means "until further notice", 0 ends a break.
    fn send_break(&self, _duration_ms: u16) {}

    fn idle_changed(&self, _idle: bool) {}

    /// Bytes were added to the receive FIFO.
    fn data_available(&self) {}
}

const TAG_COMM_FEATURE: u8 = 0;
const TAG_LINE_CODING: u8 = 1;

pub struct CdcBehaviour<'a, const N: usize> {
    control_interface: u8,
    interrupt_endpoint: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    default_coding: LineCoding,
    state: &'a CdcState<N>,
    handler: Option<&'a dyn CdcHandler>,
}

impl<'a, const N: usize> CdcBehaviour<'a, N> {
    /// Endpoints are given as addresses (`0x81` etc.).
    pub fn new(
        control_interface: u8,
        interrupt_endpoint: u8,
        in_endpoint: u8,
        out_endpoint: u8,
        state: &'a CdcState<N>,
    ) -> Self {
        Self {
            control_interface,
            interrupt_endpoint: physical_from_address(interrupt_endpoint),
            in_endpoint: physical_from_address(in_endpoint),
            out_endpoint: physical_from_address(out_endpoint),
            default_coding: state.line_coding(),
            state,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: &'a dyn CdcHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    fn set_request(&mut self, req: &mut ControlRequest<'_, '_>, setup: &SetupPacket) -> bool {
        match CdcRequestCode::from_u8(setup.request) {
            Some(CdcRequestCode::SetCommFeature) => {
                setup.value_low() == COMM_FEATURE_ABSTRACT_STATE
                    && setup.length() == 2
                    && req.receive(TAG_COMM_FEATURE)
            }
            Some(CdcRequestCode::ClearCommFeature) => {
                if setup.value_low() != COMM_FEATURE_ABSTRACT_STATE || setup.length() != 0 {
                    return false;
                }
                self.state.idle.set(false);
                if let Some(h) = self.handler {
                    h.idle_changed(false);
                }
                true
            }
            Some(CdcRequestCode::SetLineCoding) => {
                setup.length() == core::mem::size_of::<LineCoding>() && req.receive(TAG_LINE_CODING)
            }
            Some(CdcRequestCode::SetControlLineState) => {
                if setup.length() != 0 {
                    return false;
                }
                let lines = ControlLines::from_bits_truncate(setup.value_low());
                self.state.control_lines.set(lines);
                if let Some(h) = self.handler {
                    h.control_lines_changed(lines);
                }
                true
            }
            Some(CdcRequestCode::SendBreak) => {
                if setup.length() != 0 {
                    return false;
                }
                if let Some(h) = self.handler {
                    h.send_break(setup.value.get());
                }
                true
            }
            _ => false,
        }
    }

    fn get_request(&mut self, req: &mut ControlRequest<'_, '_>, setup: &SetupPacket) -> bool {
        match CdcRequestCode::from_u8(setup.request) {
            Some(CdcRequestCode::GetCommFeature) => {
                if setup.value_low() != COMM_FEATURE_ABSTRACT_STATE || setup.length() != 2 {
                    return false;
                }
                let status = if self.state.is_idle() { ABSTRACT_STATE_IDLE } else { 0 };
                req.respond_bytes(&[status, 0]);
                true
            }
            Some(CdcRequestCode::GetLineCoding) => {
                if setup.length() != core::mem::size_of::<LineCoding>() {
                    return false;
                }
                req.respond_bytes(self.state.line_coding().as_bytes());
                true
            }
            _ => false,
        }
    }

    fn transmit(&self, io: &mut dyn EndpointIo) {
        if io.is_full(self.in_endpoint) || io.is_stalled(self.in_endpoint) {
            return;
        }
        let mut buf = [0; MAX_BULK_PACKET];
        let n = {
            let tx = self.state.tx.borrow();
            let mut n = 0;
            for (slot, b) in buf.iter_mut().zip(tx.iter()) {
                *slot = *b;
                n += 1;
            }
            n
        };
        if n == 0 {
            return;
        }
        // Only drop what the hardware took.
        let sent = io.write(self.in_endpoint, &buf[..n]);
        let mut tx = self.state.tx.borrow_mut();
        for _ in 0..sent {
            tx.pop_front();
        }
    }

    fn receive(&self, io: &mut dyn EndpointIo) {
        if !io.is_full(self.out_endpoint) || io.is_stalled(self.out_endpoint) {
            return;
        }
        // Leave the packet in the hardware until a whole one fits.
        if self.state.rx_free() < MAX_BULK_PACKET {
            return;
        }
        let mut buf = [0; MAX_BULK_PACKET];
        let n = io.read(self.out_endpoint, &mut buf);
        {
            let mut rx = self.state.rx.borrow_mut();
            for &b in &buf[..n] {
                // Can't fail: we checked for a packet's worth of room.
                let _ = rx.push_back(b);
            }
        }
        if n > 0 {
            if let Some(h) = self.handler {
                h.data_available();
            }
        }
    }
}

impl<'a, 'c: 'a, const N: usize> Behaviour<'a> for CdcBehaviour<'c, N> {
    fn control_setup(&mut self, req: &mut ControlRequest<'_, 'a>) -> bool {
        let setup = *req.setup();
        let rt = setup.request_type;
        if rt.type_() != RequestTypeType::Class
            || rt.recipient() != Recipient::Interface
            || setup.index_low() != self.control_interface
        {
            return false;
        }
        match rt.data_phase_direction() {
            Dir::HostToDevice => self.set_request(req, &setup),
            Dir::DeviceToHost => self.get_request(req, &setup),
        }
    }

    fn control_data(&mut self, _setup: &SetupPacket, tag: u8, data: &[u8]) -> bool {
        match tag {
            TAG_COMM_FEATURE => {
                let Some(&bits) = data.first() else {
                    return false;
                };
                let idle = bits & ABSTRACT_STATE_IDLE != 0;
                self.state.idle.set(idle);
                if let Some(h) = self.handler {
                    h.idle_changed(idle);
                }
                true
            }
            TAG_LINE_CODING => {
                let Ok(coding) = LineCoding::read_from_bytes(data) else {
                    return false;
                };
                let ok = self.handler.map_or(true, |h| h.line_coding_changed(&coding));
                if ok {
                    self.state.line_coding.set(coding);
                }
                ok
            }
            _ => false,
        }
    }

    fn endpoint_data(&mut self, io: &mut dyn EndpointIo, physical: u8) -> bool {
        if physical == self.interrupt_endpoint {
            // Notifications aren't sent; nothing to refill.
            true
        } else if physical == self.in_endpoint {
            self.transmit(io);
            true
        } else if physical == self.out_endpoint {
            self.receive(io);
            true
        } else {
            false
        }
    }

    fn config_change(&mut self, _configuration: u8) {
        self.state.reset(self.default_coding);
    }

    fn interface_alt(&mut self, interface: u8, alt: u8) -> bool {
        // The data interface directly follows the control interface.
        alt == 0 && (interface == self.control_interface || interface == self.control_interface + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;
    use crate::device::UsbDevice;
    use crate::endpoint::{EP0_IN, EP0_OUT};
    use crate::fake::FakeUsb;
    use crate::protocol::{DeviceDescriptor, DeviceDescriptors};

    static CONFIG: [u8; 9] = [9, 2, 9, 0, 2, 1, 0, 0x80, 50];
    static CONFIGS: [&[u8]; 1] = [&CONFIG];

    // Interrupt 0x81 (physical 3), bulk IN 0x82 (5), bulk OUT 0x02 (4).
    const NOTIFY: u8 = 3;
    const BULK_IN: u8 = 5;
    const BULK_OUT: u8 = 4;

    #[derive(Default)]
    struct Recorder {
        lines: Cell<Option<ControlLines>>,
        breaks: Cell<u32>,
        available: Cell<u32>,
        refuse_rate: Cell<Option<u32>>,
    }

    impl CdcHandler for Recorder {
        fn line_coding_changed(&self, coding: &LineCoding) -> bool {
            self.refuse_rate.get() != Some(coding.rate.get())
        }

        fn control_lines_changed(&self, lines: ControlLines) {
            self.lines.set(Some(lines));
        }

        fn send_break(&self, _duration_ms: u16) {
            self.breaks.set(self.breaks.get() + 1);
        }

        fn data_available(&self) {
            self.available.set(self.available.get() + 1);
        }
    }

    fn run(
        dev: &mut UsbDevice<'_, FakeUsb>,
        setup: SetupPacket,
        out: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        dev.io_mut().clear_log();
        dev.io_mut().setup(setup);
        dev.handle_interrupt();
        if let Some(data) = out {
            dev.io_mut().out(data);
            dev.handle_interrupt();
        }
        if dev.io().stalled(EP0_IN) {
            dev.io_mut().set_stall_flag(EP0_IN, false);
            dev.io_mut().set_stall_flag(EP0_OUT, false);
            return None;
        }
        while dev.control_phase() == Phase::DataIn {
            dev.io_mut().in_done(EP0_IN);
            dev.handle_interrupt();
        }
        Some(dev.io().packets(EP0_IN).concat())
    }

    fn device(desc: &DeviceDescriptor) -> UsbDevice<'_, FakeUsb> {
        UsbDevice::new(
            FakeUsb::default(),
            DeviceDescriptors {
                device: desc.as_bytes(),
                configurations: &CONFIGS,
                strings: &[],
            },
        )
    }

    #[test]
    fn line_coding_round_trip() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<128>::new(LineCoding::default());
        let recorder = Recorder::default();
        recorder.refuse_rate.set(Some(300));
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state).with_handler(&recorder);
        {
            let mut dev = device(&desc);
            dev.add_behaviour(&mut cdc).unwrap();

            let got = run(&mut dev, SetupPacket::new(0xA1, 0x21, 0, 0, 7), None).unwrap();
            assert_eq!(got, [0x80, 0x25, 0, 0, 0, 0, 8]);

            let coding = [0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08];
            assert_eq!(
                run(&mut dev, SetupPacket::new(0x21, 0x20, 0, 0, 7), Some(&coding)),
                Some(vec![]),
            );
            assert_eq!(state.line_coding().rate.get(), 115_200);

            // Refused by the handler.
            let slow = [0x2C, 0x01, 0, 0, 0, 0, 8];
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x20, 0, 0, 7), Some(&slow)), None);
            assert_eq!(state.line_coding().rate.get(), 115_200);

            // Wrong size never reaches the data stage.
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x20, 0, 0, 6), None), None);

            let got = run(&mut dev, SetupPacket::new(0xA1, 0x21, 0, 0, 7), None).unwrap();
            assert_eq!(got, coding);
        }
    }

    #[test]
    fn control_lines_break_and_comm_feature() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<128>::new(LineCoding::default());
        let recorder = Recorder::default();
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state).with_handler(&recorder);
        {
            let mut dev = device(&desc);
            dev.add_behaviour(&mut cdc).unwrap();

            assert_eq!(
                run(&mut dev, SetupPacket::new(0x21, 0x22, 0x0003, 0, 0), None),
                Some(vec![]),
            );
            assert_eq!(
                run(&mut dev, SetupPacket::new(0x21, 0x23, 0xFFFF, 0, 0), None),
                Some(vec![]),
            );

            assert_eq!(
                run(&mut dev, SetupPacket::new(0x21, 0x02, 1, 0, 2), Some(&[1, 0])),
                Some(vec![]),
            );
            assert!(state.is_idle());
            assert_eq!(
                run(&mut dev, SetupPacket::new(0xA1, 0x03, 1, 0, 2), None),
                Some(vec![1, 0]),
            );
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x04, 1, 0, 0), None), Some(vec![]));
            assert!(!state.is_idle());
            // Country setting isn't supported.
            assert_eq!(run(&mut dev, SetupPacket::new(0xA1, 0x03, 2, 0, 2), None), None);
            // Requests to another interface fall through to a stall.
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x22, 0x0001, 1, 0), None), None);
        }
        assert_eq!(state.control_lines(), ControlLines::DTR | ControlLines::RTS);
        assert_eq!(recorder.lines.get(), Some(ControlLines::DTR | ControlLines::RTS));
        assert_eq!(recorder.breaks.get(), 1);
    }

    #[test]
    fn no_data_requests_with_a_length_stall() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<128>::new(LineCoding::default());
        let recorder = Recorder::default();
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state).with_handler(&recorder);
        {
            let mut dev = device(&desc);
            dev.add_behaviour(&mut cdc).unwrap();

            assert_eq!(
                run(&mut dev, SetupPacket::new(0x21, 0x02, 1, 0, 2), Some(&[1, 0])),
                Some(vec![]),
            );
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x04, 1, 0, 2), None), None);
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x22, 0x0003, 0, 1), None), None);
            assert_eq!(run(&mut dev, SetupPacket::new(0x21, 0x23, 0xFFFF, 0, 1), None), None);
        }
        assert!(state.is_idle());
        assert_eq!(state.control_lines(), ControlLines::empty());
        assert_eq!(recorder.lines.get(), None);
        assert_eq!(recorder.breaks.get(), 0);
    }

    #[test]
    fn bulk_data_moves_through_the_fifos() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<128>::new(LineCoding::default());
        let recorder = Recorder::default();
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state).with_handler(&recorder);
        let mut dev = device(&desc);
        dev.add_behaviour(&mut cdc).unwrap();

        assert_eq!(state.write_bytes(b"hello"), 5);
        dev.service_endpoint(BULK_IN);
        assert_eq!(dev.io().packets(BULK_IN), vec![b"hello".to_vec()]);
        assert_eq!(state.tx_len(), 0);

        // A stalled IN endpoint keeps its data queued.
        state.write_bytes(b"!");
        dev.io_mut().set_stall_flag(BULK_IN, true);
        dev.service_endpoint(BULK_IN);
        assert_eq!(state.tx_len(), 1);

        dev.io_mut().full = 1 << BULK_OUT;
        dev.io_mut().out_on(BULK_OUT, b"abc");
        dev.handle_interrupt();
        let mut buf = [0; 8];
        assert_eq!(state.read_bytes(&mut buf), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(recorder.available.get(), 1);

        // Notifications endpoint is accepted silently.
        dev.service_endpoint(NOTIFY);
        assert!(!dev.io().stalled(NOTIFY));
    }

    #[test]
    fn out_waits_for_room_for_a_whole_packet() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<96>::new(LineCoding::default());
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state);
        let mut dev = device(&desc);
        dev.add_behaviour(&mut cdc).unwrap();

        dev.io_mut().full = 1 << BULK_OUT;
        dev.io_mut().out_on(BULK_OUT, &[7; 64]);
        dev.handle_interrupt();
        assert_eq!(state.rx_len(), 64);

        dev.io_mut().out_on(BULK_OUT, &[8; 10]);
        dev.handle_interrupt();
        assert_eq!(state.rx_len(), 64);

        let mut buf = [0; 64];
        state.read_bytes(&mut buf);
        dev.service_endpoint(BULK_OUT);
        assert_eq!(state.rx_len(), 10);
    }

    #[test]
    fn configuration_resets_the_port() {
        let desc = DeviceDescriptor::default();
        let state = CdcState::<64>::new(LineCoding::default());
        let mut cdc = CdcBehaviour::new(0, 0x81, 0x82, 0x02, &state);
        {
            let mut dev = device(&desc);
            dev.add_behaviour(&mut cdc).unwrap();
            state.write_bytes(b"stale");
            let coding = [0x00, 0xC2, 0x01, 0x00, 0x00, 0x00, 0x08];
            run(&mut dev, SetupPacket::new(0x21, 0x20, 0, 0, 7), Some(&coding));
            run(&mut dev, SetupPacket::new(0x00, 9, 1, 0, 0), None);
        }
        assert_eq!(state.tx_len(), 0);
        assert_eq!(state.line_coding(), LineCoding::default());
    }
}
