//! HID class behaviour.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use smart_default::SmartDefault;
use zerocopy::little_endian::U16;
use zerocopy_derive::{Immutable, IntoBytes, Unaligned};

use crate::behaviour::Behaviour;
use crate::control::ControlRequest;
use crate::endpoint::{physical_from_address, EndpointIo, MAX_BULK_PACKET};
use crate::protocol::{Dir, Recipient, RequestTypeType, SetupPacket, StdRequestCode};

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, IntoBytes, Unaligned, Immutable)]
#[repr(u8)]
pub enum HidClassDescriptorType {
    Hid = 0x21,
    Report = 0x22,
    Physical = 0x33,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum HidRequestCode {
    GetReport = 1,
    GetIdle = 2,
    GetProtocol = 3,
    SetReport = 9,
    SetIdle = 0xA,
    SetProtocol = 0xB,
}

/// `wValueH` of GET_REPORT/SET_REPORT.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

pub const PROTOCOL_BOOT: u8 = 0;
pub const PROTOCOL_REPORT: u8 = 1;

/// Idle rate after configuration, in 4 ms units (500 ms).
pub const DEFAULT_IDLE: u8 = 128;

#[derive(Clone, Debug, IntoBytes, Unaligned, Immutable, SmartDefault)]
#[repr(C)]
pub struct HidDescriptor {
    #[default = 9]
    pub length: u8,
    #[default(HidClassDescriptorType::Hid)]
    pub type_: HidClassDescriptorType,
    #[default(U16::new(0x0111))]
    pub hid_version: U16,
    pub country_code: u8,
    #[default = 1]
    pub num_descriptors: u8,
    #[default(HidClassDescriptorType::Report as u8)]
    pub descriptor_type: u8,
    pub descriptor_length: U16,
}

/// Where reports come from and go to. Implementations are shared with the
/// application, so they take `&self` and use interior mutability.
pub trait HidReports {
    /// GET_REPORT: writes the current report into `buf` and returns its
    /// length.
    fn get_report(&self, report_type: ReportType, report_id: u8, buf: &mut [u8]) -> usize;

    /// SET_REPORT data from the host. Returning false stalls the request.
    fn set_report(&self, _report_type: ReportType, _report_id: u8, _data: &[u8]) -> bool {
        false
    }

    /// The report to send on the interrupt endpoint now, or 0 if nothing
    /// changed.
    fn poll_report(&self, _buf: &mut [u8]) -> usize {
        0
    }
}

const SET_REPORT: u8 = 0;

pub struct HidBehaviour<'a> {
    interface: u8,
    hid_descriptor: &'a [u8],
    report_descriptor: &'a [u8],
    in_endpoint: u8,
    reports: &'a dyn HidReports,
    protocol: u8,
    idle: u8,
}

impl<'a> HidBehaviour<'a> {
    /// `in_endpoint` is the interrupt IN endpoint address, e.g. `0x81`.
    pub fn new(
        interface: u8,
        hid_descriptor: &'a [u8],
        report_descriptor: &'a [u8],
        in_endpoint: u8,
        reports: &'a dyn HidReports,
    ) -> Self {
        let declared = hid_descriptor.first().map_or(0, |&n| usize::from(n));
        Self {
            interface,
            hid_descriptor: &hid_descriptor[..declared.min(hid_descriptor.len())],
            report_descriptor,
            in_endpoint: physical_from_address(in_endpoint),
            reports,
            protocol: PROTOCOL_REPORT,
            idle: DEFAULT_IDLE,
        }
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn idle(&self) -> u8 {
        self.idle
    }

    /// Sends the current input report on the interrupt endpoint if its
    /// buffer is free and there is something to send.
    pub fn push_report(&self, io: &mut dyn EndpointIo) -> bool {
        if io.is_full(self.in_endpoint) {
            return false;
        }
        let mut buf = [0; MAX_BULK_PACKET];
        let n = self.reports.poll_report(&mut buf).min(buf.len());
        n > 0 && io.write(self.in_endpoint, &buf[..n]) == n
    }

    fn class_request(&mut self, req: &mut ControlRequest<'_, '_>, setup: &SetupPacket) -> bool {
        let dir = setup.request_type.data_phase_direction();
        match (dir, HidRequestCode::from_u8(setup.request)) {
            (Dir::DeviceToHost, Some(HidRequestCode::GetIdle)) => {
                req.respond_bytes(&[self.idle]);
                true
            }
            (Dir::HostToDevice, Some(HidRequestCode::SetIdle)) => {
                if setup.length() != 0 {
                    return false;
                }
                self.idle = setup.value_high();
                true
            }
            (Dir::DeviceToHost, Some(HidRequestCode::GetProtocol)) => {
                req.respond_bytes(&[self.protocol]);
                true
            }
            (Dir::HostToDevice, Some(HidRequestCode::SetProtocol)) => {
                if setup.length() != 0 {
                    return false;
                }
                self.protocol = setup.value_low();
                true
            }
            (Dir::DeviceToHost, Some(HidRequestCode::GetReport)) => {
                let Some(report_type) = ReportType::from_u8(setup.value_high()) else {
                    return false;
                };
                let reports = self.reports;
                let id = setup.value_low();
                req.respond_with(|buf| reports.get_report(report_type, id, buf));
                true
            }
            (Dir::HostToDevice, Some(HidRequestCode::SetReport)) => {
                ReportType::from_u8(setup.value_high()).is_some() && req.receive(SET_REPORT)
            }
            _ => false,
        }
    }
}

impl<'a, 'h: 'a> Behaviour<'a> for HidBehaviour<'h> {
    fn control_setup(&mut self, req: &mut ControlRequest<'_, 'a>) -> bool {
        let setup = *req.setup();
        let rt = setup.request_type;
        if rt.recipient() != Recipient::Interface || setup.index_low() != self.interface {
            return false;
        }
        match rt.type_() {
            // GET_DESCRIPTOR addressed to the interface is how the host
            // finds our class descriptors.
            RequestTypeType::Standard => {
                if rt.data_phase_direction() != Dir::DeviceToHost
                    || setup.request != StdRequestCode::GetDescriptor as u8
                {
                    return false;
                }
                match HidClassDescriptorType::from_u8(setup.value_high()) {
                    Some(HidClassDescriptorType::Hid) => req.respond(self.hid_descriptor),
                    Some(HidClassDescriptorType::Report) => req.respond(self.report_descriptor),
                    _ => return false,
                }
                true
            }
            RequestTypeType::Class => self.class_request(req, &setup),
            _ => false,
        }
    }

    fn control_data(&mut self, setup: &SetupPacket, tag: u8, data: &[u8]) -> bool {
        match (tag, ReportType::from_u8(setup.value_high())) {
            (SET_REPORT, Some(report_type)) => {
                self.reports.set_report(report_type, setup.value_low(), data)
            }
            _ => false,
        }
    }

    fn endpoint_data(&mut self, io: &mut dyn EndpointIo, physical: u8) -> bool {
        if physical != self.in_endpoint {
            return false;
        }
        self.push_report(io);
        true
    }

    fn config_change(&mut self, _configuration: u8) {
        self.protocol = PROTOCOL_REPORT;
        self.idle = DEFAULT_IDLE;
    }

    fn interface_alt(&mut self, interface: u8, alt: u8) -> bool {
        interface == self.interface && alt == 0
    }
}
