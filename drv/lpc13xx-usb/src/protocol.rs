//! USB 2.0 chapter 9 wire structures.

use num_derive::FromPrimitive;
use smart_default::SmartDefault;
use zerocopy::little_endian::U16;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, Unaligned};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: RequestType,
    pub request: u8,
    pub value: U16,
    pub index: U16,
    pub length: U16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type: RequestType(request_type),
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    pub fn value_low(&self) -> u8 {
        self.value.get() as u8
    }

    pub fn value_high(&self) -> u8 {
        (self.value.get() >> 8) as u8
    }

    pub fn index_low(&self) -> u8 {
        self.index.get() as u8
    }

    pub fn index_high(&self) -> u8 {
        (self.index.get() >> 8) as u8
    }

    pub fn length(&self) -> usize {
        usize::from(self.length.get())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Unaligned, Immutable)]
#[repr(transparent)]
pub struct RequestType(pub u8);

impl RequestType {
    pub fn data_phase_direction(self) -> Dir {
        if self.0 & 0x80 == 0 {
            Dir::HostToDevice
        } else {
            Dir::DeviceToHost
        }
    }

    pub fn type_(self) -> RequestTypeType {
        match (self.0 >> 5) & 0b11 {
            0 => RequestTypeType::Standard,
            1 => RequestTypeType::Class,
            2 => RequestTypeType::Vendor,
            _ => RequestTypeType::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            x => Recipient::Reserved(x),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dir {
    HostToDevice,
    DeviceToHost,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestTypeType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, IntoBytes, Unaligned, Immutable)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    ClassInterface = 0x24,
    ClassEndpoint = 0x25,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum StdRequestCode {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum FeatureSelector {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
}

#[derive(Clone, Debug, IntoBytes, Unaligned, SmartDefault, Immutable)]
#[repr(C)]
pub struct DeviceDescriptor {
    #[default = 18]
    pub length: u8,
    #[default(DescriptorType::Device)]
    pub type_: DescriptorType,
    #[default(U16::new(0x0200))]
    pub usb_version: U16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    #[default = 64]
    pub max_packet_size0: u8,
    pub vendor: U16,
    pub product: U16,
    pub device_version: U16,
    pub manufacturer_string: u8,
    pub product_string: u8,
    pub serial_string: u8,
    #[default = 1]
    pub num_configurations: u8,
}

#[derive(Clone, Debug, IntoBytes, Unaligned, SmartDefault, Immutable)]
#[repr(C)]
pub struct ConfigDescriptor {
    #[default = 9]
    pub length: u8,
    #[default(DescriptorType::Configuration)]
    pub type_: DescriptorType,
    pub total_length: U16,
    pub num_interfaces: u8,
    #[default = 1]
    pub configuration_value: u8,
    pub configuration_string: u8,
    #[default = 0x80]
    pub attributes: u8,
    #[default = 50]
    pub max_power: u8,
}

#[derive(Clone, Debug, IntoBytes, Unaligned, SmartDefault, Immutable)]
#[repr(C)]
pub struct InterfaceDescriptor {
    #[default = 9]
    pub length: u8,
    #[default(DescriptorType::Interface)]
    pub type_: DescriptorType,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_string: u8,
}

#[derive(Clone, Debug, IntoBytes, Unaligned, SmartDefault, Immutable)]
#[repr(C)]
pub struct EndpointDescriptor {
    #[default = 7]
    pub length: u8,
    #[default(DescriptorType::Endpoint)]
    pub type_: DescriptorType,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: U16,
    pub interval: u8,
}

/// A string descriptor assembled in RAM from UTF-16 code units.
///
/// Index 0 is conventionally the language table, e.g. `&[0x0409]` for en_US.
/// Text that doesn't fit in `N` bytes is truncated.
pub struct StringDescriptor<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> StringDescriptor<N> {
    pub fn new(text: &[u16]) -> Self {
        let mut bytes = [0; N];
        let mut len = 2;
        for hw in text {
            if len + 2 > N || len + 2 > usize::from(u8::MAX) {
                break;
            }
            bytes[len..len + 2].copy_from_slice(&hw.to_le_bytes());
            len += 2;
        }
        bytes[0] = len as u8;
        bytes[1] = DescriptorType::String as u8;
        Self { bytes, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// The descriptor tables a device answers `GET_DESCRIPTOR` from.
///
/// Configuration descriptors are the full compound blob (configuration,
/// interfaces, class descriptors, endpoints) with `wTotalLength` at bytes
/// 2..4.
#[derive(Copy, Clone, Debug)]
pub struct DeviceDescriptors<'a> {
    pub device: &'a [u8],
    pub configurations: &'a [&'a [u8]],
    pub strings: &'a [&'a [u8]],
}

impl<'a> DeviceDescriptors<'a> {
    /// Looks up a descriptor by type and index and trims it to its own
    /// declared length.
    pub fn find(&self, type_: DescriptorType, index: u8) -> Option<&'a [u8]> {
        let index = usize::from(index);
        let (desc, declared) = match type_ {
            DescriptorType::Device if index == 0 => {
                let d = self.device;
                (d, usize::from(*d.first()?))
            }
            DescriptorType::Configuration => {
                let d = *self.configurations.get(index)?;
                let total = u16::from_le_bytes([*d.get(2)?, *d.get(3)?]);
                (d, usize::from(total))
            }
            DescriptorType::String => {
                let d = *self.strings.get(index)?;
                (d, usize::from(*d.first()?))
            }
            _ => return None,
        };
        Some(&desc[..declared.min(desc.len())])
    }

    /// Returns true if `value` is zero or the `bConfigurationValue` of one
    /// of our configurations.
    pub fn has_configuration(&self, value: u8) -> bool {
        value == 0 || self.configurations.iter().any(|c| c.get(5) == Some(&value))
    }
}
