//! Chapter 9 standard requests.
//!
//! Each handler checks the exact `bmRequestType`/`wValue`/`wIndex`/`wLength`
//! shape chapter 9 gives for its request and refuses anything else,
//! which ends in a stall of the control pipe.

use num_traits::FromPrimitive;

use crate::control::StatusCompletion;
use crate::device::{DeviceState, Event, UsbDevice, MAX_INTERFACES};
use crate::endpoint::{physical_from_address, UsbController, NUM_PHYSICAL_ENDPOINTS};
use crate::protocol::{
    DescriptorType, Dir, FeatureSelector, Recipient, RequestTypeType, SetupPacket, StdRequestCode,
};

impl<'a, C: UsbController> UsbDevice<'a, C> {
    pub(crate) fn handle_standard(&mut self) -> bool {
        let setup = self.control.setup;
        if setup.request_type.type_() != RequestTypeType::Standard {
            return false;
        }
        match StdRequestCode::from_u8(setup.request) {
            Some(StdRequestCode::GetStatus) => self.get_status(&setup),
            Some(StdRequestCode::ClearFeature) => self.set_feature(&setup, false),
            Some(StdRequestCode::SetFeature) => self.set_feature(&setup, true),
            Some(StdRequestCode::SetAddress) => self.set_address(&setup),
            Some(StdRequestCode::GetDescriptor) => self.get_descriptor(&setup),
            Some(StdRequestCode::GetConfiguration) => self.get_configuration(&setup),
            Some(StdRequestCode::SetConfiguration) => self.set_configuration(&setup),
            Some(StdRequestCode::GetInterface) => self.get_interface(&setup),
            Some(StdRequestCode::SetInterface) => self.set_interface(&setup),
            // Descriptors are read-only and we have no isochronous sync.
            Some(StdRequestCode::SetDescriptor) | Some(StdRequestCode::SynchFrame) | None => false,
        }
    }

    fn get_status(&mut self, setup: &SetupPacket) -> bool {
        let rt = setup.request_type;
        if rt.data_phase_direction() != Dir::DeviceToHost
            || setup.value.get() != 0
            || setup.length() != 2
        {
            return false;
        }
        let status = match rt.recipient() {
            Recipient::Device if setup.index.get() == 0 => [0, 0],
            Recipient::Interface if setup.index_high() == 0 => [0, 0],
            Recipient::Endpoint if setup.index_high() == 0 => {
                let physical = physical_from_address(setup.index_low());
                if physical >= NUM_PHYSICAL_ENDPOINTS {
                    return false;
                }
                [u8::from(self.io_mut().is_stalled(physical)), 0]
            }
            _ => return false,
        };
        self.control.respond_bytes(&status);
        true
    }

    fn set_feature(&mut self, setup: &SetupPacket, set: bool) -> bool {
        let rt = setup.request_type;
        if rt.data_phase_direction() != Dir::HostToDevice || setup.length() != 0 {
            return false;
        }
        let feature = FeatureSelector::from_u16(setup.value.get());
        match rt.recipient() {
            Recipient::Device => {
                // Nothing to do for remote wakeup or test mode, but they are
                // legitimate.
                setup.index.get() == 0
                    && matches!(
                        feature,
                        Some(FeatureSelector::DeviceRemoteWakeup | FeatureSelector::TestMode)
                    )
            }
            Recipient::Endpoint => {
                if feature != Some(FeatureSelector::EndpointHalt) || setup.index_high() != 0 {
                    return false;
                }
                let physical = physical_from_address(setup.index_low());
                if physical >= NUM_PHYSICAL_ENDPOINTS {
                    return false;
                }
                self.io_mut().set_stall(physical, set);
                true
            }
            _ => false,
        }
    }

    fn set_address(&mut self, setup: &SetupPacket) -> bool {
        if setup.request_type.0 != 0x00
            || setup.index.get() != 0
            || setup.length() != 0
            || setup.value_high() != 0
            || setup.value_low() >= 0x80
        {
            return false;
        }
        let address = setup.value_low();
        self.emit(Event::AddressPending(address));
        // Only after the status stage; the host is still talking to the
        // old address until then.
        self.control.on_status = Some(StatusCompletion::SetAddress(address));
        true
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> bool {
        let rt = setup.request_type;
        if rt.data_phase_direction() != Dir::DeviceToHost || rt.recipient() != Recipient::Device {
            return false;
        }
        let Some(type_) = DescriptorType::from_u8(setup.value_high()) else {
            return false;
        };
        match self.descriptors.find(type_, setup.value_low()) {
            Some(desc) => {
                self.control.respond(desc);
                true
            }
            None => false,
        }
    }

    fn get_configuration(&mut self, setup: &SetupPacket) -> bool {
        if setup.request_type.0 != 0x80
            || setup.value.get() != 0
            || setup.index.get() != 0
            || setup.length() != 1
        {
            return false;
        }
        let configuration = self.configuration;
        self.control.respond_bytes(&[configuration]);
        true
    }

    fn set_configuration(&mut self, setup: &SetupPacket) -> bool {
        if setup.request_type.0 != 0x00
            || setup.index.get() != 0
            || setup.length() != 0
            || setup.value_high() != 0
        {
            return false;
        }
        let value = setup.value_low();
        if !self.descriptors.has_configuration(value) {
            return false;
        }
        self.emit(Event::Configured(value));
        self.io_mut().set_configured(value != 0);
        self.configuration = value;
        self.state = if value == 0 {
            DeviceState::Address
        } else {
            DeviceState::Configured
        };
        self.alt_settings = [0; MAX_INTERFACES];
        for b in self.behaviours.iter_mut() {
            b.config_change(value);
        }
        true
    }

    fn get_interface(&mut self, setup: &SetupPacket) -> bool {
        if setup.request_type.0 != 0x81
            || setup.value.get() != 0
            || setup.index_high() != 0
            || setup.length() != 1
            || self.configuration == 0
        {
            return false;
        }
        let Some(alt) = self.alt_setting(setup.index_low()) else {
            return false;
        };
        self.control.respond_bytes(&[alt]);
        true
    }

    fn set_interface(&mut self, setup: &SetupPacket) -> bool {
        if setup.request_type.0 != 0x01
            || setup.value_high() != 0
            || setup.index_high() != 0
            || setup.length() != 0
            || self.configuration == 0
        {
            return false;
        }
        let interface = setup.index_low();
        let alt = setup.value_low();
        if usize::from(interface) >= MAX_INTERFACES {
            return false;
        }
        let accepted = self.behaviours.iter_mut().any(|b| b.interface_alt(interface, alt));
        if accepted {
            self.alt_settings[usize::from(interface)] = alt;
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use crate::behaviour::Behaviour;
    use crate::control::Phase;
    use crate::device::{DeviceState, UsbDevice};
    use crate::endpoint::{EP0_IN, EP0_OUT};
    use crate::fake::FakeUsb;
    use crate::protocol::{DeviceDescriptor, DeviceDescriptors, SetupPacket};

    static CONFIG: [u8; 9] = [9, 2, 9, 0, 1, 1, 0, 0x80, 50];
    static CONFIGS: [&[u8]; 1] = [&CONFIG];
    static STRINGS: [&[u8]; 0] = [];

    #[derive(Default)]
    struct Alternates {
        configs: Vec<u8>,
        alts: Vec<(u8, u8)>,
    }

    impl<'a> Behaviour<'a> for Alternates {
        fn config_change(&mut self, configuration: u8) {
            self.configs.push(configuration);
        }

        fn interface_alt(&mut self, interface: u8, alt: u8) -> bool {
            if interface == 1 && alt < 2 {
                self.alts.push((interface, alt));
                true
            } else {
                false
            }
        }
    }

    /// Runs one request through to completion of its data stage and returns
    /// what went out on EP0 IN, or None if it stalled.
    fn request(dev: &mut UsbDevice<'_, FakeUsb>, setup: SetupPacket) -> Option<Vec<u8>> {
        dev.io_mut().clear_log();
        dev.io_mut().setup(setup);
        dev.handle_interrupt();
        if dev.io().stalled(EP0_IN) {
            dev.io_mut().set_stall_flag(EP0_IN, false);
            dev.io_mut().set_stall_flag(EP0_OUT, false);
            return None;
        }
        while dev.control_phase() == Phase::DataIn {
            dev.io_mut().in_done(EP0_IN);
            dev.handle_interrupt();
        }
        match dev.control_phase() {
            Phase::StatusOut => {
                dev.io_mut().out(&[]);
                dev.handle_interrupt();
            }
            Phase::StatusIn => {
                dev.io_mut().in_done(EP0_IN);
                dev.handle_interrupt();
            }
            _ => {}
        }
        Some(dev.io().packets(EP0_IN).concat())
    }

    fn table(device: &DeviceDescriptor) -> DeviceDescriptors<'_> {
        DeviceDescriptors {
            device: device.as_bytes(),
            configurations: &CONFIGS,
            strings: &STRINGS,
        }
    }

    #[test]
    fn device_status() {
        let desc = DeviceDescriptor::default();
        let mut dev = UsbDevice::new(FakeUsb::default(), table(&desc));
        assert_eq!(request(&mut dev, SetupPacket::new(0x80, 0, 0, 0, 2)), Some(vec![0, 0]));
        // Wrong length.
        assert_eq!(request(&mut dev, SetupPacket::new(0x80, 0, 0, 0, 4)), None);
        // Nonzero index for the device.
        assert_eq!(request(&mut dev, SetupPacket::new(0x80, 0, 0, 1, 2)), None);
        assert_eq!(request(&mut dev, SetupPacket::new(0x81, 0, 0, 1, 2)), Some(vec![0, 0]));
    }

    #[test]
    fn endpoint_halt_round_trip() {
        let desc = DeviceDescriptor::default();
        let mut dev = UsbDevice::new(FakeUsb::default(), table(&desc));
        // SET_FEATURE(ENDPOINT_HALT) on 0x81.
        assert_eq!(request(&mut dev, SetupPacket::new(0x02, 3, 0, 0x81, 0)), Some(vec![]));
        assert!(dev.io().stalled(3));
        assert_eq!(request(&mut dev, SetupPacket::new(0x82, 0, 0, 0x81, 2)), Some(vec![1, 0]));
        // CLEAR_FEATURE(ENDPOINT_HALT).
        assert_eq!(request(&mut dev, SetupPacket::new(0x02, 1, 0, 0x81, 0)), Some(vec![]));
        assert!(!dev.io().stalled(3));
        assert_eq!(request(&mut dev, SetupPacket::new(0x82, 0, 0, 0x81, 2)), Some(vec![0, 0]));
        // Unknown feature selector on an endpoint.
        assert_eq!(request(&mut dev, SetupPacket::new(0x02, 3, 5, 0x81, 0)), None);
        // Interface features don't exist.
        assert_eq!(request(&mut dev, SetupPacket::new(0x01, 3, 0, 0, 0)), None);
        // Remote wakeup is accepted and ignored.
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 3, 1, 0, 0)), Some(vec![]));
    }

    #[test]
    fn set_address_shape() {
        let desc = DeviceDescriptor::default();
        let mut dev = UsbDevice::new(FakeUsb::default(), table(&desc));
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 5, 0x80, 0, 0)), None);
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 5, 0x0105, 0, 0)), None);
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 5, 5, 0, 1)), None);
        assert_eq!(dev.io().address, 0);
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 5, 0x7F, 0, 0)), Some(vec![]));
        assert_eq!(dev.io().address, 0x7F);
    }

    #[test]
    fn configuration_lifecycle() {
        let desc = DeviceDescriptor::default();
        let mut alts = Alternates::default();
        {
            let mut dev = UsbDevice::new(FakeUsb::default(), table(&desc));
            dev.add_behaviour(&mut alts).unwrap();

            // Interface requests need a configuration.
            assert_eq!(request(&mut dev, SetupPacket::new(0x81, 10, 0, 1, 1)), None);

            assert_eq!(request(&mut dev, SetupPacket::new(0x00, 9, 2, 0, 0)), None);
            assert_eq!(request(&mut dev, SetupPacket::new(0x00, 9, 1, 0, 0)), Some(vec![]));
            assert_eq!(dev.state(), DeviceState::Configured);
            assert!(dev.io().configured);
            assert_eq!(request(&mut dev, SetupPacket::new(0x80, 8, 0, 0, 1)), Some(vec![1]));
            assert_eq!(request(&mut dev, SetupPacket::new(0x80, 8, 0, 0, 2)), None);

            assert_eq!(request(&mut dev, SetupPacket::new(0x01, 11, 1, 1, 0)), Some(vec![]));
            assert_eq!(request(&mut dev, SetupPacket::new(0x81, 10, 0, 1, 1)), Some(vec![1]));
            assert_eq!(dev.alt_setting(1), Some(1));
            // Refused by every behaviour.
            assert_eq!(request(&mut dev, SetupPacket::new(0x01, 11, 3, 1, 0)), None);
            assert_eq!(request(&mut dev, SetupPacket::new(0x01, 11, 0, 2, 0)), None);

            // Reconfiguring resets alternates.
            assert_eq!(request(&mut dev, SetupPacket::new(0x00, 9, 1, 0, 0)), Some(vec![]));
            assert_eq!(dev.alt_setting(1), Some(0));

            assert_eq!(request(&mut dev, SetupPacket::new(0x00, 9, 0, 0, 0)), Some(vec![]));
            assert_eq!(dev.state(), DeviceState::Address);
            assert!(!dev.io().configured);
        }
        assert_eq!(alts.configs, [1, 1, 0]);
        assert_eq!(alts.alts, [(1, 1)]);
    }

    #[test]
    fn descriptor_requests_must_target_the_device() {
        let desc = DeviceDescriptor::default();
        let mut dev = UsbDevice::new(FakeUsb::default(), table(&desc));
        assert_eq!(request(&mut dev, SetupPacket::new(0x81, 6, 0x0100, 0, 18)), None);
        assert_eq!(
            request(&mut dev, SetupPacket::new(0x80, 6, 0x0200, 0, 4)),
            Some(CONFIG[..4].to_vec()),
        );
        // Class and vendor requests don't reach the standard handlers.
        assert_eq!(request(&mut dev, SetupPacket::new(0xA0, 6, 0x0100, 0, 18)), None);
        // Set descriptor and synch frame are unsupported.
        assert_eq!(request(&mut dev, SetupPacket::new(0x00, 7, 0x0100, 0, 0)), None);
        assert_eq!(request(&mut dev, SetupPacket::new(0x82, 12, 0, 0x83, 2)), None);
    }
}
