//! Virtual device registry: busses × devices, bus-ID generation, and
//! submission routing.

use std::sync::Arc;

use crate::device::{Device, DeviceConfig};

/// An ordered sequence of devices; its 1-based position in the owning
/// [`Registry`] is its bus number.
pub struct Bus {
    devices: Vec<Arc<Device>>,
}

impl Bus {
    fn new() -> Self {
        Self { devices: Vec::new() }
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }
}

/// Busses and devices registered on an [`crate::instance::Instance`].
///
/// Constructed (via [`Registry::add_device`]) before `Run`; treated as
/// append-only while the server is running.
#[derive(Default)]
pub struct Registry {
    busses: Vec<Bus>,
}

impl Registry {
    pub fn new() -> Self {
        Self { busses: Vec::new() }
    }

    /// Registers a device, appending it to the last bus (creating bus 1 if
    /// the registry is currently empty).
    pub fn add_device(&mut self, config: DeviceConfig) -> Arc<Device> {
        if self.busses.is_empty() {
            self.busses.push(Bus::new());
        }
        let bus_num = self.busses.len() as u32;
        let bus = self.busses.last_mut().expect("just ensured non-empty");
        let dev_num = bus.devices.len() as u32 + 1;
        let device = Device::new(bus_num, dev_num, config);
        bus.devices.push(Arc::clone(&device));
        device
    }

    pub fn busses(&self) -> &[Bus] {
        &self.busses
    }

    /// All devices in bus-then-device order, as `OP_REQ_DEVLIST` enumerates
    /// them.
    pub fn devices_in_order(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.busses.iter().flat_map(|bus| bus.devices.iter())
    }

    pub fn find_by_bus_id(&self, bus_id: &str) -> Option<&Arc<Device>> {
        self.devices_in_order().find(|d| d.bus_id() == bus_id)
    }

    pub fn find_by_device_id(&self, device_id: u32) -> Option<&Arc<Device>> {
        self.devices_in_order().find(|d| d.device_id() == device_id)
    }

    pub fn len(&self) -> usize {
        self.devices_in_order().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::descriptors::DeviceDescriptor;
    use std::sync::Arc as StdArc;

    fn dummy_config() -> DeviceConfig {
        DeviceConfig {
            device_descriptor: DeviceDescriptor {
                bcd_usb: 0x0200,
                device_class: 0,
                device_subclass: 0,
                device_protocol: 0,
                max_packet_size0: 0x40,
                vendor_id: 0x4242,
                product_id: 0x4242,
                bcd_device: 0x0100,
                i_manufacturer: 0,
                i_product: 0,
                i_serial_number: 0,
                num_configurations: 1,
            },
            interfaces: vec![],
            auto_attach: false,
            on_input_request: StdArc::new(|_req, _ep, _rt, _rc, _v, _i, _l| 0),
            on_output_request: None,
        }
    }

    #[test]
    fn addressing_matches_one_based_bus_then_device() {
        let mut registry = Registry::new();
        let d1 = registry.add_device(dummy_config());
        let d2 = registry.add_device(dummy_config());
        assert_eq!(d1.bus_id(), "1-1");
        assert_eq!(d1.device_id(), 0x0001_0001);
        assert_eq!(d2.bus_id(), "1-2");
        assert_eq!(d2.device_id(), 0x0001_0002);
    }

    #[test]
    fn lookup_by_bus_id_and_device_id() {
        let mut registry = Registry::new();
        let d1 = registry.add_device(dummy_config());
        assert!(StdArc::ptr_eq(registry.find_by_bus_id("1-1").unwrap(), &d1));
        assert!(StdArc::ptr_eq(registry.find_by_device_id(0x0001_0001).unwrap(), &d1));
        assert!(registry.find_by_bus_id("9-9").is_none());
    }
}
