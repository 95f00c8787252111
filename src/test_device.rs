//! Dev-hooks synthetic HID device: a small JSON spec, deserialized and
//! turned into an [`crate::hid::HidDeviceConfig`], for exercising the
//! server from test scripts without a real OS-level USB/IP client.
//!
//! Only compiled when the `dev-hooks` feature is enabled.
#[cfg(feature = "dev-hooks")]
pub mod spec {
    use std::sync::Arc;

    use serde::Deserialize;

    use crate::hid::HidDeviceConfig;

    /// A one-byte "press button 0" HID report descriptor, used when a
    /// JSON spec doesn't supply its own.
    const DEFAULT_REPORT_DESCRIPTOR: &[u8] = &[
        0x05, 0x01, // Usage Page (Generic Desktop Ctrls)
        0x09, 0x02, // Usage (Mouse)
        0xA1, 0x01, // Collection (Application)
        0x09, 0x01, //   Usage (Pointer)
        0xA1, 0x00, //   Collection (Physical)
        0x05, 0x09, //     Usage Page (Button)
        0x19, 0x01, //     Usage Minimum (0x01)
        0x29, 0x01, //     Usage Maximum (0x01)
        0x15, 0x00, //     Logical Minimum (0)
        0x25, 0x01, //     Logical Maximum (1)
        0x95, 0x01, //     Report Count (1)
        0x75, 0x08, //     Report Size (8)
        0x81, 0x02, //     Report Input (Data, Variable, Absolute)
        0xC0, //   End Collection
        0xC0, // End Collection
    ];

    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct TestHidDeviceSpec {
        pub vendor_id: u16,
        pub product_id: u16,
        pub device_version: u16,
        pub language_id: u16,
        pub manufacturer: String,
        pub product: String,
        pub interface: String,
        pub serial_number: String,
        pub report_descriptors: Vec<Vec<u8>>,
        pub auto_attach: bool,
    }

    impl Default for TestHidDeviceSpec {
        fn default() -> Self {
            Self {
                vendor_id: 0x1209, // pid.codes open source
                product_id: 0xFFFF,
                device_version: 0x0100,
                language_id: 0x0409, // en-US
                manufacturer: "USBIP-VirtPP".to_string(),
                product: "Test HID Device".to_string(),
                interface: "Test HID Device".to_string(),
                serial_number: "0000".to_string(),
                report_descriptors: Vec::new(),
                auto_attach: false,
            }
        }
    }

    /// Parses a JSON string into a [`TestHidDeviceSpec`]. An empty or
    /// `"{}"` string produces the minimum sane defaults.
    pub fn parse_json(json: &str) -> Result<TestHidDeviceSpec, serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(TestHidDeviceSpec::default());
        }
        serde_json::from_str(json)
    }

    /// Builds a [`HidDeviceConfig`] from a parsed spec. The device always
    /// replies to interrupt-IN polls with zero-filled reports of the
    /// expected length; use [`crate::hid::HidDevice::set_state`]-style
    /// mutation on real profiles for anything that needs live data.
    pub fn build_hid_device_config(mut device_spec: TestHidDeviceSpec) -> HidDeviceConfig {
        if device_spec.report_descriptors.is_empty() {
            device_spec.report_descriptors.push(DEFAULT_REPORT_DESCRIPTOR.to_vec());
        }

        HidDeviceConfig {
            vendor_id: device_spec.vendor_id,
            product_id: device_spec.product_id,
            device_version: device_spec.device_version,
            language_id: device_spec.language_id,
            manufacturer: device_spec.manufacturer,
            product: device_spec.product,
            interface: device_spec.interface,
            serial_number: device_spec.serial_number,
            report_descriptors: device_spec.report_descriptors,
            auto_attach: device_spec.auto_attach,
            on_get_input_report: Arc::new(|request, _report_id, expected_length| {
                Box::pin(async move {
                    let data = vec![0u8; expected_length as usize];
                    match request.send_reply(&data).await {
                        Ok(()) => 0,
                        Err(_) => -1,
                    }
                })
            }),
            on_set_output_report: None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_json_yields_minimum_sane_defaults() {
            let spec = parse_json("").unwrap();
            assert_eq!(spec.vendor_id, 0x1209);
            assert!(spec.report_descriptors.is_empty());
        }

        #[test]
        fn partial_json_overrides_only_given_fields() {
            let spec = parse_json(r#"{"product": "Spec Fixture Pad"}"#).unwrap();
            assert_eq!(spec.product, "Spec Fixture Pad");
            assert_eq!(spec.vendor_id, 0x1209);
        }

        #[test]
        fn build_config_fills_in_default_report_descriptor() {
            let spec = parse_json("").unwrap();
            let config = build_hid_device_config(spec);
            assert_eq!(config.report_descriptors.len(), 1);
            assert_eq!(config.report_descriptors[0], DEFAULT_REPORT_DESCRIPTOR);
        }
    }
}
