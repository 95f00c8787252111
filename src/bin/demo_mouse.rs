//! Registers a minimal one-button HID mouse and nudges its report once a
//! second, demonstrating the generic-HID profile end to end. Not a
//! required deliverable; see `demo_xpad` for the other built-in profile.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use usbip_virtpp::hid::{HidDevice, HidDeviceConfig};
use usbip_virtpp::registry::Registry;
use usbip_virtpp::{Instance, InstanceConfig};

/// Usage Page (Generic Desktop) / Usage (Mouse) / one button, no movement.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0x09, 0x01, 0xA1, 0x00, 0x05, 0x09, 0x19, 0x01, 0x29, 0x01,
    0x15, 0x00, 0x25, 0x01, 0x95, 0x01, 0x75, 0x08, 0x81, 0x02, 0xC0, 0xC0,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut registry = Registry::new();
    let config = HidDeviceConfig {
        vendor_id: 0x1209,
        product_id: 0xFFFE,
        device_version: 0x0100,
        language_id: 0x0409,
        manufacturer: "USBIP-VirtPP".to_string(),
        product: "Demo Mouse".to_string(),
        interface: "Demo Mouse".to_string(),
        serial_number: "0001".to_string(),
        report_descriptors: vec![REPORT_DESCRIPTOR.to_vec()],
        auto_attach: true,
        on_get_input_report: Arc::new(|request, _report_id, expected_length| {
            Box::pin(async move {
                let mut data = vec![0u8; expected_length as usize];
                if let Some(byte) = data.first_mut() {
                    *byte = 0x01;
                }
                match request.send_reply(&data).await {
                    Ok(()) => 0,
                    Err(_) => -1,
                }
            })
        }),
        on_set_output_report: None,
    };
    let mouse = HidDevice::register(&mut registry, config);

    let instance = Instance::create(InstanceConfig::default(), registry).await?;
    tracing::info!(port = instance.get_port_number(), "mouse demo listening");

    let ticker = mouse.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            ticker.mark_dirty().await;
        }
    });

    instance.run().await?;
    Ok(())
}
