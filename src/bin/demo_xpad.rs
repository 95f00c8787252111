//! Registers a single synthetic XPad, auto-attaches it, and nudges its
//! state once a second so it's visible as a live gamepad to anything bound
//! to the USB/IP port. Not a required deliverable; it exists to show the
//! XPad profile is actually expressible end to end.

use tracing_subscriber::EnvFilter;
use usbip_virtpp::registry::Registry;
use usbip_virtpp::xpad::{XPad, XPadConfig, BUTTON_A};
use usbip_virtpp::{Instance, InstanceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut registry = Registry::new();
    let xpad = XPad::register(&mut registry, XPadConfig { auto_attach: true });

    let instance = Instance::create(InstanceConfig::default(), registry).await?;
    tracing::info!(port = instance.get_port_number(), "XPad demo listening");

    let poker = xpad.clone();
    tokio::spawn(async move {
        let mut pressed = false;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            pressed = !pressed;
            poker
                .update_in_place(|state| {
                    state.buttons = if pressed { BUTTON_A } else { 0 };
                })
                .await;
        }
    });

    instance.run().await?;
    Ok(())
}
