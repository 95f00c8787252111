//! The virtual USB device model: descriptor state plus URB dispatch.
//!
//! A [`Device`] is composition of descriptor state plus a pair of callback
//! closures — never a trait object. Profiles such as [`crate::hid`] and
//! [`crate::xpad`] build a `Device` whose callbacks close over their own
//! state, per the "tagged descriptors vs inheritance" design note.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::warn;

use crate::request::Request;
use crate::wire::descriptors::DeviceDescriptor;
use crate::wire::usbip::InterfaceRecord;

/// `fn(request, endpoint, request_type, request_code, value, index, length) -> status`
pub type InputCallback =
    Arc<dyn Fn(Arc<Request>, u8, u8, u8, u16, u16, u16) -> i32 + Send + Sync>;

/// `fn(request, endpoint, request_type, request_code, value, index, length, payload) -> status`
pub type OutputCallback =
    Arc<dyn Fn(Arc<Request>, u8, u8, u8, u16, u16, u16, Vec<u8>) -> i32 + Send + Sync>;

const STANDARD_REQUEST_SET_CONFIGURATION: u8 = 0x09;
/// `bmRequestType` mask isolating the Type field (bits 6:5); Standard == 0.
const REQUEST_TYPE_TYPE_MASK: u8 = 0x60;

/// Static configuration for a [`Device`], mirroring the source's
/// `Device_Create` parameter block.
pub struct DeviceConfig {
    pub device_descriptor: DeviceDescriptor,
    pub interfaces: Vec<InterfaceRecord>,
    pub auto_attach: bool,
    pub on_input_request: InputCallback,
    pub on_output_request: Option<OutputCallback>,
}

/// A virtual USB device registered on a [`crate::registry::Bus`].
pub struct Device {
    pub bus_num: u32,
    pub dev_num: u32,
    pub device_descriptor: DeviceDescriptor,
    pub interfaces: Vec<InterfaceRecord>,
    pub auto_attach: bool,
    on_input_request: InputCallback,
    on_output_request: Option<OutputCallback>,
    /// Serialises concurrent `SendReply` bodies originating from this
    /// device. The connection's writer itself is additionally serialised
    /// (see [`crate::request::Request`]), so this mutex exists for
    /// data-model fidelity rather than being the sole guard against
    /// interleaved writes.
    reply_mutex: tokio::sync::Mutex<()>,
}

impl Device {
    pub(crate) fn new(bus_num: u32, dev_num: u32, config: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            bus_num,
            dev_num,
            device_descriptor: config.device_descriptor,
            interfaces: config.interfaces,
            auto_attach: config.auto_attach,
            on_input_request: config.on_input_request,
            on_output_request: config.on_output_request,
            reply_mutex: tokio::sync::Mutex::new(()),
        })
    }

    pub fn bus_id(&self) -> String {
        crate::wire::usbip::bus_id_string(self.bus_num, self.dev_num)
    }

    pub fn device_id(&self) -> u32 {
        crate::wire::usbip::device_id(self.bus_num, self.dev_num)
    }

    /// Guard used by [`Request::send_reply_bytes`] to serialise this
    /// device's replies.
    pub(crate) async fn reply_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.reply_mutex.lock().await
    }

    /// Dispatches an IN-direction URB: no payload, callback decides
    /// whether/what to reply.
    pub async fn dispatch_input(
        self: &Arc<Self>,
        request: Arc<Request>,
        endpoint: u8,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> i32 {
        let callback = self.on_input_request.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(|| {
            callback(request, endpoint, request_type, request_code, value, index, length)
        })) {
            Ok(status) => status,
            Err(_) => {
                warn!(bus_id = %self.bus_id(), "onInputRequest callback panicked; treating as a dispatch failure");
                -1
            }
        }
    }

    /// Dispatches an OUT-direction URB. Falls back to the default contract
    /// (no-op on `SET_CONFIGURATION`, STALL otherwise) when the device did
    /// not supply `onOutputRequest`.
    pub async fn dispatch_output(
        self: &Arc<Self>,
        request: Arc<Request>,
        endpoint: u8,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        length: u16,
        payload: Vec<u8>,
    ) -> i32 {
        if let Some(callback) = self.on_output_request.clone() {
            return match std::panic::catch_unwind(AssertUnwindSafe(|| {
                callback(request, endpoint, request_type, request_code, value, index, length, payload)
            })) {
                Ok(status) => status,
                Err(_) => {
                    warn!(bus_id = %self.bus_id(), "onOutputRequest callback panicked; treating as a dispatch failure");
                    -1
                }
            };
        }

        if request_type & REQUEST_TYPE_TYPE_MASK == 0 && request_code == STANDARD_REQUEST_SET_CONFIGURATION {
            if let Err(err) = request.send_reply(&[]).await {
                warn!(bus_id = %self.bus_id(), error = %err, "failed to send default SET_CONFIGURATION reply");
                return -1;
            }
            return 0;
        }

        if let Err(err) = request.send_error_reply(crate::error::USB_STALL_STATUS).await {
            warn!(bus_id = %self.bus_id(), error = %err, "failed to send default STALL reply");
            return -1;
        }
        0
    }
}
