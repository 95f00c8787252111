//! The XPad (XUSB/Xbox 360 controller) profile.
//!
//! Builds the vendor-specific XUSB interface stack plus the MS OS
//! string/Extended-Compat-ID dance that lets Windows bind `xusb22.sys`
//! without an INF, and answers the gamepad IN/OUT endpoints.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::device::{Device, DeviceConfig};
use crate::error::USB_STALL_STATUS;
use crate::registry::Registry;
use crate::request::Request;
use crate::wire::descriptors::{ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use crate::wire::primitives::{write_u16_le, write_u8};
use crate::wire::usbip::InterfaceRecord;

pub const BUTTON_DPAD_UP: u16 = 1 << 0;
pub const BUTTON_DPAD_DOWN: u16 = 1 << 1;
pub const BUTTON_DPAD_LEFT: u16 = 1 << 2;
pub const BUTTON_DPAD_RIGHT: u16 = 1 << 3;
pub const BUTTON_START: u16 = 1 << 4;
pub const BUTTON_BACK: u16 = 1 << 5;
pub const BUTTON_LEFT_THUMB: u16 = 1 << 6;
pub const BUTTON_RIGHT_THUMB: u16 = 1 << 7;
pub const BUTTON_LEFT_SHOULDER: u16 = 1 << 8;
pub const BUTTON_RIGHT_SHOULDER: u16 = 1 << 9;
pub const BUTTON_GUIDE: u16 = 1 << 10;
pub const BUTTON_BINDING: u16 = 1 << 11;
pub const BUTTON_A: u16 = 1 << 12;
pub const BUTTON_B: u16 = 1 << 13;
pub const BUTTON_X: u16 = 1 << 14;
pub const BUTTON_Y: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XPadState {
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub thumb_left_x: i16,
    pub thumb_left_y: i16,
    pub thumb_right_x: i16,
    pub thumb_right_y: i16,
}

enum Endpoint {
    Control = 0,
    GamepadIn = 1,
    GamepadOut = 2,
}

mod string_index {
    pub const LANG_ID: u8 = 0;
    pub const MANUFACTURER: u8 = 1;
    pub const PRODUCT: u8 = 2;
    pub const SERIAL_NUMBER: u8 = 3;
    pub const MSOS: u8 = 0xEE;
}

const REQUEST_TYPE_TYPE_MASK: u8 = 0x60;
const REQUEST_TYPE_STANDARD: u8 = 0x00;
const REQUEST_TYPE_VENDOR: u8 = 0x40;
const REQUEST_TYPE_RECIPIENT_MASK: u8 = 0x1F;
const REQUEST_TYPE_RECIPIENT_DEVICE: u8 = 0x00;

const REQUEST_GET_STATUS: u8 = 0x00;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const REQUEST_SET_CONFIGURATION: u8 = 0x09;
const REQUEST_SET_IDLE: u8 = 0x0A;

const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
const DESCRIPTOR_TYPE_DEVICE_QUALIFIER: u8 = 0x06;
const DESCRIPTOR_TYPE_BOS: u8 = 0x0F;

const VENDOR_CODE_MSOS: u8 = 0x04;
const MSOS_COMPAT_ID_INDEX: u16 = 0x0004;
const VENDOR_REQUEST_SERIAL_NUMBER: u8 = 0x01;

fn encode_msos_string() -> Vec<u8> {
    let signature = [b'M', b'S', b'F', b'T', b'1', b'0', b'0'];
    let mut buf = Vec::with_capacity(18);
    write_u8(&mut buf, 0x12).unwrap();
    write_u8(&mut buf, DESCRIPTOR_TYPE_STRING).unwrap();
    for ch in signature {
        write_u16_le(&mut buf, ch as u16).unwrap();
    }
    write_u8(&mut buf, VENDOR_CODE_MSOS).unwrap();
    write_u8(&mut buf, 0x00).unwrap();
    buf
}

fn encode_extended_compat_id() -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    // dwLength/bcdVersion/wIndex are little-endian in the original struct
    // (plain host-order fields, same convention as SETUP packets).
    buf.extend_from_slice(&40u32.to_le_bytes());
    buf.extend_from_slice(&0x0100u16.to_le_bytes());
    buf.extend_from_slice(&MSOS_COMPAT_ID_INDEX.to_le_bytes());
    buf.push(0x01); // bCount
    buf.extend_from_slice(&[0u8; 7]); // reserved0
    buf.push(0x00); // bFirstInterfaceNumber
    buf.push(0x01); // bNumInterfaces
    let mut compatible_id = [0u8; 8];
    compatible_id[..6].copy_from_slice(b"XUSB10");
    buf.extend_from_slice(&compatible_id);
    buf.extend_from_slice(&[0u8; 8]); // subCompatibleID
    buf.extend_from_slice(&[0u8; 6]); // reserved1
    debug_assert_eq!(buf.len(), 40);
    buf
}

fn encode_gamepad_input_report(state: XPadState, led: u8, rumble_level: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(26);
    write_u8(&mut buf, 0x00).unwrap(); // bReportID
    write_u8(&mut buf, 0x14).unwrap(); // bSize (20)
    write_u16_le(&mut buf, state.buttons).unwrap();
    write_u8(&mut buf, state.left_trigger).unwrap();
    write_u8(&mut buf, state.right_trigger).unwrap();
    write_u16_le(&mut buf, state.thumb_left_x as u16).unwrap();
    write_u16_le(&mut buf, state.thumb_left_y as u16).unwrap();
    write_u16_le(&mut buf, state.thumb_right_x as u16).unwrap();
    write_u16_le(&mut buf, state.thumb_right_y as u16).unwrap();
    buf.extend_from_slice(&[0u8; 6]); // padding
    debug_assert_eq!(buf.len(), 20);

    write_u8(&mut buf, 0x01).unwrap(); // GamepadLEDStatusReport.bReportID
    write_u8(&mut buf, 0x03).unwrap(); // bSize
    write_u8(&mut buf, led).unwrap();

    write_u8(&mut buf, 0x03).unwrap(); // GamepadRumbleLevelStatusReport.bReportID
    write_u8(&mut buf, 0x03).unwrap(); // bSize
    write_u8(&mut buf, rumble_level).unwrap();

    debug_assert_eq!(buf.len(), 26);
    buf
}

fn build_device_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        bcd_usb: 0x0200,
        device_class: 0xFF,
        device_subclass: 0xFF,
        device_protocol: 0xFF,
        max_packet_size0: 0x08,
        vendor_id: 0x1209, // pid.codes open source
        product_id: 0x0003,
        bcd_device: 0x0100,
        i_manufacturer: string_index::MANUFACTURER,
        i_product: string_index::PRODUCT,
        i_serial_number: string_index::SERIAL_NUMBER,
        num_configurations: 1,
    }
}

fn build_configuration_blob() -> Vec<u8> {
    const XUSB_INTERFACE_DESCRIPTOR_LEN: usize = 15;
    let total_length = ConfigurationDescriptor::SIZE
        + InterfaceDescriptor::SIZE
        + XUSB_INTERFACE_DESCRIPTOR_LEN
        + EndpointDescriptor::SIZE * 2;

    let mut blob = Vec::with_capacity(total_length);
    ConfigurationDescriptor {
        total_length: total_length as u16,
        num_interfaces: 1,
        configuration_value: 1,
        i_configuration: 0,
        bm_attributes: ConfigurationDescriptor::ATTRIBUTES_BUS_POWERED_REMOTE_WAKE,
        max_power: 0x32,
    }
    .encode(&mut blob)
    .unwrap();

    InterfaceDescriptor {
        interface_number: Endpoint::Control as u8,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0xFF, // vendor-specific
        interface_subclass: 0x5D, // XUSB
        interface_protocol: 0x01, // XUSB GamePad
        i_interface: 0,
    }
    .encode(&mut blob)
    .unwrap();

    // Vendor-specific XUSB interface descriptor: no standard struct for
    // this one, so it's hand-laid-out per `detail-XPad.hpp`.
    write_u8(&mut blob, XUSB_INTERFACE_DESCRIPTOR_LEN as u8).unwrap();
    write_u8(&mut blob, 0x21).unwrap();
    write_u16_le(&mut blob, 0x0100).unwrap(); // bcdXUSB
    write_u8(&mut blob, 0x01).unwrap(); // bDeviceSubtype: wired game controller
    write_u16_le(&mut blob, 0x8100 | 0x20 | 0x03).unwrap(); // wReports0
    blob.extend_from_slice(&[20, 3, 3]); // bReportSize0[3]: input reports
    write_u16_le(&mut blob, 0x0200 | 0x10 | 0x03).unwrap(); // wReports
    blob.extend_from_slice(&[8, 3, 3]); // bReportSize1[3]: output reports

    EndpointDescriptor {
        endpoint_address: 0x81,
        bm_attributes: EndpointDescriptor::ATTRIBUTES_INTERRUPT,
        max_packet_size: 0x0020,
        interval: 0x04,
    }
    .encode(&mut blob)
    .unwrap();

    EndpointDescriptor {
        endpoint_address: 0x02,
        bm_attributes: EndpointDescriptor::ATTRIBUTES_INTERRUPT,
        max_packet_size: 0x0020,
        interval: 0x08,
    }
    .encode(&mut blob)
    .unwrap();

    debug_assert_eq!(blob.len(), total_length);
    blob
}

/// Configuration surface for [`XPad::register`].
#[derive(Default)]
pub struct XPadConfig {
    pub auto_attach: bool,
}

struct GamepadStatus {
    led: u8,
    rumble_level: u8,
    rumble_big_magnitude: u8,
    rumble_small_magnitude: u8,
}

impl Default for GamepadStatus {
    fn default() -> Self {
        Self {
            led: 0,
            rumble_level: 0, // GamepadRumbleLevelStatusReport defaults to 0
            rumble_big_magnitude: 0,
            rumble_small_magnitude: 0,
        }
    }
}

/// A synthetic Xbox 360 controller.
pub struct XPad {
    state: Mutex<XPadState>,
    status: Mutex<GamepadStatus>,
    device: std::sync::OnceLock<Arc<Device>>,
    device_descriptor: DeviceDescriptor,
    configuration_blob: Vec<u8>,
    /// Monotonic counter mixed into the derived serial number so two XPads
    /// in one process don't collide even if `Arc` addresses were reused.
    instance_ordinal: u16,
}

static NEXT_ORDINAL: AtomicU16 = AtomicU16::new(0);

impl XPad {
    pub fn register(registry: &mut Registry, config: XPadConfig) -> Arc<Self> {
        let xpad = Arc::new(Self {
            state: Mutex::new(XPadState::default()),
            status: Mutex::new(GamepadStatus::default()),
            device: std::sync::OnceLock::new(),
            device_descriptor: build_device_descriptor(),
            configuration_blob: build_configuration_blob(),
            instance_ordinal: NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed),
        });

        let input_xpad = Arc::clone(&xpad);
        let output_xpad = Arc::clone(&xpad);

        let device_config = DeviceConfig {
            device_descriptor: xpad.device_descriptor,
            interfaces: vec![InterfaceRecord {
                class: 0xFF,
                subclass: 0x5D,
                protocol: 0x01,
            }],
            auto_attach: config.auto_attach,
            on_input_request: Arc::new(move |request, endpoint, request_type, request_code, value, index, length| {
                let xpad = Arc::clone(&input_xpad);
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(xpad.handle_input(
                        request,
                        endpoint,
                        request_type,
                        request_code,
                        value,
                        index,
                        length,
                    ))
                })
            }),
            on_output_request: Some(Arc::new(
                move |request, endpoint, request_type, request_code, value, index, length, payload| {
                    let xpad = Arc::clone(&output_xpad);
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(xpad.handle_output(
                            request,
                            endpoint,
                            request_type,
                            request_code,
                            value,
                            index,
                            length,
                            payload,
                        ))
                    })
                },
            )),
        };

        let device = registry.add_device(device_config);
        xpad.device.set(device).ok();
        xpad
    }

    pub fn device(&self) -> &Arc<Device> {
        self.device.get().expect("XPad::register always sets this")
    }

    /// `XPad_SetState`: replaces the reported gamepad state wholesale.
    pub async fn set_state(&self, state: XPadState) {
        *self.state.lock().await = state;
    }

    /// `XPad_UpdateInPlace`: mutate the current state via `mutator`.
    pub async fn update_in_place(&self, mutator: impl FnOnce(&mut XPadState)) {
        let mut state = self.state.lock().await;
        mutator(&mut state);
    }

    fn derive_serial_number(&self) -> u32 {
        let address = Arc::as_ptr(self.device.get().expect("set before any request arrives")) as u64;
        let mixed = ((address >> 32) ^ address) & 0xFFFF_FF0F;
        (mixed as u32) ^ (self.instance_ordinal as u32)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_input(
        self: Arc<Self>,
        request: Arc<Request>,
        endpoint: u8,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> i32 {
        match endpoint {
            e if e == Endpoint::Control as u8 => {
                self.handle_control_input(request, request_type, request_code, value, index, length).await
            }
            e if e == Endpoint::GamepadIn as u8 => self.handle_gamepad_input(request, request_type, request_code).await,
            _ => {
                warn!(endpoint, "XPad input request on unsupported endpoint");
                self.stall(&request).await
            }
        }
    }

    async fn handle_control_input(
        &self,
        request: Arc<Request>,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        _length: u16,
    ) -> i32 {
        let is_standard = request_type & REQUEST_TYPE_TYPE_MASK == REQUEST_TYPE_STANDARD;
        let is_vendor = request_type & REQUEST_TYPE_TYPE_MASK == REQUEST_TYPE_VENDOR;

        if is_standard {
            return match request_code {
                REQUEST_GET_STATUS => self.reply_ok(&request, &[0u8, 0u8]).await,
                REQUEST_GET_DESCRIPTOR => {
                    let descriptor_type = (value >> 8) as u8;
                    let descriptor_index = (value & 0xFF) as u8;
                    match descriptor_type {
                        DESCRIPTOR_TYPE_DEVICE => self.reply_ok(&request, &self.device_descriptor.to_bytes()).await,
                        DESCRIPTOR_TYPE_CONFIGURATION => self.reply_ok(&request, &self.configuration_blob).await,
                        DESCRIPTOR_TYPE_STRING => self.reply_string(&request, descriptor_index).await,
                        DESCRIPTOR_TYPE_DEVICE_QUALIFIER | DESCRIPTOR_TYPE_BOS => self.stall(&request).await,
                        _ => self.stall(&request).await,
                    }
                }
                _ => self.stall(&request).await,
            };
        }

        if is_vendor {
            if request_code == VENDOR_CODE_MSOS && index == MSOS_COMPAT_ID_INDEX {
                return self.reply_ok(&request, &encode_extended_compat_id()).await;
            }
            let recipient = request_type & REQUEST_TYPE_RECIPIENT_MASK;
            if recipient == REQUEST_TYPE_RECIPIENT_DEVICE && request_code == VENDOR_REQUEST_SERIAL_NUMBER {
                let serial = self.derive_serial_number();
                info!(serial = format!("{serial:#010x}"), "XPad serial number");
                return self.reply_ok(&request, &serial.to_le_bytes()).await;
            }
            warn!(
                request_type = format!("{request_type:#04x}"),
                request_code = format!("{request_code:#04x}"),
                "unhandled vendor control input request"
            );
            return self.stall(&request).await;
        }

        self.stall(&request).await
    }

    async fn reply_string(&self, request: &Arc<Request>, index: u8) -> i32 {
        match index {
            string_index::LANG_ID => self.reply_ok(request, &crate::wire::descriptors::encode_string_descriptor(&[0x0409])).await,
            string_index::MANUFACTURER => self.reply_ok(request, &crate::wire::descriptors::encode_string_descriptor_ascii("Fred Emmott")).await,
            string_index::PRODUCT => {
                self.reply_ok(request, &crate::wire::descriptors::encode_string_descriptor_ascii("XBOX 360 For Windows")).await
            }
            string_index::SERIAL_NUMBER => self.reply_ok(request, &crate::wire::descriptors::encode_string_descriptor_ascii("1234")).await,
            string_index::MSOS => self.reply_ok(request, &encode_msos_string()).await,
            _ => self.stall(request).await,
        }
    }

    async fn handle_gamepad_input(&self, request: Arc<Request>, request_type: u8, request_code: u8) -> i32 {
        if request_type != 0 || request_code != 0 {
            return self.stall(&request).await;
        }
        let state = *self.state.lock().await;
        let status = self.status.lock().await;
        let report = encode_gamepad_input_report(state, status.led, status.rumble_level);
        self.reply_ok(&request, &report).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_output(
        self: Arc<Self>,
        request: Arc<Request>,
        endpoint: u8,
        request_type: u8,
        request_code: u8,
        _value: u16,
        _index: u16,
        _length: u16,
        payload: Vec<u8>,
    ) -> i32 {
        match endpoint {
            e if e == Endpoint::Control as u8 => {
                let is_standard = request_type & REQUEST_TYPE_TYPE_MASK == REQUEST_TYPE_STANDARD;
                if is_standard && (request_code == REQUEST_SET_CONFIGURATION || request_code == REQUEST_SET_IDLE) {
                    self.reply_ok(&request, &[]).await
                } else {
                    self.stall(&request).await
                }
            }
            e if e == Endpoint::GamepadOut as u8 => self.handle_gamepad_output(request, payload).await,
            _ => {
                warn!(endpoint, "XPad output request on unsupported endpoint");
                self.stall(&request).await
            }
        }
    }

    async fn handle_gamepad_output(&self, request: Arc<Request>, payload: Vec<u8>) -> i32 {
        if payload.len() < 3 {
            warn!(len = payload.len(), "XPad gamepad OUT report too short");
            return self.stall(&request).await;
        }
        let report_id = payload[0];
        let mut status = self.status.lock().await;
        match report_id {
            0x00 => {
                // Rumble motor control: big/small magnitude, no host effect.
                status.rumble_big_magnitude = payload.get(2).copied().unwrap_or(0);
                status.rumble_small_magnitude = payload.get(3).copied().unwrap_or(0);
                self.reply_ok(&request, &[]).await
            }
            0x01 => {
                status.led = payload[2];
                info!(led = format!("{:#04x}", status.led), "XPad LED state changed");
                self.reply_ok(&request, &[]).await
            }
            0x02 => {
                status.rumble_level = payload[2];
                info!(level = format!("{:#04x}", status.rumble_level), "XPad rumble level changed");
                self.reply_ok(&request, &[]).await
            }
            _ => {
                drop(status);
                self.stall(&request).await
            }
        }
    }

    async fn reply_ok(&self, request: &Arc<Request>, data: &[u8]) -> i32 {
        match request.send_reply(data).await {
            Ok(()) => 0,
            Err(err) => {
                warn!(error = %err, "failed to send XPad reply");
                -1
            }
        }
    }

    async fn stall(&self, request: &Arc<Request>) -> i32 {
        match request.send_error_reply(USB_STALL_STATUS).await {
            Ok(()) => 0,
            Err(err) => {
                warn!(error = %err, "failed to send XPad STALL reply");
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_blob_matches_declared_total_length() {
        let blob = build_configuration_blob();
        let declared = u16::from_le_bytes([blob[2], blob[3]]) as usize;
        assert_eq!(blob.len(), declared);
    }

    #[test]
    fn extended_compat_id_is_forty_bytes_with_xusb10() {
        let reply = encode_extended_compat_id();
        assert_eq!(reply.len(), 40);
        assert_eq!(&reply[20..26], b"XUSB10");
    }

    #[test]
    fn msos_string_is_eighteen_bytes() {
        let reply = encode_msos_string();
        assert_eq!(reply.len(), 0x12);
        assert_eq!(reply[0], 0x12);
        assert_eq!(reply[1], 0x03);
    }

    #[test]
    fn gamepad_input_report_is_twenty_six_bytes() {
        let report = encode_gamepad_input_report(XPadState::default(), 0, 0);
        assert_eq!(report.len(), 26);
        assert_eq!(report[0], 0x00);
        assert_eq!(report[1], 0x14);
    }
}
