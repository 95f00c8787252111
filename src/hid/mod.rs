//! Standard/HID request handler.
//!
//! Wraps a [`crate::device::Device`] whose `OnInputRequest` /
//! `OnOutputRequest` synthesise chapter-9 + HID-class replies from declared
//! descriptors, plus a pending-input queue for deferred interrupt-IN
//! replies.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

use crate::device::{Device, DeviceConfig};
use crate::error::USB_STALL_STATUS;
use crate::registry::Registry;
use crate::request::Request;
use crate::wire::descriptors::{
    encode_string_descriptor, encode_string_descriptor_ascii, ConfigurationDescriptor,
    DeviceDescriptor, EndpointDescriptor, HidDescriptor, HidReportEntry, InterfaceDescriptor,
};
use crate::wire::usbip::InterfaceRecord;

pub type InputReportFuture = Pin<Box<dyn Future<Output = i32> + Send>>;
/// `fn(request, report_id, expected_length) -> status` (async).
pub type OnGetInputReport = Arc<dyn Fn(Arc<Request>, u8, u16) -> InputReportFuture + Send + Sync>;
/// `fn(request, report_id, payload) -> status` (async).
pub type OnSetOutputReport =
    Arc<dyn Fn(Arc<Request>, u8, Vec<u8>) -> InputReportFuture + Send + Sync>;

const STRING_INDEX_LANG_ID: u8 = 0;
const STRING_INDEX_MANUFACTURER: u8 = 1;
const STRING_INDEX_PRODUCT: u8 = 2;
const STRING_INDEX_SERIAL_NUMBER: u8 = 3;
const STRING_INDEX_INTERFACE: u8 = 4;

const REQUEST_GET_STATUS: u8 = 0x00;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const REQUEST_SET_CONFIGURATION: u8 = 0x09;
const REQUEST_SET_IDLE: u8 = 0x0A;
const REQUEST_SET_REPORT: u8 = 0x09;
/// MS "Extended Compat ID" probe code used by generic HID and XPad alike.
const REQUEST_MS_EXTENDED_COMPAT_ID: u8 = 0x04;

/// `bmRequestType` Type-field mask (bits 6:5): Standard=0x00, Class=0x20,
/// Vendor=0x40.
const REQUEST_TYPE_TYPE_MASK: u8 = 0x60;
const REQUEST_TYPE_CLASS: u8 = 0x20;

const DESCRIPTOR_TYPE_DEVICE: u16 = 0x01;
const DESCRIPTOR_TYPE_CONFIGURATION: u16 = 0x02;
const DESCRIPTOR_TYPE_STRING: u16 = 0x03;
const DESCRIPTOR_TYPE_HID_REPORT: u16 = 0x22;

/// Configuration surface for [`HidDevice::new`].
pub struct HidDeviceConfig {
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
    pub on_get_input_report: OnGetInputReport,
    pub on_set_output_report: Option<OnSetOutputReport>,
}

struct PendingRequest {
    request: Arc<Request>,
    expected_length: u16,
}

/// Builds the standard DEVICE descriptor + aggregated CONFIGURATION blob
/// for a generic-HID interface.
struct Descriptors {
    device: DeviceDescriptor,
    configuration_blob: Vec<u8>,
}

fn build_descriptors(config: &HidDeviceConfig) -> Descriptors {
    const ENDPOINT_IN_ADDRESS: u8 = 0x81;
    const ENDPOINT_OUT_ADDRESS: u8 = 0x02;
    const ENDPOINT_IN_MAX_PACKET: u16 = 8;
    const ENDPOINT_OUT_MAX_PACKET: u16 = 4;
    const FIXED_INTERVAL_MS: u8 = 0x0A;

    let report_count = config.report_descriptors.len();
    let total_length = ConfigurationDescriptor::SIZE
        + InterfaceDescriptor::SIZE
        + HidDescriptor::SIZE
        + HidReportEntry::SIZE * report_count
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
    .expect("writing to a Vec never fails");

    InterfaceDescriptor {
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0x03, // HID
        interface_subclass: 0,
        interface_protocol: 0,
        i_interface: STRING_INDEX_INTERFACE,
    }
    .encode(&mut blob)
    .expect("writing to a Vec never fails");

    HidDescriptor {
        bcd_hid: 0x0111,
        country_code: 0,
        num_descriptors: report_count as u8,
    }
    .encode(&mut blob)
    .expect("writing to a Vec never fails");

    for report in &config.report_descriptors {
        HidReportEntry {
            length: report.len() as u16,
        }
        .encode(&mut blob)
        .expect("writing to a Vec never fails");
    }

    EndpointDescriptor {
        endpoint_address: ENDPOINT_IN_ADDRESS,
        bm_attributes: EndpointDescriptor::ATTRIBUTES_INTERRUPT,
        max_packet_size: ENDPOINT_IN_MAX_PACKET,
        interval: FIXED_INTERVAL_MS,
    }
    .encode(&mut blob)
    .expect("writing to a Vec never fails");

    EndpointDescriptor {
        endpoint_address: ENDPOINT_OUT_ADDRESS,
        bm_attributes: EndpointDescriptor::ATTRIBUTES_INTERRUPT,
        max_packet_size: ENDPOINT_OUT_MAX_PACKET,
        interval: FIXED_INTERVAL_MS,
    }
    .encode(&mut blob)
    .expect("writing to a Vec never fails");

    let device = DeviceDescriptor {
        bcd_usb: 0x0200,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        max_packet_size0: 0x40,
        vendor_id: config.vendor_id,
        product_id: config.product_id,
        bcd_device: config.device_version,
        i_manufacturer: STRING_INDEX_MANUFACTURER,
        i_product: STRING_INDEX_PRODUCT,
        i_serial_number: STRING_INDEX_SERIAL_NUMBER,
        num_configurations: 1,
    };

    Descriptors {
        device,
        configuration_blob: blob,
    }
}

/// The HID profile: owns its wrapped [`Device`] plus the pending
/// interrupt-IN queue.
pub struct HidDevice {
    device_descriptor: DeviceDescriptor,
    configuration_blob: Vec<u8>,
    report_descriptors: Vec<Vec<u8>>,
    language_id: u16,
    manufacturer: String,
    product: String,
    interface: String,
    serial_number: String,
    on_get_input_report: OnGetInputReport,
    on_set_output_report: Option<OnSetOutputReport>,
    pending: tokio::sync::Mutex<VecDeque<PendingRequest>>,
    device: std::sync::OnceLock<Arc<Device>>,
}

impl HidDevice {
    /// Registers a new HID device on `registry`, wiring its callbacks to
    /// close over the returned `Arc<HidDevice>` (composition, not virtual
    /// dispatch).
    pub fn register(registry: &mut Registry, config: HidDeviceConfig) -> Arc<Self> {
        if config.report_descriptors.is_empty() {
            panic!("HidDevice requires at least one report descriptor");
        }
        let descriptors = build_descriptors(&config);
        let hid = Arc::new(Self {
            device_descriptor: descriptors.device,
            configuration_blob: descriptors.configuration_blob,
            report_descriptors: config.report_descriptors,
            language_id: config.language_id,
            manufacturer: config.manufacturer,
            product: config.product,
            interface: config.interface,
            serial_number: config.serial_number,
            on_get_input_report: config.on_get_input_report,
            on_set_output_report: config.on_set_output_report,
            pending: tokio::sync::Mutex::new(VecDeque::new()),
            device: std::sync::OnceLock::new(),
        });

        let input_hid = Arc::clone(&hid);
        let output_hid = Arc::clone(&hid);

        let device_config = DeviceConfig {
            device_descriptor: hid.device_descriptor,
            interfaces: vec![InterfaceRecord {
                class: 0x03,
                subclass: 0,
                protocol: 0,
            }],
            auto_attach: config.auto_attach,
            on_input_request: Arc::new(move |request, endpoint, request_type, request_code, value, index, length| {
                let hid = Arc::clone(&input_hid);
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(hid.handle_input(
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
                    let hid = Arc::clone(&output_hid);
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(hid.handle_output(
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
        hid.device.set(device).ok();
        hid
    }

    pub fn device(&self) -> &Arc<Device> {
        self.device.get().expect("HidDevice::register always sets this")
    }

    async fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        Some(match index {
            STRING_INDEX_LANG_ID => encode_string_descriptor(&[self.language_id]),
            STRING_INDEX_MANUFACTURER => encode_string_descriptor_ascii(&self.manufacturer),
            STRING_INDEX_PRODUCT => encode_string_descriptor_ascii(&self.product),
            STRING_INDEX_SERIAL_NUMBER => encode_string_descriptor_ascii(&self.serial_number),
            STRING_INDEX_INTERFACE => encode_string_descriptor_ascii(&self.interface),
            _ => return None,
        })
    }

    /// Standard-request handling on EP0, plus interrupt-IN deferral on EP1.
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
        if endpoint == 1 {
            return self.handle_interrupt_in(request, length).await;
        }
        if endpoint != 0 {
            warn!(endpoint, "HID input request on unsupported endpoint");
            return self.stall(&request).await;
        }

        if request_type == 0xC0 && request_code == REQUEST_MS_EXTENDED_COMPAT_ID {
            return self.stall(&request).await;
        }

        match request_code {
            REQUEST_GET_STATUS => self.reply_ok(&request, &[0u8, 0u8]).await,
            REQUEST_GET_DESCRIPTOR => {
                let descriptor_type = (value >> 8) as u16;
                let descriptor_index = (value & 0xFF) as u8;
                match descriptor_type {
                    DESCRIPTOR_TYPE_DEVICE => {
                        self.reply_ok(&request, &self.device_descriptor.to_bytes()).await
                    }
                    DESCRIPTOR_TYPE_CONFIGURATION => {
                        self.reply_ok(&request, &self.configuration_blob).await
                    }
                    DESCRIPTOR_TYPE_STRING => match self.string_descriptor(descriptor_index).await {
                        Some(bytes) => self.reply_ok(&request, &bytes).await,
                        None => self.stall(&request).await,
                    },
                    DESCRIPTOR_TYPE_HID_REPORT => {
                        match self.report_descriptors.get(descriptor_index as usize) {
                            Some(bytes) => self.reply_ok(&request, bytes).await,
                            None => self.stall(&request).await,
                        }
                    }
                    _ => self.stall(&request).await,
                }
            }
            _ => {
                let _ = index;
                self.stall(&request).await
            }
        }
    }

    async fn handle_interrupt_in(self: Arc<Self>, request: Arc<Request>, length: u16) -> i32 {
        let mut pending = self.pending.lock().await;
        pending.push_back(PendingRequest {
            request,
            expected_length: length,
        });
        0
    }

    /// `MarkDirty`: dequeues the oldest pending interrupt-IN request (if
    /// any) and invokes `onGetInputReport`.
    pub async fn mark_dirty(self: &Arc<Self>) {
        let next = {
            let mut pending = self.pending.lock().await;
            pending.pop_front()
        };
        let Some(PendingRequest { request, expected_length }) = next else {
            return;
        };
        let status = (self.on_get_input_report)(request, 0, expected_length).await;
        if status != 0 {
            warn!(status, "onGetInputReport returned non-zero status");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_output(
        self: Arc<Self>,
        request: Arc<Request>,
        endpoint: u8,
        request_type: u8,
        request_code: u8,
        value: u16,
        _index: u16,
        _length: u16,
        payload: Vec<u8>,
    ) -> i32 {
        if endpoint != 0 {
            warn!(endpoint, "HID output request on unsupported endpoint");
            return self.stall(&request).await;
        }

        let is_class = request_type & REQUEST_TYPE_TYPE_MASK == REQUEST_TYPE_CLASS;
        let is_standard = request_type & REQUEST_TYPE_TYPE_MASK == 0;

        if is_standard && request_code == REQUEST_SET_CONFIGURATION {
            return self.reply_ok(&request, &[]).await;
        }

        if is_class && request_code == REQUEST_SET_IDLE {
            let duration = (value >> 8) as u8;
            return if duration == 0 {
                self.reply_ok(&request, &[]).await
            } else {
                self.stall(&request).await
            };
        }

        if is_class && request_code == REQUEST_SET_REPORT {
            if let Some(callback) = self.on_set_output_report.clone() {
                let report_id = (value & 0xFF) as u8;
                return callback(request, report_id, payload).await;
            }
        }

        self.stall(&request).await
    }

    async fn reply_ok(&self, request: &Arc<Request>, data: &[u8]) -> i32 {
        match request.send_reply(data).await {
            Ok(()) => 0,
            Err(err) => {
                warn!(error = %err, "failed to send HID reply");
                -1
            }
        }
    }

    async fn stall(&self, request: &Arc<Request>) -> i32 {
        match request.send_error_reply(USB_STALL_STATUS).await {
            Ok(()) => 0,
            Err(err) => {
                warn!(error = %err, "failed to send HID STALL reply");
                -1
            }
        }
    }
}
