//! Packed, little-endian USB chapter-9 and HID class descriptors.
//!
//! These are the records synthesised into a device's CONFIGURATION blob
//! and served verbatim in response to `GET_DESCRIPTOR`.

use super::primitives::{read_u16_le, read_u8, write_u16_le, write_u8};
use std::io::{self, Read, Write};

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_TYPE_HID: u8 = 0x21;
pub const DESCRIPTOR_TYPE_HID_REPORT: u8 = 0x22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, Self::SIZE as u8)?;
        write_u8(w, DESCRIPTOR_TYPE_DEVICE)?;
        write_u16_le(w, self.bcd_usb)?;
        write_u8(w, self.device_class)?;
        write_u8(w, self.device_subclass)?;
        write_u8(w, self.device_protocol)?;
        write_u8(w, self.max_packet_size0)?;
        write_u16_le(w, self.vendor_id)?;
        write_u16_le(w, self.product_id)?;
        write_u16_le(w, self.bcd_device)?;
        write_u8(w, self.i_manufacturer)?;
        write_u8(w, self.i_product)?;
        write_u8(w, self.i_serial_number)?;
        write_u8(w, self.num_configurations)
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let _length = read_u8(r)?;
        let _ty = read_u8(r)?;
        Ok(Self {
            bcd_usb: read_u16_le(r)?,
            device_class: read_u8(r)?,
            device_subclass: read_u8(r)?,
            device_protocol: read_u8(r)?,
            max_packet_size0: read_u8(r)?,
            vendor_id: read_u16_le(r)?,
            product_id: read_u16_le(r)?,
            bcd_device: read_u16_le(r)?,
            i_manufacturer: read_u8(r)?,
            i_product: read_u8(r)?,
            i_serial_number: read_u8(r)?,
            num_configurations: read_u8(r)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(DeviceDescriptor::SIZE == 18);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const SIZE: usize = 9;

    /// Bus-powered with remote wake (bit 7 always set per USB 2.0 spec).
    pub const ATTRIBUTES_BUS_POWERED_REMOTE_WAKE: u8 = 0x80 | 0x20;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, Self::SIZE as u8)?;
        write_u8(w, DESCRIPTOR_TYPE_CONFIGURATION)?;
        write_u16_le(w, self.total_length)?;
        write_u8(w, self.num_interfaces)?;
        write_u8(w, self.configuration_value)?;
        write_u8(w, self.i_configuration)?;
        write_u8(w, self.bm_attributes)?;
        write_u8(w, self.max_power)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(ConfigurationDescriptor::SIZE == 9);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, Self::SIZE as u8)?;
        write_u8(w, DESCRIPTOR_TYPE_INTERFACE)?;
        write_u8(w, self.interface_number)?;
        write_u8(w, self.alternate_setting)?;
        write_u8(w, self.num_endpoints)?;
        write_u8(w, self.interface_class)?;
        write_u8(w, self.interface_subclass)?;
        write_u8(w, self.interface_protocol)?;
        write_u8(w, self.i_interface)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(InterfaceDescriptor::SIZE == 9);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub bm_attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;

    /// Interrupt transfer type (`bmAttributes` bits 1:0 == 0b11).
    pub const ATTRIBUTES_INTERRUPT: u8 = 0x03;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, Self::SIZE as u8)?;
        write_u8(w, DESCRIPTOR_TYPE_ENDPOINT)?;
        write_u8(w, self.endpoint_address)?;
        write_u8(w, self.bm_attributes)?;
        write_u16_le(w, self.max_packet_size)?;
        write_u8(w, self.interval)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(EndpointDescriptor::SIZE == 7);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidDescriptor {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
}

impl HidDescriptor {
    pub const SIZE: usize = 9;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, Self::SIZE as u8)?;
        write_u8(w, DESCRIPTOR_TYPE_HID)?;
        write_u16_le(w, self.bcd_hid)?;
        write_u8(w, self.country_code)?;
        write_u8(w, self.num_descriptors)?;
        // Inline report-type/length pair, per the USB HID 1.11 base layout;
        // remaining report lengths follow as separate HidReportEntry
        // records in the CONFIGURATION blob.
        write_u8(w, DESCRIPTOR_TYPE_HID_REPORT)?;
        write_u16_le(w, 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(HidDescriptor::SIZE == 9);

/// A single `{bDescriptorType=0x22, wDescriptorLength}` report-length entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidReportEntry {
    pub length: u16,
}

impl HidReportEntry {
    pub const SIZE: usize = 3;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, DESCRIPTOR_TYPE_HID_REPORT)?;
        write_u16_le(w, self.length)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const _: () = assert!(HidReportEntry::SIZE == 3);

/// Builds a USB STRING descriptor (as served by `SendStringReply`):
/// 1-byte length, 1-byte type (0x03), followed by the UTF-16LE payload.
pub fn encode_string_descriptor(utf16: &[u16]) -> Vec<u8> {
    let payload_len = utf16.len() * 2;
    let mut buf = Vec::with_capacity(2 + payload_len);
    buf.push((2 + payload_len) as u8);
    buf.push(DESCRIPTOR_TYPE_STRING);
    for unit in utf16 {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

/// Encodes a plain `&str` as a USB STRING descriptor (UTF-16LE, no
/// surrogate-pair handling needed for the ASCII strings this server uses).
pub fn encode_string_descriptor_ascii(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();
    encode_string_descriptor(&utf16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_round_trip() {
        let desc = DeviceDescriptor {
            bcd_usb: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 0x40,
            vendor_id: 0x4242,
            product_id: 0x4242,
            bcd_device: 0x0100,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 3,
            num_configurations: 1,
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), DeviceDescriptor::SIZE);
        assert_eq!(bytes[0], 18);
        assert_eq!(bytes[1], DESCRIPTOR_TYPE_DEVICE);
        let decoded = DeviceDescriptor::decode(&mut std::io::Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn string_descriptor_lang_id() {
        // LangID 0x0409 (en-US), as a raw u16, not ASCII text.
        let bytes = encode_string_descriptor(&[0x0409]);
        assert_eq!(bytes, [0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn string_descriptor_ascii_text() {
        let bytes = encode_string_descriptor_ascii("AB");
        assert_eq!(bytes, [0x06, 0x03, b'A', 0x00, b'B', 0x00]);
    }
}
