//! Packed USB/IP wire records: the opcode headers used by the protocol
//! dispatcher.
//!
//! Every record here is hand-encoded/decoded with `byteorder` rather than
//! `#[repr(C, packed)]` + transmute, so there is no reliance on the host's
//! struct layout matching the wire layout, and reading an exact record size
//! off an async socket is a matter of `read_exact` into a byte slice before
//! decoding.

use super::opcodes::{Direction, Speed};
use super::primitives::*;
use std::io::{self, Cursor, Read, Write};

macro_rules! const_size_assert {
    ($ty:ty, $size:expr) => {
        const _: () = assert!(<$ty>::SIZE == $size);
    };
}

/// `u16 version; u16 code; u32 status;` — the common header of every
/// `OP_REQ_*` / `OP_REP_*` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl SetupHeader {
    pub const SIZE: usize = 8;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u16_be(w, self.version)?;
        write_u16_be(w, self.code)?;
        write_u32_be(w, self.status)
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            version: read_u16_be(r)?,
            code: read_u16_be(r)?,
            status: read_u32_be(r)?,
        })
    }
}
const_size_assert!(SetupHeader, 8);

/// The 312-byte `Device` record sent in `OP_REP_DEVLIST` and
/// `OP_REP_IMPORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: Speed,
    pub vendor: u16,
    pub product: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            path: String::new(),
            bus_id: String::new(),
            bus_num: 0,
            dev_num: 0,
            speed: Speed::Unknown,
            vendor: 0,
            product: 0,
            bcd_device: 0,
            class: 0,
            subclass: 0,
            protocol: 0,
            configuration_value: 0,
            num_configurations: 0,
            num_interfaces: 0,
        }
    }
}

impl DeviceRecord {
    pub const SIZE: usize = 312;
    pub const PATH_LEN: usize = 256;
    pub const BUS_ID_LEN: usize = 32;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_fixed_str(w, &self.path, Self::PATH_LEN)?;
        write_fixed_str(w, &self.bus_id, Self::BUS_ID_LEN)?;
        write_u32_be(w, self.bus_num)?;
        write_u32_be(w, self.dev_num)?;
        write_u32_be(w, self.speed as u32)?;
        write_u16_be(w, self.vendor)?;
        write_u16_be(w, self.product)?;
        write_u16_be(w, self.bcd_device)?;
        write_u8(w, self.class)?;
        write_u8(w, self.subclass)?;
        write_u8(w, self.protocol)?;
        write_u8(w, self.configuration_value)?;
        write_u8(w, self.num_configurations)?;
        write_u8(w, self.num_interfaces)
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let path = read_fixed_str(r, Self::PATH_LEN)?;
        let bus_id = read_fixed_str(r, Self::BUS_ID_LEN)?;
        let bus_num = read_u32_be(r)?;
        let dev_num = read_u32_be(r)?;
        let speed_raw = read_u32_be(r)?;
        let speed = Speed::from_u32(speed_raw).unwrap_or(Speed::Unknown);
        let vendor = read_u16_be(r)?;
        let product = read_u16_be(r)?;
        let bcd_device = read_u16_be(r)?;
        let class = read_u8(r)?;
        let subclass = read_u8(r)?;
        let protocol = read_u8(r)?;
        let configuration_value = read_u8(r)?;
        let num_configurations = read_u8(r)?;
        let num_interfaces = read_u8(r)?;
        Ok(Self {
            path,
            bus_id,
            bus_num,
            dev_num,
            speed,
            vendor,
            product,
            bcd_device,
            class,
            subclass,
            protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const_size_assert!(DeviceRecord, 312);

/// 4-byte `Interface` record (one per device interface, following a
/// `Device` record in `OP_REP_DEVLIST`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceRecord {
    pub const SIZE: usize = 4;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, self.class)?;
        write_u8(w, self.subclass)?;
        write_u8(w, self.protocol)?;
        write_u8(w, 0) // padding
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let class = read_u8(r)?;
        let subclass = read_u8(r)?;
        let protocol = read_u8(r)?;
        let _pad = read_u8(r)?;
        Ok(Self {
            class,
            subclass,
            protocol,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const_size_assert!(InterfaceRecord, 4);

/// 20-byte header shared by `USBIP_CMD_SUBMIT`, `USBIP_RET_SUBMIT`,
/// `USBIP_CMD_UNLINK`, and `USBIP_RET_UNLINK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub command_code: u32,
    pub sequence_number: u32,
    pub device_id: u32,
    pub direction: Direction,
    pub endpoint: u32,
}

impl BasicHeader {
    pub const SIZE: usize = 20;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32_be(w, self.command_code)?;
        write_u32_be(w, self.sequence_number)?;
        write_u32_be(w, self.device_id)?;
        write_u32_be(w, self.direction as u32)?;
        write_u32_be(w, self.endpoint)
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let command_code = read_u32_be(r)?;
        let sequence_number = read_u32_be(r)?;
        let device_id = read_u32_be(r)?;
        let direction_raw = read_u32_be(r)?;
        let direction = if direction_raw == 0 {
            Direction::Out
        } else {
            Direction::In
        };
        let endpoint = read_u32_be(r)?;
        Ok(Self {
            command_code,
            sequence_number,
            device_id,
            direction,
            endpoint,
        })
    }
}
const_size_assert!(BasicHeader, 20);

/// The 8-byte USB SETUP packet as carried verbatim (not byte-swapped) in
/// `USBIP_CMD_SUBMIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Setup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl Setup {
    pub const SIZE: usize = 8;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, self.request_type)?;
        write_u8(w, self.request)?;
        write_u16_le(w, self.value)?;
        write_u16_le(w, self.index)?;
        write_u16_le(w, self.length)
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            request_type: read_u8(r)?,
            request: read_u8(r)?,
            value: read_u16_le(r)?,
            index: read_u16_le(r)?,
            length: read_u16_le(r)?,
        })
    }
}
const_size_assert!(Setup, 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: BasicHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: Setup,
}

impl CmdSubmit {
    pub const SIZE: usize = 48;

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let header = BasicHeader::decode(r)?;
        let transfer_flags = read_u32_be(r)?;
        let transfer_buffer_length = read_u32_be(r)?;
        let start_frame = read_u32_be(r)?;
        let number_of_packets = read_u32_be(r)?;
        let interval = read_u32_be(r)?;
        let setup = Setup::decode(r)?;
        Ok(Self {
            header,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }
}
const_size_assert!(CmdSubmit, 48);

/// Magic `numberOfPackets` value indicating a non-isochronous transfer.
pub const NON_ISO_PACKETS: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: BasicHeader,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmit {
    pub const SIZE: usize = 48;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.encode(w)?;
        write_i32_be(w, self.status)?;
        write_u32_be(w, self.actual_length)?;
        write_u32_be(w, self.start_frame)?;
        write_u32_be(w, self.number_of_packets)?;
        write_u32_be(w, self.error_count)?;
        w.write_all(&[0u8; 8])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const_size_assert!(RetSubmit, 48);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: BasicHeader,
    pub unlink_sequence_number: u32,
}

impl CmdUnlink {
    pub const SIZE: usize = 48;

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let header = BasicHeader::decode(r)?;
        let unlink_sequence_number = read_u32_be(r)?;
        let mut pad = [0u8; 24];
        r.read_exact(&mut pad)?;
        Ok(Self {
            header,
            unlink_sequence_number,
        })
    }
}
const_size_assert!(CmdUnlink, 48);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: BasicHeader,
    pub status: i32,
}

impl RetUnlink {
    pub const SIZE: usize = 48;

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.encode(w)?;
        write_i32_be(w, self.status)?;
        w.write_all(&[0u8; 24])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }
}
const_size_assert!(RetUnlink, 48);

/// Computes the USB/IP device-ID for a 1-based `(bus, dev)` pair.
pub fn device_id(bus_num: u32, dev_num: u32) -> u32 {
    (bus_num << 16) | dev_num
}

/// Formats the canonical bus-ID string for a 1-based `(bus, dev)` pair.
pub fn bus_id_string(bus_num: u32, dev_num: u32) -> String {
    format!("{bus_num}-{dev_num}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_header_round_trip() {
        let header = SetupHeader {
            version: 0x0111,
            code: 0x8005,
            status: 0,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);
        let decoded = SetupHeader::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn device_record_size_and_round_trip() {
        let dev = DeviceRecord {
            path: "/sys/bus/test".to_string(),
            bus_id: "1-1".to_string(),
            bus_num: 1,
            dev_num: 1,
            speed: Speed::Full,
            vendor: 0x4242,
            product: 0x4242,
            bcd_device: 0x0100,
            class: 3,
            subclass: 1,
            protocol: 2,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        };
        let bytes = dev.to_bytes();
        assert_eq!(bytes.len(), DeviceRecord::SIZE);
        let decoded = DeviceRecord::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, dev);
    }

    #[test]
    fn device_id_and_bus_id_addressing() {
        assert_eq!(device_id(1, 1), 0x0001_0001);
        assert_eq!(bus_id_string(1, 1), "1-1");
        assert_eq!(device_id(2, 3), (2u32 << 16) | 3);
        assert_eq!(bus_id_string(2, 3), "2-3");
    }

    #[test]
    fn ret_submit_non_iso_magic_and_round_trip() {
        let ret = RetSubmit {
            header: BasicHeader {
                command_code: super::super::opcodes::USBIP_RET_SUBMIT,
                sequence_number: 7,
                device_id: 0x0001_0001,
                direction: Direction::In,
                endpoint: 0,
            },
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: NON_ISO_PACKETS,
            error_count: 0,
        };
        let bytes = ret.to_bytes();
        assert_eq!(bytes.len(), RetSubmit::SIZE);
        // numberOfPackets occupies bytes [32..36)
        assert_eq!(&bytes[32..36], &0xFFFF_FFFFu32.to_be_bytes());
    }
}
