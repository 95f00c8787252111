//! USB/IP opcode constants.
//!
//! The "setup" opcodes (`OP_REQ_*` / `OP_REP_*`) carry the protocol version
//! in their top 16 bits; the "basic header" opcodes (`USBIP_CMD_*` /
//! `USBIP_RET_*`) do not. Values are the full 4-byte big-endian word as it
//! appears on the wire, matching `Get4ByteCommandCode` in the original
//! implementation (version `0x0111` in the high half, the 16-bit setup
//! command code in the low half).

/// USB/IP protocol version, as carried in every `SetupHeader`.
pub const VERSION: u16 = 0x0111;

pub const OP_REQ_DEVLIST: u32 = 0x0111_8005;
pub const OP_REP_DEVLIST: u32 = 0x0111_0005;
pub const OP_REQ_IMPORT: u32 = 0x0111_8003;
pub const OP_REP_IMPORT: u32 = 0x0111_0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// USB/IP `Speed` encoding used in the `Device` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Speed {
    #[default]
    Unknown = 0,
    Low = 1,
    Full = 2,
    Wireless = 3,
    Super = 4,
    SuperPlus = 5,
}

impl Speed {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Speed::Unknown,
            1 => Speed::Low,
            2 => Speed::Full,
            3 => Speed::Wireless,
            4 => Speed::Super,
            5 => Speed::SuperPlus,
            _ => return None,
        })
    }
}

/// Direction of a `USBIP_CMD_SUBMIT` transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    Out = 0,
    In = 1,
}
