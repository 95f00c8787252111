//! Error taxonomy for the server core.
//!
//! Mirrors the source's error categories (argument validation, I/O,
//! protocol, dispatch, attach) as proper `thiserror` enums instead of a
//! tagged union + status code.

use thiserror::Error;

/// Errors that can occur while bringing up or running an [`crate::instance::Instance`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    ArgumentValidation(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device callback returned non-zero status {0}")]
    Dispatch(i32),

    #[error("fatal startup failure: {0}")]
    Fatal(String),
}

impl ServerError {
    /// Classifies a raw I/O error the way the source's read/write helpers
    /// do: distinguishing an orderly peer close and a reset from any other
    /// I/O failure.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof => ServerError::PeerClosed,
            ErrorKind::ConnectionReset => ServerError::ConnectionReset,
            _ => ServerError::Io(err),
        }
    }
}

/// The stage at which a local-attach attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    ArgumentValidation,
    Discovery,
    Open,
    IOControl,
    ResponseValidation,
}

impl std::fmt::Display for AttachStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttachStage::ArgumentValidation => "argument validation",
            AttachStage::Discovery => "discovery",
            AttachStage::Open => "open",
            AttachStage::IOControl => "ioctl",
            AttachStage::ResponseValidation => "response validation",
        };
        f.write_str(name)
    }
}

/// Local-attach failure: the stage it failed at, plus the platform error
/// code (a Win32 `HRESULT`-equivalent on Windows; a synthetic code
/// elsewhere).
#[derive(Debug, Error)]
#[error("attach failed at {stage}: platform error 0x{code:08x}")]
pub struct AttachError {
    pub stage: AttachStage,
    pub code: u32,
}

impl AttachError {
    pub fn new(stage: AttachStage, code: u32) -> Self {
        Self { stage, code }
    }
}

/// Linux `-EPIPE`, the USB/IP convention for "the endpoint STALLed".
pub const USB_STALL_STATUS: i32 = -32;
