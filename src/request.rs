//! `Request`: a single URB in flight.
//!
//! A `Request` is an `Arc`-backed handle carrying a non-owning reference to
//! its owning `Device` plus a clone of the connection's writer. "Cloning" a
//! `Request` to outlive its callback (for a deferred interrupt-IN reply) is
//! therefore just an ordinary `Arc::clone`; "destroying" it is dropping
//! that `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::device::Device;
use crate::error::ServerError;
use crate::wire::descriptors::encode_string_descriptor_ascii;
use crate::wire::usbip::{BasicHeader, RetSubmit, NON_ISO_PACKETS};
use crate::wire::opcodes::{Direction, USBIP_RET_SUBMIT};

/// The connection's write half, shared (and serialised) across every
/// `Request` in flight on it.
pub type SharedWriter = Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>;

pub struct Request {
    device: Arc<Device>,
    sequence_number: u32,
    transfer_buffer_length: u32,
    writer: SharedWriter,
    replied: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        device: Arc<Device>,
        sequence_number: u32,
        transfer_buffer_length: u32,
        writer: SharedWriter,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            sequence_number,
            transfer_buffer_length,
            writer,
            replied: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn transfer_buffer_length(&self) -> u32 {
        self.transfer_buffer_length
    }

    /// Marks this request as replied, returning `false` (and logging) if it
    /// had already been replied to. Exactly one reply per request is
    /// enforced as a logged programming error rather than undefined
    /// behaviour.
    fn claim_reply(&self) -> bool {
        self.replied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn write_ret_submit(&self, status: i32, payload: &[u8]) -> Result<(), ServerError> {
        let ret = RetSubmit {
            header: BasicHeader {
                command_code: USBIP_RET_SUBMIT,
                sequence_number: self.sequence_number,
                device_id: self.device.device_id(),
                direction: Direction::In,
                endpoint: 0,
            },
            status,
            actual_length: payload.len() as u32,
            start_frame: 0,
            number_of_packets: NON_ISO_PACKETS,
            error_count: 0,
        };

        // Device-level reply mutex; the writer mutex below is what
        // actually prevents byte interleaving on the shared connection.
        let _device_guard = self.device.reply_guard().await;
        let mut writer = self.writer.lock().await;
        writer.write_all(&ret.to_bytes()).await.map_err(ServerError::from_io)?;
        if !payload.is_empty() {
            writer.write_all(payload).await.map_err(ServerError::from_io)?;
        }
        Ok(())
    }

    /// `SendReply(data, dataSize)`: truncates to `transferBufferLength`.
    pub async fn send_reply(&self, data: &[u8]) -> Result<(), ServerError> {
        if !self.claim_reply() {
            error!(
                sequence_number = self.sequence_number,
                "Request::send_reply called after a reply was already sent"
            );
            return Ok(());
        }
        let n = data.len().min(self.transfer_buffer_length as usize);
        self.write_ret_submit(0, &data[..n]).await
    }

    /// `SendStringReply(wchars, charCount)`: packages `text` as a USB
    /// STRING descriptor before delegating to [`Self::send_reply`].
    pub async fn send_string_reply(&self, text: &str) -> Result<(), ServerError> {
        let descriptor = encode_string_descriptor_ascii(text);
        self.send_reply(&descriptor).await
    }

    /// `SendErrorReply(status)`: zero `actualLength`, no payload. Convention:
    /// `status == -32` (`-EPIPE`) signals STALL.
    pub async fn send_error_reply(&self, status: i32) -> Result<(), ServerError> {
        if !self.claim_reply() {
            error!(
                sequence_number = self.sequence_number,
                "Request::send_error_reply called after a reply was already sent"
            );
            return Ok(());
        }
        self.write_ret_submit(status, &[]).await
    }
}
