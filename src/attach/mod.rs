//! Local-attach client: tells a locally installed USB/IP importer to
//! attach `loopback:port / busID`. Inherently Windows-only — gated behind
//! `cfg(windows)` with a clean stub everywhere else.

use crate::error::{AttachError, AttachStage};

#[cfg(windows)]
mod windows;

/// Attaches bus-ID `bus_id` on `tcp_port` via the locally installed USB/IP
/// client driver. Returns the USB port number (not the TCP port) on
/// success.
pub async fn attach(tcp_port: u16, bus_id: &str) -> Result<u16, AttachError> {
    if tcp_port == 0 {
        return Err(AttachError::new(AttachStage::ArgumentValidation, 0));
    }
    if bus_id.is_empty() || bus_id.len() > 31 {
        return Err(AttachError::new(AttachStage::ArgumentValidation, 0));
    }

    #[cfg(windows)]
    {
        let tcp_port = tcp_port;
        let bus_id = bus_id.to_string();
        tokio::task::spawn_blocking(move || windows::attach_blocking(tcp_port, &bus_id))
            .await
            .map_err(|_| AttachError::new(AttachStage::IOControl, 0))?
    }

    #[cfg(not(windows))]
    {
        let _ = tcp_port;
        let _ = bus_id;
        Err(AttachError::new(AttachStage::Discovery, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_arguments() {
        assert!(matches!(
            attach(0, "1-1").await,
            Err(AttachError { stage: AttachStage::ArgumentValidation, .. })
        ));
        assert!(matches!(
            attach(3240, "").await,
            Err(AttachError { stage: AttachStage::ArgumentValidation, .. })
        ));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn non_windows_fails_at_discovery() {
        assert!(matches!(
            attach(3240, "1-1").await,
            Err(AttachError { stage: AttachStage::Discovery, .. })
        ));
    }
}
