//! The server `Instance`: binds the listen socket, runs the single event
//! loop, and owns the [`Registry`] devices are registered on before
//! `run()` is called.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::dispatcher;
use crate::error::ServerError;
use crate::registry::Registry;

/// `{ port: u16 = 0, allowRemote: bool = false }`. `onLogMessage` and
/// `userData` are dropped — `tracing` events replace the callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceConfig {
    pub port: u16,
    pub allow_remote: bool,
}

/// A bound, not-yet-running server. Devices must be registered on the
/// [`Registry`] passed to [`Instance::create`] before calling [`Instance::run`].
pub struct Instance {
    registry: Arc<RwLock<Registry>>,
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: Notify,
    stop_requested: AtomicBool,
}

impl Instance {
    /// Binds the listen socket: loopback unless `allow_remote`, the given
    /// port (0 = ephemeral).
    pub async fn create(config: InstanceConfig, registry: Registry) -> Result<Self, ServerError> {
        let ip = if config.allow_remote {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let addr = SocketAddr::new(ip, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ServerError::Fatal(format!("failed to bind {addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| ServerError::Fatal(format!("failed to read bound address: {err}")))?;

        Ok(Self {
            registry: Arc::new(RwLock::new(registry)),
            listener,
            local_addr,
            stop: Notify::new(),
            stop_requested: AtomicBool::new(false),
        })
    }

    /// The actual bound TCP port (resolved after [`Self::create`] when
    /// `port: 0` requested an ephemeral one).
    pub fn get_port_number(&self) -> u16 {
        self.local_addr.port()
    }

    /// Sets the stop signal. Safe to call from any task or thread; a
    /// concurrent or prior call is a no-op.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            self.stop.notify_one();
        }
    }

    /// Runs every registered device's auto-attach, then the accept/dispatch
    /// event loop until [`Self::request_stop`] is called or the listener
    /// fails fatally.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_auto_attach().await;

        let mut active: Option<tokio::task::JoinHandle<Result<(), ServerError>>> = None;
        let mut pending_watchers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.stop.notified() => {
                    info!("stop requested, shutting down instance");
                    return Ok(());
                }

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.on_accept(stream, peer, &mut active, &mut pending_watchers),
                        Err(err) => warn!(error = %err, "accept() failed"),
                    }
                }

                result = async { active.as_mut().expect("guarded by is_some()").await }, if active.is_some() => {
                    active = None;
                    match result {
                        Ok(Ok(())) => info!("client connection closed"),
                        Ok(Err(err)) => warn!(error = %err, "client connection ended with an error"),
                        Err(join_err) => warn!(error = %join_err, "connection task panicked"),
                    }
                }

                Some(_) = pending_watchers.join_next(), if !pending_watchers.is_empty() => {
                    // A non-active connection closed; nothing further to do.
                }
            }
        }
    }

    fn on_accept(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        active: &mut Option<tokio::task::JoinHandle<Result<(), ServerError>>>,
        pending_watchers: &mut JoinSet<()>,
    ) {
        if active.is_none() {
            info!(%peer, "accepted client connection");
            let registry = Arc::clone(&self.registry);
            *active = Some(tokio::spawn(dispatcher::run_connection(stream, registry)));
        } else {
            info!(%peer, "a client is already active; tracking this connection only until it closes");
            pending_watchers.spawn(async move {
                let _ = stream.readable().await;
            });
        }
    }

    async fn run_auto_attach(&self) {
        let bus_ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .devices_in_order()
                .filter(|d| d.auto_attach)
                .map(|d| d.bus_id())
                .collect()
        };
        let port = self.get_port_number();
        for bus_id in bus_ids {
            match crate::attach::attach(port, &bus_id).await {
                Ok(usb_port) => info!(bus_id, usb_port, "auto-attached device"),
                Err(err) => warn!(bus_id, %err, "auto-attach failed; continuing without it"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_binds_an_ephemeral_loopback_port() {
        let instance = Instance::create(InstanceConfig::default(), Registry::new())
            .await
            .unwrap();
        assert_ne!(instance.get_port_number(), 0);
        assert_eq!(instance.local_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn request_stop_causes_run_to_return() {
        let instance = Arc::new(
            Instance::create(InstanceConfig::default(), Registry::new())
                .await
                .unwrap(),
        );
        let runner = Arc::clone(&instance);
        let handle = tokio::spawn(async move { runner.run().await });
        instance.request_stop();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("run() should return promptly after request_stop")
            .expect("run() task should not panic");
        assert!(result.is_ok());
    }
}
