//! Local services a device exposes through tunnels.
//!
//! A handler is picked per incoming `connect` request by [`lookup`] and then
//! driven by [`ServiceHandler::run`]:
//!
//! 1. `connect` prepares the downstream side (opens the TCP socket);
//! 2. `receive` starts pumping downstream bytes into the tunnel;
//! 3. every inbound tunnel chunk goes to `on_data`, in order;
//! 4. the peer's `meta:EOF` goes to `on_eof`.

pub mod tcp;

use bytes::Bytes;
use tracing::{debug, warn};

pub use tcp::TcpForward;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::tunnel::{Tunnel, TunnelEvent, TunnelHandle};

/// Diagnostic loopback, dispatchable even when not announced.
pub const ECHO: &str = "echo";

/// Built-in service whose forward address defaults to `SSH_ADDR`.
pub const SSH: &str = "ssh";

pub enum ServiceHandler {
    /// Writes every chunk back; answers EOF with EOF.
    Echo,
    /// Forwards to a local `host:port`.
    Tcp(TcpForward),
}

/// Pick the handler for `service`/`protocol`.
///
/// Service and protocol must be equal. `echo` is always available; any
/// other service must be in `catalog`. Everything else is `NotFound`, which
/// the daemon reports back to the relay as a 404 `connectError`.
pub fn lookup(
    catalog: &[ServiceConfig],
    ssh_addr: &str,
    service: &str,
    protocol: &str,
) -> Result<ServiceHandler> {
    if service != protocol {
        return Err(Error::NotFound(format!(
            "service '{service}' does not speak protocol '{protocol}'"
        )));
    }
    if service == ECHO {
        return Ok(ServiceHandler::Echo);
    }
    let entry = catalog
        .iter()
        .find(|s| s.name == service && s.protocol == protocol)
        .ok_or_else(|| Error::NotFound(format!("unknown service '{service}'")))?;
    let addr = match (&entry.forward, service) {
        (Some(addr), _) => addr.clone(),
        (None, SSH) => ssh_addr.to_string(),
        (None, _) => {
            return Err(Error::NotFound(format!(
                "service '{service}' has no forward address"
            )))
        }
    };
    Ok(ServiceHandler::Tcp(TcpForward::new(addr)))
}

impl ServiceHandler {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Tcp(_) => "tcp",
        }
    }

    pub async fn connect(&mut self, tunnel: &TunnelHandle) -> Result<()> {
        match self {
            Self::Echo => Ok(()),
            Self::Tcp(fwd) => fwd.connect(tunnel).await,
        }
    }

    pub fn receive(&mut self, tunnel: &TunnelHandle) {
        match self {
            Self::Echo => {}
            Self::Tcp(fwd) => fwd.receive(tunnel),
        }
    }

    pub async fn on_data(&mut self, tunnel: &TunnelHandle, data: Bytes) {
        match self {
            Self::Echo => {
                if let Err(e) = tunnel.write(&data).await {
                    debug!("echo write failed: {e}");
                    tunnel.close();
                }
            }
            Self::Tcp(fwd) => fwd.on_data(tunnel, &data).await,
        }
    }

    pub async fn on_eof(&mut self, tunnel: &TunnelHandle) {
        match self {
            Self::Echo => {
                if let Err(e) = tunnel.send_eof().await {
                    debug!("echo EOF failed: {e}");
                }
            }
            Self::Tcp(fwd) => fwd.on_eof().await,
        }
    }

    /// Drive `tunnel` until it is closed.
    pub async fn run(mut self, tunnel: Tunnel) -> Result<()> {
        let (handle, mut events) = tunnel.into_parts();
        if let Err(e) = self.connect(&handle).await {
            warn!(handler = self.name(), "service unavailable: {e}");
            handle.close();
            let _ = handle.wait_closed().await;
            return Err(e);
        }
        self.receive(&handle);

        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Data(data) => self.on_data(&handle, data).await,
                TunnelEvent::Eof => self.on_eof(&handle).await,
            }
        }
        if let Self::Tcp(fwd) = &mut self {
            fwd.finish().await;
        }
        handle.wait_closed().await
    }
}
