//! Client side of a tunnel.

use tracing::debug;

use super::{open, Side, Tunnel, TunnelOptions};
use crate::auth::Credentials;
use crate::error::Result;
use crate::ws::{websocket_url, Endpoint};

/// Ask the relay at `base` for a tunnel to `service` on `dev_id`.
///
/// Returns once the device side has accepted. The returned tunnel probes
/// the peer every `opts.ping_interval`.
pub async fn connect(
    base: &str,
    creds: &Credentials,
    dev_id: &str,
    service: &str,
    protocol: &str,
    opts: TunnelOptions,
) -> Result<Tunnel> {
    let url = websocket_url(
        base,
        Endpoint::Connect,
        &[("dev", dev_id), ("service", service), ("protocol", protocol)],
    )?;
    debug!(dev_id, service, protocol, "opening tunnel");
    open(&url, creds, Endpoint::Connect, Side::Client, opts).await
}
