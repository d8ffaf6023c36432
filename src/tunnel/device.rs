//! Device side of a tunnel.

use tracing::debug;

use super::{open, Side, Tunnel, TunnelOptions};
use crate::auth::Credentials;
use crate::error::Result;
use crate::ws::{websocket_url, Endpoint};

/// Accept tunnel `tunnel_id` on the per-tunnel `broker`.
///
/// Uses the device credentials; `device_key` is passed along when the
/// relay has issued one. Idle tunnels are closed after
/// `opts.idle_timeout`.
pub async fn accept(
    broker: &str,
    creds: &Credentials,
    tunnel_id: &str,
    device_key: Option<&str>,
    opts: TunnelOptions,
) -> Result<Tunnel> {
    let mut params = vec![("tunnel", tunnel_id)];
    if let Some(key) = device_key {
        params.push(("key", key));
    }
    let url = websocket_url(broker, Endpoint::Accept, &params)?;
    debug!(tunnel_id, broker, "accepting tunnel");
    open(&url, creds, Endpoint::Accept, Side::Device, opts).await
}
