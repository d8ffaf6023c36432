//! Relay endpoint URLs.
//!
//! Every WebSocket endpoint lives under `/v1.1/<name>/websocket` on the
//! configured API server (or on the tunnel-specific broker for `accept`).
//! Plain `http` servers get `ws://`, everything else `wss://`.

use url::Url;

use crate::error::{Error, Result};

/// API version prefix of every relay path.
pub const API_ROOT: &str = "/v1.1";

/// The relay endpoints this crate dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Device control channel.
    Serve,
    /// Device side of one tunnel.
    Accept,
    /// Client side of one tunnel.
    Connect,
    /// Loopback for diagnostics.
    Echo,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serve => "serve",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Echo => "echo",
        }
    }
}

/// Build the WebSocket URL for `endpoint` on `base` with query `params`.
///
/// `base` may use `http`, `https`, `ws` or `wss`; any path it carries is
/// replaced by the versioned endpoint path.
pub fn websocket_url(base: &str, endpoint: Endpoint, params: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Transport(format!(
                "unsupported URL scheme '{other}' in {base}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Transport(format!("cannot use scheme {scheme} for {base}")))?;
    url.set_path(&format!("{API_ROOT}/{}/websocket", endpoint.as_str()));
    url.set_query(None);
    url.set_fragment(None);
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params.iter().copied());
    }
    Ok(url)
}
