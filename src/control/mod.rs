//! Local control socket: the daemon serves it, `status`/`stop`/`login` use it.
//!
//! Addresses are parsed once into [`ControlAddr`]:
//!
//! | Text                         | Address                     |
//! |------------------------------|-----------------------------|
//! | `unix:///run/ondevice.sock`  | `Unix("/run/ondevice.sock")`|
//! | `/run/ondevice.sock`, `~/x`  | `Unix(..)`                  |
//! | `http://127.0.0.1:1236`      | `Http { host, port }`       |

pub mod client;
pub mod server;
pub mod types;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use client::ControlClient;
pub use server::ControlServer;

/// Where the control socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddr {
    Unix(PathBuf),
    Http { host: String, port: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid control socket address '{0}'")]
    InvalidAddr(String),

    #[error("daemon is not running (tried {0})")]
    NotRunning(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("daemon returned error: {0}")]
    Daemon(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FromStr for ControlAddr {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ControlError::InvalidAddr(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(
                crate::util::expand_tilde(path).as_ref(),
            )));
        }
        if s.starts_with("http://") {
            let url = url::Url::parse(s).map_err(|_| ControlError::InvalidAddr(s.to_string()))?;
            let host = url
                .host_str()
                .ok_or_else(|| ControlError::InvalidAddr(s.to_string()))?
                .to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            return Ok(Self::Http { host, port });
        }
        if s.starts_with('/') || s.starts_with('~') || s.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(crate::util::expand_tilde(s).as_ref())));
        }
        Err(ControlError::InvalidAddr(s.to_string()))
    }
}

impl fmt::Display for ControlAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Http { host, port } => write!(f, "http://{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_urls_and_bare_paths() {
        assert_eq!(
            "unix:///var/run/ondevice/ondevice.sock".parse::<ControlAddr>().unwrap(),
            ControlAddr::Unix("/var/run/ondevice/ondevice.sock".into())
        );
        assert_eq!(
            "/tmp/od.sock".parse::<ControlAddr>().unwrap(),
            ControlAddr::Unix("/tmp/od.sock".into())
        );
    }

    #[test]
    fn parses_http_with_and_without_port() {
        assert_eq!(
            "http://127.0.0.1:1236".parse::<ControlAddr>().unwrap(),
            ControlAddr::Http {
                host: "127.0.0.1".into(),
                port: 1236
            }
        );
        assert_eq!(
            "http://localhost/".parse::<ControlAddr>().unwrap(),
            ControlAddr::Http {
                host: "localhost".into(),
                port: 80
            }
        );
    }

    #[test]
    fn display_round_trips() {
        for s in ["unix:///tmp/a.sock", "http://127.0.0.1:1236"] {
            assert_eq!(s.parse::<ControlAddr>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_other_schemes() {
        for s in ["file:///tmp/x", "unix://", "ondevice.sock", "https://host:1"] {
            assert!(s.parse::<ControlAddr>().is_err(), "{s}");
        }
    }
}
