//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `ONDEVICE_SERVER`, `ONDEVICE_HOST`,
//!    `SSH_ADDR`, `ONDEVICE_USER` + `ONDEVICE_AUTH`
//! 2. **Config file**: path via `--conf <path>`, or `ondevice.toml` in the
//!    config directory (`$ONDEVICE_CONFIG_DIR`, default `~/.config/ondevice`)
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [daemon]
//! pid_file = "~/.config/ondevice/ondevice.pid"
//! socket = "unix://~/.config/ondevice/ondevice.sock"   # or "http://127.0.0.1:1236"
//! serve_idle_timeout_secs = 180
//! reconnect_delay_secs = 10
//! min_backoff_secs = 10
//! max_backoff_secs = 120
//! rate_limit_delay_secs = 600
//!
//! [tunnel]
//! connect_timeout_secs = 30
//! ping_interval_secs = 60
//! pong_timeout_secs = 180
//! idle_timeout_secs = 180
//! drain_secs = 10
//!
//! [[services]]
//! name = "ssh"
//! protocol = "ssh"
//! # forward = "127.0.0.1:22"   # defaults to $SSH_ADDR for ssh
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::tunnel::TunnelOptions;

/// Production relay used when neither credentials nor `ONDEVICE_SERVER`
/// name another one.
pub const DEFAULT_API_SERVER: &str = "https://api.ondevice.io/";

/// Default forward target for the built-in `ssh` service.
pub const DEFAULT_SSH_ADDR: &str = "127.0.0.1:22";

/// System-wide control socket, tried after the user-scoped one.
pub const SYSTEM_SOCKET: &str = "/var/run/ondevice/ondevice.sock";

/// Errors while reading or parsing the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Services announced to the relay and dispatchable on `connect`.
    #[serde(default = "default_services")]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory holding `auth.json` and the default pid file / socket.
    #[serde(skip)]
    pub config_dir: PathBuf,
    /// `ONDEVICE_SERVER`: replaces the credentials' `api_server`.
    #[serde(skip)]
    pub api_server_override: Option<String>,
    /// `ONDEVICE_HOST`: control socket URL used by clients, exclusively.
    #[serde(skip)]
    pub control_host_override: Option<String>,
    /// `SSH_ADDR`: forward target of the `ssh` service.
    #[serde(skip)]
    pub ssh_addr: String,
    /// `ONDEVICE_USER` + `ONDEVICE_AUTH`: legacy client credentials.
    #[serde(skip)]
    pub env_client: Option<Credentials>,
}

/// Device daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Pid file doubling as the single-instance lock.
    pub pid_file: Option<String>,
    /// Control socket address (`unix://…`, a bare path, or `http://host:port`).
    pub socket: Option<String>,
    /// Close the serve connection after this long without any message (default 180).
    #[serde(default = "default_serve_idle_timeout")]
    pub serve_idle_timeout_secs: u64,
    /// Fixed delay before reconnecting after a serve session ended (default 10).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Lower clamp of the dial-failure backoff (default 10).
    #[serde(default = "default_min_backoff")]
    pub min_backoff_secs: u64,
    /// Upper clamp of the dial-failure backoff (default 120).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Delay after the relay answered 429 (default 600).
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_secs: u64,
}

/// Per-tunnel timers.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Wait for `meta:connected` (default 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Client ping period (default 60).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Client closes the tunnel when no pong arrived for this long (default 180).
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Device closes the tunnel after this long without any frame (default 180).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Device keeps a fully half-closed tunnel open this long for late data (default 10).
    #[serde(default = "default_drain")]
    pub drain_secs: u64,
}

/// One entry of the service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub protocol: String,
    /// `host:port` to forward to. The `ssh` service falls back to `SSH_ADDR`.
    pub forward: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_services() -> Vec<ServiceConfig> {
    vec![ServiceConfig {
        name: "ssh".to_string(),
        protocol: "ssh".to_string(),
        forward: None,
    }]
}
fn default_serve_idle_timeout() -> u64 {
    180
}
fn default_reconnect_delay() -> u64 {
    10
}
fn default_min_backoff() -> u64 {
    10
}
fn default_max_backoff() -> u64 {
    120
}
fn default_rate_limit_delay() -> u64 {
    600
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    60
}
fn default_pong_timeout() -> u64 {
    180
}
fn default_idle_timeout() -> u64 {
    180
}
fn default_drain() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            socket: None,
            serve_idle_timeout_secs: default_serve_idle_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            min_backoff_secs: default_min_backoff(),
            max_backoff_secs: default_max_backoff(),
            rate_limit_delay_secs: default_rate_limit_delay(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            drain_secs: default_drain(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    pub fn options(&self) -> TunnelOptions {
        TunnelOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            drain_delay: Duration::from_secs(self.drain_secs),
        }
    }
}

impl Config {
    /// Defaults rooted at `config_dir`, without reading any file or env var.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            daemon: DaemonConfig::default(),
            tunnel: TunnelConfig::default(),
            services: default_services(),
            logging: LoggingConfig::default(),
            config_dir: config_dir.into(),
            api_server_override: None,
            control_host_override: None,
            ssh_addr: DEFAULT_SSH_ADDR.to_string(),
            env_client: None,
        }
    }

    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// An explicit `path` must exist. Without one, a missing
    /// `<config_dir>/ondevice.toml` just means compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_dir = crate::util::config_dir();
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_dir.join("ondevice.toml"), false),
        };

        let mut config = if required || file.exists() {
            Self::from_file(&file)?
        } else {
            Self::with_dir(&config_dir)
        };
        config.config_dir = config_dir;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse TOML text; fields not in the file get their defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.ssh_addr = DEFAULT_SSH_ADDR.to_string();
        Ok(config)
    }

    /// Apply env-var overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("ONDEVICE_SERVER").filter(|s| !s.is_empty()) {
            self.api_server_override = Some(server);
        }
        if let Some(host) = lookup("ONDEVICE_HOST").filter(|s| !s.is_empty()) {
            self.control_host_override = Some(host);
        }
        if let Some(addr) = lookup("SSH_ADDR").filter(|s| !s.is_empty()) {
            self.ssh_addr = addr;
        }
        if let (Some(user), Some(key)) = (lookup("ONDEVICE_USER"), lookup("ONDEVICE_AUTH")) {
            self.env_client = Some(Credentials {
                user,
                key,
                api_server: None,
            });
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        match &self.daemon.pid_file {
            Some(p) => PathBuf::from(crate::util::expand_tilde(p).as_ref()),
            None => self.config_dir.join("ondevice.pid"),
        }
    }

    /// Address the daemon binds its control socket to.
    pub fn control_socket(&self) -> String {
        match &self.daemon.socket {
            Some(s) => s.clone(),
            None => format!("unix://{}", self.config_dir.join("ondevice.sock").display()),
        }
    }

    /// Addresses a control client tries, in order.
    ///
    /// `ONDEVICE_HOST` replaces both the user-scoped socket and the
    /// system-wide fallback.
    pub fn control_candidates(&self) -> Vec<String> {
        if let Some(host) = &self.control_host_override {
            return vec![host.clone()];
        }
        vec![self.control_socket(), format!("unix://{SYSTEM_SOCKET}")]
    }

    pub fn auth_file(&self) -> PathBuf {
        self.config_dir.join("auth.json")
    }

    /// Relay base URL for `creds`, honoring `ONDEVICE_SERVER`.
    pub fn api_server(&self, creds: &Credentials) -> String {
        self.api_server_override
            .clone()
            .or_else(|| creds.api_server.clone())
            .unwrap_or_else(|| DEFAULT_API_SERVER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_announce_ssh_only() {
        let config = Config::with_dir("/tmp/ondevice-test");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "ssh");
        assert_eq!(config.services[0].protocol, "ssh");
        assert_eq!(config.ssh_addr, "127.0.0.1:22");
        assert_eq!(config.tunnel.connect_timeout_secs, 30);
        assert_eq!(config.tunnel.drain_secs, 10);
        assert_eq!(config.daemon.rate_limit_delay_secs, 600);
    }

    #[test]
    fn default_paths_live_in_config_dir() {
        let config = Config::with_dir("/tmp/od");
        assert_eq!(config.pid_file(), PathBuf::from("/tmp/od/ondevice.pid"));
        assert_eq!(config.control_socket(), "unix:///tmp/od/ondevice.sock");
        assert_eq!(config.auth_file(), PathBuf::from("/tmp/od/auth.json"));
        assert_eq!(
            config.control_candidates(),
            vec![
                "unix:///tmp/od/ondevice.sock".to_string(),
                "unix:///var/run/ondevice/ondevice.sock".to_string(),
            ]
        );
    }

    #[test]
    fn parses_partial_file() {
        let config = Config::parse(
            r#"
            [daemon]
            socket = "http://127.0.0.1:1236"

            [tunnel]
            drain_secs = 3

            [[services]]
            name = "web"
            protocol = "web"
            forward = "127.0.0.1:8080"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.daemon.socket.as_deref(),
            Some("http://127.0.0.1:1236")
        );
        assert_eq!(config.daemon.max_backoff_secs, 120);
        assert_eq!(config.tunnel.drain_secs, 3);
        assert_eq!(config.tunnel.ping_interval_secs, 60);
        assert_eq!(
            config.services[0].forward.as_deref(),
            Some("127.0.0.1:8080")
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("ONDEVICE_SERVER", "http://localhost:8080/"),
            ("ONDEVICE_HOST", "http://127.0.0.1:9999"),
            ("SSH_ADDR", "10.0.0.1:2222"),
            ("ONDEVICE_USER", "alice"),
            ("ONDEVICE_AUTH", "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::with_dir("/tmp/od");
        config.apply_env(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.ssh_addr, "10.0.0.1:2222");
        assert_eq!(config.control_candidates(), vec!["http://127.0.0.1:9999"]);
        let creds = config.env_client.clone().unwrap();
        assert_eq!(creds.user, "alice");
        assert_eq!(config.api_server(&creds), "http://localhost:8080/");
    }

    #[test]
    fn api_server_falls_back_to_production() {
        let config = Config::with_dir("/tmp/od");
        let creds = Credentials {
            user: "u".into(),
            key: "k".into(),
            api_server: None,
        };
        assert_eq!(config.api_server(&creds), DEFAULT_API_SERVER);
        let custom = Credentials {
            api_server: Some("http://relay.local/".into()),
            ..creds
        };
        assert_eq!(config.api_server(&custom), "http://relay.local/");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/ondevice.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ondevice.toml");
        std::fs::write(&path, "[daemon\nsocket = 1").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err:?}");
    }
}
