//! Daemon state shared between the serve loop and the control socket.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use crate::auth::AuthStore;
use crate::config::Config;

/// Whether the daemon currently holds an established serve connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: Connectivity,
    /// Device id from the last `hello`.
    pub dev_id: Option<String>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            state: Connectivity::Offline,
            dev_id: None,
        }
    }
}

/// Shared state handed to the serve loop, tunnel tasks and control routes.
#[derive(Clone)]
pub struct DaemonState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub auth: AuthStore,
    /// Monotonic instant when the daemon started.
    pub start_time: Instant,
    pub stats: Arc<DaemonStats>,
    device: Arc<watch::Sender<DeviceStatus>>,
    /// Woken by `POST /login` so the serve loop reconnects with new credentials.
    pub relogin: Arc<Notify>,
}

/// Counters: lock-free on the hot path.
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub active_tunnels: AtomicUsize,
    pub tunnels_total: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Keeps `active_tunnels` incremented for as long as it lives.
#[must_use]
pub struct TunnelGuard {
    stats: Arc<DaemonStats>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.stats.active_tunnels.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DaemonState {
    pub fn new(config: Arc<Config>, auth: AuthStore) -> Self {
        let (device, _) = watch::channel(DeviceStatus::default());
        Self {
            config,
            auth,
            start_time: Instant::now(),
            stats: Arc::new(DaemonStats::default()),
            device: Arc::new(device),
            relogin: Arc::new(Notify::new()),
        }
    }

    pub fn set_online(&self, dev_id: &str) {
        self.device.send_replace(DeviceStatus {
            state: Connectivity::Online,
            dev_id: Some(dev_id.to_string()),
        });
    }

    /// Mark offline, keeping the last known device id.
    pub fn set_offline(&self) {
        self.device.send_if_modified(|status| {
            let changed = status.state != Connectivity::Offline;
            status.state = Connectivity::Offline;
            changed
        });
    }

    pub fn device_status(&self) -> DeviceStatus {
        let mut status = self.device.borrow().clone();
        if status.dev_id.is_none() {
            status.dev_id = self.auth.device().and_then(|d| d.dev_id);
        }
        status
    }

    /// Count a tunnel as active until the guard is dropped.
    pub fn track_tunnel(&self) -> TunnelGuard {
        self.stats.active_tunnels.fetch_add(1, Ordering::SeqCst);
        self.stats.tunnels_total.fetch_add(1, Ordering::SeqCst);
        TunnelGuard {
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.stats.active_tunnels.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUpdate;

    fn state(dir: &tempfile::TempDir) -> DaemonState {
        let config = Config::with_dir(dir.path());
        let auth = AuthStore::open(config.auth_file(), None).unwrap();
        DaemonState::new(Arc::new(config), auth)
    }

    #[tokio::test]
    async fn online_offline_keeps_dev_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        assert_eq!(state.device_status(), DeviceStatus::default());

        state.set_online("alice.pi");
        assert_eq!(state.device_status().state, Connectivity::Online);

        state.set_offline();
        let status = state.device_status();
        assert_eq!(status.state, Connectivity::Offline);
        assert_eq!(status.dev_id.as_deref(), Some("alice.pi"));
    }

    #[tokio::test]
    async fn dev_id_falls_back_to_auth_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        state
            .auth
            .update(AuthUpdate::DeviceIdentity {
                dev_id: "bob.box".into(),
                device_key: "k".into(),
            })
            .await
            .unwrap();
        assert_eq!(state.device_status().dev_id.as_deref(), Some("bob.box"));
    }

    #[tokio::test]
    async fn tunnel_guard_counts() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let a = state.track_tunnel();
        let b = state.track_tunnel();
        assert_eq!(state.active_tunnels(), 2);
        drop(a);
        assert_eq!(state.active_tunnels(), 1);
        drop(b);
        assert_eq!(state.active_tunnels(), 0);
        assert_eq!(state.stats.tunnels_total.load(Ordering::SeqCst), 2);
    }
}
