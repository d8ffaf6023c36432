//! Device daemon: pid lock, serve loop, control socket and shutdown.
//!
//! ## Lifecycle
//!
//! 1. [`check_user`] refuses to run as root.
//! 2. [`Daemon::start`] takes the pid lock, opens the auth store and binds
//!    the control socket. Any failure here releases what was taken.
//! 3. [`Daemon::run`] serves the control socket and runs the reconnect
//!    loop until the shutdown token fires or a fatal error occurs.
//! 4. On the way out: the control socket stops, the serve connection is
//!    closed, running tunnels finish on their own, and the pid file is
//!    removed before its lock is dropped.
//!
//! ## Reconnect policy
//!
//! | Outcome                     | Next dial after                 |
//! |-----------------------------|---------------------------------|
//! | `401` on dial               | never, fatal                    |
//! | `429` on dial               | `rate_limit_delay_secs` (600)   |
//! | other dial failure          | backoff ×1.5 within [10, 120] s |
//! | session ended               | `reconnect_delay_secs` (10)     |
//! | `POST /login` received      | immediately                     |

pub mod backoff;
pub mod pidlock;
pub mod serve;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub use backoff::Backoff;
pub use pidlock::PidLock;

use crate::auth::{AuthError, AuthStore};
use crate::config::Config;
use crate::control::{ControlAddr, ControlError, ControlServer};
use crate::error::{Error, ErrorKind};
use crate::state::DaemonState;
use crate::ws::{self, websocket_url, Endpoint};
use serve::SessionEnd;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("refusing to run as root")]
    Root,

    #[error("daemon already running (lock held on {path})")]
    AlreadyRunning { path: PathBuf },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}", .0.user_message())]
    Fatal(Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Fail with [`DaemonError::Root`] when running with uid 0.
pub fn check_user() -> Result<(), DaemonError> {
    if nix::unistd::Uid::effective().is_root() {
        return Err(DaemonError::Root);
    }
    Ok(())
}

/// A started daemon, ready to [`run`](Daemon::run).
pub struct Daemon {
    state: DaemonState,
    lock: PidLock,
    control: ControlServer,
    shutdown: CancellationToken,
    tunnels: TaskTracker,
}

impl Daemon {
    pub async fn start(config: Arc<Config>) -> Result<Self, DaemonError> {
        let lock = PidLock::acquire(&config.pid_file())?;
        let auth = AuthStore::open(config.auth_file(), config.env_client.clone())?;
        let addr: ControlAddr = config.control_socket().parse()?;
        let control = ControlServer::bind(&addr).await?;
        info!(
            pid = std::process::id(),
            pid_file = %lock.path().display(),
            "daemon started"
        );
        Ok(Self {
            state: DaemonState::new(config, auth),
            lock,
            control,
            shutdown: CancellationToken::new(),
            tunnels: TaskTracker::new(),
        })
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Cancelling this token starts a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn control_addr(&self) -> &ControlAddr {
        self.control.local_addr()
    }

    /// Run until shutdown or a fatal error, then wait for running tunnels.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Self {
            state,
            lock,
            control,
            shutdown,
            tunnels,
        } = self;

        let control = tokio::spawn(control.run(state.clone(), shutdown.clone()));
        let result = serve_loop(&state, &shutdown, &tunnels).await;
        shutdown.cancel();

        match control.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("control socket failed: {e}"),
            Err(e) => warn!("control socket task failed: {e}"),
        }

        tunnels.close();
        let active = state.active_tunnels();
        if active > 0 {
            info!(active, "waiting for tunnels to finish");
        }
        tunnels.wait().await;

        lock.release();
        info!("daemon stopped");
        result
    }
}

async fn serve_loop(
    state: &DaemonState,
    shutdown: &CancellationToken,
    tunnels: &TaskTracker,
) -> Result<(), DaemonError> {
    let mut backoff = Backoff::from_config(&state.config.daemon);
    let reconnect_delay = Duration::from_secs(state.config.daemon.reconnect_delay_secs);

    loop {
        let Some(device) = state.auth.device().filter(|d| !d.credentials.user.is_empty()) else {
            warn!("no device credentials, waiting for `ondevice login`");
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = state.relogin.notified() => continue,
            }
        };

        let server = state.config.api_server(&device.credentials);
        let params: Vec<(&str, &str)> = device
            .device_key
            .as_deref()
            .map(|key| vec![("key", key)])
            .unwrap_or_default();
        let url = websocket_url(&server, Endpoint::Serve, &params).map_err(DaemonError::Fatal)?;

        let dialed = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            dialed = ws::dial(&url, &device.credentials, Endpoint::Serve) => dialed,
        };
        let delay = match dialed {
            Ok((conn, events)) => {
                info!(user = %device.credentials.user, server = %server, "connected to relay");
                backoff.reset();
                match serve::run_session(state, conn, events, shutdown, tunnels).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Relogin => {
                        state.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    SessionEnd::Closed(Some(e)) => {
                        warn!("lost serve connection: {e}");
                        reconnect_delay
                    }
                    SessionEnd::Closed(None) => {
                        info!("serve connection closed");
                        reconnect_delay
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Authentication => {
                error!(user = %device.credentials.user, "relay rejected device credentials: {e}");
                return Err(DaemonError::Fatal(e));
            }
            Err(e) => {
                let delay = backoff.fail(&e);
                warn!(
                    delay_secs = delay.as_secs_f64(),
                    "failed to connect to relay: {e}"
                );
                delay
            }
        };

        state.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = state.relogin.notified() => info!("device credentials changed, reconnecting now"),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        token.cancel();
    }))
}
