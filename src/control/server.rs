//! Control socket server: axum over a UNIX socket (or loopback TCP).

use std::path::Path;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::types::{
    ClientInfo, DaemonInfo, DeviceInfo, ErrorResponse, LoginRequest, LoginResponse, StateResponse,
};
use super::ControlAddr;
use crate::auth::{AuthUpdate, Credentials};
use crate::state::DaemonState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the control router.
pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/login", post(login))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound, not yet serving, control socket.
pub struct ControlServer {
    addr: ControlAddr,
    listener: Listener,
}

impl ControlServer {
    /// Bind `addr`. A stale socket file at a UNIX path is removed first.
    pub async fn bind(addr: &ControlAddr) -> std::io::Result<Self> {
        let listener = match addr {
            ControlAddr::Unix(path) => {
                remove_stale(path)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Listener::Unix(UnixListener::bind(path)?)
            }
            ControlAddr::Http { host, port } => {
                Listener::Tcp(TcpListener::bind((host.as_str(), *port)).await?)
            }
        };
        let addr = match &listener {
            Listener::Tcp(l) => {
                let local = l.local_addr()?;
                ControlAddr::Http {
                    host: local.ip().to_string(),
                    port: local.port(),
                }
            }
            Listener::Unix(_) => addr.clone(),
        };
        info!(addr = %addr, "control socket listening");
        Ok(Self { addr, listener })
    }

    /// Bound address (with the real port for `http://host:0`).
    pub fn local_addr(&self) -> &ControlAddr {
        &self.addr
    }

    /// Serve until `shutdown` fires, then remove the socket file.
    pub async fn run(self, state: DaemonState, shutdown: CancellationToken) -> std::io::Result<()> {
        let app = router(state);
        let signal = async move {
            shutdown.cancelled().await;
            info!("control socket shutting down");
        };
        let served = match self.listener {
            Listener::Unix(l) => axum::serve(l, app).with_graceful_shutdown(signal).await,
            Listener::Tcp(l) => axum::serve(l, app).with_graceful_shutdown(signal).await,
        };
        if let ControlAddr::Unix(path) = &self.addr {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "failed to remove control socket: {e}");
            }
        }
        served
    }
}

fn remove_stale(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn get_state(State(state): State<DaemonState>) -> Json<StateResponse> {
    let status = state.device_status();
    let stats = &state.stats;
    Json(StateResponse {
        version: VERSION.to_string(),
        client: ClientInfo {
            version: VERSION.to_string(),
        },
        device: DeviceInfo {
            dev_id: status.dev_id,
            state: status.state,
        },
        daemon: Some(DaemonInfo {
            pid: std::process::id(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            active_tunnels: state.active_tunnels(),
            tunnels_total: stats.tunnels_total.load(std::sync::atomic::Ordering::Relaxed),
            reconnects: stats.reconnects.load(std::sync::atomic::Ordering::Relaxed),
        }),
    })
}

async fn login(
    State(state): State<DaemonState>,
    Form(req): Form<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    if req.user.is_empty() || req.key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "both user and key are required".to_string(),
            }),
        ));
    }
    state
        .auth
        .update(AuthUpdate::DeviceCredentials(Credentials::new(
            req.user.clone(),
            req.key,
        )))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })?;
    info!(user = %req.user, "device credentials updated, reconnecting");
    state.relogin.notify_one();
    Ok(Json(LoginResponse { user: req.user }))
}
