//! Serve channel: the device's long-lived control connection to the relay.
//!
//! Messages are JSON text frames discriminated by `_type`:
//!
//! | Direction      | `_type`        | Handling                                      |
//! |----------------|----------------|-----------------------------------------------|
//! | relay → device | `hello`        | go online, persist identity, announce services |
//! | relay → device | `ping`         | reply `pong` with the same `ts`               |
//! | relay → device | `connect`      | dispatch a tunnel or answer `connectError`    |
//! | relay → device | `error`        | go offline, log                               |
//! | device → relay | `announce`     | one per configured service                    |
//!
//! Any inbound frame resets the idle watchdog; when it fires the connection
//! is closed and the main loop reconnects.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::AuthUpdate;
use crate::error::Error;
use crate::services;
use crate::state::DaemonState;
use crate::tunnel::accept;
use crate::tunnel::watchdog::Watchdog;
use crate::ws::{Connection, Event};

/// Relay → device messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum RelayMessage {
    Hello(Hello),
    Ping {
        #[serde(default)]
        ts: Value,
    },
    Connect(ConnectRequest),
    Error {
        #[serde(default)]
        code: u16,
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Unknown,
}

/// `hello` in either shape: `{devId, key}` or the older `{name, devId}`
/// where `devId` carried the key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hello {
    #[serde(rename = "devId")]
    dev_id: Option<String>,
    key: Option<String>,
    name: Option<String>,
}

impl Hello {
    /// `(dev_id, device_key)` granted by the relay.
    pub fn identity(&self) -> Option<(&str, &str)> {
        match (&self.dev_id, &self.key, &self.name) {
            (Some(dev_id), Some(key), _) => Some((dev_id, key)),
            (Some(key), None, Some(name)) => Some((name, key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub tunnel_id: String,
    pub service: String,
    pub protocol: String,
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub client_user: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
}

/// Device → relay messages.
#[derive(Debug, Serialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum DeviceMessage<'a> {
    Pong {
        ts: &'a Value,
    },
    Announce {
        name: &'a str,
        protocol: &'a str,
    },
    ConnectError {
        #[serde(rename = "tunnelId")]
        tunnel_id: &'a str,
        code: u16,
        msg: String,
    },
}

/// Why a serve session ended.
#[derive(Debug)]
pub enum SessionEnd {
    Shutdown,
    /// Device credentials changed through the control socket.
    Relogin,
    /// The connection went away; `Some` for abnormal closes.
    Closed(Option<Error>),
}

/// Process one serve connection until it closes, shutdown is requested or
/// the credentials change. Tunnel tasks are spawned on `tunnels` and outlive
/// the session.
pub async fn run_session(
    state: &DaemonState,
    conn: Connection,
    mut events: mpsc::Receiver<Event>,
    shutdown: &CancellationToken,
    tunnels: &TaskTracker,
) -> SessionEnd {
    let idle = Duration::from_secs(state.config.daemon.serve_idle_timeout_secs);
    let watchdog = {
        let conn = conn.clone();
        Watchdog::spawn(idle, move || {
            warn!(
                idle_secs = idle.as_secs(),
                "serve connection idle, reconnecting"
            );
            conn.close();
        })
    };

    let end = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("closing serve connection");
                conn.close();
                conn.wait_closed().await;
                break SessionEnd::Shutdown;
            }
            () = state.relogin.notified() => {
                info!("device credentials changed, reconnecting");
                conn.close();
                conn.wait_closed().await;
                break SessionEnd::Relogin;
            }
            event = events.recv() => match event {
                Some(Event::Text(text)) => {
                    watchdog.kick();
                    match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(msg) => handle_message(state, &conn, msg, tunnels).await,
                        Err(e) => warn!("malformed serve message: {e}"),
                    }
                }
                Some(Event::Binary(data)) => {
                    watchdog.kick();
                    debug!(len = data.len(), "ignoring binary frame on serve channel");
                }
                Some(Event::Error(e)) => break SessionEnd::Closed(Some(e)),
                None => break SessionEnd::Closed(None),
            },
        }
    };
    state.set_offline();
    end
}

async fn handle_message(
    state: &DaemonState,
    conn: &Connection,
    msg: RelayMessage,
    tunnels: &TaskTracker,
) {
    match msg {
        RelayMessage::Hello(hello) => on_hello(state, conn, &hello).await,
        RelayMessage::Ping { ts } => send(conn, &DeviceMessage::Pong { ts: &ts }).await,
        RelayMessage::Connect(req) => on_connect(state, conn, req, tunnels).await,
        RelayMessage::Error { code, msg } => {
            warn!(code, "relay reported an error: {msg}");
            state.set_offline();
        }
        RelayMessage::Unknown => debug!("ignoring unknown serve message"),
    }
}

async fn on_hello(state: &DaemonState, conn: &Connection, hello: &Hello) {
    let Some((dev_id, key)) = hello.identity() else {
        warn!("hello without a device identity");
        return;
    };
    info!(dev_id, "device online");
    state.set_online(dev_id);

    let stored = state.auth.device().unwrap_or_default();
    if stored.dev_id.as_deref() != Some(dev_id) || stored.device_key.as_deref() != Some(key) {
        let update = AuthUpdate::DeviceIdentity {
            dev_id: dev_id.to_string(),
            device_key: key.to_string(),
        };
        if let Err(e) = state.auth.update(update).await {
            warn!("failed to store device identity: {e}");
        }
    }

    for service in &state.config.services {
        debug!(service = %service.name, protocol = %service.protocol, "announcing service");
        send(
            conn,
            &DeviceMessage::Announce {
                name: &service.name,
                protocol: &service.protocol,
            },
        )
        .await;
    }
}

async fn on_connect(
    state: &DaemonState,
    conn: &Connection,
    req: ConnectRequest,
    tunnels: &TaskTracker,
) {
    let config = &state.config;
    let handler = match services::lookup(
        &config.services,
        &config.ssh_addr,
        &req.service,
        &req.protocol,
    ) {
        Ok(handler) => handler,
        Err(e) => {
            warn!(tunnel_id = %req.tunnel_id, service = %req.service, "rejecting tunnel: {e}");
            let reply = DeviceMessage::ConnectError {
                tunnel_id: &req.tunnel_id,
                code: e.code(),
                msg: e.to_string(),
            };
            send(conn, &reply).await;
            return;
        }
    };
    let Some(device) = state.auth.device() else {
        warn!(tunnel_id = %req.tunnel_id, "no device credentials, ignoring tunnel request");
        return;
    };

    let broker = req
        .broker
        .clone()
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| config.api_server(&device.credentials));
    let opts = config.tunnel.options();
    let guard = state.track_tunnel();
    let span = info_span!(
        "connect",
        tunnel_id = %req.tunnel_id,
        service = %req.service,
        client_user = req.client_user.as_deref().unwrap_or(""),
        client_ip = req.client_ip.as_deref().unwrap_or(""),
    );
    tunnels.spawn(
        async move {
            let _guard = guard;
            info!(handler = handler.name(), "incoming tunnel");
            let tunnel = match accept(
                &broker,
                &device.credentials,
                &req.tunnel_id,
                device.device_key.as_deref(),
                opts,
            )
            .await
            {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!("failed to accept tunnel: {e}");
                    return;
                }
            };
            match handler.run(tunnel).await {
                Ok(()) => info!("tunnel finished"),
                Err(e) => warn!("tunnel ended with error: {e}"),
            }
        }
        .instrument(span),
    );
}

async fn send(conn: &Connection, msg: &DeviceMessage<'_>) {
    if let Err(e) = conn.send_json(msg).await {
        debug!("failed to send serve message: {e}");
    }
}
