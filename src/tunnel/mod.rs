//! Framed, half-closable tunnels over a relay [`Connection`].
//!
//! A tunnel is opened with [`connect`] (client side) or [`accept`] (device
//! side). Both return once the relay has sent `meta:connected`. A single
//! pump task then owns the inbound side of the connection: it parses
//! frames, answers liveness probes, and hands payload to the owner as
//! [`TunnelEvent`]s in arrival order. `Eof` is delivered after every `Data`
//! that preceded it and nothing follows it.
//!
//! ```text
//! Dialing ──meta:connected──▶ Connected ──send_eof──▶ HalfClosedWrite ─┐
//!                                 │                                    ├─▶ Closed
//!                                 └──meta:EOF──▶ HalfClosedRead ───────┘
//! ```
//!
//! With both halves closed the client closes at once; the device keeps the
//! socket for [`TunnelOptions::drain_delay`] first. `error:` frames,
//! transport failures and [`TunnelHandle::close`] end the tunnel from any
//! state.

pub mod client;
pub mod device;
pub mod frame;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub use client::connect;
pub use device::accept;
pub use frame::Frame;

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::ws::{self, Connection, Endpoint, Event};
use watchdog::Watchdog;

/// Payload chunks handed to the tunnel owner.
const EVENT_DEPTH: usize = 64;

/// Timing knobs of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Upper bound on dial plus the wait for `meta:connected`.
    pub connect_timeout: Duration,
    /// Client-side probe period.
    pub ping_interval: Duration,
    /// Client-side: close when the last pong is older than this.
    pub pong_timeout: Duration,
    /// Device-side inactivity limit.
    pub idle_timeout: Duration,
    /// Device-side delay between "both halves closed" and the actual close.
    pub drain_delay: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(180),
            idle_timeout: Duration::from_secs(180),
            drain_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Device,
    Client,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    Connected,
    HalfClosedRead,
    HalfClosedWrite,
    /// Both halves closed, close pending (device side only).
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Data(Bytes),
    Eof,
}

/// An open tunnel: a writable handle plus the inbound event stream.
pub struct Tunnel {
    handle: TunnelHandle,
    events: mpsc::Receiver<TunnelEvent>,
}

impl Tunnel {
    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Next payload chunk or `Eof`. `None` once the tunnel is closed.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (TunnelHandle, mpsc::Receiver<TunnelEvent>) {
        (self.handle, self.events)
    }
}

/// Cloneable write side of a tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<Shared>,
}

struct Shared {
    side: Side,
    conn: Connection,
    opts: TunnelOptions,
    opened: Instant,
    connected: AtomicBool,
    read_eof: AtomicBool,
    write_eof: AtomicBool,
    draining: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Milliseconds after `opened` at which the last pong arrived.
    last_pong_ms: AtomicU64,
    failure: OnceLock<Error>,
    outcome: watch::Sender<Option<Result<()>>>,
}

impl TunnelHandle {
    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TunnelState {
        let s = &self.inner;
        if s.outcome.borrow().is_some() || s.conn.is_closing() {
            return TunnelState::Closed;
        }
        if !s.connected.load(Ordering::SeqCst) {
            return TunnelState::Dialing;
        }
        match (
            s.read_eof.load(Ordering::SeqCst),
            s.write_eof.load(Ordering::SeqCst),
        ) {
            (false, false) => TunnelState::Connected,
            (true, false) => TunnelState::HalfClosedRead,
            (false, true) => TunnelState::HalfClosedWrite,
            (true, true) => TunnelState::Draining,
        }
    }

    /// Send `data` as one `data:` frame.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let s = &self.inner;
        if s.write_eof.load(Ordering::SeqCst) {
            return Err(Error::Protocol("write after EOF".to_string()));
        }
        s.conn
            .send_binary(Frame::Data(Bytes::copy_from_slice(data)).encode())
            .await?;
        s.bytes_written.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Half-close the write direction. Only the first call emits `meta:EOF`.
    pub async fn send_eof(&self) -> Result<()> {
        if self.inner.write_eof.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.conn.send_binary(Frame::Eof.encode()).await?;
        self.finish_if_done();
        Ok(())
    }

    /// Close the tunnel. Further calls are no-ops.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    /// Resolve once the tunnel is closed, with the error that ended it if
    /// any.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut outcome = self.inner.outcome.subscribe();
        let Ok(done) = outcome.wait_for(Option::is_some).await else {
            return Ok(());
        };
        done.clone().unwrap_or(Ok(()))
    }

    pub(crate) fn fail(&self, err: Error) {
        if self.inner.failure.set(err).is_ok() {
            debug!(side = self.inner.side.as_str(), "tunnel failed");
        }
        self.close();
    }

    fn finish_if_done(&self) {
        let s = &self.inner;
        if !(s.read_eof.load(Ordering::SeqCst) && s.write_eof.load(Ordering::SeqCst)) {
            return;
        }
        match s.side {
            Side::Client => self.close(),
            Side::Device => {
                if s.draining.swap(true, Ordering::SeqCst) {
                    return;
                }
                let delay = s.opts.drain_delay;
                debug!(?delay, "both halves closed, draining");
                let handle = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle.close();
                });
            }
        }
    }

    fn mark_pong(&self) {
        let ms = self.inner.opened.elapsed().as_millis() as u64;
        self.inner.last_pong_ms.store(ms, Ordering::SeqCst);
    }

    fn since_last_pong(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_pong_ms.load(Ordering::SeqCst));
        self.inner.opened.elapsed().saturating_sub(last)
    }
}

impl Tunnel {
    /// Wrap a dialed connection and spawn its pump. The receiver resolves
    /// on `meta:connected` or with the error that ended the tunnel first.
    pub(crate) fn start(
        conn: Connection,
        incoming: mpsc::Receiver<Event>,
        side: Side,
        opts: TunnelOptions,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (outcome, _) = watch::channel(None);
        let handle = TunnelHandle {
            inner: Arc::new(Shared {
                side,
                conn: conn.clone(),
                opts,
                opened: Instant::now(),
                connected: AtomicBool::new(false),
                read_eof: AtomicBool::new(false),
                write_eof: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                last_pong_ms: AtomicU64::new(0),
                failure: OnceLock::new(),
                outcome,
            }),
        };
        let (events_tx, events) = mpsc::channel(EVENT_DEPTH);
        let (connected_tx, connected_rx) = oneshot::channel();

        let span = info_span!(
            "tunnel",
            side = side.as_str(),
            endpoint = conn.endpoint().as_str()
        );
        let task = pump(handle.clone(), incoming, events_tx, connected_tx);
        tokio::spawn(task.instrument(span));
        (Self { handle, events }, connected_rx)
    }
}

/// Dial `url` and wait for `meta:connected`, both within
/// `opts.connect_timeout`.
pub(crate) async fn open(
    url: &Url,
    creds: &Credentials,
    endpoint: Endpoint,
    side: Side,
    opts: TunnelOptions,
) -> Result<Tunnel> {
    let deadline = Instant::now() + opts.connect_timeout;
    let (conn, incoming) = tokio::time::timeout_at(deadline, ws::dial(url, creds, endpoint))
        .await
        .map_err(|_| Error::Timeout(format!("dialing {}", endpoint.as_str())))??;

    let (tunnel, connected) = Tunnel::start(conn, incoming, side, opts);
    match tokio::time::timeout_at(deadline, connected).await {
        Ok(Ok(Ok(()))) => Ok(tunnel),
        Ok(Ok(Err(e))) => {
            tunnel.handle.close();
            Err(e)
        }
        Ok(Err(_)) => Err(Error::Transport(
            "tunnel closed before it was connected".to_string(),
        )),
        Err(_) => {
            tunnel.handle.close();
            Err(Error::Timeout("waiting for the peer to connect".to_string()))
        }
    }
}

fn error_from_frame(code: Option<u16>, msg: String) -> Error {
    match code {
        Some(code) => Error::from_status(code, msg),
        None => Error::Api { code: 500, msg },
    }
}

async fn pump(
    handle: TunnelHandle,
    mut incoming: mpsc::Receiver<Event>,
    events: mpsc::Sender<TunnelEvent>,
    connected: oneshot::Sender<Result<()>>,
) {
    let s = Arc::clone(&handle.inner);
    let mut connected = Some(connected);
    let mut idle: Option<Watchdog> = None;
    let mut keepalive_task: Option<JoinHandle<()>> = None;

    while let Some(event) = incoming.recv().await {
        if let Some(dog) = &idle {
            dog.kick();
        }
        let raw = match event {
            Event::Binary(raw) => raw,
            Event::Text(text) => {
                warn!(len = text.len(), "ignoring text message on tunnel");
                continue;
            }
            Event::Error(e) => {
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Err(e.clone()));
                }
                handle.fail(e);
                continue;
            }
        };
        let frame = match Frame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ignoring invalid tunnel frame: {e}");
                continue;
            }
        };

        match frame {
            Frame::Data(payload) => {
                if s.read_eof.load(Ordering::SeqCst) {
                    warn!(len = payload.len(), "dropping data received after EOF");
                    continue;
                }
                s.bytes_read.fetch_add(payload.len() as u64, Ordering::SeqCst);
                let _ = events.send(TunnelEvent::Data(payload)).await;
            }
            Frame::Connected => {
                if s.connected.swap(true, Ordering::SeqCst) {
                    debug!("ignoring repeated meta:connected");
                    continue;
                }
                handle.mark_pong();
                match s.side {
                    Side::Device => {
                        let expired = handle.clone();
                        idle = Some(Watchdog::spawn(s.opts.idle_timeout, move || {
                            info!("tunnel idle, closing");
                            expired.fail(Error::Timeout("no traffic on tunnel".to_string()));
                        }));
                    }
                    Side::Client => {
                        keepalive_task =
                            Some(tokio::spawn(keepalive(handle.clone()).in_current_span()));
                    }
                }
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Frame::Ping(payload) => match s.side {
                Side::Device => {
                    if let Err(e) = s.conn.send_binary(Frame::Pong(payload).encode()).await {
                        debug!("failed to answer ping: {e}");
                    }
                }
                Side::Client => debug!("ignoring ping on client side"),
            },
            Frame::Pong(_) => handle.mark_pong(),
            Frame::Eof => {
                if s.read_eof.swap(true, Ordering::SeqCst) {
                    debug!("ignoring repeated EOF");
                    continue;
                }
                let _ = events.send(TunnelEvent::Eof).await;
                handle.finish_if_done();
            }
            Frame::Error { code, msg } => {
                let err = error_from_frame(code, msg);
                warn!("relay ended tunnel: {err}");
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                handle.fail(err);
            }
        }
    }

    drop(idle);
    if let Some(task) = keepalive_task {
        task.abort();
    }

    let outcome = match s.failure.get() {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    };
    if let Some(tx) = connected.take() {
        let err = outcome.clone().err().unwrap_or_else(|| {
            Error::Transport("tunnel closed before it was connected".to_string())
        });
        let _ = tx.send(Err(err));
    }
    info!(
        bytes_read = handle.bytes_read(),
        bytes_written = handle.bytes_written(),
        "tunnel closed"
    );
    s.outcome.send_replace(Some(outcome));
}

/// Client-side liveness: probe every `ping_interval`, give up once the last
/// pong is older than `pong_timeout`.
async fn keepalive(handle: TunnelHandle) {
    let opts = handle.inner.opts;
    let mut ticker = tokio::time::interval(opts.ping_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if handle.state() == TunnelState::Closed {
            return;
        }
        if handle.since_last_pong() >= opts.pong_timeout {
            warn!(timeout = ?opts.pong_timeout, "no pong from peer, closing tunnel");
            handle.fail(Error::Timeout("peer stopped answering pings".to_string()));
            return;
        }
        let ping = Frame::Ping(Some(Bytes::from_static(b"hello"))).encode();
        if handle.inner.conn.send_binary(ping).await.is_err() {
            return;
        }
    }
}
