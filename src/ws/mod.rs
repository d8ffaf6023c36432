//! Authenticated WebSocket connections to the relay.
//!
//! ## Connection lifecycle
//!
//! 1. [`dial`] builds the upgrade request with `Authorization: Basic …` and
//!    `User-Agent: ondevice v<version>`. A `401` answer becomes
//!    [`Error::Authentication`] and `429` [`Error::TooManyRequests`] (the
//!    other named codes map the same way); any other non-upgrade answer is a
//!    transport error carrying the status line.
//! 2. On success two tasks are spawned per connection:
//!    - the **read task** turns inbound frames into [`Event`]s on an `mpsc`
//!      channel owned by a single consumer, in arrival order;
//!    - the **writer task** owns the sink. Every send goes through its
//!      channel, so frames from concurrent callers never interleave.
//! 3. [`Connection::close`] is idempotent. It queues a normal close frame
//!    and silences read errors from then on. The read task gives the close
//!    handshake [`CLOSE_GRACE`] before dropping the socket.
//! 4. When the read task observes teardown it flips the `closed` watch
//!    exactly once and drops the event sender, so the consumer sees the
//!    channel end.
//!
//! A normal close (code 1000) by the peer ends the connection silently.
//! Other close codes and read errors are delivered as [`Event::Error`]
//! unless the close was initiated locally.

pub mod endpoint;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use url::Url;

pub use endpoint::{websocket_url, Endpoint};

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// How long a locally initiated close waits for the peer's close frame.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Depth of the inbound event and outbound frame channels.
const CHANNEL_DEPTH: usize = 64;

/// Something the read task observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Text(String),
    Binary(Bytes),
    /// Abnormal close or read failure. Always the last event.
    Error(Error),
}

/// `User-Agent` sent on every dial.
pub fn user_agent() -> String {
    format!("ondevice v{}", env!("CARGO_PKG_VERSION"))
}

/// Dial `url` with `creds` and start the connection's tasks.
pub async fn dial(
    url: &Url,
    creds: &Credentials,
    endpoint: Endpoint,
) -> Result<(Connection, mpsc::Receiver<Event>)> {
    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&creds.basic_auth())
            .map_err(|e| Error::Protocol(format!("invalid credentials: {e}")))?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&user_agent())
            .map_err(|e| Error::Protocol(format!("invalid user agent: {e}")))?,
    );

    debug!(
        endpoint = endpoint.as_str(),
        host = url.host_str(),
        "dialing relay"
    );
    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(Connection::start(stream, endpoint))
}

/// Cloneable, writable handle to one WebSocket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    out_tx: mpsc::Sender<Message>,
    closing: AtomicBool,
    close_requested: Notify,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Take ownership of an upgraded stream and spawn its read and writer tasks.
    pub fn start<S>(stream: WebSocketStream<S>, endpoint: Endpoint) -> (Self, mpsc::Receiver<Event>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);

        let conn = Self {
            inner: Arc::new(Inner {
                endpoint,
                out_tx,
                closing: AtomicBool::new(false),
                close_requested: Notify::new(),
                closed: closed_rx.clone(),
            }),
        };

        tokio::spawn(writer_task(sink, out_rx, closed_rx));
        tokio::spawn(read_task(source, event_tx, closed_tx, conn.clone()));
        (conn, event_rx)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text: String = text.into();
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| Error::Protocol(format!("failed to encode message: {e}")))?;
        self.send_text(text).await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if self.is_closing() || self.is_closed() {
            return Err(Error::Transport("connection is closed".to_string()));
        }
        self.inner
            .out_tx
            .send(msg)
            .await
            .map_err(|_| Error::Transport("connection is closed".to_string()))
    }

    /// Start a normal close. Further calls are no-ops.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            endpoint = self.inner.endpoint.as_str(),
            "closing connection"
        );
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        // A full queue means the writer is stuck; the grace timer still
        // tears the socket down.
        let _ = self.inner.out_tx.try_send(Message::Close(Some(frame)));
        self.inner.close_requested.notify_one();
    }

    /// Resolve once the socket is gone. Returns immediately if it already is.
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

async fn writer_task<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(msg) = msg else {
                    // every handle dropped
                    let _ = sink.close().await;
                    break;
                };
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("websocket write failed: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }
}

async fn read_task<S>(
    mut source: futures_util::stream::SplitStream<WebSocketStream<S>>,
    events: mpsc::Sender<Event>,
    closed: watch::Sender<bool>,
    conn: Connection,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let endpoint = conn.endpoint().as_str();
    let grace = async {
        conn.inner.close_requested.notified().await;
        tokio::time::sleep(CLOSE_GRACE).await;
    };
    tokio::pin!(grace);

    loop {
        let msg = tokio::select! {
            msg = source.next() => msg,
            () = &mut grace => {
                debug!(endpoint, "close handshake timed out");
                break;
            }
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if events.send(Event::Text(text.as_str().to_owned())).await.is_err() {
                    conn.close();
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if events.send(Event::Binary(data)).await.is_err() {
                    conn.close();
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| {
                    (u16::from(f.code), f.reason.as_str().to_owned())
                });
                if code != 1000 && !conn.is_closing() {
                    warn!(endpoint, code, reason = %reason, "connection closed by peer");
                    let _ = events.send(Event::Error(Error::Closed { code, reason })).await;
                }
                break;
            }
            Some(Ok(_)) => {} // ping/pong/raw frames
            Some(Err(e)) => {
                if !conn.is_closing() {
                    warn!(endpoint, "websocket read failed: {e}");
                    let _ = events.send(Event::Error(Error::Transport(e.to_string()))).await;
                }
                break;
            }
            None => {
                if !conn.is_closing() {
                    let _ = events
                        .send(Event::Error(Error::Transport(
                            "connection dropped without close frame".to_string(),
                        )))
                        .await;
                }
                break;
            }
        }
    }

    conn.inner.closing.store(true, Ordering::SeqCst);
    closed.send_replace(true);
    debug!(endpoint, "connection closed");
}
