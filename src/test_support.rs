//! In-process relay for the async tests.
//!
//! Serves `/serve`, `/connect`, `/accept` and `/echo` under `/v1.1` on a
//! loopback port. A `/connect` for a registered device is brokered through
//! the device's serve channel exactly like the real relay does; otherwise
//! (and for `/accept` of an unknown tunnel) a scripted peer answers.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::auth::Credentials;

type Params = Query<HashMap<String, String>>;
type Brokered = Result<WebSocket, (u16, String)>;

/// How the scripted peer behaves on its next tunnels.
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// Send `meta:connected`.
    pub connect: bool,
    /// Send a text message and two malformed frames after connecting.
    pub noise: bool,
    /// Send `meta:ping:hi` after connecting.
    pub ping_on_connect: bool,
    /// Frames sent right after connecting.
    pub preamble: Vec<Bytes>,
    /// Echo `data:` and `meta:EOF` frames back.
    pub echo: bool,
    /// Send `error:<this>` instead of connecting.
    pub error: Option<String>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            connect: true,
            noise: false,
            ping_on_connect: false,
            preamble: Vec::new(),
            echo: true,
            error: None,
        }
    }
}

pub struct FakeRelay {
    addr: SocketAddr,
    relay: Relay,
    server: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    base_url: String,
    accounts: Mutex<Vec<(String, String)>>,
    script: Mutex<PeerScript>,
    answer_pings: AtomicBool,
    pongs_sent: AtomicUsize,
    peer_frames: Mutex<Vec<Vec<u8>>>,
    user_agents: Mutex<Vec<String>>,
    accept_keys: Mutex<Vec<Option<String>>>,
    serve_keys: Mutex<Vec<Option<String>>>,
    serve_users: Mutex<Vec<String>>,
    serve_failures: Mutex<VecDeque<StatusCode>>,
    identity: Mutex<(String, String)>,
    sessions: AtomicUsize,
    device: Mutex<Option<(usize, mpsc::UnboundedSender<String>)>>,
    device_messages: Mutex<Vec<Value>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Brokered>>>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay {
            inner: Arc::new(Inner {
                base_url: format!("http://{addr}/"),
                accounts: Mutex::new(vec![
                    ("client".into(), "client-secret".into()),
                    ("device".into(), "device-secret".into()),
                ]),
                script: Mutex::new(PeerScript::default()),
                answer_pings: AtomicBool::new(true),
                pongs_sent: AtomicUsize::new(0),
                peer_frames: Mutex::new(Vec::new()),
                user_agents: Mutex::new(Vec::new()),
                accept_keys: Mutex::new(Vec::new()),
                serve_keys: Mutex::new(Vec::new()),
                serve_users: Mutex::new(Vec::new()),
                serve_failures: Mutex::new(VecDeque::new()),
                identity: Mutex::new(("device.pi".into(), "devkey-1".into())),
                sessions: AtomicUsize::new(0),
                device: Mutex::new(None),
                device_messages: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        };

        let app = Router::new()
            .route("/v1.1/echo/websocket", get(echo))
            .route("/v1.1/serve/websocket", get(serve))
            .route("/v1.1/connect/websocket", get(connect))
            .route("/v1.1/accept/websocket", get(accept))
            .fallback(|| async { StatusCode::BAD_GATEWAY })
            .with_state(relay.clone());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            relay,
            server,
        }
    }

    pub fn base_url(&self) -> String {
        self.relay.inner.base_url.clone()
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn client_credentials(&self) -> Credentials {
        Credentials::new("client", "client-secret")
    }

    pub fn device_credentials(&self) -> Credentials {
        Credentials::new("device", "device-secret")
    }

    pub fn add_account(&self, user: &str, key: &str) {
        let mut accounts = self.relay.inner.accounts.lock().unwrap();
        accounts.push((user.into(), key.into()));
    }

    pub fn set_script(&self, script: PeerScript) {
        *self.relay.inner.script.lock().unwrap() = script;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.relay.inner.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// `hello` identity sent to devices on `/serve`.
    pub fn set_identity(&self, dev_id: &str, key: &str) {
        *self.relay.inner.identity.lock().unwrap() = (dev_id.into(), key.into());
    }

    /// Answer the next `/serve` dial with `status` instead of upgrading.
    pub fn fail_next_serve(&self, status: StatusCode) {
        self.relay.inner.serve_failures.lock().unwrap().push_back(status);
    }

    /// Binary frames the scripted peer received, in order.
    /// `meta:pong` replies the scripted peer has sent.
    pub fn pongs_sent(&self) -> usize {
        self.relay.inner.pongs_sent.load(Ordering::SeqCst)
    }

    pub fn peer_frames(&self) -> Vec<Vec<u8>> {
        self.relay.inner.peer_frames.lock().unwrap().clone()
    }

    pub fn peer_frames_with_prefix(&self, prefix: &[u8]) -> usize {
        self.peer_frames()
            .iter()
            .filter(|f| f.starts_with(prefix))
            .count()
    }

    pub fn last_user_agent(&self) -> Option<String> {
        self.relay.inner.user_agents.lock().unwrap().last().cloned()
    }

    pub fn last_accept_key(&self) -> Option<String> {
        self.relay
            .inner
            .accept_keys
            .lock()
            .unwrap()
            .last()
            .cloned()
            .flatten()
    }

    /// `key` query parameter of every accepted `/serve` dial.
    pub fn serve_keys(&self) -> Vec<Option<String>> {
        self.relay.inner.serve_keys.lock().unwrap().clone()
    }

    /// User of every accepted `/serve` dial.
    pub fn serve_users(&self) -> Vec<String> {
        self.relay.inner.serve_users.lock().unwrap().clone()
    }

    pub fn device_online(&self) -> bool {
        self.relay.inner.device.lock().unwrap().is_some()
    }

    pub async fn wait_device_online(&self) {
        wait_until(|| self.device_online()).await;
    }

    pub async fn wait_device_offline(&self) {
        wait_until(|| !self.device_online()).await;
    }

    pub fn send_to_device(&self, msg: Value) {
        let device = self.relay.inner.device.lock().unwrap();
        let (_, tx) = device.as_ref().expect("no device connected");
        tx.send(msg.to_string()).unwrap();
    }

    /// Close the current serve channel from the relay side.
    pub fn drop_device(&self) {
        self.relay.inner.device.lock().unwrap().take();
    }

    pub fn device_messages(&self) -> Vec<Value> {
        self.relay.inner.device_messages.lock().unwrap().clone()
    }

    /// First serve-channel message of type `kind` (waits for it).
    pub async fn wait_device_message(&self, kind: &str) -> Value {
        let find = || {
            self.device_messages()
                .into_iter()
                .find(|m| m["_type"] == kind)
        };
        wait_until(|| find().is_some()).await;
        find().unwrap()
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

impl Relay {
    /// Check `Authorization` and record `User-Agent`. Returns the user.
    fn authorize(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(ua) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
            self.inner.user_agents.lock().unwrap().push(ua.to_string());
        }
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, key) = decoded.split_once(':')?;
        let accounts = self.inner.accounts.lock().unwrap();
        accounts
            .iter()
            .any(|(u, k)| u == user && k == key)
            .then(|| user.to_string())
    }

    fn record_frame(&self, frame: &[u8]) {
        self.inner.peer_frames.lock().unwrap().push(frame.to_vec());
    }
}

async fn echo(State(relay): State<Relay>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if relay.authorize(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                Message::Text(_) | Message::Binary(_) => msg,
                _ => continue,
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    })
}

async fn serve(
    State(relay): State<Relay>,
    Query(params): Params,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(status) = relay.inner.serve_failures.lock().unwrap().pop_front() {
        return status.into_response();
    }
    let Some(user) = relay.authorize(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    relay.inner.serve_keys.lock().unwrap().push(params.get("key").cloned());
    relay.inner.serve_users.lock().unwrap().push(user);
    ws.on_upgrade(move |socket| serve_session(relay, socket))
}

async fn serve_session(relay: Relay, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let (dev_id, key) = relay.inner.identity.lock().unwrap().clone();
    let hello = json!({"_type": "hello", "devId": dev_id, "key": key});
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }
    let session = relay.inner.sessions.fetch_add(1, Ordering::SeqCst);
    *relay.inner.device.lock().unwrap() = Some((session, tx));

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "".into(),
            })))
            .await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if value["_type"] == "connectError" {
            let id = value["tunnelId"].as_str().unwrap_or_default().to_string();
            let code = value["code"].as_u64().unwrap_or(500) as u16;
            let msg = value["msg"].as_str().unwrap_or_default().to_string();
            if let Some(waiter) = relay.inner.pending.lock().unwrap().remove(&id) {
                let _ = waiter.send(Err((code, msg)));
            }
        }
        relay.inner.device_messages.lock().unwrap().push(value);
    }

    {
        let mut device = relay.inner.device.lock().unwrap();
        if matches!(*device, Some((s, _)) if s == session) {
            device.take();
        }
    }
    writer.abort();
}

async fn connect(
    State(relay): State<Relay>,
    Query(params): Params,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if relay.authorize(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let device = relay.inner.device.lock().unwrap().as_ref().map(|(_, tx)| tx.clone());
    let Some(device) = device else {
        return ws.on_upgrade(move |socket| scripted_peer(relay, socket));
    };

    let tunnel_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    relay
        .inner
        .pending
        .lock()
        .unwrap()
        .insert(tunnel_id.clone(), tx);
    let request = json!({
        "_type": "connect",
        "tunnelId": tunnel_id,
        "service": params.get("service"),
        "protocol": params.get("protocol"),
        "broker": relay.inner.base_url,
        "clientUser": "client",
        "clientIp": "127.0.0.1",
    });
    let _ = device.send(request.to_string());
    ws.on_upgrade(move |socket| broker(socket, rx))
}

async fn accept(
    State(relay): State<Relay>,
    Query(params): Params,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if relay.authorize(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    relay.inner.accept_keys.lock().unwrap().push(params.get("key").cloned());
    let id = params.get("tunnel").cloned().unwrap_or_default();
    let waiter = relay.inner.pending.lock().unwrap().remove(&id);
    match waiter {
        Some(waiter) => ws.on_upgrade(move |socket| async move {
            let _ = waiter.send(Ok(socket));
        }),
        None => ws.on_upgrade(move |socket| scripted_peer(relay, socket)),
    }
}

/// Client half of a brokered tunnel: wait for the device, then splice.
async fn broker(mut client: WebSocket, device: oneshot::Receiver<Brokered>) {
    let device = match tokio::time::timeout(Duration::from_secs(5), device).await {
        Ok(Ok(Ok(device))) => device,
        Ok(Ok(Err((code, msg)))) => {
            let _ = client.send(binary(format!("error:{code}:{msg}"))).await;
            return drain_until_closed(client).await;
        }
        _ => {
            let _ = client.send(binary("error:504:device did not accept")).await;
            return drain_until_closed(client).await;
        }
    };
    let mut device = device;
    let _ = device.send(binary("meta:connected")).await;
    let _ = client.send(binary("meta:connected")).await;

    let (client_tx, client_rx) = client.split();
    let (device_tx, device_rx) = device.split();
    tokio::join!(forward(client_rx, device_tx), forward(device_rx, client_tx));
}

async fn forward(mut rx: SplitStream<WebSocket>, mut tx: SplitSink<WebSocket, Message>) {
    // keep reading past Close so the close reply gets flushed
    while let Some(Ok(msg)) = rx.next().await {
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    let _ = tx.close().await;
}

async fn drain_until_closed(mut socket: WebSocket) {
    while let Some(Ok(_)) = socket.recv().await {}
}

fn binary(frame: impl Into<Bytes>) -> Message {
    Message::Binary(frame.into())
}

async fn scripted_peer(relay: Relay, mut socket: WebSocket) {
    let script = relay.inner.script.lock().unwrap().clone();
    if let Some(err) = script.error {
        let _ = socket.send(binary(format!("error:{err}"))).await;
        return drain_until_closed(socket).await;
    }
    if !script.connect {
        return drain_until_closed(socket).await;
    }

    let _ = socket.send(binary("meta:connected")).await;
    if script.noise {
        let _ = socket.send(Message::Text("not a frame".into())).await;
        let _ = socket.send(binary("garbage")).await;
        let _ = socket.send(binary("meta:bogus")).await;
    }
    if script.ping_on_connect {
        let _ = socket.send(binary("meta:ping:hi")).await;
    }
    for frame in script.preamble {
        let _ = socket.send(Message::Binary(frame)).await;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Binary(frame) = msg else { continue };
        relay.record_frame(&frame);
        let is_payload = frame.starts_with(b"data:") || frame.as_ref() == b"meta:EOF";
        let reply = if is_payload {
            script.echo.then(|| frame.clone())
        } else if let Some(payload) = frame.strip_prefix(b"meta:ping") {
            relay
                .inner
                .answer_pings
                .load(Ordering::SeqCst)
                .then(|| Bytes::from([b"meta:pong".as_slice(), payload].concat()))
        } else {
            None
        };
        if let Some(reply) = reply {
            let is_pong = reply.starts_with(b"meta:pong");
            if socket.send(Message::Binary(reply)).await.is_err() {
                break;
            }
            if is_pong {
                relay.inner.pongs_sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
