//! Control socket client, HTTP/1.1 via `hyper` over the chosen transport.
//!
//! Candidate addresses are tried in order; the first one that accepts a
//! connection answers the request. If none does, the daemon is considered
//! not running.

use std::io::ErrorKind;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use super::types::{ErrorResponse, LoginRequest, LoginResponse, StateResponse};
use super::{ControlAddr, ControlError};
use crate::config::Config;

pub struct ControlClient {
    candidates: Vec<ControlAddr>,
}

impl ControlClient {
    pub fn new(candidates: Vec<ControlAddr>) -> Self {
        Self { candidates }
    }

    /// Candidates from configuration: `ONDEVICE_HOST`, else the configured
    /// socket and then the system-wide one.
    pub fn from_config(config: &Config) -> Result<Self, ControlError> {
        let candidates = config
            .control_candidates()
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(candidates))
    }

    pub async fn state(&self) -> Result<StateResponse, ControlError> {
        let body = self.request(Method::GET, "/state", None).await?;
        serde_json::from_slice(&body).map_err(|e| ControlError::Parse(e.to_string()))
    }

    /// Push new device credentials to the running daemon.
    pub async fn login(&self, user: &str, key: &str) -> Result<LoginResponse, ControlError> {
        let form = LoginRequest {
            user: user.to_string(),
            key: key.to_string(),
        };
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("user", &form.user)
            .append_pair("key", &form.key)
            .finish();
        let body = self
            .request(Method::POST, "/login", Some(Bytes::from(encoded)))
            .await?;
        serde_json::from_slice(&body).map_err(|e| ControlError::Parse(e.to_string()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<Bytes>,
    ) -> Result<Bytes, ControlError> {
        let mut tried = Vec::new();
        for addr in &self.candidates {
            let result = match addr {
                ControlAddr::Unix(path_buf) => match UnixStream::connect(path_buf).await {
                    Ok(stream) => {
                        let answer = exchange(stream, "localhost", &method, path, form.clone());
                        Ok(answer.await)
                    }
                    Err(e) => Err(e),
                },
                ControlAddr::Http { host, port } => {
                    match TcpStream::connect((host.as_str(), *port)).await {
                        Ok(stream) => {
                            let authority = format!("{host}:{port}");
                            let answer = exchange(stream, &authority, &method, path, form.clone());
                            Ok(answer.await)
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            match result {
                Ok(answer) => return answer,
                Err(e) if is_not_listening(&e) => {
                    debug!(addr = %addr, "control socket not reachable: {e}");
                    tried.push(addr.to_string());
                }
                Err(source) => {
                    return Err(ControlError::Connect {
                        addr: addr.to_string(),
                        source,
                    })
                }
            }
        }
        Err(ControlError::NotRunning(tried.join(", ")))
    }
}

fn is_not_listening(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::PermissionDenied
    )
}

async fn exchange<S>(
    stream: S,
    authority: &str,
    method: &Method,
    path: &str,
    form: Option<Bytes>,
) -> Result<Bytes, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| ControlError::Request(format!("HTTP handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("control connection error: {e}");
        }
    });

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(path)
        .header("host", authority);
    if form.is_some() {
        builder = builder.header("content-type", "application/x-www-form-urlencoded");
    }
    let req = builder
        .body(Full::new(form.unwrap_or_default()))
        .map_err(|e| ControlError::Request(format!("failed to build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ControlError::Request(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ControlError::Request(format!("failed to read response body: {e}")))?
        .to_bytes();

    if status != StatusCode::OK {
        if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&body) {
            return Err(ControlError::Daemon(err.error));
        }
        return Err(ControlError::Request(format!("unexpected status: {status}")));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::auth::AuthStore;
    use crate::control::ControlServer;
    use crate::state::{Connectivity, DaemonState};

    #[tokio::test]
    async fn no_daemon_on_any_candidate_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(vec![
            ControlAddr::Unix(dir.path().join("missing.sock")),
            ControlAddr::Unix(dir.path().join("also-missing.sock")),
        ]);
        let err = client.state().await.unwrap_err();
        let ControlError::NotRunning(tried) = err else {
            panic!("expected NotRunning, got {err:?}");
        };
        assert!(
            tried.contains("missing.sock") && tried.contains("also-missing.sock")
        );
    }

    #[tokio::test]
    async fn falls_back_to_second_candidate_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_dir(dir.path());
        let auth = AuthStore::open(config.auth_file(), None).unwrap();
        let state = DaemonState::new(Arc::new(config), auth);
        state.set_online("alice.pi");

        let server = ControlServer::bind(&"http://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().clone();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(state.clone(), shutdown.clone()));

        let gone = ControlAddr::Unix(dir.path().join("gone.sock"));
        let client = ControlClient::new(vec![gone, addr]);
        let reply = client.state().await.unwrap();
        assert_eq!(reply.device.state, Connectivity::Online);

        let login = client.login("bob", "key with spaces&more").await.unwrap();
        assert_eq!(login.user, "bob");
        assert_eq!(
            state.auth.device().unwrap().credentials.key,
            "key with spaces&more"
        );

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn env_host_is_the_only_candidate() {
        let mut config = Config::with_dir("/tmp/od");
        config.control_host_override = Some("http://127.0.0.1:1236".into());
        let client = ControlClient::from_config(&config).unwrap();
        assert_eq!(
            client.candidates,
            vec![ControlAddr::Http {
                host: "127.0.0.1".into(),
                port: 1236
            }]
        );
    }
}
