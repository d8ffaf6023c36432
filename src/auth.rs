//! Credentials and the `auth.json` store.
//!
//! `auth.json` lives in the config directory with mode `0600`:
//!
//! ```json
//! {
//!   "client": {"user": "alice", "key": "…"},
//!   "device": {"user": "alice", "key": "…", "dev_id": "alice.pi", "device_key": "…"},
//!   "extra_clients": [{"user": "bob", "key": "…", "api_server": "https://…"}]
//! }
//! ```
//!
//! Readers take a snapshot from a `watch` channel. Every mutation is a
//! message to one writer task that re-reads the file, applies the change
//! and persists the whole file (temp file, chmod, rename) before publishing
//! the new snapshot. Updates from the serve loop and the control socket
//! never race on disk, and entries written by another process survive.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// A `user:key` pair, optionally bound to a specific relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key: key.into(),
            api_server: None,
        }
    }

    /// Value of the `Authorization` header.
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.user, self.key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// Device credentials plus the identity granted by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuth {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<String>,
    /// Opaque key from the last `hello`; reclaims the same device identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
}

/// On-disk layout of `auth.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub client: Option<Credentials>,
    #[serde(default)]
    pub device: Option<DeviceAuth>,
    #[serde(default)]
    pub extra_clients: Vec<Credentials>,
}

/// A single mutation applied by the writer task.
#[derive(Debug, Clone)]
pub enum AuthUpdate {
    /// Identity from a `hello` message.
    DeviceIdentity { dev_id: String, device_key: String },
    /// New device login. Clears the identity when the user changes.
    DeviceCredentials(Credentials),
    ClientCredentials(Credentials),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write auth file: {0}")]
    Write(#[from] std::io::Error),

    #[error("auth writer has stopped")]
    WriterGone,
}

type UpdateRequest = (AuthUpdate, oneshot::Sender<Result<(), AuthError>>);

/// Cloneable handle to the auth store.
#[derive(Clone)]
pub struct AuthStore {
    snapshot: watch::Receiver<AuthFile>,
    updates: mpsc::Sender<UpdateRequest>,
    env_client: Option<Credentials>,
}

impl AuthStore {
    /// Load `path` (missing file = empty store) and spawn the writer task.
    ///
    /// `env_client` (from `ONDEVICE_USER`/`ONDEVICE_AUTH`) replaces the
    /// default client credentials for lookups but is never persisted.
    pub fn open(
        path: impl Into<PathBuf>,
        env_client: Option<Credentials>,
    ) -> Result<Self, AuthError> {
        let path = path.into();
        let initial = read_file(&path)?;
        let (snapshot_tx, snapshot) = watch::channel(initial);
        let (updates, rx) = mpsc::channel(16);
        tokio::spawn(writer_task(path, snapshot_tx, rx));
        Ok(Self {
            snapshot,
            updates,
            env_client,
        })
    }

    pub fn snapshot(&self) -> AuthFile {
        self.snapshot.borrow().clone()
    }

    pub fn device(&self) -> Option<DeviceAuth> {
        self.snapshot.borrow().device.clone()
    }

    /// Client credentials for reaching `dev_id`.
    ///
    /// A `user.` prefix on the device id selects that user's entry from
    /// `extra_clients` when present; otherwise the default client is used.
    pub fn client_for(&self, dev_id: &str) -> Option<Credentials> {
        let auth = self.snapshot.borrow();
        if let Some((user, _)) = dev_id.split_once('.') {
            if let Some(c) = auth.extra_clients.iter().find(|c| c.user == user) {
                return Some(c.clone());
            }
        }
        self.env_client.clone().or_else(|| auth.client.clone())
    }

    /// Apply `update` and wait until it is on disk.
    pub async fn update(&self, update: AuthUpdate) -> Result<(), AuthError> {
        let (reply, done) = oneshot::channel();
        self.updates
            .send((update, reply))
            .await
            .map_err(|_| AuthError::WriterGone)?;
        done.await.map_err(|_| AuthError::WriterGone)?
    }
}

fn read_file(path: &Path) -> Result<AuthFile, AuthError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| AuthError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AuthFile::default()),
        Err(source) => Err(AuthError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn apply(auth: &mut AuthFile, update: AuthUpdate) {
    match update {
        AuthUpdate::DeviceIdentity { dev_id, device_key } => {
            let device = auth.device.get_or_insert_with(DeviceAuth::default);
            device.dev_id = Some(dev_id);
            device.device_key = Some(device_key);
        }
        AuthUpdate::DeviceCredentials(creds) => {
            let device = auth.device.get_or_insert_with(DeviceAuth::default);
            if device.credentials.user != creds.user {
                device.dev_id = None;
                device.device_key = None;
            }
            device.credentials = creds;
        }
        AuthUpdate::ClientCredentials(creds) => auth.client = Some(creds),
    }
}

async fn writer_task(
    path: PathBuf,
    snapshot: watch::Sender<AuthFile>,
    mut rx: mpsc::Receiver<UpdateRequest>,
) {
    while let Some((update, reply)) = rx.recv().await {
        // `ondevice login` may have rewritten the file from another process
        let current = match read_file(&path) {
            Ok(auth) => auth,
            Err(e) => {
                warn!("{e}, keeping the in-memory copy");
                snapshot.borrow().clone()
            }
        };
        let mut next = current.clone();
        apply(&mut next, update);
        if next == current {
            snapshot.send_if_modified(|s| {
                let changed = *s != next;
                *s = next;
                changed
            });
            let _ = reply.send(Ok(()));
            continue;
        }
        let result = write_atomic(&path, &next).await;
        match &result {
            Ok(()) => {
                debug!(path = %path.display(), "auth file written");
                snapshot.send_replace(next);
            }
            Err(e) => warn!(path = %path.display(), "failed to write auth file: {e}"),
        }
        let _ = reply.send(result);
    }
}

/// Write `auth` to `path` via `<path>.tmp` + rename, mode `0600`.
async fn write_atomic(path: &Path, auth: &AuthFile) -> Result<(), AuthError> {
    let json = serde_json::to_vec_pretty(auth).map_err(std::io::Error::other)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    // the temp file may predate us with looser permissions
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
