//! JSON bodies of the control socket.
//!
//! Field names follow the wire format consumed by existing tooling
//! (`devId`, camelCase).

use serde::{Deserialize, Serialize};

use crate::state::Connectivity;

/// `GET /state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub version: String,
    pub client: ClientInfo,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "devId", default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<String>,
    pub state: Connectivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonInfo {
    pub pid: u32,
    pub uptime_secs: u64,
    pub active_tunnels: usize,
    pub tunnels_total: u64,
    pub reconnects: u64,
}

/// `POST /login`, form-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
