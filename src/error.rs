//! Categorized errors shared by the transport, tunnel, daemon and pipe.
//!
//! The relay speaks HTTP status codes, so the named kinds follow them:
//!
//! | Kind                   | Code | Recovery                         |
//! |------------------------|------|----------------------------------|
//! | `Authentication`       | 401  | fatal for the daemon             |
//! | `Forbidden`            | 403  | surfaced, no retry               |
//! | `NotFound`             | 404  | surfaced, no retry               |
//! | `TooManyRequests`      | 429  | retry after 600 s                |
//! | `BadRequest`           | 400  | surfaced, no retry               |
//! | everything else        | -    | retry with backoff               |
//!
//! [`Error`] is `Clone` so a single terminal error can be handed to every
//! awaiter of a tunnel (the `connected` waiter and `wait_closed` callers).

use std::fmt;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The recovery bucket an [`Error`] falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Forbidden,
    NotFound,
    TooManyRequests,
    BadRequest,
    /// Transport and protocol faults, timeouts and any other API code.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "AuthenticationError",
            Self::Forbidden => "ForbiddenError",
            Self::NotFound => "NotFoundError",
            Self::TooManyRequests => "TooManyRequestsError",
            Self::BadRequest => "BadRequestError",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Relay reported an error code without a dedicated kind.
    #[error("API error {code}: {msg}")]
    Api { code: u16, msg: String },

    /// Dial, read or write failure on the WebSocket.
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer closed the WebSocket with a non-normal close code.
    #[error("connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    /// Malformed frame or message, or an operation the protocol forbids.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Map an HTTP-style status code (from a dial response or an `error:`
    /// frame) to the matching variant.
    pub fn from_status(code: u16, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            400 => Self::BadRequest(msg),
            401 => Self::Authentication(msg),
            403 => Self::Forbidden(msg),
            404 => Self::NotFound(msg),
            429 => Self::TooManyRequests(msg),
            _ => Self::Api { code, msg },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TooManyRequests(_) => ErrorKind::TooManyRequests,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            _ => ErrorKind::Other,
        }
    }

    /// Numeric code for `connectError` replies and logs.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Authentication(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::TooManyRequests(_) => 429,
            Self::Api { code, .. } => *code,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// True for failures of the WebSocket itself (as opposed to API errors
    /// reported by the relay).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed { .. } | Self::Io(_))
    }

    /// Message shown to a person at the terminal.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication(_) => {
                "authentication failed, check your credentials (ondevice login)".to_string()
            }
            Self::Forbidden(msg) => format!("access denied: {msg}"),
            Self::NotFound(msg) => format!("not found: {msg}"),
            Self::TooManyRequests(_) => "too many requests, try again later".to_string(),
            Self::BadRequest(msg) => format!("bad request: {msg}"),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => {
                let status = response.status();
                let reason = status.canonical_reason().unwrap_or("").to_string();
                match status.as_u16() {
                    400 | 401 | 403 | 404 | 429 => Self::from_status(status.as_u16(), reason),
                    code => Self::Transport(format!("unexpected response: {code} {reason}")),
                }
            }
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::Transport(format!("invalid URL: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(
            Error::from_status(401, "x").kind(),
            ErrorKind::Authentication
        );
        assert_eq!(Error::from_status(403, "x").kind(), ErrorKind::Forbidden);
        assert_eq!(Error::from_status(404, "x").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::from_status(429, "x").kind(),
            ErrorKind::TooManyRequests
        );
        assert_eq!(Error::from_status(400, "x").kind(), ErrorKind::BadRequest);
        assert_eq!(Error::from_status(503, "x").kind(), ErrorKind::Other);
    }

    #[test]
    fn codes_round_trip_through_from_status() {
        for code in [400, 401, 403, 404, 429, 502] {
            assert_eq!(Error::from_status(code, "m").code(), code);
        }
    }

    #[test]
    fn transport_faults_are_other() {
        let e = Error::Transport("reset".into());
        assert_eq!(e.kind(), ErrorKind::Other);
        assert!(e.is_transport());
        assert!(!Error::Timeout("connected".into()).is_transport());
    }

    #[test]
    fn user_messages_distinguish_named_kinds() {
        assert!(Error::from_status(401, "")
            .user_message()
            .contains("authentication failed"));
        assert_eq!(
            Error::from_status(404, "device offline").user_message(),
            "not found: device offline"
        );
        assert_eq!(
            Error::Transport("eof".into()).user_message(),
            "transport error: eof"
        );
    }
}
