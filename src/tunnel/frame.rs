//! Tunnel frame codec.
//!
//! Every tunnel frame is a binary WebSocket message with an ASCII tag:
//!
//! | Frame                     | Meaning                                   |
//! |---------------------------|-------------------------------------------|
//! | `data:<bytes>`            | application payload                       |
//! | `meta:connected`          | relay joined both sides                   |
//! | `meta:ping[:payload]`     | liveness probe (client → device)          |
//! | `meta:pong[:payload]`     | liveness answer, echoes the payload       |
//! | `meta:EOF`                | sender will not produce more `data:`      |
//! | `error:[<code>:]<msg>`    | terminal error from the relay             |

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Connected,
    Ping(Option<Bytes>),
    Pong(Option<Bytes>),
    Eof,
    Error { code: Option<u16>, msg: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no ':' separator")]
    MissingColon,

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("unknown meta frame '{0}'")]
    UnknownMeta(String),
}

fn split_colon(b: &Bytes) -> Option<(Bytes, Bytes)> {
    let i = b.iter().position(|&c| c == b':')?;
    Some((b.slice(..i), b.slice(i + 1..)))
}

impl Frame {
    pub fn parse(raw: &Bytes) -> Result<Self, FrameError> {
        let (tag, rest) = split_colon(raw).ok_or(FrameError::MissingColon)?;
        match tag.as_ref() {
            b"data" => Ok(Self::Data(rest)),
            b"meta" => Self::parse_meta(&rest),
            b"error" => Ok(Self::parse_error(&rest)),
            other => Err(FrameError::UnknownType(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn parse_meta(rest: &Bytes) -> Result<Self, FrameError> {
        let (name, payload) = match split_colon(rest) {
            Some((name, payload)) => (name, Some(payload)),
            None => (rest.clone(), None),
        };
        match name.as_ref() {
            b"connected" => Ok(Self::Connected),
            b"ping" => Ok(Self::Ping(payload)),
            b"pong" => Ok(Self::Pong(payload)),
            b"EOF" => Ok(Self::Eof),
            other => Err(FrameError::UnknownMeta(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn parse_error(rest: &Bytes) -> Self {
        let text = String::from_utf8_lossy(rest);
        if let Some((code, msg)) = text.split_once(':') {
            if let Ok(code) = code.trim().parse::<u16>() {
                return Self::Error {
                    code: Some(code),
                    msg: msg.to_string(),
                };
            }
        }
        Self::Error {
            code: None,
            msg: text.into_owned(),
        }
    }

    pub fn encode(&self) -> Bytes {
        fn tagged(prefix: &[u8], payload: Option<&[u8]>) -> Bytes {
            let extra = payload.map_or(0, |p| p.len() + 1);
            let mut buf = BytesMut::with_capacity(prefix.len() + extra);
            buf.put_slice(prefix);
            if let Some(p) = payload {
                buf.put_u8(b':');
                buf.put_slice(p);
            }
            buf.freeze()
        }

        match self {
            Self::Data(payload) => {
                let mut buf = BytesMut::with_capacity(5 + payload.len());
                buf.put_slice(b"data:");
                buf.put_slice(payload);
                buf.freeze()
            }
            Self::Connected => Bytes::from_static(b"meta:connected"),
            Self::Ping(payload) => tagged(b"meta:ping", payload.as_deref()),
            Self::Pong(payload) => tagged(b"meta:pong", payload.as_deref()),
            Self::Eof => Bytes::from_static(b"meta:EOF"),
            Self::Error { code, msg } => {
                let text = match code {
                    Some(code) => format!("error:{code}:{msg}"),
                    None => format!("error:{msg}"),
                };
                Bytes::from(text)
            }
        }
    }
}
