//! `ondevice pipe`: bridge stdin/stdout to one tunnel.
//!
//! Meant as an ssh `ProxyCommand`:
//!
//! ```text
//! Host *.ondevice
//!     ProxyCommand ondevice pipe %h ssh
//! ```
//!
//! stdin is read in 8 KiB chunks and written to the tunnel; its EOF is
//! forwarded once as `meta:EOF`. Tunnel data goes to a buffered stdout that
//! is flushed after every chunk.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::auth::AuthStore;
use crate::config::Config;
use crate::error::Error;
use crate::tunnel::{self, Tunnel, TunnelEvent};

const CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("no client credentials, run `ondevice login` first")]
    NoCredentials,

    #[error("lost connection ({0})")]
    LostConnection(Error),

    #[error("failed to read stdin: {0}")]
    Stdin(std::io::Error),

    #[error("{}", .0.user_message())]
    Tunnel(Error),
}

/// Open a tunnel to `service` on `dev_id` and bridge it to stdio.
pub async fn run(
    config: &Config,
    auth: &AuthStore,
    dev_id: &str,
    service: &str,
) -> Result<(), PipeError> {
    let creds = auth.client_for(dev_id).ok_or(PipeError::NoCredentials)?;
    let server = config.api_server(&creds);
    let opts = config.tunnel.options();
    let tunnel = tunnel::connect(&server, &creds, dev_id, service, service, opts)
        .await
        .map_err(PipeError::Tunnel)?;
    info!(dev_id, service, "tunnel open");
    bridge(tunnel, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Pump `input` into `tunnel` and the tunnel into `output` until the tunnel
/// closes.
pub async fn bridge<R, W>(tunnel: Tunnel, mut input: R, output: W) -> Result<(), PipeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (handle, mut events) = tunnel.into_parts();
    let writer = tokio::spawn(async move {
        let mut out = BufWriter::new(output);
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Data(chunk) => {
                    out.write_all(&chunk).await?;
                    out.flush().await?;
                }
                TunnelEvent::Eof => debug!("remote side finished sending"),
            }
        }
        out.flush().await
    });

    let mut sent_eof = false;
    let mut buf = vec![0u8; CHUNK];
    loop {
        tokio::select! {
            read = input.read(&mut buf) => match read {
                Ok(0) => {
                    sent_eof = true;
                    if let Err(e) = handle.send_eof().await {
                        debug!("failed to send EOF: {e}");
                    }
                    break;
                }
                Ok(n) => {
                    if let Err(e) = handle.write(&buf[..n]).await {
                        debug!("tunnel write failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    handle.close();
                    let _ = handle.wait_closed().await;
                    return Err(PipeError::Stdin(e));
                }
            },
            _ = handle.wait_closed() => break,
        }
    }

    let result = handle.wait_closed().await;
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("stdout closed: {e}"),
        Err(e) => debug!("stdout writer failed: {e}"),
    }
    debug!(
        bytes_read = handle.bytes_read(),
        bytes_written = handle.bytes_written(),
        "pipe finished"
    );
    outcome(result, sent_eof)
}

/// Transport failures after our EOF went out are not worth reporting.
fn outcome(result: crate::error::Result<()>, sent_eof: bool) -> Result<(), PipeError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_transport() && sent_eof => {
            debug!("connection dropped after EOF: {e}");
            Ok(())
        }
        Err(e) if e.is_transport() => Err(PipeError::LostConnection(e)),
        Err(e) => Err(PipeError::Tunnel(e)),
    }
}
