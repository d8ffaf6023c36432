//! TCP forward handler.
//!
//! Tunnel data is written to the local socket and the peer's EOF shuts down
//! its write half. The local service's EOF, or any socket error, ends the
//! tunnel.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::error::{Error, Result};
use crate::tunnel::TunnelHandle;

/// Downstream read size.
const CHUNK: usize = 8 * 1024;

pub struct TcpForward {
    addr: String,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    pump: Option<JoinHandle<()>>,
}

impl TcpForward {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reader: None,
            writer: None,
            pump: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(&mut self, _tunnel: &TunnelHandle) -> Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Io(format!("failed to connect to {}: {e}", self.addr)))?;
        let _ = stream.set_nodelay(true);
        debug!(addr = %self.addr, "connected to local service");
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        Ok(())
    }

    /// Spawn the socket → tunnel pump.
    pub fn receive(&mut self, tunnel: &TunnelHandle) {
        if let Some(reader) = self.reader.take() {
            let task = downstream(reader, tunnel.clone()).in_current_span();
            self.pump = Some(tokio::spawn(task));
        }
    }

    pub async fn on_data(&mut self, tunnel: &TunnelHandle, data: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            debug!(
                len = data.len(),
                "local socket closed for writing, dropping data"
            );
            return;
        };
        if let Err(e) = writer.write_all(data).await {
            warn!(addr = %self.addr, "write to local service failed: {e}");
            self.writer = None;
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
            tunnel.close();
        }
    }

    /// Peer finished sending: half-close the socket.
    pub async fn on_eof(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Tunnel is gone: drop the socket.
    pub async fn finish(&mut self) {
        self.writer = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }
}

async fn downstream(mut reader: OwnedReadHalf, tunnel: TunnelHandle) {
    let mut buf = vec![0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("local service closed its side, closing tunnel");
                if let Err(e) = tunnel.send_eof().await {
                    debug!("failed to send EOF: {e}");
                }
                tunnel.close();
                return;
            }
            Ok(n) => {
                if let Err(e) = tunnel.write(&buf[..n]).await {
                    debug!("tunnel write failed: {e}");
                    tunnel.close();
                    return;
                }
            }
            Err(e) => {
                warn!("read from local service failed: {e}");
                tunnel.close();
                return;
            }
        }
    }
}
