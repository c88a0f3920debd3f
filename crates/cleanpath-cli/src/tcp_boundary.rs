//! TCP listener adapter.
//!
//! Each accepted connection becomes a transport boundary. A raw TCP stream
//! has no message boundaries, so the first message is cut off the stream by
//! its own framing (the DER header of a CleanPath PDU, or the TPKT header of
//! a raw negotiation packet). After that, bytes are passed through as read.

use async_trait::async_trait;
use cleanpath_core::{RAW_NEGOTIATION_MARKER, detect_pdu_length, tpkt_length};
use cleanpath_relay::{Boundary, BoundaryError, CleanPathProxy, DEFAULT_FORWARD_BUFFER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Boundary over the write half of an accepted TCP connection
pub struct TcpBoundary {
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: SocketAddr,
}

impl TcpBoundary {
    /// Wrap `writer`
    pub fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            peer,
        }
    }
}

#[async_trait]
impl Boundary for TcpBoundary {
    async fn send(&self, data: &[u8]) -> Result<(), BoundaryError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(BoundaryError::Closed)?;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer = %self.peer, "Shutdown failed: {}", e);
            }
        }
        tracing::debug!(peer = %self.peer, code, "Client connection closed: {}", reason);
    }
}

/// Length of the first message at the start of `buf`.
///
/// `None` means more bytes are needed to tell. The returned length may
/// exceed `buf.len()`; unrecognized input is handed over whole so the relay
/// can reject it.
pub fn first_message_len(buf: &[u8]) -> Option<usize> {
    match buf.first() {
        None => None,
        Some(&RAW_NEGOTIATION_MARKER) => {
            if buf.len() < cleanpath_core::framing::TPKT_HEADER_SIZE {
                None
            } else {
                Some(tpkt_length(buf).unwrap_or(buf.len()))
            }
        }
        Some(_) => match detect_pdu_length(buf) {
            Ok(len) => len,
            Err(_) => Some(buf.len()),
        },
    }
}

/// Attach an accepted connection to the relay and pump its inbound bytes.
///
/// # Errors
///
/// Returns an error if the session cannot be attached.
pub async fn serve_connection(
    proxy: CleanPathProxy,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let boundary = Arc::new(TcpBoundary::new(writer, peer));

    let endpoint = proxy.create_default_endpoint();
    let bridge = proxy.attach_transport(boundary, &endpoint.proxy_id)?;
    tracing::info!(%peer, proxy_id = %endpoint.proxy_id, "Client connected");

    let mut pending = Vec::new();
    let mut buf = vec![0u8; DEFAULT_FORWARD_BUFFER];

    // Cut the first message
    loop {
        if let Some(len) = first_message_len(&pending) {
            if pending.len() >= len {
                let rest = pending.split_off(len);
                bridge.send(&pending).await?;
                if !rest.is_empty() {
                    bridge.send(&rest).await?;
                }
                break;
            }
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!(%peer, "Client closed before sending a complete message");
            bridge.on_close().await;
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);
    }

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%peer, "Client read failed: {}", e);
                break;
            }
        };
        if bridge.send(&buf[..n]).await.is_err() {
            break;
        }
    }

    bridge.on_close().await;
    Ok(())
}
