//! Post-negotiation byte pump.
//!
//! Two tasks per session: client → remote drains the bridge's inbound queue,
//! remote → client reads fixed-size chunks and delivers them through the
//! bridge. Whichever loop stops first cancels the session; the other
//! observes the cancellation and stops too. Once both loops have handed back
//! their halves the remote is closed, and only then is the session torn
//! down, so the boundary hears about the close after the remote is gone.

use crate::session::Session;
use crate::{CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use cleanpath_transport::RemoteConnection;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Longest wait for the remote to accept our shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why a forwarding loop stopped; `None` when it was cancelled
type StopReason = Option<(u16, &'static str)>;

/// Forward until either side stops, then close the remote.
///
/// `backlog` holds client data that arrived before the inbound queue opened
/// and is written to the remote first.
pub(crate) async fn run(
    session: Arc<Session>,
    backlog: VecDeque<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    buffer_size: usize,
) {
    let Some(remote) = session.take_remote().await else {
        session.teardown(CLOSE_NORMAL, "No remote connection").await;
        return;
    };

    let (reader, writer) = tokio::io::split(remote);
    let token = session.cancel_token();

    let upstream = tokio::spawn(client_to_remote(
        session.clone(),
        backlog,
        inbound,
        writer,
        token.clone(),
    ));
    let downstream = tokio::spawn(remote_to_client(
        session.clone(),
        reader,
        buffer_size,
        token,
    ));

    let (code, reason) = match tokio::join!(upstream, downstream) {
        (Ok((writer, up)), Ok((reader, down))) => {
            let mut remote = reader.unsplit(writer);
            match tokio::time::timeout(SHUTDOWN_GRACE, remote.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(proxy_id = session.id(), "Remote shutdown failed: {}", e);
                }
                Err(_) => {
                    tracing::debug!(proxy_id = session.id(), "Remote shutdown timed out");
                }
            }
            up.or(down).unwrap_or((CLOSE_NORMAL, "Session cancelled"))
        }
        (up, down) => {
            tracing::error!(
                proxy_id = session.id(),
                "Forwarding task failed: {:?} {:?}",
                up.err(),
                down.err()
            );
            (CLOSE_INTERNAL_ERROR, "Forwarding task failed")
        }
    };

    session.remote_released();
    session.teardown(code, reason).await;
}

async fn client_to_remote(
    session: Arc<Session>,
    mut backlog: VecDeque<Vec<u8>>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut writer: WriteHalf<RemoteConnection>,
    token: CancellationToken,
) -> (WriteHalf<RemoteConnection>, StopReason) {
    let stop = loop {
        let chunk = match backlog.pop_front() {
            Some(chunk) => Some(chunk),
            None => tokio::select! {
                _ = token.cancelled() => break None,
                chunk = inbound.recv() => chunk,
            },
        };
        let Some(chunk) = chunk else {
            break Some((CLOSE_NORMAL, "Client closed"));
        };

        let write = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        };
        tokio::select! {
            _ = token.cancelled() => break None,
            result = write => {
                if let Err(e) = result {
                    tracing::warn!(proxy_id = session.id(), "Remote write failed: {}", e);
                    break Some((CLOSE_INTERNAL_ERROR, "Remote write failed"));
                }
            }
        }

        session.record_to_remote(chunk.len());
        tracing::trace!(proxy_id = session.id(), bytes = chunk.len(), "client -> remote");
    };

    token.cancel();
    (writer, stop)
}

async fn remote_to_client(
    session: Arc<Session>,
    mut reader: ReadHalf<RemoteConnection>,
    buffer_size: usize,
    token: CancellationToken,
) -> (ReadHalf<RemoteConnection>, StopReason) {
    let mut buf = vec![0u8; buffer_size];
    let stop = loop {
        let n = tokio::select! {
            _ = token.cancelled() => break None,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break Some((CLOSE_NORMAL, "Remote closed")),
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(proxy_id = session.id(), "Remote read failed: {}", e);
                    break Some((CLOSE_INTERNAL_ERROR, "Remote read failed"));
                }
            },
        };

        let delivered = tokio::select! {
            _ = token.cancelled() => break None,
            result = session.bridge().receive(&buf[..n]) => result,
        };
        if let Err(e) = delivered {
            tracing::debug!(proxy_id = session.id(), "Client delivery failed: {}", e);
            break Some((CLOSE_INTERNAL_ERROR, "Client delivery failed"));
        }

        session.record_to_client(n);
        tracing::trace!(proxy_id = session.id(), bytes = n, "remote -> client");
    };

    token.cancel();
    (reader, stop)
}
