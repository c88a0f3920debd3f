//! Remote connection handle: plain or TLS-wrapped.

use crate::dialer::BoxedStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;

/// How the remote side of a session is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Raw TCP, bytes relayed untouched
    Plain,
    /// TLS terminated at the relay
    Tls,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Plain => write!(f, "plain"),
            ConnectionKind::Tls => write!(f, "tls"),
        }
    }
}

/// A dialed connection, either raw or wrapped in a TLS client session.
///
/// The two forms are mutually exclusive: a TLS connection owns the stream it
/// was upgraded from.
pub enum RemoteConnection {
    /// Raw dialed stream
    Plain(BoxedStream),
    /// TLS client session over the dialed stream
    Tls(Box<TlsStream<BoxedStream>>),
}

impl RemoteConnection {
    /// Which form this connection takes
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        match self {
            RemoteConnection::Plain(_) => ConnectionKind::Plain,
            RemoteConnection::Tls(_) => ConnectionKind::Tls,
        }
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemoteConnection").field(&self.kind()).finish()
    }
}

impl From<BoxedStream> for RemoteConnection {
    fn from(stream: BoxedStream) -> Self {
        RemoteConnection::Plain(stream)
    }
}

impl AsyncRead for RemoteConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteConnection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RemoteConnection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RemoteConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteConnection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RemoteConnection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteConnection::Plain(s) => Pin::new(s).poll_flush(cx),
            RemoteConnection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteConnection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RemoteConnection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
