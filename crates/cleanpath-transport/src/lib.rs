//! # CleanPath Transport
//!
//! Remote-side connectivity for the CleanPath relay.
//!
//! - [`Dialer`]: injected capability for opening TCP connections
//! - [`TcpDialer`]: host network stack implementation with keepalive tuning
//! - [`TlsUpgrader`]: client TLS handshake returning the server certificate chain
//! - [`RemoteConnection`]: a dialed stream, plain or TLS-wrapped

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dialer;
pub mod error;
pub mod remote;
pub mod tls;

pub use dialer::{BoxedStream, Dialer, RemoteStream, TcpDialer};
pub use error::{TransportError, TransportResult, join_host_port, split_host_port};
pub use remote::{ConnectionKind, RemoteConnection};
pub use tls::{DeferredTrustVerifier, TlsUpgrader};
