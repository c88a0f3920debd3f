//! Transport layer errors.

use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Dial to the destination failed
    #[error("Dial to {address} failed: {reason}")]
    DialFailed {
        /// Destination that was dialed
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// Operation did not finish within its budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Address is not a usable `host:port`
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Split `host:port` into its parts.
///
/// IPv6 literals may be bracketed (`[::1]:3389`); the brackets are stripped
/// from the returned host.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] when the port is missing,
/// not a number, or zero, or the host is empty.
pub fn split_host_port(address: &str) -> TransportResult<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(format!("{address}: missing port")))?;

    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidAddress(format!("{address}: invalid port")))?;
    if port == 0 {
        return Err(TransportError::InvalidAddress(format!("{address}: port 0")));
    }

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(format!("{address}: empty host")));
    }

    Ok((host, port))
}

/// Join `host` and `port` into an address `split_host_port` accepts.
///
/// IPv6 literals are bracketed.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
