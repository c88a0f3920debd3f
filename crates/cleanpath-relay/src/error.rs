//! Error types for the relay engine
//!
//! Negotiation failures are reported to the client as error PDUs whenever the
//! boundary is still writable; [`RelayError::reply_text`] gives the text
//! carried in that PDU. Failures after negotiation are not translatable and
//! only terminate the session.
//!
//! # Example
//!
//! ```
//! use cleanpath_relay::RelayError;
//!
//! let err = RelayError::UnsupportedVersion { found: 3391 };
//! assert_eq!(err.reply_text(), Some("Unsupported version"));
//!
//! let err = RelayError::NotOpen;
//! assert_eq!(err.reply_text(), None);
//! ```

use cleanpath_core::PduError;
use cleanpath_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the relay engine
#[derive(Debug, Error)]
pub enum RelayError {
    // ============ Negotiation Errors ============
    /// First message is neither a CleanPath PDU nor a raw negotiation packet
    #[error("Malformed PDU: {0}")]
    MalformedPdu(#[from] PduError),

    /// PDU version differs from the supported one
    #[error("Unsupported version: {found}")]
    UnsupportedVersion {
        /// Version carried by the PDU
        found: i64,
    },

    /// Well-formed PDU that is not a request
    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    /// Destination could not be dialed
    #[error("Dial to {destination} failed: {source}")]
    DialFailure {
        /// Destination that was dialed
        destination: String,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// Initial payload could not be written to the remote
    #[error("Failed to forward initial payload: {0}")]
    InitialPayload(#[source] TransportError),

    /// Remote did not answer the initial payload
    #[error("Failed to read initial payload response: {0}")]
    InitialPayloadResponse(#[source] TransportError),

    /// TLS handshake with the remote failed
    #[error("TLS handshake failed: {0}")]
    HandshakeFailure(#[source] TransportError),

    // ============ Forwarding Errors ============
    /// Read or write failure after negotiation
    #[error("Relay I/O error: {0}")]
    RelayIo(#[from] std::io::Error),

    /// Client boundary rejected outbound data
    #[error("Boundary error: {0}")]
    Boundary(#[from] BoundaryError),

    // ============ Bridge Errors ============
    /// Send on a bridge that is closing or closed
    #[error("Transport bridge is not open")]
    NotOpen,

    /// Bridge is already shutting down
    #[error("Transport bridge is already closing")]
    AlreadyClosing,

    // ============ Session Errors ============
    /// A live session already uses this proxy id
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session was cancelled while the operation was in flight
    #[error("Session cancelled")]
    Cancelled,

    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl RelayError {
    /// Text for the error PDU sent to the client.
    ///
    /// `None` when the failure cannot be reported over the channel.
    #[must_use]
    pub fn reply_text(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedVersion { .. } => Some("Unsupported version"),
            Self::InvalidRequest(_) => Some("Invalid request"),
            Self::DialFailure { .. } => Some("Connection failed"),
            Self::InitialPayload(_) => Some("Failed to forward initial payload"),
            Self::InitialPayloadResponse(_) => Some("Failed to read initial payload response"),
            Self::HandshakeFailure(_) => Some("TLS handshake failed"),
            Self::MalformedPdu(_)
            | Self::RelayIo(_)
            | Self::Boundary(_)
            | Self::NotOpen
            | Self::AlreadyClosing
            | Self::SessionExists(_)
            | Self::SessionNotFound(_)
            | Self::Cancelled
            | Self::InvalidConfig(_) => None,
        }
    }

    /// Whether the failure happened during negotiation
    #[must_use]
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Self::MalformedPdu(_)) || self.reply_text().is_some()
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by a transport boundary
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// The boundary is closed and cannot accept data
    #[error("Boundary closed")]
    Closed,

    /// The boundary's own I/O failed
    #[error("Boundary I/O error: {0}")]
    Io(#[from] std::io::Error),
}
