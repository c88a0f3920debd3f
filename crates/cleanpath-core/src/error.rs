//! Error types for the CleanPath wire protocol.

use thiserror::Error;

/// PDU decoding errors.
///
/// Every variant describes a malformed PDU: the buffer is not a well-formed
/// CleanPath message and no protocol-level reply can be addressed to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PduError {
    /// Buffer ended before a complete tag/length header
    #[error("truncated header: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required to continue parsing
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared length runs past the end of the buffer
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverflow {
        /// Length announced by the header
        declared: usize,
        /// Bytes actually remaining
        remaining: usize,
    },

    /// Length encoding is not valid DER (indefinite, non-minimal, or too wide)
    #[error("invalid length encoding")]
    InvalidLength,

    /// A different tag was found than the one the grammar requires
    #[error("unexpected tag: expected 0x{expected:02X}, found 0x{found:02X}")]
    UnexpectedTag {
        /// Tag required at this position
        expected: u8,
        /// Tag present in the buffer
        found: u8,
    },

    /// Context tag unknown, repeated, or out of order
    #[error("unexpected field tag [{0}]")]
    UnexpectedField(u8),

    /// The mandatory version field is absent
    #[error("missing version field")]
    MissingVersion,

    /// INTEGER is empty, non-minimal, or wider than 64 bits
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// UTF8String content is not valid UTF-8
    #[error("invalid UTF-8 in field [{0}]")]
    InvalidUtf8(u8),

    /// Bytes remain after a complete element
    #[error("{0} trailing bytes after element")]
    TrailingData(usize),

    /// Declared PDU size exceeds the protocol limit
    #[error("PDU of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Declared size
        size: usize,
        /// Maximum accepted size
        limit: usize,
    },
}

/// Result type for PDU operations
pub type Result<T> = std::result::Result<T, PduError>;
