//! # CleanPath Core
//!
//! Wire protocol for the CleanPath relay.
//!
//! A sandboxed client that cannot open raw TCP or TLS sockets sends one
//! CleanPath PDU to the relay. The relay dials the destination, performs the
//! TLS handshake on the client's behalf and answers with a PDU carrying the
//! server's certificate chain. After that the channel is a transparent pipe.
//!
//! This crate provides:
//! - DER encoding and decoding of [`CleanPathPdu`]
//! - Framing helpers for byte-stream adapters
//! - Protocol constants
//!
//! ## Example
//!
//! ```rust
//! use cleanpath_core::{CleanPathPdu, CLEANPATH_VERSION};
//!
//! let request = CleanPathPdu::request("desktop.internal:3389");
//! let bytes = request.encode();
//!
//! let decoded = CleanPathPdu::decode(&bytes).unwrap();
//! assert_eq!(decoded.version, CLEANPATH_VERSION);
//! assert_eq!(decoded.destination.as_deref(), Some("desktop.internal:3389"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod der;
pub mod error;
pub mod framing;
pub mod pdu;

pub use error::PduError;
pub use framing::{detect_pdu_length, is_raw_negotiation, tpkt_length};
pub use pdu::{CleanPathPdu, PduKind};

/// Protocol version understood by both ends
pub const CLEANPATH_VERSION: i64 = 3390;

/// First byte of a raw desktop protocol connection request (TPKT version 3)
pub const RAW_NEGOTIATION_MARKER: u8 = 0x03;

/// Largest PDU accepted (1 MiB)
pub const MAX_PDU_SIZE: usize = 1024 * 1024;
