//! # CleanPath Relay
//!
//! Relay engine for clients that cannot open raw TCP or TLS sockets.
//!
//! A client attaches a duplex channel (a [`Boundary`]) to a proxy endpoint
//! and sends one CleanPath request. The relay dials the destination,
//! optionally relays the first protocol frame, terminates TLS and replies
//! with the server's certificate chain. After that the session is a
//! transparent byte pipe.
//!
//! ## Components
//!
//! - [`SessionRegistry`]: live sessions and the endpoint destination table
//! - [`TransportBridge`]: per-session adapter with a four-state lifecycle
//! - [`Negotiator`]: first-message handling, dial, initial payload, TLS
//! - forwarder: two copy loops per established session
//! - [`CleanPathProxy`]: entry points (`create_proxy_endpoint`, `attach_transport`)
//! - [`TcpConnectionBridge`]: raw TCP connections without negotiation
//!
//! ## Trust
//!
//! The relay does not judge the destination's certificate. It completes the
//! handshake with any server that proves possession of its leaf key and
//! hands the chain to the client, which makes the trust decision.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boundary;
pub mod bridge;
pub mod config;
pub mod error;
mod forwarder;
pub mod negotiation;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod tcp_bridge;

pub use boundary::Boundary;
pub use bridge::{BridgeState, TransportBridge};
pub use config::{RelayConfig, TlsPolicy};
pub use error::{BoundaryError, RelayError, Result};
pub use negotiation::Negotiator;
pub use proxy::{CleanPathProxy, ProxyEndpoint};
pub use registry::SessionRegistry;
pub use session::{NegotiationState, Session, SessionInfo, SessionMode};
pub use tcp_bridge::{TcpConnection, TcpConnectionBridge};

use std::time::Duration;

/// Buffer size of each forwarding loop (32 KiB)
pub const DEFAULT_FORWARD_BUFFER: usize = 32 * 1024;

/// Budget for dial, initial payload exchange and TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest read of the remote's answer to the initial payload
pub const INITIAL_RESPONSE_LIMIT: usize = 1024;

/// Client chunks buffered toward the remote before `send` waits
pub const INBOUND_QUEUE_DEPTH: usize = 32;

/// Close code: session ended normally
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code: relay is disconnecting the session
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code: client violated the protocol
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close code: relay-side failure
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
