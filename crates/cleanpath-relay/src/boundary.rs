//! The external transport boundary.
//!
//! A boundary is whatever duplex byte channel the client reached the relay
//! over: a WebSocket, an emulated socket, an in-process queue. The relay only
//! needs two operations from it. The other half of the contract (inbound
//! data and the peer's close) is driven by the adapter calling
//! [`TransportBridge::send`](crate::TransportBridge::send) and
//! [`TransportBridge::on_close`](crate::TransportBridge::on_close).

use crate::error::BoundaryError;
use async_trait::async_trait;

/// Outbound half of a client channel
#[async_trait]
pub trait Boundary: Send + Sync {
    /// Deliver one message to the client.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError`] if the channel can no longer carry data.
    async fn send(&self, data: &[u8]) -> Result<(), BoundaryError>;

    /// Close the channel. The relay calls this at most once per bridge.
    async fn close(&self, code: u16, reason: &str);
}
