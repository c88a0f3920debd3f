//! Per-session adapter between a client boundary and the relay.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──open()──▶ Open ──close()/on_close()──▶ Closing ──▶ Closed
//!      │                  │                                        ▲
//!      └──────────────────┴────────── boundary I/O error ──────────┘
//! ```
//!
//! Inbound data sent while `Connecting` is held by the bridge and handed to
//! the session driver, in arrival order, when the bridge opens. Once open,
//! inbound data goes through a bounded queue: `send` waits while the queue is
//! full, so a client can never run ahead of a slow remote. The boundary's
//! `close` is invoked at most once no matter how many paths request it.

use crate::boundary::Boundary;
use crate::error::{RelayError, Result};
use crate::session::Session;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};

/// Transport bridge lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Created, not yet attached to a session driver
    Connecting,
    /// Data flows in both directions
    Open,
    /// Shutdown requested
    Closing,
    /// Terminal
    Closed,
}

struct BridgeInner {
    state: BridgeState,
    pending: VecDeque<Vec<u8>>,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    close_sent: bool,
}

/// Duplex adapter owned by a [`Session`].
///
/// The boundary adapter drives inbound traffic through [`send`](Self::send)
/// and reports the peer going away through [`on_close`](Self::on_close).
pub struct TransportBridge {
    inner: Mutex<BridgeInner>,
    boundary: Arc<dyn Boundary>,
    session: Weak<Session>,
}

impl TransportBridge {
    pub(crate) fn new(
        boundary: Arc<dyn Boundary>,
        session: Weak<Session>,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Connecting,
                pending: VecDeque::new(),
                inbound: Some(inbound),
                close_sent: false,
            }),
            boundary,
            session,
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> BridgeState {
        self.inner.lock().await.state
    }

    /// Id of the owning session, if it is still alive
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session.upgrade().map(|s| s.id().to_string())
    }

    /// Hand inbound client data to the relay.
    ///
    /// While open this waits for room in the inbound queue; the wait ends
    /// early if the session is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotOpen`] once the bridge is closing or closed.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let tx = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BridgeState::Connecting => {
                    inner.pending.push_back(data.to_vec());
                    return Ok(());
                }
                BridgeState::Open => inner.inbound.clone().ok_or(RelayError::NotOpen)?,
                BridgeState::Closing | BridgeState::Closed => {
                    tracing::debug!("Dropping {} bytes sent on a closed bridge", data.len());
                    return Err(RelayError::NotOpen);
                }
            }
        };

        let queued = tx.send(data.to_vec());
        let result = match self.session.upgrade().map(|s| s.cancel_token()) {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RelayError::NotOpen),
                    result = queued => result,
                }
            }
            None => queued.await,
        };
        result.map_err(|_| RelayError::NotOpen)
    }

    /// Transition `Connecting → Open`.
    ///
    /// Returns the data sent while connecting, in arrival order. The caller
    /// must process it before anything read from the inbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyClosing`] if a close is already underway.
    pub async fn open(&self) -> Result<VecDeque<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BridgeState::Connecting => {
                if inner.inbound.is_none() {
                    return Err(RelayError::AlreadyClosing);
                }
                inner.state = BridgeState::Open;
                Ok(std::mem::take(&mut inner.pending))
            }
            BridgeState::Open => Ok(VecDeque::new()),
            BridgeState::Closing | BridgeState::Closed => Err(RelayError::AlreadyClosing),
        }
    }

    /// Deliver data from the remote to the client.
    ///
    /// Callers within one session deliver sequentially, so the boundary sees
    /// bytes in the order they were read. A boundary failure is unrecoverable:
    /// the bridge moves to `Closed` and the session is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotOpen`] if the bridge is not open, or
    /// [`RelayError::Boundary`] if the boundary rejected the data.
    pub async fn receive(&self, data: &[u8]) -> Result<()> {
        if self.inner.lock().await.state != BridgeState::Open {
            return Err(RelayError::NotOpen);
        }

        if let Err(e) = self.boundary.send(data).await {
            tracing::warn!("Boundary send failed: {}", e);
            {
                let mut inner = self.inner.lock().await;
                inner.state = BridgeState::Closed;
                inner.inbound = None;
                inner.pending.clear();
            }
            self.cancel_session();
            return Err(RelayError::Boundary(e));
        }
        Ok(())
    }

    /// Close the bridge and notify the boundary.
    ///
    /// Idempotent: only the first call reaches the boundary. Returns whether
    /// this call performed the close.
    pub async fn close(&self, code: u16, reason: &str) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.close_sent {
                return false;
            }
            inner.close_sent = true;
            if inner.state != BridgeState::Closed {
                inner.state = BridgeState::Closing;
            }
            inner.inbound = None;
            inner.pending.clear();
        }

        self.cancel_session();
        self.boundary.close(code, reason).await;

        self.inner.lock().await.state = BridgeState::Closed;
        tracing::debug!("Bridge closed ({} {})", code, reason);
        true
    }

    /// The client side went away.
    ///
    /// Stops accepting inbound data and cancels the session; the session's
    /// teardown then completes the close.
    pub async fn on_close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, BridgeState::Closing | BridgeState::Closed) {
                return;
            }
            inner.state = BridgeState::Closing;
            inner.inbound = None;
            inner.pending.clear();
        }
        tracing::debug!("Boundary reported close");
        self.cancel_session();
    }

    fn cancel_session(&self) {
        if let Some(session) = self.session.upgrade() {
            session.cancel();
        }
    }
}

impl std::fmt::Debug for TransportBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBridge").finish_non_exhaustive()
    }
}
