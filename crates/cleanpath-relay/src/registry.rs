//! Session registry and destination table.
//!
//! Two independent concurrent maps:
//!
//! ```text
//! destinations: proxy id ──▶ "host:port"     (filled by endpoint creation)
//! sessions:     proxy id ──▶ Arc<Session>    (filled by transport attach)
//! ```
//!
//! Endpoint creation and boundary attachment happen at different times, so
//! the destination table outlives the moment of creation and is consulted
//! when the session negotiates. A session's teardown removes both entries.
//! Entries for endpoints that never attach stay until
//! [`SessionRegistry::remove_destination`] is called.
//!
//! Both maps are `DashMap`s; no lock is held across an await point, so
//! registry operations never wait on negotiation or forwarding.

use crate::boundary::Boundary;
use crate::error::{RelayError, Result};
use crate::session::Session;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map of live sessions and pending destinations
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    destinations: DashMap<String, String>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh proxy id (`proxy_<n>`, starting at 1)
    pub fn next_proxy_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("proxy_{n}")
    }

    /// Create and register a session for `proxy_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionExists`] if a live session already uses
    /// `proxy_id`.
    pub fn register(
        self: &Arc<Self>,
        proxy_id: &str,
        destination: &str,
        boundary: Arc<dyn Boundary>,
    ) -> Result<Arc<Session>> {
        match self.sessions.entry(proxy_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::SessionExists(proxy_id.to_string())),
            Entry::Vacant(slot) => {
                let session = Session::new(
                    proxy_id.to_string(),
                    destination.to_string(),
                    boundary,
                    Arc::downgrade(self),
                );
                slot.insert(session.clone());
                tracing::debug!(proxy_id, destination, "Session registered");
                Ok(session)
            }
        }
    }

    /// Look up a live session
    #[must_use]
    pub fn lookup(&self, proxy_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(proxy_id).map(|s| s.value().clone())
    }

    /// Remove a session and its destination entry
    pub fn remove(&self, proxy_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(proxy_id).map(|(_, s)| s);
        self.destinations.remove(proxy_id);
        removed
    }

    /// Remove `session` if it is still the registered one for its id
    pub(crate) fn remove_session(&self, session: &Session) {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, live| std::ptr::eq(live.as_ref(), session));
        if removed.is_some() {
            self.destinations.remove(session.id());
        }
    }

    /// Map `proxy_id` to `destination`, replacing any previous mapping.
    ///
    /// A live session keeps the destination it already resolved.
    pub fn set_destination(&self, proxy_id: &str, destination: &str) {
        if let Some(old) = self
            .destinations
            .insert(proxy_id.to_string(), destination.to_string())
        {
            if old != destination {
                tracing::debug!(proxy_id, %old, destination, "Destination replaced");
            }
        }
    }

    /// Destination registered for `proxy_id`
    #[must_use]
    pub fn destination(&self, proxy_id: &str) -> Option<String> {
        self.destinations.get(proxy_id).map(|d| d.value().clone())
    }

    /// Drop a destination entry
    pub fn remove_destination(&self, proxy_id: &str) -> Option<String> {
        self.destinations.remove(proxy_id).map(|(_, d)| d)
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of destination entries
    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Clones of every live session
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}
