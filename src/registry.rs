//! Session registry: the single authority on who is connected.
//!
//! All mutation happens under one short-lived lock that is never held
//! across network I/O. Broadcasts iterate a snapshot instead of the map.

use crate::connection::{Connection, ConnectionId};
use crate::protocol::{FileOffer, UNKNOWN_NICKNAME};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Entry {
    connection: Arc<Connection>,
    nickname: Option<String>,
    /// Last `FILE_INCOMING` offered to this peer and not yet answered
    offer: Option<FileOffer>,
}

#[derive(Default)]
pub struct SessionRegistry {
    // Keyed by id, so iteration order is registration order
    entries: Mutex<BTreeMap<ConnectionId, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection with no nickname. It becomes visible to broadcasts
    /// as soon as this returns.
    pub fn register(&self, connection: Arc<Connection>) {
        let id = connection.id();
        self.lock().insert(
            id,
            Entry {
                connection,
                nickname: None,
                offer: None,
            },
        );
    }

    /// Set or overwrite the nickname. Returns false if the connection is not
    /// registered (it may already have been removed).
    pub fn set_nickname(&self, id: ConnectionId, name: impl Into<String>) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.nickname = Some(name.into());
                true
            }
            None => false,
        }
    }

    /// Nickname for display, `unknown` until one has been announced.
    pub fn nickname(&self, id: ConnectionId) -> String {
        self.lock()
            .get(&id)
            .and_then(|entry| entry.nickname.clone())
            .unwrap_or_else(|| UNKNOWN_NICKNAME.to_string())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time list of registered connections in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock()
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    /// Remember the file last offered to a peer, replacing any older offer.
    pub fn set_offer(&self, id: ConnectionId, offer: FileOffer) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.offer = Some(offer);
                true
            }
            None => false,
        }
    }

    pub fn take_offer(&self, id: ConnectionId) -> Option<FileOffer> {
        self.lock().get_mut(&id).and_then(|entry| entry.offer.take())
    }

    /// Remove the entry and close its transport.
    ///
    /// Returns the display nickname if this call did the removal, `None` if
    /// the connection was already gone. Only the first caller gets `Some`,
    /// which is what keeps "left" announcements from being duplicated.
    pub async fn remove(&self, id: ConnectionId) -> Option<String> {
        // Lock is released before the socket teardown awaits
        let entry = self.lock().remove(&id)?;

        entry.connection.close().await;
        tracing::debug!(
            "Removed {} ({}) from registry",
            id,
            entry.connection.remote_addr()
        );

        Some(
            entry
                .nickname
                .unwrap_or_else(|| UNKNOWN_NICKNAME.to_string()),
        )
    }
}
