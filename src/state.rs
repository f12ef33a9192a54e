//! Shared application state and the presence registry.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the conversation store, the token verifier, and the presence
//! registry. The registry is the only shared mutable structure: it tracks
//! every open connection plus the `user_id -> connection` binding, and owns
//! unicast/broadcast delivery. Each registry operation is one atomic step
//! under a std mutex; delivery is non-blocking `try_send`, so a full
//! outbound buffer drops the event for that connection only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::envelope::ServerEvent;
use crate::services::conversation::ConversationStore;
use crate::services::token::TokenVerifier;

// =============================================================================
// CONNECTION HANDLE
// =============================================================================

/// Address of one open connection: the outbound channel into its socket task
/// plus a close signal. Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { conn_id, tx, close: Arc::new(Notify::new()) }
    }

    #[must_use]
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue an event for delivery. Best-effort: returns false if the
    /// connection is gone or its buffer is full.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    /// Whether the owning socket task is still receiving.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Ask the owning socket task to shut down. Used on eviction.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once `close` has been called. A pending close is
    /// remembered, so signal and wait cannot race.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

// =============================================================================
// PRESENCE REGISTRY
// =============================================================================

/// Process-wide record of open connections and online users.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

struct RegistryInner {
    /// Every open connection, authenticated or not. Broadcast targets.
    connections: HashMap<Uuid, ConnectionHandle>,
    /// Authenticated users. At most one connection per user; the handle's
    /// `conn_id` says which connection owns the binding.
    users: HashMap<Uuid, ConnectionHandle>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                connections: HashMap::new(),
                users: HashMap::new(),
            })),
        }
    }

    /// Track a newly accepted connection.
    pub fn register(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.connections.insert(handle.conn_id(), handle);
    }

    /// Bind a user to a connection after successful authentication.
    ///
    /// Returns the handle displaced by this binding, if the user was already
    /// bound to a different connection. The caller decides what to do with
    /// it (the session loop closes it).
    pub fn bind_user(&self, user_id: Uuid, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.users.insert(user_id, handle.clone());
        previous.filter(|prev| prev.conn_id() != handle.conn_id())
    }

    /// Drop a closing connection and, if it still owns its user binding,
    /// release that too. Returns the user that actually went offline, or
    /// `None` when the binding had already moved to a newer connection.
    pub fn remove(&self, conn_id: Uuid, user_id: Option<Uuid>) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.connections.remove(&conn_id);

        let user_id = user_id?;
        let owns_binding = inner
            .users
            .get(&user_id)
            .is_some_and(|bound| bound.conn_id() == conn_id);
        if owns_binding {
            inner.users.remove(&user_id);
            return Some(user_id);
        }
        None
    }

    /// User identifiers currently bound to a connection.
    #[must_use]
    pub fn online_user_ids(&self) -> Vec<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.users.keys().copied().collect()
    }

    #[must_use]
    pub fn is_online(&self, user_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.users.contains_key(&user_id)
    }

    /// Deliver an event to one user's connection, if online and open.
    /// Returns whether the event was queued.
    pub fn unicast(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.users.get(&user_id) {
            Some(handle) if handle.is_open() => handle.send(event),
            _ => false,
        }
    }

    /// Deliver an event to every open connection, including unauthenticated
    /// ones.
    pub fn broadcast(&self, event: &ServerEvent) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in inner.connections.values() {
            if !handle.is_open() {
                continue;
            }
            // Best-effort: if a connection's buffer is full, skip it.
            let _ = handle.send(event.clone());
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.connections.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub verifier: TokenVerifier,
    pub presence: PresenceRegistry,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, verifier: TokenVerifier) -> Self {
        Self { store, verifier, presence: PresenceRegistry::new() }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::services::conversation::UserProfile;
    use crate::services::memory::MemoryStore;

    /// Signing secret shared by test states and minted test tokens.
    pub const TEST_SECRET: &str = "test-secret";

    /// Create a test `AppState` backed by an in-memory store.
    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), TokenVerifier::new(TEST_SECRET))
    }

    /// Create a test `AppState` with pre-seeded user profiles.
    #[must_use]
    pub fn test_app_state_with_users(users: Vec<UserProfile>) -> AppState {
        let store = MemoryStore::new();
        for user in users {
            store.seed_user(user);
        }
        AppState::new(Arc::new(store), TokenVerifier::new(TEST_SECRET))
    }

    /// Create a test `AppState` around an arbitrary store implementation.
    #[must_use]
    pub fn test_app_state_with_store(store: Arc<dyn ConversationStore>) -> AppState {
        AppState::new(store, TokenVerifier::new(TEST_SECRET))
    }

    /// Register a fake connection and return its handle plus the receiver
    /// its socket task would drain.
    #[must_use]
    pub fn connect_client(state: &AppState) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = ConnectionHandle::new(Uuid::new_v4(), tx);
        state.presence.register(handle.clone());
        (handle, rx)
    }

    /// Build a profile row for seeding.
    #[must_use]
    pub fn dummy_profile(id: Uuid, email: &str) -> UserProfile {
        UserProfile {
            id,
            email: email.to_string(),
            full_name: Some("Test User".into()),
            profile_image: None,
            role: "USER".into(),
            is_complete_profile: true,
        }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
