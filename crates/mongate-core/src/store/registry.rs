// ── Connection registry ──
//
// Global state, actions, and reducers for connections keyed by their
// connection string. Each reducer returns its input `Arc` untouched when
// an action does not concern it, so untouched slots stay pointer-equal
// across dispatches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::selectors;
use super::state_store::{Store, Subscriber};
use crate::collection::Collection;
use crate::database::Database;
use crate::driver::NativeDatabase;

// ── State ────────────────────────────────────────────────────────────

/// Root state: one field per domain.
#[derive(Clone, Default)]
pub struct GlobalState {
    pub connections: Arc<ConnectionsState>,
}

/// Connection key → slot.
pub type ConnectionsState = HashMap<String, Arc<ConnectionSlot>>;

/// Everything registered for one connection key.
///
/// Fields are only ever set, never cleared.
#[derive(Clone, Default)]
pub struct ConnectionSlot {
    pub connection: Option<Database>,
    pub native: Option<Arc<dyn NativeDatabase>>,
    pub collections: Arc<HashMap<String, Collection>>,
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("has_connection", &self.connection.is_some())
            .field("has_native", &self.native.is_some())
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Actions ──────────────────────────────────────────────────────────

/// Every mutation the registry accepts.
#[derive(Clone)]
pub enum Action {
    RegisterConnection {
        key: String,
        connection: Database,
    },
    RegisterNativeHandle {
        key: String,
        handle: Arc<dyn NativeDatabase>,
    },
    RegisterCollection {
        key: String,
        name: String,
        collection: Collection,
    },
}

impl Action {
    pub fn key(&self) -> &str {
        match self {
            Self::RegisterConnection { key, .. }
            | Self::RegisterNativeHandle { key, .. }
            | Self::RegisterCollection { key, .. } => key,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RegisterConnection { .. } => "register_connection",
            Self::RegisterNativeHandle { .. } => "register_native_handle",
            Self::RegisterCollection { .. } => "register_collection",
        }
    }
}

// ── Reducers ─────────────────────────────────────────────────────────

/// Root reducer: composes every domain reducer.
pub fn reduce(state: &Arc<GlobalState>, action: &Action) -> Arc<GlobalState> {
    let connections = reduce_connections(&state.connections, action);
    if Arc::ptr_eq(&connections, &state.connections) {
        return Arc::clone(state);
    }
    Arc::new(GlobalState { connections })
}

/// Rebuild only the slot targeted by `action`.
pub fn reduce_connections(state: &Arc<ConnectionsState>, action: &Action) -> Arc<ConnectionsState> {
    let key = action.key();
    let slot = reduce_slot(state.get(key), action);
    let mut next = ConnectionsState::clone(state);
    next.insert(key.to_owned(), slot);
    Arc::new(next)
}

/// Slot reducer: sets exactly one field of the slot.
pub fn reduce_slot(slot: Option<&Arc<ConnectionSlot>>, action: &Action) -> Arc<ConnectionSlot> {
    let mut next = slot.map(|s| ConnectionSlot::clone(s)).unwrap_or_default();
    match action {
        Action::RegisterConnection { connection, .. } => {
            next.connection = Some(connection.clone());
        }
        Action::RegisterNativeHandle { handle, .. } => {
            next.native = Some(Arc::clone(handle));
        }
        Action::RegisterCollection {
            name, collection, ..
        } => {
            let mut collections = HashMap::clone(&next.collections);
            collections.insert(name.clone(), collection.clone());
            next.collections = Arc::new(collections);
        }
    }
    Arc::new(next)
}

// ── Registry ─────────────────────────────────────────────────────────

/// Explicitly constructed registry shared by a client, its databases,
/// and their collections.
///
/// Cheaply cloneable: every clone observes the same store. Create one
/// per process, or one per test for isolation.
#[derive(Clone)]
pub struct Registry {
    store: Arc<Store<GlobalState, Action>>,
    /// Serializes connection creation across every client on this registry.
    creation: Arc<Mutex<()>>,
}

/// Subscriber type for registry notifications.
pub type RegistrySubscriber = Subscriber<GlobalState>;

impl Registry {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::new(GlobalState::default(), Box::new(reduce))),
            creation: Arc::new(Mutex::new(())),
        }
    }

    /// Read-only snapshot of the whole registry.
    pub fn state(&self) -> Arc<GlobalState> {
        self.store.state()
    }

    /// Apply `action` and notify subscribers.
    ///
    /// Must be called from within a tokio runtime: registering a native
    /// handle binds waiting collections, which spawn tasks to drain their
    /// queues.
    pub fn dispatch(&self, action: &Action) {
        debug!(key = action.key(), action = action.kind(), "registry dispatch");
        self.store.dispatch(action);
    }

    pub fn subscribe(&self, handler: &RegistrySubscriber) -> bool {
        self.store.subscribe(handler)
    }

    pub fn unsubscribe(&self, handler: &RegistrySubscriber) -> bool {
        self.store.unsubscribe(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.store.subscriber_count()
    }

    /// Held while a connection is looked up and, if missing, registered.
    pub(crate) fn lock_creation(&self) -> MutexGuard<'_, ()> {
        self.creation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Selector shortcuts over the current state ────────────────────

    pub fn connection(&self, key: &str) -> Option<Database> {
        selectors::connection_for(&self.state(), key)
    }

    pub fn native_handle(&self, key: &str) -> Option<Arc<dyn NativeDatabase>> {
        selectors::native_handle_for(&self.state(), key)
    }

    pub fn collection(&self, key: &str, name: &str) -> Option<Collection> {
        selectors::collection_for(&self.state(), key, name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.state().connections.len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    fn native(name: &str) -> Arc<dyn NativeDatabase> {
        Arc::new(MemoryDatabase::new(name))
    }

    #[test]
    fn native_handle_registration_creates_slot() {
        let registry = Registry::new();
        assert!(registry.native_handle("mongodb://a/app").is_none());

        registry.dispatch(&Action::RegisterNativeHandle {
            key: "mongodb://a/app".into(),
            handle: native("app"),
        });

        let handle = registry.native_handle("mongodb://a/app").unwrap();
        assert_eq!(handle.name(), "app");
        assert!(registry.connection("mongodb://a/app").is_none());
    }

    #[test]
    fn untouched_slots_keep_identity() {
        let registry = Registry::new();
        registry.dispatch(&Action::RegisterNativeHandle {
            key: "a".into(),
            handle: native("a"),
        });
        let slot_a = Arc::clone(registry.state().connections.get("a").unwrap());

        registry.dispatch(&Action::RegisterNativeHandle {
            key: "b".into(),
            handle: native("b"),
        });

        let state = registry.state();
        assert!(Arc::ptr_eq(state.connections.get("a").unwrap(), &slot_a));
        assert_eq!(state.connections.len(), 2);
    }

    #[test]
    fn slot_fields_are_set_additively() {
        let first = reduce_slot(
            None,
            &Action::RegisterNativeHandle {
                key: "a".into(),
                handle: native("a"),
            },
        );
        assert!(first.native.is_some());
        assert!(first.collections.is_empty());

        let second = reduce_slot(
            Some(&first),
            &Action::RegisterNativeHandle {
                key: "a".into(),
                handle: native("other"),
            },
        );
        assert_eq!(second.native.as_ref().unwrap().name(), "other");
        assert!(Arc::ptr_eq(&first.collections, &second.collections));
    }

    #[test]
    fn every_dispatch_notifies_with_old_and_new() {
        let registry = Registry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let handler: RegistrySubscriber =
            Arc::new(move |new: &Arc<GlobalState>, old: &Arc<GlobalState>| {
                seen_in
                    .lock()
                    .unwrap()
                    .push((old.connections.len(), new.connections.len()));
            });
        registry.subscribe(&handler);

        registry.dispatch(&Action::RegisterNativeHandle {
            key: "a".into(),
            handle: native("a"),
        });

        assert_eq!(*seen.lock().unwrap(), vec![(0, 1)]);
    }
}
