// ── Read-only selectors over the registry state ──
//
// Pure lookups. An absent key yields `None`, never a panic.

use std::sync::Arc;

use super::registry::{ConnectionSlot, GlobalState};
use crate::collection::Collection;
use crate::database::Database;
use crate::driver::NativeDatabase;

fn slot_for<'a>(state: &'a GlobalState, key: &str) -> Option<&'a Arc<ConnectionSlot>> {
    state.connections.get(key)
}

/// The `Database` registered under `key`.
pub fn connection_for(state: &GlobalState, key: &str) -> Option<Database> {
    slot_for(state, key)?.connection.clone()
}

/// The native handle for `key`, once the driver has produced one.
pub fn native_handle_for(state: &GlobalState, key: &str) -> Option<Arc<dyn NativeDatabase>> {
    slot_for(state, key)?.native.clone()
}

/// The `Collection` registered for `(key, name)`.
pub fn collection_for(state: &GlobalState, key: &str, name: &str) -> Option<Collection> {
    slot_for(state, key)?.collections.get(name).cloned()
}
