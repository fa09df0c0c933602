// ── Reactive registry store ──
//
// Generic reducer-driven store plus the connection registry built on it.

pub mod registry;
pub mod selectors;
mod state_store;

pub use registry::{Action, ConnectionSlot, ConnectionsState, GlobalState, Registry, RegistrySubscriber};
pub use state_store::{Reducer, Store, Subscriber};
