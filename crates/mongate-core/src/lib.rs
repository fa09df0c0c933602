//! Readiness-gated access to a document store whose connection is still
//! being established.
//!
//! Callers can issue operations the moment they ask for a collection; the
//! crate guarantees those operations run, in submission order, once the
//! driver hands back a native handle.
//!
//! - **[`Client`]**: factory keyed by connection string.
//!   [`connect()`](Client::connect) returns the one [`Database`] for a URI
//!   and acquires its native handle in the background.
//!
//! - **[`Database`]**: owns the connection lifecycle. Broadcasts
//!   [`ConnectionEvent`]s, exposes a `watch` of [`ConnectionState`], and
//!   vends one [`Collection`] per name via [`get()`](Database::get).
//!
//! - **[`Collection`]**: readiness-gated proxy. Operations on an unbound
//!   collection are queued FIFO and drained by a single task once the
//!   handle appears; each returns a [`Deferred`] future.
//!
//! - **[`Registry`]**: explicit reactive store (`ArcSwap` state, pure
//!   reducers, identity-deduplicated subscribers) holding every connection,
//!   native handle, and collection. Inject one per process or per test.
//!
//! - **[`QueryService`]**: paging, strict `find_one`, polling waits, and a
//!   shared [`MethodTable`] of custom operations.
//!
//! - **Driver seam** ([`driver`]): the traits a backing store implements.
//!   [`memory::MemoryDriver`] is a complete in-process implementation.

pub mod client;
pub mod collection;
pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod id;
pub mod memory;
pub mod service;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::Client;
pub use collection::{Collection, Deferred, DropOutcome};
pub use config::{CollectionOptions, ConnectOptions};
pub use database::{ConnectionEvent, ConnectionState, Database};
pub use driver::{
    AggregateOptions, CountOptions, DeleteResult, Document, Driver, DriverEvent, DriverFuture,
    FindOneAndUpdateOptions, FindOptions, IndexOptions, InsertManyResult, NativeCollection,
    NativeDatabase, ReturnDocument, UpdateOptions, UpdateResult,
};
pub use error::CoreError;
pub use service::{
    ExpectOptions, FindResult, MethodTable, PageInfo, PageRequest, QueryService, ServiceMethod,
};
pub use store::{Action, GlobalState, Registry};
