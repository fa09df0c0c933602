// ── Driver seam ──
//
// The backing store is an opaque collaborator reached only through these
// traits. A driver opens a `NativeDatabase`; a native database vends
// `NativeCollection` handles and reports its own reconnection activity.
// Every method returns a `'static` boxed future so handles can be moved
// into queued jobs and spawned drain tasks.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{CollectionOptions, ConnectOptions};
use crate::error::CoreError;

/// A document as exchanged with the backing store.
pub type Document = serde_json::Map<String, Value>;

/// Result alias for driver futures.
pub type DriverFuture<T> = BoxFuture<'static, Result<T, CoreError>>;

/// Opens connections to a backing store.
pub trait Driver: Send + Sync + 'static {
    /// Establish a connection. Retries, if any, are the driver's business.
    fn connect(&self, uri: &str, options: &ConnectOptions) -> DriverFuture<Arc<dyn NativeDatabase>>;
}

/// A live database handle produced by a [`Driver`].
pub trait NativeDatabase: Send + Sync + 'static {
    /// Logical database name (used to build namespaces).
    fn name(&self) -> &str;

    /// Obtain a handle for the named collection. Never blocks.
    fn collection(&self, name: &str, options: &CollectionOptions) -> Arc<dyn NativeCollection>;

    /// Connection activity reported by the driver after the initial connect.
    fn events(&self) -> broadcast::Receiver<DriverEvent>;
}

/// Verbs a bound collection forwards to the backing store.
pub trait NativeCollection: Send + Sync + 'static {
    /// Fully-qualified `database.collection` name.
    fn namespace(&self) -> String;

    fn find(&self, filter: Document, options: FindOptions) -> DriverFuture<Vec<Document>>;

    fn count_documents(&self, filter: Document, options: CountOptions) -> DriverFuture<u64>;

    fn distinct(&self, field: String, filter: Document) -> DriverFuture<Vec<Value>>;

    fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> DriverFuture<Vec<Document>>;

    fn insert_many(&self, documents: Vec<Document>) -> DriverFuture<InsertManyResult>;

    fn drop_collection(&self) -> DriverFuture<()>;

    fn delete_many(&self, filter: Document) -> DriverFuture<DeleteResult>;

    fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DriverFuture<UpdateResult>;

    fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DriverFuture<UpdateResult>;

    fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DriverFuture<Option<Document>>;

    /// Create an index, returning its name.
    fn create_index(&self, keys: Document, options: IndexOptions) -> DriverFuture<String>;

    fn indexes(&self) -> DriverFuture<Vec<Document>>;
}

// ── Driver events ────────────────────────────────────────────────────

/// Connection activity reported by a native database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The connection to the server was lost.
    Closed { reason: Option<String> },
    /// The driver re-established a lost connection.
    Reconnected,
}

// ── Operation options ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Sort specification, e.g. `{"createdOn": -1}`.
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOptions {
    pub allow_disk_use: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    #[serde(default)]
    pub upsert: bool,
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOneAndUpdateOptions {
    #[serde(default)]
    pub upsert: bool,
    #[serde(default)]
    pub return_document: ReturnDocument,
    pub sort: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    pub expire_after_secs: Option<u64>,
}

// ── Operation results ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted_count: u64,
}
