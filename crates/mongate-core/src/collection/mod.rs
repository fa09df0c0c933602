// ── Readiness-gated collection proxy ──
//
// A `Collection` accepts operations before its connection exists. Until
// the registry holds a native handle for the connection key, every call
// is parked in a FIFO queue; once the handle shows up the queue is drained
// in submission order by a single task, and later calls go straight to
// the driver.
//
//   Unbound(queue) ──handle──▶ Draining(handle, queue) ──empty──▶ Bound(handle)
//          └──────────handle, queue empty─────────────────────────────▲

mod deferred;
mod update;

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

pub use deferred::Deferred;
pub use update::normalize_legacy_update;

use crate::config::CollectionOptions;
use crate::driver::{
    AggregateOptions, CountOptions, DeleteResult, Document, DriverFuture, FindOneAndUpdateOptions,
    FindOptions, IndexOptions, InsertManyResult, NativeCollection, NativeDatabase, UpdateOptions,
    UpdateResult,
};
use crate::error::NS_NOT_FOUND;
use crate::store::{GlobalState, Registry, RegistrySubscriber, selectors};

// ── Drop outcome ─────────────────────────────────────────────────────

/// Successful outcomes of [`Collection::drop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    /// The collection did not exist. Displays as `"ns not found"`.
    NamespaceNotFound,
}

impl DropOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::NamespaceNotFound => NS_NOT_FOUND,
        }
    }
}

impl std::fmt::Display for DropOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Gate ─────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(Arc<dyn NativeCollection>) -> BoxFuture<'static, ()> + Send>;

struct QueuedOperation {
    operation: &'static str,
    job: Job,
}

enum Gate {
    Unbound {
        queue: VecDeque<QueuedOperation>,
    },
    Draining {
        handle: Arc<dyn NativeCollection>,
        queue: VecDeque<QueuedOperation>,
    },
    Bound {
        handle: Arc<dyn NativeCollection>,
    },
}

impl Gate {
    fn name(&self) -> &'static str {
        match self {
            Self::Unbound { .. } => "unbound",
            Self::Draining { .. } => "draining",
            Self::Bound { .. } => "bound",
        }
    }
}

// ── Collection ───────────────────────────────────────────────────────

/// Handle to a named collection on one connection.
///
/// Cheaply cloneable; clones share the same gate and queue. Obtain one
/// through [`Database::get`](crate::Database::get), which guarantees a
/// single instance per `(connection key, name)`.
///
/// Every operation starts when it is called, or when the queue reaches it,
/// on a tokio task; operations must therefore be submitted from within a
/// tokio runtime.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    connection_key: String,
    name: String,
    options: CollectionOptions,
    registry: Registry,
    gate: Mutex<Gate>,
    /// Present while waiting for a native handle.
    subscriber: Mutex<Option<RegistrySubscriber>>,
}

impl Collection {
    /// Build a collection and bind it right away if the connection already
    /// has a native handle. Otherwise subscribe to the registry and bind on
    /// the first notification that carries one.
    pub(crate) fn new(
        registry: Registry,
        connection_key: &str,
        name: &str,
        options: CollectionOptions,
    ) -> Self {
        let collection = Self {
            inner: Arc::new(CollectionInner {
                connection_key: connection_key.to_owned(),
                name: name.to_owned(),
                options,
                registry,
                gate: Mutex::new(Gate::Unbound {
                    queue: VecDeque::new(),
                }),
                subscriber: Mutex::new(None),
            }),
        };

        let inner = &collection.inner;
        if let Some(native) = inner.registry.native_handle(&inner.connection_key) {
            inner.bind(&native);
            return collection;
        }

        let weak = Arc::downgrade(inner);
        let handler: RegistrySubscriber =
            Arc::new(move |state: &Arc<GlobalState>, _old: &Arc<GlobalState>| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Some(native) = selectors::native_handle_for(state, &inner.connection_key) {
                    inner.bind(&native);
                }
            });
        *lock(&inner.subscriber) = Some(Arc::clone(&handler));
        inner.registry.subscribe(&handler);

        // The handle may have been registered between the lookup and the subscription.
        if let Some(native) = inner.registry.native_handle(&inner.connection_key) {
            inner.bind(&native);
        }

        trace!(
            key = %inner.connection_key,
            collection = %inner.name,
            "collection waiting for native handle"
        );
        collection
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Key of the connection this collection belongs to.
    pub fn connection_key(&self) -> &str {
        &self.inner.connection_key
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    /// Whether the gate has reached its terminal `Bound` state.
    pub fn is_bound(&self) -> bool {
        matches!(*self.inner.lock_gate(), Gate::Bound { .. })
    }

    /// Number of operations waiting to run.
    pub fn pending(&self) -> usize {
        match &*self.inner.lock_gate() {
            Gate::Unbound { queue } | Gate::Draining { queue, .. } => queue.len(),
            Gate::Bound { .. } => 0,
        }
    }

    /// Whether both handles point at the same collection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Forwarded operations ─────────────────────────────────────────

    pub fn find(&self, filter: Document, options: FindOptions) -> Deferred<Vec<Document>> {
        self.submit("find", move |handle| handle.find(filter, options))
    }

    pub fn count(&self, filter: Document, options: CountOptions) -> Deferred<u64> {
        self.submit("count", move |handle| handle.count_documents(filter, options))
    }

    pub fn distinct(&self, field: impl Into<String>, filter: Document) -> Deferred<Vec<Value>> {
        let field = field.into();
        self.submit("distinct", move |handle| handle.distinct(field, filter))
    }

    pub fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Deferred<Vec<Document>> {
        self.submit("aggregate", move |handle| handle.aggregate(pipeline, options))
    }

    pub fn insert(&self, documents: Vec<Document>) -> Deferred<InsertManyResult> {
        self.submit("insert", move |handle| handle.insert_many(documents))
    }

    /// Drop the collection. A missing namespace is not an error: it
    /// resolves to [`DropOutcome::NamespaceNotFound`].
    pub fn drop(&self) -> Deferred<DropOutcome> {
        self.submit("drop", |handle| {
            Box::pin(async move {
                match handle.drop_collection().await {
                    Ok(()) => Ok(DropOutcome::Dropped),
                    Err(e) if e.is_namespace_not_found() => Ok(DropOutcome::NamespaceNotFound),
                    Err(e) => Err(e),
                }
            })
        })
    }

    pub fn remove(&self, filter: Document) -> Deferred<DeleteResult> {
        self.submit("remove", move |handle| handle.delete_many(filter))
    }

    /// Legacy multi-document update.
    ///
    /// A payload without any `$` modifier is wrapped in `$set`; anything
    /// else is forwarded as-is and left for the driver to judge.
    pub fn update(
        &self,
        selector: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Deferred<UpdateResult> {
        let update = normalize_legacy_update(update);
        self.submit("update", move |handle| {
            handle.update_many(selector, update, options)
        })
    }

    pub fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Deferred<UpdateResult> {
        self.submit("update_many", move |handle| {
            handle.update_many(filter, update, options)
        })
    }

    pub fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Deferred<UpdateResult> {
        self.submit("update_one", move |handle| {
            handle.update_one(filter, update, options)
        })
    }

    pub fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> Deferred<Option<Document>> {
        self.submit("find_one_and_update", move |handle| {
            handle.find_one_and_update(filter, update, options)
        })
    }

    pub fn create_index(&self, keys: Document, options: IndexOptions) -> Deferred<String> {
        self.submit("create_index", move |handle| handle.create_index(keys, options))
    }

    pub fn indexes(&self) -> Deferred<Vec<Document>> {
        self.submit("indexes", |handle| handle.indexes())
    }

    // ── Gate plumbing ────────────────────────────────────────────────

    /// Start `run` against the bound handle, or queue it behind the gate.
    ///
    /// Either way the work no longer depends on the returned `Deferred`
    /// being polled.
    fn submit<T, F>(&self, operation: &'static str, run: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn NativeCollection>) -> DriverFuture<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |handle| {
            Box::pin(async move {
                // The caller may have dropped its Deferred.
                let _ = tx.send(run(handle).await);
            })
        });

        let handle = {
            let mut gate = self.inner.lock_gate();
            match &mut *gate {
                Gate::Bound { handle } => Arc::clone(handle),
                Gate::Unbound { queue } | Gate::Draining { queue, .. } => {
                    queue.push_back(QueuedOperation { operation, job });
                    trace!(
                        collection = %self.inner.name,
                        operation,
                        queued = queue.len(),
                        "operation queued"
                    );
                    return Deferred::queued(operation, rx);
                }
            }
        };
        tokio::spawn(job(handle));
        Deferred::started(operation, rx)
    }
}

impl CollectionInner {
    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        lock(&self.gate)
    }

    /// Leave `Unbound`. Called at most once with effect; later calls no-op.
    fn bind(self: &Arc<Self>, native: &Arc<dyn NativeDatabase>) {
        if !matches!(*self.lock_gate(), Gate::Unbound { .. }) {
            return;
        }
        let handle = native.collection(&self.name, &self.options);

        let queued = {
            let mut gate = self.lock_gate();
            let Gate::Unbound { queue } = &mut *gate else {
                return;
            };
            let queue = std::mem::take(queue);
            let queued = queue.len();
            *gate = if queue.is_empty() {
                Gate::Bound {
                    handle: Arc::clone(&handle),
                }
            } else {
                Gate::Draining {
                    handle: Arc::clone(&handle),
                    queue,
                }
            };
            queued
        };

        self.unsubscribe();
        debug!(
            key = %self.connection_key,
            namespace = %handle.namespace(),
            queued,
            "collection bound"
        );

        if queued > 0 {
            tokio::spawn(drain(Arc::clone(self), handle));
        }
    }

    fn unsubscribe(&self) {
        let handler = lock(&self.subscriber).take();
        if let Some(handler) = handler {
            self.registry.unsubscribe(&handler);
        }
    }
}

/// Run queued jobs one at a time, oldest first, until the queue is seen
/// empty; then flip the gate to `Bound` under the same lock.
async fn drain(inner: Arc<CollectionInner>, handle: Arc<dyn NativeCollection>) {
    let mut drained = 0_usize;
    loop {
        let next = {
            let mut gate = inner.lock_gate();
            match &mut *gate {
                Gate::Draining { queue, .. } => {
                    if let Some(next) = queue.pop_front() {
                        next
                    } else {
                        *gate = Gate::Bound {
                            handle: Arc::clone(&handle),
                        };
                        break;
                    }
                }
                other => {
                    debug!(collection = %inner.name, state = other.name(), "drain found no queue");
                    break;
                }
            }
        };
        trace!(collection = %inner.name, operation = next.operation, "running queued operation");
        let job = (next.job)(Arc::clone(&handle));
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            // The job's reply sender was dropped while unwinding.
            error!(collection = %inner.name, operation = next.operation, "queued operation panicked");
        }
        drained += 1;
    }
    debug!(collection = %inner.name, drained, "queue drained");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("connection_key", &self.inner.connection_key)
            .field("name", &self.inner.name)
            .field("state", &self.inner.lock_gate().name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio_test::{assert_pending, task};

    use super::*;
    use crate::error::CoreError;
    use crate::memory::{Fault, MemoryDatabase};
    use crate::store::Action;

    const KEY: &str = "mongodb://localhost/app";

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn register(registry: &Registry, db: &Arc<MemoryDatabase>) {
        let handle: Arc<dyn NativeDatabase> = db.clone();
        registry.dispatch(&Action::RegisterNativeHandle {
            key: KEY.into(),
            handle,
        });
    }

    #[tokio::test]
    async fn binds_immediately_when_handle_exists() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);

        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());
        assert!(users.is_bound());
        assert_eq!(registry.subscriber_count(), 0);

        let count = users.count(Document::new(), CountOptions::default());
        assert!(!count.is_queued());
        assert_eq!(count.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queues_until_handle_registered() {
        let registry = Registry::new();
        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());
        assert!(!users.is_bound());
        assert_eq!(registry.subscriber_count(), 1);

        let insert = users.insert(vec![doc(json!({"name": "Alice"}))]);
        assert!(insert.is_queued());
        let mut insert = task::spawn(insert);
        assert_pending!(insert.poll());
        assert_eq!(users.pending(), 1);

        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        assert_eq!(registry.subscriber_count(), 0);

        let inserted = insert.await.unwrap();
        assert_eq!(inserted.inserted_ids.len(), 1);
        assert!(users.is_bound());
        assert_eq!(db.documents("users").len(), 1);
    }

    #[tokio::test]
    async fn drain_preserves_order_and_isolates_faults() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());

        db.script_faults(
            "users",
            [
                Fault::Delay(Duration::from_millis(30)),
                Fault::Fail(CoreError::driver("boom")),
                Fault::None,
            ],
        );
        let first = users.insert(vec![doc(json!({"n": 1}))]);
        let second = users.insert(vec![doc(json!({"n": 2}))]);
        let third = users.insert(vec![doc(json!({"n": 3}))]);

        register(&registry, &db);

        assert!(first.await.is_ok());
        assert!(second.await.is_err());
        assert!(third.await.is_ok());

        let order: Vec<Value> = db
            .documents("users")
            .into_iter()
            .map(|d| d["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn enqueue_during_drain_keeps_fifo() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        db.script_faults("users", [Fault::Delay(Duration::from_millis(20))]);

        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());
        let first = users.insert(vec![doc(json!({"n": 1}))]);
        register(&registry, &db);

        // The drain task is still busy with the delayed first insert.
        let second = users.insert(vec![doc(json!({"n": 2}))]);
        assert!(second.is_queued());

        first.await.unwrap();
        second.await.unwrap();
        assert!(users.is_bound());

        let order: Vec<Value> = db
            .documents("users")
            .into_iter()
            .map(|d| d["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn drop_missing_namespace_resolves_sentinel() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);

        let ghost = Collection::new(registry, KEY, "ghost", CollectionOptions::default());
        let outcome = ghost.drop().await.unwrap();
        assert_eq!(outcome, DropOutcome::NamespaceNotFound);
        assert_eq!(outcome.to_string(), "ns not found");
    }

    #[tokio::test]
    async fn drop_other_failures_propagate() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        db.script_faults("users", [Fault::Fail(CoreError::driver("unauthorized"))]);

        let users = Collection::new(registry, KEY, "users", CollectionOptions::default());
        let err = users.drop().await.unwrap_err();
        assert!(matches!(err, CoreError::Driver { .. }));
    }

    #[tokio::test]
    async fn legacy_update_wraps_plain_fields() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        let users = Collection::new(registry, KEY, "users", CollectionOptions::default());

        users
            .insert(vec![doc(json!({"_id": "a", "name": "Bob", "count": 1}))])
            .await
            .unwrap();
        users
            .update(
                doc(json!({"_id": "a"})),
                doc(json!({"name": "Alice"})),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        users
            .update(
                doc(json!({"_id": "a"})),
                doc(json!({"$inc": {"count": 1}})),
                UpdateOptions::default(),
            )
            .await
            .unwrap();

        let stored = db.documents("users");
        assert_eq!(
            Value::Object(stored[0].clone()),
            json!({"_id": "a", "name": "Alice", "count": 2})
        );
    }

    #[tokio::test]
    async fn mixed_update_payload_reaches_the_driver() {
        let registry = Registry::new();
        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());

        let update = users.update(
            Document::new(),
            doc(json!({"$set": {"a": 1}, "b": 2})),
            UpdateOptions::default(),
        );
        assert!(update.is_queued());

        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        let err = update.await.unwrap_err();
        assert!(matches!(err, CoreError::Driver { code: Some(9), .. }));
    }

    #[tokio::test]
    async fn bound_operation_runs_without_being_awaited() {
        let registry = Registry::new();
        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());
        drop(users.insert(vec![doc(json!({"n": "unbound"}))]));

        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        users.count(Document::new(), CountOptions::default()).await.unwrap();
        assert!(users.is_bound());

        drop(users.insert(vec![doc(json!({"n": "bound"}))]));
        let count = users.count(Document::new(), CountOptions::default());
        assert!(!count.is_queued());
        assert_eq!(count.await.unwrap(), 2);

        let stored: Vec<Value> = db
            .documents("users")
            .into_iter()
            .map(|d| d["n"].clone())
            .collect();
        assert_eq!(stored, vec![json!("unbound"), json!("bound")]);
    }

    #[tokio::test]
    async fn bound_operations_start_in_submission_order() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        register(&registry, &db);
        let users = Collection::new(registry, KEY, "users", CollectionOptions::default());

        let first = users.insert(vec![doc(json!({"n": 1}))]);
        let second = users.insert(vec![doc(json!({"n": 2}))]);
        second.await.unwrap();
        first.await.unwrap();

        let order: Vec<Value> = db
            .documents("users")
            .into_iter()
            .map(|d| d["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn panicking_operation_does_not_stall_the_queue() {
        let registry = Registry::new();
        let db = Arc::new(MemoryDatabase::new("app"));
        db.script_faults("users", [Fault::Panic("driver bug")]);
        let users = Collection::new(registry.clone(), KEY, "users", CollectionOptions::default());

        let first = users.insert(vec![doc(json!({"n": 1}))]);
        let second = users.insert(vec![doc(json!({"n": 2}))]);
        register(&registry, &db);

        let err = first.await.unwrap_err();
        assert!(matches!(err, CoreError::OperationAbandoned { operation: "insert" }));
        assert_eq!(second.await.unwrap().inserted_ids.len(), 1);
        assert!(users.is_bound());
        assert_eq!(db.documents("users").len(), 1);
    }
}
