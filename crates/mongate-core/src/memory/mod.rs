// ── In-memory driver ──
//
// A complete `Driver` implementation backed by process memory. It is what
// the test suites run against, and it doubles as an embedded store for
// local development. Tests can script per-collection latency and
// failures, make connection attempts slow or failing, and inject driver
// lifecycle events.

mod collection;
mod query;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

pub use collection::MemoryCollection;

use collection::Namespace;
use crate::config::{CollectionOptions, ConnectOptions};
use crate::driver::{Document, Driver, DriverEvent, DriverFuture, NativeCollection, NativeDatabase};
use crate::error::CoreError;

const DRIVER_EVENT_CHANNEL_SIZE: usize = 16;
const DEFAULT_DATABASE: &str = "test";

// ── Faults ───────────────────────────────────────────────────────────

/// Scripted behavior for the next operation on a collection.
#[derive(Debug)]
pub enum Fault {
    /// Run normally.
    None,
    /// Wait before running.
    Delay(Duration),
    /// Fail without touching any data.
    Fail(CoreError),
    /// Panic inside the driver future.
    Panic(&'static str),
}

// ── Database state ───────────────────────────────────────────────────

struct DatabaseState {
    name: String,
    namespaces: DashMap<String, Namespace>,
    faults: DashMap<String, VecDeque<Fault>>,
}

impl DatabaseState {
    fn namespace_of(&self, collection: &str) -> String {
        format!("{}.{collection}", self.name)
    }

    fn next_fault(&self, collection: &str) -> Fault {
        self.faults
            .get_mut(collection)
            .and_then(|mut script| script.pop_front())
            .unwrap_or(Fault::None)
    }

    fn read<T>(&self, collection: &str, f: impl FnOnce(&Namespace) -> T) -> Option<T> {
        self.namespaces.get(collection).map(|ns| f(ns.value()))
    }

    /// Like `read`, creating the namespace when missing.
    fn write<T>(&self, collection: &str, f: impl FnOnce(&mut Namespace) -> T) -> T {
        let mut ns = self.namespaces.entry(collection.to_owned()).or_default();
        f(ns.value_mut())
    }
}

// ── MemoryDatabase ───────────────────────────────────────────────────

/// An in-memory database.
pub struct MemoryDatabase {
    state: Arc<DatabaseState>,
    events: broadcast::Sender<DriverEvent>,
}

impl MemoryDatabase {
    pub fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(DRIVER_EVENT_CHANNEL_SIZE);
        Self {
            state: Arc::new(DatabaseState {
                name: name.to_owned(),
                namespaces: DashMap::new(),
                faults: DashMap::new(),
            }),
            events,
        }
    }

    /// Publish a lifecycle event as if the connection changed. Returns
    /// how many listeners received it.
    pub fn emit(&self, event: DriverEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Queue behavior for the next operations on `collection`, consumed
    /// one per driver call.
    pub fn script_faults(&self, collection: &str, faults: impl IntoIterator<Item = Fault>) {
        self.state
            .faults
            .entry(collection.to_owned())
            .or_default()
            .extend(faults);
    }

    /// Snapshot of the stored documents, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .read(collection, |ns| ns.documents.clone())
            .unwrap_or_default()
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.state.namespaces.contains_key(collection)
    }

    /// Existing collection names, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

impl NativeDatabase for MemoryDatabase {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn collection(&self, name: &str, _options: &CollectionOptions) -> Arc<dyn NativeCollection> {
        Arc::new(MemoryCollection::new(Arc::clone(&self.state), name))
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.state.name)
            .field("collections", &self.collection_names())
            .finish()
    }
}

// ── MemoryDriver ─────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct ConnectBehavior {
    delay: Option<Duration>,
    failure: Option<String>,
}

/// Driver handing out one [`MemoryDatabase`] per URI.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    attempts: AtomicUsize,
    behavior: Mutex<ConnectBehavior>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `connect` has been called.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make every later connection attempt take `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.behavior().delay = Some(delay);
    }

    /// Make every later connection attempt fail with `reason`.
    pub fn fail_connections(&self, reason: impl Into<String>) {
        self.behavior().failure = Some(reason.into());
    }

    /// Undo [`fail_connections`](Self::fail_connections).
    pub fn succeed_connections(&self) {
        self.behavior().failure = None;
    }

    /// Serve `database` for `uri` instead of a fresh one.
    pub fn insert_database(&self, uri: &str, database: Arc<MemoryDatabase>) {
        self.databases.insert(uri.to_owned(), database);
    }

    /// The database served for `uri`, if one was created or inserted.
    pub fn database(&self, uri: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases.get(uri).map(|db| Arc::clone(db.value()))
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, ConnectBehavior> {
        self.behavior.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for MemoryDriver {
    fn connect(&self, uri: &str, _options: &ConnectOptions) -> DriverFuture<Arc<dyn NativeDatabase>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.behavior().clone();
        debug!(uri, attempt, "memory driver connect");

        let database: Arc<dyn NativeDatabase> = self
            .databases
            .entry(uri.to_owned())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(database_name(uri))))
            .value()
            .clone();
        let uri = uri.to_owned();

        Box::pin(async move {
            if let Some(delay) = behavior.delay {
                tokio::time::sleep(delay).await;
            }
            match behavior.failure {
                Some(reason) => Err(CoreError::ConnectionFailed { uri, reason }),
                None => Ok(database),
            }
        })
    }
}

/// Database name from the path of a connection string.
fn database_name(uri: &str) -> &str {
    let without_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let path = without_scheme.split_once('/').map_or("", |(_, path)| path);
    let name = path.split(['?', '/']).next().unwrap_or_default();
    if name.is_empty() { DEFAULT_DATABASE } else { name }
}
