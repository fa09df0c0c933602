// ── Database handle ──
//
// One `Database` per connection key. It owns the lifecycle of the native
// connection: acquiring the handle in the background, publishing it to
// the registry, and forwarding driver activity as `ConnectionEvent`s.
// Collections are vended from here and never block on the connection.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collection::Collection;
use crate::config::{CollectionOptions, ConnectOptions};
use crate::driver::{Driver, DriverEvent, NativeDatabase};
use crate::error::CoreError;
use crate::service::{MethodTable, QueryService, ServiceMethod};
use crate::store::{Action, Registry};

const EVENT_CHANNEL_SIZE: usize = 64;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected { reason: Option<String> },
    Failed { reason: String },
}

// ── ConnectionEvent ──────────────────────────────────────────────────

/// Lifecycle notifications broadcast by a [`Database`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The native handle is available; queued operations start draining.
    Connected,
    /// The initial connection failed. Not retried.
    Error(Arc<CoreError>),
    /// The driver lost its connection.
    Disconnected { reason: Option<String> },
    /// The driver re-established the connection on its own.
    Reconnected,
}

// ── Database ─────────────────────────────────────────────────────────

/// A logical connection to one backing-store URI.
///
/// Cheaply cloneable via `Arc<DatabaseInner>`. Created by
/// [`Client::connect`](crate::Client::connect), which guarantees one
/// instance per URI.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    uri: String,
    options: ConnectOptions,
    registry: Registry,
    connection_state: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    /// Serializes collection creation so each name gets one instance.
    creation: Mutex<()>,
    methods: MethodTable,
}

impl Database {
    pub(crate) fn new(registry: Registry, uri: &str, options: ConnectOptions) -> Self {
        let (connection_state, _) = watch::channel(ConnectionState::Connecting);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(DatabaseInner {
                uri: uri.to_owned(),
                options,
                registry,
                connection_state,
                event_tx,
                cancel: CancellationToken::new(),
                creation: Mutex::new(()),
                methods: MethodTable::new(),
            }),
        }
    }

    /// Acquire the native handle in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn_connect(&self, driver: Arc<dyn Driver>) {
        let db = self.clone();
        tokio::spawn(async move {
            db.establish(driver.as_ref()).await;
        });
    }

    async fn establish(&self, driver: &dyn Driver) {
        let inner = &self.inner;
        let timeout = inner.options.connect_timeout;
        debug!(uri = %inner.uri, ?timeout, "connecting");

        let outcome = match tokio::time::timeout(timeout, driver.connect(&inner.uri, &inner.options))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(CoreError::ConnectionFailed {
                uri: inner.uri.clone(),
                reason: format!("timed out after {}ms", timeout.as_millis()),
            }),
        };

        match outcome {
            Ok(native) => {
                // Subscribe before publishing so no driver event is missed.
                let driver_events = native.events();
                inner.registry.dispatch(&Action::RegisterNativeHandle {
                    key: inner.uri.clone(),
                    handle: native,
                });
                inner.connection_state.send_replace(ConnectionState::Connected);
                let _ = inner.event_tx.send(ConnectionEvent::Connected);
                info!(uri = %inner.uri, "connected");

                self.forward_driver_events(driver_events).await;
            }
            Err(e) => {
                error!(uri = %inner.uri, error = %e, "connection failed");
                let reason = match &e {
                    CoreError::ConnectionFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                inner.connection_state.send_replace(ConnectionState::Failed { reason });
                let _ = inner.event_tx.send(ConnectionEvent::Error(Arc::new(e)));
            }
        }
    }

    /// Re-publish driver activity until closed or the driver goes away.
    async fn forward_driver_events(&self, mut driver_events: broadcast::Receiver<DriverEvent>) {
        let inner = &self.inner;
        loop {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                result = driver_events.recv() => {
                    match result {
                        Ok(DriverEvent::Closed { reason }) => {
                            warn!(
                                uri = %inner.uri,
                                reason = reason.as_deref().unwrap_or("unknown"),
                                "disconnected"
                            );
                            inner.connection_state.send_replace(ConnectionState::Disconnected {
                                reason: reason.clone(),
                            });
                            let _ = inner.event_tx.send(ConnectionEvent::Disconnected { reason });
                        }
                        Ok(DriverEvent::Reconnected) => {
                            warn!(uri = %inner.uri, "reconnected");
                            inner.connection_state.send_replace(ConnectionState::Connected);
                            let _ = inner.event_tx.send(ConnectionEvent::Reconnected);
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(uri = %inner.uri, skipped = n, "driver event receiver lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!(uri = %inner.uri, "driver event forwarding stopped");
    }

    // ── Collections ──────────────────────────────────────────────────

    /// Get the collection called `name`, creating it on first use.
    ///
    /// Returns immediately whether or not the connection is up. `options`
    /// only apply to the call that creates the collection.
    pub fn get(&self, name: &str, options: CollectionOptions) -> Collection {
        let inner = &self.inner;
        let _guard = inner.creation.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.registry.collection(&inner.uri, name) {
            return existing;
        }

        let collection = Collection::new(inner.registry.clone(), &inner.uri, name, options);
        inner.registry.dispatch(&Action::RegisterCollection {
            key: inner.uri.clone(),
            name: name.to_owned(),
            collection: collection.clone(),
        });
        collection
    }

    /// [`get`](Self::get) with default options.
    pub fn collection(&self, name: &str) -> Collection {
        self.get(name, CollectionOptions::default())
    }

    // ── Query services ───────────────────────────────────────────────

    /// A read-oriented service over the collection `name`.
    ///
    /// Every service created from this database shares one method table.
    pub fn create_query_service(&self, name: &str, options: CollectionOptions) -> QueryService {
        QueryService::new(self.get(name, options), self.inner.methods.clone())
    }

    /// Register a custom service method callable through
    /// [`QueryService::call`]. Replaces any method with the same name.
    pub fn set_service_method<F, Fut>(&self, name: &str, method: F)
    where
        F: Fn(QueryService, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        let method: ServiceMethod = Arc::new(
            move |service: QueryService, args: Value| -> BoxFuture<'static, Result<Value, CoreError>> {
                Box::pin(method(service, args))
            },
        );
        if self.inner.methods.insert(name, method).is_some() {
            debug!(uri = %self.inner.uri, method = name, "service method replaced");
        }
    }

    pub fn service_methods(&self) -> &MethodTable {
        &self.inner.methods
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Wait until the initial connection settles.
    ///
    /// There is no timeout beyond the driver's own connect timeout.
    pub async fn ready(&self) -> Result<(), CoreError> {
        let mut state = self.inner.connection_state.subscribe();
        let settled = state
            .wait_for(|s| !matches!(s, ConnectionState::Connecting))
            .await
            .map_err(|_| CoreError::OperationAbandoned { operation: "ready" })?
            .clone();

        match settled {
            ConnectionState::Failed { reason } => Err(CoreError::ConnectionFailed {
                uri: self.inner.uri.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Stop forwarding driver events. Collections keep working.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The native handle, once acquired.
    pub fn native_handle(&self) -> Option<Arc<dyn NativeDatabase>> {
        self.inner.registry.native_handle(&self.inner.uri)
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("uri", &self.inner.uri)
            .field("state", &*self.inner.connection_state.borrow())
            .finish_non_exhaustive()
    }
}
