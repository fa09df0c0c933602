// ── Client factory ──
//
// Entry point for consumers: hands out one `Database` per connection URI
// and starts acquiring its native handle in the background.

use std::sync::Arc;

use tracing::debug;

use crate::config::ConnectOptions;
use crate::database::Database;
use crate::driver::Driver;
use crate::store::{Action, Registry};

/// Factory for [`Database`] handles.
///
/// Cheaply cloneable; clones share the registry. Clients built over the
/// same registry share its connections.
#[derive(Clone)]
pub struct Client {
    registry: Registry,
    driver: Arc<dyn Driver>,
}

impl Client {
    /// A client with its own, empty registry.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_registry(Registry::new(), driver)
    }

    /// A client over an existing registry.
    ///
    /// Connections already registered there are reused as-is.
    pub fn with_registry(registry: Registry, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// [`connect_with`](Self::connect_with) using default options.
    pub fn connect(&self, uri: &str) -> Database {
        self.connect_with(uri, ConnectOptions::default())
    }

    /// Get the `Database` for `uri`, creating it on first use.
    ///
    /// The first call registers the database and spawns the connection
    /// attempt; later calls return the same instance and never contact
    /// the driver again. Must be called from within a tokio runtime.
    pub fn connect_with(&self, uri: &str, options: ConnectOptions) -> Database {
        let _guard = self.registry.lock_creation();

        if let Some(existing) = self.registry.connection(uri) {
            debug!(uri, "reusing connection");
            return existing;
        }

        let db = Database::new(self.registry.clone(), uri, options);
        self.registry.dispatch(&Action::RegisterConnection {
            key: uri.to_owned(),
            connection: db.clone(),
        });
        db.spawn_connect(Arc::clone(&self.driver));
        db
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;

    #[tokio::test]
    async fn connect_twice_returns_same_database() {
        let driver = Arc::new(MemoryDriver::new());
        let client = Client::new(driver.clone());

        let a = client.connect("mongodb://localhost/app");
        let b = client.connect("mongodb://localhost/app");
        assert!(a.ptr_eq(&b));

        a.ready().await.unwrap();
        assert_eq!(driver.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn distinct_uris_get_distinct_databases() {
        let driver = Arc::new(MemoryDriver::new());
        let client = Client::new(driver.clone());

        let a = client.connect("mongodb://localhost/a");
        let b = client.connect("mongodb://localhost/b");
        assert!(!a.ptr_eq(&b));

        a.ready().await.unwrap();
        b.ready().await.unwrap();
        assert_eq!(driver.connect_attempts(), 2);
        assert_eq!(client.registry().state().connections.len(), 2);
    }

    #[tokio::test]
    async fn clones_share_connections() {
        let client = Client::new(Arc::new(MemoryDriver::new()));
        let clone = client.clone();
        let a = client.connect("mongodb://localhost/app");
        let b = clone.connect("mongodb://localhost/app");
        assert!(a.ptr_eq(&b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clients_sharing_a_registry_share_connections() {
        let registry = Registry::new();
        let driver = Arc::new(MemoryDriver::new());
        driver.set_connect_delay(std::time::Duration::from_millis(5));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let client = Client::with_registry(registry.clone(), driver.clone());
                tokio::spawn(async move { client.connect("mongodb://localhost/app") })
            })
            .collect();
        let mut databases = Vec::new();
        for task in tasks {
            databases.push(task.await.unwrap());
        }

        assert!(databases.windows(2).all(|w| w[0].ptr_eq(&w[1])));
        databases[0].ready().await.unwrap();
        assert_eq!(driver.connect_attempts(), 1);
    }
}
