// ── Service method table ──
//
// Named custom operations shared by every `QueryService` of a database.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use super::QueryService;
use crate::error::CoreError;

/// A custom operation: receives the calling service and its arguments.
pub type ServiceMethod =
    Arc<dyn Fn(QueryService, Value) -> BoxFuture<'static, Result<Value, CoreError>> + Send + Sync>;

/// Capability table of custom service methods, keyed by name.
///
/// Cheaply cloneable; clones share the same entries.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Arc<DashMap<String, ServiceMethod>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, returning the method it replaced.
    pub fn insert(&self, name: &str, method: ServiceMethod) -> Option<ServiceMethod> {
        self.methods.insert(name.to_owned(), method)
    }

    pub fn remove(&self, name: &str) -> Option<ServiceMethod> {
        self.methods.remove(name).map(|(_, method)| method)
    }

    pub fn get(&self, name: &str) -> Option<ServiceMethod> {
        self.methods.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: i64) -> ServiceMethod {
        Arc::new(move |_service: QueryService, _args: Value| -> BoxFuture<'static, Result<Value, CoreError>> {
            Box::pin(async move { Ok(Value::from(value)) })
        })
    }

    #[test]
    fn insert_replaces_and_reports_previous() {
        let table = MethodTable::new();
        assert!(table.insert("answer", constant(1)).is_none());
        assert!(table.insert("answer", constant(42)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn names_are_sorted() {
        let table = MethodTable::new();
        table.insert("zeta", constant(0));
        table.insert("alpha", constant(0));
        assert_eq!(table.names(), vec!["alpha".to_owned(), "zeta".to_owned()]);
    }

    #[test]
    fn clones_share_entries() {
        let table = MethodTable::new();
        let clone = table.clone();
        clone.insert("answer", constant(42));
        assert!(table.contains("answer"));
        assert!(table.remove("answer").is_some());
        assert!(clone.is_empty());
    }
}
