// ── Query service ──
//
// Read-oriented helpers layered over a `Collection`: paged finds, strict
// single-document lookups, existence checks, and a polling wait used by
// tests. Custom operations are dispatched through the shared
// `MethodTable`.

mod methods;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

pub use methods::{MethodTable, ServiceMethod};

use crate::collection::Collection;
use crate::driver::{AggregateOptions, CountOptions, Document, FindOptions};
use crate::error::CoreError;
use crate::id;

// ── Paging ───────────────────────────────────────────────────────────

/// Page selection for [`QueryService::find`]. `page == 0` disables paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u64,
    pub per_page: u64,
}

impl PageRequest {
    pub fn page(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    fn is_paged(self) -> bool {
        self.page > 0
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: 100,
        }
    }
}

/// Totals reported alongside a paged result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Documents matching the query across all pages.
    pub count: u64,
    /// At least 1, even when nothing matches.
    pub pages_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindResult {
    pub results: Vec<Document>,
    /// Present only for paged requests.
    pub page: Option<PageInfo>,
}

/// Number of pages needed to show `count` items, never less than one.
pub fn pages_count(count: u64, per_page: u64) -> u64 {
    count.div_ceil(per_page).max(1)
}

// ── expect_document ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectOptions {
    pub timeout: Duration,
    /// Delay between two counts.
    pub tick: Duration,
    /// Wait for the query to match nothing instead of something.
    pub expect_no_docs: bool,
}

impl Default for ExpectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            tick: Duration::from_millis(50),
            expect_no_docs: false,
        }
    }
}

// ── QueryService ─────────────────────────────────────────────────────

/// Query helpers over one collection, created by
/// [`Database::create_query_service`](crate::Database::create_query_service).
#[derive(Clone, Debug)]
pub struct QueryService {
    collection: Collection,
    methods: MethodTable,
}

impl QueryService {
    pub(crate) fn new(collection: Collection, methods: MethodTable) -> Self {
        Self {
            collection,
            methods,
        }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Find documents, optionally one page at a time.
    ///
    /// A paged request overrides `skip` and `limit` in `options` and also
    /// counts every match to fill in [`FindResult::page`].
    pub async fn find(
        &self,
        query: Document,
        paging: PageRequest,
        mut options: FindOptions,
    ) -> Result<FindResult, CoreError> {
        if !paging.is_paged() {
            let results = self.collection.find(query, options).await?;
            return Ok(FindResult {
                results,
                page: None,
            });
        }
        if paging.per_page == 0 {
            return Err(CoreError::invalid_argument("per_page must be greater than zero"));
        }

        let skip = (paging.page - 1)
            .checked_mul(paging.per_page)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "page {} of {} documents is out of range",
                    paging.page, paging.per_page
                ))
            })?;
        options.skip = Some(skip);
        options.limit = Some(paging.per_page);
        let results = self.collection.find(query.clone(), options).await?;
        let count = self.collection.count(query, CountOptions::default()).await?;

        Ok(FindResult {
            results,
            page: Some(PageInfo {
                count,
                pages_count: pages_count(count, paging.per_page),
            }),
        })
    }

    /// The single document matching `query`, if any.
    ///
    /// Fails with [`CoreError::MoreThanOne`] when the query is ambiguous.
    pub async fn find_one(
        &self,
        query: Document,
        mut options: FindOptions,
    ) -> Result<Option<Document>, CoreError> {
        options.limit = Some(options.limit.map_or(2, |limit| limit.min(2)));
        let rendered = Value::Object(query.clone()).to_string();
        let mut results = self.collection.find(query, options).await?;

        if results.len() > 1 {
            return Err(CoreError::MoreThanOne { query: rendered });
        }
        Ok(results.pop())
    }

    pub async fn count(&self, query: Document) -> Result<u64, CoreError> {
        self.collection.count(query, CountOptions::default()).await
    }

    pub async fn distinct(&self, field: &str, query: Document) -> Result<Vec<Value>, CoreError> {
        self.collection.distinct(field, query).await
    }

    pub async fn exists(&self, query: Document) -> Result<bool, CoreError> {
        Ok(self.count(query).await? > 0)
    }

    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
    ) -> Result<Vec<Document>, CoreError> {
        self.collection.aggregate(pipeline, options).await
    }

    /// A fresh 24-hex-digit document id.
    pub fn generate_id(&self) -> String {
        id::generate()
    }

    /// Poll until `query` matches a document (or none, with
    /// `expect_no_docs`). Intended for tests.
    pub async fn expect_document(
        &self,
        query: Document,
        options: ExpectOptions,
    ) -> Result<(), CoreError> {
        if options.tick.is_zero() {
            return Err(CoreError::invalid_argument("tick must be greater than zero"));
        }
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval_at(start + options.tick, options.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let count = self.count(query.clone()).await?;
            trace!(collection = %self.name(), count, "expect_document tick");

            let satisfied = if options.expect_no_docs {
                count == 0
            } else {
                count > 0
            };
            if satisfied {
                return Ok(());
            }

            let waited = start.elapsed();
            if waited > options.timeout {
                return Err(CoreError::Timeout {
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    query: Value::Object(query).to_string(),
                });
            }
        }
    }

    // ── Custom methods ───────────────────────────────────────────────

    /// Invoke the custom method registered as `name`.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, CoreError> {
        let method = self.methods.get(name).ok_or_else(|| CoreError::UnknownMethod {
            name: name.to_owned(),
        })?;
        debug!(collection = %self.name(), method = name, "calling service method");
        method(self.clone(), args).await
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_count_rounds_up() {
        assert_eq!(pages_count(0, 10), 1);
        assert_eq!(pages_count(1, 10), 1);
        assert_eq!(pages_count(10, 10), 1);
        assert_eq!(pages_count(11, 10), 2);
        assert_eq!(pages_count(95, 10), 10);
    }

    #[test]
    fn default_page_request_is_unpaged() {
        let paging = PageRequest::default();
        assert!(!paging.is_paged());
        assert_eq!(paging.per_page, 100);
        assert!(PageRequest::page(1, 20).is_paged());
    }
}
