// ── In-memory collections ──

use std::sync::Arc;

use serde_json::{Value, json};

use super::{DatabaseState, Fault, query};
use crate::driver::{
    AggregateOptions, CountOptions, DeleteResult, Document, DriverFuture, FindOneAndUpdateOptions,
    FindOptions, IndexOptions, InsertManyResult, NativeCollection, ReturnDocument, UpdateOptions,
    UpdateResult,
};
use crate::error::{CoreError, NS_NOT_FOUND};
use crate::id;

const NAMESPACE_NOT_FOUND: i32 = 26;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const DUPLICATE_KEY: i32 = 11000;

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Apply `skip` then `limit`; a zero limit means no limit.
fn window(docs: Vec<Document>, skip: Option<u64>, limit: Option<u64>) -> Vec<Document> {
    docs.into_iter()
        .skip(to_usize(skip.unwrap_or(0)))
        .take(limit.filter(|l| *l > 0).map_or(usize::MAX, to_usize))
        .collect()
}

fn ensure_id(doc: &mut Document) -> Value {
    doc.entry("_id")
        .or_insert_with(|| Value::String(id::generate()))
        .clone()
}

// ── Namespace ────────────────────────────────────────────────────────

/// Documents and secondary indexes of one collection, in insertion order.
#[derive(Debug, Default)]
pub(super) struct Namespace {
    pub(super) documents: Vec<Document>,
    indexes: Vec<Document>,
}

impl Namespace {
    fn select(&self, filter: &Document) -> Result<Vec<Document>, CoreError> {
        let mut selected = Vec::new();
        for doc in &self.documents {
            if query::matches(doc, filter)? {
                selected.push(doc.clone());
            }
        }
        Ok(selected)
    }

    fn insert(&mut self, namespace: &str, mut documents: Vec<Document>) -> Result<Vec<Value>, CoreError> {
        let ids: Vec<Value> = documents.iter_mut().map(ensure_id).collect();
        for (i, id) in ids.iter().enumerate() {
            let clashes_stored = self.documents.iter().any(|d| d.get("_id") == Some(id));
            if clashes_stored || ids[..i].contains(id) {
                return Err(CoreError::Driver {
                    message: format!(
                        "E11000 duplicate key error collection: {namespace} index: _id_ dup key: {{ _id: {id} }}"
                    ),
                    code: Some(DUPLICATE_KEY),
                });
            }
        }
        self.documents.extend(documents);
        Ok(ids)
    }

    fn update(
        &mut self,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateResult, CoreError> {
        let mut result = UpdateResult::default();
        for doc in &mut self.documents {
            if !query::matches(doc, filter)? {
                continue;
            }
            result.matched_count += 1;
            if query::apply_update(doc, update)? {
                result.modified_count += 1;
            }
            if !multi {
                break;
            }
        }
        if result.matched_count == 0 && upsert {
            result.upserted_id = Some(ensure_id(self.upsert(filter, update)?));
        }
        Ok(result)
    }

    fn upsert(&mut self, filter: &Document, update: &Document) -> Result<&mut Document, CoreError> {
        let mut doc = query::upsert_seed(filter)?;
        query::apply_update(&mut doc, update)?;
        ensure_id(&mut doc);
        self.documents.push(doc);
        let last = self.documents.len() - 1;
        Ok(&mut self.documents[last])
    }

    fn find_one_and_update(
        &mut self,
        filter: &Document,
        update: &Document,
        options: &FindOneAndUpdateOptions,
    ) -> Result<Option<Document>, CoreError> {
        let mut candidates = Vec::new();
        for (index, doc) in self.documents.iter().enumerate() {
            if query::matches(doc, filter)? {
                candidates.push(index);
            }
        }
        if let Some(spec) = &options.sort {
            let docs = &self.documents;
            candidates.sort_by(|a, b| query::compare_by(spec, &docs[*a], &docs[*b]));
        }

        let Some(&index) = candidates.first() else {
            if !options.upsert {
                return Ok(None);
            }
            let inserted = self.upsert(filter, update)?;
            return Ok(match options.return_document {
                ReturnDocument::Before => None,
                ReturnDocument::After => Some(inserted.clone()),
            });
        };

        let doc = &mut self.documents[index];
        let before = doc.clone();
        query::apply_update(doc, update)?;
        Ok(Some(match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => doc.clone(),
        }))
    }

    fn create_index(&mut self, keys: Document, options: IndexOptions) -> Result<String, CoreError> {
        let name = options.name.unwrap_or_else(|| {
            keys.iter()
                .map(|(field, direction)| match direction {
                    Value::String(kind) => format!("{field}_{kind}"),
                    other => format!("{field}_{other}"),
                })
                .collect::<Vec<_>>()
                .join("_")
        });

        if let Some(existing) = self.indexes.iter().find(|ix| ix["name"] == name.as_str()) {
            if existing["key"] == Value::Object(keys) {
                return Ok(name);
            }
            return Err(CoreError::Driver {
                message: format!("Index with name: {name} already exists with different options"),
                code: Some(INDEX_OPTIONS_CONFLICT),
            });
        }

        let mut index = json!({"v": 2, "key": keys, "name": name});
        if options.unique {
            index["unique"] = Value::Bool(true);
        }
        if options.sparse {
            index["sparse"] = Value::Bool(true);
        }
        if let Some(secs) = options.expire_after_secs {
            index["expireAfterSeconds"] = Value::from(secs);
        }
        if let Value::Object(index) = index {
            self.indexes.push(index);
        }
        Ok(name)
    }

    fn indexes(&self) -> Vec<Document> {
        let mut all = Vec::with_capacity(self.indexes.len() + 1);
        if let Value::Object(id_index) = json!({"v": 2, "key": {"_id": 1}, "name": "_id_"}) {
            all.push(id_index);
        }
        all.extend(self.indexes.iter().cloned());
        all
    }
}

// ── Aggregation ──────────────────────────────────────────────────────

fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>, CoreError> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(CoreError::driver(
                "a pipeline stage specification object must contain exactly one field",
            ));
        };

        docs = match (name.as_str(), spec) {
            ("$match", Value::Object(filter)) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if query::matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$sort", Value::Object(order)) => {
                query::sort(&mut docs, order);
                docs
            }
            ("$skip", Value::Number(n)) => window(docs, n.as_u64(), None),
            ("$limit", Value::Number(n)) => window(docs, None, n.as_u64()),
            ("$project", Value::Object(projection)) => {
                docs.iter().map(|doc| query::project(doc, projection)).collect()
            }
            ("$count", Value::String(field)) => {
                let mut counted = Document::new();
                counted.insert(field.clone(), Value::from(docs.len()));
                vec![counted]
            }
            (name, _) => {
                return Err(CoreError::driver(format!(
                    "unrecognized or malformed pipeline stage: {name}"
                )));
            }
        };
    }
    Ok(docs)
}

// ── MemoryCollection ─────────────────────────────────────────────────

/// Handle to one collection of a [`MemoryDatabase`](super::MemoryDatabase).
pub struct MemoryCollection {
    state: Arc<DatabaseState>,
    name: String,
}

impl MemoryCollection {
    pub(super) fn new(state: Arc<DatabaseState>, name: &str) -> Self {
        Self {
            state,
            name: name.to_owned(),
        }
    }

    /// Run `op` after consuming this collection's next scripted fault.
    ///
    /// The fault is taken when the driver call is made, not when the
    /// returned future is first polled.
    fn run<T, F>(&self, op: F) -> DriverFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&DatabaseState, &str) -> Result<T, CoreError> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        let fault = state.next_fault(&name);
        Box::pin(async move {
            match fault {
                Fault::None => {}
                Fault::Delay(delay) => tokio::time::sleep(delay).await,
                Fault::Fail(e) => return Err(e),
                Fault::Panic(message) => panic!("{message}"),
            }
            op(&state, &name)
        })
    }
}

impl NativeCollection for MemoryCollection {
    fn namespace(&self) -> String {
        self.state.namespace_of(&self.name)
    }

    fn find(&self, filter: Document, options: FindOptions) -> DriverFuture<Vec<Document>> {
        self.run(move |state, name| {
            let Some(mut docs) = state.read(name, |ns| ns.select(&filter)).transpose()? else {
                return Ok(Vec::new());
            };
            if let Some(order) = &options.sort {
                query::sort(&mut docs, order);
            }
            let docs = window(docs, options.skip, options.limit);
            Ok(match &options.projection {
                Some(projection) => docs.iter().map(|d| query::project(d, projection)).collect(),
                None => docs,
            })
        })
    }

    fn count_documents(&self, filter: Document, options: CountOptions) -> DriverFuture<u64> {
        self.run(move |state, name| {
            let docs = state.read(name, |ns| ns.select(&filter)).transpose()?.unwrap_or_default();
            let counted = window(docs, options.skip, options.limit).len();
            Ok(u64::try_from(counted).unwrap_or(u64::MAX))
        })
    }

    fn distinct(&self, field: String, filter: Document) -> DriverFuture<Vec<Value>> {
        self.run(move |state, name| {
            let docs = state.read(name, |ns| ns.select(&filter)).transpose()?.unwrap_or_default();
            let mut values: Vec<Value> = Vec::new();
            for doc in &docs {
                let found = match query::lookup(doc, &field) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                    None => Vec::new(),
                };
                for value in found {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
            }
            Ok(values)
        })
    }

    fn aggregate(
        &self,
        pipeline: Vec<Document>,
        _options: AggregateOptions,
    ) -> DriverFuture<Vec<Document>> {
        self.run(move |state, name| {
            let docs = state
                .read(name, |ns| ns.documents.clone())
                .unwrap_or_default();
            run_pipeline(docs, &pipeline)
        })
    }

    fn insert_many(&self, documents: Vec<Document>) -> DriverFuture<InsertManyResult> {
        self.run(move |state, name| {
            let namespace = state.namespace_of(name);
            let inserted_ids = state.write(name, |ns| ns.insert(&namespace, documents))?;
            Ok(InsertManyResult { inserted_ids })
        })
    }

    fn drop_collection(&self) -> DriverFuture<()> {
        self.run(|state, name| {
            if state.namespaces.remove(name).is_some() {
                Ok(())
            } else {
                Err(CoreError::Driver {
                    message: NS_NOT_FOUND.to_owned(),
                    code: Some(NAMESPACE_NOT_FOUND),
                })
            }
        })
    }

    fn delete_many(&self, filter: Document) -> DriverFuture<DeleteResult> {
        self.run(move |state, name| {
            let Some(mut ns) = state.namespaces.get_mut(name) else {
                return Ok(DeleteResult::default());
            };
            // Evaluate every match first so a bad filter deletes nothing.
            let mut doomed = Vec::with_capacity(ns.documents.len());
            for doc in &ns.documents {
                doomed.push(query::matches(doc, &filter)?);
            }
            let before = ns.documents.len();
            let mut doomed = doomed.into_iter();
            ns.documents.retain(|_| !doomed.next().unwrap_or(false));
            let deleted = before - ns.documents.len();
            Ok(DeleteResult {
                deleted_count: u64::try_from(deleted).unwrap_or(u64::MAX),
            })
        })
    }

    fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DriverFuture<UpdateResult> {
        self.run(move |state, name| state.update(name, &filter, &update, true, options.upsert))
    }

    fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> DriverFuture<UpdateResult> {
        self.run(move |state, name| state.update(name, &filter, &update, false, options.upsert))
    }

    fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> DriverFuture<Option<Document>> {
        self.run(move |state, name| {
            query::apply_update(&mut Document::new(), &update)?;
            if options.upsert {
                state.write(name, |ns| ns.find_one_and_update(&filter, &update, &options))
            } else if let Some(mut ns) = state.namespaces.get_mut(name) {
                ns.find_one_and_update(&filter, &update, &options)
            } else {
                Ok(None)
            }
        })
    }

    fn create_index(&self, keys: Document, options: IndexOptions) -> DriverFuture<String> {
        self.run(move |state, name| {
            if keys.is_empty() {
                return Err(CoreError::driver("index keys must not be empty"));
            }
            state.write(name, |ns| ns.create_index(keys, options))
        })
    }

    fn indexes(&self) -> DriverFuture<Vec<Document>> {
        self.run(|state, name| {
            state
                .read(name, Namespace::indexes)
                .ok_or_else(|| CoreError::NamespaceNotFound {
                    namespace: state.namespace_of(name),
                })
        })
    }
}

impl DatabaseState {
    /// Validate the update up front so a malformed one fails even when
    /// nothing matches.
    fn update(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateResult, CoreError> {
        query::apply_update(&mut Document::new(), update)?;
        if upsert {
            self.write(name, |ns| ns.update(filter, update, multi, true))
        } else if let Some(mut ns) = self.namespaces.get_mut(name) {
            ns.update(filter, update, multi, false)
        } else {
            Ok(UpdateResult::default())
        }
    }
}
