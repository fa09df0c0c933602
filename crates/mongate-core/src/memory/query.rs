// ── In-memory query engine ──
//
// A small subset of the document query language: equality and
// comparison filters, `$and`/`$or`, field updates, sorting, and
// projections over `serde_json` documents. Dotted paths reach into
// nested objects.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::driver::Document;
use crate::error::CoreError;

/// Server code for malformed operators.
const BAD_VALUE: i32 = 2;
/// Server code for an update document without operators.
const FAILED_TO_PARSE: i32 = 9;

fn bad_value(message: String) -> CoreError {
    CoreError::Driver {
        message,
        code: Some(BAD_VALUE),
    }
}

// ── Paths ────────────────────────────────────────────────────────────

pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), CoreError> {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_owned(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                _ => Err(bad_value(format!("cannot create field '{rest}' in non-object '{head}'"))),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = doc.get_mut(head) {
                remove_path(map, rest);
            }
        }
    }
}

// ── Comparison ───────────────────────────────────────────────────────

/// Order two values of the same kind; `None` across kinds.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b).map_or(a == b, Ordering::is_eq)
}

/// Equality, also matching any element when the field holds an array.
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
        None => expected.is_null(),
    }
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

// ── Filters ──────────────────────────────────────────────────────────

/// Whether `doc` satisfies `filter`.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, CoreError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_clauses(doc, condition)?.iter().all(|m| *m),
            "$or" => all_clauses(doc, condition)?.iter().any(|m| *m),
            op if op.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {op}")));
            }
            path => matches_field(lookup(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_clauses(doc: &Document, clauses: &Value) -> Result<Vec<bool>, CoreError> {
    let Value::Array(clauses) = clauses else {
        return Err(bad_value("$and/$or needs an array".to_owned()));
    };
    clauses
        .iter()
        .map(|clause| match clause {
            Value::Object(filter) => matches(doc, filter),
            _ => Err(bad_value("$and/$or entries must be objects".to_owned())),
        })
        .collect()
}

fn matches_field(field: Option<&Value>, condition: &Value) -> Result<bool, CoreError> {
    let Some(operators) = condition.as_object().filter(|_| is_operator_object(condition)) else {
        return Ok(equals(field, condition));
    };

    for (op, arg) in operators {
        let ok = match op.as_str() {
            "$eq" => equals(field, arg),
            "$ne" => !equals(field, arg),
            "$in" => in_list(field, arg)?,
            "$nin" => !in_list(field, arg)?,
            "$exists" => field.is_some() == arg.as_bool().unwrap_or(true),
            "$gt" => ordered(field, arg, Ordering::is_gt),
            "$gte" => ordered(field, arg, Ordering::is_ge),
            "$lt" => ordered(field, arg, Ordering::is_lt),
            "$lte" => ordered(field, arg, Ordering::is_le),
            other => return Err(bad_value(format!("unknown operator: {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(field: Option<&Value>, list: &Value) -> Result<bool, CoreError> {
    let Value::Array(candidates) = list else {
        return Err(bad_value("$in/$nin needs an array".to_owned()));
    };
    Ok(candidates.iter().any(|candidate| equals(field, candidate)))
}

fn ordered(field: Option<&Value>, bound: &Value, accept: fn(Ordering) -> bool) -> bool {
    field
        .and_then(|value| compare(value, bound))
        .is_some_and(accept)
}

// ── Updates ──────────────────────────────────────────────────────────

/// Apply an operator update in place. Returns whether `doc` changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool, CoreError> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(CoreError::Driver {
            message: "update document requires atomic operators".to_owned(),
            code: Some(FAILED_TO_PARSE),
        });
    }

    // Work on a copy so a failing operator leaves `doc` untouched.
    let mut next = doc.clone();
    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(bad_value(format!("{op} needs an object")));
        };
        for (path, arg) in fields {
            match op.as_str() {
                "$set" => set_path(&mut next, path, arg.clone())?,
                "$unset" => remove_path(&mut next, path),
                "$inc" => increment(&mut next, path, arg)?,
                "$push" => push(&mut next, path, arg)?,
                other => return Err(bad_value(format!("unknown update operator: {other}"))),
            }
        }
    }
    let changed = next != *doc;
    *doc = next;
    Ok(changed)
}

fn increment(doc: &mut Document, path: &str, by: &Value) -> Result<(), CoreError> {
    let Value::Number(by) = by else {
        return Err(bad_value(format!("cannot $inc '{path}' by a non-number")));
    };
    let next = match lookup(doc, path) {
        None => Value::Number(by.clone()),
        Some(Value::Number(current)) => match (current.as_i64(), by.as_i64()) {
            (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
            _ => Value::from(current.as_f64().unwrap_or_default() + by.as_f64().unwrap_or_default()),
        },
        Some(_) => return Err(bad_value(format!("cannot $inc non-numeric field '{path}'"))),
    };
    set_path(doc, path, next)
}

fn push(doc: &mut Document, path: &str, item: &Value) -> Result<(), CoreError> {
    let mut items = match lookup(doc, path) {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(bad_value(format!("cannot $push to non-array field '{path}'"))),
    };
    items.push(item.clone());
    set_path(doc, path, Value::Array(items))
}

/// Seed document for an upsert: the plain equality fields of the filter.
pub fn upsert_seed(filter: &Document) -> Result<Document, CoreError> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') || is_operator_object(value) {
            continue;
        }
        set_path(&mut seed, key, value.clone())?;
    }
    Ok(seed)
}

// ── Sorting and projection ───────────────────────────────────────────

/// Order two documents by a `{field: 1 | -1, ...}` specification.
/// Missing fields sort first.
pub fn compare_by(spec: &Document, a: &Document, b: &Document) -> Ordering {
    for (path, direction) in spec {
        let ordering = match (lookup(a, path), lookup(b, path)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
        };
        let ordering = if direction.as_i64().unwrap_or(1) < 0 {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Stable sort by a `{field: 1 | -1, ...}` specification.
pub fn sort(docs: &mut [Document], spec: &Document) {
    docs.sort_by(|a, b| compare_by(spec, a, b));
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Apply an inclusion or exclusion projection to top-level fields.
pub fn project(doc: &Document, projection: &Document) -> Document {
    let include_id = projection.get("_id").is_none_or(truthy);
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && truthy(value));

    if inclusive {
        doc.iter()
            .filter(|(key, _)| {
                if key.as_str() == "_id" {
                    include_id
                } else {
                    projection.get(key.as_str()).is_some_and(truthy)
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        doc.iter()
            .filter(|(key, _)| !projection.contains_key(key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
