// ── Legacy update payload normalization ──

use serde_json::Value;

use crate::driver::Document;

fn is_modifier(key: &str) -> bool {
    key.starts_with('$')
}

/// Normalize a payload for the legacy multi-document `update`.
///
/// A payload with no `$` modifier key, the empty one included, becomes
/// `{"$set": payload}`. Any other payload is forwarded unchanged, so a
/// payload mixing modifiers with plain fields reaches the driver as-is.
pub fn normalize_legacy_update(update: Document) -> Document {
    if update.keys().any(|k| is_modifier(k)) {
        return update;
    }
    let mut wrapped = Document::new();
    wrapped.insert("$set".to_owned(), Value::Object(update));
    wrapped
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn plain_fields_are_wrapped_in_set() {
        let normalized = normalize_legacy_update(doc(json!({"name": "Alice"})));
        assert_eq!(Value::Object(normalized), json!({"$set": {"name": "Alice"}}));
    }

    #[test]
    fn set_payload_passes_through() {
        let payload = doc(json!({"$set": {"name": "Alice"}}));
        assert_eq!(normalize_legacy_update(payload.clone()), payload);
    }

    #[test]
    fn other_modifiers_pass_through() {
        let payload = doc(json!({"$inc": {"count": 1}, "$unset": {"tmp": ""}}));
        assert_eq!(normalize_legacy_update(payload.clone()), payload);
    }

    #[test]
    fn mixed_payload_is_forwarded_unchanged() {
        let payload = doc(json!({"$inc": {"count": 1}, "name": "Bob"}));
        assert_eq!(normalize_legacy_update(payload.clone()), payload);
    }

    #[test]
    fn empty_payload_becomes_empty_set() {
        let normalized = normalize_legacy_update(Document::new());
        assert_eq!(Value::Object(normalized), json!({"$set": {}}));
    }
}
