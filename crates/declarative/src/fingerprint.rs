//! Content fingerprints for configuration records
//!
//! A fingerprint is the first 16 hex characters of a BLAKE3 digest over a
//! canonical JSON rendering of the record: object keys sorted at every
//! level, keys starting with `_` dropped at every level, references sorted
//! and de-duplicated. Equal fingerprints are the only signal for "no change".

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::types::ConfigRecord;

/// Hex characters kept from the record digest
pub const FINGERPRINT_LEN: usize = 16;

/// Hex characters kept for per-field digests
const FIELD_DIGEST_LEN: usize = 12;

/// Fingerprint a configuration record
pub fn fingerprint(record: &ConfigRecord) -> String {
    let doc = serde_json::json!({
        "kind": record.kind.as_str(),
        "name": record.name,
        "fields": strip_annotations(&record.fields),
        "references": record.reference_set(),
    });

    digest(&canonical_json(&doc), FINGERPRINT_LEN)
}

/// Fingerprint an arbitrary JSON value (e.g. a remote payload)
pub fn fingerprint_value(value: &Value) -> String {
    digest(&canonical_json(value), FINGERPRINT_LEN)
}

/// Per-leaf digests keyed by dotted path
///
/// Nested objects are flattened; arrays and scalars are leaves. References
/// appear under the `references` path.
pub fn field_fingerprints(record: &ConfigRecord) -> BTreeMap<String, String> {
    field_values(record)
        .into_iter()
        .map(|(path, value)| {
            let hash = digest(&canonical_json(&value), FIELD_DIGEST_LEN);
            (path, hash)
        })
        .collect()
}

/// Flattened leaf values of a record, keyed like [`field_fingerprints`]
pub(crate) fn field_values(record: &ConfigRecord) -> BTreeMap<String, Value> {
    let mut leaves = BTreeMap::new();
    for (key, value) in &strip_annotations(&record.fields) {
        flatten(key, value, &mut leaves);
    }
    if !record.references.is_empty() {
        leaves.insert(
            "references".to_string(),
            Value::from(record.reference_set()),
        );
    }
    leaves
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten(&format!("{prefix}.{key}"), child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Copy of `fields` without annotation keys (`_`-prefixed) at any depth
///
/// Annotations never affect change detection and are never sent remotely.
pub fn strip_annotations<'a>(
    fields: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Map<String, Value> {
    fields
        .into_iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), strip_value(value)))
        .collect()
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_annotations(map)),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}

/// Serialize with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub(crate) fn digest(input: &str, len: usize) -> String {
    let hash = blake3::hash(input.as_bytes());
    hash.to_hex().as_str()[..len].to_string()
}
