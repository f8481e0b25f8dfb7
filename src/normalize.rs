//! Migration of legacy vCon documents to the current schema.
//!
//! [`normalize`] is pure and total. Rewrites are applied in a fixed order:
//!
//! 1. The `vcon` version field is pinned to [`CURRENT_VCON_VERSION`].
//! 2. The legacy `"text"` encoding becomes `"none"` in every sub-entry of
//!    `dialog`, `analysis` and `attachments`.
//! 3. A sub-entry body that is present but not a string is serialized to a
//!    JSON string. Its encoding becomes `"json"` unless an explicit encoding
//!    other than `"none"` is already set; `"none"` next to a structured body
//!    is contradictory and is corrected to `"json"`.
//!
//! Anything the rules do not cover (unknown encodings, entries that are not
//! objects, a missing `uuid`) passes through untouched and is rejected later
//! by [`NormalizedDocument::to_vcon`].

use serde_json::{Map, Value};

use crate::models::{NormalizedDocument, RawDocument, CURRENT_VCON_VERSION};

const SUB_ARRAYS: &[&str] = &["dialog", "analysis", "attachments"];

const LEGACY_TEXT_ENCODING: &str = "text";
const PLAIN_TEXT_ENCODING: &str = "none";
const STRUCTURED_ENCODING: &str = "json";

pub fn normalize(raw: RawDocument) -> NormalizedDocument {
    let mut value = raw.0;
    let mut migrated = false;

    if let Some(doc) = value.as_object_mut() {
        migrated |= pin_version(doc);

        for key in SUB_ARRAYS {
            let Some(Value::Array(entries)) = doc.get_mut(*key) else {
                continue;
            };
            for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
                migrated |= rewrite_legacy_encoding(entry);
                migrated |= stringify_body(entry);
            }
        }
    }

    NormalizedDocument { value, migrated }
}

/// Returns true when the version had to change. Besides the legacy tags
/// (`0.0.1`, `0.1.0`, `0.2.0`) this also pins missing and unknown versions.
fn pin_version(doc: &mut Map<String, Value>) -> bool {
    match doc.get("vcon").and_then(Value::as_str) {
        Some(CURRENT_VCON_VERSION) => false,
        _ => {
            doc.insert(
                "vcon".to_string(),
                Value::String(CURRENT_VCON_VERSION.to_string()),
            );
            true
        }
    }
}

fn rewrite_legacy_encoding(entry: &mut Map<String, Value>) -> bool {
    if entry.get("encoding").and_then(Value::as_str) != Some(LEGACY_TEXT_ENCODING) {
        return false;
    }
    entry.insert(
        "encoding".to_string(),
        Value::String(PLAIN_TEXT_ENCODING.to_string()),
    );
    true
}

fn stringify_body(entry: &mut Map<String, Value>) -> bool {
    let serialized = match entry.get("body") {
        None | Some(Value::Null) | Some(Value::String(_)) => return false,
        Some(body) => body.to_string(),
    };
    entry.insert("body".to_string(), Value::String(serialized));

    let keep_encoding = matches!(
        entry.get("encoding").and_then(Value::as_str),
        Some(enc) if enc != PLAIN_TEXT_ENCODING
    );
    if !keep_encoding {
        entry.insert(
            "encoding".to_string(),
            Value::String(STRUCTURED_ENCODING.to_string()),
        );
    }
    true
}
