//! Encrypt and decrypt the PII fields of JSON records.
//!
//! Paths use dot notation; a `[]` suffix expands every element of an array,
//! e.g. `contacts[].email`. Every string leaf on the configured paths goes
//! through a single facade batch, so a record is either fully transformed or
//! left untouched. Missing paths and non-string leaves are skipped.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use crate::error::VaultError;
use crate::facade::EncryptionFacade;
use crate::session::SessionContext;

/// Set of dot-notation paths naming PII fields.
pub type PiiFieldPaths = BTreeSet<String>;

/// PII fields of the customer record.
pub const DEFAULT_PII_FIELDS: &[&str] = &["fiscal_code", "first_name", "last_name", "email", "phone"];

/// The default customer PII paths.
pub fn default_pii_fields() -> PiiFieldPaths {
    DEFAULT_PII_FIELDS.iter().map(|&p| p.to_owned()).collect()
}

/// Parse a comma-separated path list, ignoring blank entries.
pub fn parse_pii_fields(list: &str) -> PiiFieldPaths {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Encrypt every PII string in `record` in place.
///
/// Returns the number of fields encrypted.
pub fn encrypt_record(
    facade: &EncryptionFacade,
    ctx: &mut SessionContext,
    tenant_id: &str,
    record: &mut Value,
    paths: &PiiFieldPaths,
) -> Result<usize, VaultError> {
    let leaves = collect_leaves(record, paths);
    let sealed = facade.encrypt_fields(ctx, tenant_id, leaves)?;
    let count = sealed.len();
    for (pointer, token) in sealed {
        write_back(record, &pointer, token.to_token_string());
    }
    Ok(count)
}

/// Decrypt every PII token in `record` in place, using the key for
/// `version` (the current version when `None`).
///
/// Returns the number of fields decrypted.
pub fn decrypt_record(
    facade: &EncryptionFacade,
    ctx: &mut SessionContext,
    tenant_id: &str,
    record: &mut Value,
    paths: &PiiFieldPaths,
    version: Option<u32>,
) -> Result<usize, VaultError> {
    let leaves = collect_leaves(record, paths);
    let version = version.unwrap_or_else(|| facade.current_version());
    let opened = facade.decrypt_fields_versioned(ctx, tenant_id, leaves, version)?;
    let count = opened.len();
    for (pointer, plaintext) in opened {
        write_back(record, &pointer, plaintext);
    }
    Ok(count)
}

fn write_back(record: &mut Value, pointer: &str, text: String) {
    if let Some(slot) = record.pointer_mut(pointer) {
        *slot = Value::String(text);
    }
}

/// Segments of a dot-notation PII field path.
#[derive(Debug, PartialEq, Eq)]
enum PathSegment {
    /// Navigate into an object property by name.
    Key(String),
    /// Expand into every element of a JSON array.
    ArrayItem,
}

/// `"orders[].card"` → `[Key("orders"), ArrayItem, Key("card")]`.
fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if let Some(key) = part.strip_suffix("[]") {
            segments.push(PathSegment::Key(key.to_owned()));
            segments.push(PathSegment::ArrayItem);
        } else {
            segments.push(PathSegment::Key(part.to_owned()));
        }
    }
    segments
}

/// JSON pointer and value of every string leaf on `paths`, in path order.
fn collect_leaves(record: &Value, paths: &PiiFieldPaths) -> Vec<(String, String)> {
    let mut leaves = Vec::new();
    let mut seen = HashSet::new();
    for path in paths {
        let segments = parse_path(path);
        collect_at_path(record, &segments, String::new(), &mut |pointer: String, text: &str| {
            if seen.insert(pointer.clone()) {
                leaves.push((pointer, text.to_owned()));
            }
        });
    }
    leaves
}

fn collect_at_path(
    value: &Value,
    segments: &[PathSegment],
    pointer: String,
    out: &mut dyn FnMut(String, &str),
) {
    let Some((head, rest)) = segments.split_first() else {
        if let Value::String(s) = value {
            out(pointer, s);
        }
        return;
    };

    match head {
        PathSegment::Key(key) => {
            if let Some(child) = value.as_object().and_then(|map| map.get(key)) {
                collect_at_path(child, rest, format!("{pointer}/{}", escape(key)), out);
            }
        }
        PathSegment::ArrayItem => {
            if let Value::Array(items) = value {
                for (i, item) in items.iter().enumerate() {
                    collect_at_path(item, rest, format!("{pointer}/{i}"), out);
                }
            }
        }
    }
}

/// RFC 6901 reference-token escaping.
fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
