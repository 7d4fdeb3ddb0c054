//! Similarity, diff, and copy helpers used by commit-time mutation logic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use folio_core::content::{ContentRecord, LinkCategory};

/// Meta keys that never survive a copy: editor bookkeeping, provenance,
/// and rating aggregates all belong to the original record.
pub const META_COPY_DENYLIST: [&str; 5] = [
    "editor_lock",
    "editor_heartbeat",
    "origin_chain",
    "rating_count",
    "rating_avg",
];

/// Prefix for per-actor rating entries; excluded from copies as a family.
pub const RATING_BY_PREFIX: &str = "rating_by.";

/// Normalized Levenshtein similarity of two bodies, in `[0, 1]`.
/// Whitespace runs are collapsed first so formatting-only edits score as
/// identical.
pub fn content_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_body(a);
    let b = normalize_body(b);
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// SHA-256 hex digest over the normalized body. Cheap equality check
/// before paying for a similarity score.
pub fn body_fingerprint(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Field-level structural diff between two records. Bodies are compared
/// by fingerprint and reported with their similarity score instead of
/// their full text.
pub fn structural_diff(before: &ContentRecord, after: &ContentRecord) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if before.title != after.title {
        changes.push(FieldChange {
            field: "title".to_string(),
            before: json!(before.title),
            after: json!(after.title),
        });
    }
    if before.workflow_step != after.workflow_step {
        changes.push(FieldChange {
            field: "workflow_step".to_string(),
            before: json!(before.workflow_step.as_str()),
            after: json!(after.workflow_step.as_str()),
        });
    }
    let before_print = body_fingerprint(&before.body);
    let after_print = body_fingerprint(&after.body);
    if before_print != after_print {
        changes.push(FieldChange {
            field: "body".to_string(),
            before: json!({ "fingerprint": before_print }),
            after: json!({
                "fingerprint": after_print,
                "similarity": content_similarity(&before.body, &after.body),
            }),
        });
    }
    if before.terms != after.terms {
        changes.push(FieldChange {
            field: "terms".to_string(),
            before: json!(before.terms),
            after: json!(after.terms),
        });
    }
    for category in LinkCategory::ALL {
        let b = before.links.category(category);
        let a = after.links.category(category);
        if b != a {
            changes.push(FieldChange {
                field: format!("links.{}", category.as_str()),
                before: json!(b),
                after: json!(a),
            });
        }
    }

    changes
}

/// Copy a meta map minus the denylist and the per-actor rating family.
pub fn copy_meta_filtered(meta: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    meta.iter()
        .filter(|(key, _)| {
            !META_COPY_DENYLIST.contains(&key.as_str()) && !key.starts_with(RATING_BY_PREFIX)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
