//! Content-store seam. The engine treats storage as a key-indexed record
//! store with metadata and taxonomy terms; `MemoryContentStore` is the
//! reference implementation used by the MCP binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use folio_core::content::{ContentId, ContentKind, ContentLinks, ContentRecord, WorkflowStep};

/// Fields for a record about to be created. The store owns id and
/// timestamp assignment.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: ContentKind,
    pub title: String,
    pub body: String,
    pub space_id: Option<ContentId>,
    pub owner_id: Uuid,
    pub workflow_step: WorkflowStep,
    pub links: ContentLinks,
    pub meta: BTreeMap<String, Value>,
    pub terms: Vec<String>,
}

impl NewRecord {
    /// A minimal draft record; callers fill in what they need.
    pub fn draft(kind: ContentKind, title: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            kind,
            title: title.into(),
            body: String::new(),
            space_id: None,
            owner_id,
            workflow_step: WorkflowStep::Draft,
            links: ContentLinks::default(),
            meta: BTreeMap::new(),
            terms: Vec::new(),
        }
    }
}

/// Partial update of a record. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ContentPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub workflow_step: Option<WorkflowStep>,
    pub links: Option<ContentLinks>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub kind: Option<ContentKind>,
    pub space_id: Option<ContentId>,
    pub limit: Option<usize>,
}

/// Key-indexed record store with metadata and taxonomy. All mutating
/// methods return `false` when the target record does not exist; the
/// engine maps that onto its own error taxonomy.
pub trait ContentStore: Send + Sync {
    fn get(&self, id: ContentId) -> Option<ContentRecord>;
    fn insert(&self, record: NewRecord) -> ContentId;
    fn update(&self, id: ContentId, patch: ContentPatch) -> bool;
    fn set_meta(&self, id: ContentId, key: &str, value: Value) -> bool;
    fn remove_meta(&self, id: ContentId, key: &str) -> bool;
    fn attach_term(&self, id: ContentId, term: &str) -> bool;
    fn detach_term(&self, id: ContentId, term: &str) -> bool;
    /// Records matching the filter, most recently updated first.
    fn list(&self, filter: &ListFilter) -> Vec<ContentRecord>;
}

#[derive(Default)]
pub struct MemoryContentStore {
    records: Mutex<HashMap<ContentId, ContentRecord>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON array of full records (the library seed
    /// format used by the MCP binary).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let seeded: Vec<ContentRecord> = serde_json::from_str(json)?;
        let store = Self::new();
        {
            let mut records = store.records.lock().unwrap_or_else(|e| e.into_inner());
            for record in seeded {
                records.insert(record.id, record);
            }
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_record<R>(&self, id: ContentId, apply: impl FnOnce(&mut ContentRecord) -> R) -> Option<R> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.get_mut(&id)?;
        let result = apply(record);
        record.updated_at = Utc::now();
        Some(result)
    }
}

impl ContentStore for MemoryContentStore {
    fn get(&self, id: ContentId) -> Option<ContentRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn insert(&self, record: NewRecord) -> ContentId {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let stored = ContentRecord {
            id,
            kind: record.kind,
            title: record.title,
            body: record.body,
            space_id: record.space_id,
            owner_id: record.owner_id,
            workflow_step: record.workflow_step,
            links: record.links,
            meta: record.meta,
            terms: record.terms,
            created_at: now,
            updated_at: now,
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, stored);
        id
    }

    fn update(&self, id: ContentId, patch: ContentPatch) -> bool {
        self.with_record(id, |record| {
            if let Some(title) = patch.title {
                record.title = title;
            }
            if let Some(body) = patch.body {
                record.body = body;
            }
            if let Some(step) = patch.workflow_step {
                record.workflow_step = step;
            }
            if let Some(links) = patch.links {
                record.links = links;
            }
        })
        .is_some()
    }

    fn set_meta(&self, id: ContentId, key: &str, value: Value) -> bool {
        self.with_record(id, |record| {
            record.meta.insert(key.to_string(), value);
        })
        .is_some()
    }

    fn remove_meta(&self, id: ContentId, key: &str) -> bool {
        self.with_record(id, |record| {
            record.meta.remove(key);
        })
        .is_some()
    }

    fn attach_term(&self, id: ContentId, term: &str) -> bool {
        self.with_record(id, |record| {
            if !record.terms.iter().any(|t| t == term) {
                record.terms.push(term.to_string());
            }
        })
        .is_some()
    }

    fn detach_term(&self, id: ContentId, term: &str) -> bool {
        self.with_record(id, |record| {
            record.terms.retain(|t| t != term);
        })
        .is_some()
    }

    fn list(&self, filter: &ListFilter) -> Vec<ContentRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<ContentRecord> = records
            .values()
            .filter(|record| filter.kind.is_none_or(|kind| record.kind == kind))
            .filter(|record| {
                filter
                    .space_id
                    .is_none_or(|space| record.space_id == Some(space))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}
