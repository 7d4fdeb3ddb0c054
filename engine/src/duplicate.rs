//! Commit-time duplication strategy: how a record's copy treats the
//! dependencies of the original.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use folio_core::content::{ContentId, ContentLinks, ContentRecord, LinkCategory, WorkflowStep};

use crate::access::AccessOracle;
use crate::error::EngineResult;
use crate::snapshot::copy_meta_filtered;
use crate::store::{ContentStore, NewRecord};

const COPY_TITLE_SUFFIX: &str = " (copy)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateOptions {
    /// Duplicate direct dependencies and link the copy to the new ids.
    /// Only one level deep: dependencies of dependencies are never copied.
    /// Ignored while `preserve_links` is set.
    #[serde(default)]
    pub include_dependencies: bool,
    /// Keep the copy's links pointing at the same dependency ids as the
    /// source. Wins over `include_dependencies`.
    #[serde(default = "default_true")]
    pub preserve_links: bool,
    /// Copy metadata and taxonomy terms (minus the reserved denylist).
    #[serde(default = "default_true")]
    pub copy_meta: bool,
    /// Force the copy back to draft instead of keeping the source step.
    #[serde(default = "default_true")]
    pub reset_step: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DuplicateOptions {
    fn default() -> Self {
        Self {
            include_dependencies: false,
            preserve_links: true,
            copy_meta: true,
            reset_step: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateOutcome {
    pub new_id: ContentId,
    /// Source dependency id → copy id, for the `include_dependencies` mode.
    pub dependency_copies: BTreeMap<ContentId, ContentId>,
}

/// Duplicate `source` for `actor` according to the relink strategy.
///
/// Dependencies that are invisible to the actor (or dangling) are dropped
/// from the copy's links rather than leaked; visibility of the source
/// itself is the caller's commit-time check.
pub fn duplicate_record(
    store: &dyn ContentStore,
    access: &dyn AccessOracle,
    actor: Uuid,
    source: &ContentRecord,
    options: &DuplicateOptions,
) -> EngineResult<DuplicateOutcome> {
    let mut dependency_copies: BTreeMap<ContentId, ContentId> = BTreeMap::new();

    let links = if options.preserve_links {
        source.links.clone()
    } else if options.include_dependencies {
        let mut relinked = ContentLinks::default();
        for category in LinkCategory::ALL {
            for dep_id in source.links.category(category) {
                if let Some(copy_id) =
                    copy_dependency(store, access, actor, *dep_id, options, &mut dependency_copies)
                {
                    relinked.category_mut(category).push(copy_id);
                }
            }
        }
        relinked
    } else {
        ContentLinks::default()
    };

    let mut meta = if options.copy_meta {
        copy_meta_filtered(&source.meta)
    } else {
        BTreeMap::new()
    };
    meta.insert("origin_chain".to_string(), json!(source.id.to_string()));

    let new_id = store.insert(NewRecord {
        kind: source.kind,
        title: format!("{}{}", source.title, COPY_TITLE_SUFFIX),
        body: source.body.clone(),
        space_id: source.space_id,
        owner_id: actor,
        workflow_step: copy_step(source.workflow_step, options),
        links,
        meta,
        terms: if options.copy_meta {
            source.terms.clone()
        } else {
            Vec::new()
        },
    });

    Ok(DuplicateOutcome {
        new_id,
        dependency_copies,
    })
}

/// Copy one direct dependency, at most once per source id even when it is
/// referenced from several categories. The copy keeps the dependency's own
/// links as-is; nothing deeper is duplicated.
fn copy_dependency(
    store: &dyn ContentStore,
    access: &dyn AccessOracle,
    actor: Uuid,
    dep_id: ContentId,
    options: &DuplicateOptions,
    dependency_copies: &mut BTreeMap<ContentId, ContentId>,
) -> Option<ContentId> {
    if let Some(existing) = dependency_copies.get(&dep_id) {
        return Some(*existing);
    }
    let dep = store.get(dep_id)?;
    if !access.can_see(actor, &dep) {
        return None;
    }

    let mut meta = if options.copy_meta {
        copy_meta_filtered(&dep.meta)
    } else {
        BTreeMap::new()
    };
    meta.insert("origin_chain".to_string(), json!(dep.id.to_string()));

    let copy_id = store.insert(NewRecord {
        kind: dep.kind,
        title: format!("{}{}", dep.title, COPY_TITLE_SUFFIX),
        body: dep.body.clone(),
        space_id: dep.space_id,
        owner_id: actor,
        workflow_step: copy_step(dep.workflow_step, options),
        links: dep.links.clone(),
        meta,
        terms: if options.copy_meta {
            dep.terms.clone()
        } else {
            Vec::new()
        },
    });
    dependency_copies.insert(dep_id, copy_id);
    Some(copy_id)
}

fn copy_step(source_step: WorkflowStep, options: &DuplicateOptions) -> WorkflowStep {
    if options.reset_step {
        WorkflowStep::Draft
    } else {
        source_step
    }
}
