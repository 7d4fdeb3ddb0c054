//! The staged mutation protocol: `prepare` validates intent and stages a
//! plan behind a session token; `commit` claims the session (single use),
//! re-validates permissions and shape, and only then mutates. Bootstrap
//! adds `collect` (manual slot override) and `validate` (readiness check)
//! between the two.
//!
//! Claiming happens before the commit-time checks, so a session is spent
//! the moment a commit is attempted: a mismatched or no-longer-permitted
//! commit burns the plan instead of leaving it replayable.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde_json::{Value, json};
use uuid::Uuid;

use folio_core::content::{ContentId, ContentKind, ContentLinks, ContentRecord, WorkflowStep};

use crate::access::AccessOracle;
use crate::batch::{BatchOptions, BatchOutcome, UnitFault, run_batch};
use crate::chain::{ChainEdge, ChainNode, flatten_chain, resolve_chain};
use crate::duplicate::{DuplicateOptions, duplicate_record};
use crate::error::{EngineError, EngineResult};
use crate::limits::RuntimeLimits;
use crate::session::{
    BootstrapPlan, BulkAction, BulkApplyPlan, ChainExportPlan, DuplicatePlan, OperationKind,
    PlanPayload, RatingPlan, SessionRepository,
};
use crate::snapshot::{
    META_COPY_DENYLIST, RATING_BY_PREFIX, body_fingerprint, content_similarity, structural_diff,
};
use crate::store::{ContentStore, ListFilter, NewRecord};

const NEAR_DUPLICATE_THRESHOLD: f64 = 0.85;
const NEAR_DUPLICATE_MAX_ITEMS: usize = 5;
const NEAR_DUPLICATE_SCAN_LIMIT: usize = 50;
const MAX_COMMENT_CHARS: usize = 2000;
const PREVIEW_SAMPLE_TARGETS: usize = 5;

/// Bootstrap slots and the record kind each one accepts.
const BOOTSTRAP_SLOTS: [(&str, ContentKind); 3] = [
    ("style", ContentKind::Style),
    ("template", ContentKind::Template),
    ("landing", ContentKind::Fragment),
];
const REQUIRED_BOOTSTRAP_SLOTS: [&str; 2] = ["style", "template"];

static TERM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static pattern compiles"));

#[derive(Debug, Clone)]
pub struct PreparedStage {
    pub session_id: String,
    pub expires_in_seconds: i64,
    pub preview: Value,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub success: bool,
    pub summary: Value,
    pub batch: Option<BatchOutcome>,
}

pub struct StageOrchestrator {
    store: Arc<dyn ContentStore>,
    access: Arc<dyn AccessOracle>,
    sessions: Arc<dyn SessionRepository>,
    limits: RuntimeLimits,
}

impl StageOrchestrator {
    pub fn new(
        store: Arc<dyn ContentStore>,
        access: Arc<dyn AccessOracle>,
        sessions: Arc<dyn SessionRepository>,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            store,
            access,
            sessions,
            limits,
        }
    }

    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }

    /// Fetch a record the actor may read. Missing and forbidden are the
    /// same answer.
    fn visible_record(&self, actor: Uuid, id: ContentId) -> EngineResult<ContentRecord> {
        let record = self.store.get(id).ok_or(EngineError::AccessDenied)?;
        if !self.access.can_see(actor, &record) {
            return Err(EngineError::AccessDenied);
        }
        Ok(record)
    }

    // ---- duplicate ----------------------------------------------------

    pub fn prepare_duplicate(
        &self,
        actor: Uuid,
        source_id: ContentId,
        options: DuplicateOptions,
    ) -> EngineResult<PreparedStage> {
        let source = self.visible_record(actor, source_id)?;
        let preview = json!({
            "source": record_summary(&source),
            "dependencies": {
                "styles": source.links.styles.len(),
                "contents": source.links.contents.len(),
                "linked": source.links.linked.len(),
            },
            "options": options,
            "near_duplicates": self.near_duplicates(actor, &source),
        });
        let session = self.sessions.put(
            actor,
            PlanPayload::Duplicate(DuplicatePlan { source_id, options }),
            self.limits.session_ttl_secs,
        );
        tracing::debug!(session_id = %session.session_id, source_id = %source_id, "duplicate plan staged");
        Ok(PreparedStage {
            expires_in_seconds: session.expires_in_seconds(),
            session_id: session.session_id,
            preview,
        })
    }

    pub fn commit_duplicate(
        &self,
        actor: Uuid,
        session_id: &str,
        source_id: ContentId,
    ) -> EngineResult<CommitOutcome> {
        let plan = self
            .sessions
            .claim(session_id, OperationKind::Duplicate, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::Duplicate(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };
        if plan.source_id != source_id {
            return Err(EngineError::session_mismatch(
                "session was prepared for a different source record",
            ));
        }

        let source = self.visible_record(actor, source_id)?;
        if !self.access.can_publish(actor, source.space_id) {
            return Err(EngineError::AccessDenied);
        }

        let outcome =
            duplicate_record(self.store.as_ref(), self.access.as_ref(), actor, &source, &plan.options)?;
        let copy = self
            .store
            .get(outcome.new_id)
            .ok_or_else(|| EngineError::Execution("copy vanished after insert".to_string()))?;
        tracing::info!(
            source_id = %source_id,
            new_id = %outcome.new_id,
            dependency_copies = outcome.dependency_copies.len(),
            "record duplicated"
        );
        Ok(CommitOutcome {
            success: true,
            summary: json!({
                "new_id": outcome.new_id,
                "dependency_copies": outcome.dependency_copies,
                "changes": structural_diff(&source, &copy),
            }),
            batch: None,
        })
    }

    /// Visible records of the same kind in the same space whose bodies are
    /// close to the source's. Advisory only; capped scan.
    fn near_duplicates(&self, actor: Uuid, source: &ContentRecord) -> Vec<Value> {
        let candidates = self.store.list(&ListFilter {
            kind: Some(source.kind),
            space_id: source.space_id,
            limit: Some(NEAR_DUPLICATE_SCAN_LIMIT),
        });
        let source_print = body_fingerprint(&source.body);
        let visible: Vec<ContentRecord> = candidates
            .into_iter()
            .filter(|candidate| candidate.id != source.id)
            .filter(|candidate| self.access.can_see(actor, candidate))
            .collect();
        let mut close: Vec<(f64, &ContentRecord)> = Vec::new();
        for candidate in &visible {
            let similarity = if body_fingerprint(&candidate.body) == source_print {
                1.0
            } else {
                content_similarity(&source.body, &candidate.body)
            };
            if similarity >= NEAR_DUPLICATE_THRESHOLD {
                close.push((similarity, candidate));
            }
        }
        close.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        close
            .into_iter()
            .take(NEAR_DUPLICATE_MAX_ITEMS)
            .map(|(similarity, record)| {
                json!({
                    "id": record.id,
                    "title": record.title,
                    "similarity": round_to_two(similarity),
                })
            })
            .collect()
    }

    // ---- bulk apply ----------------------------------------------------

    pub fn prepare_bulk(
        &self,
        actor: Uuid,
        target_ids: Vec<ContentId>,
        action: BulkAction,
        options: BatchOptions,
    ) -> EngineResult<PreparedStage> {
        if target_ids.is_empty() {
            return Err(EngineError::validation_field(
                "'target_ids' must not be empty",
                "target_ids",
            ));
        }
        if target_ids.len() > self.limits.bulk_ceiling {
            return Err(EngineError::BulkLimitExceeded {
                requested: target_ids.len(),
                ceiling: self.limits.bulk_ceiling,
            });
        }
        validate_bulk_action(&action)?;

        let preview = json!({
            "target_count": target_ids.len(),
            "action": action.describe(),
            "options": options,
            "sample_targets": target_ids.iter().take(PREVIEW_SAMPLE_TARGETS).collect::<Vec<_>>(),
        });
        let session = self.sessions.put(
            actor,
            PlanPayload::BulkApply(BulkApplyPlan {
                target_ids,
                action,
                options,
            }),
            self.limits.session_ttl_secs,
        );
        tracing::debug!(session_id = %session.session_id, "bulk plan staged");
        Ok(PreparedStage {
            expires_in_seconds: session.expires_in_seconds(),
            session_id: session.session_id,
            preview,
        })
    }

    pub async fn commit_bulk(&self, actor: Uuid, session_id: &str) -> EngineResult<CommitOutcome> {
        let plan = self
            .sessions
            .claim(session_id, OperationKind::BulkApply, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::BulkApply(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };

        let store = self.store.clone();
        let access = self.access.clone();
        let action = plan.action.clone();
        let outcome = run_batch(&plan.target_ids, &plan.options, move |id| {
            let store = store.clone();
            let access = access.clone();
            let action = action.clone();
            async move { apply_bulk_action(store.as_ref(), access.as_ref(), actor, id, &action) }
        })
        .await;

        tracing::info!(
            action = %plan.action.describe(),
            success = outcome.success.len(),
            failed = outcome.failed.len(),
            skipped = outcome.skipped.len(),
            dry_run = outcome.dry_run,
            "bulk apply committed"
        );
        Ok(CommitOutcome {
            success: outcome.failed.is_empty(),
            summary: json!({
                "action": plan.action.describe(),
                "success_count": outcome.success.len(),
                "failed_count": outcome.failed.len(),
                "skipped_count": outcome.skipped.len(),
                "dry_run": outcome.dry_run,
                "elapsed_ms": outcome.elapsed_ms,
            }),
            batch: Some(outcome),
        })
    }

    // ---- chain export ---------------------------------------------------

    pub fn prepare_chain_export(
        &self,
        actor: Uuid,
        root_id: ContentId,
        requested_depth: Option<u32>,
        include_content: bool,
        flat: bool,
    ) -> EngineResult<PreparedStage> {
        let max_depth = requested_depth
            .unwrap_or(self.limits.max_chain_depth)
            .min(self.limits.max_chain_depth);
        // Preview resolution runs without bodies; commit re-resolves with
        // the requested content flag and fresh permission answers.
        let resolution = resolve_chain(
            self.store.as_ref(),
            self.access.as_ref(),
            actor,
            root_id,
            max_depth,
            self.limits.max_chain_depth,
            false,
        )?;

        let preview = json!({
            "root": {
                "id": resolution.root.id,
                "title": resolution.root.title,
                "kind": resolution.root.kind.as_str(),
            },
            "node_count": resolution.visited.len(),
            "circular_ref_count": resolution.circular_refs.len(),
            "access_denied_count": count_denied_edges(&resolution.root),
            "max_depth": max_depth,
            "format": if flat { "flat" } else { "tree" },
            "include_content": include_content,
        });
        let session = self.sessions.put(
            actor,
            PlanPayload::ChainExport(ChainExportPlan {
                root_id,
                max_depth,
                include_content,
                flat,
            }),
            self.limits.session_ttl_secs,
        );
        tracing::debug!(session_id = %session.session_id, root_id = %root_id, "chain export staged");
        Ok(PreparedStage {
            expires_in_seconds: session.expires_in_seconds(),
            session_id: session.session_id,
            preview,
        })
    }

    pub fn commit_chain_export(
        &self,
        actor: Uuid,
        session_id: &str,
        root_id: ContentId,
    ) -> EngineResult<CommitOutcome> {
        let plan = self
            .sessions
            .claim(session_id, OperationKind::ChainExport, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::ChainExport(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };
        if plan.root_id != root_id {
            return Err(EngineError::session_mismatch(
                "session was prepared for a different root record",
            ));
        }

        let resolution = resolve_chain(
            self.store.as_ref(),
            self.access.as_ref(),
            actor,
            root_id,
            plan.max_depth,
            self.limits.max_chain_depth,
            plan.include_content,
        )?;
        let document = if plan.flat {
            json!(flatten_chain(&resolution))
        } else {
            json!(resolution.root)
        };
        tracing::info!(
            root_id = %root_id,
            node_count = resolution.visited.len(),
            "chain exported"
        );
        Ok(CommitOutcome {
            success: true,
            summary: json!({
                "format": if plan.flat { "flat" } else { "tree" },
                "node_count": resolution.visited.len(),
                "circular_refs": resolution.circular_refs,
                "document": document,
            }),
            batch: None,
        })
    }

    // ---- rating ---------------------------------------------------------

    pub fn prepare_rating(
        &self,
        actor: Uuid,
        target_id: ContentId,
        score: u8,
        comment: Option<String>,
    ) -> EngineResult<PreparedStage> {
        if !(1..=5).contains(&score) {
            return Err(EngineError::validation_field(
                "'score' must be between 1 and 5",
                "score",
            ));
        }
        if let Some(text) = &comment {
            if text.chars().count() > MAX_COMMENT_CHARS {
                return Err(EngineError::validation_field(
                    format!("'comment' must be at most {MAX_COMMENT_CHARS} characters"),
                    "comment",
                ));
            }
        }
        let target = self.visible_record(actor, target_id)?;
        let (count, average) = rating_aggregate(&target.meta);
        let preview = json!({
            "target": record_summary(&target),
            "score": score,
            "comment": comment,
            "current": { "rating_count": count, "rating_avg": average },
        });
        let session = self.sessions.put(
            actor,
            PlanPayload::Rating(RatingPlan {
                target_id,
                score,
                comment,
            }),
            self.limits.session_ttl_secs,
        );
        tracing::debug!(session_id = %session.session_id, target_id = %target_id, "rating staged");
        Ok(PreparedStage {
            expires_in_seconds: session.expires_in_seconds(),
            session_id: session.session_id,
            preview,
        })
    }

    pub fn commit_rating(
        &self,
        actor: Uuid,
        session_id: &str,
        target_id: ContentId,
    ) -> EngineResult<CommitOutcome> {
        let plan = self
            .sessions
            .claim(session_id, OperationKind::Rating, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::Rating(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };
        if plan.target_id != target_id {
            return Err(EngineError::session_mismatch(
                "session was prepared for a different target record",
            ));
        }

        let target = self.visible_record(actor, target_id)?;
        let (previous_count, previous_avg) = rating_aggregate(&target.meta);

        let entry = json!({
            "score": plan.score,
            "comment": plan.comment,
            "rated_at": Utc::now(),
        });
        if !self
            .store
            .set_meta(target_id, &format!("{RATING_BY_PREFIX}{actor}"), entry)
        {
            return Err(EngineError::Execution(
                "target vanished while rating".to_string(),
            ));
        }
        let refreshed = self
            .store
            .get(target_id)
            .ok_or_else(|| EngineError::Execution("target vanished while rating".to_string()))?;
        let (count, average) = rating_aggregate(&refreshed.meta);
        self.store.set_meta(target_id, "rating_count", json!(count));
        self.store.set_meta(target_id, "rating_avg", json!(average));

        tracing::info!(target_id = %target_id, score = plan.score, "rating committed");
        Ok(CommitOutcome {
            success: true,
            summary: json!({
                "rating_count": count,
                "rating_avg": average,
                "previous": { "rating_count": previous_count, "rating_avg": previous_avg },
            }),
            batch: None,
        })
    }

    // ---- bootstrap --------------------------------------------------------

    pub fn prepare_bootstrap(
        &self,
        actor: Uuid,
        space_id: ContentId,
        title: &str,
    ) -> EngineResult<PreparedStage> {
        if title.trim().is_empty() {
            return Err(EngineError::validation_field(
                "'title' must not be empty",
                "title",
            ));
        }
        let space = self.visible_record(actor, space_id)?;
        if space.kind != ContentKind::Space {
            return Err(EngineError::validation_field(
                "'space_id' must reference a space",
                "space_id",
            ));
        }
        if !self.access.can_publish(actor, Some(space_id)) {
            return Err(EngineError::AccessDenied);
        }

        let mut slots: BTreeMap<String, Option<ContentId>> = BTreeMap::new();
        for (name, kind) in BOOTSTRAP_SLOTS {
            let pick = self
                .store
                .list(&ListFilter {
                    kind: Some(kind),
                    space_id: Some(space_id),
                    limit: None,
                })
                .into_iter()
                .find(|candidate| self.access.can_see(actor, candidate))
                .map(|record| record.id);
            slots.insert(name.to_string(), pick);
        }

        let plan = BootstrapPlan {
            space_id,
            title: title.trim().to_string(),
            slots,
        };
        let preview = self.bootstrap_preview(actor, &plan, &space);
        let session = self.sessions.put(
            actor,
            PlanPayload::Bootstrap(plan),
            self.limits.session_ttl_secs,
        );
        tracing::debug!(session_id = %session.session_id, space_id = %space_id, "bootstrap staged");
        Ok(PreparedStage {
            expires_in_seconds: session.expires_in_seconds(),
            session_id: session.session_id,
            preview,
        })
    }

    /// Manual override of one auto-selected slot. The only path that
    /// renews a session's TTL; the stage stays `prepared`.
    pub fn collect_bootstrap(
        &self,
        actor: Uuid,
        session_id: &str,
        slot: &str,
        item_id: ContentId,
    ) -> EngineResult<PreparedStage> {
        let plan = self
            .sessions
            .get(session_id, OperationKind::Bootstrap, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::Bootstrap(mut plan) = plan else {
            return Err(EngineError::SessionExpired);
        };

        let Some(expected_kind) = slot_kind(slot) else {
            return Err(EngineError::validation_field(
                format!("unknown slot '{slot}'; expected one of style, template, landing"),
                "slot",
            ));
        };
        let record = self.visible_record(actor, item_id)?;
        if record.kind != expected_kind {
            return Err(EngineError::validation_field(
                format!(
                    "slot '{slot}' requires a {} record, got {}",
                    expected_kind.as_str(),
                    record.kind.as_str()
                ),
                "item_id",
            ));
        }

        plan.slots.insert(slot.to_string(), Some(item_id));
        let space = self.visible_record(actor, plan.space_id)?;
        let preview = self.bootstrap_preview(actor, &plan, &space);
        let renewed = self
            .sessions
            .renew(
                session_id,
                OperationKind::Bootstrap,
                actor,
                PlanPayload::Bootstrap(plan),
                self.limits.session_ttl_secs,
            )
            .ok_or(EngineError::SessionExpired)?;
        tracing::debug!(session_id = %session_id, slot = %slot, "bootstrap slot collected");
        Ok(PreparedStage {
            expires_in_seconds: renewed.expires_in_seconds(),
            session_id: renewed.session_id,
            preview,
        })
    }

    /// Read-only readiness summary. Touches neither the plan nor the TTL.
    pub fn validate_bootstrap(&self, actor: Uuid, session_id: &str) -> EngineResult<Value> {
        let plan = self
            .sessions
            .get(session_id, OperationKind::Bootstrap, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::Bootstrap(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };
        Ok(bootstrap_readiness(&plan))
    }

    pub fn commit_bootstrap(&self, actor: Uuid, session_id: &str) -> EngineResult<CommitOutcome> {
        let plan = self
            .sessions
            .claim(session_id, OperationKind::Bootstrap, actor)
            .ok_or(EngineError::SessionExpired)?;
        let PlanPayload::Bootstrap(plan) = plan else {
            return Err(EngineError::SessionExpired);
        };

        for required in REQUIRED_BOOTSTRAP_SLOTS {
            if !matches!(plan.slots.get(required), Some(Some(_))) {
                return Err(EngineError::validation_field(
                    format!("slot '{required}' is unresolved; collect a record for it first"),
                    "slots",
                ));
            }
        }
        if !self.access.can_publish(actor, Some(plan.space_id)) {
            return Err(EngineError::AccessDenied);
        }

        // Re-check every resolved component: selections made at prepare
        // time may have drifted out of sight since.
        let mut links = ContentLinks::default();
        for (name, kind) in BOOTSTRAP_SLOTS {
            let Some(Some(item_id)) = plan.slots.get(name) else {
                continue;
            };
            let record = self.visible_record(actor, *item_id)?;
            if record.kind != kind {
                return Err(EngineError::validation_field(
                    format!("slot '{name}' no longer references a {} record", kind.as_str()),
                    "slots",
                ));
            }
            match name {
                "style" => links.styles.push(*item_id),
                "landing" => links.contents.push(*item_id),
                _ => links.linked.push(*item_id),
            }
        }

        let mut meta = BTreeMap::new();
        meta.insert("blueprint".to_string(), json!("starter"));
        let new_id = self.store.insert(NewRecord {
            kind: ContentKind::Publication,
            title: plan.title.clone(),
            body: String::new(),
            space_id: Some(plan.space_id),
            owner_id: actor,
            workflow_step: WorkflowStep::Draft,
            links,
            meta,
            terms: Vec::new(),
        });

        tracing::info!(new_id = %new_id, space_id = %plan.space_id, "bootstrap committed");
        Ok(CommitOutcome {
            success: true,
            summary: json!({
                "new_id": new_id,
                "title": plan.title,
                "slots": plan.slots,
            }),
            batch: None,
        })
    }

    fn bootstrap_preview(&self, actor: Uuid, plan: &BootstrapPlan, space: &ContentRecord) -> Value {
        let mut slot_views = serde_json::Map::new();
        for (name, selection) in &plan.slots {
            let view = selection
                .and_then(|id| self.store.get(id))
                .filter(|record| self.access.can_see(actor, record))
                .map(|record| record_summary(&record))
                .unwrap_or(Value::Null);
            slot_views.insert(name.clone(), view);
        }
        json!({
            "space": record_summary(space),
            "title": plan.title,
            "slots": Value::Object(slot_views),
            "readiness": bootstrap_readiness(plan),
        })
    }
}

fn record_summary(record: &ContentRecord) -> Value {
    json!({
        "id": record.id,
        "kind": record.kind.as_str(),
        "title": record.title,
        "workflow_step": record.workflow_step.as_str(),
        "excerpt": record.excerpt(),
    })
}

fn slot_kind(slot: &str) -> Option<ContentKind> {
    BOOTSTRAP_SLOTS
        .iter()
        .find(|(name, _)| *name == slot)
        .map(|(_, kind)| *kind)
}

fn bootstrap_readiness(plan: &BootstrapPlan) -> Value {
    let resolved: Vec<&str> = plan
        .slots
        .iter()
        .filter(|(_, selection)| selection.is_some())
        .map(|(name, _)| name.as_str())
        .collect();
    let missing: Vec<&str> = plan
        .slots
        .iter()
        .filter(|(_, selection)| selection.is_none())
        .map(|(name, _)| name.as_str())
        .collect();
    let ready = REQUIRED_BOOTSTRAP_SLOTS
        .iter()
        .all(|required| matches!(plan.slots.get(*required), Some(Some(_))));
    json!({
        "resolved": resolved,
        "missing": missing,
        "required": REQUIRED_BOOTSTRAP_SLOTS,
        "ready": ready,
    })
}

fn validate_bulk_action(action: &BulkAction) -> EngineResult<()> {
    match action {
        BulkAction::SetWorkflowStep { .. } => Ok(()),
        BulkAction::AttachTerm { term } | BulkAction::DetachTerm { term } => {
            if TERM_RE.is_match(term) {
                Ok(())
            } else {
                Err(EngineError::validation_field(
                    "terms must be lowercase slugs (letters, digits, '-', '_', max 64 chars)",
                    "term",
                ))
            }
        }
        BulkAction::SetMeta { key, .. } => {
            if key.trim().is_empty() {
                return Err(EngineError::validation_field(
                    "'key' must not be empty",
                    "key",
                ));
            }
            if META_COPY_DENYLIST.contains(&key.as_str()) || key.starts_with(RATING_BY_PREFIX) {
                return Err(EngineError::validation_field(
                    format!("meta key '{key}' is reserved"),
                    "key",
                ));
            }
            Ok(())
        }
    }
}

/// One bulk unit of work. Per-item permission failures come back as
/// `Failed` (data in the outcome), storage surprises as `Exception`.
fn apply_bulk_action(
    store: &dyn ContentStore,
    access: &dyn AccessOracle,
    actor: Uuid,
    id: ContentId,
    action: &BulkAction,
) -> Result<Option<String>, UnitFault> {
    let record = store
        .get(id)
        .ok_or_else(|| UnitFault::Failed("access_denied".to_string()))?;
    if !access.can_see(actor, &record) {
        return Err(UnitFault::Failed("access_denied".to_string()));
    }

    let applied = match action {
        BulkAction::SetWorkflowStep { step } => store.update(
            id,
            crate::store::ContentPatch {
                workflow_step: Some(*step),
                ..Default::default()
            },
        ),
        BulkAction::AttachTerm { term } => store.attach_term(id, term),
        BulkAction::DetachTerm { term } => store.detach_term(id, term),
        BulkAction::SetMeta { key, value } => store.set_meta(id, key, value.clone()),
    };
    if applied {
        Ok(Some(action.describe()))
    } else {
        Err(UnitFault::Exception(
            "record vanished mid-batch".to_string(),
        ))
    }
}

fn count_denied_edges(root: &ChainNode) -> usize {
    let mut denied = 0;
    let mut stack: Vec<&ChainNode> = vec![root];
    while let Some(node) = stack.pop() {
        for edges in [&node.styles, &node.contents, &node.linked] {
            for edge in edges {
                match edge {
                    ChainEdge::Node(child) => stack.push(child),
                    ChainEdge::AccessDenied { .. } => denied += 1,
                    ChainEdge::CircularRef { .. } => {}
                }
            }
        }
    }
    denied
}

fn rating_aggregate(meta: &BTreeMap<String, Value>) -> (u64, f64) {
    let scores: Vec<f64> = meta
        .iter()
        .filter(|(key, _)| key.starts_with(RATING_BY_PREFIX))
        .filter_map(|(_, value)| value.get("score").and_then(Value::as_f64))
        .collect();
    if scores.is_empty() {
        return (0, 0.0);
    }
    let count = scores.len() as u64;
    let average = round_to_two(scores.iter().sum::<f64>() / scores.len() as f64);
    (count, average)
}

fn round_to_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use folio_core::content::WorkflowStep;

    use crate::access::OwnerAccess;
    use crate::batch::ItemStatus;
    use crate::session::MemorySessionStore;
    use crate::store::{ContentPatch, MemoryContentStore};

    struct Fixture {
        store: Arc<MemoryContentStore>,
        orchestrator: StageOrchestrator,
        actor: Uuid,
    }

    fn fixture() -> Fixture {
        fixture_with(RuntimeLimits::default())
    }

    fn fixture_with(limits: RuntimeLimits) -> Fixture {
        let store = Arc::new(MemoryContentStore::new());
        let access = Arc::new(OwnerAccess::new(store.clone()));
        let sessions = Arc::new(MemorySessionStore::new());
        let orchestrator = StageOrchestrator::new(store.clone(), access, sessions, limits);
        Fixture {
            store,
            orchestrator,
            actor: Uuid::now_v7(),
        }
    }

    fn publication(fixture: &Fixture, title: &str) -> ContentId {
        fixture.store.insert(NewRecord::draft(
            ContentKind::Publication,
            title,
            fixture.actor,
        ))
    }

    #[test]
    fn duplicate_commit_is_single_use() {
        let f = fixture();
        let source = publication(&f, "Guide");
        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, source, DuplicateOptions::default())
            .unwrap();
        assert!(prepared.expires_in_seconds > 0);

        let committed = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source)
            .unwrap();
        assert!(committed.success);

        let replay = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source);
        assert!(matches!(replay, Err(EngineError::SessionExpired)));
    }

    #[test]
    fn expired_session_cannot_commit() {
        let f = fixture_with(RuntimeLimits {
            session_ttl_secs: 0,
            ..Default::default()
        });
        let source = publication(&f, "Guide");
        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, source, DuplicateOptions::default())
            .unwrap();
        let result = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source);
        assert!(matches!(result, Err(EngineError::SessionExpired)));
    }

    #[test]
    fn foreign_owner_sees_session_expired() {
        let f = fixture();
        let source = f.store.insert({
            let mut record = NewRecord::draft(ContentKind::Publication, "Guide", f.actor);
            record.workflow_step = WorkflowStep::Published;
            record
        });
        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, source, DuplicateOptions::default())
            .unwrap();

        let stranger = Uuid::now_v7();
        let result = f
            .orchestrator
            .commit_duplicate(stranger, &prepared.session_id, source);
        assert!(matches!(result, Err(EngineError::SessionExpired)));
        // The rightful owner can still commit afterwards.
        assert!(f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source)
            .is_ok());
    }

    #[test]
    fn mismatched_source_burns_the_session() {
        let f = fixture();
        let source = publication(&f, "Guide");
        let other = publication(&f, "Other");
        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, source, DuplicateOptions::default())
            .unwrap();

        let mismatch = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, other);
        assert!(matches!(mismatch, Err(EngineError::SessionMismatch { .. })));
        // Claim-before-check: the session is spent either way.
        let retry = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source);
        assert!(matches!(retry, Err(EngineError::SessionExpired)));
    }

    #[test]
    fn visibility_revoked_between_stages_fails_closed() {
        let f = fixture();
        let stranger = Uuid::now_v7();
        let source = f.store.insert({
            let mut record = NewRecord::draft(ContentKind::Publication, "Shared", stranger);
            record.workflow_step = WorkflowStep::Published;
            record
        });
        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, source, DuplicateOptions::default())
            .unwrap();

        // Owner pulls the record back to draft: invisible to the actor now.
        f.store.update(
            source,
            ContentPatch {
                workflow_step: Some(WorkflowStep::Draft),
                ..Default::default()
            },
        );
        let result = f
            .orchestrator
            .commit_duplicate(f.actor, &prepared.session_id, source);
        assert!(matches!(result, Err(EngineError::AccessDenied)));
    }

    #[test]
    fn near_duplicates_show_up_in_the_preview() {
        let f = fixture();
        let mut a = NewRecord::draft(ContentKind::Publication, "Guide", f.actor);
        a.body = "installation and setup instructions".to_string();
        let a = f.store.insert(a);
        let mut b = NewRecord::draft(ContentKind::Publication, "Guide 2", f.actor);
        b.body = "installation and setup instructions".to_string();
        f.store.insert(b);

        let prepared = f
            .orchestrator
            .prepare_duplicate(f.actor, a, DuplicateOptions::default())
            .unwrap();
        let near = prepared.preview["near_duplicates"].as_array().unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0]["similarity"], json!(1.0));
    }

    #[test]
    fn bulk_ceiling_is_enforced_at_prepare() {
        let f = fixture_with(RuntimeLimits {
            bulk_ceiling: 2,
            ..Default::default()
        });
        let targets = vec![Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7()];
        let result = f.orchestrator.prepare_bulk(
            f.actor,
            targets,
            BulkAction::AttachTerm {
                term: "howto".to_string(),
            },
            BatchOptions::default(),
        );
        assert!(matches!(
            result,
            Err(EngineError::BulkLimitExceeded {
                requested: 3,
                ceiling: 2
            })
        ));
    }

    #[test]
    fn bulk_rejects_reserved_meta_keys_and_bad_terms() {
        let f = fixture();
        let target = publication(&f, "Guide");
        let reserved = f.orchestrator.prepare_bulk(
            f.actor,
            vec![target],
            BulkAction::SetMeta {
                key: "rating_avg".to_string(),
                value: json!(5),
            },
            BatchOptions::default(),
        );
        assert!(matches!(reserved, Err(EngineError::Validation { .. })));

        let bad_term = f.orchestrator.prepare_bulk(
            f.actor,
            vec![target],
            BulkAction::AttachTerm {
                term: "Not A Slug".to_string(),
            },
            BatchOptions::default(),
        );
        assert!(matches!(bad_term, Err(EngineError::Validation { .. })));
    }

    #[tokio::test]
    async fn bulk_commit_applies_and_reports_per_item_failures() {
        let f = fixture();
        let stranger = Uuid::now_v7();
        let mine = publication(&f, "Mine");
        let foreign = f.store.insert(NewRecord::draft(
            ContentKind::Publication,
            "Foreign draft",
            stranger,
        ));
        let also_mine = publication(&f, "Also mine");

        let prepared = f
            .orchestrator
            .prepare_bulk(
                f.actor,
                vec![mine, foreign, also_mine],
                BulkAction::SetWorkflowStep {
                    step: WorkflowStep::Review,
                },
                BatchOptions::default(),
            )
            .unwrap();
        let outcome = f
            .orchestrator
            .commit_bulk(f.actor, &prepared.session_id)
            .await
            .unwrap();

        let batch = outcome.batch.expect("bulk outcome carries the batch");
        assert_eq!(batch.total(), 3);
        assert_eq!(batch.failed_ids(), vec![foreign]);
        assert_eq!(batch.failed[0].detail.as_deref(), Some("access_denied"));
        assert!(!outcome.success);
        assert_eq!(
            f.store.get(mine).unwrap().workflow_step,
            WorkflowStep::Review
        );
        assert_eq!(
            f.store.get(also_mine).unwrap().workflow_step,
            WorkflowStep::Review
        );
    }

    #[tokio::test]
    async fn bulk_dry_run_mutates_nothing() {
        let f = fixture();
        let target = publication(&f, "Guide");
        let prepared = f
            .orchestrator
            .prepare_bulk(
                f.actor,
                vec![target],
                BulkAction::AttachTerm {
                    term: "howto".to_string(),
                },
                BatchOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let outcome = f
            .orchestrator
            .commit_bulk(f.actor, &prepared.session_id)
            .await
            .unwrap();

        let batch = outcome.batch.unwrap();
        assert!(batch.success.iter().all(|r| r.status == ItemStatus::Simulated));
        assert!(f.store.get(target).unwrap().terms.is_empty());
    }

    #[test]
    fn chain_export_round_trip() {
        let f = fixture();
        let root = publication(&f, "Root");
        let style = f
            .store
            .insert(NewRecord::draft(ContentKind::Style, "Serif", f.actor));
        let mut links = f.store.get(root).unwrap().links;
        links.styles.push(style);
        f.store.update(
            root,
            ContentPatch {
                links: Some(links),
                ..Default::default()
            },
        );

        let prepared = f
            .orchestrator
            .prepare_chain_export(f.actor, root, Some(3), true, false)
            .unwrap();
        assert_eq!(prepared.preview["node_count"], json!(2));

        let committed = f
            .orchestrator
            .commit_chain_export(f.actor, &prepared.session_id, root)
            .unwrap();
        assert!(committed.success);
        assert_eq!(committed.summary["node_count"], json!(2));
        assert_eq!(committed.summary["document"]["styles"][0]["title"], json!("Serif"));
    }

    #[test]
    fn chain_export_depth_request_is_clamped() {
        let f = fixture_with(RuntimeLimits {
            max_chain_depth: 2,
            ..Default::default()
        });
        let root = publication(&f, "Root");
        let prepared = f
            .orchestrator
            .prepare_chain_export(f.actor, root, Some(99), false, true)
            .unwrap();
        assert_eq!(prepared.preview["max_depth"], json!(2));
    }

    #[test]
    fn rating_flow_recomputes_the_aggregate() {
        let f = fixture();
        let stranger = Uuid::now_v7();
        let target = f.store.insert({
            let mut record = NewRecord::draft(ContentKind::Publication, "Guide", f.actor);
            record.workflow_step = WorkflowStep::Published;
            record
        });

        let first = f
            .orchestrator
            .prepare_rating(f.actor, target, 5, None)
            .unwrap();
        f.orchestrator
            .commit_rating(f.actor, &first.session_id, target)
            .unwrap();

        let second = f
            .orchestrator
            .prepare_rating(stranger, target, 4, Some("solid".to_string()))
            .unwrap();
        let outcome = f
            .orchestrator
            .commit_rating(stranger, &second.session_id, target)
            .unwrap();

        assert_eq!(outcome.summary["rating_count"], json!(2));
        assert_eq!(outcome.summary["rating_avg"], json!(4.5));
        let meta = f.store.get(target).unwrap().meta;
        assert_eq!(meta["rating_count"], json!(2));
        assert_eq!(meta["rating_avg"], json!(4.5));
    }

    #[test]
    fn rating_score_is_range_checked() {
        let f = fixture();
        let target = publication(&f, "Guide");
        let result = f.orchestrator.prepare_rating(f.actor, target, 6, None);
        assert!(matches!(
            result,
            Err(EngineError::Validation { field: Some(ref field), .. }) if field == "score"
        ));
    }

    #[test]
    fn bootstrap_prepare_collect_validate_commit() {
        let f = fixture();
        let space = f
            .store
            .insert(NewRecord::draft(ContentKind::Space, "Docs", f.actor));
        let style = f.store.insert({
            let mut record = NewRecord::draft(ContentKind::Style, "Serif", f.actor);
            record.space_id = Some(space);
            record
        });
        let template = f.store.insert({
            let mut record = NewRecord::draft(ContentKind::Template, "Handbook", f.actor);
            record.space_id = Some(space);
            record
        });
        let landing = f
            .store
            .insert(NewRecord::draft(ContentKind::Fragment, "Welcome", f.actor));

        let prepared = f
            .orchestrator
            .prepare_bootstrap(f.actor, space, "Employee Handbook")
            .unwrap();
        assert_eq!(prepared.preview["readiness"]["ready"], json!(true));
        assert_eq!(prepared.preview["slots"]["landing"], Value::Null);

        let collected = f
            .orchestrator
            .collect_bootstrap(f.actor, &prepared.session_id, "landing", landing)
            .unwrap();
        assert_eq!(collected.session_id, prepared.session_id);
        assert_eq!(collected.preview["slots"]["landing"]["title"], json!("Welcome"));

        let readiness = f
            .orchestrator
            .validate_bootstrap(f.actor, &prepared.session_id)
            .unwrap();
        assert_eq!(readiness["missing"], json!([]));

        let committed = f
            .orchestrator
            .commit_bootstrap(f.actor, &prepared.session_id)
            .unwrap();
        let new_id: ContentId =
            serde_json::from_value(committed.summary["new_id"].clone()).unwrap();
        let record = f.store.get(new_id).unwrap();
        assert_eq!(record.kind, ContentKind::Publication);
        assert_eq!(record.links.styles, vec![style]);
        assert_eq!(record.links.linked, vec![template]);
        assert_eq!(record.links.contents, vec![landing]);
        assert_eq!(record.space_id, Some(space));
    }

    #[test]
    fn bootstrap_commit_requires_the_required_slots() {
        let f = fixture();
        let space = f
            .store
            .insert(NewRecord::draft(ContentKind::Space, "Empty", f.actor));
        let prepared = f
            .orchestrator
            .prepare_bootstrap(f.actor, space, "Starter")
            .unwrap();
        assert_eq!(prepared.preview["readiness"]["ready"], json!(false));

        let result = f
            .orchestrator
            .commit_bootstrap(f.actor, &prepared.session_id);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn bootstrap_collect_rejects_kind_mismatch() {
        let f = fixture();
        let space = f
            .store
            .insert(NewRecord::draft(ContentKind::Space, "Docs", f.actor));
        let fragment = f
            .store
            .insert(NewRecord::draft(ContentKind::Fragment, "Welcome", f.actor));
        let prepared = f
            .orchestrator
            .prepare_bootstrap(f.actor, space, "Starter")
            .unwrap();

        let result =
            f.orchestrator
                .collect_bootstrap(f.actor, &prepared.session_id, "style", fragment);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        let unknown =
            f.orchestrator
                .collect_bootstrap(f.actor, &prepared.session_id, "sidebar", fragment);
        assert!(matches!(unknown, Err(EngineError::Validation { .. })));
    }
}
