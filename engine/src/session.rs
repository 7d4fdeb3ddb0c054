//! Staged sessions: durable-but-ephemeral handles to validated mutation
//! plans. A session is minted at `prepare`, optionally re-persisted by the
//! bootstrap `collect` override, and consumed exactly once at `commit`.
//!
//! Every negative lookup outcome (malformed token, unknown id, expiry,
//! kind mismatch, owner mismatch) collapses to `None` here and to
//! `session_expired` at the tool boundary. Callers never learn which one
//! it was.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use folio_core::content::{ContentId, WorkflowStep};
use folio_core::token;

use crate::batch::BatchOptions;
use crate::duplicate::DuplicateOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Duplicate,
    BulkApply,
    ChainExport,
    Rating,
    Bootstrap,
}

impl OperationKind {
    /// Session-token prefix. Doubles as the cheap format gate: a token
    /// minted for one kind can never pass another kind's lookup.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Duplicate => "dup",
            Self::BulkApply => "bulk",
            Self::ChainExport => "chain",
            Self::Rating => "rate",
            Self::Bootstrap => "boot",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::BulkApply => "bulk_apply",
            Self::ChainExport => "chain_export",
            Self::Rating => "rating",
            Self::Bootstrap => "bootstrap",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePlan {
    pub source_id: ContentId,
    pub options: DuplicateOptions,
}

/// The mutation a bulk plan applies to every target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BulkAction {
    SetWorkflowStep { step: WorkflowStep },
    AttachTerm { term: String },
    DetachTerm { term: String },
    SetMeta { key: String, value: Value },
}

impl BulkAction {
    pub fn describe(&self) -> String {
        match self {
            Self::SetWorkflowStep { step } => format!("set workflow step to '{}'", step.as_str()),
            Self::AttachTerm { term } => format!("attach term '{term}'"),
            Self::DetachTerm { term } => format!("detach term '{term}'"),
            Self::SetMeta { key, .. } => format!("set meta '{key}'"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkApplyPlan {
    pub target_ids: Vec<ContentId>,
    pub action: BulkAction,
    pub options: BatchOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExportPlan {
    pub root_id: ContentId,
    pub max_depth: u32,
    pub include_content: bool,
    pub flat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPlan {
    pub target_id: ContentId,
    pub score: u8,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPlan {
    pub space_id: ContentId,
    pub title: String,
    /// Slot name → selected component. Auto-filled at prepare, overridable
    /// one slot at a time via collect.
    pub slots: BTreeMap<String, Option<ContentId>>,
}

/// The validated plan a session carries. Tagged so commit-time logic is
/// exhaustively matched instead of probed for optional keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PlanPayload {
    Duplicate(DuplicatePlan),
    BulkApply(BulkApplyPlan),
    ChainExport(ChainExportPlan),
    Rating(RatingPlan),
    Bootstrap(BootstrapPlan),
}

impl PlanPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Duplicate(_) => OperationKind::Duplicate,
            Self::BulkApply(_) => OperationKind::BulkApply,
            Self::ChainExport(_) => OperationKind::ChainExport,
            Self::Rating(_) => OperationKind::Rating,
            Self::Bootstrap(_) => OperationKind::Bootstrap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedSession {
    pub session_id: String,
    pub owner_id: Uuid,
    pub kind: OperationKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub plan: PlanPayload,
}

impl StagedSession {
    pub fn expires_in_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Keyed store for staged sessions. Backing storage is an implementation
/// choice; the engine only depends on this seam.
pub trait SessionRepository: Send + Sync {
    /// Persist a fresh session for `plan` and return it. The token prefix
    /// is derived from the plan's operation kind.
    fn put(&self, owner_id: Uuid, plan: PlanPayload, ttl_secs: u64) -> StagedSession;

    /// Read a live session without consuming it. `None` for every negative
    /// outcome. Never renews the TTL.
    fn get(&self, session_id: &str, kind: OperationKind, owner_id: Uuid) -> Option<PlanPayload>;

    /// Replace the plan of a live session under the same id with a fresh
    /// TTL. Only the bootstrap collect override uses this.
    fn renew(
        &self,
        session_id: &str,
        kind: OperationKind,
        owner_id: Uuid,
        plan: PlanPayload,
        ttl_secs: u64,
    ) -> Option<StagedSession>;

    /// Validate and delete in one step. Two racing commits cannot both win:
    /// the second caller sees `None`.
    fn claim(&self, session_id: &str, kind: OperationKind, owner_id: Uuid) -> Option<PlanPayload>;

    fn delete(&self, session_id: &str);
}

#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, StagedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| now < entry.expires_at)
            .count()
    }

    fn matches(
        entry: &StagedSession,
        kind: OperationKind,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> bool {
        entry.kind == kind && entry.owner_id == owner_id && now < entry.expires_at
    }
}

impl SessionRepository for MemorySessionStore {
    fn put(&self, owner_id: Uuid, plan: PlanPayload, ttl_secs: u64) -> StagedSession {
        let kind = plan.kind();
        let now = Utc::now();
        let session = StagedSession {
            session_id: token::mint_session_token(kind.prefix()),
            owner_id,
            kind,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            plan,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| now < entry.expires_at);
        entries.insert(session.session_id.clone(), session.clone());
        session
    }

    fn get(&self, session_id: &str, kind: OperationKind, owner_id: Uuid) -> Option<PlanPayload> {
        if !token::is_well_formed(session_id, kind.prefix()) {
            return None;
        }
        let now = Utc::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(session_id)?;
        if !Self::matches(entry, kind, owner_id, now) {
            return None;
        }
        Some(entry.plan.clone())
    }

    fn renew(
        &self,
        session_id: &str,
        kind: OperationKind,
        owner_id: Uuid,
        plan: PlanPayload,
        ttl_secs: u64,
    ) -> Option<StagedSession> {
        if !token::is_well_formed(session_id, kind.prefix()) || plan.kind() != kind {
            return None;
        }
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(session_id)?;
        if !Self::matches(entry, kind, owner_id, now) {
            return None;
        }
        entry.plan = plan;
        entry.expires_at = now + Duration::seconds(ttl_secs as i64);
        Some(entry.clone())
    }

    fn claim(&self, session_id: &str, kind: OperationKind, owner_id: Uuid) -> Option<PlanPayload> {
        if !token::is_well_formed(session_id, kind.prefix()) {
            return None;
        }
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Validate and remove under one lock so a racing claim loses cleanly.
        if !entries
            .get(session_id)
            .map(|entry| Self::matches(entry, kind, owner_id, now))
            .unwrap_or(false)
        {
            return None;
        }
        entries.remove(session_id).map(|entry| entry.plan)
    }

    fn delete(&self, session_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating_plan() -> PlanPayload {
        PlanPayload::Rating(RatingPlan {
            target_id: Uuid::now_v7(),
            score: 4,
            comment: None,
        })
    }

    #[test]
    fn claim_is_single_use() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        let session = store.put(owner, rating_plan(), 60);

        assert!(store
            .claim(&session.session_id, OperationKind::Rating, owner)
            .is_some());
        assert!(store
            .claim(&session.session_id, OperationKind::Rating, owner)
            .is_none());
    }

    #[test]
    fn expired_sessions_are_invisible() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        let session = store.put(owner, rating_plan(), 0);
        assert!(store
            .get(&session.session_id, OperationKind::Rating, owner)
            .is_none());
        assert!(store
            .claim(&session.session_id, OperationKind::Rating, owner)
            .is_none());
    }

    #[test]
    fn foreign_owner_and_wrong_kind_look_expired() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        let stranger = Uuid::now_v7();
        let session = store.put(owner, rating_plan(), 60);

        assert!(store
            .get(&session.session_id, OperationKind::Rating, stranger)
            .is_none());
        assert!(store
            .get(&session.session_id, OperationKind::Duplicate, owner)
            .is_none());
        // Still claimable by the rightful owner afterwards.
        assert!(store
            .claim(&session.session_id, OperationKind::Rating, owner)
            .is_some());
    }

    #[test]
    fn malformed_tokens_never_reach_the_map() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        assert!(store.get("rate_notahexstring", OperationKind::Rating, owner).is_none());
        assert!(store.get("", OperationKind::Rating, owner).is_none());
        assert!(store
            .claim("dup_0123", OperationKind::Duplicate, owner)
            .is_none());
    }

    #[test]
    fn renew_refreshes_ttl_and_replaces_plan() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        let plan = PlanPayload::Bootstrap(BootstrapPlan {
            space_id: Uuid::now_v7(),
            title: "Starter".to_string(),
            slots: BTreeMap::new(),
        });
        let session = store.put(owner, plan.clone(), 60);

        let mut slots = BTreeMap::new();
        slots.insert("style".to_string(), Some(Uuid::now_v7()));
        let renewed = store
            .renew(
                &session.session_id,
                OperationKind::Bootstrap,
                owner,
                PlanPayload::Bootstrap(BootstrapPlan {
                    space_id: Uuid::now_v7(),
                    title: "Starter".to_string(),
                    slots: slots.clone(),
                }),
                600,
            )
            .expect("renewable");
        assert_eq!(renewed.session_id, session.session_id);
        assert!(renewed.expires_at > session.expires_at);
        match store
            .get(&session.session_id, OperationKind::Bootstrap, owner)
            .expect("still live")
        {
            PlanPayload::Bootstrap(plan) => assert_eq!(plan.slots, slots),
            other => panic!("unexpected plan variant: {other:?}"),
        }
    }

    #[test]
    fn put_sweeps_expired_entries() {
        let store = MemorySessionStore::new();
        let owner = Uuid::now_v7();
        store.put(owner, rating_plan(), 0);
        store.put(owner, rating_plan(), 0);
        let live = store.put(owner, rating_plan(), 60);
        assert_eq!(store.live_count(), 1);
        assert!(store
            .get(&live.session_id, OperationKind::Rating, owner)
            .is_some());
    }
}
