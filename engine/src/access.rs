//! Permission seam. Consulted at every chain-node expansion and
//! re-consulted at every commit; prepare-time answers are never trusted
//! at commit time.

use std::sync::Arc;

use uuid::Uuid;

use folio_core::content::{ContentId, ContentKind, ContentRecord, WorkflowStep};

use crate::store::ContentStore;

pub trait AccessOracle: Send + Sync {
    /// Whether the actor may read this record at all. A `false` here is
    /// indistinguishable from the record not existing.
    fn can_see(&self, actor: Uuid, record: &ContentRecord) -> bool;

    /// Whether the actor may create records inside the given space
    /// (`None` = top level).
    fn can_publish(&self, actor: Uuid, space_id: Option<ContentId>) -> bool;
}

/// Reference oracle: owners see their own records, everyone sees published
/// ones; publishing requires owning the target space.
pub struct OwnerAccess {
    store: Arc<dyn ContentStore>,
}

impl OwnerAccess {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

impl AccessOracle for OwnerAccess {
    fn can_see(&self, actor: Uuid, record: &ContentRecord) -> bool {
        record.owner_id == actor || record.workflow_step == WorkflowStep::Published
    }

    fn can_publish(&self, actor: Uuid, space_id: Option<ContentId>) -> bool {
        match space_id {
            None => true,
            Some(id) => self
                .store
                .get(id)
                .map(|space| space.kind == ContentKind::Space && space.owner_id == actor)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContentPatch, MemoryContentStore, NewRecord};

    #[test]
    fn owners_see_drafts_others_see_published() {
        let store = Arc::new(MemoryContentStore::new());
        let owner = Uuid::now_v7();
        let stranger = Uuid::now_v7();
        let id = store.insert(NewRecord::draft(ContentKind::Publication, "Draft", owner));
        let access = OwnerAccess::new(store.clone());

        let record = store.get(id).unwrap();
        assert!(access.can_see(owner, &record));
        assert!(!access.can_see(stranger, &record));

        store.update(
            id,
            ContentPatch {
                workflow_step: Some(WorkflowStep::Published),
                ..Default::default()
            },
        );
        let record = store.get(id).unwrap();
        assert!(access.can_see(stranger, &record));
    }

    #[test]
    fn publishing_requires_owning_the_space() {
        let store = Arc::new(MemoryContentStore::new());
        let owner = Uuid::now_v7();
        let stranger = Uuid::now_v7();
        let space = store.insert(NewRecord::draft(ContentKind::Space, "Docs", owner));
        let not_a_space = store.insert(NewRecord::draft(ContentKind::Style, "Serif", owner));
        let access = OwnerAccess::new(store.clone());

        assert!(access.can_publish(owner, Some(space)));
        assert!(!access.can_publish(stranger, Some(space)));
        assert!(!access.can_publish(owner, Some(not_a_space)));
        assert!(!access.can_publish(owner, Some(Uuid::now_v7())));
        assert!(access.can_publish(stranger, None));
    }
}
