//! Dependency-chain resolution: bounded, cycle-safe traversal of a
//! record's outbound links. Cycles, invisible nodes, and depth cutoffs are
//! modeled as data in the result, never as errors; only an inaccessible
//! root fails the call.
//!
//! Traversal runs on an explicit work stack with a call-local visited set,
//! so adversarial link graphs cannot grow the native call stack.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use folio_core::content::{ContentId, ContentKind, ContentRecord, LinkCategory, WorkflowStep};

use crate::access::AccessOracle;
use crate::error::{EngineError, EngineResult};
use crate::store::ContentStore;

/// One edge in the resolved chain. Terminal markers short-circuit further
/// traversal from that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "edge", rename_all = "snake_case")]
pub enum ChainEdge {
    Node(ChainNode),
    CircularRef { id: ContentId, detected_at_depth: u32 },
    AccessDenied { id: ContentId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainNode {
    pub id: ContentId,
    pub kind: ContentKind,
    pub workflow_step: WorkflowStep,
    pub title: String,
    pub depth: u32,
    pub excerpt: String,
    /// Full body, present only when the caller asked for content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// The node sits at the depth ceiling; children were not fetched.
    pub depth_limit_reached: bool,
    pub styles: Vec<ChainEdge>,
    pub contents: Vec<ChainEdge>,
    pub linked: Vec<ChainEdge>,
}

impl ChainNode {
    fn edges_mut(&mut self, category: LinkCategory) -> &mut Vec<ChainEdge> {
        match category {
            LinkCategory::Styles => &mut self.styles,
            LinkCategory::Contents => &mut self.contents,
            LinkCategory::Linked => &mut self.linked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircularRef {
    pub id: ContentId,
    pub detected_at_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResolution {
    pub root: ChainNode,
    /// Every expanded id, in visitation order. Each id appears at most once.
    pub visited: Vec<ContentId>,
    pub circular_refs: Vec<CircularRef>,
}

/// Flat presentation of the same visitation, grouped by content kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatChainGroup {
    pub kind: ContentKind,
    pub items: Vec<FlatChainItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatChainItem {
    pub id: ContentId,
    pub title: String,
    pub workflow_step: WorkflowStep,
    pub depth: u32,
}

/// Resolve the dependency chain under `root_id`.
///
/// `requested_depth` is honored up to `depth_ceiling`; the ceiling always
/// wins. Fails fast with `AccessDenied` when the root is missing or not
/// visible to the actor (one uniform answer for both).
pub fn resolve_chain(
    store: &dyn ContentStore,
    access: &dyn AccessOracle,
    actor: Uuid,
    root_id: ContentId,
    requested_depth: u32,
    depth_ceiling: u32,
    include_content: bool,
) -> EngineResult<ChainResolution> {
    let max_depth = requested_depth.min(depth_ceiling);

    let root_record = store.get(root_id).ok_or(EngineError::AccessDenied)?;
    if !access.can_see(actor, &root_record) {
        return Err(EngineError::AccessDenied);
    }

    // Slot per expanded node, in visitation (preorder) order. Children
    // always occupy higher slot indexes than their parent.
    struct Slot {
        node: ChainNode,
        edges: [Vec<EdgeRef>; 3],
    }
    enum EdgeRef {
        Expanded(usize),
        Circular { id: ContentId, at_depth: u32 },
        Denied { id: ContentId },
    }
    struct WorkItem {
        parent_slot: usize,
        category_index: usize,
        child_id: ContentId,
        child_depth: u32,
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut visited_set: HashSet<ContentId> = HashSet::new();
    let mut visited: Vec<ContentId> = Vec::new();
    let mut circular_refs: Vec<CircularRef> = Vec::new();
    let mut work: Vec<WorkItem> = Vec::new();

    let mut expand = |slots: &mut Vec<Slot>,
                      work: &mut Vec<WorkItem>,
                      visited_set: &mut HashSet<ContentId>,
                      visited: &mut Vec<ContentId>,
                      record: ContentRecord,
                      depth: u32|
     -> usize {
        visited_set.insert(record.id);
        visited.push(record.id);
        let at_limit = depth >= max_depth;
        let slot_index = slots.len();
        slots.push(Slot {
            node: ChainNode {
                id: record.id,
                kind: record.kind,
                workflow_step: record.workflow_step,
                title: record.title.clone(),
                depth,
                excerpt: record.excerpt(),
                body: include_content.then(|| record.body.clone()),
                depth_limit_reached: at_limit,
                styles: Vec::new(),
                contents: Vec::new(),
                linked: Vec::new(),
            },
            edges: [Vec::new(), Vec::new(), Vec::new()],
        });
        if !at_limit {
            // LIFO stack: push categories and children in reverse so they
            // are expanded in declaration order.
            for (category_index, category) in LinkCategory::ALL.iter().enumerate().rev() {
                for child_id in record.links.category(*category).iter().rev() {
                    work.push(WorkItem {
                        parent_slot: slot_index,
                        category_index,
                        child_id: *child_id,
                        child_depth: depth + 1,
                    });
                }
            }
        }
        slot_index
    };

    expand(
        &mut slots,
        &mut work,
        &mut visited_set,
        &mut visited,
        root_record,
        0,
    );

    while let Some(item) = work.pop() {
        let category = LinkCategory::ALL[item.category_index];
        if visited_set.contains(&item.child_id) {
            // Generic links never double-count an id another category (or an
            // earlier generic link) already resolved; style and content
            // re-encounters are cycles, recorded as data.
            if category != LinkCategory::Linked {
                circular_refs.push(CircularRef {
                    id: item.child_id,
                    detected_at_depth: item.child_depth,
                });
                slots[item.parent_slot].edges[item.category_index].push(EdgeRef::Circular {
                    id: item.child_id,
                    at_depth: item.child_depth,
                });
            }
            continue;
        }
        let Some(record) = store.get(item.child_id) else {
            // Dangling link; nothing to resolve, nothing to report.
            continue;
        };
        if !access.can_see(actor, &record) {
            slots[item.parent_slot].edges[item.category_index]
                .push(EdgeRef::Denied { id: item.child_id });
            continue;
        }
        let child_slot = expand(
            &mut slots,
            &mut work,
            &mut visited_set,
            &mut visited,
            record,
            item.child_depth,
        );
        slots[item.parent_slot].edges[item.category_index].push(EdgeRef::Expanded(child_slot));
    }

    // Assemble children before parents: a slot only references higher
    // slot indexes, so a reverse sweep sees every child already built.
    let mut built: Vec<Option<ChainNode>> = Vec::with_capacity(slots.len());
    built.resize_with(slots.len(), || None);
    for (index, slot) in slots.into_iter().enumerate().rev() {
        let Slot { mut node, edges } = slot;
        for (category, edge_list) in LinkCategory::ALL.iter().zip(edges) {
            for edge in edge_list {
                let assembled = match edge {
                    EdgeRef::Expanded(child_index) => ChainEdge::Node(
                        built[child_index]
                            .take()
                            .expect("child slot assembled before parent"),
                    ),
                    EdgeRef::Circular { id, at_depth } => ChainEdge::CircularRef {
                        id,
                        detected_at_depth: at_depth,
                    },
                    EdgeRef::Denied { id } => ChainEdge::AccessDenied { id },
                };
                node.edges_mut(*category).push(assembled);
            }
        }
        built[index] = Some(node);
    }

    let root = built[0].take().expect("root slot always assembled");
    Ok(ChainResolution {
        root,
        visited,
        circular_refs,
    })
}

/// Group the visitation by content kind. A pure presentation transform:
/// exactly the nodes the traversal expanded, no second traversal.
pub fn flatten_chain(resolution: &ChainResolution) -> Vec<FlatChainGroup> {
    let mut groups: BTreeMap<ContentKind, Vec<FlatChainItem>> = BTreeMap::new();
    let mut stack: Vec<&ChainNode> = vec![&resolution.root];
    while let Some(node) = stack.pop() {
        groups.entry(node.kind).or_default().push(FlatChainItem {
            id: node.id,
            title: node.title.clone(),
            workflow_step: node.workflow_step,
            depth: node.depth,
        });
        for edges in [&node.linked, &node.contents, &node.styles] {
            for edge in edges.iter().rev() {
                if let ChainEdge::Node(child) = edge {
                    stack.push(child);
                }
            }
        }
    }
    for items in groups.values_mut() {
        items.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.title.cmp(&b.title)));
    }
    groups
        .into_iter()
        .map(|(kind, items)| FlatChainGroup { kind, items })
        .collect()
}
