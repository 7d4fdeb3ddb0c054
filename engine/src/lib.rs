pub mod access;
pub mod batch;
pub mod chain;
pub mod duplicate;
pub mod error;
pub mod limits;
pub mod session;
pub mod snapshot;
pub mod stage;
pub mod store;

pub use access::{AccessOracle, OwnerAccess};
pub use batch::{BatchOptions, BatchOutcome, ItemReport, ItemStatus, UnitFault, run_batch};
pub use chain::{ChainEdge, ChainNode, ChainResolution, CircularRef, flatten_chain, resolve_chain};
pub use duplicate::{DuplicateOptions, DuplicateOutcome, duplicate_record};
pub use error::{EngineError, EngineResult};
pub use limits::RuntimeLimits;
pub use session::{
    MemorySessionStore, OperationKind, PlanPayload, SessionRepository, StagedSession,
};
pub use stage::{CommitOutcome, PreparedStage, StageOrchestrator};
pub use store::{ContentPatch, ContentStore, ListFilter, MemoryContentStore, NewRecord};
