pub mod action;
pub mod conflict;
pub mod engine;
pub mod retry;
pub mod status;
pub mod store;


pub use action::{Action, ActionStatus, PendingAction};
pub use conflict::{ConflictError, MergeStrategy};
pub use engine::{EngineError, SyncEngine, SyncReport};
pub use status::{SyncPhase, SyncProgress, SyncStatus};
pub use store::{ConflictRecord, EntityKind, EntityRecord, LocalStore, StoreError};
