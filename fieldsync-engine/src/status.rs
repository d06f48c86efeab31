use serde::Serialize;

/// Phase of the per-project sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Uploading,
    Downloading,
}

/// In-flight progress through the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub done: usize,
    pub total: usize,
}

/// Live counters exposed to the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_count: u64,
    pub conflict_count: u64,
    pub last_sync: Option<i64>,
    pub sync_error: Option<String>,
    pub progress: SyncProgress,
}
