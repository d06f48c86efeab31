use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldsync_core::{
    CreateDailyReportRequest, CreatePhotoSurveyRequest, ExecuteWeldRequest,
    UpdateSpoolPhaseRequest, UpdateWeldStatusRequest,
};

/// A locally queued mutation awaiting remote application. Closed set; the
/// upload phase dispatches over it exhaustively, one variant per server
/// mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ExecuteWeld(ExecuteWeldRequest),
    CreatePhotoSurvey(CreatePhotoSurveyRequest),
    UpdateSpoolPhase(UpdateSpoolPhaseRequest),
    UpdateWeldStatus(UpdateWeldStatusRequest),
    CreateDailyReport(CreateDailyReportRequest),
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::ExecuteWeld(_) => "execute_weld",
            Action::CreatePhotoSurvey(_) => "create_photo_survey",
            Action::UpdateSpoolPhase(_) => "update_spool_phase",
            Action::UpdateWeldStatus(_) => "update_weld_status",
            Action::CreateDailyReport(_) => "create_daily_report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ActionStatus::Pending),
            "syncing" => Some(ActionStatus::Syncing),
            "error" => Some(ActionStatus::Error),
            _ => None,
        }
    }
}

/// One row of the pending-action queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    pub project_id: String,
    pub action: Action,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl PendingAction {
    pub fn new(project_id: impl Into<String>, action: Action, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            action,
            status: ActionStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error_at: None,
            error_message: None,
            created_at,
        }
    }
}
