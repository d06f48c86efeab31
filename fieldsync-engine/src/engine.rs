//! Per-project sync orchestration: drain the pending-action queue against the
//! remote API, then pull authoritative entity snapshots into the local store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use fieldsync_core::{ErrorClass, RemoteClient, RemoteEntity, RemoteError};

use crate::action::{Action, ActionStatus, PendingAction};
use crate::conflict::{self, ConflictError, IGNORED_FIELDS, MergeStrategy};
use crate::retry;
use crate::status::{SyncPhase, SyncProgress, SyncStatus};
use crate::store::{ConflictRecord, EntityKind, EntityRecord, LocalStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("conflict resolution error: {0}")]
    Conflict(#[from] ConflictError),
    #[error("pending action not found: {0}")]
    ActionNotFound(Uuid),
    #[error("conflict not found: {0}")]
    ConflictNotFound(i64),
}

/// Outcome of one sync pass. `ran` is false when another sync for the same
/// project was already in flight and this call was a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub ran: bool,
    pub uploaded: usize,
    pub failed: usize,
    pub pulled: usize,
    pub conflicts: usize,
}

#[derive(Default)]
struct EngineState {
    active: HashSet<String>,
    progress: HashMap<String, SyncProgress>,
    last_error: HashMap<String, String>,
}

pub struct SyncEngine {
    pub(crate) client: RemoteClient,
    pub(crate) store: LocalStore,
    state: Mutex<EngineState>,
}

/// Releases the per-project in-progress flag on every exit path.
struct SyncGuard<'a> {
    engine: &'a SyncEngine,
    project_id: String,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.lock_state();
        state.active.remove(&self.project_id);
        state.progress.remove(&self.project_id);
    }
}

impl SyncEngine {
    pub fn new(client: RemoteClient, store: LocalStore) -> Self {
        Self {
            client,
            store,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Runs one full sync pass for the project: upload phase, then download
    /// phase, then the `last_sync` marker if nothing fatal happened. Only one
    /// pass per project may run at a time; a concurrent call returns
    /// immediately with `ran == false`.
    pub async fn sync_project(&self, project_id: &str) -> Result<SyncReport, EngineError> {
        let Some(_guard) = self.begin_sync(project_id) else {
            tracing::debug!(project = project_id, "sync already in progress, skipping");
            return Ok(SyncReport::default());
        };

        tracing::info!(project = project_id, "sync pass started");
        let mut report = SyncReport {
            ran: true,
            ..SyncReport::default()
        };

        let outcome = self.run_phases(project_id, &mut report).await;
        match outcome {
            Ok(None) => {
                self.store.set_last_sync(project_id, now_unix()).await?;
                self.lock_state().last_error.remove(project_id);
                tracing::info!(
                    project = project_id,
                    uploaded = report.uploaded,
                    failed = report.failed,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    "sync pass completed"
                );
            }
            Ok(Some(message)) => {
                // Pass finished but a table pull failed: last_sync stays put so
                // staleness is measured honestly.
                self.lock_state()
                    .last_error
                    .insert(project_id.to_string(), message.clone());
                tracing::warn!(project = project_id, error = %message, "sync pass incomplete");
            }
            Err(err) => {
                self.lock_state()
                    .last_error
                    .insert(project_id.to_string(), err.to_string());
                return Err(err);
            }
        }

        Ok(report)
    }

    async fn run_phases(
        &self,
        project_id: &str,
        report: &mut SyncReport,
    ) -> Result<Option<String>, EngineError> {
        self.upload_phase(project_id, report).await?;
        self.download_phase(project_id, report).await
    }

    async fn upload_phase(
        &self,
        project_id: &str,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        let now = now_unix();
        let eligible: Vec<PendingAction> = self
            .store
            .list_actions(project_id)
            .await?
            .into_iter()
            .filter(|action| retry::is_eligible(action, now))
            .collect();
        let total = eligible.len();
        self.set_progress(project_id, SyncPhase::Uploading, 0, total);

        for (done, mut action) in eligible.into_iter().enumerate() {
            action.status = ActionStatus::Syncing;
            self.store.update_action(&action).await?;

            match self.submit(project_id, &action.action).await {
                Ok(()) => {
                    self.store.delete_action(action.id).await?;
                    report.uploaded += 1;
                    tracing::info!(
                        project = project_id,
                        action = action.action.kind_name(),
                        id = %action.id,
                        "action applied remotely"
                    );
                }
                Err(err) => {
                    let now = now_unix();
                    let message = err.to_string();
                    if matches!(err.classification(), Some(ErrorClass::Permanent)) {
                        retry::record_permanent_failure(&mut action, &message, now);
                    } else {
                        retry::record_failure(&mut action, &message, now);
                        // A server-requested delay overrides the table when later.
                        if let (Some(delay), Some(at)) =
                            (err.retry_after_secs(), action.next_retry_at)
                        {
                            action.next_retry_at =
                                Some(at.max(now.saturating_add(delay.min(i64::MAX as u64) as i64)));
                        }
                    }
                    self.store.update_action(&action).await?;
                    report.failed += 1;
                    tracing::warn!(
                        project = project_id,
                        action = action.action.kind_name(),
                        id = %action.id,
                        retry_count = action.retry_count,
                        error = %message,
                        "action submission failed"
                    );
                }
            }
            self.set_progress(project_id, SyncPhase::Uploading, done + 1, total);
        }
        Ok(())
    }

    async fn submit(&self, project_id: &str, action: &Action) -> Result<(), RemoteError> {
        match action {
            Action::ExecuteWeld(request) => {
                self.client.execute_weld(project_id, request).await?;
            }
            Action::CreatePhotoSurvey(request) => {
                self.client.create_photo_survey(project_id, request).await?;
            }
            Action::UpdateSpoolPhase(request) => {
                self.client.update_spool_phase(project_id, request).await?;
            }
            Action::UpdateWeldStatus(request) => {
                self.client.update_weld_status(project_id, request).await?;
            }
            Action::CreateDailyReport(request) => {
                self.client.create_daily_report(project_id, request).await?;
            }
        }
        Ok(())
    }

    /// Pulls every mirrored table. A failed fetch skips that table and makes
    /// the pass incomplete (returned message) without aborting the others.
    async fn download_phase(
        &self,
        project_id: &str,
        report: &mut SyncReport,
    ) -> Result<Option<String>, EngineError> {
        let since = self.store.last_sync(project_id).await?;
        let total = EntityKind::ALL.len();
        self.set_progress(project_id, SyncPhase::Downloading, 0, total);

        let mut incomplete = None;
        for (done, kind) in EntityKind::ALL.into_iter().enumerate() {
            match self
                .client
                .fetch_entities(project_id, kind.api_path(), since)
                .await
            {
                Ok(entities) => {
                    self.apply_pull(project_id, kind, entities, report).await?;
                }
                Err(err) => {
                    tracing::warn!(
                        project = project_id,
                        table = kind.as_str(),
                        error = %err,
                        "table pull failed"
                    );
                    incomplete
                        .get_or_insert_with(|| format!("pull of {} failed: {err}", kind.as_str()));
                }
            }
            self.set_progress(project_id, SyncPhase::Downloading, done + 1, total);
        }
        Ok(incomplete)
    }

    async fn apply_pull(
        &self,
        project_id: &str,
        kind: EntityKind,
        entities: Vec<RemoteEntity>,
        report: &mut SyncReport,
    ) -> Result<(), EngineError> {
        let now = now_unix();
        let mut accepted = Vec::new();

        for remote in entities {
            let server_copy = EntityRecord {
                project_id: project_id.to_string(),
                kind,
                entity_id: remote.id.clone(),
                payload: remote.data.clone(),
                server_snapshot: Some(remote.data.clone()),
                synced_at: Some(now),
                synced: true,
            };

            match self.store.get_entity(project_id, kind, &remote.id).await? {
                None => accepted.push(server_copy),
                Some(local) => {
                    let locally_modified =
                        local.server_snapshot.as_ref() != Some(&local.payload);
                    if !locally_modified || local.payload == remote.data {
                        accepted.push(server_copy);
                    } else {
                        let fields = conflict::diff(&local.payload, &remote.data, IGNORED_FIELDS);
                        if fields.is_empty() {
                            // Divergence only on bookkeeping fields: keep the
                            // local values, refresh the known server state.
                            accepted.push(EntityRecord {
                                payload: local.payload,
                                ..server_copy
                            });
                        } else {
                            self.store
                                .record_conflict(
                                    project_id,
                                    kind,
                                    &remote.id,
                                    &local.payload,
                                    &remote.data,
                                    &fields,
                                    now,
                                )
                                .await?;
                            report.conflicts += 1;
                            tracing::info!(
                                project = project_id,
                                table = kind.as_str(),
                                entity = %remote.id,
                                fields = ?fields,
                                "conflict recorded, local record kept"
                            );
                        }
                    }
                }
            }
        }

        report.pulled += accepted.len();
        self.store.put_entities(&accepted).await?;
        Ok(())
    }

    /// Queues a mutation for later remote application. Offline-created photo
    /// surveys also land in the entity cache immediately so the capture is
    /// visible before its first upload.
    pub async fn enqueue(&self, project_id: &str, action: Action) -> Result<Uuid, EngineError> {
        let pending = PendingAction::new(project_id, action, now_unix());
        self.store.enqueue_action(&pending).await?;

        if let Action::CreatePhotoSurvey(request) = &pending.action {
            let record = EntityRecord {
                project_id: project_id.to_string(),
                kind: EntityKind::PhotoSurvey,
                entity_id: request.survey_id.clone(),
                payload: serde_json::to_value(request).map_err(StoreError::from)?,
                server_snapshot: None,
                synced_at: None,
                synced: false,
            };
            self.store.put_entity(&record).await?;
        }

        tracing::debug!(
            project = project_id,
            action = pending.action.kind_name(),
            id = %pending.id,
            "action queued"
        );
        Ok(pending.id)
    }

    /// Spawns a sync pass and hands back the task handle; the caller may
    /// await it or drop it. Idempotent while a pass is running.
    pub fn trigger_sync(
        self: &Arc<Self>,
        project_id: &str,
    ) -> JoinHandle<Result<SyncReport, EngineError>> {
        let engine = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move { engine.sync_project(&project_id).await })
    }

    pub async fn status(&self, project_id: &str) -> Result<SyncStatus, EngineError> {
        let pending_count = self.store.count_actions(project_id).await?;
        let conflict_count = self.store.count_conflicts(project_id).await?;
        let last_sync = self.store.last_sync(project_id).await?;
        let state = self.lock_state();
        Ok(SyncStatus {
            is_syncing: state.active.contains(project_id),
            pending_count,
            conflict_count,
            last_sync,
            sync_error: state.last_error.get(project_id).cloned(),
            progress: state.progress.get(project_id).copied().unwrap_or_default(),
        })
    }

    pub async fn list_conflicts(&self, project_id: &str) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.store.list_conflicts(project_id).await?)
    }

    /// Applies a merge strategy to a recorded conflict and marks it resolved.
    /// The merged record replaces the local copy; pushing a `LocalWins` or
    /// `Manual` result back upstream is a separate, explicit action.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        strategy: MergeStrategy,
        manual_override: Option<&Value>,
    ) -> Result<(), EngineError> {
        let row = self
            .store
            .get_conflict(id)
            .await?
            .ok_or(EngineError::ConflictNotFound(id))?;
        let merged = conflict::merge(
            &row.local_snapshot,
            &row.server_snapshot,
            strategy,
            manual_override,
        )?;

        self.store
            .put_entity(&EntityRecord {
                project_id: row.project_id.clone(),
                kind: row.kind,
                entity_id: row.entity_id.clone(),
                payload: merged,
                server_snapshot: Some(row.server_snapshot.clone()),
                synced_at: Some(now_unix()),
                synced: true,
            })
            .await?;
        self.store.mark_conflict_resolved(id).await?;
        tracing::info!(
            project = %row.project_id,
            table = row.kind.as_str(),
            entity = %row.entity_id,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        Ok(())
    }

    /// Puts an exhausted action back into rotation after an explicit request.
    pub async fn retry_action(&self, id: Uuid) -> Result<(), EngineError> {
        let mut action = self
            .store
            .get_action(id)
            .await?
            .ok_or(EngineError::ActionNotFound(id))?;
        retry::reset_for_manual_retry(&mut action);
        self.store.update_action(&action).await?;
        Ok(())
    }

    pub async fn discard_action(&self, id: Uuid) -> Result<(), EngineError> {
        let action = self
            .store
            .get_action(id)
            .await?
            .ok_or(EngineError::ActionNotFound(id))?;
        self.store.delete_action(action.id).await?;
        Ok(())
    }

    fn begin_sync(&self, project_id: &str) -> Option<SyncGuard<'_>> {
        let mut state = self.lock_state();
        if !state.active.insert(project_id.to_string()) {
            return None;
        }
        state
            .progress
            .insert(project_id.to_string(), SyncProgress::default());
        Some(SyncGuard {
            engine: self,
            project_id: project_id.to_string(),
        })
    }

    fn set_progress(&self, project_id: &str, phase: SyncPhase, done: usize, total: usize) {
        self.lock_state()
            .progress
            .insert(project_id.to_string(), SyncProgress { phase, done, total });
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
