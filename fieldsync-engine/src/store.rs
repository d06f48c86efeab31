//! Persistent local cache: mirrored entity tables plus the engine-owned
//! pending-action, conflict and metadata tables, all in one SQLite database.

use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::action::{Action, ActionStatus, PendingAction};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid entity kind: {0}")]
    InvalidEntityKind(String),
    #[error("invalid action status: {0}")]
    InvalidActionStatus(String),
    #[error("invalid action id: {0}")]
    InvalidActionId(String),
}

/// The closed set of remote tables mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Isometric,
    Spool,
    Weld,
    PhotoSurvey,
    Personnel,
    Crew,
    DailyReport,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Isometric,
        EntityKind::Spool,
        EntityKind::Weld,
        EntityKind::PhotoSurvey,
        EntityKind::Personnel,
        EntityKind::Crew,
        EntityKind::DailyReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Isometric => "isometric",
            EntityKind::Spool => "spool",
            EntityKind::Weld => "weld",
            EntityKind::PhotoSurvey => "photo_survey",
            EntityKind::Personnel => "personnel",
            EntityKind::Crew => "crew",
            EntityKind::DailyReport => "daily_report",
        }
    }

    /// URL path segment of the corresponding remote table.
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityKind::Isometric => "isometrics",
            EntityKind::Spool => "spools",
            EntityKind::Weld => "welds",
            EntityKind::PhotoSurvey => "photo-surveys",
            EntityKind::Personnel => "personnel",
            EntityKind::Crew => "crews",
            EntityKind::DailyReport => "daily-reports",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "isometric" => Ok(EntityKind::Isometric),
            "spool" => Ok(EntityKind::Spool),
            "weld" => Ok(EntityKind::Weld),
            "photo_survey" => Ok(EntityKind::PhotoSurvey),
            "personnel" => Ok(EntityKind::Personnel),
            "crew" => Ok(EntityKind::Crew),
            "daily_report" => Ok(EntityKind::DailyReport),
            other => Err(StoreError::InvalidEntityKind(other.to_string())),
        }
    }
}

/// One locally cached entity. `payload` is the local copy; `server_snapshot`
/// is the last version confirmed from the server (None for records created
/// offline and never uploaded). A record is locally modified iff `payload`
/// differs from `server_snapshot`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub project_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
    pub payload: Value,
    pub server_snapshot: Option<Value>,
    pub synced_at: Option<i64>,
    pub synced: bool,
}

/// A recorded divergence between local and server state, awaiting explicit
/// resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: i64,
    pub project_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
    pub local_snapshot: Value,
    pub server_snapshot: Value,
    pub conflicting_fields: Vec<String>,
    pub resolved: bool,
    pub created_at: i64,
}

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn get_entity(
        &self,
        project_id: &str,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT project_id, kind, entity_id, payload, server_snapshot, synced_at, synced
             FROM entities
             WHERE project_id = ?1 AND kind = ?2 AND entity_id = ?3",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_entity_row).transpose()
    }

    pub async fn put_entity(&self, entity: &EntityRecord) -> Result<(), StoreError> {
        sqlx::query(UPSERT_ENTITY)
            .bind(&entity.project_id)
            .bind(entity.kind.as_str())
            .bind(&entity.entity_id)
            .bind(serde_json::to_string(&entity.payload)?)
            .bind(
                entity
                    .server_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(entity.synced_at)
            .bind(if entity.synced { 1 } else { 0 })
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bulk upsert inside one transaction, so a crash mid-pull never leaves a
    /// table half old / half new.
    pub async fn put_entities(&self, entities: &[EntityRecord]) -> Result<(), StoreError> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            sqlx::query(UPSERT_ENTITY)
                .bind(&entity.project_id)
                .bind(entity.kind.as_str())
                .bind(&entity.entity_id)
                .bind(serde_json::to_string(&entity.payload)?)
                .bind(
                    entity
                        .server_snapshot
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                )
                .bind(entity.synced_at)
                .bind(if entity.synced { 1 } else { 0 })
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT project_id, kind, entity_id, payload, server_snapshot, synced_at, synced
             FROM entities
             WHERE project_id = ?1 AND kind = ?2
             ORDER BY entity_id ASC",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_entity_row).collect()
    }

    pub async fn delete_entity(
        &self,
        project_id: &str,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM entities WHERE project_id = ?1 AND kind = ?2 AND entity_id = ?3",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_entities(
        &self,
        project_id: &str,
        kind: EntityKind,
        entity_ids: &[String],
    ) -> Result<(), StoreError> {
        if entity_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entity_id in entity_ids {
            sqlx::query(
                "DELETE FROM entities WHERE project_id = ?1 AND kind = ?2 AND entity_id = ?3",
            )
            .bind(project_id)
            .bind(kind.as_str())
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn enqueue_action(&self, action: &PendingAction) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_actions (
                id, project_id, payload, status, retry_count,
                next_retry_at, last_error_at, error_message, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(action.id.to_string())
        .bind(&action.project_id)
        .bind(serde_json::to_string(&action.action)?)
        .bind(action.status.as_str())
        .bind(i64::from(action.retry_count))
        .bind(action.next_retry_at)
        .bind(action.last_error_at)
        .bind(&action.error_message)
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_action(&self, id: Uuid) -> Result<Option<PendingAction>, StoreError> {
        let row = sqlx::query(
            "SELECT id, project_id, payload, status, retry_count,
                    next_retry_at, last_error_at, error_message, created_at
             FROM pending_actions WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_action_row).transpose()
    }

    pub async fn list_actions(&self, project_id: &str) -> Result<Vec<PendingAction>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, payload, status, retry_count,
                    next_retry_at, last_error_at, error_message, created_at
             FROM pending_actions
             WHERE project_id = ?1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_action_row).collect()
    }

    pub async fn update_action(&self, action: &PendingAction) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_actions SET
                payload = ?2,
                status = ?3,
                retry_count = ?4,
                next_retry_at = ?5,
                last_error_at = ?6,
                error_message = ?7
             WHERE id = ?1",
        )
        .bind(action.id.to_string())
        .bind(serde_json::to_string(&action.action)?)
        .bind(action.status.as_str())
        .bind(i64::from(action.retry_count))
        .bind(action.next_retry_at)
        .bind(action.last_error_at)
        .bind(&action.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_action(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_actions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_actions(&self, project_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_actions WHERE project_id = ?1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    /// Startup sweep: any action left `syncing` by an abrupt termination has
    /// no resolution path, so it goes back to `pending`.
    pub async fn reset_syncing_actions(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE pending_actions SET status = 'pending' WHERE status = 'syncing'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Records a divergence for an entity. At most one unresolved conflict
    /// exists per entity; re-detection refreshes the stored snapshots and
    /// field list instead of accumulating duplicates.
    pub async fn record_conflict(
        &self,
        project_id: &str,
        kind: EntityKind,
        entity_id: &str,
        local_snapshot: &Value,
        server_snapshot: &Value,
        conflicting_fields: &[String],
        created_at: i64,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO conflicts (
                project_id, kind, entity_id, local_snapshot, server_snapshot,
                conflicting_fields, resolved, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT(project_id, kind, entity_id) WHERE resolved = 0 DO UPDATE SET
                local_snapshot = excluded.local_snapshot,
                server_snapshot = excluded.server_snapshot,
                conflicting_fields = excluded.conflicting_fields",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(serde_json::to_string(local_snapshot)?)
        .bind(serde_json::to_string(server_snapshot)?)
        .bind(serde_json::to_string(conflicting_fields)?)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id FROM conflicts
             WHERE project_id = ?1 AND kind = ?2 AND entity_id = ?3 AND resolved = 0",
        )
        .bind(project_id)
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_conflict(&self, id: i64) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, project_id, kind, entity_id, local_snapshot, server_snapshot,
                    conflicting_fields, resolved, created_at
             FROM conflicts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_conflict_row).transpose()
    }

    /// Unresolved conflicts for a project, oldest first.
    pub async fn list_conflicts(&self, project_id: &str) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, kind, entity_id, local_snapshot, server_snapshot,
                    conflicting_fields, resolved, created_at
             FROM conflicts
             WHERE project_id = ?1 AND resolved = 0
             ORDER BY id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_conflict_row).collect()
    }

    pub async fn mark_conflict_resolved(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE conflicts SET resolved = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_conflicts(&self, project_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM conflicts WHERE project_id = ?1 AND resolved = 0",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    pub async fn set_metadata(&self, key: &str, value: &str, now: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metadata (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<String, _>("value"))
            .transpose()?)
    }

    pub async fn last_sync(&self, project_id: &str) -> Result<Option<i64>, StoreError> {
        let value = self.get_metadata(&last_sync_key(project_id)).await?;
        Ok(value.and_then(|value| value.parse::<i64>().ok()))
    }

    pub async fn set_last_sync(&self, project_id: &str, now: i64) -> Result<(), StoreError> {
        self.set_metadata(&last_sync_key(project_id), &now.to_string(), now)
            .await
    }
}

fn last_sync_key(project_id: &str) -> String {
    format!("last_sync_{project_id}")
}

fn parse_entity_row(row: sqlx::sqlite::SqliteRow) -> Result<EntityRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let server_snapshot: Option<String> = row.try_get("server_snapshot")?;
    let synced: i64 = row.try_get("synced")?;
    Ok(EntityRecord {
        project_id: row.try_get("project_id")?,
        kind: EntityKind::parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        payload: serde_json::from_str(&payload)?,
        server_snapshot: server_snapshot
            .map(|snapshot| serde_json::from_str(&snapshot))
            .transpose()?,
        synced_at: row.try_get("synced_at")?,
        synced: synced != 0,
    })
}

fn parse_action_row(row: sqlx::sqlite::SqliteRow) -> Result<PendingAction, StoreError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let action: Action = serde_json::from_str(&payload)?;
    Ok(PendingAction {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::InvalidActionId(id))?,
        project_id: row.try_get("project_id")?,
        action,
        status: ActionStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidActionStatus(status.clone()))?,
        retry_count: retry_count.max(0) as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error_at: row.try_get("last_error_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_conflict_row(row: sqlx::sqlite::SqliteRow) -> Result<ConflictRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let local_snapshot: String = row.try_get("local_snapshot")?;
    let server_snapshot: String = row.try_get("server_snapshot")?;
    let conflicting_fields: String = row.try_get("conflicting_fields")?;
    let resolved: i64 = row.try_get("resolved")?;
    Ok(ConflictRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        kind: EntityKind::parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        local_snapshot: serde_json::from_str(&local_snapshot)?,
        server_snapshot: serde_json::from_str(&server_snapshot)?,
        conflicting_fields: serde_json::from_str(&conflicting_fields)?,
        resolved: resolved != 0,
        created_at: row.try_get("created_at")?,
    })
}

const UPSERT_ENTITY: &str = "INSERT INTO entities (
        project_id, kind, entity_id, payload, server_snapshot, synced_at, synced
     )
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(project_id, kind, entity_id) DO UPDATE SET
        payload = excluded.payload,
        server_snapshot = excluded.server_snapshot,
        synced_at = excluded.synced_at,
        synced = excluded.synced";

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS entities (
        project_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        server_snapshot TEXT,
        synced_at INTEGER,
        synced INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (project_id, kind, entity_id)
    )",
    "CREATE TABLE IF NOT EXISTS pending_actions (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at INTEGER,
        last_error_at INTEGER,
        error_message TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pending_actions_project
        ON pending_actions (project_id, created_at)",
    "CREATE TABLE IF NOT EXISTS conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        local_snapshot TEXT NOT NULL,
        server_snapshot TEXT NOT NULL,
        conflicting_fields TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_unresolved_entity
        ON conflicts (project_id, kind, entity_id) WHERE resolved = 0",
    "CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use fieldsync_core::{ExecuteWeldRequest, UpdateSpoolPhaseRequest};
    use serde_json::json;

    async fn make_store() -> LocalStore {
        LocalStore::open_in_memory().await.unwrap()
    }

    fn weld_record(project: &str, id: &str, executed: bool) -> EntityRecord {
        let payload = json!({ "weld_id": id, "executed": executed });
        EntityRecord {
            project_id: project.to_string(),
            kind: EntityKind::Weld,
            entity_id: id.to_string(),
            payload: payload.clone(),
            server_snapshot: Some(payload),
            synced_at: Some(1_700_000_000),
            synced: true,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = make_store().await;
        let record = weld_record("p-100", "W-001", false);

        store.put_entity(&record).await.unwrap();
        let fetched = store
            .get_entity("p-100", EntityKind::Weld, "W-001")
            .await
            .unwrap();

        assert_eq!(fetched, Some(record));
    }

    #[tokio::test]
    async fn put_replaces_whole_record() {
        let store = make_store().await;
        store
            .put_entity(&weld_record("p-100", "W-001", false))
            .await
            .unwrap();

        let mut updated = weld_record("p-100", "W-001", true);
        updated.synced = false;
        store.put_entity(&updated).await.unwrap();

        let fetched = store
            .get_entity("p-100", EntityKind::Weld, "W-001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.payload["executed"], json!(true));
        assert!(!fetched.synced);
    }

    #[tokio::test]
    async fn queries_are_scoped_by_project() {
        let store = make_store().await;
        store
            .put_entity(&weld_record("p-100", "W-001", false))
            .await
            .unwrap();
        store
            .put_entity(&weld_record("p-200", "W-002", false))
            .await
            .unwrap();

        let listed = store.list_entities("p-100", EntityKind::Weld).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entity_id, "W-001");

        assert!(
            store
                .get_entity("p-200", EntityKind::Weld, "W-001")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn bulk_put_writes_all_records() {
        let store = make_store().await;
        let batch: Vec<EntityRecord> = (0..5)
            .map(|i| weld_record("p-100", &format!("W-{i:03}"), false))
            .collect();

        store.put_entities(&batch).await.unwrap();

        let listed = store.list_entities("p-100", EntityKind::Weld).await.unwrap();
        assert_eq!(listed.len(), 5);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = make_store().await;
        store
            .put_entity(&weld_record("p-100", "W-001", false))
            .await
            .unwrap();

        store
            .delete_entity("p-100", EntityKind::Weld, "W-001")
            .await
            .unwrap();

        assert!(
            store
                .get_entity("p-100", EntityKind::Weld, "W-001")
                .await
                .unwrap()
                .is_none()
        );
    }

    fn make_action(project: &str) -> PendingAction {
        PendingAction::new(
            project,
            Action::ExecuteWeld(ExecuteWeldRequest {
                weld_id: "W-001".into(),
                welder_id: "WLD-7".into(),
                executed_on: "2026-02-14".into(),
                comment: None,
            }),
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn enqueue_and_fetch_action() {
        let store = make_store().await;
        let action = make_action("p-100");

        store.enqueue_action(&action).await.unwrap();
        let fetched = store.get_action(action.id).await.unwrap();

        assert_eq!(fetched, Some(action));
    }

    #[tokio::test]
    async fn update_action_persists_retry_state() {
        let store = make_store().await;
        let mut action = make_action("p-100");
        store.enqueue_action(&action).await.unwrap();

        crate::retry::record_failure(&mut action, "503", 1_700_000_100);
        store.update_action(&action).await.unwrap();

        let fetched = store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ActionStatus::Error);
        assert_eq!(fetched.retry_count, 1);
        assert_eq!(fetched.next_retry_at, Some(1_700_000_105));
        assert_eq!(fetched.error_message.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn delete_action_leaves_no_trace() {
        let store = make_store().await;
        let action = make_action("p-100");
        store.enqueue_action(&action).await.unwrap();

        store.delete_action(action.id).await.unwrap();

        assert!(store.get_action(action.id).await.unwrap().is_none());
        assert_eq!(store.count_actions("p-100").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_actions_is_project_scoped_and_ordered() {
        let store = make_store().await;
        let mut first = make_action("p-100");
        first.created_at = 100;
        let mut second = make_action("p-100");
        second.created_at = 200;
        let other = make_action("p-200");
        store.enqueue_action(&second).await.unwrap();
        store.enqueue_action(&first).await.unwrap();
        store.enqueue_action(&other).await.unwrap();

        let listed = store.list_actions("p-100").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn reset_syncing_actions_returns_orphans_to_pending() {
        let store = make_store().await;
        let mut stuck = make_action("p-100");
        stuck.status = ActionStatus::Syncing;
        let untouched = make_action("p-100");
        store.enqueue_action(&stuck).await.unwrap();
        store.enqueue_action(&untouched).await.unwrap();

        let swept = store.reset_syncing_actions().await.unwrap();
        assert_eq!(swept, 1);

        let fetched = store.get_action(stuck.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn conflicts_deduplicate_per_entity() {
        let store = make_store().await;
        let local = json!({ "executed": true });
        let server = json!({ "executed": false });

        let first = store
            .record_conflict(
                "p-100",
                EntityKind::Weld,
                "W-001",
                &local,
                &server,
                &["executed".to_string()],
                1_000,
            )
            .await
            .unwrap();
        let newer_server = json!({ "executed": false, "inspector": "QA-2" });
        let second = store
            .record_conflict(
                "p-100",
                EntityKind::Weld,
                "W-001",
                &local,
                &newer_server,
                &["executed".to_string(), "inspector".to_string()],
                2_000,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        let conflicts = store.list_conflicts("p-100").await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_snapshot, newer_server);
        assert_eq!(conflicts[0].conflicting_fields.len(), 2);
    }

    #[tokio::test]
    async fn resolved_conflicts_leave_the_unresolved_view() {
        let store = make_store().await;
        let id = store
            .record_conflict(
                "p-100",
                EntityKind::Spool,
                "SP-42",
                &json!({ "phase": "welded" }),
                &json!({ "phase": "erected" }),
                &["phase".to_string()],
                1_000,
            )
            .await
            .unwrap();

        store.mark_conflict_resolved(id).await.unwrap();

        assert!(store.list_conflicts("p-100").await.unwrap().is_empty());
        assert_eq!(store.count_conflicts("p-100").await.unwrap(), 0);
        let fetched = store.get_conflict(id).await.unwrap().unwrap();
        assert!(fetched.resolved);
    }

    #[tokio::test]
    async fn resolving_allows_a_new_conflict_for_same_entity() {
        let store = make_store().await;
        let first = store
            .record_conflict(
                "p-100",
                EntityKind::Spool,
                "SP-42",
                &json!({ "phase": "welded" }),
                &json!({ "phase": "erected" }),
                &["phase".to_string()],
                1_000,
            )
            .await
            .unwrap();
        store.mark_conflict_resolved(first).await.unwrap();

        let second = store
            .record_conflict(
                "p-100",
                EntityKind::Spool,
                "SP-42",
                &json!({ "phase": "tested" }),
                &json!({ "phase": "insulated" }),
                &["phase".to_string()],
                2_000,
            )
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(store.count_conflicts("p-100").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_sync_round_trips_through_metadata() {
        let store = make_store().await;
        assert_eq!(store.last_sync("p-100").await.unwrap(), None);

        store.set_last_sync("p-100", 1_700_000_000).await.unwrap();

        assert_eq!(store.last_sync("p-100").await.unwrap(), Some(1_700_000_000));
        assert_eq!(store.last_sync("p-200").await.unwrap(), None);
        assert_eq!(
            store.get_metadata("last_sync_p-100").await.unwrap(),
            Some("1700000000".to_string())
        );
    }

    #[tokio::test]
    async fn entity_kind_strings_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EntityKind::parse("gasket").is_err());
    }

    #[tokio::test]
    async fn update_spool_phase_action_round_trips_through_storage() {
        let store = make_store().await;
        let action = PendingAction::new(
            "p-100",
            Action::UpdateSpoolPhase(UpdateSpoolPhaseRequest {
                spool_id: "SP-42".into(),
                phase: "erected".into(),
            }),
            1_700_000_000,
        );

        store.enqueue_action(&action).await.unwrap();
        let fetched = store.get_action(action.id).await.unwrap().unwrap();

        assert_eq!(fetched.action, action.action);
    }
}
