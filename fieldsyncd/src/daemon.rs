use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fieldsync_core::RemoteClient;
use fieldsync_engine::{LocalStore, SyncEngine};
use tokio::time::MissedTickBehavior;

const DEFAULT_DB_PATH: &str = "fieldsync.db";
const DEFAULT_POLL_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub api_token: String,
    pub db_path: String,
    pub projects: Vec<String>,
    pub poll_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_url =
            std::env::var("FIELDSYNC_API_URL").context("FIELDSYNC_API_URL is not set")?;
        let api_token =
            std::env::var("FIELDSYNC_API_TOKEN").context("FIELDSYNC_API_TOKEN is not set")?;
        let db_path =
            std::env::var("FIELDSYNC_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let projects = std::env::var("FIELDSYNC_PROJECTS")
            .ok()
            .map(|value| parse_project_list(&value))
            .unwrap_or_default();
        anyhow::ensure!(
            !projects.is_empty(),
            "FIELDSYNC_PROJECTS must name at least one project id"
        );
        let poll_interval =
            Duration::from_secs(read_u64_env("FIELDSYNC_POLL_SECS", DEFAULT_POLL_SECS));

        Ok(Self {
            api_url,
            api_token,
            db_path,
            projects,
            poll_interval,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = RemoteClient::new(&config.api_url, config.api_token.clone())
            .context("invalid FIELDSYNC_API_URL")?;
        let store = LocalStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open local database at {}", config.db_path))?;

        // Actions left in flight by a crashed run go back into rotation.
        let swept = store
            .reset_syncing_actions()
            .await
            .context("failed to reset in-flight actions")?;
        if swept > 0 {
            tracing::info!(count = swept, "requeued actions left in flight by a previous run");
        }

        let engine = Arc::new(SyncEngine::new(client, store));
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    /// Runs a single sync pass over every configured project and exits.
    pub async fn run_once(self) -> anyhow::Result<()> {
        self.sync_all().await;
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            db = %self.config.db_path,
            projects = ?self.config.projects,
            poll_secs = self.config.poll_interval.as_secs(),
            "fieldsyncd started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_all().await,
                res = tokio::signal::ctrl_c() => {
                    res.context("failed to listen for shutdown signal")?;
                    tracing::info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    async fn sync_all(&self) {
        for project_id in &self.config.projects {
            match self.engine.sync_project(project_id).await {
                Ok(report) if report.ran => {
                    tracing::info!(
                        project = %project_id,
                        uploaded = report.uploaded,
                        failed = report.failed,
                        pulled = report.pulled,
                        conflicts = report.conflicts,
                        "sync pass finished"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(project = %project_id, error = %err, "sync pass aborted");
                }
            }
        }
    }
}

fn parse_project_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_project_list_splits_and_trims() {
        let projects = parse_project_list("p-100, p-200 ,,p-300");
        assert_eq!(projects, vec!["p-100", "p-200", "p-300"]);
    }

    #[test]
    fn parse_project_list_empty_input_yields_nothing() {
        assert!(parse_project_list("").is_empty());
        assert!(parse_project_list(" , ").is_empty());
    }

    #[test]
    fn read_u64_env_falls_back_on_missing_or_invalid() {
        assert_eq!(read_u64_env("FIELDSYNC_TEST_UNSET_VAR", 300), 300);
    }

    #[tokio::test]
    async fn bootstrap_opens_database_at_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("field.db");
        let config = DaemonConfig {
            api_url: "http://127.0.0.1:9/".to_string(),
            api_token: "token".to_string(),
            db_path: db_path.to_string_lossy().into_owned(),
            projects: vec!["p-100".to_string()],
            poll_interval: Duration::from_secs(300),
        };

        let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
        assert!(db_path.exists());
        let status = runtime.engine().status("p-100").await.unwrap();
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync.is_none());
    }
}
