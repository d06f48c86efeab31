//! Field-level diff and merge between a local and a server version of the
//! same entity. Operates on JSON objects; entity payloads are always objects
//! in this system.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Bookkeeping fields that never count as divergence.
pub const IGNORED_FIELDS: &[&str] = &["synced_at", "created_at", "updated_at"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("manual merge requires a manual override")]
    MissingManualOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    ServerWins,
    LocalWins,
    Manual,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::ServerWins => "server_wins",
            MergeStrategy::LocalWins => "local_wins",
            MergeStrategy::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "server_wins" => Some(MergeStrategy::ServerWins),
            "local_wins" => Some(MergeStrategy::LocalWins),
            "manual" => Some(MergeStrategy::Manual),
            _ => None,
        }
    }
}

/// Names of the fields whose values differ between the two versions, using
/// deep structural equality for nested values. Fields in `ignored` are
/// skipped. Sorted for deterministic output; order carries no meaning.
pub fn diff(local: &Value, server: &Value, ignored: &[&str]) -> Vec<String> {
    let local = as_object(local);
    let server = as_object(server);

    let mut fields: Vec<String> = local
        .keys()
        .chain(server.keys())
        .filter(|key| !ignored.contains(&key.as_str()))
        .filter(|key| local.get(key.as_str()) != server.get(key.as_str()))
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

/// Reconciles two versions of an entity. `ServerWins` and `LocalWins` return
/// their side verbatim; `Manual` layers local, then server, then the
/// override, so override fields always win over both. `Manual` without an
/// override is a contract violation and raises rather than silently picking
/// a winner.
pub fn merge(
    local: &Value,
    server: &Value,
    strategy: MergeStrategy,
    manual_override: Option<&Value>,
) -> Result<Value, ConflictError> {
    match strategy {
        MergeStrategy::ServerWins => Ok(server.clone()),
        MergeStrategy::LocalWins => Ok(local.clone()),
        MergeStrategy::Manual => {
            let manual_override =
                manual_override.ok_or(ConflictError::MissingManualOverride)?;
            let mut merged = as_object(local).clone();
            for (key, value) in as_object(server) {
                merged.insert(key.clone(), value.clone());
            }
            for (key, value) in as_object(manual_override) {
                merged.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(merged))
        }
    }
}

fn as_object(value: &Value) -> &Map<String, Value> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    value
        .as_object()
        .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_reports_divergent_fields_only() {
        let local = json!({ "weld_id": "W-001", "executed": true, "welder": "WLD-7" });
        let server = json!({ "weld_id": "W-001", "executed": false, "welder": "WLD-7" });

        assert_eq!(diff(&local, &server, &[]), vec!["executed"]);
    }

    #[test]
    fn diff_sees_fields_missing_on_one_side() {
        let local = json!({ "weld_id": "W-001", "comment": "root pass" });
        let server = json!({ "weld_id": "W-001", "inspector": "QA-2" });

        assert_eq!(diff(&local, &server, &[]), vec!["comment", "inspector"]);
    }

    #[test]
    fn diff_uses_deep_equality_for_nested_values() {
        let local = json!({ "joint": { "size": 6, "schedule": "40" } });
        let server = json!({ "joint": { "size": 6, "schedule": "80" } });

        assert_eq!(diff(&local, &server, &[]), vec!["joint"]);

        let same = json!({ "joint": { "size": 6, "schedule": "40" } });
        assert!(diff(&local, &same, &[]).is_empty());
    }

    #[test]
    fn diff_skips_ignored_bookkeeping_fields() {
        let local = json!({ "weld_id": "W-001", "updated_at": 10, "synced_at": 11 });
        let server = json!({ "weld_id": "W-001", "updated_at": 20, "synced_at": 21 });

        assert!(diff(&local, &server, IGNORED_FIELDS).is_empty());
    }

    #[test]
    fn merge_is_idempotent_on_equal_inputs() {
        let record = json!({ "spool_id": "SP-42", "phase": "welded" });

        assert_eq!(
            merge(&record, &record, MergeStrategy::ServerWins, None).unwrap(),
            record
        );
        assert_eq!(
            merge(&record, &record, MergeStrategy::LocalWins, None).unwrap(),
            record
        );
    }

    #[test]
    fn server_wins_returns_server_verbatim() {
        let local = json!({ "phase": "fabricated" });
        let server = json!({ "phase": "erected", "location": "rack 3" });

        assert_eq!(
            merge(&local, &server, MergeStrategy::ServerWins, None).unwrap(),
            server
        );
    }

    #[test]
    fn manual_without_override_raises() {
        let local = json!({ "phase": "fabricated" });
        let server = json!({ "phase": "erected" });

        assert_eq!(
            merge(&local, &server, MergeStrategy::Manual, None),
            Err(ConflictError::MissingManualOverride)
        );
    }

    #[test]
    fn manual_override_wins_over_both_sides() {
        let local = json!({ "phase": "fabricated", "crew": "C-1", "note": "local" });
        let server = json!({ "phase": "erected", "crew": "C-2" });
        let manual = json!({ "phase": "tested" });

        let merged = merge(&local, &server, MergeStrategy::Manual, Some(&manual)).unwrap();

        assert_eq!(merged["phase"], "tested");
        assert_eq!(merged["crew"], "C-2");
        assert_eq!(merged["note"], "local");
    }
}
