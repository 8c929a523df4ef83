//! Durable sync state: the last daily-reset date and the catalog cursor.
//!
//! On-disk layout, shared with the storefront scripts:
//! `{"inventory_last_reset_date": "YYYY-MM-DD", "catalog_items": {"id": "<cursor>"}}`.
//!
//! A known key holding the wrong type reads as absent; only a file that is
//! not JSON at all fails to load.
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StateError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(
        rename = "inventory_last_reset_date",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    last_reset_date: Option<String>,
    #[serde(
        rename = "catalog_items",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    catalog_items: Option<CursorEntry>,
    /// Keys written by other tools are carried through untouched.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CursorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

impl SyncState {
    pub fn last_reset_date(&self) -> Option<NaiveDate> {
        self.last_reset_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
    }

    pub fn cursor(&self) -> Option<&str> {
        self.catalog_items
            .as_ref()
            .and_then(|c| c.id.as_deref())
            .filter(|c| !c.trim().is_empty())
    }

    pub fn set_cursor(&mut self, cursor: Option<&str>) {
        self.catalog_items = cursor
            .filter(|c| !c.trim().is_empty())
            .map(|c| CursorEntry {
                id: Some(c.to_string()),
            });
    }

    /// Clear the cursor and stamp `today` if the stored date differs.
    /// Returns whether a reset happened.
    pub fn apply_daily_reset(&mut self, today: NaiveDate) -> bool {
        if self.last_reset_date() == Some(today) {
            return false;
        }
        self.last_reset_date = Some(today.format("%Y-%m-%d").to_string());
        self.catalog_items = None;
        true
    }
}

/// Storage contract for [`SyncState`]. The orchestrator is the only writer.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the state; a store that has never been written yields the default.
    async fn load(&self) -> Result<SyncState, StateError>;

    /// Replace the state atomically: readers see either the old or the new value.
    async fn save(&self, state: &SyncState) -> Result<(), StateError>;

    /// Human-readable location for summaries and alerts.
    fn describe(&self) -> String;
}

/// JSON file written via temp file + fsync + rename.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn json_err(&self, source: serde_json::Error) -> StateError {
        StateError::Json {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Make the rename itself durable.
    #[cfg(unix)]
    async fn sync_parent_dir(&self) -> Result<(), StateError> {
        let dir = fs::File::open(self.parent_dir())
            .await
            .map_err(|e| self.io_err(e))?;
        dir.sync_all().await.map_err(|e| self.io_err(e))
    }

    #[cfg(not(unix))]
    async fn sync_parent_dir(&self) -> Result<(), StateError> {
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateFile {
    async fn load(&self) -> Result<SyncState, StateError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncState::default())
            }
            Err(err) => return Err(self.io_err(err)),
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| self.json_err(e))?;
        if !value.is_object() {
            warn!(path = %self.path.display(), "state file is not a JSON object; starting fresh");
            return Ok(SyncState::default());
        }
        serde_json::from_value(value).map_err(|e| self.json_err(e))
    }

    async fn save(&self, state: &SyncState) -> Result<(), StateError> {
        fs::create_dir_all(self.parent_dir())
            .await
            .map_err(|e| self.io_err(e))?;
        // Round-trip through Value so keys come out sorted.
        let value = serde_json::to_value(state).map_err(|e| self.json_err(e))?;
        let mut body = serde_json::to_string_pretty(&value).map_err(|e| self.json_err(e))?;
        body.push('\n');

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).await.map_err(|e| self.io_err(e))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        self.sync_parent_dir().await?;
        debug!(path = %self.path.display(), cursor = ?state.cursor(), "state saved");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let td = tempdir().unwrap();
        let store = JsonStateFile::new(td.path().join("nope.json"));
        let state = store.load().await.unwrap();
        assert_eq!(state, SyncState::default());
        assert_eq!(state.cursor(), None);
        assert_eq!(state.last_reset_date(), None);
    }

    #[tokio::test]
    async fn save_then_load_keeps_layout() {
        let td = tempdir().unwrap();
        let path = td.path().join("nested").join("state.json");
        let store = JsonStateFile::new(&path);

        let mut state = SyncState::default();
        state.apply_daily_reset(day("2025-03-01"));
        state.set_cursor(Some("CURSOR-1"));
        store.save(&state).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            raw,
            "{\n  \"catalog_items\": {\n    \"id\": \"CURSOR-1\"\n  },\n  \"inventory_last_reset_date\": \"2025-03-01\"\n}\n"
        );
        assert!(!td.path().join("nested").join("state.json.tmp").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.cursor(), Some("CURSOR-1"));
        assert_eq!(loaded.last_reset_date(), Some(day("2025-03-01")));
    }

    #[tokio::test]
    async fn unknown_keys_survive_rewrite() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"inventory_last_reset_date":"2025-03-01","catalog_items":{"id":"c"},"other_key":42}"#,
        )
        .unwrap();
        let store = JsonStateFile::new(&path);
        let mut state = store.load().await.unwrap();
        state.set_cursor(None);
        store.save(&state).await.unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["other_key"], 42);
        assert!(value.get("catalog_items").is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonStateFile::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Json { .. }));
    }

    #[tokio::test]
    async fn wrong_typed_cursor_reads_as_absent() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"inventory_last_reset_date":"2025-03-01","catalog_items":"abc","other_key":[1]}"#,
        )
        .unwrap();
        let store = JsonStateFile::new(&path);
        let mut state = store.load().await.unwrap();
        assert_eq!(state.cursor(), None);
        assert_eq!(state.last_reset_date(), Some(day("2025-03-01")));

        state.set_cursor(Some("next"));
        store.save(&state).await.unwrap();
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["catalog_items"]["id"], "next");
        assert_eq!(value["other_key"][0], 1);
    }

    #[tokio::test]
    async fn wrong_typed_date_forces_reset() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"inventory_last_reset_date":20250301,"catalog_items":{"id":7}}"#,
        )
        .unwrap();
        let mut state = JsonStateFile::new(&path).load().await.unwrap();
        assert_eq!(state.last_reset_date(), None);
        assert_eq!(state.cursor(), None);
        assert!(state.apply_daily_reset(day("2025-03-02")));
    }

    #[tokio::test]
    async fn non_object_file_is_empty_state() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let state = JsonStateFile::new(&path).load().await.unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn bare_file_name_lives_in_current_dir() {
        assert_eq!(JsonStateFile::new("state.json").parent_dir(), Path::new("."));
        assert_eq!(
            JsonStateFile::new("/var/lib/sync/state.json").parent_dir(),
            Path::new("/var/lib/sync")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parent_dir_sync_reports_missing_dir() {
        let td = tempdir().unwrap();
        let store = JsonStateFile::new(td.path().join("state.json"));
        store.sync_parent_dir().await.unwrap();

        let gone = JsonStateFile::new(td.path().join("gone").join("state.json"));
        let err = gone.sync_parent_dir().await.unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }

    #[test]
    fn daily_reset_clears_cursor_once_per_day() {
        let mut state = SyncState::default();
        state.set_cursor(Some("old"));
        assert!(state.apply_daily_reset(day("2025-03-02")));
        assert_eq!(state.cursor(), None);

        state.set_cursor(Some("fresh"));
        assert!(!state.apply_daily_reset(day("2025-03-02")));
        assert_eq!(state.cursor(), Some("fresh"));

        assert!(state.apply_daily_reset(day("2025-03-03")));
        assert_eq!(state.cursor(), None);
    }

    #[test]
    fn unparseable_date_forces_reset() {
        let mut state: SyncState =
            serde_json::from_str(r#"{"inventory_last_reset_date":"yesterday","catalog_items":{"id":"x"}}"#)
                .unwrap();
        assert!(state.apply_daily_reset(day("2025-03-02")));
        assert_eq!(state.cursor(), None);
    }
}
