// ============================
// viewsync-lib/src/logbook.rs
// ============================
//! Append-only JSON event logs with capped tails: one per room, one for
//! the whole process. Writes are serialized per file; the room log is
//! removed together with its room.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AppError;

/// Most recent entries kept in a room log.
pub const ROOM_LOG_CAP: usize = 500;
/// Most recent entries kept in the process-wide log.
pub const GENERAL_LOG_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogDocument {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    room_code: Option<String>,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

/// Flat-file event logs under `data_dir/logs/`.
pub struct Logbook {
    dir: PathBuf,
    /// Per-file write serialization.
    file_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Logbook {
    pub fn new(data_dir: &std::path::Path) -> Result<Self, AppError> {
        let dir = data_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file_locks: DashMap::new(),
        })
    }

    fn room_path(&self, room_code: &str) -> PathBuf {
        self.dir.join(format!("room-{}.json", room_code.to_uppercase()))
    }

    fn general_path(&self) -> PathBuf {
        self.dir.join("general.json")
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn append(
        &self,
        path: PathBuf,
        lock_key: &str,
        room_code: Option<String>,
        cap: usize,
        event: &str,
        detail: Map<String, Value>,
    ) {
        let lock = self.lock_for(lock_key);
        let _guard = lock.lock().await;

        let mut doc = match tokio_fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => LogDocument::default(),
        };
        doc.room_code = room_code;
        doc.logs.push(LogEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            detail,
        });
        if doc.logs.len() > cap {
            let excess = doc.logs.len() - cap;
            doc.logs.drain(..excess);
        }

        match serde_json::to_string(&doc) {
            Ok(json) => {
                if let Err(e) = tokio_fs::write(&path, json).await {
                    warn!(path = %path.display(), error = %e, "failed to write log");
                }
            },
            Err(e) => warn!(error = %e, "failed to serialize log"),
        }
    }

    pub async fn room(&self, room_code: &str, event: &str, detail: Map<String, Value>) {
        let code = room_code.to_uppercase();
        self.append(
            self.room_path(&code),
            &format!("room-{code}"),
            Some(code.clone()),
            ROOM_LOG_CAP,
            event,
            detail,
        )
        .await;
    }

    pub async fn general(&self, event: &str, detail: Map<String, Value>) {
        self.append(
            self.general_path(),
            "general",
            None,
            GENERAL_LOG_CAP,
            event,
            detail,
        )
        .await;
    }

    /// Remove a room's log file (called when the room is deleted).
    pub async fn delete_room_log(&self, room_code: &str) {
        let code = room_code.to_uppercase();
        let lock = self.lock_for(&format!("room-{code}"));
        let _guard = lock.lock().await;
        let _ = tokio_fs::remove_file(self.room_path(&code)).await;
    }

    /// Read back a room log (admin surface and tests).
    pub async fn read_room(&self, room_code: &str) -> Vec<LogEntry> {
        match tokio_fs::read_to_string(self.room_path(&room_code.to_uppercase())).await {
            Ok(content) => serde_json::from_str::<LogDocument>(&content)
                .map(|doc| doc.logs)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

/// Shorthand for building a detail map.
pub fn detail(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (Logbook, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let logbook = Logbook::new(temp_dir.path()).unwrap();
        (logbook, temp_dir)
    }

    #[tokio::test]
    async fn room_log_appends_and_reads_back() {
        let (logbook, _temp_dir) = setup();
        logbook
            .room("abc234", "join", detail(&[("viewer", json!("Alice"))]))
            .await;
        logbook.room("ABC234", "play", detail(&[])).await;

        let entries = logbook.read_room("ABC234").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "join");
        assert_eq!(entries[0].detail["viewer"], "Alice");
    }

    #[tokio::test]
    async fn room_log_caps_at_tail() {
        let (logbook, _temp_dir) = setup();
        for i in 0..(ROOM_LOG_CAP + 20) {
            logbook
                .room("CAPPED", "tick", detail(&[("i", json!(i))]))
                .await;
        }
        let entries = logbook.read_room("CAPPED").await;
        assert_eq!(entries.len(), ROOM_LOG_CAP);
        // oldest entries were dropped
        assert_eq!(entries[0].detail["i"], 20);
        assert_eq!(entries.last().unwrap().detail["i"], ROOM_LOG_CAP + 19);
    }

    #[tokio::test]
    async fn delete_room_log_removes_file() {
        let (logbook, _temp_dir) = setup();
        logbook.room("GONE42", "join", detail(&[])).await;
        assert_eq!(logbook.read_room("GONE42").await.len(), 1);
        logbook.delete_room_log("GONE42").await;
        assert!(logbook.read_room("GONE42").await.is_empty());
    }

    #[tokio::test]
    async fn general_log_is_separate() {
        let (logbook, _temp_dir) = setup();
        logbook.general("boot", detail(&[])).await;
        assert!(logbook.read_room("NOROOM").await.is_empty());
    }
}
