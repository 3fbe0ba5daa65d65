// ============================
// viewsync-lib/src/room.rs
// ============================
//! Rooms and the process-wide room registry.
//!
//! A room owns its viewers, playback machine, and BSL state; connections are
//! referenced by id only, so there are no strong back-edges between rooms
//! and the session layer. All mutation of a room happens under its
//! `RwLock` write guard (single writer per room).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tokio::sync::RwLock;
use tracing::{info, warn};
use viewsync_common::events::{RoomSummary, ViewerSummary};

use crate::bsl::{BslIndex, DriftTable};
use crate::clock;
use crate::error::AppError;
use crate::playback::PlaybackMachine;
use crate::sessions::ConnectionId;

/// Room codes: 6 characters over A-Z 2-9 with the lookalikes (I, O, 0, 1)
/// removed.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LENGTH: usize = 6;

/// A viewer as the room tracks it. The room owns this entry; the viewer's
/// connection merely references it by connection id.
#[derive(Debug, Clone)]
pub struct ViewerInfo {
    pub fingerprint: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// A named, coded session holding one playback state and many viewers.
#[derive(Debug)]
pub struct Room {
    pub code: String,
    pub name: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    /// Immutable after first creation.
    pub admin_fingerprint: Option<String>,
    /// At most one admin connection at a time.
    pub admin_connection_id: Option<ConnectionId>,
    pub viewers: HashMap<ConnectionId, ViewerInfo>,
    pub playback: PlaybackMachine,
    pub bsl: BslIndex,
    pub drift: DriftTable,
}

impl Room {
    fn new(code: String, name: String, private: bool, admin_fingerprint: String) -> Self {
        Self {
            code,
            name,
            private,
            created_at: Utc::now(),
            admin_fingerprint: (!admin_fingerprint.is_empty()).then_some(admin_fingerprint),
            admin_connection_id: None,
            viewers: HashMap::new(),
            playback: PlaybackMachine::default(),
            bsl: BslIndex::default(),
            drift: DriftTable::default(),
        }
    }

    pub fn add_viewer(&mut self, conn_id: ConnectionId, fingerprint: String, display_name: String) {
        self.viewers.insert(
            conn_id,
            ViewerInfo {
                fingerprint,
                display_name,
                joined_at: Utc::now(),
            },
        );
    }

    pub fn remove_viewer(&mut self, conn_id: &str) -> Option<ViewerInfo> {
        if self.admin_connection_id.as_deref() == Some(conn_id) {
            self.admin_connection_id = None;
        }
        self.bsl.remove_connection(conn_id);
        self.viewers.remove(conn_id)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer_summaries(&self) -> Vec<ViewerSummary> {
        let mut viewers: Vec<_> = self.viewers.values().collect();
        viewers.sort_by_key(|v| v.joined_at);
        viewers
            .into_iter()
            .map(|v| ViewerSummary {
                display_name: v.display_name.clone(),
                joined_at: v.joined_at.timestamp_millis(),
            })
            .collect()
    }

    /// Connection ids of every viewer whose fingerprint matches.
    pub fn connections_for_fingerprint(&self, fingerprint: &str) -> Vec<ConnectionId> {
        self.viewers
            .iter()
            .filter(|(_, v)| v.fingerprint == fingerprint)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            name: self.name.clone(),
            viewers: self.viewer_count(),
            created_at: self.created_at.timestamp_millis(),
        }
    }
}

/// Disk record proving which fingerprint created a room. Lets admin
/// authority survive a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAdmin {
    fingerprint: String,
    saved_at: DateTime<Utc>,
}

pub type SharedRoom = Arc<RwLock<Room>>;

/// Create/lookup/destroy rooms and resolve admin authority.
pub struct RoomRegistry {
    rooms: DashMap<String, SharedRoom>,
    admin_table_path: PathBuf,
    admin_table: RwLock<HashMap<String, PersistedAdmin>>,
}

impl RoomRegistry {
    /// Load the registry, reading any persisted admin table from
    /// `data_dir/admin-rooms.json`.
    pub fn new(data_dir: &std::path::Path) -> Self {
        let admin_table_path = data_dir.join("admin-rooms.json");
        let admin_table = std::fs::read_to_string(&admin_table_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            rooms: DashMap::new(),
            admin_table_path,
            admin_table: RwLock::new(admin_table),
        }
    }

    fn generate_code() -> String {
        let mut rng = rand::thread_rng();
        (0..ROOM_CODE_LENGTH)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect()
    }

    /// Create a room with a fresh unique code and persist the creator as
    /// its admin.
    pub async fn create_room(
        &self,
        name: String,
        private: bool,
        admin_fingerprint: String,
    ) -> Result<(String, SharedRoom), AppError> {
        let code = loop {
            let candidate = Self::generate_code();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let room = Arc::new(RwLock::new(Room::new(
            code.clone(),
            name,
            private,
            admin_fingerprint.clone(),
        )));
        self.rooms.insert(code.clone(), room.clone());

        if !admin_fingerprint.is_empty() {
            self.persist_admin(&code, &admin_fingerprint).await;
        }
        metrics::counter!("room.created").increment(1);
        info!(room = %code, "room created");

        Ok((code, room))
    }

    /// Case-insensitive room lookup.
    pub fn find(&self, code: &str) -> Option<SharedRoom> {
        self.rooms
            .get(&code.to_uppercase())
            .map(|r| r.value().clone())
    }

    /// Delete a room. The caller notifies and evicts the viewers with the
    /// returned room handle.
    pub async fn delete_room(
        &self,
        code: &str,
        requester_fingerprint: &str,
    ) -> Result<SharedRoom, AppError> {
        let key = code.to_uppercase();
        if !self.is_admin_fingerprint(&key, requester_fingerprint).await {
            return Err(AppError::Auth(
                "only the room admin can delete the room".to_string(),
            ));
        }
        let (_, room) = self.rooms.remove(&key).ok_or(AppError::RoomNotFound)?;

        self.admin_table.write().await.remove(&key);
        self.write_admin_table().await;
        metrics::counter!("room.deleted").increment(1);
        info!(room = %key, "room deleted");

        Ok(room)
    }

    /// Snapshot of the non-private rooms.
    pub async fn list_public(&self) -> Vec<RoomSummary> {
        let mut summaries = Vec::new();
        // collect handles first so no shard guard is held across an await
        for room in self.all_rooms() {
            let room = room.read().await;
            if !room.private {
                summaries.push(room.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Accept a fingerprint if it matches the in-memory admin fingerprint
    /// or the persisted record for that code. A match from disk
    /// repopulates the in-memory field, which is how admin authority
    /// survives restarts.
    pub async fn is_admin_fingerprint(&self, code: &str, fingerprint: &str) -> bool {
        let key = code.to_uppercase();
        if let Some(room) = self.find(&key) {
            let guard = room.read().await;
            if guard.admin_fingerprint.as_deref() == Some(fingerprint) {
                return true;
            }
            let on_disk = self
                .admin_table
                .read()
                .await
                .get(&key)
                .map(|r| r.fingerprint == fingerprint)
                .unwrap_or(false);
            if on_disk {
                drop(guard);
                let mut guard = room.write().await;
                if guard.admin_fingerprint.is_none() {
                    guard.admin_fingerprint = Some(fingerprint.to_string());
                }
                return true;
            }
            return false;
        }
        self.admin_table
            .read()
            .await
            .get(&key)
            .map(|r| r.fingerprint == fingerprint)
            .unwrap_or(false)
    }

    async fn persist_admin(&self, code: &str, fingerprint: &str) {
        self.admin_table.write().await.insert(
            code.to_uppercase(),
            PersistedAdmin {
                fingerprint: fingerprint.to_string(),
                saved_at: Utc::now(),
            },
        );
        self.write_admin_table().await;
    }

    async fn write_admin_table(&self) {
        let table = self.admin_table.read().await;
        match serde_json::to_string_pretty(&*table) {
            Ok(json) => {
                if let Err(e) = tokio_fs::write(&self.admin_table_path, json).await {
                    warn!(error = %e, "failed to persist admin table");
                }
            },
            Err(e) => warn!(error = %e, "failed to serialize admin table"),
        }
    }

    /// Fold elapsed time into every playing room (background ticker body).
    /// Emits no broadcasts.
    pub async fn consolidate_all(&self, wall_now_ms: f64) {
        for room in self.all_rooms() {
            let mut guard = room.write().await;
            if guard.playback.state.is_playing {
                clock::consolidate(&mut guard.playback.state, wall_now_ms);
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// All room handles (used by shutdown fan-out).
    pub fn all_rooms(&self) -> Vec<SharedRoom> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }
}
