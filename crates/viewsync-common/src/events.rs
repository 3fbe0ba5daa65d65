// ================
// viewsync-common/src/events.rs
// ================
//! The event-oriented wire protocol.
//!
//! Every frame is a JSON document `{"type": "<event-name>", "payload": ...}`.
//! Event names are kebab-case and stable; unknown fields inside payloads are
//! ignored so older and newer clients can coexist on one server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Playlist, PlaylistItem, SyncSnapshot, TrackKind};

/// A file reported by a viewer's local folder selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslFileInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Browser-reported MIME type; often empty.
    #[serde(rename = "type", default)]
    pub mime: String,
}

/// Per-connection view the admin sees in `bsl-status-update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslClientStatus {
    pub connection_id: String,
    pub fingerprint: String,
    pub display_name: String,
    pub folder_selected: bool,
    #[serde(default)]
    pub files: Vec<BslFileInfo>,
    /// playlist index -> matched client file name.
    #[serde(default)]
    pub matches: BTreeMap<usize, String>,
    /// playlist index -> drift seconds.
    #[serde(default)]
    pub drift: BTreeMap<usize, i32>,
}

/// Consolidated BSL state pushed to the room admin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslStatus {
    pub clients: Vec<BslClientStatus>,
    /// Per playlist item: whether BSL is considered active under the
    /// configured aggregation mode (`any` / `all`).
    pub bsl_active: BTreeMap<usize, bool>,
}

/// One public room as listed by `get-rooms` / `rooms-updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub viewers: usize,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A viewer as reported in the `join-room` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSummary {
    pub display_name: String,
    /// Milliseconds since the Unix epoch.
    pub joined_at: i64,
}

/// A connected client as reported to the admin by `get-client-list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub connection_id: String,
    pub fingerprint: String,
    pub display_name: String,
}

/// Direction of a relative skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipDirection {
    Forward,
    Backward,
}

/// The `action` forms of a `control` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlAction {
    #[serde(rename_all = "camelCase")]
    Playpause { state: bool },
    #[serde(rename_all = "camelCase")]
    Skip {
        direction: SkipDirection,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        seconds: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Seek { time: f64 },
    #[serde(rename_all = "camelCase")]
    SelectTrack { kind: TrackKind, index: i32 },
    #[serde(rename_all = "camelCase")]
    Rate { rate: f64 },
}

/// A `control` payload: either a named action or a bare state push
/// (no `action` field), which is only honored when client sync is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlEvent {
    Action(ControlAction),
    StatePush(ControlStatePush),
}

/// Direct sync tuple accepted from clients when `CLIENT_SYNC_DISABLED` is
/// off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatePush {
    pub is_playing: bool,
    pub position: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rate: Option<f64>,
}

/// Events the server accepts from clients. Names are the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        name: String,
        #[serde(default)]
        is_private: bool,
        fingerprint: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_code: String,
        #[serde(default)]
        name: String,
        fingerprint: String,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    DeleteRoom {
        room_code: String,
        fingerprint: String,
    },
    GetRooms,
    RequestInitialState,
    RequestSync,
    Control(ControlEvent),
    #[serde(rename_all = "camelCase")]
    SetPlaylist {
        playlist: Vec<PlaylistItem>,
        #[serde(default)]
        main_video_index: Option<i64>,
        #[serde(default)]
        start_time: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistJump { index: i64 },
    /// Legacy alias of `playlist-jump`; routed to the same handler.
    #[serde(rename_all = "camelCase")]
    PlaylistNext { index: i64 },
    #[serde(rename_all = "camelCase")]
    PlaylistReorder { from_index: i64, to_index: i64 },
    SkipToNextVideo,
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i64,
        #[serde(rename = "type")]
        kind: TrackKind,
        track_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    BslAdminRegister {
        fingerprint: String,
        #[serde(default)]
        room_code: Option<String>,
    },
    BslCheckRequest,
    BslGetStatus,
    #[serde(rename_all = "camelCase")]
    BslFolderSelected {
        fingerprint: String,
        #[serde(default)]
        display_name: String,
        files: Vec<BslFileInfo>,
    },
    #[serde(rename_all = "camelCase")]
    BslManualMatch {
        client_connection_id: String,
        client_file_name: String,
        playlist_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    BslSetDrift {
        client_fingerprint: String,
        playlist_index: usize,
        drift_seconds: i64,
    },
    #[serde(rename_all = "camelCase")]
    ClientRegister { fingerprint: String },
    GetClientList,
    #[serde(rename_all = "camelCase")]
    SetClientName {
        client_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    SetClientDisplayName {
        fingerprint: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage { sender: String, message: String },
}

impl ClientEvent {
    /// Stable wire name of this event, used for admin-error reporting and
    /// the admin-only authorization whitelist.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ClientEvent::CreateRoom { .. } => "create-room",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom => "leave-room",
            ClientEvent::DeleteRoom { .. } => "delete-room",
            ClientEvent::GetRooms => "get-rooms",
            ClientEvent::RequestInitialState => "request-initial-state",
            ClientEvent::RequestSync => "request-sync",
            ClientEvent::Control(_) => "control",
            ClientEvent::SetPlaylist { .. } => "set-playlist",
            ClientEvent::PlaylistJump { .. } => "playlist-jump",
            ClientEvent::PlaylistNext { .. } => "playlist-next",
            ClientEvent::PlaylistReorder { .. } => "playlist-reorder",
            ClientEvent::SkipToNextVideo => "skip-to-next-video",
            ClientEvent::TrackChange { .. } => "track-change",
            ClientEvent::BslAdminRegister { .. } => "bsl-admin-register",
            ClientEvent::BslCheckRequest => "bsl-check-request",
            ClientEvent::BslGetStatus => "bsl-get-status",
            ClientEvent::BslFolderSelected { .. } => "bsl-folder-selected",
            ClientEvent::BslManualMatch { .. } => "bsl-manual-match",
            ClientEvent::BslSetDrift { .. } => "bsl-set-drift",
            ClientEvent::ClientRegister { .. } => "client-register",
            ClientEvent::GetClientList => "get-client-list",
            ClientEvent::SetClientName { .. } => "set-client-name",
            ClientEvent::SetClientDisplayName { .. } => "set-client-display-name",
            ClientEvent::ChatMessage { .. } => "chat-message",
        }
    }
}

/// Events the server emits. Names are the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Sync(SyncSnapshot),
    PlaylistUpdate(Playlist),
    #[serde(rename_all = "camelCase")]
    PlaylistPosition { current_index: i64 },
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i64,
        #[serde(rename = "type")]
        kind: TrackKind,
        track_index: i32,
    },
    ViewerCount(usize),
    /// Legacy single-room mode counterpart of `viewer-count`.
    ClientCount(usize),
    RoomsUpdated(Vec<RoomSummary>),
    #[serde(rename_all = "camelCase")]
    RoomDeleted { room_code: String },
    #[serde(rename_all = "camelCase")]
    RateLimitError { message: String, retry_after: u64 },
    #[serde(rename_all = "camelCase")]
    AdminAuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AdminError { event: String, message: String },
    BslStatusUpdate(BslStatus),
    #[serde(rename_all = "camelCase")]
    BslMatchResult {
        matched_videos: BTreeMap<usize, String>,
        total_matched: usize,
        total_playlist: usize,
    },
    #[serde(rename_all = "camelCase")]
    BslDriftUpdate { drift_values: BTreeMap<usize, i32> },
    /// Prompt sent to viewers that have not selected a folder yet.
    BslCheck,
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        sender: String,
        message: String,
        #[serde(default)]
        system: bool,
    },
    #[serde(rename_all = "camelCase")]
    NameUpdated { display_name: String },
    #[serde(rename_all = "camelCase")]
    CreateRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        room_code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        room_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        room_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        is_admin: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        viewers: Option<Vec<ViewerSummary>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistSet {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ClientList { clients: Vec<ClientEntry> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_names() {
        let event = ClientEvent::SkipToNextVideo;
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "skip-to-next-video");

        let event = ClientEvent::BslSetDrift {
            client_fingerprint: "fp".to_string(),
            playlist_index: 0,
            drift_seconds: -3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "bsl-set-drift");
        assert_eq!(json["payload"]["driftSeconds"], -3);
    }

    #[test]
    fn control_action_parses() {
        let json = r#"{"type":"control","payload":{"action":"playpause","state":true}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Control(ControlEvent::Action(ControlAction::Playpause { state })) => {
                assert!(state)
            },
            other => panic!("expected playpause, got {other:?}"),
        }
    }

    #[test]
    fn control_state_push_parses_without_action() {
        let json = r#"{"type":"control","payload":{"isPlaying":false,"position":12.5}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Control(ControlEvent::StatePush(push)) => {
                assert!(!push.is_playing);
                assert_eq!(push.position, 12.5);
                assert!(push.rate.is_none());
            },
            other => panic!("expected state push, got {other:?}"),
        }
    }

    #[test]
    fn select_track_uses_camel_case_action() {
        let json =
            r#"{"type":"control","payload":{"action":"selectTrack","kind":"subtitle","index":-1}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Control(ControlEvent::Action(ControlAction::SelectTrack {
                kind,
                index,
            })) => {
                assert_eq!(kind, TrackKind::Subtitle);
                assert_eq!(index, -1);
            },
            other => panic!("expected selectTrack, got {other:?}"),
        }
    }

    #[test]
    fn track_change_type_field() {
        let event = ClientEvent::TrackChange {
            video_index: 2,
            kind: TrackKind::Audio,
            track_index: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "track-change");
        assert_eq!(json["payload"]["type"], "audio");
        assert_eq!(json["payload"]["videoIndex"], 2);
    }

    #[test]
    fn server_sync_event_shape() {
        let event = ServerEvent::Sync(SyncSnapshot {
            is_playing: true,
            position: 42.0,
            anchor: 1_700_000_000_000.0,
            rate: 1.5,
            audio_track: 0,
            subtitle_track: -1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["payload"]["isPlaying"], true);
        assert_eq!(json["payload"]["subtitleTrack"], -1);
    }

    #[test]
    fn drift_update_keys_are_strings_in_json() {
        let mut drift = BTreeMap::new();
        drift.insert(0usize, -3);
        let event = ServerEvent::BslDriftUpdate {
            drift_values: drift,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""driftValues":{"0":-3}"#));
    }

    #[test]
    fn legacy_playlist_next_is_distinct_event() {
        let json = r#"{"type":"playlist-next","payload":{"index":1}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ClientEvent::PlaylistNext { index: 1 });
        assert_eq!(event.wire_name(), "playlist-next");
    }
}
