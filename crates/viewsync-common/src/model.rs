// ================
// viewsync-common/src/model.rs
// ================
//! Playlist and track data model.
//!
//! Items are a tagged union: either a file served from the host's media
//! directory (`LocalMedia`) or a third-party embed (`ExternalEmbed`).
//! Unknown fields arriving on the wire are ignored, not stored.

use serde::{Deserialize, Serialize};

/// First sidecar track index. Container-internal streams are numbered from
/// zero by the probe; extracted sidecar audio/subtitle files start here so
/// the two ranges can never collide.
pub const EXTERNAL_TRACK_BASE: i32 = 1000;

/// Detected kind of a local media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

/// Embed platforms the client player knows how to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExternalPlatform {
    Youtube,
    Vimeo,
    Dailymotion,
    Twitch,
    Soundcloud,
    Streamable,
    Gdrive,
    Kick,
    Rumble,
    DirectUrl,
}

/// Bound on which controls are meaningful for an external embed.
///
/// `Full` allows play/pause/seek/rate, `Limited` allows play/pause only,
/// `Autoplay` allows no per-frame control at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLevel {
    Full,
    Limited,
    Autoplay,
}

/// Which of the two selectable track families an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Subtitle,
}

/// A single audio or subtitle stream of a playlist item.
///
/// Sidecar tracks (extracted to standalone files) carry `is_external = true`
/// and an index of [`EXTERNAL_TRACK_BASE`] or above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub index: i32,
    #[serde(default)]
    pub codec: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "default", default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_external: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
}

impl Track {
    pub fn is_sidecar(&self) -> bool {
        self.index >= EXTERNAL_TRACK_BASE
    }
}

/// Audio and subtitle track lists of one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackLists {
    #[serde(default)]
    pub audio: Vec<Track>,
    #[serde(default)]
    pub subtitles: Vec<Track>,
}

/// One entry of a room's playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "itemType", rename_all = "camelCase")]
pub enum PlaylistItem {
    /// A file from the host's media directory, played by every viewer from
    /// the server (or from a BSL-matched local copy).
    #[serde(rename_all = "camelCase")]
    LocalMedia {
        filename: String,
        kind: MediaKind,
        #[serde(default)]
        tracks: TrackLists,
        #[serde(default)]
        selected_audio_track: i32,
        #[serde(default = "default_subtitle_track")]
        selected_subtitle_track: i32,
    },
    /// A third-party embed. The server relays its state uniformly; the
    /// client enables controls according to `sync_level`.
    #[serde(rename_all = "camelCase")]
    ExternalEmbed {
        platform: ExternalPlatform,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        external_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        external_url: Option<String>,
        #[serde(default)]
        title: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        thumbnail: Option<String>,
        sync_level: SyncLevel,
    },
}

fn default_subtitle_track() -> i32 {
    -1
}

impl PlaylistItem {
    /// Filename for local items, title for embeds.
    pub fn display_name(&self) -> &str {
        match self {
            PlaylistItem::LocalMedia { filename, .. } => filename,
            PlaylistItem::ExternalEmbed { title, .. } => title,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            PlaylistItem::LocalMedia { filename, .. } => Some(filename),
            PlaylistItem::ExternalEmbed { .. } => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, PlaylistItem::LocalMedia { .. })
    }
}

/// Ordered playlist plus the pointers the protocol exposes alongside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
    /// `-1` means idle (nothing selected).
    #[serde(default = "default_index")]
    pub current_index: i64,
    /// Preload hint: the item viewers should fetch early.
    #[serde(default = "default_index")]
    pub main_item_index: i64,
    /// Seconds into the main item at which playback starts.
    #[serde(default)]
    pub main_item_start_time: f64,
}

fn default_index() -> i64 {
    -1
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_item(&self) -> Option<&PlaylistItem> {
        usize::try_from(self.current_index)
            .ok()
            .and_then(|i| self.items.get(i))
    }

    pub fn current_item_mut(&mut self) -> Option<&mut PlaylistItem> {
        usize::try_from(self.current_index)
            .ok()
            .and_then(|i| self.items.get_mut(i))
    }
}

/// The authoritative playback tuple broadcast to every viewer.
///
/// `anchor` is the wall-clock instant (milliseconds since the Unix epoch) at
/// which `position` was last reconciled; a playing client extrapolates
/// `position + rate * (now - anchor)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub is_playing: bool,
    pub position: f64,
    pub anchor: f64,
    pub rate: f64,
    pub audio_track: i32,
    pub subtitle_track: i32,
}
