// ============================
// viewsync-lib/src/bsl.rs
// ============================
//! Both-side local sync (BSL): viewers substitute a locally owned copy of
//! the media while staying on the room's shared timeline.
//!
//! The matcher maps each viewer's reported files onto playlist items. It
//! never touches shared playback state; everything here is per-viewer,
//! mutated under the owning room's write lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use viewsync_common::events::{BslClientStatus, BslFileInfo, BslStatus};
use viewsync_common::model::PlaylistItem;

use crate::config::BslMode;
use crate::validation::clamp_drift;

/// Client file size may differ from the server copy by this much and still
/// count as a size match (different containers pad differently).
pub const SIZE_TOLERANCE_BYTES: u64 = 1_572_864; // 1.5 MiB

/// Extension-derived MIME types used by the advanced matcher.
const MIME_TABLE: [(&str, &str); 10] = [
    ("mp4", "video/mp4"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("m4a", "audio/mp4"),
];

fn extension_of(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Matcher inputs that do not live on the room.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub advanced: bool,
    /// 1..=4; criteria met must reach this to accept.
    pub threshold: u8,
}

/// Persisted match memory for one fingerprint:
/// lowercase client file name -> lowercase playlist file name.
pub type PersistedMatches = HashMap<String, String>;

/// Advanced score of one (client file, playlist filename) pair.
/// `server_size` is the stat'd size of the server copy, when known.
fn advanced_score(file: &BslFileInfo, item_filename: &str, server_size: Option<u64>) -> u8 {
    let mut score = 0;

    if file.name.eq_ignore_ascii_case(item_filename) {
        score += 1;
    }

    let client_ext = extension_of(&file.name);
    let item_ext = extension_of(item_filename);
    if let (Some(a), Some(b)) = (&client_ext, &item_ext) {
        if a == b {
            score += 1;
        }
    }

    if let Some(server_size) = server_size {
        if file.size.abs_diff(server_size) <= SIZE_TOLERANCE_BYTES {
            score += 1;
        }
    }

    if !file.mime.is_empty() {
        if let Some(expected) = item_ext.as_deref().and_then(mime_for_extension) {
            let top_level = |m: &str| m.split('/').next().unwrap_or("").to_string();
            if file.mime == expected || top_level(&file.mime) == top_level(expected) {
                score += 1;
            }
        }
    }

    score
}

/// Match the reported files against the playlist.
///
/// Per file, in report order: a persisted exact match wins outright; then
/// the advanced score (when enabled) accepts the first item reaching the
/// threshold; otherwise plain case-insensitive filename equality. Items
/// already matched by an earlier file are skipped.
pub fn auto_match(
    files: &[BslFileInfo],
    items: &[PlaylistItem],
    persisted: &PersistedMatches,
    server_sizes: &HashMap<String, u64>,
    options: &MatchOptions,
) -> BTreeMap<usize, String> {
    let mut matches: BTreeMap<usize, String> = BTreeMap::new();

    for file in files {
        let remembered = persisted.get(&file.name.to_lowercase());

        for (index, item) in items.iter().enumerate() {
            if matches.contains_key(&index) {
                continue;
            }
            let Some(item_filename) = item.filename() else {
                continue;
            };

            let accepted = if remembered
                .map(|m| m.eq_ignore_ascii_case(item_filename))
                .unwrap_or(false)
            {
                true
            } else if options.advanced {
                let server_size = server_sizes.get(item_filename).copied();
                advanced_score(file, item_filename, server_size) >= options.threshold
            } else {
                file.name.eq_ignore_ascii_case(item_filename)
            };

            if accepted {
                matches.insert(index, file.name.clone());
                break;
            }
        }
    }

    matches
}

/// One viewer's reported inventory and resolved matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BslClientState {
    pub fingerprint: String,
    pub display_name: String,
    pub folder_selected: bool,
    pub files: Vec<BslFileInfo>,
    pub matches: BTreeMap<usize, String>,
}

/// Per-room BSL state: connection id -> client state.
#[derive(Debug, Clone, Default)]
pub struct BslIndex {
    clients: HashMap<String, BslClientState>,
}

impl BslIndex {
    pub fn record_folder(
        &mut self,
        conn_id: &str,
        fingerprint: String,
        display_name: String,
        files: Vec<BslFileInfo>,
        matches: BTreeMap<usize, String>,
    ) {
        self.clients.insert(
            conn_id.to_string(),
            BslClientState {
                fingerprint,
                display_name,
                folder_selected: true,
                files,
                matches,
            },
        );
    }

    /// Force one mapping for a connection (admin override). Returns the
    /// fingerprint of the client when it was known.
    pub fn set_manual_match(
        &mut self,
        conn_id: &str,
        playlist_index: usize,
        client_file_name: String,
    ) -> Option<&BslClientState> {
        let state = self.clients.entry(conn_id.to_string()).or_default();
        state.matches.insert(playlist_index, client_file_name);
        self.clients.get(conn_id)
    }

    pub fn remove_connection(&mut self, conn_id: &str) {
        self.clients.remove(conn_id);
    }

    pub fn client(&self, conn_id: &str) -> Option<&BslClientState> {
        self.clients.get(conn_id)
    }

    /// Connections that have not selected a folder yet; these are the ones
    /// a `bsl-check-request` polls.
    pub fn unreported_connections<'a>(
        &'a self,
        all_connections: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        all_connections
            .filter(|id| {
                self.clients
                    .get(*id)
                    .map(|c| !c.folder_selected)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// The consolidated admin view: per-client inventories plus the
    /// per-item aggregate under the given mode.
    pub fn status(&self, mode: BslMode, playlist_len: usize, drift: &DriftTable) -> BslStatus {
        let mut clients: Vec<BslClientStatus> = self
            .clients
            .iter()
            .map(|(conn_id, state)| BslClientStatus {
                connection_id: conn_id.clone(),
                fingerprint: state.fingerprint.clone(),
                display_name: state.display_name.clone(),
                folder_selected: state.folder_selected,
                files: state.files.clone(),
                matches: state.matches.clone(),
                drift: drift.values_for(&state.fingerprint),
            })
            .collect();
        clients.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        let reporting: Vec<&BslClientState> = self
            .clients
            .values()
            .filter(|c| c.folder_selected)
            .collect();

        let mut bsl_active = BTreeMap::new();
        for index in 0..playlist_len {
            let active = match mode {
                BslMode::Any => reporting.iter().any(|c| c.matches.contains_key(&index)),
                BslMode::All => {
                    !reporting.is_empty()
                        && reporting.iter().all(|c| c.matches.contains_key(&index))
                },
            };
            bsl_active.insert(index, active);
        }

        BslStatus { clients, bsl_active }
    }
}

/// Per-viewer per-item signed offsets added to the broadcast position when
/// playing the matched local copy.
#[derive(Debug, Clone, Default)]
pub struct DriftTable {
    by_fingerprint: HashMap<String, BTreeMap<usize, i32>>,
}

impl DriftTable {
    /// Store a clamped drift value; returns what was stored.
    pub fn set(&mut self, fingerprint: &str, playlist_index: usize, drift_seconds: i64) -> i32 {
        let clamped = clamp_drift(drift_seconds);
        self.by_fingerprint
            .entry(fingerprint.to_string())
            .or_default()
            .insert(playlist_index, clamped);
        clamped
    }

    pub fn values_for(&self, fingerprint: &str) -> BTreeMap<usize, i32> {
        self.by_fingerprint
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewsync_common::model::{MediaKind, TrackLists};

    fn local_item(filename: &str) -> PlaylistItem {
        PlaylistItem::LocalMedia {
            filename: filename.to_string(),
            kind: MediaKind::Video,
            tracks: TrackLists::default(),
            selected_audio_track: 0,
            selected_subtitle_track: -1,
        }
    }

    fn file(name: &str, size: u64, mime: &str) -> BslFileInfo {
        BslFileInfo {
            name: name.to_string(),
            size,
            mime: mime.to_string(),
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn simple_mode_matches_by_name_only() {
        let items = vec![local_item("Movie.mkv")];
        let files = vec![file("movie.MKV", 1, "")];
        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &HashMap::new(),
            &MatchOptions {
                advanced: false,
                threshold: 1,
            },
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("movie.MKV"));
    }

    #[test]
    fn advanced_name_ext_size_reaches_threshold_three() {
        // server copy 900.0 MiB, client copy 900.4 MiB: name + ext + size
        let items = vec![local_item("Movie.mkv")];
        let files = vec![file("movie.mkv", 900 * MIB + 400 * 1024, "")];
        let mut sizes = HashMap::new();
        sizes.insert("Movie.mkv".to_string(), 900 * MIB);

        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &sizes,
            &MatchOptions {
                advanced: true,
                threshold: 3,
            },
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("movie.mkv"));
    }

    #[test]
    fn size_outside_tolerance_misses_threshold() {
        let items = vec![local_item("Movie.mkv")];
        let files = vec![file("movie.mkv", 910 * MIB, "")];
        let mut sizes = HashMap::new();
        sizes.insert("Movie.mkv".to_string(), 900 * MIB);

        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &sizes,
            &MatchOptions {
                advanced: true,
                threshold: 3,
            },
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn mime_top_level_counts() {
        let items = vec![local_item("clip.mp4")];
        // different name, same ext, size match, video/* mime: 3 criteria
        let files = vec![file("other.mp4", 100, "video/webm")];
        let mut sizes = HashMap::new();
        sizes.insert("clip.mp4".to_string(), 100);

        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &sizes,
            &MatchOptions {
                advanced: true,
                threshold: 3,
            },
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("other.mp4"));
    }

    #[test]
    fn persisted_match_wins_without_scoring() {
        let items = vec![local_item("Weird Server Name.mkv")];
        let files = vec![file("my-local-rip.mkv", 5, "")];
        let mut persisted = HashMap::new();
        persisted.insert(
            "my-local-rip.mkv".to_string(),
            "weird server name.mkv".to_string(),
        );

        let matches = auto_match(
            &files,
            &items,
            &persisted,
            &HashMap::new(),
            &MatchOptions {
                advanced: true,
                threshold: 4,
            },
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("my-local-rip.mkv"));
    }

    #[test]
    fn first_item_reaching_threshold_wins_ties() {
        let items = vec![local_item("a.mp4"), local_item("b.mp4")];
        // extension-only score of 1 matches both; first item wins
        let files = vec![file("anything.mp4", 0, "")];
        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &HashMap::new(),
            &MatchOptions {
                advanced: true,
                threshold: 1,
            },
        );
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key(&0));
    }

    #[test]
    fn embeds_are_never_matched() {
        let items = vec![PlaylistItem::ExternalEmbed {
            platform: viewsync_common::model::ExternalPlatform::Youtube,
            external_id: Some("x".to_string()),
            external_url: None,
            title: "clip.mp4".to_string(),
            thumbnail: None,
            sync_level: viewsync_common::model::SyncLevel::Full,
        }];
        let files = vec![file("clip.mp4", 0, "")];
        let matches = auto_match(
            &files,
            &items,
            &HashMap::new(),
            &HashMap::new(),
            &MatchOptions {
                advanced: false,
                threshold: 1,
            },
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn drift_clamps_to_window() {
        let mut table = DriftTable::default();
        assert_eq!(table.set("fp", 0, 75), 60);
        assert_eq!(table.set("fp", 1, -100), -60);
        assert_eq!(table.set("fp", 2, -3), -3);
        let values = table.values_for("fp");
        assert_eq!(values.get(&0), Some(&60));
        assert_eq!(values.get(&1), Some(&-60));
        assert!(table.values_for("other").is_empty());
    }

    #[test]
    fn status_aggregates_any_vs_all() {
        let mut index = BslIndex::default();
        let mut m1 = BTreeMap::new();
        m1.insert(0usize, "a.mp4".to_string());
        index.record_folder("c1", "fp1".into(), "V1".into(), vec![], m1);
        index.record_folder("c2", "fp2".into(), "V2".into(), vec![], BTreeMap::new());

        let drift = DriftTable::default();
        let any = index.status(BslMode::Any, 2, &drift);
        assert_eq!(any.bsl_active.get(&0), Some(&true));
        assert_eq!(any.bsl_active.get(&1), Some(&false));

        let all = index.status(BslMode::All, 2, &drift);
        assert_eq!(all.bsl_active.get(&0), Some(&false));
    }

    #[test]
    fn unreported_connections_skips_folder_selected() {
        let mut index = BslIndex::default();
        index.record_folder("c1", "fp1".into(), "V1".into(), vec![], BTreeMap::new());
        let all = vec!["c1".to_string(), "c2".to_string()];
        let unreported = index.unreported_connections(all.iter());
        assert_eq!(unreported, vec!["c2".to_string()]);
    }
}
