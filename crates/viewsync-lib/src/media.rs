// ============================
// viewsync-lib/src/media.rs
// ============================
//! Media metadata adapter.
//!
//! The coordination core consumes media through this seam: enumerate files,
//! read per-file track manifests, and cache thumbnails. Actual stream
//! probing and frame extraction run behind the `ContainerProbe` trait so
//! the core never blocks on (or depends on) an encoder toolchain.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs as tokio_fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use viewsync_common::model::{MediaKind, Track, TrackKind, TrackLists, EXTERNAL_TRACK_BASE};

use crate::error::AppError;

/// Media listing cache lifetime.
pub const LIST_CACHE_TTL: Duration = Duration::from_secs(20);
/// Manifests whose source file has been gone longer than this are purged.
pub const STALE_MANIFEST_AGE_DAYS: i64 = 7;
/// Thumbnail width that keeps the legacy un-tagged filename.
pub const LEGACY_THUMB_WIDTH: u32 = 720;

const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "webm", "avi", "mov"];
const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "flac", "ogg", "wav", "m4a"];
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// One playable file in the media directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
    pub filename: String,
    pub kind: MediaKind,
}

/// Classify a filename by extension; `None` means not a media file.
pub fn media_kind_of(filename: &str) -> Option<MediaKind> {
    let ext = filename.rsplit_once('.')?.1.to_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else {
        None
    }
}

/// One extracted sidecar as recorded in a track manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarRecord {
    #[serde(rename = "type")]
    pub kind: TrackKind,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub title: String,
    pub path: String,
    pub url: String,
}

/// Per-media-file manifest of extracted sidecar tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackManifest {
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub external_tracks: Vec<SidecarRecord>,
}

/// Container stream enumeration seam. Probing failures degrade to empty
/// track lists, never to an error the viewer sees.
#[async_trait]
pub trait ContainerProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<TrackLists, AppError>;
}

/// Probe that reports no container streams (used when no prober toolchain
/// is available; sidecar tracks still work).
pub struct NoProbe;

#[async_trait]
impl ContainerProbe for NoProbe {
    async fn probe(&self, _path: &Path) -> Result<TrackLists, AppError> {
        Ok(TrackLists::default())
    }
}

/// The media surface the coordination core consumes.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Enumerate playable files. Results are cached for about 20 s.
    async fn list_media(&self) -> Result<Vec<MediaEntry>, AppError>;

    /// Container tracks merged with sidecar manifest tracks
    /// (sidecar indices start at [`EXTERNAL_TRACK_BASE`]).
    async fn tracks_for(&self, filename: &str) -> Result<TrackLists, AppError>;

    /// Size of the server copy, for the BSL size criterion.
    async fn file_size(&self, filename: &str) -> Option<u64>;

    /// URL a client fetches the thumbnail from, or `None` when the source
    /// file does not exist.
    async fn thumbnail_url(&self, source: &str, width: u32) -> Option<String>;

    /// Sidecar files referenced by no manifest.
    async fn orphan_sidecars(&self) -> Result<Vec<String>, AppError>;
}

struct CachedListing {
    taken_at: Instant,
    entries: Vec<MediaEntry>,
}

/// Filesystem-backed implementation.
pub struct FsMediaLibrary {
    media_dir: PathBuf,
    manifest_dir: PathBuf,
    thumb_dir: PathBuf,
    probe: Box<dyn ContainerProbe>,
    listing: RwLock<Option<CachedListing>>,
}

impl FsMediaLibrary {
    pub fn new(
        media_dir: PathBuf,
        data_dir: &Path,
        probe: Box<dyn ContainerProbe>,
    ) -> Result<Self, AppError> {
        let manifest_dir = data_dir.join("track-manifests");
        std::fs::create_dir_all(&media_dir)?;
        std::fs::create_dir_all(&manifest_dir)?;
        let thumb_dir = std::env::temp_dir().join("viewsync-thumbs");
        std::fs::create_dir_all(&thumb_dir)?;
        Ok(Self {
            media_dir,
            manifest_dir,
            thumb_dir,
            probe,
            listing: RwLock::new(None),
        })
    }

    fn manifest_path(&self, filename: &str) -> PathBuf {
        self.manifest_dir.join(format!("{filename}.tracks.json"))
    }

    pub async fn read_manifest(&self, filename: &str) -> Option<TrackManifest> {
        let content = tokio_fs::read_to_string(self.manifest_path(filename))
            .await
            .ok()?;
        serde_json::from_str(&content).ok()
    }

    pub async fn write_manifest(
        &self,
        filename: &str,
        manifest: &TrackManifest,
    ) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(manifest)?;
        tokio_fs::write(self.manifest_path(filename), json).await?;
        Ok(())
    }

    /// Thumbnail cache file for `(source, width)`. Width 720 keeps the
    /// legacy plain name so caches written by older versions stay valid.
    pub fn thumbnail_path(&self, source: &str, width: u32) -> PathBuf {
        let stem = source.rsplit_once('.').map(|(s, _)| s).unwrap_or(source);
        if width == LEGACY_THUMB_WIDTH {
            self.thumb_dir.join(format!("{stem}.jpg"))
        } else {
            self.thumb_dir.join(format!("{stem}_w{width}.jpg"))
        }
    }

    pub fn cached_thumbnail(&self, source: &str, width: u32) -> Option<PathBuf> {
        let path = self.thumbnail_path(source, width);
        path.exists().then_some(path)
    }

    /// Store thumbnail bytes via a sibling temp file + rename, so readers
    /// never observe a half-written cache entry.
    pub async fn store_thumbnail(
        &self,
        source: &str,
        width: u32,
        bytes: &[u8],
    ) -> Result<PathBuf, AppError> {
        let path = self.thumbnail_path(source, width);
        let tmp = path.with_extension("jpg.tmp");
        tokio_fs::write(&tmp, bytes).await?;
        tokio_fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Startup sweep: refresh `lastSeen` for manifests whose source still
    /// exists; purge sidecars and manifest once the source has been
    /// missing for more than seven days.
    pub async fn sweep_stale_manifests(&self) -> Result<usize, AppError> {
        let mut purged = 0;
        let mut dir = tokio_fs::read_dir(&self.manifest_dir).await?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let manifest_path = entry.path();
            let Some(name) = manifest_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(source_name) = name.strip_suffix(".tracks.json") else {
                continue;
            };
            let content = match tokio_fs::read_to_string(&manifest_path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Ok(mut manifest) = serde_json::from_str::<TrackManifest>(&content) else {
                warn!(manifest = %manifest_path.display(), "unreadable track manifest, skipping");
                continue;
            };

            if self.media_dir.join(source_name).exists() {
                manifest.last_seen = Utc::now();
                let _ = self.write_manifest(source_name, &manifest).await;
                continue;
            }

            let missing_for = Utc::now() - manifest.last_seen;
            if missing_for > ChronoDuration::days(STALE_MANIFEST_AGE_DAYS) {
                for sidecar in &manifest.external_tracks {
                    let _ = tokio_fs::remove_file(&sidecar.path).await;
                }
                let _ = tokio_fs::remove_file(&manifest_path).await;
                purged += 1;
                info!(source = source_name, "purged stale sidecar tracks");
            }
        }
        if purged > 0 {
            debug!(purged, "stale manifest sweep complete");
        }
        Ok(purged)
    }

    /// Sidecar files present in no manifest (`/api/tracks/orphans`).
    async fn collect_orphan_sidecars(&self) -> Result<Vec<String>, AppError> {
        let mut referenced = std::collections::HashSet::new();
        let mut dir = tokio_fs::read_dir(&self.manifest_dir).await?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if let Ok(content) = tokio_fs::read_to_string(entry.path()).await {
                if let Ok(manifest) = serde_json::from_str::<TrackManifest>(&content) {
                    for sidecar in manifest.external_tracks {
                        referenced.insert(sidecar.path);
                    }
                }
            }
        }

        let tracks_dir = self.media_dir.join("tracks");
        let mut orphans = Vec::new();
        if let Ok(mut dir) = tokio_fs::read_dir(&tracks_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.is_file() && !referenced.contains(&path.display().to_string()) {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        orphans.push(name.to_string());
                    }
                }
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    fn merge_sidecars(mut lists: TrackLists, manifest: Option<TrackManifest>) -> TrackLists {
        let Some(manifest) = manifest else {
            return lists;
        };
        for (offset, sidecar) in manifest.external_tracks.into_iter().enumerate() {
            let track = Track {
                index: EXTERNAL_TRACK_BASE + offset as i32,
                codec: String::new(),
                language: sidecar.lang,
                title: sidecar.title,
                is_default: false,
                is_external: true,
                url: Some(sidecar.url),
            };
            match sidecar.kind {
                TrackKind::Audio => lists.audio.push(track),
                TrackKind::Subtitle => lists.subtitles.push(track),
            }
        }
        lists
    }
}

#[async_trait]
impl MediaLibrary for FsMediaLibrary {
    async fn list_media(&self) -> Result<Vec<MediaEntry>, AppError> {
        {
            let cached = self.listing.read().await;
            if let Some(listing) = cached.as_ref() {
                if listing.taken_at.elapsed() < LIST_CACHE_TTL {
                    return Ok(listing.entries.clone());
                }
            }
        }

        let mut entries = Vec::new();
        let mut dir = tokio_fs::read_dir(&self.media_dir).await?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(kind) = media_kind_of(filename) {
                    entries.push(MediaEntry {
                        filename: filename.to_string(),
                        kind,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));

        *self.listing.write().await = Some(CachedListing {
            taken_at: Instant::now(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    async fn tracks_for(&self, filename: &str) -> Result<TrackLists, AppError> {
        let path = self.media_dir.join(filename);
        let container = match self.probe.probe(&path).await {
            Ok(lists) => lists,
            Err(e) => {
                warn!(file = filename, error = %e, "stream probe failed, using empty track lists");
                TrackLists::default()
            },
        };
        let manifest = self.read_manifest(filename).await;
        Ok(Self::merge_sidecars(container, manifest))
    }

    async fn file_size(&self, filename: &str) -> Option<u64> {
        tokio_fs::metadata(self.media_dir.join(filename))
            .await
            .ok()
            .map(|m| m.len())
    }

    async fn thumbnail_url(&self, source: &str, width: u32) -> Option<String> {
        if !self.media_dir.join(source).exists() {
            return None;
        }
        let path = self.thumbnail_path(source, width);
        let name = path.file_name()?.to_str()?;
        Some(format!("/thumbs/{name}"))
    }

    async fn orphan_sidecars(&self) -> Result<Vec<String>, AppError> {
        self.collect_orphan_sidecars().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FsMediaLibrary, TempDir, TempDir) {
        let media_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        let library = FsMediaLibrary::new(
            media_dir.path().to_path_buf(),
            data_dir.path(),
            Box::new(NoProbe),
        )
        .unwrap();
        (library, media_dir, data_dir)
    }

    #[test]
    fn kind_detection_by_extension() {
        assert_eq!(media_kind_of("a.MKV"), Some(MediaKind::Video));
        assert_eq!(media_kind_of("a.flac"), Some(MediaKind::Audio));
        assert_eq!(media_kind_of("a.png"), Some(MediaKind::Image));
        assert_eq!(media_kind_of("a.txt"), None);
        assert_eq!(media_kind_of("noext"), None);
    }

    #[tokio::test]
    async fn listing_finds_media_and_caches() {
        let (library, media_dir, _data_dir) = setup();
        std::fs::write(media_dir.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(media_dir.path().join("a.mp3"), b"x").unwrap();
        std::fs::write(media_dir.path().join("notes.txt"), b"x").unwrap();

        let entries = library.list_media().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "a.mp3");
        assert_eq!(entries[1].kind, MediaKind::Video);

        // a file added inside the cache window is not visible yet
        std::fs::write(media_dir.path().join("c.mp4"), b"x").unwrap();
        let cached = library.list_media().await.unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn tracks_merge_sidecars_above_base_index() {
        let (library, _media_dir, _data_dir) = setup();
        let manifest = TrackManifest {
            last_seen: Utc::now(),
            external_tracks: vec![
                SidecarRecord {
                    kind: TrackKind::Subtitle,
                    lang: "en".to_string(),
                    title: "English".to_string(),
                    path: "/tmp/movie.en.vtt".to_string(),
                    url: "/tracks/movie.en.vtt".to_string(),
                },
                SidecarRecord {
                    kind: TrackKind::Audio,
                    lang: "ja".to_string(),
                    title: "Japanese".to_string(),
                    path: "/tmp/movie.ja.aac".to_string(),
                    url: "/tracks/movie.ja.aac".to_string(),
                },
            ],
        };
        library.write_manifest("movie.mkv", &manifest).await.unwrap();

        let lists = library.tracks_for("movie.mkv").await.unwrap();
        assert_eq!(lists.subtitles.len(), 1);
        assert_eq!(lists.subtitles[0].index, EXTERNAL_TRACK_BASE);
        assert!(lists.subtitles[0].is_external);
        assert_eq!(lists.audio[0].index, EXTERNAL_TRACK_BASE + 1);
        assert_eq!(lists.audio[0].language, "ja");
    }

    #[tokio::test]
    async fn sweep_refreshes_live_and_purges_stale() {
        let (library, media_dir, _data_dir) = setup();
        std::fs::write(media_dir.path().join("alive.mkv"), b"x").unwrap();

        let old = Utc::now() - ChronoDuration::days(STALE_MANIFEST_AGE_DAYS + 1);
        let sidecar_file = media_dir.path().join("gone.en.vtt");
        std::fs::write(&sidecar_file, b"WEBVTT").unwrap();

        library
            .write_manifest(
                "alive.mkv",
                &TrackManifest {
                    last_seen: old,
                    external_tracks: vec![],
                },
            )
            .await
            .unwrap();
        library
            .write_manifest(
                "gone.mkv",
                &TrackManifest {
                    last_seen: old,
                    external_tracks: vec![SidecarRecord {
                        kind: TrackKind::Subtitle,
                        lang: "en".to_string(),
                        title: String::new(),
                        path: sidecar_file.display().to_string(),
                        url: "/tracks/gone.en.vtt".to_string(),
                    }],
                },
            )
            .await
            .unwrap();

        let purged = library.sweep_stale_manifests().await.unwrap();
        assert_eq!(purged, 1);
        assert!(!sidecar_file.exists());
        assert!(library.read_manifest("gone.mkv").await.is_none());

        // the live manifest survived with a refreshed lastSeen
        let alive = library.read_manifest("alive.mkv").await.unwrap();
        assert!(Utc::now() - alive.last_seen < ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn recent_missing_source_is_not_purged() {
        let (library, _media_dir, _data_dir) = setup();
        library
            .write_manifest(
                "recent.mkv",
                &TrackManifest {
                    last_seen: Utc::now() - ChronoDuration::days(2),
                    external_tracks: vec![],
                },
            )
            .await
            .unwrap();
        let purged = library.sweep_stale_manifests().await.unwrap();
        assert_eq!(purged, 0);
        assert!(library.read_manifest("recent.mkv").await.is_some());
    }

    #[tokio::test]
    async fn thumbnail_names_are_width_tagged() {
        let (library, _media_dir, _data_dir) = setup();
        let legacy = library.thumbnail_path("movie.mkv", 720);
        assert!(legacy.to_str().unwrap().ends_with("movie.jpg"));
        let tagged = library.thumbnail_path("movie.mkv", 320);
        assert!(tagged.to_str().unwrap().ends_with("movie_w320.jpg"));

        assert!(library.cached_thumbnail("movie.mkv", 320).is_none());
        library
            .store_thumbnail("movie.mkv", 320, b"jpegdata")
            .await
            .unwrap();
        assert!(library.cached_thumbnail("movie.mkv", 320).is_some());
    }

    #[tokio::test]
    async fn file_size_reads_server_copy() {
        let (library, media_dir, _data_dir) = setup();
        std::fs::write(media_dir.path().join("sized.mp4"), vec![0u8; 1234]).unwrap();
        assert_eq!(library.file_size("sized.mp4").await, Some(1234));
        assert_eq!(library.file_size("missing.mp4").await, None);
    }
}
