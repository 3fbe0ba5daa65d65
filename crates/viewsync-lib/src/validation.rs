// ============================
// viewsync-lib/src/validation.rs
// ============================
//! Inbound payload validation.
//!
//! Everything a client sends passes through here before it can touch room
//! state. Bad payloads are dropped with a warning; they never disconnect
//! the sender and never leave partial mutations behind.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use viewsync_common::events::{ClientEvent, ControlAction, ControlEvent};
use viewsync_common::model::TrackKind;

/// Maximum accepted media filename length.
const MAX_FILENAME_LENGTH: usize = 255;
/// Maximum accepted display-name length.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 32;
/// Maximum accepted chat message length (longer messages are truncated).
pub const MAX_CHAT_LENGTH: usize = 500;
/// Drift offsets are clamped to +/- this many seconds.
pub const DRIFT_LIMIT: i64 = 60;

static FILENAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\s\-.()\[\]]+$").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Invalid time value: {0}")]
    InvalidTime(String),

    #[error("Invalid track index: {0}")]
    InvalidTrackIndex(String),

    #[error("Invalid playlist index: {0}")]
    InvalidPlaylistIndex(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Invalid fingerprint")]
    InvalidFingerprint,
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a media filename.
///
/// Rejects traversal (`..`, path separators), shell metacharacters, control
/// characters, and anything outside the conservative whitelist.
pub fn validate_filename(filename: &str) -> ValidationResult<&str> {
    if filename.is_empty() {
        return Err(ValidationError::InvalidFilename(
            "filename must not be empty".to_string(),
        ));
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(ValidationError::InvalidFilename(format!(
            "filename exceeds {MAX_FILENAME_LENGTH} characters"
        )));
    }
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(ValidationError::InvalidFilename(
            "filename must not contain path components".to_string(),
        ));
    }
    if filename
        .chars()
        .any(|c| matches!(c, ';' | '&' | '|' | '$' | '`' | '<' | '>' | '\n' | '\r'))
    {
        return Err(ValidationError::InvalidFilename(
            "filename contains forbidden characters".to_string(),
        ));
    }
    if !FILENAME_REGEX.is_match(filename) {
        return Err(ValidationError::InvalidFilename(
            "filename contains invalid characters".to_string(),
        ));
    }
    Ok(filename)
}

/// Validate a playback time: finite and non-negative.
pub fn validate_time(time: f64) -> ValidationResult<f64> {
    if !time.is_finite() || time < 0.0 {
        return Err(ValidationError::InvalidTime(format!("{time}")));
    }
    Ok(time)
}

/// Validate an audio track index (>= 0).
pub fn validate_audio_track(index: i32) -> ValidationResult<i32> {
    if index < 0 {
        return Err(ValidationError::InvalidTrackIndex(format!(
            "audio index {index} must be >= 0"
        )));
    }
    Ok(index)
}

/// Validate a subtitle track index (>= -1; -1 means off).
pub fn validate_subtitle_track(index: i32) -> ValidationResult<i32> {
    if index < -1 {
        return Err(ValidationError::InvalidTrackIndex(format!(
            "subtitle index {index} must be >= -1"
        )));
    }
    Ok(index)
}

/// Clamp a drift offset to the accepted window.
pub fn clamp_drift(drift_seconds: i64) -> i32 {
    drift_seconds.clamp(-DRIFT_LIMIT, DRIFT_LIMIT) as i32
}

/// Validate a playlist index against the playlist length.
pub fn validate_playlist_index(index: i64, len: usize) -> ValidationResult<usize> {
    if index < 0 || index >= len as i64 {
        return Err(ValidationError::InvalidPlaylistIndex(format!(
            "index {index} out of range for {len} items"
        )));
    }
    Ok(index as usize)
}

/// Validate a viewer display name: trimmed, non-empty, bounded.
pub fn validate_display_name(name: &str) -> ValidationResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidDisplayName(
            "name must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::InvalidDisplayName(format!(
            "name exceeds {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate a client fingerprint: a non-empty opaque token of sane length.
pub fn validate_fingerprint(fingerprint: &str) -> ValidationResult<&str> {
    if fingerprint.is_empty() || fingerprint.len() > 128 {
        return Err(ValidationError::InvalidFingerprint);
    }
    Ok(fingerprint)
}

/// Escape HTML-sensitive characters for chat relay.
pub fn sanitize_string(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Truncate a chat message to the protocol cap, on a char boundary.
pub fn truncate_chat(message: &str) -> &str {
    match message.char_indices().nth(MAX_CHAT_LENGTH) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

fn validate_track_index(kind: TrackKind, index: i32) -> ValidationResult<i32> {
    match kind {
        TrackKind::Audio => validate_audio_track(index),
        TrackKind::Subtitle => validate_subtitle_track(index),
    }
}

/// Shape validation of an inbound event (step 1 of the dispatch pipeline).
///
/// Range checks that need room state (playlist length, membership) happen
/// in the handlers; everything checkable from the payload alone is
/// checked here. Playlist items with bad filenames are not an error at
/// this level: they are silently dropped when the playlist is stored.
pub fn validate_event(event: &ClientEvent) -> ValidationResult<()> {
    match event {
        ClientEvent::CreateRoom { name, fingerprint, .. } => {
            validate_display_name(name)?;
            validate_fingerprint(fingerprint)?;
        },
        ClientEvent::JoinRoom { room_code, fingerprint, .. } => {
            if room_code.trim().is_empty() {
                return Err(ValidationError::InvalidDisplayName(
                    "room code must not be empty".to_string(),
                ));
            }
            validate_fingerprint(fingerprint)?;
        },
        ClientEvent::DeleteRoom { fingerprint, .. } => {
            validate_fingerprint(fingerprint)?;
        },
        ClientEvent::Control(ControlEvent::Action(action)) => match action {
            ControlAction::Seek { time } => {
                validate_time(*time)?;
            },
            ControlAction::Skip { seconds, .. } => {
                if let Some(seconds) = seconds {
                    validate_time(*seconds)?;
                }
            },
            ControlAction::SelectTrack { kind, index } => {
                validate_track_index(*kind, *index)?;
            },
            ControlAction::Playpause { .. } | ControlAction::Rate { .. } => {},
        },
        ClientEvent::Control(ControlEvent::StatePush(push)) => {
            validate_time(push.position)?;
        },
        ClientEvent::SetPlaylist { start_time, .. } => {
            if let Some(start_time) = start_time {
                validate_time(*start_time)?;
            }
        },
        ClientEvent::TrackChange { kind, track_index, .. } => {
            validate_track_index(*kind, *track_index)?;
        },
        ClientEvent::BslAdminRegister { fingerprint, .. }
        | ClientEvent::ClientRegister { fingerprint } => {
            validate_fingerprint(fingerprint)?;
        },
        ClientEvent::BslFolderSelected { fingerprint, files, .. } => {
            validate_fingerprint(fingerprint)?;
            for file in files {
                validate_filename(&file.name)?;
            }
        },
        ClientEvent::BslManualMatch { client_file_name, .. } => {
            validate_filename(client_file_name)?;
        },
        ClientEvent::BslSetDrift { client_fingerprint, .. } => {
            validate_fingerprint(client_fingerprint)?;
        },
        ClientEvent::SetClientName { display_name, .. } => {
            validate_display_name(display_name)?;
        },
        ClientEvent::SetClientDisplayName { fingerprint, display_name } => {
            validate_fingerprint(fingerprint)?;
            validate_display_name(display_name)?;
        },
        ClientEvent::ChatMessage { .. }
        | ClientEvent::LeaveRoom
        | ClientEvent::GetRooms
        | ClientEvent::RequestInitialState
        | ClientEvent::RequestSync
        | ClientEvent::PlaylistJump { .. }
        | ClientEvent::PlaylistNext { .. }
        | ClientEvent::PlaylistReorder { .. }
        | ClientEvent::SkipToNextVideo
        | ClientEvent::BslCheckRequest
        | ClientEvent::BslGetStatus
        | ClientEvent::GetClientList => {},
    }
    Ok(())
}
