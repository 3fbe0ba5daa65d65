// ============================
// viewsync-lib/src/playback.rs
// ============================
//! Authoritative per-room playback state machine.
//!
//! Every mutation consolidates first (so elapsed real time is folded into
//! the stored position), applies the change, and returns the broadcasts the
//! caller must fan out to the room. Mutations run under the room's write
//! lock; this module itself is lock-free and takes the wall clock as an
//! argument.

use serde::{Deserialize, Serialize};
use viewsync_common::events::ServerEvent;
use viewsync_common::model::{Playlist, PlaylistItem, SyncSnapshot, TrackKind};

use crate::clock;
use crate::error::AppError;

/// Slowest and fastest accepted playback rate; the grid steps by 0.25.
pub const RATE_MIN: f64 = 0.25;
pub const RATE_MAX: f64 = 3.0;
pub const RATE_STEP: f64 = 0.25;

/// The `(position, rate, playing, anchor)` tuple plus track selections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    /// Seconds into the current item, valid as of `anchor`.
    pub position: f64,
    pub rate: f64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub anchor: f64,
    pub audio_track: i32,
    pub subtitle_track: i32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            position: 0.0,
            rate: 1.0,
            anchor: 0.0,
            audio_track: 0,
            subtitle_track: -1,
        }
    }
}

impl PlaybackState {
    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            is_playing: self.is_playing,
            position: self.position,
            anchor: self.anchor,
            rate: self.rate,
            audio_track: self.audio_track,
            subtitle_track: self.subtitle_track,
        }
    }
}

/// Whether `rate` lies on the accepted 0.25-stepped grid.
pub fn rate_on_grid(rate: f64) -> bool {
    if !(RATE_MIN..=RATE_MAX).contains(&rate) {
        return false;
    }
    let steps = rate / RATE_STEP;
    (steps - steps.round()).abs() < 1e-9
}

/// Per-room playback state plus playlist, mutated as one unit.
#[derive(Debug, Clone, Default)]
pub struct PlaybackMachine {
    pub state: PlaybackState,
    pub playlist: Playlist,
}

impl PlaybackMachine {
    /// Track selections an item starts with.
    fn item_track_defaults(item: &PlaylistItem) -> (i32, i32) {
        match item {
            PlaylistItem::LocalMedia {
                selected_audio_track,
                selected_subtitle_track,
                ..
            } => (*selected_audio_track, *selected_subtitle_track),
            PlaylistItem::ExternalEmbed { .. } => (0, -1),
        }
    }

    fn reload_tracks_from_current(&mut self) {
        let (audio, subtitle) = self
            .playlist
            .current_item()
            .map(Self::item_track_defaults)
            .unwrap_or((0, -1));
        self.state.audio_track = audio;
        self.state.subtitle_track = subtitle;
    }

    fn sync_event(&self) -> ServerEvent {
        ServerEvent::Sync(self.state.snapshot())
    }

    fn playlist_event(&self) -> ServerEvent {
        ServerEvent::PlaylistUpdate(self.playlist.clone())
    }

    /// Replace the whole playlist. An empty playlist is allowed and means
    /// idle. Emits `playlist-update` then `sync`, in that order.
    pub fn set_playlist(
        &mut self,
        items: Vec<PlaylistItem>,
        main_index: Option<i64>,
        start_time: Option<f64>,
        autoplay: bool,
        wall_now_ms: f64,
    ) -> Vec<ServerEvent> {
        let len = items.len() as i64;
        let main_index = main_index
            .filter(|i| (-1..len).contains(i))
            .unwrap_or(if len > 0 { 0 } else { -1 });
        let start_time = start_time.filter(|t| t.is_finite() && *t >= 0.0).unwrap_or(0.0);

        self.playlist = Playlist {
            items,
            current_index: if len > 0 { 0 } else { -1 },
            main_item_index: main_index,
            main_item_start_time: start_time,
        };

        self.state.position = start_time;
        self.state.anchor = wall_now_ms;
        self.state.is_playing = autoplay && len > 0;
        self.reload_tracks_from_current();

        vec![self.playlist_event(), self.sync_event()]
    }

    /// Jump to playlist index `i`. Out of range is ignored.
    pub fn jump(&mut self, i: i64, wall_now_ms: f64) -> Vec<ServerEvent> {
        if i < 0 || i >= self.playlist.len() as i64 {
            return Vec::new();
        }
        self.playlist.current_index = i;
        self.state.position = 0.0;
        self.state.anchor = wall_now_ms;
        self.reload_tracks_from_current();
        vec![
            ServerEvent::PlaylistPosition { current_index: i },
            self.sync_event(),
        ]
    }

    /// Advance to the next item, wrapping. Empty playlist is ignored.
    pub fn skip_to_next(&mut self, wall_now_ms: f64) -> Vec<ServerEvent> {
        let len = self.playlist.len() as i64;
        if len == 0 {
            return Vec::new();
        }
        let next = (self.playlist.current_index + 1).rem_euclid(len);
        self.jump(next, wall_now_ms)
    }

    pub fn set_playing(&mut self, playing: bool, wall_now_ms: f64) -> Vec<ServerEvent> {
        clock::consolidate(&mut self.state, wall_now_ms);
        self.state.is_playing = playing;
        vec![self.sync_event()]
    }

    /// Absolute seek. Negative targets are rejected and leave the state
    /// untouched.
    pub fn seek(&mut self, time: f64, wall_now_ms: f64) -> Result<Vec<ServerEvent>, AppError> {
        if !time.is_finite() || time < 0.0 {
            return Err(AppError::Validation("seek time must be >= 0".to_string()));
        }
        self.state.position = time;
        self.state.anchor = wall_now_ms;
        Ok(vec![self.sync_event()])
    }

    /// Relative skip, floored at zero.
    pub fn skip_relative(&mut self, seconds: f64, wall_now_ms: f64) -> Vec<ServerEvent> {
        clock::consolidate(&mut self.state, wall_now_ms);
        self.state.position = (self.state.position + seconds).max(0.0);
        vec![self.sync_event()]
    }

    /// Change the rate. Off-grid values are rejected.
    pub fn set_rate(&mut self, rate: f64, wall_now_ms: f64) -> Result<Vec<ServerEvent>, AppError> {
        if !rate_on_grid(rate) {
            return Err(AppError::Validation(format!(
                "rate {rate} is off the 0.25..3.0 grid"
            )));
        }
        clock::consolidate(&mut self.state, wall_now_ms);
        self.state.rate = rate;
        Ok(vec![self.sync_event()])
    }

    /// Select an audio or subtitle track on the current item. The choice is
    /// stored on the item too, so cycling the playlist restores it.
    pub fn select_track(
        &mut self,
        kind: TrackKind,
        index: i32,
    ) -> Result<Vec<ServerEvent>, AppError> {
        match kind {
            TrackKind::Audio if index < 0 => {
                return Err(AppError::Validation(
                    "audio track index must be >= 0".to_string(),
                ));
            },
            TrackKind::Subtitle if index < -1 => {
                return Err(AppError::Validation(
                    "subtitle track index must be >= -1".to_string(),
                ));
            },
            _ => {},
        }

        match kind {
            TrackKind::Audio => self.state.audio_track = index,
            TrackKind::Subtitle => self.state.subtitle_track = index,
        }

        let current_index = self.playlist.current_index;
        if let Some(PlaylistItem::LocalMedia {
            selected_audio_track,
            selected_subtitle_track,
            ..
        }) = self.playlist.current_item_mut()
        {
            match kind {
                TrackKind::Audio => *selected_audio_track = index,
                TrackKind::Subtitle => *selected_subtitle_track = index,
            }
        }

        Ok(vec![ServerEvent::TrackChange {
            video_index: current_index,
            kind,
            track_index: index,
        }])
    }

    /// Select a track on an arbitrary item (admin `track-change` event).
    /// Selecting on the current item also updates the live state.
    pub fn select_track_on_item(
        &mut self,
        video_index: i64,
        kind: TrackKind,
        index: i32,
    ) -> Result<Vec<ServerEvent>, AppError> {
        if video_index == self.playlist.current_index {
            return self.select_track(kind, index);
        }
        let Ok(i) = usize::try_from(video_index) else {
            return Err(AppError::Validation("playlist index out of range".to_string()));
        };
        match self.playlist.items.get_mut(i) {
            Some(PlaylistItem::LocalMedia {
                selected_audio_track,
                selected_subtitle_track,
                ..
            }) => {
                match kind {
                    TrackKind::Audio if index < 0 => {
                        return Err(AppError::Validation(
                            "audio track index must be >= 0".to_string(),
                        ));
                    },
                    TrackKind::Subtitle if index < -1 => {
                        return Err(AppError::Validation(
                            "subtitle track index must be >= -1".to_string(),
                        ));
                    },
                    TrackKind::Audio => *selected_audio_track = index,
                    TrackKind::Subtitle => *selected_subtitle_track = index,
                }
                Ok(vec![ServerEvent::TrackChange {
                    video_index,
                    kind,
                    track_index: index,
                }])
            },
            Some(PlaylistItem::ExternalEmbed { .. }) => Ok(Vec::new()),
            None => Err(AppError::Validation("playlist index out of range".to_string())),
        }
    }

    /// Swap two playlist entries, fixing up the current and main pointers
    /// when they pointed at either end of the swap.
    pub fn reorder(&mut self, a: i64, b: i64) -> Result<Vec<ServerEvent>, AppError> {
        let len = self.playlist.len() as i64;
        if !(0..len).contains(&a) || !(0..len).contains(&b) {
            return Err(AppError::Validation("reorder index out of range".to_string()));
        }
        if a != b {
            self.playlist.items.swap(a as usize, b as usize);
            for pointer in [
                &mut self.playlist.current_index,
                &mut self.playlist.main_item_index,
            ] {
                if *pointer == a {
                    *pointer = b;
                } else if *pointer == b {
                    *pointer = a;
                }
            }
        }
        Ok(vec![self.playlist_event()])
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

    fn machine_with(items: Vec<PlaylistItem>) -> PlaybackMachine {
        let mut machine = PlaybackMachine::default();
        machine.set_playlist(items, None, None, false, 0.0);
        machine
    }

    #[test]
    fn rate_grid_boundaries() {
        assert!(rate_on_grid(0.25));
        assert!(rate_on_grid(3.0));
        assert!(rate_on_grid(1.0));
        assert!(!rate_on_grid(0.24));
        assert!(!rate_on_grid(3.25));
        assert!(!rate_on_grid(1.1));
    }

    #[test]
    fn set_playlist_resets_state() {
        let mut machine = PlaybackMachine::default();
        let events = machine.set_playlist(
            vec![local_item("A.mp4"), local_item("B.mp4")],
            Some(0),
            Some(10.0),
            false,
            1_000.0,
        );
        assert_eq!(machine.playlist.current_index, 0);
        assert_eq!(machine.state.position, 10.0);
        assert!(!machine.state.is_playing);
        assert_eq!(machine.state.anchor, 1_000.0);
        // playlist-update first, then sync
        assert!(matches!(events[0], ServerEvent::PlaylistUpdate(_)));
        assert!(matches!(events[1], ServerEvent::Sync(_)));
    }

    #[test]
    fn empty_playlist_means_idle() {
        let mut machine = PlaybackMachine::default();
        machine.set_playlist(Vec::new(), None, None, true, 0.0);
        assert_eq!(machine.playlist.current_index, -1);
        assert!(!machine.state.is_playing);
    }

    #[test]
    fn autoplay_starts_playing() {
        let mut machine = PlaybackMachine::default();
        machine.set_playlist(vec![local_item("A.mp4")], None, None, true, 0.0);
        assert!(machine.state.is_playing);
    }

    #[test]
    fn jump_boundaries() {
        let mut machine = machine_with(vec![local_item("A.mp4"), local_item("B.mp4")]);
        // last valid index accepted
        assert!(!machine.jump(1, 0.0).is_empty());
        assert_eq!(machine.playlist.current_index, 1);
        assert_eq!(machine.state.position, 0.0);
        // len(items) rejected (ignored)
        assert!(machine.jump(2, 0.0).is_empty());
        assert_eq!(machine.playlist.current_index, 1);
        assert!(machine.jump(-1, 0.0).is_empty());
    }

    #[test]
    fn skip_to_next_wraps() {
        let mut machine = machine_with(vec![local_item("A.mp4"), local_item("B.mp4")]);
        machine.jump(1, 0.0);
        machine.skip_to_next(0.0);
        assert_eq!(machine.playlist.current_index, 0);
    }

    #[test]
    fn skip_to_next_on_empty_is_ignored() {
        let mut machine = PlaybackMachine::default();
        assert!(machine.skip_to_next(0.0).is_empty());
    }

    #[test]
    fn seek_rejects_negative_and_accepts_zero() {
        let mut machine = machine_with(vec![local_item("A.mp4")]);
        machine.state.position = 25.0;
        assert!(machine.seek(-1.0, 0.0).is_err());
        assert_eq!(machine.state.position, 25.0);
        machine.seek(0.0, 500.0).unwrap();
        assert_eq!(machine.state.position, 0.0);
        assert_eq!(machine.state.anchor, 500.0);
    }

    #[test]
    fn skip_relative_floors_at_zero() {
        let mut machine = machine_with(vec![local_item("A.mp4")]);
        machine.state.position = 3.0;
        machine.skip_relative(-10.0, 0.0);
        assert_eq!(machine.state.position, 0.0);
    }

    #[test]
    fn set_rate_consolidates_first() {
        let mut machine = machine_with(vec![local_item("A.mp4")]);
        machine.state = PlaybackState {
            is_playing: true,
            position: 30.0,
            rate: 1.0,
            anchor: 0.0,
            audio_track: 0,
            subtitle_track: -1,
        };
        machine.set_rate(2.0, 4_000.0).unwrap();
        // S2: 30 + 1*4 consolidated, then extrapolate 2 s at rate 2
        assert_eq!(machine.state.position, 34.0);
        assert_eq!(clock::extrapolate(&machine.state, 6_000.0), 38.0);
        assert!(machine.set_rate(0.24, 0.0).is_err());
    }

    #[test]
    fn select_track_persists_on_item() {
        let mut machine = machine_with(vec![local_item("A.mp4"), local_item("B.mp4")]);
        machine.select_track(TrackKind::Subtitle, 2).unwrap();
        assert_eq!(machine.state.subtitle_track, 2);
        machine.jump(1, 0.0);
        assert_eq!(machine.state.subtitle_track, -1);
        // choice is restored when cycling back
        machine.jump(0, 0.0);
        assert_eq!(machine.state.subtitle_track, 2);
    }

    #[test]
    fn select_track_rejects_bad_domains() {
        let mut machine = machine_with(vec![local_item("A.mp4")]);
        assert!(machine.select_track(TrackKind::Audio, -1).is_err());
        assert!(machine.select_track(TrackKind::Subtitle, -2).is_err());
        assert!(machine.select_track(TrackKind::Subtitle, -1).is_ok());
    }

    #[test]
    fn reorder_fixes_pointers() {
        let mut machine = machine_with(vec![
            local_item("A.mp4"),
            local_item("B.mp4"),
            local_item("C.mp4"),
        ]);
        machine.playlist.current_index = 0;
        machine.playlist.main_item_index = 2;
        machine.reorder(0, 2).unwrap();
        assert_eq!(machine.playlist.current_index, 2);
        assert_eq!(machine.playlist.main_item_index, 0);
        assert_eq!(machine.playlist.items[2].display_name(), "A.mp4");
        assert!(machine.reorder(0, 3).is_err());
    }

    #[test]
    fn pause_then_play_keeps_position() {
        let mut machine = machine_with(vec![local_item("A.mp4")]);
        machine.state.is_playing = true;
        machine.state.position = 10.0;
        machine.state.anchor = 0.0;
        machine.set_playing(false, 2_000.0);
        assert_eq!(machine.state.position, 12.0);
        machine.set_playing(true, 9_000.0);
        // paused time does not accumulate
        assert_eq!(machine.state.position, 12.0);
        assert_eq!(machine.state.anchor, 9_000.0);
    }
}
