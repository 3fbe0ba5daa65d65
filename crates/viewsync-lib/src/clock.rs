// ============================
// viewsync-lib/src/clock.rs
// ============================
//! Wall-clock anchoring for the playback state.
//!
//! All position bookkeeping goes through two primitives: `consolidate`
//! folds elapsed real time into the stored position and re-anchors, and
//! `extrapolate` computes "position now" without mutating anything. Both
//! take the wall-clock instant as an argument so tests control time.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::playback::PlaybackState;
use crate::room::RoomRegistry;

/// Interval of the background consolidation tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Fold elapsed real time into `position` and re-anchor at `wall_now_ms`.
///
/// The elapsed term is clamped at zero so a backward wall-clock jump can
/// never rewind the position.
pub fn consolidate(state: &mut PlaybackState, wall_now_ms: f64) {
    if state.is_playing {
        let elapsed_s = ((wall_now_ms - state.anchor) / 1000.0).max(0.0);
        state.position += state.rate * elapsed_s;
    }
    state.anchor = wall_now_ms;
}

/// Logical position at `wall_now_ms`, without mutating the state.
pub fn extrapolate(state: &PlaybackState, wall_now_ms: f64) -> f64 {
    if state.is_playing {
        let elapsed_s = ((wall_now_ms - state.anchor) / 1000.0).max(0.0);
        state.position + state.rate * elapsed_s
    } else {
        state.position
    }
}

/// Background ticker: every 5 s, consolidate every playing room so the
/// stored position never drifts unboundedly far from real time. The tick
/// itself broadcasts nothing.
pub fn spawn_consolidation_ticker(rooms: Arc<RoomRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            rooms.consolidate_all(now_ms()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackState;

    fn playing_state(position: f64, rate: f64, anchor: f64) -> PlaybackState {
        PlaybackState {
            is_playing: true,
            position,
            rate,
            anchor,
            audio_track: 0,
            subtitle_track: -1,
        }
    }

    #[test]
    fn extrapolate_while_playing() {
        let state = playing_state(30.0, 1.0, 1_000.0);
        assert_eq!(extrapolate(&state, 5_000.0), 34.0);
    }

    #[test]
    fn extrapolate_while_paused_is_constant() {
        let mut state = playing_state(30.0, 1.0, 1_000.0);
        state.is_playing = false;
        assert_eq!(extrapolate(&state, 500_000.0), 30.0);
    }

    #[test]
    fn consolidate_folds_elapsed_time() {
        let mut state = playing_state(30.0, 2.0, 1_000.0);
        consolidate(&mut state, 3_000.0);
        assert_eq!(state.position, 34.0);
        assert_eq!(state.anchor, 3_000.0);
    }

    #[test]
    fn consolidate_is_idempotent_within_one_tick() {
        let mut state = playing_state(30.0, 1.5, 1_000.0);
        consolidate(&mut state, 4_000.0);
        let first = state.position;
        consolidate(&mut state, 4_000.0);
        assert_eq!(state.position, first);
    }

    #[test]
    fn backward_wall_clock_jump_does_not_rewind() {
        let mut state = playing_state(30.0, 1.0, 10_000.0);
        consolidate(&mut state, 2_000.0);
        assert_eq!(state.position, 30.0);
        assert_eq!(state.anchor, 2_000.0);

        let state = playing_state(30.0, 1.0, 10_000.0);
        assert_eq!(extrapolate(&state, 2_000.0), 30.0);
    }

    #[test]
    fn rate_change_recovers_history() {
        // rate 1 for 4 s, then rate 2 for 2 s: 30 + 4 + 4 = 38
        let t0 = 0.0;
        let mut state = playing_state(30.0, 1.0, t0);
        consolidate(&mut state, t0 + 4_000.0);
        state.rate = 2.0;
        assert_eq!(extrapolate(&state, t0 + 6_000.0), 38.0);
    }

    #[test]
    fn monotonic_while_playing() {
        let state = playing_state(10.0, 1.0, 0.0);
        let p1 = extrapolate(&state, 1_000.0);
        let p2 = extrapolate(&state, 1_500.0);
        assert!(p2 >= p1);
    }
}
