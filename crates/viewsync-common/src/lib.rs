// ================
// viewsync-common/src/lib.rs
// ================
//! Common types shared between the viewsync server and its clients.
//! This crate defines the event-oriented wire protocol and the playlist /
//! track data model that both sides agree on.

pub mod events;
pub mod model;

pub use events::{ClientEvent, ControlAction, ControlEvent, ServerEvent};
pub use model::{
    ExternalPlatform, MediaKind, Playlist, PlaylistItem, SyncLevel, SyncSnapshot, Track,
    TrackKind, TrackLists,
};
