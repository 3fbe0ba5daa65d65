// ============================
// viewsync-lib/src/dispatcher.rs
// ============================
//! The single inbound event pipeline.
//!
//! Every client event passes through the same stages: shape validation,
//! admin authorization, room resolution, mutation under the room's write
//! lock, then broadcast emission. Bad payloads are dropped with a warning
//! and never disconnect the sender; room-visible state never reflects a
//! failed attempt.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use tracing::{debug, warn};
use viewsync_common::events::{
    ClientEntry, ClientEvent, ControlAction, ControlEvent, ServerEvent, SkipDirection,
};
use viewsync_common::model::PlaylistItem;

use crate::admin::{AdminRegistration, REJECT_DISCONNECT_DELAY};
use crate::bsl::{auto_match, MatchOptions};
use crate::chat::{self, ChatOutcome};
use crate::clock;
use crate::config::JoinMode;
use crate::logbook::detail;
use crate::room::{Room, SharedRoom};
use crate::sessions::ConnectionId;
use crate::validation;
use crate::AppState;

const UNAUTHORIZED_DEVICE: &str = "Unauthorized device fingerprint for this server";

/// Per-connection dispatch context, owned by the connection's read task.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub conn_id: ConnectionId,
    pub remote_addr: IpAddr,
    pub room_code: Option<String>,
    pub fingerprint: Option<String>,
    /// When set, the read loop drops the connection after this grace.
    pub disconnect_after: Option<Duration>,
}

impl ConnContext {
    pub fn new(conn_id: ConnectionId, remote_addr: IpAddr) -> Self {
        Self {
            conn_id,
            remote_addr,
            room_code: None,
            fingerprint: None,
            disconnect_after: None,
        }
    }
}

/// Whether an event is on the admin-only whitelist.
fn admin_only(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::SetPlaylist { .. }
            | ClientEvent::PlaylistReorder { .. }
            | ClientEvent::PlaylistJump { .. }
            | ClientEvent::PlaylistNext { .. }
            | ClientEvent::TrackChange { .. }
            | ClientEvent::SkipToNextVideo
            | ClientEvent::BslCheckRequest
            | ClientEvent::BslGetStatus
            | ClientEvent::BslManualMatch { .. }
            | ClientEvent::BslSetDrift { .. }
            | ClientEvent::SetClientName { .. }
            | ClientEvent::SetClientDisplayName { .. }
            | ClientEvent::GetClientList
            | ClientEvent::DeleteRoom { .. }
    )
}

pub struct Dispatcher {
    state: Arc<AppState>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn send(&self, conn_id: &str, event: ServerEvent) {
        self.state.connections.send_to(conn_id, event);
    }

    fn broadcast(&self, room_code: &str, events: &[ServerEvent]) {
        for event in events {
            self.state.connections.broadcast_room(room_code, event);
        }
    }

    fn admin_error(&self, conn_id: &str, event: &ClientEvent, message: impl Into<String>) {
        self.send(
            conn_id,
            ServerEvent::AdminError {
                event: event.wire_name().to_string(),
                message: message.into(),
            },
        );
    }

    /// The connection's current room: its explicit subscription, or the
    /// implicit room in single-room mode.
    fn room_for(&self, ctx: &ConnContext) -> Option<(String, SharedRoom)> {
        let code = ctx
            .room_code
            .clone()
            .or_else(|| self.state.default_room_code.clone())?;
        let room = self.state.rooms.find(&code)?;
        Some((code.to_uppercase(), room))
    }

    /// Viewer-count broadcast for a room (plus the legacy `client-count`
    /// mirror in single-room mode).
    fn broadcast_presence(&self, room_code: &str, viewer_count: usize) {
        self.state
            .connections
            .broadcast_room(room_code, &ServerEvent::ViewerCount(viewer_count));
        if self.state.legacy_mode() {
            self.state
                .connections
                .broadcast_room(room_code, &ServerEvent::ClientCount(viewer_count));
        }
    }

    async fn publish_rooms_changed(&self) {
        let listing = self.state.rooms.list_public().await;
        self.state
            .connections
            .broadcast_all(&ServerEvent::RoomsUpdated(listing));
    }

    /// Entry point: route one validated event from one connection.
    pub async fn dispatch(&self, ctx: &mut ConnContext, event: ClientEvent) {
        if let Err(validation_err) = validation::validate_event(&event) {
            warn!(
                conn = %ctx.conn_id,
                event = event.wire_name(),
                error = %validation_err,
                "dropping invalid payload"
            );
            metrics::counter!("event.rejected").increment(1);
            return;
        }

        if admin_only(&event) && !self.state.admin.is_verified(&ctx.conn_id) {
            self.admin_error(&ctx.conn_id, &event, "admin privileges required");
            metrics::counter!("event.rejected").increment(1);
            return;
        }
        metrics::counter!("event.dispatched").increment(1);

        match event {
            ClientEvent::CreateRoom {
                name,
                is_private,
                fingerprint,
            } => self.handle_create_room(ctx, name, is_private, fingerprint).await,
            ClientEvent::JoinRoom {
                room_code,
                name,
                fingerprint,
            } => self.handle_join_room(ctx, room_code, name, fingerprint).await,
            ClientEvent::LeaveRoom => self.leave_current(ctx).await,
            ClientEvent::DeleteRoom {
                room_code,
                fingerprint,
            } => self.handle_delete_room(ctx, room_code, fingerprint).await,
            ClientEvent::GetRooms => {
                let listing = self.state.rooms.list_public().await;
                self.send(&ctx.conn_id, ServerEvent::RoomsUpdated(listing));
            },
            ClientEvent::RequestInitialState => self.handle_initial_state(ctx).await,
            ClientEvent::RequestSync => {
                if let Some((_, room)) = self.room_for(ctx) {
                    let snapshot = room.read().await.playback.state.snapshot();
                    self.send(&ctx.conn_id, ServerEvent::Sync(snapshot));
                }
            },
            ClientEvent::Control(control) => self.handle_control(ctx, control).await,
            ClientEvent::SetPlaylist {
                playlist,
                main_video_index,
                start_time,
            } => {
                self.handle_set_playlist(ctx, playlist, main_video_index, start_time)
                    .await
            },
            ClientEvent::PlaylistJump { index } | ClientEvent::PlaylistNext { index } => {
                if let Some((code, room)) = self.room_for(ctx) {
                    let mut guard = room.write().await;
                    let events = guard.playback.jump(index, clock::now_ms());
                    self.broadcast(&code, &events);
                }
            },
            ClientEvent::PlaylistReorder {
                from_index,
                to_index,
            } => {
                let Some((code, room)) = self.room_for(ctx) else {
                    return;
                };
                let mut guard = room.write().await;
                match guard.playback.reorder(from_index, to_index) {
                    Ok(events) => self.broadcast(&code, &events),
                    Err(e) => self.admin_error(
                        &ctx.conn_id,
                        &ClientEvent::PlaylistReorder {
                            from_index,
                            to_index,
                        },
                        e.to_string(),
                    ),
                }
            },
            ClientEvent::SkipToNextVideo => {
                if let Some((code, room)) = self.room_for(ctx) {
                    let mut guard = room.write().await;
                    let events = guard.playback.skip_to_next(clock::now_ms());
                    self.broadcast(&code, &events);
                }
            },
            ClientEvent::TrackChange {
                video_index,
                kind,
                track_index,
            } => {
                let Some((code, room)) = self.room_for(ctx) else {
                    return;
                };
                let mut guard = room.write().await;
                match guard.playback.select_track_on_item(video_index, kind, track_index) {
                    Ok(events) => self.broadcast(&code, &events),
                    Err(e) => self.admin_error(
                        &ctx.conn_id,
                        &ClientEvent::TrackChange {
                            video_index,
                            kind,
                            track_index,
                        },
                        e.to_string(),
                    ),
                }
            },
            ClientEvent::BslAdminRegister {
                fingerprint,
                room_code,
            } => {
                self.handle_bsl_admin_register(ctx, fingerprint, room_code)
                    .await
            },
            ClientEvent::BslCheckRequest => self.handle_bsl_check(ctx, true).await,
            ClientEvent::BslGetStatus => self.handle_bsl_check(ctx, false).await,
            ClientEvent::BslFolderSelected {
                fingerprint,
                display_name,
                files,
            } => {
                self.handle_bsl_folder_selected(ctx, fingerprint, display_name, files)
                    .await
            },
            ClientEvent::BslManualMatch {
                client_connection_id,
                client_file_name,
                playlist_index,
            } => {
                self.handle_bsl_manual_match(
                    ctx,
                    client_connection_id,
                    client_file_name,
                    playlist_index,
                )
                .await
            },
            ClientEvent::BslSetDrift {
                client_fingerprint,
                playlist_index,
                drift_seconds,
            } => {
                self.handle_bsl_set_drift(ctx, client_fingerprint, playlist_index, drift_seconds)
                    .await
            },
            ClientEvent::ClientRegister { fingerprint } => {
                self.handle_client_register(ctx, fingerprint).await
            },
            ClientEvent::GetClientList => {
                if let Some((_, room)) = self.room_for(ctx) {
                    let guard = room.read().await;
                    let mut clients: Vec<ClientEntry> = guard
                        .viewers
                        .iter()
                        .map(|(conn_id, viewer)| ClientEntry {
                            connection_id: conn_id.clone(),
                            fingerprint: viewer.fingerprint.clone(),
                            display_name: viewer.display_name.clone(),
                        })
                        .collect();
                    clients.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
                    self.send(&ctx.conn_id, ServerEvent::ClientList { clients });
                }
            },
            ClientEvent::SetClientName {
                client_id,
                display_name,
            } => {
                self.handle_set_client_name(ctx, client_id, display_name)
                    .await
            },
            ClientEvent::SetClientDisplayName {
                fingerprint,
                display_name,
            } => {
                self.handle_set_client_display_name(ctx, fingerprint, display_name)
                    .await
            },
            ClientEvent::ChatMessage { sender, message } => {
                self.handle_chat(ctx, sender, message).await
            },
        }
    }

    /// Cleanup when a connection drops: leave the room, revoke admin
    /// verification, unregister the outbound channel.
    pub async fn connection_closed(&self, ctx: &mut ConnContext) {
        self.leave_current(ctx).await;
        self.state.admin.revoke(&ctx.conn_id);
        self.state.connections.unregister(&ctx.conn_id);
    }

    async fn leave_current(&self, ctx: &mut ConnContext) {
        let Some(code) = ctx.room_code.take() else {
            return;
        };
        self.state.connections.leave_group(&code, &ctx.conn_id);
        if let Some(room) = self.state.rooms.find(&code) {
            let viewer_count = {
                let mut guard = room.write().await;
                guard.remove_viewer(&ctx.conn_id);
                guard.viewer_count()
            };
            self.broadcast_presence(&code, viewer_count);
        }
    }

    async fn handle_create_room(
        &self,
        ctx: &mut ConnContext,
        name: String,
        is_private: bool,
        fingerprint: String,
    ) {
        match self.state.admin.register(&ctx.conn_id, &fingerprint).await {
            AdminRegistration::Rejected => {
                self.send(
                    &ctx.conn_id,
                    ServerEvent::AdminAuthResult {
                        success: false,
                        reason: Some(UNAUTHORIZED_DEVICE.to_string()),
                    },
                );
                ctx.disconnect_after = Some(REJECT_DISCONNECT_DELAY);
                return;
            },
            AdminRegistration::Accepted { newly_locked } => {
                if newly_locked {
                    if let Err(e) = self.state.memory.set_admin_fingerprint(&fingerprint).await {
                        warn!(error = %e, "failed to persist admin fingerprint");
                    }
                }
            },
        }

        let (code, room) = match self
            .state
            .rooms
            .create_room(name.clone(), is_private, fingerprint.clone())
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.send(
                    &ctx.conn_id,
                    ServerEvent::CreateRoomResult {
                        success: false,
                        room_code: None,
                        room_name: None,
                        error: Some(e.to_string()),
                    },
                );
                return;
            },
        };

        self.leave_current(ctx).await;
        let display_name = self
            .state
            .memory
            .client_name(&fingerprint)
            .await
            .unwrap_or_else(|| "Admin".to_string());
        {
            let mut guard = room.write().await;
            guard.add_viewer(ctx.conn_id.clone(), fingerprint.clone(), display_name);
            guard.admin_connection_id = Some(ctx.conn_id.clone());
        }
        self.state.connections.join_group(&code, &ctx.conn_id);
        ctx.room_code = Some(code.clone());
        ctx.fingerprint = Some(fingerprint);

        self.send(
            &ctx.conn_id,
            ServerEvent::CreateRoomResult {
                success: true,
                room_code: Some(code.clone()),
                room_name: Some(name.clone()),
                error: None,
            },
        );
        if !is_private {
            self.publish_rooms_changed().await;
        }
        self.state
            .logbook
            .room(&code, "room-created", detail(&[("name", json!(name))]))
            .await;
    }

    async fn handle_join_room(
        &self,
        ctx: &mut ConnContext,
        room_code: String,
        name: String,
        fingerprint: String,
    ) {
        let Some(room) = self.state.rooms.find(&room_code) else {
            self.send(
                &ctx.conn_id,
                ServerEvent::JoinRoomResult {
                    success: false,
                    room_name: None,
                    is_admin: None,
                    viewers: None,
                    error: Some("Room not found".to_string()),
                },
            );
            return;
        };
        let code = room_code.to_uppercase();

        self.leave_current(ctx).await;

        let display_name = match validation::validate_display_name(&name) {
            Ok(valid) => valid,
            Err(_) => self
                .state
                .memory
                .client_name(&fingerprint)
                .await
                .unwrap_or_else(|| "Viewer".to_string()),
        };
        let is_admin = self
            .state
            .rooms
            .is_admin_fingerprint(&code, &fingerprint)
            .await;

        let (room_name, viewers, viewer_count, reset_events) = {
            let mut guard = room.write().await;
            guard.add_viewer(ctx.conn_id.clone(), fingerprint.clone(), display_name);
            if is_admin {
                guard.admin_connection_id = Some(ctx.conn_id.clone());
                self.state.admin.grant(&ctx.conn_id, &fingerprint);
            }
            let reset_events = if self.state.settings.join_mode == JoinMode::Reset {
                guard
                    .playback
                    .seek(0.0, clock::now_ms())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (
                guard.name.clone(),
                guard.viewer_summaries(),
                guard.viewer_count(),
                reset_events,
            )
        };

        self.state.connections.join_group(&code, &ctx.conn_id);
        ctx.room_code = Some(code.clone());
        ctx.fingerprint = Some(fingerprint);

        self.send(
            &ctx.conn_id,
            ServerEvent::JoinRoomResult {
                success: true,
                room_name: Some(room_name),
                is_admin: Some(is_admin),
                viewers: Some(viewers),
                error: None,
            },
        );

        if reset_events.is_empty() {
            // sync mode: the joiner gets the live snapshot
            let snapshot = room.read().await.playback.state.snapshot();
            self.send(&ctx.conn_id, ServerEvent::Sync(snapshot));
        } else {
            // reset mode: everyone restarts from zero
            self.broadcast(&code, &reset_events);
        }
        self.broadcast_presence(&code, viewer_count);
        self.state
            .logbook
            .room(&code, "viewer-joined", detail(&[]))
            .await;
    }

    async fn handle_delete_room(&self, ctx: &mut ConnContext, room_code: String, fingerprint: String) {
        match self.state.rooms.delete_room(&room_code, &fingerprint).await {
            Ok(room) => {
                let code = room_code.to_uppercase();
                self.state.connections.broadcast_room(
                    &code,
                    &ServerEvent::RoomDeleted {
                        room_code: code.clone(),
                    },
                );
                let viewer_conns: Vec<ConnectionId> = {
                    let guard = room.read().await;
                    guard.viewers.keys().cloned().collect()
                };
                for conn_id in viewer_conns {
                    self.state.connections.leave_group(&code, &conn_id);
                }
                if ctx.room_code.as_deref() == Some(code.as_str()) {
                    ctx.room_code = None;
                }
                self.state.logbook.delete_room_log(&code).await;
                self.publish_rooms_changed().await;
            },
            Err(e) => self.admin_error(
                &ctx.conn_id,
                &ClientEvent::DeleteRoom {
                    room_code,
                    fingerprint,
                },
                e.to_string(),
            ),
        }
    }

    async fn handle_initial_state(&self, ctx: &ConnContext) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };
        let guard = room.read().await;
        self.send(
            &ctx.conn_id,
            ServerEvent::PlaylistUpdate(guard.playback.playlist.clone()),
        );
        self.send(
            &ctx.conn_id,
            ServerEvent::Sync(guard.playback.state.snapshot()),
        );
        self.send(&ctx.conn_id, ServerEvent::ViewerCount(guard.viewer_count()));
    }

    async fn handle_control(&self, ctx: &ConnContext, control: ControlEvent) {
        if self.state.settings.client_controls_disabled
            && !self.state.admin.is_verified(&ctx.conn_id)
        {
            debug!(conn = %ctx.conn_id, "client controls are disabled, dropping control event");
            return;
        }
        let Some((code, room)) = self.room_for(ctx) else {
            return;
        };
        let now = clock::now_ms();

        match control {
            ControlEvent::Action(action) => {
                let mut guard = room.write().await;
                let result = match action {
                    ControlAction::Playpause { state } => Ok(guard.playback.set_playing(state, now)),
                    ControlAction::Skip { direction, seconds } => {
                        let magnitude =
                            seconds.unwrap_or(self.state.settings.skip_seconds as f64);
                        let signed = match direction {
                            SkipDirection::Forward => magnitude,
                            SkipDirection::Backward => -magnitude,
                        };
                        Ok(guard.playback.skip_relative(signed, now))
                    },
                    ControlAction::Seek { time } => guard.playback.seek(time, now),
                    ControlAction::SelectTrack { kind, index } => {
                        guard.playback.select_track(kind, index)
                    },
                    ControlAction::Rate { rate } => guard.playback.set_rate(rate, now),
                };
                match result {
                    Ok(events) => self.broadcast(&code, &events),
                    Err(e) => self.send(
                        &ctx.conn_id,
                        ServerEvent::AdminError {
                            event: "control".to_string(),
                            message: e.to_string(),
                        },
                    ),
                }
            },
            ControlEvent::StatePush(push) => {
                if self.state.settings.client_sync_disabled {
                    debug!(conn = %ctx.conn_id, "client sync is disabled, ignoring state push");
                    return;
                }
                let mut guard = room.write().await;
                let state = &mut guard.playback.state;
                state.is_playing = push.is_playing;
                state.position = push.position;
                if let Some(rate) = push.rate.filter(|r| crate::playback::rate_on_grid(*r)) {
                    state.rate = rate;
                }
                state.anchor = now;
                let snapshot = state.snapshot();
                self.broadcast(&code, &[ServerEvent::Sync(snapshot)]);
            },
        }
    }

    async fn handle_set_playlist(
        &self,
        ctx: &ConnContext,
        playlist: Vec<PlaylistItem>,
        main_video_index: Option<i64>,
        start_time: Option<f64>,
    ) {
        let Some((code, room)) = self.room_for(ctx) else {
            self.send(
                &ctx.conn_id,
                ServerEvent::PlaylistSet {
                    success: false,
                    error: Some("not in a room".to_string()),
                },
            );
            return;
        };

        // Enrich and filter before taking the room lock: metadata probes
        // never run under a room lock.
        let mut items = Vec::with_capacity(playlist.len());
        for mut item in playlist {
            match &mut item {
                PlaylistItem::LocalMedia {
                    filename, tracks, ..
                } => {
                    if validation::validate_filename(filename).is_err() {
                        warn!(file = %filename, "dropping playlist item with invalid filename");
                        continue;
                    }
                    *tracks = self
                        .state
                        .media
                        .tracks_for(filename)
                        .await
                        .unwrap_or_default();
                },
                PlaylistItem::ExternalEmbed { .. } => {},
            }
            items.push(item);
        }

        let events = {
            let mut guard = room.write().await;
            let events = guard.playback.set_playlist(
                items,
                main_video_index,
                start_time,
                self.state.settings.video_autoplay,
                clock::now_ms(),
            );
            self.broadcast(&code, &events);
            events
        };
        debug!(room = %code, events = events.len(), "playlist replaced");

        self.send(
            &ctx.conn_id,
            ServerEvent::PlaylistSet {
                success: true,
                error: None,
            },
        );
        self.state
            .logbook
            .room(&code, "playlist-set", detail(&[]))
            .await;
    }

    async fn handle_bsl_admin_register(
        &self,
        ctx: &mut ConnContext,
        fingerprint: String,
        room_code: Option<String>,
    ) {
        match self.state.admin.register(&ctx.conn_id, &fingerprint).await {
            AdminRegistration::Rejected => {
                self.send(
                    &ctx.conn_id,
                    ServerEvent::AdminAuthResult {
                        success: false,
                        reason: Some(UNAUTHORIZED_DEVICE.to_string()),
                    },
                );
                ctx.disconnect_after = Some(REJECT_DISCONNECT_DELAY);
                return;
            },
            AdminRegistration::Accepted { newly_locked } => {
                if newly_locked {
                    if let Err(e) = self.state.memory.set_admin_fingerprint(&fingerprint).await {
                        warn!(error = %e, "failed to persist admin fingerprint");
                    }
                }
            },
        }

        let target = room_code.or_else(|| self.state.default_room_code.clone());
        if let Some(code) = target {
            if let Some(room) = self.state.rooms.find(&code) {
                let code = code.to_uppercase();
                {
                    let mut guard = room.write().await;
                    if guard.admin_fingerprint.is_none() {
                        guard.admin_fingerprint = Some(fingerprint.clone());
                    }
                    if guard.admin_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                        guard.admin_connection_id = Some(ctx.conn_id.clone());
                    }
                }
                self.state.connections.join_group(&code, &ctx.conn_id);
                ctx.room_code = Some(code);
            }
        }
        ctx.fingerprint = Some(fingerprint);

        self.send(
            &ctx.conn_id,
            ServerEvent::AdminAuthResult {
                success: true,
                reason: None,
            },
        );
    }

    /// `bsl-check-request` prompts viewers that have not selected a folder
    /// and then reports status; `bsl-get-status` only reports.
    async fn handle_bsl_check(&self, ctx: &ConnContext, prompt: bool) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };
        let guard = room.read().await;
        if prompt {
            let unreported = guard.bsl.unreported_connections(guard.viewers.keys());
            for conn_id in unreported {
                self.send(&conn_id, ServerEvent::BslCheck);
            }
        }
        let status = guard.bsl.status(
            self.state.settings.bsl_mode,
            guard.playback.playlist.len(),
            &guard.drift,
        );
        self.send(&ctx.conn_id, ServerEvent::BslStatusUpdate(status));
    }

    async fn handle_bsl_folder_selected(
        &self,
        ctx: &mut ConnContext,
        fingerprint: String,
        display_name: String,
        files: Vec<viewsync_common::events::BslFileInfo>,
    ) {
        let Some((code, room)) = self.room_for(ctx) else {
            return;
        };
        ctx.fingerprint = Some(fingerprint.clone());

        let persisted = self.state.memory.bsl_matches_for(&fingerprint).await;

        // stat server copies outside the room lock
        let local_filenames: Vec<String> = {
            let guard = room.read().await;
            guard
                .playback
                .playlist
                .items
                .iter()
                .filter_map(|item| item.filename().map(str::to_string))
                .collect()
        };
        let mut server_sizes = HashMap::new();
        for filename in local_filenames {
            if let Some(size) = self.state.media.file_size(&filename).await {
                server_sizes.insert(filename, size);
            }
        }

        let options = MatchOptions {
            advanced: self.state.settings.bsl_advanced_match,
            threshold: self.state.settings.bsl_match_threshold,
        };

        let (matches, total_playlist, admin_conn, status) = {
            let mut guard = room.write().await;
            let matches = auto_match(
                &files,
                &guard.playback.playlist.items,
                &persisted,
                &server_sizes,
                &options,
            );
            let display = validation::validate_display_name(&display_name)
                .ok()
                .or_else(|| guard.viewers.get(&ctx.conn_id).map(|v| v.display_name.clone()))
                .unwrap_or_else(|| "Viewer".to_string());
            guard.bsl.record_folder(
                &ctx.conn_id,
                fingerprint.clone(),
                display,
                files,
                matches.clone(),
            );
            let total = guard.playback.playlist.len();
            let status = guard.bsl.status(self.state.settings.bsl_mode, total, &guard.drift);
            (matches, total, guard.admin_connection_id.clone(), status)
        };

        self.send(
            &ctx.conn_id,
            ServerEvent::BslMatchResult {
                total_matched: matches.len(),
                matched_videos: matches,
                total_playlist,
            },
        );
        if let Some(admin_conn) = admin_conn {
            self.send(&admin_conn, ServerEvent::BslStatusUpdate(status));
        }
        debug!(room = %code, "bsl folder recorded");
    }

    async fn handle_bsl_manual_match(
        &self,
        ctx: &ConnContext,
        client_connection_id: String,
        client_file_name: String,
        playlist_index: usize,
    ) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };

        let outcome = {
            let mut guard = room.write().await;
            let len = guard.playback.playlist.len();
            if playlist_index >= len {
                Err("playlist index out of range".to_string())
            } else {
                let playlist_file = guard.playback.playlist.items[playlist_index]
                    .filename()
                    .map(str::to_string);
                match playlist_file {
                    None => Err("cannot match an external item".to_string()),
                    Some(playlist_file) => {
                        guard.bsl.set_manual_match(
                            &client_connection_id,
                            playlist_index,
                            client_file_name.clone(),
                        );
                        let client = guard.bsl.client(&client_connection_id);
                        let client_fp = client
                            .map(|c| c.fingerprint.clone())
                            .filter(|fp| !fp.is_empty())
                            .or_else(|| {
                                guard
                                    .viewers
                                    .get(&client_connection_id)
                                    .map(|v| v.fingerprint.clone())
                            });
                        let matches = guard
                            .bsl
                            .client(&client_connection_id)
                            .map(|c| c.matches.clone())
                            .unwrap_or_default();
                        let status = guard.bsl.status(
                            self.state.settings.bsl_mode,
                            len,
                            &guard.drift,
                        );
                        Ok((playlist_file, client_fp, matches, status))
                    },
                }
            }
        };

        match outcome {
            Ok((playlist_file, client_fp, matches, status)) => {
                if let Some(fp) = client_fp {
                    if let Err(e) = self
                        .state
                        .memory
                        .remember_bsl_match(&fp, &client_file_name, &playlist_file)
                        .await
                    {
                        warn!(error = %e, "failed to persist manual match");
                    }
                }
                let total = status.bsl_active.len();
                self.send(
                    &client_connection_id,
                    ServerEvent::BslMatchResult {
                        total_matched: matches.len(),
                        matched_videos: matches,
                        total_playlist: total,
                    },
                );
                self.send(&ctx.conn_id, ServerEvent::BslStatusUpdate(status));
            },
            Err(message) => self.admin_error(
                &ctx.conn_id,
                &ClientEvent::BslManualMatch {
                    client_connection_id,
                    client_file_name,
                    playlist_index,
                },
                message,
            ),
        }
    }

    async fn handle_bsl_set_drift(
        &self,
        ctx: &ConnContext,
        client_fingerprint: String,
        playlist_index: usize,
        drift_seconds: i64,
    ) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };

        let (drift_values, target_conns, status) = {
            let mut guard = room.write().await;
            if playlist_index >= guard.playback.playlist.len() {
                self.admin_error(
                    &ctx.conn_id,
                    &ClientEvent::BslSetDrift {
                        client_fingerprint,
                        playlist_index,
                        drift_seconds,
                    },
                    "playlist index out of range",
                );
                return;
            }
            guard
                .drift
                .set(&client_fingerprint, playlist_index, drift_seconds);
            let drift_values = guard.drift.values_for(&client_fingerprint);
            let target_conns = guard.connections_for_fingerprint(&client_fingerprint);
            let status = guard.bsl.status(
                self.state.settings.bsl_mode,
                guard.playback.playlist.len(),
                &guard.drift,
            );
            (drift_values, target_conns, status)
        };

        // drift isolation: only connections with this fingerprint hear it
        for conn_id in target_conns {
            self.send(
                &conn_id,
                ServerEvent::BslDriftUpdate {
                    drift_values: drift_values.clone(),
                },
            );
        }
        self.send(&ctx.conn_id, ServerEvent::BslStatusUpdate(status));
    }

    async fn handle_client_register(&self, ctx: &mut ConnContext, fingerprint: String) {
        ctx.fingerprint = Some(fingerprint.clone());

        if let Some(name) = self.state.memory.client_name(&fingerprint).await {
            self.send(&ctx.conn_id, ServerEvent::NameUpdated { display_name: name });
        }

        // single-room mode: registration joins the implicit room
        if let Some(code) = self.state.default_room_code.clone() {
            if ctx.room_code.is_none() {
                let Some(room) = self.state.rooms.find(&code) else {
                    return;
                };
                let display_name = self
                    .state
                    .memory
                    .client_name(&fingerprint)
                    .await
                    .unwrap_or_else(|| "Viewer".to_string());
                let viewer_count = {
                    let mut guard = room.write().await;
                    guard.add_viewer(ctx.conn_id.clone(), fingerprint, display_name);
                    guard.viewer_count()
                };
                self.state.connections.join_group(&code, &ctx.conn_id);
                ctx.room_code = Some(code.clone());
                self.broadcast_presence(&code, viewer_count);
            }
        }
    }

    async fn handle_set_client_name(
        &self,
        ctx: &ConnContext,
        client_id: String,
        display_name: String,
    ) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };
        let fingerprint = {
            let mut guard = room.write().await;
            match guard.viewers.get_mut(&client_id) {
                Some(viewer) => {
                    viewer.display_name = display_name.clone();
                    Some(viewer.fingerprint.clone())
                },
                None => None,
            }
        };
        match fingerprint {
            Some(fingerprint) => {
                if let Err(e) = self
                    .state
                    .memory
                    .set_client_name(&fingerprint, &display_name)
                    .await
                {
                    warn!(error = %e, "failed to persist client name");
                }
                self.send(&client_id, ServerEvent::NameUpdated { display_name });
            },
            None => self.admin_error(
                &ctx.conn_id,
                &ClientEvent::SetClientName {
                    client_id,
                    display_name,
                },
                "no such client connection",
            ),
        }
    }

    async fn handle_set_client_display_name(
        &self,
        ctx: &ConnContext,
        fingerprint: String,
        display_name: String,
    ) {
        let Some((_, room)) = self.room_for(ctx) else {
            return;
        };
        let target_conns = {
            let mut guard = room.write().await;
            let conns = guard.connections_for_fingerprint(&fingerprint);
            for conn_id in &conns {
                if let Some(viewer) = guard.viewers.get_mut(conn_id) {
                    viewer.display_name = display_name.clone();
                }
            }
            conns
        };
        if let Err(e) = self
            .state
            .memory
            .set_client_name(&fingerprint, &display_name)
            .await
        {
            warn!(error = %e, "failed to persist client name");
        }
        for conn_id in target_conns {
            self.send(
                &conn_id,
                ServerEvent::NameUpdated {
                    display_name: display_name.clone(),
                },
            );
        }
    }

    async fn handle_chat(&self, ctx: &ConnContext, sender: String, message: String) {
        if !self.state.settings.chat_enabled {
            return;
        }
        let Some((code, room)) = self.room_for(ctx) else {
            return;
        };

        let (known_name, fingerprint) = {
            let guard = room.read().await;
            match guard.viewers.get(&ctx.conn_id) {
                Some(viewer) => (
                    Some(viewer.display_name.clone()),
                    Some(viewer.fingerprint.clone()),
                ),
                None => (None, ctx.fingerprint.clone()),
            }
        };
        let sender_name = known_name.unwrap_or(sender);

        match chat::process_message(&sender_name, &message) {
            ChatOutcome::Broadcast { sender, message } => {
                metrics::counter!("chat.message").increment(1);
                self.broadcast(
                    &code,
                    &[ServerEvent::ChatMessage {
                        sender,
                        message,
                        system: false,
                    }],
                );
            },
            ChatOutcome::Rename { new_name } => {
                {
                    let mut guard = room.write().await;
                    if let Some(viewer) = guard.viewers.get_mut(&ctx.conn_id) {
                        viewer.display_name = new_name.clone();
                    }
                }
                if let Some(fingerprint) = fingerprint {
                    if let Err(e) = self
                        .state
                        .memory
                        .set_client_name(&fingerprint, &new_name)
                        .await
                    {
                        warn!(error = %e, "failed to persist rename");
                    }
                }
                self.send(
                    &ctx.conn_id,
                    ServerEvent::NameUpdated {
                        display_name: new_name.clone(),
                    },
                );
                self.broadcast(
                    &code,
                    &[ServerEvent::ChatMessage {
                        sender: "System".to_string(),
                        message: chat::rename_announcement(&sender_name, &new_name),
                        system: true,
                    }],
                );
            },
            ChatOutcome::Ignored => {},
        }
    }
}

/// Read-only helper used by the HTTP layer for room detail endpoints.
pub async fn room_detail(room: &SharedRoom) -> serde_json::Value {
    let guard: tokio::sync::RwLockReadGuard<'_, Room> = room.read().await;
    json!({
        "code": guard.code,
        "name": guard.name,
        "viewers": guard.viewer_count(),
        "createdAt": guard.created_at.timestamp_millis(),
        "currentIndex": guard.playback.playlist.current_index,
        "isPlaying": guard.playback.state.is_playing,
    })
}
