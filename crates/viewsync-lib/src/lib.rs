// ============================
// viewsync-lib/src/lib.rs
// ============================
//! Core library for the viewsync synchronized playback server.

pub mod admin;
pub mod bsl;
pub mod chat;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod jobs;
pub mod logbook;
pub mod media;
pub mod memory;
pub mod playback;
pub mod room;
pub mod sessions;
pub mod validation;
pub mod ws_router;

use std::sync::Arc;

use crate::admin::{AdminAuthority, CsrfTokens};
use crate::config::Settings;
use crate::error::AppError;
use crate::jobs::{JobQueue, JobRunner};
use crate::logbook::Logbook;
use crate::media::MediaLibrary;
use crate::memory::MemoryStore;
use crate::room::RoomRegistry;
use crate::sessions::{ConnectionRegistry, EventRateLimiter};

/// Application state shared across all handlers. Constructed once at boot
/// and passed around as an `Arc`; nothing in here is a module-level global.
pub struct AppState {
    pub settings: Settings,
    pub rooms: Arc<RoomRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<EventRateLimiter>,
    pub admin: Arc<AdminAuthority>,
    pub csrf: Arc<CsrfTokens>,
    pub memory: Arc<MemoryStore>,
    pub logbook: Arc<Logbook>,
    pub media: Arc<dyn MediaLibrary>,
    pub jobs: Arc<JobQueue>,
    /// In single-room (legacy) mode, the implicit room every client joins.
    pub default_room_code: Option<String>,
}

impl AppState {
    /// Create the application state: load the memory file, restore the
    /// admin fingerprint, and (in legacy mode) create the implicit room.
    pub async fn new(
        settings: Settings,
        media: Arc<dyn MediaLibrary>,
        job_runner: Arc<dyn JobRunner>,
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(&settings.data_dir)?;

        let memory = Arc::new(MemoryStore::load(&settings.data_dir)?);
        let persisted_admin = memory.admin_fingerprint().await;
        let admin = Arc::new(AdminAuthority::new(
            settings.admin_fingerprint_lock,
            persisted_admin.clone(),
        ));
        let rooms = Arc::new(RoomRegistry::new(&settings.data_dir));
        let logbook = Arc::new(Logbook::new(&settings.data_dir)?);
        let jobs = JobQueue::new(&settings.ffmpeg_tools_password, job_runner);

        let default_room_code = if settings.server_mode {
            None
        } else {
            let (code, _) = rooms
                .create_room(
                    "Main".to_string(),
                    false,
                    persisted_admin.unwrap_or_default(),
                )
                .await?;
            Some(code)
        };

        Ok(Self {
            settings,
            rooms,
            connections: Arc::new(ConnectionRegistry::new()),
            rate_limiter: Arc::new(EventRateLimiter::new()),
            admin,
            csrf: Arc::new(CsrfTokens::new()),
            memory,
            logbook,
            media,
            jobs,
            default_room_code,
        })
    }

    pub fn legacy_mode(&self) -> bool {
        self.default_room_code.is_some()
    }
}
