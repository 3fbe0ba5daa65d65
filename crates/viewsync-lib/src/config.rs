// ============================
// viewsync-lib/src/config.rs
// ============================
//! Configuration management for the viewsync server.
//!
//! Settings come from three sources, later ones winning:
//! 1. Built-in defaults
//! 2. An INI-style `KEY=VALUE` file (`viewsync.conf`)
//! 3. Environment variables
//!
//! Out-of-range values are clamped to their documented range rather than
//! rejected, so a bad config file degrades instead of refusing to boot.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Behavior when a new viewer joins mid-playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// New joiner is synced to the current position.
    Sync,
    /// Joining broadcasts a reset to position 0 for everyone.
    Reset,
}

/// Aggregation mode for the per-item "BSL active" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BslMode {
    /// Active if at least one reporting viewer has a match.
    Any,
    /// Active only if every reporting viewer has a match.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleRenderer {
    Wsr,
    Jassub,
}

/// Server configuration. Field names match the documented `KEY=VALUE` keys
/// case-insensitively (`PORT` -> `port`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_volume_step")]
    pub volume_step: u32,
    #[serde(default = "default_skip_seconds")]
    pub skip_seconds: u32,
    #[serde(default = "default_join_mode")]
    pub join_mode: JoinMode,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub ssl_key_file: Option<PathBuf>,
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
    #[serde(default = "default_bsl_mode")]
    pub bsl_mode: BslMode,
    #[serde(default = "default_true")]
    pub bsl_advanced_match: bool,
    #[serde(default = "default_bsl_match_threshold")]
    pub bsl_match_threshold: u8,
    #[serde(default = "default_skip_intro_seconds")]
    pub skip_intro_seconds: u32,
    #[serde(default)]
    pub video_autoplay: bool,
    #[serde(default)]
    pub admin_fingerprint_lock: bool,
    #[serde(default)]
    pub client_controls_disabled: bool,
    #[serde(default)]
    pub client_sync_disabled: bool,
    #[serde(default = "default_true")]
    pub chat_enabled: bool,
    #[serde(default = "default_true")]
    pub data_hydration: bool,
    #[serde(default)]
    pub server_mode: bool,
    #[serde(default = "default_max_volume")]
    pub max_volume: u32,
    #[serde(default = "default_subtitle_renderer")]
    pub subtitle_renderer: SubtitleRenderer,
    /// Empty string disables the media tools endpoints entirely.
    #[serde(default)]
    pub ffmpeg_tools_password: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

impl Settings {
    /// Load configuration from `viewsync.conf` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("viewsync.conf")
    }

    /// Load configuration from a specified file path plus the environment.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Ini).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.normalize();
        Ok(settings)
    }

    /// Clamp every numeric key to its documented range and resolve
    /// cross-key constraints.
    pub fn normalize(&mut self) {
        self.port = self.port.clamp(1024, 49151);
        self.volume_step = self.volume_step.clamp(1, 20);
        self.skip_seconds = self.skip_seconds.clamp(5, 60);
        self.bsl_match_threshold = self.bsl_match_threshold.clamp(1, 4);
        self.skip_intro_seconds = self.skip_intro_seconds.max(1);
        self.max_volume = self.max_volume.clamp(100, 1000);

        // jassub needs SharedArrayBuffer, which browsers only grant over
        // HTTPS.
        if self.subtitle_renderer == SubtitleRenderer::Jassub && !self.use_https {
            tracing::warn!("SUBTITLE_RENDERER=jassub requires HTTPS; falling back to wsr");
            self.subtitle_renderer = SubtitleRenderer::Wsr;
        }
    }

    /// Whether the password-gated media tools endpoints are enabled.
    pub fn media_tools_enabled(&self) -> bool {
        !self.ffmpeg_tools_password.is_empty()
    }
}

fn default_port() -> u16 {
    3000
}

fn default_volume_step() -> u32 {
    5
}

fn default_skip_seconds() -> u32 {
    5
}

fn default_join_mode() -> JoinMode {
    JoinMode::Sync
}

fn default_bsl_mode() -> BslMode {
    BslMode::Any
}

fn default_bsl_match_threshold() -> u8 {
    // Threshold 4 additionally requires the MIME criterion, which many
    // browsers omit on folder selection; treat 4 as an operator footgun.
    1
}

fn default_skip_intro_seconds() -> u32 {
    87
}

fn default_max_volume() -> u32 {
    100
}

fn default_subtitle_renderer() -> SubtitleRenderer {
    SubtitleRenderer::Wsr
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            volume_step: default_volume_step(),
            skip_seconds: default_skip_seconds(),
            join_mode: default_join_mode(),
            use_https: false,
            ssl_key_file: None,
            ssl_cert_file: None,
            bsl_mode: default_bsl_mode(),
            bsl_advanced_match: true,
            bsl_match_threshold: default_bsl_match_threshold(),
            skip_intro_seconds: default_skip_intro_seconds(),
            video_autoplay: false,
            admin_fingerprint_lock: false,
            client_controls_disabled: false,
            client_sync_disabled: false,
            chat_enabled: true,
            data_hydration: true,
            server_mode: false,
            max_volume: default_max_volume(),
            subtitle_renderer: default_subtitle_renderer(),
            ffmpeg_tools_password: String::new(),
            data_dir: default_data_dir(),
            media_dir: default_media_dir(),
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Settings::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.skip_intro_seconds, 87);
        assert_eq!(config.join_mode, JoinMode::Sync);
        assert_eq!(config.bsl_mode, BslMode::Any);
        assert!(config.bsl_advanced_match);
        assert!(!config.media_tools_enabled());
    }

    #[test]
    fn test_file_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("viewsync.conf");

        let config_content = "\
PORT=8090
BSL_MODE=all
BSL_MATCH_THRESHOLD=3
CHAT_ENABLED=false
FFMPEG_TOOLS_PASSWORD=hunter2
";
        fs::write(&config_path, config_content).unwrap();

        let settings = Settings::load_from(config_path.to_str().unwrap()).unwrap();
        assert_eq!(settings.port, 8090);
        assert_eq!(settings.bsl_mode, BslMode::All);
        assert_eq!(settings.bsl_match_threshold, 3);
        assert!(!settings.chat_enabled);
        assert!(settings.media_tools_enabled());
        // untouched keys keep their defaults
        assert_eq!(settings.skip_seconds, 5);
    }

    #[test]
    fn test_out_of_range_values_clamp() {
        let mut settings = Settings {
            port: 80,
            volume_step: 50,
            skip_seconds: 2,
            bsl_match_threshold: 9,
            max_volume: 5000,
            skip_intro_seconds: 0,
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.port, 1024);
        assert_eq!(settings.volume_step, 20);
        assert_eq!(settings.skip_seconds, 5);
        assert_eq!(settings.bsl_match_threshold, 4);
        assert_eq!(settings.max_volume, 1000);
        assert_eq!(settings.skip_intro_seconds, 1);
    }

    #[test]
    fn test_jassub_requires_https() {
        let mut settings = Settings {
            subtitle_renderer: SubtitleRenderer::Jassub,
            use_https: false,
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.subtitle_renderer, SubtitleRenderer::Wsr);

        let mut settings = Settings {
            subtitle_renderer: SubtitleRenderer::Jassub,
            use_https: true,
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.subtitle_renderer, SubtitleRenderer::Jassub);
    }
}
