//! Configuration loading
//!
//! Configuration is read from an optional TOML file; every field has a
//! default so a partial (or missing) file is valid. CLI flags are applied
//! on top by the binary.

mod schema;

pub use schema::{AppConfig, SignalingConfig, TrackerConfig, VideoConfig, WebRtcConfig};

use std::path::Path;

use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::vision::codec;

impl AppConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml(&text)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => {
                debug!("No configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        let video = &self.video;
        if video.width == 0 || video.height == 0 {
            return Err(AppError::Config("video extent must be non-zero".into()));
        }
        if video.width > codec::MAX_EXTENT || video.height > codec::MAX_EXTENT {
            return Err(AppError::Config(format!(
                "video extent {}x{} exceeds {} pixels per side",
                video.width,
                video.height,
                codec::MAX_EXTENT
            )));
        }
        if video.ball_size >= video.width || video.ball_size >= video.height {
            return Err(AppError::Config(format!(
                "ball_size {} does not fit a {}x{} frame",
                video.ball_size, video.width, video.height
            )));
        }
        if video.fps == 0 {
            return Err(AppError::Config("fps must be at least 1".into()));
        }
        if self.tracker.queue_capacity == 0 {
            return Err(AppError::Config("queue_capacity must be at least 1".into()));
        }
        if self.tracker.report_interval_ms == 0 {
            return Err(AppError::Config(
                "report_interval_ms must be at least 1".into(),
            ));
        }
        if self.signaling.exit_token.trim().is_empty() {
            return Err(AppError::Config("exit_token must not be empty".into()));
        }
        Ok(())
    }
}
