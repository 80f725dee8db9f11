use serde::{Deserialize, Serialize};

use crate::vision::color::HsvRange;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Rendezvous channel settings
    pub signaling: SignalingConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Synthetic video settings (producer side, also the frame extent the
    /// consumer falls back to)
    pub video: VideoConfig,
    /// Localization and feedback settings (consumer side)
    pub tracker: TrackerConfig,
}

/// Rendezvous (offer/answer exchange) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Host the producer listens on and the consumer connects to
    pub host: String,
    /// Fixed rendezvous port
    pub port: u16,
    /// Textual token that ends the producer's control loop
    pub exit_token: String,
    /// Connection attempts before the consumer gives up
    pub connect_attempts: u32,
    /// Delay between connection attempts in milliseconds
    pub retry_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            exit_token: "exit".to_string(),
            connect_attempts: 20,
            retry_interval_ms: 500,
        }
    }
}

impl SignalingConfig {
    /// `host:port` string for binding or connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// Label of the coordinate data channel
    pub channel_label: String,
    /// How long to wait for ICE gathering before sending a description (ms)
    pub gather_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough for local sessions
            stun_servers: vec![],
            channel_label: "coordinates".to_string(),
            gather_timeout_ms: 2000,
        }
    }
}

/// Synthetic source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Object size used for the bounce bound (`extent - size`)
    pub ball_size: u32,
    /// Radius of the rendered disc
    pub ball_radius: u32,
    /// Initial velocity in pixels per tick
    pub velocity: (i32, i32),
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            ball_size: 50,
            ball_radius: 50,
            velocity: (3, 3),
        }
    }
}

/// Consumer side tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// HSV range identifying the tracked colour
    pub hsv_range: HsvRange,
    /// Regions smaller than this many pixels are ignored
    pub min_region_area: u32,
    /// Capacity of the hand-off queue in front of the localization worker
    pub queue_capacity: usize,
    /// Coordinate report and channel monitor cadence in milliseconds
    pub report_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            hsv_range: HsvRange::RED,
            min_region_area: 1,
            queue_capacity: 8,
            report_interval_ms: 1000,
        }
    }
}
