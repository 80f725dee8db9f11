use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or invalid session description during offer/answer exchange
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    /// A rendezvous line that is neither the exit token nor a known message
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Data channel send failures (non-fatal for periodic senders)
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Localization worker error: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether this error must abort the session
    ///
    /// Transport, codec and unparseable signaling lines are absorbed by the
    /// component that hit them; everything else propagates to the session
    /// coordinator.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AppError::Transport(_) | AppError::Codec(_) | AppError::InvalidMessage(_)
        )
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
