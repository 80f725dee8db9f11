//! Session transport abstractions
//!
//! The session coordinators only see the traits in this module. The WebRTC
//! implementation lives in [`rtc`], the TCP rendezvous channel in
//! [`signaling`].
//!
//! ```text
//!  producer                                   consumer
//!  BallSource -> OutboundVideo ==RTP==> InboundVideo -> FramePipeline
//!  ErrorTracker <- DataChannel <=SCTP== DataChannel <- CoordinateReporter
//!        \_____________ Signaling (offer/answer/bye) ____________/
//! ```

pub mod rtc;
pub mod signaling;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::vision::FrameBuffer;

pub use signaling::{Signaling, SignalingMessage, TcpSignaling};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Data channel readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closing => write!(f, "closing"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob with its role in the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Events raised by a peer session
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A data channel opened by the remote peer
    DataChannel(Arc<dyn DataChannel>),
    /// A video track sent by the remote peer
    Track(Box<dyn InboundVideo>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged(s) => write!(f, "StateChanged({})", s),
            SessionEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            SessionEvent::Track(_) => write!(f, "Track"),
        }
    }
}

/// Events raised by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(String),
}

/// One end of a peer-to-peer media session
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a locally created description and finish candidate gathering
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// The local description including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Prepare to receive the data channel `label` opened by the remote peer
    ///
    /// Must be called before the offer is created. The channel is delivered
    /// as [`SessionEvent::DataChannel`].
    async fn expect_data_channel(&self, label: &str) -> Result<()>;

    /// Attach an outbound video track
    async fn add_video_track(&self) -> Result<Arc<dyn OutboundVideo>>;

    fn state(&self) -> ConnectionState;

    /// Take the event queue; only the first call returns it
    ///
    /// Events raised before the queue is taken are buffered.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;

    async fn close(&self) -> Result<()>;
}

/// A bidirectional text channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Send a text message; fails with a transport error unless open
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Take the event queue; only the first call returns it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<()>;
}

/// Receiving end of a video track
#[async_trait]
pub trait InboundVideo: Send {
    /// Next complete frame, or `None` once the track has ended
    async fn recv(&mut self) -> Result<Option<FrameBuffer>>;
}

/// Sending end of a video track
#[async_trait]
pub trait OutboundVideo: Send + Sync {
    async fn write_frame(&self, frame: &FrameBuffer) -> Result<()>;
}
