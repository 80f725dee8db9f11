//! Rendezvous channel for the offer/answer exchange
//!
//! Messages are newline-delimited JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"bye"}
//! ```
//!
//! A bare line equal to the configured exit token (default `exit`) is read
//! as `bye`, and `bye` is written as that token.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use super::{SdpType, SessionDescription};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

/// Longest accepted line; SDP blobs are a few kilobytes
const MAX_LINE_LENGTH: usize = 256 * 1024;

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    /// Session end
    Bye,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Bye => "bye",
        }
    }

    /// The carried description, if any
    pub fn into_description(self) -> Option<SessionDescription> {
        match self {
            SignalingMessage::Offer { sdp } => Some(SessionDescription::offer(sdp)),
            SignalingMessage::Answer { sdp } => Some(SessionDescription::answer(sdp)),
            SignalingMessage::Bye => None,
        }
    }
}

impl From<SessionDescription> for SignalingMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpType::Offer => SignalingMessage::Offer { sdp: desc.sdp },
            SdpType::Answer => SignalingMessage::Answer { sdp: desc.sdp },
        }
    }
}

/// Encode one message as a line (without the terminator)
pub fn encode_line(msg: &SignalingMessage, exit_token: &str) -> Result<String> {
    match msg {
        SignalingMessage::Bye => Ok(exit_token.to_string()),
        other => Ok(serde_json::to_string(other)?),
    }
}

/// Decode one received line
pub fn decode_line(line: &str, exit_token: &str) -> Result<SignalingMessage> {
    let line = line.trim();
    if line == exit_token {
        return Ok(SignalingMessage::Bye);
    }
    serde_json::from_str(line).map_err(|e| AppError::InvalidMessage(e.to_string()))
}

/// Ordered, reliable message channel between the two endpoints
#[async_trait]
pub trait Signaling: Send {
    /// Establish the channel (listen and accept, or connect)
    async fn connect(&mut self) -> Result<()>;

    async fn send(&mut self, msg: &SignalingMessage) -> Result<()>;

    /// Next message, or `None` once the remote end has closed
    ///
    /// An unparseable line yields [`AppError::InvalidMessage`] and is
    /// consumed; the channel stays usable.
    async fn receive(&mut self) -> Result<Option<SignalingMessage>>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingMode {
    /// Bind and accept one peer
    Listen,
    /// Connect with retries
    Connect,
}

/// Newline-delimited JSON over a single TCP connection
pub struct TcpSignaling {
    mode: SignalingMode,
    address: String,
    exit_token: String,
    connect_attempts: u32,
    retry_interval: Duration,
    listener: Option<TcpListener>,
    framed: Option<Framed<TcpStream, LinesCodec>>,
}

impl TcpSignaling {
    fn with_mode(mode: SignalingMode, config: &SignalingConfig) -> Self {
        Self {
            mode,
            address: config.address(),
            exit_token: config.exit_token.clone(),
            connect_attempts: config.connect_attempts.max(1),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            listener: None,
            framed: None,
        }
    }

    /// Listening side (producer)
    pub fn listen(config: &SignalingConfig) -> Self {
        Self::with_mode(SignalingMode::Listen, config)
    }

    /// Connecting side (consumer)
    pub fn connect_to(config: &SignalingConfig) -> Self {
        Self::with_mode(SignalingMode::Connect, config)
    }

    pub fn mode(&self) -> SignalingMode {
        self.mode
    }

    /// Bind the listener ahead of `connect`, returning the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            AppError::Signaling(format!("bind {} failed: {}", self.address, e))
        })?;
        let addr = listener.local_addr()?;
        info!("Signaling listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    async fn accept(&mut self) -> Result<TcpStream> {
        self.bind().await?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| AppError::Signaling("listener not bound".into()))?;
        let (stream, peer) = listener.accept().await?;
        info!("Signaling peer connected from {}", peer);
        Ok(stream)
    }

    async fn dial(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for attempt in 1..=self.connect_attempts {
            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    info!("Signaling connected to {} (attempt {})", self.address, attempt);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(
                        "Signaling connect to {} failed (attempt {}/{}): {}",
                        self.address, attempt, self.connect_attempts, e
                    );
                    last_err = Some(e);
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(AppError::Signaling(format!(
            "could not connect to {} after {} attempts: {}",
            self.address,
            self.connect_attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn framed(&mut self) -> Result<&mut Framed<TcpStream, LinesCodec>> {
        self.framed
            .as_mut()
            .ok_or_else(|| AppError::Signaling("signaling channel not connected".into()))
    }
}

#[async_trait]
impl Signaling for TcpSignaling {
    async fn connect(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        let stream = match self.mode {
            SignalingMode::Listen => self.accept().await?,
            SignalingMode::Connect => self.dial().await?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on signaling socket: {}", e);
        }
        self.framed = Some(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ));
        Ok(())
    }

    async fn send(&mut self, msg: &SignalingMessage) -> Result<()> {
        let line = encode_line(msg, &self.exit_token)?;
        debug!("Signaling send: {}", msg.kind());
        self.framed()?
            .send(line)
            .await
            .map_err(|e| AppError::Signaling(format!("send failed: {}", e)))
    }

    async fn receive(&mut self) -> Result<Option<SignalingMessage>> {
        let exit_token = self.exit_token.clone();
        let framed = self.framed()?;
        loop {
            match framed.next().await {
                None => {
                    debug!("Signaling channel closed by peer");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(AppError::Signaling(format!("receive failed: {}", e)));
                }
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    let msg = decode_line(&line, &exit_token)?;
                    debug!("Signaling receive: {}", msg.kind());
                    return Ok(Some(msg));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.listener = None;
        if let Some(mut framed) = self.framed.take() {
            SinkExt::<String>::close(&mut framed)
                .await
                .map_err(|e| AppError::Signaling(format!("close failed: {}", e)))?;
        }
        Ok(())
    }
}
