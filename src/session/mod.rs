//! Session coordination
//!
//! A session is one peer connection plus the background work hanging off
//! it. The producer ([`Producer`]) offers a synthetic video track and scores
//! the coordinates it gets back; the consumer ([`Consumer`]) answers,
//! localizes the ball in received frames and reports its estimate.
//!
//! Both sides share [`SessionCore`]: the lifecycle state machine, the task
//! set and an idempotent teardown.

pub mod consumer;
pub mod producer;
pub mod state;
pub mod tasks;

pub use consumer::{Consumer, ConsumerSummary};
pub use producer::{Producer, ProducerSummary};
pub use state::{Reaction, SessionPhase, SessionRole, SessionState};
pub use tasks::TaskSet;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::transport::{
    ConnectionState, PeerSession, SdpType, SessionDescription, Signaling, SignalingMessage,
};

/// Why a coordinator loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Local shutdown request
    Local,
    /// The remote end said bye or went away
    Remote,
    /// The peer connection closed
    Closed,
}

/// State shared by both coordinators
pub struct SessionCore {
    peer: Arc<dyn PeerSession>,
    state: Mutex<SessionState>,
    tasks: TaskSet,
}

impl SessionCore {
    pub fn new(peer: Arc<dyn PeerSession>, role: SessionRole) -> Self {
        Self {
            peer,
            state: Mutex::new(SessionState::new(role)),
            tasks: TaskSet::new(),
        }
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn role(&self) -> SessionRole {
        self.state.lock().role()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase()
    }

    pub fn begin_negotiation(&self) -> Result<SessionPhase> {
        let phase = self.state.lock().begin_negotiation()?;
        info!("{} negotiating ({})", self.role(), phase);
        Ok(phase)
    }

    /// Feed a connection state change through the state machine
    pub fn on_state(&self, state: ConnectionState) -> Reaction {
        let reaction = self.state.lock().apply(state);
        info!("Connection state: {}", state);
        if reaction != Reaction::None {
            debug!("Connection {} -> {:?}", state, reaction);
        }
        reaction
    }

    /// Cancel background tasks and close the peer connection
    ///
    /// Only the first call does anything; returns whether it was this one.
    pub async fn teardown(&self, reason: &str) -> bool {
        if !self.state.lock().mark_closed() {
            debug!("Teardown already done ({})", reason);
            return false;
        }
        info!("Tearing down session: {}", reason);
        self.tasks.cancel();
        if let Err(e) = self.peer.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        true
    }

    /// Teardown (if not done yet) and join every background task
    pub async fn finish(&self, reason: &str) {
        self.teardown(reason).await;
        self.tasks.shutdown().await;
    }
}

/// Wait for the next description of the given type on the rendezvous channel
pub(crate) async fn expect_description(
    signaling: &mut dyn Signaling,
    kind: SdpType,
) -> Result<SessionDescription> {
    let msg = signaling.receive().await?.ok_or_else(|| {
        AppError::Negotiation(format!(
            "signaling closed before {} arrived",
            sdp_name(kind)
        ))
    })?;
    let got = msg.kind();
    match msg.into_description() {
        Some(desc) if desc.kind == kind => Ok(desc),
        _ => Err(AppError::Negotiation(format!(
            "expected {}, got {}",
            sdp_name(kind),
            got
        ))),
    }
}

fn sdp_name(kind: SdpType) -> &'static str {
    match kind {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

/// Best-effort goodbye and close of the rendezvous channel
pub(crate) async fn close_signaling(signaling: &mut dyn Signaling, say_bye: bool) {
    if say_bye {
        if let Err(e) = signaling.send(&SignalingMessage::Bye).await {
            debug!("Could not send bye: {}", e);
        }
    }
    if let Err(e) = signaling.close().await {
        debug!("Signaling close failed: {}", e);
    }
}
