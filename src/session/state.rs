//! Session lifecycle state machine
//!
//! ```text
//! New --begin_negotiation--> Offering (responder) / Answering (initiator)
//!   Offering|Answering --> Connected | Failed | Closed
//!   Connected          --> Disconnected | Failed | Closed
//!   Disconnected       --> Connected | Failed | Closed
//!   Failed             --> Closed
//!   Closed is terminal
//! ```

use std::fmt;

use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::transport::ConnectionState;

/// Which side of the exchange this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Opens the data channel and answers (consumer)
    Initiator,
    /// Attaches the video source and offers (producer)
    Responder,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Initiator => write!(f, "initiator"),
            SessionRole::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::New => "new",
            SessionPhase::Offering => "offering",
            SessionPhase::Answering => "answering",
            SessionPhase::Connected => "connected",
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Failed => "failed",
            SessionPhase::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// What the coordinator should do after a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// First time connected: start the feedback loop
    StartFeedback,
    /// Connection lost: cancel background work and close the session
    TearDown,
    /// Session closed
    Finished,
}

#[derive(Debug)]
pub struct SessionState {
    role: SessionRole,
    phase: SessionPhase,
    feedback_started: bool,
    teardown_requested: bool,
    closed_marked: bool,
}

impl SessionState {
    pub fn new(role: SessionRole) -> Self {
        Self {
            role,
            phase: SessionPhase::New,
            feedback_started: false,
            teardown_requested: false,
            closed_marked: false,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Enter the negotiation phase for this role; allowed once
    pub fn begin_negotiation(&mut self) -> Result<SessionPhase> {
        if self.phase != SessionPhase::New {
            return Err(AppError::Negotiation(format!(
                "cannot start negotiation in phase {}",
                self.phase
            )));
        }
        self.phase = match self.role {
            SessionRole::Initiator => SessionPhase::Answering,
            SessionRole::Responder => SessionPhase::Offering,
        };
        Ok(self.phase)
    }

    fn target(state: ConnectionState) -> Option<SessionPhase> {
        match state {
            ConnectionState::Connected => Some(SessionPhase::Connected),
            ConnectionState::Disconnected => Some(SessionPhase::Disconnected),
            ConnectionState::Failed => Some(SessionPhase::Failed),
            ConnectionState::Closed => Some(SessionPhase::Closed),
            ConnectionState::New | ConnectionState::Connecting => None,
        }
    }

    fn allowed(from: SessionPhase, to: SessionPhase) -> bool {
        use SessionPhase::*;
        match (from, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Offering | Answering, Connected | Failed) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected, Connected | Failed) => true,
            _ => false,
        }
    }

    /// Apply a connection state reported by the transport
    pub fn apply(&mut self, state: ConnectionState) -> Reaction {
        let Some(next) = Self::target(state) else {
            debug!("Connection {} while {}", state, self.phase);
            return Reaction::None;
        };
        if next == self.phase {
            return Reaction::None;
        }
        if !Self::allowed(self.phase, next) {
            warn!("Ignoring connection state {} in phase {}", state, self.phase);
            return Reaction::None;
        }

        self.phase = next;
        match next {
            SessionPhase::Connected if !self.feedback_started => {
                self.feedback_started = true;
                Reaction::StartFeedback
            }
            SessionPhase::Disconnected | SessionPhase::Failed if !self.teardown_requested => {
                self.teardown_requested = true;
                Reaction::TearDown
            }
            SessionPhase::Closed => Reaction::Finished,
            _ => Reaction::None,
        }
    }

    /// Move to `Closed` on local teardown; returns `true` only for the first call
    ///
    /// Later transport states (including its own `Closed`) are then no-ops.
    pub fn mark_closed(&mut self) -> bool {
        if self.closed_marked {
            return false;
        }
        self.closed_marked = true;
        self.teardown_requested = true;
        self.phase = SessionPhase::Closed;
        true
    }

    pub fn feedback_started(&self) -> bool {
        self.feedback_started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_phase_depends_on_role() {
        let mut initiator = SessionState::new(SessionRole::Initiator);
        assert_eq!(initiator.begin_negotiation().unwrap(), SessionPhase::Answering);

        let mut responder = SessionState::new(SessionRole::Responder);
        assert_eq!(responder.begin_negotiation().unwrap(), SessionPhase::Offering);
        assert!(matches!(
            responder.begin_negotiation(),
            Err(AppError::Negotiation(_))
        ));
    }

    #[test]
    fn test_happy_path() {
        let mut state = SessionState::new(SessionRole::Responder);
        state.begin_negotiation().unwrap();

        assert_eq!(state.apply(ConnectionState::Connecting), Reaction::None);
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::StartFeedback);
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::None);
        assert_eq!(state.apply(ConnectionState::Disconnected), Reaction::TearDown);
        assert_eq!(state.apply(ConnectionState::Failed), Reaction::None);
        assert_eq!(state.phase(), SessionPhase::Failed);
        assert_eq!(state.apply(ConnectionState::Closed), Reaction::Finished);
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::None);
        assert_eq!(state.phase(), SessionPhase::Closed);
    }

    #[test]
    fn test_connected_before_negotiation_is_ignored() {
        let mut state = SessionState::new(SessionRole::Initiator);
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::None);
        assert_eq!(state.phase(), SessionPhase::New);
    }

    #[test]
    fn test_failure_during_negotiation_tears_down() {
        let mut state = SessionState::new(SessionRole::Initiator);
        state.begin_negotiation().unwrap();
        assert_eq!(state.apply(ConnectionState::Failed), Reaction::TearDown);
        assert!(!state.feedback_started());
    }

    #[test]
    fn test_feedback_starts_once_across_reconnects() {
        let mut state = SessionState::new(SessionRole::Initiator);
        state.begin_negotiation().unwrap();
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::StartFeedback);
        assert_eq!(state.apply(ConnectionState::Disconnected), Reaction::TearDown);
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::None);
        assert_eq!(state.phase(), SessionPhase::Connected);
    }

    #[test]
    fn test_mark_closed_once() {
        let mut state = SessionState::new(SessionRole::Responder);
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert_eq!(state.phase(), SessionPhase::Closed);
    }

    #[test]
    fn test_mark_closed_from_connected() {
        let mut state = SessionState::new(SessionRole::Initiator);
        state.begin_negotiation().unwrap();
        assert_eq!(state.apply(ConnectionState::Connected), Reaction::StartFeedback);

        assert!(state.mark_closed());
        assert_eq!(state.phase(), SessionPhase::Closed);
        assert!(!state.mark_closed());
        assert_eq!(state.phase(), SessionPhase::Closed);

        // The transport's own close after teardown changes nothing
        assert_eq!(state.apply(ConnectionState::Closed), Reaction::None);
        assert_eq!(state.apply(ConnectionState::Disconnected), Reaction::None);
        assert_eq!(state.phase(), SessionPhase::Closed);
    }
}
