//! Connector lifecycle: pure phase transitions
//!
//! The transition function performs no I/O. It returns the new phase and
//! the effects the connector has to carry out.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle phase of one connector session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorPhase {
    #[default]
    New,
    Started,
    Running,
    Stopped,
    Failed,
}

impl ConnectorPhase {
    /// Phases in which user messages may be sent
    pub fn accepts_input(self) -> bool {
        matches!(self, Self::Started | Self::Running)
    }
}

impl fmt::Display for ConnectorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    StartSucceeded,
    StartFailed,
    Sent,
    SendFailed,
    StopRequested,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEffect {
    /// Issue the configured stop request (and stop hook)
    RunStopRequest,
    /// Cancel polling and leave the inbound hub
    ReleaseSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub phase: ConnectorPhase,
    pub effects: Vec<PhaseEffect>,
}

impl PhaseTransition {
    fn to(phase: ConnectorPhase) -> Self {
        Self {
            phase,
            effects: Vec::new(),
        }
    }

    fn with_effects(mut self, effects: impl IntoIterator<Item = PhaseEffect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    #[error("Connector not started")]
    NotStarted,
    #[error("Connector already started")]
    AlreadyStarted,
    #[error("Connector is {0}, no further operations allowed")]
    Finished(ConnectorPhase),
}

/// Pure transition function
pub fn transition(phase: ConnectorPhase, event: PhaseEvent) -> Result<PhaseTransition, PhaseError> {
    use ConnectorPhase as P;
    use PhaseEvent as E;

    match (phase, event) {
        (P::New, E::StartSucceeded) => Ok(PhaseTransition::to(P::Started)),
        (P::New, E::StartFailed) => Ok(PhaseTransition::to(P::Failed)),

        (P::Started | P::Running, E::Sent) => Ok(PhaseTransition::to(P::Running)),
        (P::Started | P::Running, E::SendFailed) => Ok(PhaseTransition::to(P::Failed)),

        // The stop request still goes out after a failure, to release
        // whatever the remote side allocated.
        (P::Started | P::Running | P::Failed, E::StopRequested) => Ok(PhaseTransition::to(P::Stopped)
            .with_effects([PhaseEffect::RunStopRequest, PhaseEffect::ReleaseSession])),
        (P::New, E::StopRequested) => {
            Ok(PhaseTransition::to(P::Stopped).with_effects([PhaseEffect::ReleaseSession]))
        }
        (P::Stopped, E::StopRequested) => Ok(PhaseTransition::to(P::Stopped)),

        (P::New, E::Sent | E::SendFailed) => Err(PhaseError::NotStarted),
        (P::Started | P::Running, E::StartSucceeded | E::StartFailed) => {
            Err(PhaseError::AlreadyStarted)
        }
        (P::Stopped | P::Failed, _) => Err(PhaseError::Finished(phase)),
    }
}
