//! Finite state machine for instance lifecycle

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Deployed or stopped, no process expected
    NotStarted,

    /// Start commands in flight
    Starting,

    /// Process believed alive
    Running,

    /// Last start attempt failed
    StartFailed,

    /// Stop commands in flight
    Stopping,

    /// Last stop attempt failed
    StopFailed,

    /// Deleted; terminal
    Removed,
}

/// User-facing actions gated by the capability table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
    Delete,
    UpdateConfig,
    RefreshConfig,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Restart => "restart",
            InstanceAction::Delete => "delete",
            InstanceAction::UpdateConfig => "update config",
            InstanceAction::RefreshConfig => "refresh config",
        }
    }
}

/// Lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    /// Start commands are about to run
    StartRequested,

    /// Start plan succeeded
    StartSucceeded,

    /// Start plan failed
    StartFailed,

    /// Stop commands are about to run
    StopRequested,

    /// Stop plan succeeded
    StopSucceeded,

    /// Stop plan failed
    StopFailed,

    /// Liveness check found the recorded process gone
    ProcessDied,

    /// Remote directory removed, row about to be deleted
    Removed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::NotStarted => "NOT_STARTED",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::StartFailed => "START_FAILED",
            InstanceState::Stopping => "STOPPING",
            InstanceState::StopFailed => "STOP_FAILED",
            InstanceState::Removed => "REMOVED",
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            InstanceState::NotStarted | InstanceState::StartFailed | InstanceState::StopFailed
        )
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::StartFailed)
    }

    pub fn can_delete(&self) -> bool {
        matches!(
            self,
            InstanceState::NotStarted | InstanceState::StartFailed | InstanceState::StopFailed
        )
    }

    pub fn can_update_config(&self) -> bool {
        !self.is_transitional() && *self != InstanceState::Removed
    }

    pub fn can_refresh_config(&self) -> bool {
        self.can_update_config()
    }

    /// Restart stops what can be stopped and starts from a clean state.
    /// STOP_FAILED is excluded: the process may still be alive.
    pub fn can_restart(&self) -> bool {
        matches!(
            self,
            InstanceState::Running | InstanceState::StartFailed | InstanceState::NotStarted
        )
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Stopping)
    }

    pub fn allows(&self, action: InstanceAction) -> bool {
        match action {
            InstanceAction::Start => self.can_start(),
            InstanceAction::Stop => self.can_stop(),
            InstanceAction::Restart => self.can_restart(),
            InstanceAction::Delete => self.can_delete(),
            InstanceAction::UpdateConfig => self.can_update_config(),
            InstanceAction::RefreshConfig => self.can_refresh_config(),
        }
    }

    /// Fail fast with a typed error when the action is not permitted
    pub fn ensure(&self, action: InstanceAction) -> Result<(), OrchestratorError> {
        if self.allows(action) {
            Ok(())
        } else {
            Err(OrchestratorError::IllegalTransition {
                state: self.as_str().to_string(),
                action: action.as_str().to_string(),
            })
        }
    }

    /// Resolve the state an event leads to
    pub fn next(&self, event: InstanceEvent) -> Result<InstanceState, OrchestratorError> {
        let next = match (self, event) {
            (s, InstanceEvent::StartRequested) if s.can_start() => InstanceState::Starting,
            (InstanceState::Starting, InstanceEvent::StartSucceeded) => InstanceState::Running,
            (InstanceState::Starting, InstanceEvent::StartFailed) => InstanceState::StartFailed,

            (s, InstanceEvent::StopRequested) if s.can_stop() => InstanceState::Stopping,
            (InstanceState::Stopping, InstanceEvent::StopSucceeded) => InstanceState::NotStarted,
            (InstanceState::Stopping, InstanceEvent::StopFailed) => InstanceState::StopFailed,

            (InstanceState::Running, InstanceEvent::ProcessDied) => InstanceState::NotStarted,

            (s, InstanceEvent::Removed) if s.can_delete() => InstanceState::Removed,

            (state, event) => {
                return Err(OrchestratorError::IllegalTransition {
                    state: state.as_str().to_string(),
                    action: format!("{:?}", event),
                });
            }
        };
        Ok(next)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
