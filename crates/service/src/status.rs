use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed service.
///
/// `NotStarted -> Starting -> Running -> Stopping -> Stopped`, with `Failed`
/// reachable from `Starting` and `Stopping`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Registered but never started
    #[default]
    NotStarted,
    /// Start in progress
    Starting,
    /// Started successfully and not yet stopped
    Running,
    /// Stop in progress
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Start or stop failed
    Failed,
}

impl ServiceStatus {
    /// Whether the service is running.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether a start or stop call is currently in flight.
    #[must_use]
    pub const fn is_transitioning(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
