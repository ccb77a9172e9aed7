use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Health of a service, ordered from best to worst.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum HealthStatus {
    /// Fully operational
    #[default]
    Healthy,
    /// Operational with reduced capability
    Degraded,
    /// Not operational
    Unhealthy,
    /// Not operational and needs attention
    Critical,
}

impl HealthStatus {
    /// Combine two statuses, keeping the worse one.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether the status calls for operator attention.
    #[must_use]
    pub const fn needs_attention(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time result of a single service health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Reported status
    pub status: HealthStatus,
    /// Free-form description
    pub message: String,
    /// Error captured while checking, if any
    pub error: Option<String>,
    /// When the check finished
    pub checked_at: SystemTime,
    /// How long the check took, filled in by the caller
    pub duration: Option<Duration>,
}

impl HealthCheckResult {
    /// Create a result with the given status and message.
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: None,
            checked_at: SystemTime::now(),
            duration: None,
        }
    }

    /// Healthy result.
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    /// Degraded result.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    /// Unhealthy result.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    /// Critical result.
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Critical, message)
    }

    /// Critical result built from an error raised by the check itself.
    pub fn from_error(message: impl Into<String>, error: &dyn std::error::Error) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::critical(message)
        }
    }

    /// Attach the time the check took.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(HealthStatus::Critical > HealthStatus::Unhealthy);
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
    }

    #[test]
    fn test_worst_keeps_more_severe() {
        let overall = [
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Critical,
        ]
        .into_iter()
        .fold(HealthStatus::Healthy, HealthStatus::worst);

        assert_eq!(overall, HealthStatus::Critical);
        assert_eq!(
            HealthStatus::Degraded.worst(HealthStatus::Healthy),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_from_error_is_critical() {
        let err = std::io::Error::other("socket closed");
        let result = HealthCheckResult::from_error("probe failed", &err);

        assert_eq!(result.status, HealthStatus::Critical);
        assert_eq!(result.error.as_deref(), Some("socket closed"));
        assert!(result.status.needs_attention());
    }
}
