//! Error types for the service manager

use std::time::Duration;

use stagehand_service::ServiceId;
use thiserror::Error;

/// Result type alias for service manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing services
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The registry already holds the maximum number of services
    #[error("service registry is full ({capacity} services)")]
    CapacityExceeded {
        /// Configured maximum
        capacity: usize,
    },

    /// No service is registered under the given id
    #[error("service not found: {0}")]
    NotFound(ServiceId),

    /// Declared dependencies were not running when the service was due to start
    #[error("service {service} has unmet dependencies: {}", join_ids(.missing))]
    UnmetDependency {
        /// Service that could not start
        service: ServiceId,
        /// Dependencies that were not running
        missing: Vec<ServiceId>,
    },

    /// The service did not finish starting within its startup timeout
    #[error("service {service} did not start within {timeout:?}")]
    StartupTimeout {
        /// Service that timed out
        service: ServiceId,
        /// Declared startup timeout
        timeout: Duration,
    },

    /// The service did not finish stopping within its shutdown timeout
    #[error("service {service} did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Service that timed out
        service: ServiceId,
        /// Declared shutdown timeout
        timeout: Duration,
    },

    /// The service's own implementation reported an error or panicked
    #[error("service {service} failed: {message}")]
    ServiceFailed {
        /// Failing service
        service: ServiceId,
        /// Error reported by the service
        message: String,
    },

    /// A critical service failed to start
    #[error("critical service {name} ({service}) failed to start: {source}")]
    CriticalServiceFailure {
        /// Failing service
        service: ServiceId,
        /// Display name of the failing service
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Registering the service would close a dependency cycle
    #[error("registering {service} would create a dependency cycle: {}", join_path(.cycle))]
    DependencyCycle {
        /// Service being registered
        service: ServiceId,
        /// Cycle starting and ending at `service`
        cycle: Vec<ServiceId>,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The manager has been shut down
    #[error("service manager has been shut down")]
    Disposed,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Service the error is about, if any.
    #[must_use]
    pub fn service(&self) -> Option<&ServiceId> {
        match self {
            Self::NotFound(service)
            | Self::UnmetDependency { service, .. }
            | Self::StartupTimeout { service, .. }
            | Self::ShutdownTimeout { service, .. }
            | Self::ServiceFailed { service, .. }
            | Self::CriticalServiceFailure { service, .. }
            | Self::DependencyCycle { service, .. } => Some(service),
            Self::CapacityExceeded { .. }
            | Self::Cancelled
            | Self::Disposed
            | Self::Configuration(_) => None,
        }
    }

    /// Whether this failure aborts the enclosing batch or initialization.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalServiceFailure { .. })
    }
}

fn join_ids(ids: &[ServiceId]) -> String {
    ids.iter()
        .map(ServiceId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_path(ids: &[ServiceId]) -> String {
    ids.iter()
        .map(ServiceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
