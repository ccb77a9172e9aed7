//! Abstract interface for long-lived background services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod health;
mod id;
mod status;

pub use health::{HealthCheckResult, HealthStatus};
pub use id::ServiceId;
pub use status::ServiceStatus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Error type returned by service implementations.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Shared handle to a managed service.
pub type SharedService = Arc<dyn ManagedService>;

/// Startup timeout used when a service does not declare its own.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown timeout used when a service does not declare its own.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A long-lived service whose lifecycle is driven by a service manager.
///
/// The descriptor methods (`id`, `name`, `priority`, ...) must return the same
/// values for the whole time the service is registered.
#[async_trait]
pub trait ManagedService
where
    Self: Send + Sync + 'static,
{
    /// Stable identifier of the service.
    fn id(&self) -> &ServiceId;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Startup priority. Higher values start first and stop last.
    fn priority(&self) -> i32;

    /// Whether a startup failure of this service is fatal to staged initialization.
    fn is_critical(&self) -> bool {
        false
    }

    /// Upper bound on a single `start` call.
    fn startup_timeout(&self) -> Duration {
        DEFAULT_STARTUP_TIMEOUT
    }

    /// Upper bound on a single `stop` call.
    fn shutdown_timeout(&self) -> Duration {
        DEFAULT_SHUTDOWN_TIMEOUT
    }

    /// Services that must be running before this one may start.
    fn dependencies(&self) -> &[ServiceId] {
        &[]
    }

    /// Start the service.
    ///
    /// The token is cancelled if the caller gives up or the startup timeout elapses.
    async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError>;

    /// Stop the service.
    async fn stop(&self, cancel: CancellationToken) -> Result<(), ServiceError>;

    /// Run a self-diagnostic check.
    async fn check_health(&self, cancel: CancellationToken)
    -> Result<HealthCheckResult, ServiceError>;

    /// Release resources held by the service. Called once when the manager shuts down.
    async fn dispose(&self) {}
}
