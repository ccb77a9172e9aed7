//! Lifecycle management for long-lived background services.
//!
//! Services implement [`ManagedService`] and are registered with a
//! [`ServiceManager`]. Staged initialization starts them in four priority
//! bands (critical, core, standard, background), checking declared
//! dependencies before each band and aborting when a critical service fails.
//! The manager also restarts services, aggregates their health with process
//! resource usage, and publishes lifecycle events to subscribers.
//!
//! ```no_run
//! use stagehand_manager::{ManagerConfig, ServiceManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(service: stagehand_manager::SharedService) -> stagehand_manager::Result<()> {
//! let manager = ServiceManager::new(ManagerConfig::default())?;
//! manager.register_service(service)?;
//!
//! let progress = manager.initialize(&CancellationToken::new()).await?;
//! assert!(progress.is_complete);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod events;
mod health;
mod lifecycle;
mod manager;
mod phases;
mod progress;
mod registry;
mod resources;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use events::{EventBus, ManagerEvent, PhaseCompletion, Subscription};
pub use health::{HealthAggregator, ServiceHealthEntry, ServiceHealthInfo};
pub use lifecycle::{
    BatchReport, LifecycleOrchestrator, PhaseResult, ServiceFailure, ServiceOutcome,
};
pub use manager::ServiceManager;
pub use phases::{InitializationPhase, PhaseBand, plan_phases};
pub use progress::InitializationProgress;
pub use registry::ServiceRegistry;
pub use resources::{ResourceSampler, ResourceUsage};

pub use stagehand_service::{
    HealthCheckResult, HealthStatus, ManagedService, ServiceError, ServiceId, ServiceStatus,
    SharedService,
};
