//! The service manager façade

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use parking_lot::RwLock;
use stagehand_service::{ServiceId, ServiceStatus, SharedService};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::health::{HealthAggregator, ServiceHealthInfo};
use crate::lifecycle::{self, BatchReport, LifecycleOrchestrator, PhaseResult, ServiceOutcome};
use crate::phases::{InitializationPhase, plan_phases};
use crate::progress::InitializationProgress;
use crate::registry::ServiceRegistry;

/// Registers background services and drives their lifecycle
///
/// Staged initialization starts services in four priority bands, highest
/// first. A critical service that fails aborts the remaining bands; any other
/// failure only affects the failing service.
pub struct ServiceManager {
    config: ManagerConfig,
    registry: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    orchestrator: LifecycleOrchestrator,
    health: HealthAggregator,
    progress: RwLock<InitializationProgress>,
    /// Serializes staged initialization runs
    init_gate: Mutex<()>,
    /// Held by batch start/stop and shutdown
    lifecycle_lock: Mutex<()>,
    shutdown_token: CancellationToken,
    disposed: AtomicBool,
}

impl ServiceManager {
    /// Create a manager with the given configuration
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ServiceRegistry::new(
            config.max_services,
            config.validate_dependencies,
        ));
        let events = Arc::new(EventBus::new());
        let orchestrator = LifecycleOrchestrator::new(
            registry.clone(),
            events.clone(),
            config.restart_settle_delay,
        );
        let health = HealthAggregator::new(
            registry.clone(),
            config.health_check_timeout,
            config.memory_pressure_threshold,
        );

        Ok(Self {
            config,
            registry,
            events,
            orchestrator,
            health,
            progress: RwLock::new(InitializationProgress::default()),
            init_gate: Mutex::new(()),
            lifecycle_lock: Mutex::new(()),
            shutdown_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Active configuration
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Register a service, replacing any service with the same id
    pub fn register_service(&self, service: SharedService) -> Result<()> {
        self.ensure_active()?;

        let id = service.id().clone();
        self.registry.register(service)?;
        info!("Registered service {}", id);

        Ok(())
    }

    /// Remove a service; returns whether one was registered under `id`
    ///
    /// A running service is stopped in the background, bounded by its
    /// shutdown timeout.
    pub fn unregister_service(&self, id: &ServiceId) -> bool {
        let Some((service, status)) = self.registry.unregister(id) else {
            return false;
        };

        info!("Unregistered service {}", id);

        if status.is_running() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(lifecycle::stop_detached(service));
                }
                Err(_) => warn!(
                    "Unregistered running service {} outside a runtime; it was not stopped",
                    id
                ),
            }
        }

        true
    }

    /// Start all registered services in priority bands, one band at a time
    ///
    /// Concurrent calls run one after another. Returns the final progress, or
    /// the critical failure (or cancellation) that aborted the run; in both
    /// cases [`Self::initialization_progress`] reflects the finished run.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<InitializationProgress> {
        self.ensure_active()?;
        let _gate = self.init_gate.lock().await;
        self.ensure_active()?;

        let phases = plan_phases(&self.registry.services());
        let total_services = phases.iter().map(|p| p.services.len()).sum();
        *self.progress.write() = InitializationProgress::begin(phases.len(), total_services);

        info!(
            "Initializing {} services in {} phases",
            total_services,
            phases.len()
        );

        // fires on caller cancellation or manager shutdown
        let run = self.shutdown_token.child_token();
        let work = self.run_phases(&phases, &run);
        tokio::pin!(work);
        let outcome = tokio::select! {
            outcome = &mut work => outcome,
            () = cancel.cancelled() => {
                run.cancel();
                work.await
            }
        };

        let mut progress = self.progress.write();
        progress.finish(outcome.is_err());
        match outcome {
            Ok(()) => {
                info!(
                    "Initialization complete: {}/{} services started",
                    progress.services_completed, progress.total_services
                );
                Ok(progress.clone())
            }
            Err(err) => {
                error!("Initialization failed: {}", err);
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        phases: &[InitializationPhase],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for phase in phases {
            if cancel.is_cancelled() {
                self.progress
                    .write()
                    .record_failure("Initialization was cancelled".to_string());
                return Err(Error::Cancelled);
            }

            self.progress
                .write()
                .enter_phase(phase.number(), phase.name());

            if phase.is_empty() {
                debug!("Phase {} ({}) has no services", phase.number(), phase.name());
                continue;
            }

            let (result, critical) = self.orchestrator.run_phase(phase, cancel).await;
            self.record_phase(&result);

            if cancel.is_cancelled() {
                self.progress
                    .write()
                    .record_failure("Initialization was cancelled".to_string());
                return Err(Error::Cancelled);
            }

            if let Some(err) = critical {
                return Err(err);
            }

            // unmet dependencies of critical services are not raised by the phase itself
            if let Some(failure) = result.failures.iter().find(|f| f.critical) {
                return Err(Error::CriticalServiceFailure {
                    service: failure.service.clone(),
                    name: failure.name.clone(),
                    source: Box::new(failure.error.clone()),
                });
            }
        }

        Ok(())
    }

    fn record_phase(&self, result: &PhaseResult) {
        let mut progress = self.progress.write();
        progress.record_started(result.started.len());
        for failure in &result.failures {
            progress.record_failure(format!(
                "{} ({}): {}",
                failure.name, failure.service, failure.error
            ));
        }
    }

    /// Start every service that is not running, without dependency checks
    pub async fn start_all_services(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        self.ensure_active()?;
        let _lifecycle = self.lifecycle_lock.lock().await;
        self.ensure_active()?;

        self.orchestrator.start_all(cancel).await
    }

    /// Stop every running service, lowest priority first
    pub async fn stop_all_services(&self, cancel: &CancellationToken) -> BatchReport {
        let _lifecycle = self.lifecycle_lock.lock().await;
        self.orchestrator.stop_all(cancel).await
    }

    /// Stop a service if running, wait the settle delay, and start it again
    pub async fn restart_service(
        &self,
        id: &ServiceId,
        cancel: &CancellationToken,
    ) -> Result<ServiceOutcome> {
        self.ensure_active()?;
        self.orchestrator.restart_service(id, cancel).await
    }

    /// Current status of a service, `NotStarted` if unknown
    pub fn service_status(&self, id: &ServiceId) -> ServiceStatus {
        self.registry.status(id)
    }

    /// Status of every registered service
    pub fn all_service_statuses(&self) -> HashMap<ServiceId, ServiceStatus> {
        self.registry.statuses()
    }

    /// Progress of the most recent staged initialization
    pub fn initialization_progress(&self) -> InitializationProgress {
        self.progress.read().clone()
    }

    /// Check the health of every registered service
    pub async fn service_health(&self, cancel: &CancellationToken) -> ServiceHealthInfo {
        self.health.check(cancel).await
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> Result<Subscription> {
        self.ensure_active()?;
        Ok(self.events.subscribe())
    }

    /// Whether [`Self::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop and dispose every service, then drop all subscribers
    ///
    /// Stopping is bounded by the configured dispose timeout. Only the first
    /// call does anything.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let _lifecycle = self.lifecycle_lock.lock().await;
        if self.disposed.swap(true, Ordering::AcqRel) {
            debug!("Service manager already shut down");
            return;
        }

        // let an in-flight initialization settle before tearing down
        let _gate = self.init_gate.lock().await;

        info!("Shutting down service manager");

        let cancel = CancellationToken::new();
        let limit = self.config.dispose_timeout;
        match tokio::time::timeout(limit, self.orchestrator.stop_all(&cancel)).await {
            Ok(report) => {
                for failure in &report.failures {
                    warn!(
                        "Service {} did not stop cleanly: {}",
                        failure.service, failure.error
                    );
                }
            }
            Err(_) => {
                cancel.cancel();
                warn!("Stopping services did not finish within {:?}", limit);
            }
        }

        for service in self.registry.clear() {
            dispose(service).await;
        }

        self.events.clear();
        info!("Service manager shut down");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }
}

async fn dispose(service: SharedService) {
    let id = service.id().clone();
    let limit = service.shutdown_timeout();

    match tokio::time::timeout(limit, AssertUnwindSafe(service.dispose()).catch_unwind()).await {
        Ok(Ok(())) => debug!("Disposed service {}", id),
        Ok(Err(_)) => warn!("Service {} panicked while disposing", id),
        Err(_) => warn!("Service {} did not dispose within {:?}", id, limit),
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            warn!("Service manager dropped without shutdown; services were not stopped");
            self.events.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use stagehand_service_mock::MockService;

    fn manager() -> ServiceManager {
        ServiceManager::new(ManagerConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ManagerConfig {
            max_services: 0,
            ..ManagerConfig::default()
        };
        assert_matches!(
            ServiceManager::new(config).err(),
            Some(Error::Configuration(_))
        );
    }

    #[test]
    fn test_unregister_unknown_service() {
        let manager = manager();
        assert!(!manager.unregister_service(&"ghost".into()));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_disposed() {
        let manager = manager();
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert_matches!(
            manager.register_service(MockService::new("a", 10).shared()),
            Err(Error::Disposed)
        );
        assert_matches!(
            manager.initialize(&CancellationToken::new()).await,
            Err(Error::Disposed)
        );
        assert_matches!(manager.subscribe(), Err(Error::Disposed));
    }

    #[tokio::test]
    async fn test_empty_initialize_completes() {
        let manager = manager();
        let progress = manager.initialize(&CancellationToken::new()).await.unwrap();

        assert!(progress.is_complete);
        assert!(!progress.has_failed);
        assert_eq!(progress.total_phases, 4);
        assert_eq!(progress.current_phase, 4);

        manager.shutdown().await;
    }
}
