//! Start/stop orchestration for registered services
//!
//! Every call into a service is bounded by that service's own timeout and
//! guarded against errors and panics, so one misbehaving service only ever
//! affects its own status. The single exception is a critical service that
//! fails to start: that failure is returned as
//! [`Error::CriticalServiceFailure`] once the rest of the batch has settled.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use stagehand_service::{ServiceError, ServiceId, ServiceStatus, SharedService};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent, PhaseCompletion};
use crate::phases::InitializationPhase;
use crate::registry::ServiceRegistry;

/// Result of a single start or stop attempt that did not abort its caller
#[derive(Debug)]
pub enum ServiceOutcome {
    /// The service reached its target status
    Completed,
    /// Nothing to do for the service in its current status
    Skipped,
    /// The attempt failed; the service is now `Failed`
    Failed(Error),
}

/// A service that failed during a batch or phase
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    /// Failing service
    pub service: ServiceId,
    /// Display name
    pub name: String,
    /// Whether the service is critical
    pub critical: bool,
    /// What went wrong
    pub error: Error,
}

impl ServiceFailure {
    fn new(service: &SharedService, error: Error) -> Self {
        Self {
            service: service.id().clone(),
            name: service.name().to_string(),
            critical: service.is_critical(),
            error,
        }
    }
}

/// Outcome of a start-all or stop-all batch
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    /// Services that reached their target status
    pub completed: Vec<ServiceId>,
    /// Services that failed
    pub failures: Vec<ServiceFailure>,
}

impl BatchReport {
    /// Whether every service in the batch succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of one staged initialization phase
#[derive(Debug, Clone)]
pub struct PhaseResult {
    /// 1-based phase number
    pub phase_number: usize,
    /// Phase name
    pub phase_name: &'static str,
    /// Services running at the end of the phase
    pub started: Vec<ServiceId>,
    /// Services that failed, including unmet dependencies
    pub failures: Vec<ServiceFailure>,
    /// Wall time of the phase
    pub duration: Duration,
}

impl PhaseResult {
    /// Whether every service in the phase started
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether a critical service failed in this phase
    #[must_use]
    pub fn has_critical_failure(&self) -> bool {
        self.failures.iter().any(|f| f.critical)
    }

    /// Ids of the failed services
    #[must_use]
    pub fn failed_ids(&self) -> Vec<ServiceId> {
        self.failures.iter().map(|f| f.service.clone()).collect()
    }

    fn completion(&self) -> PhaseCompletion {
        PhaseCompletion {
            phase_number: self.phase_number,
            phase_name: self.phase_name.to_string(),
            success: self.is_success(),
            services_started: self.started.clone(),
            services_failed: self.failed_ids(),
            duration: self.duration,
        }
    }
}

/// Drives start and stop transitions of registered services
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    registry: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    restart_settle_delay: Duration,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator over `registry`, reporting to `events`
    pub const fn new(
        registry: Arc<ServiceRegistry>,
        events: Arc<EventBus>,
        restart_settle_delay: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            restart_settle_delay,
        }
    }

    /// Start one service, bounded by its startup timeout
    ///
    /// A non-critical failure is reported as [`ServiceOutcome::Failed`]. A
    /// critical failure is returned as [`Error::CriticalServiceFailure`].
    #[instrument(skip_all, fields(service = %service.id()))]
    pub async fn start_service(
        &self,
        service: &SharedService,
        cancel: &CancellationToken,
    ) -> Result<ServiceOutcome> {
        let id = service.id().clone();
        let timeout = service.startup_timeout();
        let started_at = Instant::now();

        self.registry.set_status(&id, ServiceStatus::Starting);
        debug!("Starting service {} with timeout {:?}", id, timeout);

        let token = cancel.child_token();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, guarded(&id, service.start(token.clone()))) => {
                result.unwrap_or_else(|_| {
                    token.cancel();
                    Err(Error::StartupTimeout { service: id.clone(), timeout })
                })
            }
        };

        match result {
            Ok(()) => {
                let elapsed = started_at.elapsed();
                self.registry.set_status(&id, ServiceStatus::Running);
                info!("Service {} started in {:?}", id, elapsed);
                self.events.emit(&ManagerEvent::ServiceStarted {
                    service: id,
                    name: service.name().to_string(),
                    elapsed,
                });
                Ok(ServiceOutcome::Completed)
            }
            Err(err) => {
                self.mark_failed(service, &err);

                if service.is_critical() {
                    error!("Critical service {} failed to start: {}", id, err);
                    Err(Error::CriticalServiceFailure {
                        service: id,
                        name: service.name().to_string(),
                        source: Box::new(err),
                    })
                } else {
                    warn!("Service {} failed to start: {}", id, err);
                    Ok(ServiceOutcome::Failed(err))
                }
            }
        }
    }

    /// Stop one running service, bounded by its shutdown timeout
    ///
    /// Never fails; stop failures leave the service `Failed`.
    #[instrument(skip_all, fields(service = %service.id()))]
    pub async fn stop_service(
        &self,
        service: &SharedService,
        cancel: &CancellationToken,
    ) -> ServiceOutcome {
        let id = service.id().clone();
        let status = self.registry.status(&id);
        if !status.is_running() {
            debug!("Not stopping service {} in status {}", id, status);
            return ServiceOutcome::Skipped;
        }

        let timeout = service.shutdown_timeout();
        self.registry.set_status(&id, ServiceStatus::Stopping);
        debug!("Stopping service {} with timeout {:?}", id, timeout);

        let token = cancel.child_token();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, guarded(&id, service.stop(token.clone()))) => {
                result.unwrap_or_else(|_| {
                    token.cancel();
                    Err(Error::ShutdownTimeout { service: id.clone(), timeout })
                })
            }
        };

        match result {
            Ok(()) => {
                self.registry.set_status(&id, ServiceStatus::Stopped);
                info!("Service {} stopped", id);
                self.events.emit(&ManagerEvent::ServiceStopped {
                    service: id,
                    name: service.name().to_string(),
                });
                ServiceOutcome::Completed
            }
            Err(err) => {
                warn!("Service {} failed to stop: {}", id, err);
                self.mark_failed(service, &err);
                ServiceOutcome::Failed(err)
            }
        }
    }

    /// Start every service that is not running, highest priority first, concurrently
    ///
    /// Dependencies are not checked. Services with a start or stop already in
    /// flight are left alone.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let mut pending: Vec<SharedService> = self
            .registry
            .services_with_status()
            .into_iter()
            .filter(|(_, status)| !status.is_running() && !status.is_transitioning())
            .map(|(service, _)| service)
            .collect();
        pending.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id().cmp(b.id()))
        });

        info!("Starting {} services", pending.len());

        let mut report = BatchReport::default();
        let mut critical = None;
        for (service, outcome) in self.start_concurrently(pending, cancel).await {
            collect_start(
                &service,
                outcome,
                &mut report.completed,
                &mut report.failures,
                &mut critical,
            );
        }

        match critical {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Stop every running service, lowest priority first, concurrently
    pub async fn stop_all(&self, cancel: &CancellationToken) -> BatchReport {
        let mut running: Vec<SharedService> = self
            .registry
            .services_with_status()
            .into_iter()
            .filter(|(_, status)| status.is_running())
            .map(|(service, _)| service)
            .collect();
        running.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.id().cmp(b.id()))
        });

        info!("Stopping {} services", running.len());

        let handles = running.into_iter().map(|service| {
            let this = self.clone();
            let cancel = cancel.clone();
            let task_service = service.clone();
            let handle =
                tokio::spawn(async move { this.stop_service(&task_service, &cancel).await });
            async move { (service, handle.await) }
        });

        let mut report = BatchReport::default();
        for (service, joined) in join_all(handles).await {
            let outcome = joined.unwrap_or_else(|err| {
                let err = self.task_lost(&service, &err);
                ServiceOutcome::Failed(err)
            });

            match outcome {
                ServiceOutcome::Completed => report.completed.push(service.id().clone()),
                ServiceOutcome::Skipped => {}
                ServiceOutcome::Failed(err) => {
                    report.failures.push(ServiceFailure::new(&service, err));
                }
            }
        }

        report
    }

    /// Start the services of one initialization phase
    ///
    /// Dependencies are checked once, before any service in the phase starts.
    /// A service with a dependency that is not running is failed with
    /// [`Error::UnmetDependency`] without being started. Emits
    /// [`ManagerEvent::PhaseCompleted`] once all services have settled.
    pub async fn execute_phase(
        &self,
        phase: &InitializationPhase,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult> {
        match self.run_phase(phase, cancel).await {
            (_, Some(err)) => Err(err),
            (result, None) => Ok(result),
        }
    }

    /// Like [`Self::execute_phase`], but keeps the phase result alongside a critical failure
    pub(crate) async fn run_phase(
        &self,
        phase: &InitializationPhase,
        cancel: &CancellationToken,
    ) -> (PhaseResult, Option<Error>) {
        let started_at = Instant::now();
        info!(
            "Executing phase {} ({}) with {} services",
            phase.number(),
            phase.name(),
            phase.services.len()
        );

        let mut started = Vec::new();
        let mut failures = Vec::new();
        let mut to_start = Vec::new();

        for service in &phase.services {
            if self.registry.status(service.id()).is_running() {
                started.push(service.id().clone());
                continue;
            }

            let missing = self.registry.unmet_dependencies(service.as_ref());
            if missing.is_empty() {
                to_start.push(service.clone());
            } else {
                let err = Error::UnmetDependency {
                    service: service.id().clone(),
                    missing,
                };
                warn!("{}", err);
                self.mark_failed(service, &err);
                failures.push(ServiceFailure::new(service, err));
            }
        }

        let mut critical = None;
        for (service, outcome) in self.start_concurrently(to_start, cancel).await {
            collect_start(&service, outcome, &mut started, &mut failures, &mut critical);
        }

        let result = PhaseResult {
            phase_number: phase.number(),
            phase_name: phase.name(),
            started,
            failures,
            duration: started_at.elapsed(),
        };

        info!(
            "Phase {} ({}) finished in {:?}: {} started, {} failed",
            result.phase_number,
            result.phase_name,
            result.duration,
            result.started.len(),
            result.failures.len()
        );
        self.events.emit(&ManagerEvent::PhaseCompleted(result.completion()));

        (result, critical)
    }

    /// Stop a running service, wait for it to settle, then start it again
    pub async fn restart_service(
        &self,
        id: &ServiceId,
        cancel: &CancellationToken,
    ) -> Result<ServiceOutcome> {
        let service = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;

        info!("Restarting service {}", id);

        if self.registry.status(id).is_running() {
            self.stop_service(&service, cancel).await;

            tokio::select! {
                () = tokio::time::sleep(self.restart_settle_delay) => {}
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        self.start_service(&service, cancel).await
    }

    async fn start_concurrently(
        &self,
        services: Vec<SharedService>,
        cancel: &CancellationToken,
    ) -> Vec<(SharedService, Result<ServiceOutcome>)> {
        let handles = services.into_iter().map(|service| {
            let this = self.clone();
            let cancel = cancel.clone();
            let task_service = service.clone();
            let handle =
                tokio::spawn(async move { this.start_service(&task_service, &cancel).await });
            async move { (service, handle.await) }
        });

        join_all(handles)
            .await
            .into_iter()
            .map(|(service, joined)| {
                let outcome = joined.unwrap_or_else(|err| {
                    let err = self.task_lost(&service, &err);
                    if service.is_critical() {
                        Err(Error::CriticalServiceFailure {
                            service: service.id().clone(),
                            name: service.name().to_string(),
                            source: Box::new(err),
                        })
                    } else {
                        Ok(ServiceOutcome::Failed(err))
                    }
                });
                (service, outcome)
            })
            .collect()
    }

    fn mark_failed(&self, service: &SharedService, err: &Error) {
        self.registry.set_status(service.id(), ServiceStatus::Failed);
        self.events.emit(&ManagerEvent::ServiceFailed {
            service: service.id().clone(),
            name: service.name().to_string(),
            error: err.to_string(),
            can_restart: !service.is_critical(),
        });
    }

    fn task_lost(&self, service: &SharedService, join_err: &JoinError) -> Error {
        let err = Error::ServiceFailed {
            service: service.id().clone(),
            message: format!("lifecycle task did not complete: {join_err}"),
        };
        error!("{}", err);
        self.mark_failed(service, &err);
        err
    }
}

/// Best-effort stop of a service that is no longer registered
pub(crate) async fn stop_detached(service: SharedService) {
    let id = service.id().clone();
    let timeout = service.shutdown_timeout();
    let token = CancellationToken::new();

    match tokio::time::timeout(timeout, guarded(&id, service.stop(token.clone()))).await {
        Ok(Ok(())) => info!("Stopped unregistered service {}", id),
        Ok(Err(err)) => warn!("Failed to stop unregistered service {}: {}", id, err),
        Err(_) => {
            token.cancel();
            warn!(
                "Unregistered service {} did not stop within {:?}",
                id, timeout
            );
        }
    }
}

fn collect_start(
    service: &SharedService,
    outcome: Result<ServiceOutcome>,
    started: &mut Vec<ServiceId>,
    failures: &mut Vec<ServiceFailure>,
    critical: &mut Option<Error>,
) {
    match outcome {
        Ok(ServiceOutcome::Completed | ServiceOutcome::Skipped) => {
            started.push(service.id().clone());
        }
        Ok(ServiceOutcome::Failed(err)) => failures.push(ServiceFailure::new(service, err)),
        Err(err) => {
            let cause = match &err {
                Error::CriticalServiceFailure { source, .. } => (**source).clone(),
                other => other.clone(),
            };
            failures.push(ServiceFailure::new(service, cause));
            critical.get_or_insert(err);
        }
    }
}

/// Run a service call, converting its error or panic into [`Error::ServiceFailed`]
pub(crate) async fn guarded<T>(
    id: &ServiceId,
    call: impl Future<Output = std::result::Result<T, ServiceError>>,
) -> Result<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::ServiceFailed {
            service: id.clone(),
            message: err.to_string(),
        }),
        Err(panic) => Err(Error::ServiceFailed {
            service: id.clone(),
            message: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use stagehand_service_mock::{Behavior, MockService};

    fn orchestrator(services: Vec<SharedService>) -> LifecycleOrchestrator {
        let registry = Arc::new(ServiceRegistry::new(16, true));
        for service in services {
            registry.register(service).unwrap();
        }
        LifecycleOrchestrator::new(registry, Arc::new(EventBus::new()), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_guarded_reports_panics() {
        let id = ServiceId::from("volatile");
        let call = futures::future::lazy(|_| -> std::result::Result<(), ServiceError> {
            panic!("bad state")
        });
        let result = guarded(&id, call).await;

        assert_matches!(result, Err(Error::ServiceFailed { message, .. }) => {
            assert_eq!(message, "panicked: bad state");
        });
    }

    #[tokio::test]
    async fn test_failed_start_emits_restartable_event() {
        let service: SharedService = MockService::new("cache", 70)
            .on_start(Behavior::Fail("no socket".into()))
            .shared();
        let orchestrator = orchestrator(vec![service.clone()]);
        let subscription = orchestrator.events.subscribe();

        let outcome = orchestrator
            .start_service(&service, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(outcome, ServiceOutcome::Failed(Error::ServiceFailed { .. }));
        assert_matches!(
            subscription.try_recv(),
            Some(ManagerEvent::ServiceFailed { can_restart: true, .. })
        );
        assert_eq!(
            orchestrator.registry.status(service.id()),
            ServiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_stop_skips_services_that_are_not_running() {
        let service: SharedService = MockService::new("cache", 70).shared();
        let orchestrator = orchestrator(vec![service.clone()]);

        let outcome = orchestrator
            .stop_service(&service, &CancellationToken::new())
            .await;

        assert_matches!(outcome, ServiceOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_cancelled_start_never_calls_service() {
        let mock = MockService::new("cache", 70).shared();
        let service: SharedService = mock.clone();
        let orchestrator = orchestrator(vec![service.clone()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.start_service(&service, &cancel).await.unwrap();

        assert_matches!(outcome, ServiceOutcome::Failed(Error::Cancelled));
        assert_eq!(mock.start_calls(), 0);
        assert_eq!(
            orchestrator.registry.status(service.id()),
            ServiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_critical_timeout_is_escalated() {
        let service: SharedService = MockService::new("vault", 95)
            .critical()
            .on_start(Behavior::Hang)
            .with_startup_timeout(Duration::from_millis(20))
            .shared();
        let orchestrator = orchestrator(vec![service.clone()]);

        let err = orchestrator
            .start_service(&service, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::CriticalServiceFailure { source, .. } => {
            assert_matches!(*source, Error::StartupTimeout { .. });
        });
    }
}
