//! Scriptable in-memory services for exercising a service manager.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_service::{
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STARTUP_TIMEOUT, HealthCheckResult, ManagedService,
    ServiceError, ServiceId,
};
use tokio_util::sync::CancellationToken;

/// How a mocked start or stop call behaves.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Complete immediately.
    Succeed,
    /// Complete after a delay, or fail early if cancelled.
    Delay(Duration),
    /// Fail with the given message.
    Fail(String),
    /// Never complete, ignoring cancellation.
    Hang,
}

/// How a mocked health check behaves.
#[derive(Debug, Clone)]
pub enum HealthBehavior {
    /// Return the given result.
    Report(HealthCheckResult),
    /// Return an error with the given message.
    Fail(String),
    /// Never complete.
    Hang,
}

/// A call observed by a mock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// `start` was invoked
    Start,
    /// `stop` was invoked
    Stop,
    /// `check_health` was invoked
    HealthCheck,
    /// `dispose` was invoked
    Dispose,
}

/// Ordered record of calls shared between several mocks.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(ServiceId, Call)>>>,
}

impl Journal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: &ServiceId, call: Call) {
        self.entries.lock().push((id.clone(), call));
    }

    /// All recorded calls in the order they were made.
    #[must_use]
    pub fn entries(&self) -> Vec<(ServiceId, Call)> {
        self.entries.lock().clone()
    }

    /// Services that received the given call, in call order.
    #[must_use]
    pub fn services_with(&self, call: Call) -> Vec<ServiceId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, c)| *c == call)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct Counters {
    start: AtomicUsize,
    stop: AtomicUsize,
    health: AtomicUsize,
    dispose: AtomicUsize,
}

/// Mock service with scripted behavior and call counters.
#[derive(Debug)]
pub struct MockService {
    id: ServiceId,
    name: String,
    priority: i32,
    critical: bool,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    dependencies: Vec<ServiceId>,
    start_behavior: Mutex<Behavior>,
    stop_behavior: Mutex<Behavior>,
    health_behavior: Mutex<HealthBehavior>,
    counters: Counters,
    journal: Option<Journal>,
}

impl MockService {
    /// Create a mock that starts, stops and reports healthy immediately.
    pub fn new(id: impl Into<ServiceId>, priority: i32) -> Self {
        let id = id.into();

        Self {
            name: id.to_string(),
            id,
            priority,
            critical: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dependencies: Vec::new(),
            start_behavior: Mutex::new(Behavior::Succeed),
            stop_behavior: Mutex::new(Behavior::Succeed),
            health_behavior: Mutex::new(HealthBehavior::Report(HealthCheckResult::healthy(
                "ok",
            ))),
            counters: Counters::default(),
            journal: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the service as critical.
    #[must_use]
    pub const fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<ServiceId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Set the startup timeout.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Script the `start` call.
    #[must_use]
    pub fn on_start(self, behavior: Behavior) -> Self {
        *self.start_behavior.lock() = behavior;
        self
    }

    /// Script the `stop` call.
    #[must_use]
    pub fn on_stop(self, behavior: Behavior) -> Self {
        *self.stop_behavior.lock() = behavior;
        self
    }

    /// Script the `check_health` call.
    #[must_use]
    pub fn on_health(self, behavior: HealthBehavior) -> Self {
        *self.health_behavior.lock() = behavior;
        self
    }

    /// Record calls into a shared journal.
    #[must_use]
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    /// Wrap in an `Arc`.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Change the health answer of a registered mock.
    pub fn set_health(&self, behavior: HealthBehavior) {
        *self.health_behavior.lock() = behavior;
    }

    /// Change the start behavior of a registered mock.
    pub fn set_start(&self, behavior: Behavior) {
        *self.start_behavior.lock() = behavior;
    }

    /// Number of `start` calls.
    pub fn start_calls(&self) -> usize {
        self.counters.start.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stop_calls(&self) -> usize {
        self.counters.stop.load(Ordering::SeqCst)
    }

    /// Number of `check_health` calls.
    pub fn health_calls(&self) -> usize {
        self.counters.health.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls.
    pub fn dispose_calls(&self) -> usize {
        self.counters.dispose.load(Ordering::SeqCst)
    }

    fn record(&self, counter: &AtomicUsize, call: Call) {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(&self.id, call);
        }
    }

    async fn run(behavior: Behavior, cancel: CancellationToken) -> Result<(), ServiceError> {
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Delay(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(()),
                    () = cancel.cancelled() => Err(Error::Cancelled.into()),
                }
            }
            Behavior::Fail(message) => Err(Error::Injected(message).into()),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ManagedService for MockService {
    fn id(&self) -> &ServiceId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    fn dependencies(&self) -> &[ServiceId] {
        &self.dependencies
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        self.record(&self.counters.start, Call::Start);
        let behavior = self.start_behavior.lock().clone();
        Self::run(behavior, cancel).await
    }

    async fn stop(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        self.record(&self.counters.stop, Call::Stop);
        let behavior = self.stop_behavior.lock().clone();
        Self::run(behavior, cancel).await
    }

    async fn check_health(
        &self,
        _cancel: CancellationToken,
    ) -> Result<HealthCheckResult, ServiceError> {
        self.record(&self.counters.health, Call::HealthCheck);
        let behavior = self.health_behavior.lock().clone();
        match behavior {
            HealthBehavior::Report(result) => Ok(result),
            HealthBehavior::Fail(message) => Err(Error::Injected(message).into()),
            HealthBehavior::Hang => std::future::pending().await,
        }
    }

    async fn dispose(&self) {
        self.record(&self.counters.dispose, Call::Dispose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use stagehand_service::HealthStatus;

    #[tokio::test]
    async fn test_counts_and_journals_calls() {
        let journal = Journal::new();
        let service = MockService::new("cache", 40).with_journal(&journal);

        service.start(CancellationToken::new()).await.unwrap();
        service.stop(CancellationToken::new()).await.unwrap();
        service.dispose().await;

        assert_eq!(service.start_calls(), 1);
        assert_eq!(service.stop_calls(), 1);
        assert_eq!(service.dispose_calls(), 1);
        assert_eq!(
            journal.entries(),
            vec![
                (ServiceId::from("cache"), Call::Start),
                (ServiceId::from("cache"), Call::Stop),
                (ServiceId::from("cache"), Call::Dispose),
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let service = MockService::new("probe", 80).on_start(Behavior::Fail("boom".to_string()));

        let err = service.start(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_delay_honors_cancellation() {
        let service =
            MockService::new("slow", 50).on_start(Behavior::Delay(Duration::from_secs(60)));
        let token = CancellationToken::new();
        token.cancel();

        let err = service.start(token).await.unwrap_err();
        assert_matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_health_can_change_after_creation() {
        let service = MockService::new("index", 60);
        service.set_health(HealthBehavior::Report(HealthCheckResult::degraded("lagging")));

        let result = service.check_health(CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(service.health_calls(), 1);
    }
}
