//! Aggregated health of all registered services

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::join_all;
use serde::Serialize;
use stagehand_service::{HealthCheckResult, HealthStatus, ServiceId, ServiceStatus, SharedService};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::guarded;
use crate::registry::ServiceRegistry;
use crate::resources::{ResourceSampler, ResourceUsage};

/// Health of one service at the time of the sweep
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthEntry {
    /// Display name
    pub name: String,
    /// Lifecycle status when the check ran
    pub status: ServiceStatus,
    /// Result of the check
    pub health: HealthCheckResult,
}

/// Snapshot of the health of every registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthInfo {
    /// Worst status among all services, `Healthy` when there are none
    pub overall_status: HealthStatus,
    /// Per-service results
    pub services: BTreeMap<ServiceId, ServiceHealthEntry>,
    /// Process resource usage
    pub resources: ResourceUsage,
    /// Advisory actions for the operator
    pub recommendations: Vec<String>,
    /// When the sweep finished
    pub checked_at: SystemTime,
}

/// Runs health checks across the registry
pub struct HealthAggregator {
    registry: Arc<ServiceRegistry>,
    sampler: ResourceSampler,
    check_timeout: Option<Duration>,
    memory_pressure_threshold: u64,
}

impl HealthAggregator {
    /// Create an aggregator over `registry`
    pub fn new(
        registry: Arc<ServiceRegistry>,
        check_timeout: Option<Duration>,
        memory_pressure_threshold: u64,
    ) -> Self {
        Self {
            registry,
            sampler: ResourceSampler::new(),
            check_timeout,
            memory_pressure_threshold,
        }
    }

    /// Check every registered service concurrently
    ///
    /// Never fails: a check that errors, panics or times out is recorded as
    /// `Critical`.
    pub async fn check(&self, cancel: &CancellationToken) -> ServiceHealthInfo {
        let services = self.registry.services_with_status();
        debug!("Checking health of {} services", services.len());

        let handles = services.into_iter().map(|(service, status)| {
            let token = cancel.child_token();
            let check_timeout = self.check_timeout;
            let task_service = service.clone();
            let handle =
                tokio::spawn(async move { check_one(task_service, token, check_timeout).await });
            async move { (service, status, handle.await) }
        });

        let mut entries = BTreeMap::new();
        for (service, status, joined) in join_all(handles).await {
            let health = joined.unwrap_or_else(|err| {
                HealthCheckResult::from_error("Health check task did not complete", &err)
            });
            entries.insert(
                service.id().clone(),
                ServiceHealthEntry {
                    name: service.name().to_string(),
                    status,
                    health,
                },
            );
        }

        let overall_status = entries
            .values()
            .map(|entry| entry.health.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        let resources = self.sampler.sample();
        let recommendations =
            recommendations(&entries, &resources, self.memory_pressure_threshold);

        if overall_status.needs_attention() {
            warn!("Service health is {}", overall_status);
        }

        ServiceHealthInfo {
            overall_status,
            services: entries,
            resources,
            recommendations,
            checked_at: SystemTime::now(),
        }
    }
}

async fn check_one(
    service: SharedService,
    token: CancellationToken,
    check_timeout: Option<Duration>,
) -> HealthCheckResult {
    let id = service.id();
    let started_at = Instant::now();
    let check = guarded(id, service.check_health(token.clone()));

    let result = match check_timeout {
        Some(limit) => match tokio::time::timeout(limit, check).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                let elapsed = started_at.elapsed();
                return HealthCheckResult::critical(format!(
                    "Health check did not complete within {limit:?}"
                ))
                .with_duration(elapsed);
            }
        },
        None => check.await,
    };

    let elapsed = started_at.elapsed();
    match result {
        Ok(health) => health.with_duration(elapsed),
        Err(err) => {
            debug!("Health check of {} failed: {}", id, err);
            HealthCheckResult::from_error("Health check failed", &err).with_duration(elapsed)
        }
    }
}

fn recommendations(
    entries: &BTreeMap<ServiceId, ServiceHealthEntry>,
    resources: &ResourceUsage,
    memory_pressure_threshold: u64,
) -> Vec<String> {
    let mut recommendations: Vec<String> = entries
        .iter()
        .filter_map(|(id, entry)| match entry.health.status {
            HealthStatus::Critical => Some(format!(
                "Restart {} ({id}) and review its logs: {}",
                entry.name, entry.health.message
            )),
            HealthStatus::Unhealthy => Some(format!(
                "Check the dependencies of {} ({id}): {}",
                entry.name, entry.health.message
            )),
            HealthStatus::Healthy | HealthStatus::Degraded => None,
        })
        .collect();

    if resources.memory_bytes > memory_pressure_threshold {
        recommendations.push(format!(
            "Resident memory is {} MiB, above the {} MiB threshold; stop idle services",
            resources.memory_bytes / (1024 * 1024),
            memory_pressure_threshold / (1024 * 1024)
        ));
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_service_mock::{HealthBehavior, MockService};

    fn aggregator(services: Vec<MockService>, timeout: Option<Duration>) -> HealthAggregator {
        let registry = Arc::new(ServiceRegistry::new(16, true));
        for service in services {
            registry.register(service.shared()).unwrap();
        }
        HealthAggregator::new(registry, timeout, u64::MAX)
    }

    #[tokio::test]
    async fn test_no_services_is_healthy() {
        let info = aggregator(Vec::new(), None)
            .check(&CancellationToken::new())
            .await;

        assert_eq!(info.overall_status, HealthStatus::Healthy);
        assert!(info.services.is_empty());
        assert!(info.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let info = aggregator(
            vec![
                MockService::new("a", 10),
                MockService::new("b", 10)
                    .on_health(HealthBehavior::Report(HealthCheckResult::degraded("slow"))),
                MockService::new("c", 10)
                    .on_health(HealthBehavior::Report(HealthCheckResult::critical("down"))),
            ],
            None,
        )
        .check(&CancellationToken::new())
        .await;

        assert_eq!(info.overall_status, HealthStatus::Critical);
        assert_eq!(info.services.len(), 3);
        assert_eq!(info.recommendations.len(), 1);
        assert!(info.recommendations[0].contains("down"));
    }

    #[tokio::test]
    async fn test_failing_check_is_critical() {
        let info = aggregator(
            vec![MockService::new("a", 10).on_health(HealthBehavior::Fail("boom".into()))],
            None,
        )
        .check(&CancellationToken::new())
        .await;

        let entry = &info.services[&ServiceId::from("a")];
        assert_eq!(entry.health.status, HealthStatus::Critical);
        assert!(entry.health.error.as_deref().unwrap().contains("boom"));
        assert!(entry.health.duration.is_some());
    }

    #[tokio::test]
    async fn test_hanging_check_times_out() {
        let started_at = Instant::now();
        let info = aggregator(
            vec![MockService::new("a", 10).on_health(HealthBehavior::Hang)],
            Some(Duration::from_millis(50)),
        )
        .check(&CancellationToken::new())
        .await;

        assert!(started_at.elapsed() < Duration::from_secs(2));
        assert_eq!(
            info.services[&ServiceId::from("a")].health.status,
            HealthStatus::Critical
        );
    }

    #[test]
    fn test_memory_pressure_recommendation() {
        let resources = ResourceUsage {
            memory_bytes: 2 << 30,
            ..ResourceUsage::default()
        };

        let advice = recommendations(&BTreeMap::new(), &resources, 1 << 30);
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("2048 MiB"));
    }
}
