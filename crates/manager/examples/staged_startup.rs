use std::time::Duration;

use stagehand_manager::{HealthCheckResult, ManagerConfig, ManagerEvent, ServiceManager};
use stagehand_service_mock::{Behavior, HealthBehavior, MockService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional config file as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => ManagerConfig::from_file(path)?,
        None => ManagerConfig::default(),
    };

    let manager = ServiceManager::new(config)?;
    let subscription = manager.subscribe()?;

    let services = [
        MockService::new("backend", 95)
            .named("Backend Process")
            .critical()
            .on_start(Behavior::Delay(Duration::from_millis(300))),
        MockService::new("config", 95)
            .named("Configuration")
            .critical(),
        MockService::new("chat", 80)
            .named("Chat Session")
            .depends_on("backend")
            .on_start(Behavior::Delay(Duration::from_millis(150))),
        MockService::new("indexer", 60)
            .named("File Indexer")
            .depends_on("config")
            .on_health(HealthBehavior::Report(HealthCheckResult::degraded(
                "index is stale",
            ))),
        MockService::new("telemetry", 40)
            .named("Telemetry")
            .on_start(Behavior::Fail("collector unreachable".into())),
    ];
    for service in services {
        manager.register_service(service.shared())?;
    }

    let cancel = CancellationToken::new();
    let progress = manager.initialize(&cancel).await?;

    println!(
        "Initialized {}/{} services ({:.0}%)",
        progress.services_completed, progress.total_services, progress.overall_progress
    );
    for reason in &progress.failure_reasons {
        println!("  failure: {reason}");
    }

    for event in subscription.drain() {
        if let ManagerEvent::PhaseCompleted(phase) = event {
            println!(
                "Phase {} ({}) took {:?}: {} started, {} failed",
                phase.phase_number,
                phase.phase_name,
                phase.duration,
                phase.services_started.len(),
                phase.services_failed.len()
            );
        }
    }

    let health = manager.service_health(&cancel).await;
    println!("Overall health: {}", health.overall_status);
    for (id, entry) in &health.services {
        println!(
            "  {id}: {} ({}) {}",
            entry.health.status, entry.status, entry.health.message
        );
    }
    for recommendation in &health.recommendations {
        println!("  recommendation: {recommendation}");
    }
    println!(
        "Resident memory: {} KiB",
        health.resources.memory_bytes / 1024
    );

    manager.shutdown().await;
    println!("Shutdown complete");

    Ok(())
}
