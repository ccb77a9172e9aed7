//! Registry of managed services and their last known status

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use stagehand_service::{ManagedService, ServiceId, ServiceStatus, SharedService};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::phases::PhaseBand;

/// Registered service together with its status
struct ServiceEntry {
    service: SharedService,
    status: ServiceStatus,
}

/// Bounded, concurrency-safe map of services and their statuses
///
/// Services and statuses live in one entry per id, so the set of registered
/// services and the set of tracked statuses can never disagree.
pub struct ServiceRegistry {
    capacity: usize,
    validate_dependencies: bool,
    entries: RwLock<HashMap<ServiceId, ServiceEntry>>,
}

impl ServiceRegistry {
    /// Create a registry holding at most `capacity` services
    pub fn new(capacity: usize, validate_dependencies: bool) -> Self {
        Self {
            capacity,
            validate_dependencies,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Add a service, or replace the one registered under the same id
    ///
    /// The status of the registered service is reset to `NotStarted`.
    pub fn register(&self, service: SharedService) -> Result<()> {
        let id = service.id().clone();
        let mut entries = self.entries.write();

        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        if self.validate_dependencies {
            if let Some(cycle) = find_cycle(&entries, service.as_ref()) {
                return Err(Error::DependencyCycle { service: id, cycle });
            }
        }

        warn_on_late_dependencies(&entries, service.as_ref());

        let previous = entries.insert(
            id.clone(),
            ServiceEntry {
                service,
                status: ServiceStatus::NotStarted,
            },
        );

        match previous {
            Some(entry) if entry.status.is_running() => {
                warn!("Replaced service {} while it was still running", id);
            }
            Some(_) => debug!("Replaced service {}", id),
            None => debug!("Registered service {}", id),
        }

        Ok(())
    }

    /// Remove a service, returning it with the status it had
    pub fn unregister(&self, id: &ServiceId) -> Option<(SharedService, ServiceStatus)> {
        self.entries
            .write()
            .remove(id)
            .map(|entry| (entry.service, entry.status))
    }

    /// Look up a service
    pub fn get(&self, id: &ServiceId) -> Option<SharedService> {
        self.entries.read().get(id).map(|entry| entry.service.clone())
    }

    /// Whether a service is registered under `id`
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Current status, `NotStarted` for unknown ids
    pub fn status(&self, id: &ServiceId) -> ServiceStatus {
        self.entries
            .read()
            .get(id)
            .map_or(ServiceStatus::NotStarted, |entry| entry.status)
    }

    /// Snapshot of every registered service's status
    pub fn statuses(&self) -> HashMap<ServiceId, ServiceStatus> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status))
            .collect()
    }

    /// Update the status of a registered service
    ///
    /// Returns `false` without inserting anything when the service is not registered.
    pub(crate) fn set_status(&self, id: &ServiceId, status: ServiceStatus) -> bool {
        match self.entries.write().get_mut(id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every registered service
    pub fn services(&self) -> Vec<SharedService> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.service.clone())
            .collect()
    }

    /// Snapshot of registered services with their statuses
    pub(crate) fn services_with_status(&self) -> Vec<(SharedService, ServiceStatus)> {
        self.entries
            .read()
            .values()
            .map(|entry| (entry.service.clone(), entry.status))
            .collect()
    }

    /// Dependencies of `service` that are not currently running
    pub(crate) fn unmet_dependencies(&self, service: &dyn ManagedService) -> Vec<ServiceId> {
        let entries = self.entries.read();
        service
            .dependencies()
            .iter()
            .filter(|dep| !entries.get(*dep).is_some_and(|e| e.status.is_running()))
            .cloned()
            .collect()
    }

    /// Remove every service
    pub(crate) fn clear(&self) -> Vec<SharedService> {
        self.entries
            .write()
            .drain()
            .map(|(_, entry)| entry.service)
            .collect()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no services are registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of services
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Find a dependency path from `candidate` back to itself
///
/// Edges come from the registered services, with `candidate`'s own edges
/// replacing those of any service it would overwrite.
fn find_cycle(
    entries: &HashMap<ServiceId, ServiceEntry>,
    candidate: &dyn ManagedService,
) -> Option<Vec<ServiceId>> {
    let root = candidate.id();
    let edges = |id: &ServiceId| -> Vec<ServiceId> {
        if id == root {
            candidate.dependencies().to_vec()
        } else {
            entries
                .get(id)
                .map(|entry| entry.service.dependencies().to_vec())
                .unwrap_or_default()
        }
    };

    let mut path = vec![root.clone()];
    let mut visited = HashSet::new();
    if visit(root, root, &edges, &mut path, &mut visited) {
        Some(path)
    } else {
        None
    }
}

fn visit(
    root: &ServiceId,
    current: &ServiceId,
    edges: &impl Fn(&ServiceId) -> Vec<ServiceId>,
    path: &mut Vec<ServiceId>,
    visited: &mut HashSet<ServiceId>,
) -> bool {
    for next in edges(current) {
        if &next == root {
            path.push(next);
            return true;
        }
        if !visited.insert(next.clone()) {
            continue;
        }

        path.push(next.clone());
        if visit(root, &next, edges, path, visited) {
            return true;
        }
        path.pop();
    }

    false
}

/// Warn about dependencies that staged initialization can never satisfy
fn warn_on_late_dependencies(
    entries: &HashMap<ServiceId, ServiceEntry>,
    service: &dyn ManagedService,
) {
    let band = PhaseBand::for_priority(service.priority());

    for dep in service.dependencies() {
        if let Some(entry) = entries.get(dep) {
            let dep_band = PhaseBand::for_priority(entry.service.priority());
            if dep_band.number() > band.number() {
                warn!(
                    "Service {} depends on {} which starts in a later phase ({} after {})",
                    service.id(),
                    dep,
                    dep_band.name(),
                    band.name()
                );
            }
        }
    }
}
