//! Priority-banded startup phases

use std::fmt;

use stagehand_service::{ServiceId, SharedService};

/// Priority band of a startup phase
///
/// Bands are ordered from highest to lowest priority. Each band includes its
/// lower bound, so a priority sitting exactly on a boundary belongs to the
/// higher-priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseBand {
    /// Priority 90 and above
    Critical,
    /// Priority 70 to 89
    Core,
    /// Priority 50 to 69
    Standard,
    /// Priority below 50
    Background,
}

impl PhaseBand {
    /// All bands in startup order
    pub const ALL: [Self; 4] = [Self::Critical, Self::Core, Self::Standard, Self::Background];

    /// Band containing `priority`
    #[must_use]
    pub const fn for_priority(priority: i32) -> Self {
        if priority >= 90 {
            Self::Critical
        } else if priority >= 70 {
            Self::Core
        } else if priority >= 50 {
            Self::Standard
        } else {
            Self::Background
        }
    }

    /// 1-based position in startup order
    #[must_use]
    pub const fn number(self) -> usize {
        match self {
            Self::Critical => 1,
            Self::Core => 2,
            Self::Standard => 3,
            Self::Background => 4,
        }
    }

    /// Phase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Critical => "Critical Services",
            Self::Core => "Core Services",
            Self::Standard => "Standard Services",
            Self::Background => "Background Services",
        }
    }

    /// Inclusive lower bound, `None` for the open-ended bottom band
    #[must_use]
    pub const fn min_priority(self) -> Option<i32> {
        match self {
            Self::Critical => Some(90),
            Self::Core => Some(70),
            Self::Standard => Some(50),
            Self::Background => None,
        }
    }

    /// Whether `priority` falls in this band
    #[must_use]
    pub fn contains(self, priority: i32) -> bool {
        Self::for_priority(priority) == self
    }
}

impl fmt::Display for PhaseBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Group of services started together during staged initialization
#[derive(Clone)]
pub struct InitializationPhase {
    /// Priority band of the phase
    pub band: PhaseBand,
    /// Services in the band, highest priority first
    pub services: Vec<SharedService>,
}

impl InitializationPhase {
    /// 1-based phase number
    #[must_use]
    pub const fn number(&self) -> usize {
        self.band.number()
    }

    /// Phase name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.band.name()
    }

    /// Ids of the services in the phase
    #[must_use]
    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(|s| s.id().clone()).collect()
    }

    /// Whether the phase has no services
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for InitializationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializationPhase")
            .field("band", &self.band)
            .field("services", &self.service_ids())
            .finish()
    }
}

/// Partition services into the four startup phases
///
/// Always returns one phase per band in startup order; bands without services
/// produce empty phases. Within a phase services are sorted by descending
/// priority, then by id, so the plan only depends on the set of services.
#[must_use]
pub fn plan_phases(services: &[SharedService]) -> Vec<InitializationPhase> {
    PhaseBand::ALL
        .into_iter()
        .map(|band| {
            let mut members: Vec<SharedService> = services
                .iter()
                .filter(|s| band.contains(s.priority()))
                .cloned()
                .collect();
            members.sort_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then_with(|| a.id().cmp(b.id()))
            });

            InitializationPhase {
                band,
                services: members,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_service_mock::MockService;

    fn services(priorities: &[(&str, i32)]) -> Vec<SharedService> {
        priorities
            .iter()
            .map(|(id, p)| MockService::new(*id, *p).shared() as SharedService)
            .collect()
    }

    #[test]
    fn test_boundaries_belong_to_higher_band() {
        assert_eq!(PhaseBand::for_priority(95), PhaseBand::Critical);
        assert_eq!(PhaseBand::for_priority(90), PhaseBand::Critical);
        assert_eq!(PhaseBand::for_priority(89), PhaseBand::Core);
        assert_eq!(PhaseBand::for_priority(70), PhaseBand::Core);
        assert_eq!(PhaseBand::for_priority(69), PhaseBand::Standard);
        assert_eq!(PhaseBand::for_priority(50), PhaseBand::Standard);
        assert_eq!(PhaseBand::for_priority(49), PhaseBand::Background);
        assert_eq!(PhaseBand::for_priority(i32::MIN), PhaseBand::Background);
    }

    #[test]
    fn test_every_service_lands_in_exactly_one_phase() {
        let all = services(&[
            ("a", 95),
            ("b", 80),
            ("c", 60),
            ("d", 40),
            ("e", 95),
            ("f", -5),
            ("g", 1000),
        ]);
        let phases = plan_phases(&all);

        assert_eq!(phases.len(), 4);
        for service in &all {
            let holders: Vec<_> = phases
                .iter()
                .filter(|p| p.service_ids().contains(service.id()))
                .collect();
            assert_eq!(holders.len(), 1);
            assert!(holders[0].band.contains(service.priority()));
        }
    }

    #[test]
    fn test_phases_are_ordered_and_named() {
        let phases = plan_phases(&services(&[
            ("a", 95),
            ("b", 80),
            ("c", 60),
            ("d", 40),
            ("e", 95),
        ]));

        let names: Vec<_> = phases.iter().map(InitializationPhase::name).collect();
        assert_eq!(
            names,
            vec![
                "Critical Services",
                "Core Services",
                "Standard Services",
                "Background Services"
            ]
        );
        let sizes: Vec<_> = phases.iter().map(|p| p.services.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1, 1]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let forward = services(&[("x", 75), ("a", 75), ("m", 88)]);
        let mut reversed = forward.clone();
        reversed.reverse();

        let ids = |plan: Vec<InitializationPhase>| -> Vec<Vec<ServiceId>> {
            plan.iter().map(InitializationPhase::service_ids).collect()
        };

        assert_eq!(ids(plan_phases(&forward)), ids(plan_phases(&reversed)));
        assert_eq!(
            plan_phases(&forward)[1].service_ids(),
            vec![ServiceId::from("m"), ServiceId::from("a"), ServiceId::from("x")]
        );
    }

    #[test]
    fn test_empty_registry_yields_empty_phases() {
        let phases = plan_phases(&[]);
        assert_eq!(phases.len(), 4);
        assert!(phases.iter().all(InitializationPhase::is_empty));
    }
}
