//! Staged initialization progress

use std::time::SystemTime;

use serde::Serialize;

/// Progress of the most recent staged initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InitializationProgress {
    /// Number of phases in the run
    pub total_phases: usize,
    /// 1-based number of the phase being run, 0 before the first phase
    pub current_phase: usize,
    /// Name of the phase being run
    pub current_phase_name: String,
    /// Services that started successfully
    pub services_completed: usize,
    /// Services registered when the run began
    pub total_services: usize,
    /// Percentage of services started, 0 to 100
    pub overall_progress: f64,
    /// Failure descriptions collected during the run
    pub failure_reasons: Vec<String>,
    /// When the run began
    pub start_time: Option<SystemTime>,
    /// When the run finished
    pub completed_at: Option<SystemTime>,
    /// Whether the run has finished
    pub is_complete: bool,
    /// Whether the run was aborted by a critical failure or cancellation
    pub has_failed: bool,
}

impl InitializationProgress {
    pub(crate) fn begin(total_phases: usize, total_services: usize) -> Self {
        Self {
            total_phases,
            total_services,
            start_time: Some(SystemTime::now()),
            // nothing to start counts as fully started
            overall_progress: if total_services == 0 { 100.0 } else { 0.0 },
            ..Self::default()
        }
    }

    pub(crate) fn enter_phase(&mut self, number: usize, name: &str) {
        self.current_phase = number;
        self.current_phase_name = name.to_string();
    }

    pub(crate) fn record_started(&mut self, count: usize) {
        self.services_completed += count;
        if self.total_services > 0 {
            #[allow(clippy::cast_precision_loss)]
            let percent = self.services_completed as f64 * 100.0 / self.total_services as f64;
            self.overall_progress = percent.min(100.0);
        }
    }

    pub(crate) fn record_failure(&mut self, reason: String) {
        self.failure_reasons.push(reason);
    }

    pub(crate) fn finish(&mut self, failed: bool) {
        self.has_failed = failed;
        self.is_complete = true;
        self.completed_at = Some(SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let mut progress = InitializationProgress::begin(4, 4);
        progress.record_started(1);
        assert!((progress.overall_progress - 25.0).abs() < f64::EPSILON);

        progress.record_started(3);
        assert!((progress.overall_progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finish_marks_complete() {
        let mut progress = InitializationProgress::begin(4, 0);
        assert!((progress.overall_progress - 100.0).abs() < f64::EPSILON);

        progress.record_failure("backend: boom".to_string());
        progress.finish(true);

        assert!(progress.is_complete);
        assert!(progress.has_failed);
        assert!(progress.completed_at.is_some());
        assert_eq!(progress.failure_reasons, vec!["backend: boom".to_string()]);
    }
}
