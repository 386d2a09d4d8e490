use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered phases of an install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationPhase {
    NotStarted,
    CheckingRequirements,
    DownloadingAnomaly,
    ExtractingAnomaly,
    DownloadingModManager,
    DownloadingDefinitions,
    DownloadingMods,
    ExtractingMods,
    PatchingAnomaly,
    ConfiguringModManager,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl InstallationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Default for InstallationPhase {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Progress snapshot handed to the state observer. One instance per run,
/// owned by the orchestrator and mutated only on its coordination task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationState {
    pub phase: InstallationPhase,
    /// Progress within the current phase, 0.0 to 1.0.
    pub phase_progress: f64,
    /// Overall progress, 0.0 to 1.0, monotone non-decreasing.
    pub overall_progress: f64,

    pub current_operation: String,
    pub current_file: Option<String>,
    pub current_file_size: Option<u64>,
    pub current_file_progress: f64,

    pub total_mods: usize,
    pub downloaded_mods: usize,
    pub installed_mods: usize,
    pub failed_mods: Vec<String>,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl InstallationState {
    /// Seconds since the run started, up to `end_time` once set.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Linear extrapolation from elapsed time and overall progress.
    pub fn estimated_remaining_seconds(&self) -> Option<f64> {
        let elapsed = self.elapsed_seconds()?;
        if elapsed <= 0.0 || self.overall_progress <= 0.0 {
            return None;
        }
        Some(elapsed * (1.0 - self.overall_progress) / self.overall_progress)
    }

    /// Raises overall progress; already-passed values are kept so the
    /// observer never sees it move backwards.
    pub fn advance_overall_progress(&mut self, progress: f64) {
        self.overall_progress = self.overall_progress.max(progress.clamp(0.0, 1.0));
    }

    pub fn format_duration(seconds: Option<f64>) -> String {
        let Some(seconds) = seconds else {
            return "unknown".to_string();
        };
        let total = seconds.max(0.0) as u64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let secs = total % 60;
        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_phases() {
        assert!(InstallationPhase::Completed.is_terminal());
        assert!(InstallationPhase::Failed.is_terminal());
        assert!(InstallationPhase::Cancelled.is_terminal());
        assert!(!InstallationPhase::DownloadingMods.is_terminal());
        assert!(!InstallationPhase::NotStarted.is_terminal());
    }

    #[test]
    fn overall_progress_never_regresses() {
        let mut state = InstallationState::default();
        state.advance_overall_progress(0.4);
        state.advance_overall_progress(0.2);
        assert_eq!(state.overall_progress, 0.4);
        state.advance_overall_progress(1.5);
        assert_eq!(state.overall_progress, 1.0);
    }

    #[test]
    fn remaining_time_extrapolates_linearly() {
        let mut state = InstallationState::default();
        assert!(state.estimated_remaining_seconds().is_none());

        let now = Utc::now();
        state.start_time = Some(now - Duration::seconds(100));
        state.end_time = Some(now);
        state.overall_progress = 0.25;

        let remaining = state.estimated_remaining_seconds().unwrap();
        assert!((remaining - 300.0).abs() < 1.0);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(InstallationState::format_duration(None), "unknown");
        assert_eq!(InstallationState::format_duration(Some(42.0)), "42s");
        assert_eq!(InstallationState::format_duration(Some(330.0)), "5m 30s");
        assert_eq!(InstallationState::format_duration(Some(3725.0)), "1h 2m 5s");
    }
}
