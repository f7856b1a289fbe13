use std::fmt;
use std::time::{Duration, Instant};

/// Outcome of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    Failed,
    /// Not executed because an earlier stage failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StageExecution {
    pub stage: String,
    pub status: StageStatus,
    pub start: Option<Instant>,
    pub duration: Duration,
}

/// Summary of one call to [`crate::PipelineContext::run_pipeline`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Provenance run id, when provenance logging was enabled.
    pub run_id: Option<String>,
    pub stages: Vec<StageExecution>,
    pub duration: Duration,
}

impl RunReport {
    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| record.status)
    }

    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|record| record.status == StageStatus::Completed)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages
            .iter()
            .filter(|record| record.status == status)
            .count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .stages
            .iter()
            .map(|record| record.stage.len())
            .max()
            .unwrap_or(0);

        for record in &self.stages {
            let status = match record.status {
                StageStatus::Completed => "ok",
                StageStatus::Failed => "FAILED",
                StageStatus::Skipped => "skipped",
            };
            writeln!(
                f,
                "{:<width$}  {:>8}  {:>10.3}s",
                record.stage,
                status,
                record.duration.as_secs_f64(),
            )?;
        }

        write!(
            f,
            "{} completed, {} failed, {} skipped in {:.3}s",
            self.count(StageStatus::Completed),
            self.count(StageStatus::Failed),
            self.count(StageStatus::Skipped),
            self.duration.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: &str, status: StageStatus) -> StageExecution {
        StageExecution {
            stage: stage.to_string(),
            status,
            start: None,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_summary() {
        let report = RunReport {
            run_id: None,
            stages: vec![
                record("ps_setup", StageStatus::Completed),
                record("ps2map", StageStatus::Failed),
                record("plots", StageStatus::Skipped),
            ],
            duration: Duration::from_secs(3),
        };

        assert!(!report.succeeded());
        assert_eq!(report.status("plots"), Some(StageStatus::Skipped));
        assert_eq!(report.status("missing"), None);

        let text = report.to_string();
        assert!(text.contains("ps2map      FAILED"));
        assert!(text.ends_with("1 completed, 1 failed, 1 skipped in 3.000s"));
    }
}
