//! Run reports.
//!
//! Every CLI command finishes by rendering a step table to stdout and, for
//! test runs, writing one JSON artifact under the report directory. The
//! artifact is written before the exit code is decided, so a failing run
//! still leaves its evidence on disk.

use crate::config::ReportConfig;
use crate::error::Result;
use crate::ha::HaReport;
use crate::types::{AvailabilityMeasurement, StepResult, StepStatus, TestRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tabled::{settings::Style as TableStyle, Table, Tabled};
use tracing::info;
use uuid::Uuid;

/// Aggregate counts for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The JSON artifact written for each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepResult>,
    pub summary: ReportSummary,
    /// Failure-injection extras, absent for other commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ha: Option<HaSection>,
}

/// Failure-injection fields of the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaSection {
    pub target: String,
    pub availability: f64,
    pub min_availability: f64,
    pub data_loss: bool,
    pub remediated: bool,
    pub measurements: Vec<AvailabilityMeasurement>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.summary.failed == 0 && !self.ha.as_ref().map(|h| h.data_loss).unwrap_or(false)
    }
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&StepResult> for StepRow {
    fn from(step: &StepResult) -> Self {
        let status = match step.status {
            StepStatus::Pass => "PASS",
            StepStatus::Fail => "FAIL",
            StepStatus::Skipped => "SKIP",
        };
        Self {
            step: step.name.clone(),
            status: status.to_string(),
            duration: format!("{}ms", step.duration_ms),
            detail: step.detail.clone(),
        }
    }
}

/// Builds, renders, and persists run reports.
pub struct ReportGenerator {
    config: ReportConfig,
}

impl ReportGenerator {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    /// Build a report from a finalized run.
    pub fn generate(&self, command: &str, run: &TestRun) -> Report {
        Report {
            run_id: run.id,
            command: command.to_string(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            steps: run.steps.clone(),
            summary: ReportSummary {
                total: run.steps.len(),
                passed: run.passed(),
                failed: run.failed(),
                skipped: run.skipped(),
            },
            ha: None,
        }
    }

    /// Build a report from a failure-injection run.
    pub fn generate_ha(&self, ha: &HaReport, min_availability: f64) -> Report {
        let mut report = self.generate("ha-test", &ha.run);
        report.ha = Some(HaSection {
            target: ha.target.address(),
            availability: ha.availability,
            min_availability,
            data_loss: ha.data_loss,
            remediated: ha.remediated,
            measurements: ha.measurements.clone(),
        });
        report
    }

    /// Write the JSON artifact and return its path.
    pub fn write(&self, report: &Report) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.dir)?;

        let short_id = report.run_id.simple().to_string();
        let filename = format!(
            "run-{}-{}.json",
            report.started_at.format("%Y%m%dT%H%M%SZ"),
            &short_id[..8]
        );
        let path = self.config.dir.join(filename);

        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)?;
        info!(path = %path.display(), "Report written");
        Ok(path)
    }

    /// Render the step table for the terminal.
    pub fn render_table(&self, report: &Report) -> String {
        let rows: Vec<StepRow> = report.steps.iter().map(StepRow::from).collect();
        let table = Table::new(&rows).with(TableStyle::rounded()).to_string();

        let mut out = format!(
            "Run {} ({})\n{}\n{} passed, {} failed, {} skipped",
            report.run_id,
            report.command,
            table,
            report.summary.passed,
            report.summary.failed,
            report.summary.skipped
        );
        if let Some(ha) = &report.ha {
            out.push_str(&format!(
                "\nAvailability: {:.0}% (required {:.0}%), data loss: {}, remediated: {}",
                ha.availability * 100.0,
                ha.min_availability * 100.0,
                ha.data_loss,
                ha.remediated
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_run() -> TestRun {
        let mut run = TestRun::new();
        run.record(StepResult::pass("step.one", "ok", Duration::from_millis(12)));
        run.record(StepResult::fail("step.two", "broken", Duration::from_millis(3)));
        run.record(StepResult::skipped("step.three", "not applicable"));
        run.finalize();
        run
    }

    #[test]
    fn test_summary_counts() {
        let generator = ReportGenerator::new(ReportConfig::default());
        let report = generator.generate("verify", &sample_run());
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert!(!report.passed());
    }

    #[test]
    fn test_render_table_contains_steps() {
        let generator = ReportGenerator::new(ReportConfig::default());
        let report = generator.generate("verify", &sample_run());
        let rendered = generator.render_table(&report);
        assert!(rendered.contains("step.one"));
        assert!(rendered.contains("FAIL"));
        assert!(rendered.contains("1 passed, 1 failed, 1 skipped"));
    }

    #[test]
    fn test_write_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(ReportConfig {
            dir: dir.path().to_path_buf(),
        });
        let report = generator.generate("verify", &sample_run());
        let path = generator.write(&report).unwrap();
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Report = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.run_id, report.run_id);
        assert_eq!(parsed.summary.total, 3);
    }
}
