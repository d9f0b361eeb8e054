/// Result Aggregator - Final Grading Report
///
/// Reads every persisted job result back from its slot and writes them,
/// ordered by (phase, code, tests), into `report.json`. Slot contents are
/// the source of truth; the in-memory run summary is not consulted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use xval_common::store::{list_results, write_atomic, REPORT_FILE};
use xval_common::types::{JobResult, Phase};

/// Per-phase counts for logs and the report header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub jobs: usize,
    pub ok: usize,
    /// Error jobs by result kind
    pub errors: BTreeMap<String, usize>,
    pub tests_passed: usize,
    pub tests_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub summary: BTreeMap<Phase, PhaseSummary>,
    pub jobs: Vec<JobResult>,
}

impl Report {
    pub fn from_results(mut jobs: Vec<JobResult>) -> Self {
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut summary: BTreeMap<Phase, PhaseSummary> = BTreeMap::new();
        for job in &jobs {
            let entry = summary.entry(job.phase).or_default();
            entry.jobs += 1;
            match job.kind() {
                None => entry.ok += 1,
                Some(kind) => *entry.errors.entry(kind.to_string()).or_default() += 1,
            }
            let (passed, failed) = job.tally();
            entry.tests_passed += passed;
            entry.tests_failed += failed;
        }

        Self {
            generated_at: Utc::now(),
            summary,
            jobs,
        }
    }

    pub fn log_summary(&self) {
        for (phase, s) in &self.summary {
            info!(
                phase = %phase,
                jobs = s.jobs,
                ok = s.ok,
                errors = ?s.errors,
                tests_passed = s.tests_passed,
                tests_failed = s.tests_failed,
                "Phase summary"
            );
        }
    }
}

/// Collect all slots under `results_dir` and write `report.json` beside them
pub fn write_report(results_dir: &Path) -> Result<(Report, PathBuf)> {
    let results = list_results(results_dir)
        .with_context(|| format!("Failed to read results from {}", results_dir.display()))?;
    let report = Report::from_results(results);

    let path = results_dir.join(REPORT_FILE);
    let payload = serde_json::to_vec_pretty(&report).context("Failed to serialize report")?;
    write_atomic(&path, &payload)?;
    Ok((report, path))
}
