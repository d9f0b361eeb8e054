// CLI commands for operating the xval grader
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use xval_common::config::{GraderConfig, Layout};
use xval_common::rewrite::strip_comments;
use xval_common::store::{list_results, write_atomic};
use xval_common::types::JobResult;

/// Layout rooted at `root`, mirroring the default `/autograder` tree
fn layout_under(root: &Path) -> Layout {
    let source = root.join("source");
    Layout {
        submission_dir: root.join("submission"),
        wheats_dir: source.join("impls/wheat"),
        chaffs_dir: source.join("impls/chaff"),
        tests_dir: source.join("tests"),
        stencil_dir: source.join("stencil"),
        results_dir: root.join("results"),
        work_dir: root.join("work"),
        cache_dir: source.join("cache"),
    }
}

pub async fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing grading layout at: {}", path);

    let project_path = Path::new(path);
    fs::create_dir_all(project_path)
        .with_context(|| format!("Failed to create directory: {}", path))?;
    let root = project_path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path))?;
    let layout = layout_under(&root);

    let dirs: [&PathBuf; 8] = [
        &layout.submission_dir,
        &layout.wheats_dir,
        &layout.chaffs_dir,
        &layout.tests_dir,
        &layout.stencil_dir,
        &layout.results_dir,
        &layout.work_dir,
        &layout.cache_dir,
    ];
    for dir in dirs {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        println!("  ✅ Created: {}", dir.strip_prefix(&root).unwrap_or(dir).display());
    }

    // Create default grader.json
    let config_path = root.join("config/grader.json");
    if config_path.exists() {
        println!("  ↷ Kept existing: config/grader.json");
    } else {
        let config = GraderConfig {
            layout,
            ..GraderConfig::default()
        };
        let json_content = serde_json::to_string_pretty(&config)?;
        write_atomic(&config_path, json_content.as_bytes())?;
        println!("  ✅ Created: config/grader.json");
    }

    println!("✅ Layout initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Put reference implementations in source/impls/wheat and source/impls/chaff");
    println!("  2. Put instructor suites in source/tests and starter files in source/stencil");
    println!("  3. Point XVAL_CONFIG at config/grader.json and run xval-worker");

    Ok(())
}

/// Strip comments from `file`, in place unless `output` is given
pub async fn strip_file(file: &Path, output: Option<&Path>) -> Result<()> {
    if !file.is_file() {
        bail!("Not a file: {}", file.display());
    }
    let source = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let stripped = strip_comments(&source);

    let target = output.unwrap_or(file);
    write_atomic(target, stripped.as_bytes())?;
    debug!(input = %file.display(), output = %target.display(), "Stripped comments");
    println!("✅ Wrote {}", target.display());
    Ok(())
}

/// One job, flattened for display
#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    phase: String,
    code: &'a str,
    tests: &'a str,
    outcome: String,
    passed: usize,
    failed: usize,
}

impl<'a> From<&'a JobResult> for ReportRow<'a> {
    fn from(result: &'a JobResult) -> Self {
        let (passed, failed) = result.tally();
        Self {
            phase: result.phase.to_string(),
            code: &result.code,
            tests: &result.tests,
            outcome: result
                .kind()
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "Ok".to_string()),
            passed,
            failed,
        }
    }
}

/// Tabular rendering of results, one row per job
fn render_table(results: &[JobResult]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<24} {:<32} {:<32} {:<16} {:>6} {:>6}\n",
        "Phase", "Code", "Tests", "Outcome", "Pass", "Fail"
    ));
    out.push_str(&"─".repeat(120));
    out.push('\n');

    for row in results.iter().map(ReportRow::from) {
        out.push_str(&format!(
            "{:<24} {:<32} {:<32} {:<16} {:>6} {:>6}\n",
            row.phase, row.code, row.tests, row.outcome, row.passed, row.failed
        ));
    }
    out
}

pub async fn print_report(results_dir: &Path, json: bool) -> Result<()> {
    let results = list_results(results_dir)
        .with_context(|| format!("Failed to read results from {}", results_dir.display()))?;

    if json {
        let rows: Vec<ReportRow> = results.iter().map(ReportRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results found in {}", results_dir.display());
        return Ok(());
    }

    println!("📋 Grading results:\n");
    print!("{}", render_table(&results));

    let failed_jobs = results.iter().filter(|r| !r.is_ok()).count();
    println!("\n✅ Total: {} job(s), {} with errors", results.len(), failed_jobs);
    Ok(())
}
