/// Result Classifier - Turns Job Evidence into a Persisted Result
///
/// **Core Responsibility:**
/// Map what is known about a job (did it compile, how did execution end,
/// what did it print) onto exactly one outcome.
///
/// **Critical Properties:**
/// - Knows nothing about processes or the compiler
/// - Pure function: (evidence, classifier settings) → verdict
/// - Re-classifying the same evidence yields the same verdict
///
/// **Precedence (first match wins):**
/// 1. Not compiled → CompileError
/// 2. Compiled, no execution evidence yet → Timeout (provisional)
/// 3. Non-blank stderr → OutOfMemory if it carries the OOM marker, else RuntimeError
/// 4. Non-blank stdout → parsed record list, keeping only records whose
///    location names the suite file; unparseable output → Timeout if the
///    run was cut short, else RuntimeError
/// 5. Crashed without output → RuntimeError
/// 6. Otherwise → Timeout
///
/// The provisional verdict is written before execution starts so that a
/// worker killed mid-run leaves a pessimistic Timeout behind, never a gap.

use crate::engine::ExecutionStatus;
use xval_common::config::ClassifierConfig;
use xval_common::types::{JobKey, JobResult, ResultKind, TestCaseRecord};

pub const COMPILE_ERROR_MESSAGE: &str = "😫 Compile error. Check that all names match those given in the assignment and functions take the right arguments.";
pub const OUT_OF_MEMORY_MESSAGE: &str = "🤯 Out of memory error";
pub const TIMEOUT_MESSAGE: &str = "Timeout";

/// What is known about a job at the point of classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence<'a> {
    /// Compilation failed or the bundle is unusable
    NotCompiled,
    /// A bundle exists but nothing has run yet
    Compiled,
    Executed {
        status: ExecutionStatus,
        stdout: &'a str,
        stderr: &'a str,
    },
}

/// Classifier output, before it is bound to a job key
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Passed(Vec<TestCaseRecord>),
    Failed { kind: ResultKind, message: String },
}

impl Verdict {
    pub fn failed(kind: ResultKind, message: impl Into<String>) -> Self {
        Verdict::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ResultKind> {
        match self {
            Verdict::Passed(_) => None,
            Verdict::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn into_result(self, key: &JobKey) -> JobResult {
        match self {
            Verdict::Passed(records) => JobResult::ok(key, records),
            Verdict::Failed { kind, message } => JobResult::err(key, kind, message),
        }
    }
}

/// Classifier bound to one grader configuration
#[derive(Debug, Clone)]
pub struct Evaluator {
    config: ClassifierConfig,
    suite_file_name: String,
}

impl Evaluator {
    pub fn new(config: ClassifierConfig, suite_file_name: impl Into<String>) -> Self {
        Self {
            config,
            suite_file_name: suite_file_name.into(),
        }
    }

    pub fn runtime_error_message(&self) -> String {
        format!(
            "🥺 Runtime error. Check that your code works on {}. If so, try resubmitting.",
            self.config.reference_environment
        )
    }

    /// Verdict for a job whose inputs could not be assembled
    pub fn missing_artifact(&self, reason: &str) -> Verdict {
        Verdict::failed(
            ResultKind::MissingArtifact,
            format!("😕 Missing file: {reason}. Check your submission and try resubmitting."),
        )
    }

    /// Verdict for a job the grader itself failed to run
    pub fn operator_failure(&self) -> Verdict {
        Verdict::failed(ResultKind::RuntimeError, self.runtime_error_message())
    }

    pub fn classify(&self, evidence: Evidence<'_>) -> Verdict {
        let (status, stdout, stderr) = match evidence {
            Evidence::NotCompiled => {
                return Verdict::failed(ResultKind::CompileError, COMPILE_ERROR_MESSAGE)
            }
            Evidence::Compiled => return Verdict::failed(ResultKind::Timeout, TIMEOUT_MESSAGE),
            Evidence::Executed {
                status,
                stdout,
                stderr,
            } => (status, stdout, stderr),
        };

        if !stderr.trim().is_empty() {
            return if stderr.contains(&self.config.oom_marker) {
                Verdict::failed(ResultKind::OutOfMemory, OUT_OF_MEMORY_MESSAGE)
            } else {
                Verdict::failed(ResultKind::RuntimeError, self.runtime_error_message())
            };
        }

        if !stdout.trim().is_empty() {
            return match serde_json::from_str::<Vec<TestCaseRecord>>(stdout.trim()) {
                Ok(records) => Verdict::Passed(self.own_records(records)),
                Err(_) if status == ExecutionStatus::TimedOut => {
                    Verdict::failed(ResultKind::Timeout, TIMEOUT_MESSAGE)
                }
                Err(_) => Verdict::failed(ResultKind::RuntimeError, self.runtime_error_message()),
            };
        }

        match status {
            ExecutionStatus::Crashed { .. } => {
                Verdict::failed(ResultKind::RuntimeError, self.runtime_error_message())
            }
            ExecutionStatus::Completed | ExecutionStatus::TimedOut => {
                Verdict::failed(ResultKind::Timeout, TIMEOUT_MESSAGE)
            }
        }
    }

    // Records from included modules are reported against their own files
    fn own_records(&self, records: Vec<TestCaseRecord>) -> Vec<TestCaseRecord> {
        records
            .into_iter()
            .filter(|record| {
                record
                    .location(&self.config.location_field)
                    .is_some_and(|loc| loc.contains(&self.suite_file_name))
            })
            .collect()
    }
}
