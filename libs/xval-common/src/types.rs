use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which side of the cross-validation an implementation sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationKind {
    Student,
    /// Known-correct reference
    Wheat,
    /// Reference with one deliberately seeded defect
    Chaff,
}

impl fmt::Display for ImplementationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImplementationKind::Student => write!(f, "student"),
            ImplementationKind::Wheat => write!(f, "wheat"),
            ImplementationKind::Chaff => write!(f, "chaff"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Instructor,
    Student,
}

impl fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SuiteKind::Instructor => write!(f, "instructor"),
            SuiteKind::Student => write!(f, "student"),
        }
    }
}

/// Grading phase a job belongs to
///
/// Ordering follows the grading matrix: correctness first, then the two
/// test-quality directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Instructor suites × student code
    CorrectnessCheck,
    /// Wheats × student tests
    TestQualityVsWheat,
    /// Chaffs × student tests
    TestQualityVsChaff,
}

impl Phase {
    pub const ALL: [Phase; 3] = [
        Phase::CorrectnessCheck,
        Phase::TestQualityVsWheat,
        Phase::TestQualityVsChaff,
    ];

    /// Short stable name used in result slot paths
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::CorrectnessCheck => "correctness",
            Phase::TestQualityVsWheat => "wheat",
            Phase::TestQualityVsChaff => "chaff",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::CorrectnessCheck => write!(f, "correctness_check"),
            Phase::TestQualityVsWheat => write!(f, "test_quality_vs_wheat"),
            Phase::TestQualityVsChaff => write!(f, "test_quality_vs_chaff"),
        }
    }
}

/// Role a submission file plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Code,
    Common,
    Tests,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Code => write!(f, "code"),
            Role::Common => write!(f, "common"),
            Role::Tests => write!(f, "tests"),
        }
    }
}

/// Where an artifact's source lives, or why it cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Present(PathBuf),
    /// Optional artifact that was not supplied
    Absent,
    /// Required artifact that was not supplied
    Missing { role: Role },
    /// More than one file qualified for the role
    Ambiguous { role: Role, candidates: Vec<PathBuf> },
}

impl ArtifactSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ArtifactSource::Present(path) => Some(path),
            _ => None,
        }
    }

    /// Explanation for an artifact that blocks grading, `None` when usable
    pub fn unavailable_reason(&self) -> Option<String> {
        match self {
            ArtifactSource::Present(_) | ArtifactSource::Absent => None,
            ArtifactSource::Missing { role } => Some(format!("no {} file was found", role)),
            ArtifactSource::Ambiguous { role, candidates } => {
                let names: Vec<String> = candidates
                    .iter()
                    .map(|c| {
                        c.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| c.display().to_string())
                    })
                    .collect();
                Some(format!(
                    "more than one {} file was found ({})",
                    role,
                    names.join(", ")
                ))
            }
        }
    }
}

/// A unit of executable code under evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Implementation {
    pub id: String,
    pub kind: ImplementationKind,
    pub source: ArtifactSource,
    /// Companion module the implementation includes
    pub common: ArtifactSource,
}

/// A unit of test code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    pub id: String,
    pub kind: SuiteKind,
    pub source: ArtifactSource,
}

/// Identity of a job: (implementation id, suite id, phase)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub phase: Phase,
    pub code: String,
    pub tests: String,
}

impl JobKey {
    pub fn new(phase: Phase, code: impl Into<String>, tests: impl Into<String>) -> Self {
        Self {
            phase,
            code: code.into(),
            tests: tests.into(),
        }
    }

    /// Filesystem-safe, deterministic name for this job's result slot
    pub fn slug(&self) -> String {
        format!(
            "{}--{};{}",
            self.phase.slug(),
            sanitize(&self.code),
            sanitize(&self.tests)
        )
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{} × {}]", self.phase, self.code, self.tests)
    }
}

/// Escape an id into a single path component
///
/// `/` becomes `_`; any other byte outside `[A-Za-z0-9.-]`, `_` included,
/// becomes `%XX`. The mapping is reversible, so distinct ids never share a slot.
fn sanitize(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            b'/' => out.push('_'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// One implementation paired with one suite for one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub phase: Phase,
    pub implementation: Implementation,
    pub suite: TestSuite,
    /// Common module the suite's common import resolves to
    pub suite_common: ArtifactSource,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.phase, &self.implementation.id, &self.suite.id)
    }
}

/// Closed taxonomy of job failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    CompileError,
    Timeout,
    OutOfMemory,
    RuntimeError,
    MissingArtifact,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResultKind::CompileError => write!(f, "CompileError"),
            ResultKind::Timeout => write!(f, "Timeout"),
            ResultKind::OutOfMemory => write!(f, "OutOfMemory"),
            ResultKind::RuntimeError => write!(f, "RuntimeError"),
            ResultKind::MissingArtifact => write!(f, "MissingArtifact"),
        }
    }
}

/// A single test-case record emitted by a compiled bundle
///
/// The bundle's schema is opaque apart from a source-location field and,
/// optionally, a pass/fail marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestCaseRecord(pub Map<String, Value>);

impl TestCaseRecord {
    pub fn location(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Pass/fail verdict, read from `passed` (bool) or `status` (string)
    pub fn passed(&self) -> Option<bool> {
        if let Some(passed) = self.0.get("passed").and_then(Value::as_bool) {
            return Some(passed);
        }
        match self.0.get("status").and_then(Value::as_str) {
            Some("pass") | Some("passed") => Some(true),
            Some("fail") | Some("failed") => Some(false),
            _ => None,
        }
    }
}

/// Persisted `result` payload: `{"Ok": [...]}` or `{"Err": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Ok(Vec<TestCaseRecord>),
    Err(String),
}

/// Outcome record of one job, the unit the aggregator reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub code: String,
    pub tests: String,
    pub phase: Phase,
    pub result: JobOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ResultKind>,
}

impl JobResult {
    pub fn ok(key: &JobKey, records: Vec<TestCaseRecord>) -> Self {
        Self {
            code: key.code.clone(),
            tests: key.tests.clone(),
            phase: key.phase,
            result: JobOutcome::Ok(records),
            error_kind: None,
        }
    }

    pub fn err(key: &JobKey, kind: ResultKind, message: impl Into<String>) -> Self {
        Self {
            code: key.code.clone(),
            tests: key.tests.clone(),
            phase: key.phase,
            result: JobOutcome::Err(message.into()),
            error_kind: Some(kind),
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.phase, &self.code, &self.tests)
    }

    pub fn kind(&self) -> Option<ResultKind> {
        self.error_kind
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.result, JobOutcome::Ok(_))
    }

    pub fn records(&self) -> &[TestCaseRecord] {
        match &self.result {
            JobOutcome::Ok(records) => records,
            JobOutcome::Err(_) => &[],
        }
    }

    pub fn message(&self) -> Option<&str> {
        match &self.result {
            JobOutcome::Ok(_) => None,
            JobOutcome::Err(message) => Some(message),
        }
    }

    /// (passed, failed) counts over records carrying a verdict
    pub fn tally(&self) -> (usize, usize) {
        self.records()
            .iter()
            .filter_map(TestCaseRecord::passed)
            .fold((0, 0), |(p, f), passed| if passed { (p + 1, f) } else { (p, f + 1) })
    }
}
