/// Job Orchestrator - High-Level Orchestration
///
/// **Responsibility:**
/// Decide what runs against what, give every job a private workspace,
/// drive compiler, artifact store, sandbox and classifier, and persist one
/// result per job.
///
/// **Architecture:**
/// 1. `prepare` stages implementations into `work_dir/prepared` (inputs are
///    never modified) and discovers suites
/// 2. `enumerate` expands the grading matrix into jobs
/// 3. `run_job` runs a single job and always yields a result
/// 4. `run_all` runs jobs with bounded concurrency
///
/// This module is the glue layer - it knows nothing about:
/// - How a bundle executes (engine's job)
/// - How evidence maps to a result kind (evaluator's job)
/// - How bundles are cached (artifact store's job)

use crate::cache::{ArtifactCache, ArtifactStore, CacheStatus, Fingerprint};
use crate::compiler::Compiler;
use crate::discovery::{discover_files, discover_submission, Discovered};
use crate::engine::{ProcessEngine, STDERR_FILE};
use crate::evaluator::{Evaluator, Evidence, Verdict};
use anyhow::{anyhow, Context, Result};
use futures_util::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use xval_common::config::GraderConfig;
use xval_common::rewrite::{
    relative_path, retarget_suite, strip_comments, ImportFixer, ImportResolver, Stencil,
};
use xval_common::store::store_result;
use xval_common::types::{
    ArtifactSource, Implementation, ImplementationKind, Job, JobKey, JobResult, Phase, Role,
    SuiteKind, TestSuite,
};

/// Compiler diagnostics inside a job workspace
pub const COMPILE_LOG: &str = "compile.txt";

/// Everything a run grades, after staging
#[derive(Debug, Clone)]
pub struct GradingInputs {
    pub student: Implementation,
    /// The student's common module, shared by every suite
    pub student_common: ArtifactSource,
    pub student_tests: TestSuite,
    pub instructor_suites: Vec<TestSuite>,
    pub wheats: Vec<Implementation>,
    pub chaffs: Vec<Implementation>,
}

/// Outcome of a full run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Ordered by job key
    pub results: Vec<JobResult>,
    pub cache_hits: usize,
    pub compiles: usize,
    /// Problems with the grader itself, not with the submission
    pub operator_errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn has_operator_errors(&self) -> bool {
        !self.operator_errors.is_empty()
    }
}

/// Phase 1 = suites × student, phase 2 = wheats × student tests, phase 3 = chaffs × student tests
pub fn enumerate(inputs: &GradingInputs) -> Vec<Job> {
    let mut jobs = Vec::new();
    for suite in &inputs.instructor_suites {
        jobs.push(Job {
            phase: Phase::CorrectnessCheck,
            implementation: inputs.student.clone(),
            suite: suite.clone(),
            suite_common: inputs.student_common.clone(),
        });
    }
    for (phase, implementations) in [
        (Phase::TestQualityVsWheat, &inputs.wheats),
        (Phase::TestQualityVsChaff, &inputs.chaffs),
    ] {
        for implementation in implementations {
            jobs.push(Job {
                phase,
                implementation: implementation.clone(),
                suite: inputs.student_tests.clone(),
                suite_common: inputs.student_common.clone(),
            });
        }
    }
    jobs
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn student_id(source: &ArtifactSource, fallback: &str) -> String {
    match source.path() {
        Some(path) => format!("student/{}", file_name(path)),
        None => format!("student/{fallback}"),
    }
}

async fn is_blank(path: &Path) -> bool {
    match tokio::fs::read(path).await {
        Ok(bytes) => bytes.iter().all(u8::is_ascii_whitespace),
        Err(_) => true,
    }
}

async fn read_optional(source: &ArtifactSource) -> Result<Vec<u8>> {
    match source.path() {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => Ok(Vec::new()),
    }
}

fn split(path: &Path) -> (PathBuf, String) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    (dir, file_name(path))
}

/// Point the code and common imports of `target` at the given files
fn fix_imports(target: &Path, stencil: &Stencil, code: &Path, common: Option<&Path>) -> Result<bool> {
    let mut fixer = ImportFixer::new(target, stencil);
    let (dir, name) = split(code);
    fixer.fix_import(Role::Code, &dir, Some(&name))?;
    if let Some(common) = common {
        let (dir, name) = split(common);
        fixer.fix_import(Role::Common, &dir, Some(&name))?;
    }
    Ok(fixer.finalize()?)
}

pub struct Orchestrator {
    config: GraderConfig,
    compiler: Arc<dyn Compiler>,
    engine: ProcessEngine,
    store: ArtifactStore,
    evaluator: Evaluator,
    stencil: Stencil,
    work_dir: PathBuf,
    max_parallel_jobs: usize,
    operator_errors: Mutex<Vec<String>>,
}

impl Orchestrator {
    pub fn new(
        mut config: GraderConfig,
        compiler: Arc<dyn Compiler>,
        cache: Arc<dyn ArtifactCache>,
        max_parallel_jobs: usize,
    ) -> Result<Self> {
        // bundles and compilers run in other directories, so every root must be absolute
        let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
        config.layout = config.layout.resolved_against(&cwd);
        let work_dir = config.layout.work_dir.clone();

        let discovery = &config.discovery;
        let stencil = Stencil::from_dir(
            &config.layout.stencil_dir,
            &discovery.code_marker,
            &discovery.common_marker,
        )?;
        debug!(code = ?stencil.code, common = ?stencil.common, "Loaded stencil");

        Ok(Self {
            engine: ProcessEngine::new(config.runtime.clone()),
            evaluator: Evaluator::new(config.classifier.clone(), &config.rewrite.suite_file_name),
            store: ArtifactStore::new(cache),
            stencil,
            compiler,
            work_dir,
            max_parallel_jobs: max_parallel_jobs.max(1),
            operator_errors: Mutex::new(Vec::new()),
            config,
        })
    }

    fn prepared_dir(&self) -> PathBuf {
        self.work_dir.join("prepared")
    }

    fn record_operator_error(&self, message: String) {
        self.operator_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    /// Remove and recreate the results directory
    pub async fn reset_results(&self) -> Result<()> {
        let dir = &self.config.layout.results_dir;
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(())
    }

    async fn stage(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.config.rewrite.strip_comments {
            let text = tokio::fs::read_to_string(source)
                .await
                .with_context(|| format!("Failed to read {}", source.display()))?;
            tokio::fs::write(dest, strip_comments(&text)).await?;
        } else {
            tokio::fs::copy(source, dest)
                .await
                .with_context(|| format!("Failed to copy {}", source.display()))?;
        }
        Ok(())
    }

    /// Stage reference implementations found under `root`
    ///
    /// Files carrying the common marker are companion modules, not
    /// implementations; the first one found beside an implementation
    /// becomes its common module.
    async fn stage_references(&self, kind: ImplementationKind, root: &Path) -> Result<Vec<Implementation>> {
        let marker = &self.config.discovery.common_marker;
        let files = discover_files(root, &self.config.discovery.placeholders)?;
        let (commons, impls): (Vec<Discovered>, Vec<Discovered>) = files
            .into_iter()
            .partition(|f| file_name(&f.path).contains(marker.as_str()));

        let mut staged = Vec::with_capacity(impls.len());
        for file in impls {
            let dest = self.prepared_dir().join(kind.to_string()).join(&file.rel);
            self.stage(&file.path, &dest).await?;

            let own_dir = file.path.parent().map(Path::to_path_buf).unwrap_or_default();
            let common = commons
                .iter()
                .find(|c| c.path.parent() == Some(own_dir.as_path()))
                .map(|c| ArtifactSource::Present(c.path.clone()))
                .unwrap_or(ArtifactSource::Absent);

            fix_imports(&dest, &self.stencil, &dest, common.path())?;

            staged.push(Implementation {
                id: format!("{}/{}", kind, file.rel),
                kind,
                source: ArtifactSource::Present(dest),
                common,
            });
        }
        Ok(staged)
    }

    /// Discover and stage every input of the run
    #[tracing::instrument(skip(self))]
    pub async fn prepare(&self) -> Result<GradingInputs> {
        let layout = &self.config.layout;
        let discovery = &self.config.discovery;

        let prepared = self.prepared_dir();
        if tokio::fs::try_exists(&prepared).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&prepared)
                .await
                .with_context(|| format!("Failed to clear {}", prepared.display()))?;
        }

        // Step 1: student submission
        let submission = discover_submission(&layout.submission_dir, discovery)?;
        let student_dir = prepared.join(ImplementationKind::Student.to_string());

        let mut common = submission.common.clone();
        if let Some(path) = submission.common.path() {
            let dest = student_dir.join(file_name(path));
            self.stage(path, &dest).await?;
            common = ArtifactSource::Present(dest);
        }
        let mut code = submission.code.clone();
        if let Some(path) = submission.code.path() {
            let dest = student_dir.join(file_name(path));
            self.stage(path, &dest).await?;
            code = ArtifactSource::Present(dest);
        }

        if let Some(code_path) = code.path() {
            for target in [common.path(), Some(code_path)].into_iter().flatten() {
                fix_imports(target, &self.stencil, code_path, common.path())?;
            }
        }

        let student = Implementation {
            id: student_id(&submission.code, "code"),
            kind: ImplementationKind::Student,
            source: code,
            common: common.clone(),
        };
        let student_tests = TestSuite {
            id: student_id(&submission.tests, "tests"),
            kind: SuiteKind::Student,
            source: submission.tests,
        };

        // Step 2: instructor suites
        let instructor_suites = discover_files(&layout.tests_dir, &discovery.placeholders)?
            .into_iter()
            .map(|file| TestSuite {
                id: format!("{}/{}", SuiteKind::Instructor, file.rel),
                kind: SuiteKind::Instructor,
                source: ArtifactSource::Present(file.path),
            })
            .collect::<Vec<_>>();

        // Step 3: wheats and chaffs
        let wheats = self
            .stage_references(ImplementationKind::Wheat, &layout.wheats_dir)
            .await?;
        let chaffs = self
            .stage_references(ImplementationKind::Chaff, &layout.chaffs_dir)
            .await?;

        info!(
            suites = instructor_suites.len(),
            wheats = wheats.len(),
            chaffs = chaffs.len(),
            "Prepared grading inputs"
        );

        Ok(GradingInputs {
            student,
            student_common: common,
            student_tests,
            instructor_suites,
            wheats,
            chaffs,
        })
    }

    /// Run one job and persist its result; never fails
    #[tracing::instrument(skip(self, job), fields(job = %job.key()))]
    pub async fn run_job(&self, job: &Job) -> JobResult {
        let key = job.key();
        let start = Instant::now();

        let verdict = match self.try_run_job(job, &key).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(job = %key, error = %format!("{e:#}"), "Grader failure while running job");
                self.record_operator_error(format!("{key}: {e:#}"));
                self.evaluator.operator_failure()
            }
        };

        let result = verdict.into_result(&key);
        if let Err(e) = store_result(&self.config.layout.results_dir, &result) {
            error!(job = %key, error = %e, "Failed to persist result");
            self.record_operator_error(format!("{key}: {e}"));
        }

        info!(
            job = %key,
            phase = %key.phase,
            outcome = %result.kind().map(|k| k.to_string()).unwrap_or_else(|| "Ok".to_string()),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Job finished"
        );
        result
    }

    async fn try_run_job(&self, job: &Job, key: &JobKey) -> Result<Verdict> {
        // Step 1: every required input must be usable
        let blocker = [&job.implementation.source, &job.suite.source, &job.suite_common]
            .into_iter()
            .find_map(ArtifactSource::unavailable_reason);
        if let Some(reason) = blocker {
            warn!(job = %key, reason = %reason, "Job cannot run");
            return Ok(self.evaluator.missing_artifact(&reason));
        }
        let (Some(implementation), Some(suite)) =
            (job.implementation.source.path(), job.suite.source.path())
        else {
            return Err(anyhow!("job inputs disappeared after validation"));
        };

        // Step 2: private workspace
        let workspace = self
            .work_dir
            .join("jobs")
            .join(format!("{}-{}", key.slug(), uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let verdict = self
            .run_in_workspace(job, key, implementation, suite, &workspace)
            .await;
        if let Err(e) = &verdict {
            debug!(job = %key, workspace = %workspace.display(), error = %e, "Job aborted inside workspace");
        }
        self.finish_workspace(
            &workspace,
            &[&workspace.join(COMPILE_LOG), &workspace.join(STDERR_FILE)],
        )
        .await;
        verdict
    }

    async fn run_in_workspace(
        &self,
        job: &Job,
        key: &JobKey,
        implementation: &Path,
        suite: &Path,
        workspace: &Path,
    ) -> Result<Verdict> {
        let rewrite = &self.config.rewrite;

        // Step 3: point a private copy of the suite at this implementation
        let suite_path = workspace.join(&rewrite.suite_file_name);
        tokio::fs::copy(suite, &suite_path)
            .await
            .with_context(|| format!("Failed to copy suite {}", suite.display()))?;

        let include = relative_path(workspace, implementation);
        let common_include = job.suite_common.path().map(|p| relative_path(workspace, p));
        fix_imports(&suite_path, &self.stencil, &include, common_include.as_deref())?;

        let text = tokio::fs::read_to_string(&suite_path).await?;
        let resolved = retarget_suite(
            &text,
            &include.display().to_string(),
            &rewrite.excluded_includes,
        );
        tokio::fs::write(&suite_path, &resolved).await?;

        // Step 4: compile through the artifact store
        let implementation_bytes = tokio::fs::read(implementation)
            .await
            .with_context(|| format!("Failed to read {}", implementation.display()))?;
        let implementation_common = read_optional(&job.implementation.common).await?;
        let suite_common = read_optional(&job.suite_common).await?;
        let identity = self.compiler.identity();
        let fingerprint = Fingerprint::of(&[
            resolved.as_bytes(),
            implementation_bytes.as_slice(),
            implementation_common.as_slice(),
            suite_common.as_slice(),
            identity.as_bytes(),
        ]);
        let bundle = workspace.join(&rewrite.bundle_file_name);
        let log = workspace.join(COMPILE_LOG);

        let compiled = self
            .store
            .get_or_compile(&fingerprint, &bundle, || {
                self.compiler.compile(&suite_path, &bundle, &log)
            })
            .await;

        match compiled {
            Ok(status) => {
                debug!(job = %key, fingerprint = fingerprint.short(), cached = status == CacheStatus::Hit, "Bundle ready");
            }
            Err(failure) if failure.is_fatal() => {
                return Err(anyhow::Error::new(failure).context("Compiler could not run"));
            }
            Err(failure) => {
                info!(job = %key, fingerprint = fingerprint.short(), reason = %failure, "Compilation failed");
                let _ = tokio::fs::remove_file(&bundle).await;
                return Ok(self.evaluator.classify(Evidence::NotCompiled));
            }
        }

        // Step 5: pessimistic result until execution says otherwise
        let provisional = self.evaluator.classify(Evidence::Compiled).into_result(key);
        store_result(&self.config.layout.results_dir, &provisional)
            .context("Failed to write provisional result")?;

        // Step 6: execute and classify
        let outcome = self
            .engine
            .execute(&bundle, workspace, self.engine.timeout())
            .await?;
        let stdout = outcome.read_stdout()?;
        let stderr = outcome.read_stderr()?;
        let verdict = self.evaluator.classify(Evidence::Executed {
            status: outcome.status,
            stdout: &stdout,
            stderr: &stderr,
        });
        debug!(
            job = %key,
            status = ?outcome.status,
            elapsed_ms = outcome.execution_time_ms,
            "Execution classified"
        );
        Ok(verdict)
    }

    /// Remove the workspace unless a diagnostic log has content
    async fn finish_workspace(&self, workspace: &Path, logs: &[&Path]) {
        for log in logs {
            if !is_blank(log).await {
                debug!(workspace = %workspace.display(), "Retaining workspace for diagnostics");
                return;
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            warn!(workspace = %workspace.display(), error = %e, "Failed to remove workspace");
        }
    }

    /// Run every job with at most `max_parallel_jobs` in flight
    pub async fn run_all(&self, jobs: Vec<Job>) -> RunSummary {
        let start = Instant::now();
        info!(jobs = jobs.len(), parallelism = self.max_parallel_jobs, "Running grading matrix");

        let mut results: Vec<JobResult> = stream::iter(jobs.iter())
            .map(|job| self.run_job(job))
            .buffer_unordered(self.max_parallel_jobs)
            .collect()
            .await;
        results.sort_by(|a, b| a.key().cmp(&b.key()));

        let operator_errors = std::mem::take(
            &mut *self.operator_errors.lock().unwrap_or_else(|e| e.into_inner()),
        );
        RunSummary {
            results,
            cache_hits: self.store.hits(),
            compiles: self.store.compiles(),
            operator_errors,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Prepare, enumerate and run everything
    pub async fn grade(&self) -> Result<RunSummary> {
        let inputs = self.prepare().await?;
        let jobs = enumerate(&inputs);
        Ok(self.run_all(jobs).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryArtifactCache;
    use crate::compiler::CommandCompiler;
    use xval_common::config::{CompilerConfig, Layout};

    fn implementation(kind: ImplementationKind, id: &str) -> Implementation {
        Implementation {
            id: id.to_string(),
            kind,
            source: ArtifactSource::Present(PathBuf::from(id)),
            common: ArtifactSource::Absent,
        }
    }

    fn suite(kind: SuiteKind, id: &str) -> TestSuite {
        TestSuite {
            id: id.to_string(),
            kind,
            source: ArtifactSource::Present(PathBuf::from(id)),
        }
    }

    #[test]
    fn test_enumerate_covers_three_phases() {
        let inputs = GradingInputs {
            student: implementation(ImplementationKind::Student, "student/hw.arr"),
            student_common: ArtifactSource::Present(PathBuf::from("student/hw-common.arr")),
            student_tests: suite(SuiteKind::Student, "student/hw-tests.arr"),
            instructor_suites: vec![
                suite(SuiteKind::Instructor, "instructor/a.arr"),
                suite(SuiteKind::Instructor, "instructor/b.arr"),
            ],
            wheats: vec![implementation(ImplementationKind::Wheat, "wheat/w1.arr")],
            chaffs: vec![
                implementation(ImplementationKind::Chaff, "chaff/c1.arr"),
                implementation(ImplementationKind::Chaff, "chaff/c2.arr"),
            ],
        };

        let jobs = enumerate(&inputs);
        assert!(jobs.iter().all(|job| job.suite_common == inputs.student_common));

        let keys: Vec<JobKey> = jobs.iter().map(Job::key).collect();
        assert_eq!(
            keys,
            vec![
                JobKey::new(Phase::CorrectnessCheck, "student/hw.arr", "instructor/a.arr"),
                JobKey::new(Phase::CorrectnessCheck, "student/hw.arr", "instructor/b.arr"),
                JobKey::new(Phase::TestQualityVsWheat, "wheat/w1.arr", "student/hw-tests.arr"),
                JobKey::new(Phase::TestQualityVsChaff, "chaff/c1.arr", "student/hw-tests.arr"),
                JobKey::new(Phase::TestQualityVsChaff, "chaff/c2.arr", "student/hw-tests.arr"),
            ]
        );
    }

    #[test]
    fn test_enumerate_without_references() {
        let inputs = GradingInputs {
            student: implementation(ImplementationKind::Student, "student/hw.arr"),
            student_common: ArtifactSource::Absent,
            student_tests: suite(SuiteKind::Student, "student/hw-tests.arr"),
            instructor_suites: vec![],
            wheats: vec![],
            chaffs: vec![],
        };
        assert!(enumerate(&inputs).is_empty());
    }

    #[test]
    fn test_relative_layout_is_made_absolute() {
        let config = GraderConfig {
            layout: Layout {
                submission_dir: PathBuf::from("submission"),
                wheats_dir: PathBuf::from("source/impls/wheat"),
                chaffs_dir: PathBuf::from("source/impls/chaff"),
                tests_dir: PathBuf::from("source/tests"),
                stencil_dir: PathBuf::from("source/stencil"),
                results_dir: PathBuf::from("results"),
                work_dir: PathBuf::from("work"),
                cache_dir: PathBuf::from("cache"),
            },
            ..GraderConfig::default()
        };
        let compiler: Arc<dyn Compiler> = Arc::new(CommandCompiler::new(CompilerConfig::default()));
        let orchestrator =
            Orchestrator::new(config, compiler, Arc::new(MemoryArtifactCache::new()), 1).unwrap();

        let cwd = std::env::current_dir().unwrap();
        let layout = &orchestrator.config.layout;
        assert_eq!(layout.wheats_dir, cwd.join("source/impls/wheat"));
        assert_eq!(layout.chaffs_dir, cwd.join("source/impls/chaff"));
        assert_eq!(layout.results_dir, cwd.join("results"));
        assert_eq!(orchestrator.work_dir, cwd.join("work"));
    }

    #[test]
    fn test_student_ids_fall_back_to_role() {
        assert_eq!(student_id(&ArtifactSource::Missing { role: Role::Code }, "code"), "student/code");
        assert_eq!(
            student_id(&ArtifactSource::Present(PathBuf::from("/s/hw.arr")), "code"),
            "student/hw.arr"
        );
    }
}
