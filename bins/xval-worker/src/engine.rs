/// Execution Engine - Runs a Compiled Bundle Under a Time Limit
///
/// **Core Responsibility:**
/// Execute one bundle inside its job workspace and capture raw outputs.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (runtime program, env, time limit)
/// - Engine does NOT interpret output
/// - Engine does NOT decide the job's result kind
/// - Engine returns raw evidence for the Evaluator to classify
///
/// **Capture Rules:**
/// 1. stdout is written to `raw.json` in the workspace
/// 2. stderr is written to `error.txt` in the workspace
/// 3. The child runs with the workspace as its working directory
/// 4. On expiry the child is killed; output captured so far is kept
/// 5. A child dropped mid-run is killed (`kill_on_drop`)

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use xval_common::config::{render_args, RuntimeConfig};

pub const STDOUT_FILE: &str = "raw.json";
pub const STDERR_FILE: &str = "error.txt";

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime could not be started; an operator problem, not a student one
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exited with status 0
    Completed,
    TimedOut,
    /// Non-zero exit or killed by a signal
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Raw evidence from one execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub execution_time_ms: u64,
}

impl ExecutionOutcome {
    pub fn read_stdout(&self) -> io::Result<String> {
        read_lossy(&self.stdout_path)
    }

    pub fn read_stderr(&self) -> io::Result<String> {
        read_lossy(&self.stderr_path)
    }
}

fn read_lossy(path: &Path) -> io::Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

fn status_of(status: ExitStatus) -> ExecutionStatus {
    if status.success() {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Crashed {
            exit_code: status.code(),
            signal: signal_of(&status),
        }
    }
}

/// Child-process execution engine configured from `runtime`
///
/// Resource isolation beyond the wall-clock limit is left to the host
/// (container limits, ulimits).
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: RuntimeConfig,
}

impl ProcessEngine {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn create(path: PathBuf) -> Result<(File, PathBuf), SandboxError> {
        File::create(&path)
            .map(|file| (file, path.clone()))
            .map_err(|source| SandboxError::Io { path, source })
    }

    /// Run `bundle` with `workspace` as the working directory
    #[tracing::instrument(skip(self, bundle, workspace), fields(bundle = %bundle.display(), timeout_ms = timeout.as_millis() as u64))]
    pub async fn execute(
        &self,
        bundle: &Path,
        workspace: &Path,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let (stdout_file, stdout_path) = Self::create(workspace.join(STDOUT_FILE))?;
        let (stderr_file, stderr_path) = Self::create(workspace.join(STDERR_FILE))?;

        let bundle_arg = bundle.display().to_string();
        let args = render_args(&self.config.args, &[("bundle", bundle_arg.as_str())]);

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .envs(&self.config.env)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        let start_time = Instant::now();
        let mut child = command.spawn().map_err(|e| SandboxError::Launch {
            program: self.config.program.clone(),
            source: e,
        })?;

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status_of(status),
            Ok(Err(e)) => {
                return Err(SandboxError::Launch {
                    program: self.config.program.clone(),
                    source: e,
                })
            }
            Err(_) => {
                warn!("Execution exceeded time limit; killing child");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out child");
                }
                ExecutionStatus::TimedOut
            }
        };

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        debug!(?status, execution_time_ms, "Execution finished");

        Ok(ExecutionOutcome {
            status,
            stdout_path,
            stderr_path,
            execution_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_engine() -> ProcessEngine {
        ProcessEngine::new(RuntimeConfig {
            program: "sh".to_string(),
            args: vec!["{bundle}".to_string()],
            env: Default::default(),
            timeout_ms: 2_000,
        })
    }

    fn bundle(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("tests.js");
        std::fs::write(&path, script).unwrap();
        path
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = bundle(dir.path(), "echo '[]'; echo warn >&2");

        let outcome = sh_engine()
            .execute(&script, dir.path(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.read_stdout().unwrap().trim(), "[]");
        assert_eq!(outcome.read_stderr().unwrap().trim(), "warn");
        assert_eq!(outcome.stdout_path, dir.path().join(STDOUT_FILE));
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let script = bundle(dir.path(), "pwd");
        let outcome = sh_engine()
            .execute(&script, dir.path(), Duration::from_secs(2))
            .await
            .unwrap();

        let reported = PathBuf::from(outcome.read_stdout().unwrap().trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = bundle(dir.path(), "echo started; sleep 10");

        let start = Instant::now();
        let outcome = sh_engine()
            .execute(&script, dir.path(), Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.read_stdout().unwrap().trim(), "started");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = bundle(dir.path(), "exit 7");
        let outcome = sh_engine()
            .execute(&script, dir.path(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            ExecutionStatus::Crashed {
                exit_code: Some(7),
                signal: None
            }
        );
    }

    #[tokio::test]
    async fn test_missing_runtime_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(RuntimeConfig {
            program: "/nonexistent/runtime".to_string(),
            ..RuntimeConfig::default()
        });
        let result = engine
            .execute(&dir.path().join("tests.js"), dir.path(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SandboxError::Launch { .. })));
    }
}
