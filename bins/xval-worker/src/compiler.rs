/// Compiler - Turns a Resolved Suite into a Runnable Bundle
///
/// **Responsibility:**
/// Invoke the external compiler on a workspace's suite file and report
/// whether a bundle was produced. Scoring and caching live elsewhere.
///
/// The compiler's diagnostics go to a log file inside the workspace so a
/// failing job can be inspected after the run.

use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use xval_common::config::{render_args, CompilerConfig};

#[derive(Debug, Error)]
pub enum CompileFailure {
    #[error("compiler rejected the source (exit code {exit_code:?})")]
    Rejected { exit_code: Option<i32> },
    #[error("compiler produced no bundle")]
    NoOutput,
    #[error("compiler did not finish within {0}ms")]
    TimedOut(u64),
    /// The compiler could not be started at all; an operator problem
    #[error("failed to launch compiler {program}: {source}")]
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

impl CompileFailure {
    /// Whether this failure says something about the grader rather than the code
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompileFailure::Launch { .. } | CompileFailure::Io { .. })
    }
}

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Stable description of the toolchain, folded into cache keys
    fn identity(&self) -> String;

    /// Compile `source` into `output`, writing diagnostics to `log`
    async fn compile(&self, source: &Path, output: &Path, log: &Path) -> Result<(), CompileFailure>;
}

/// Runs the configured compiler as a child process
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    config: CompilerConfig,
}

impl CommandCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    fn identity(&self) -> String {
        format!("{} {}", self.config.program, self.config.args.join(" "))
    }

    #[tracing::instrument(skip(self, source, output, log), fields(source = %source.display()))]
    async fn compile(&self, source: &Path, output: &Path, log: &Path) -> Result<(), CompileFailure> {
        let source_arg = source.display().to_string();
        let output_arg = output.display().to_string();
        let compiled_arg = self.config.compiled_dir.display().to_string();
        let args = render_args(
            &self.config.args,
            &[
                ("source", source_arg.as_str()),
                ("output", output_arg.as_str()),
                ("compiled_dir", compiled_arg.as_str()),
            ],
        );

        let log_file = File::create(log).map_err(|e| CompileFailure::Io {
            path: log.to_path_buf(),
            source: e,
        })?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        debug!(program = %self.config.program, "Starting compiler");
        let mut child = command.spawn().map_err(|e| CompileFailure::Launch {
            program: self.config.program.clone(),
            source: e,
        })?;

        let limit = Duration::from_millis(self.config.timeout_ms);
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.map_err(|e| CompileFailure::Launch {
                program: self.config.program.clone(),
                source: e,
            })?,
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "Compiler timed out; killing");
                let _ = child.kill().await;
                return Err(CompileFailure::TimedOut(self.config.timeout_ms));
            }
        };

        if !status.success() {
            return Err(CompileFailure::Rejected {
                exit_code: status.code(),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(CompileFailure::NoOutput),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_compiler(script: &str) -> CommandCompiler {
        CommandCompiler::new(CompilerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string(), "{source}".to_string(), "{output}".to_string()],
            working_dir: None,
            env: Default::default(),
            compiled_dir: PathBuf::from("/tmp"),
            timeout_ms: 5_000,
        })
    }

    #[tokio::test]
    async fn test_successful_compile_copies_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tests.arr");
        std::fs::write(&source, "check: 1 is 1 end").unwrap();
        let output = dir.path().join("tests.js");
        let log = dir.path().join("compile.log");

        shell_compiler(r#"cp "$1" "$2""#)
            .compile(&source, &output, &log)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "check: 1 is 1 end");
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_rejected_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("compile.log");
        let result = shell_compiler("echo 'unbound identifier' >&2; exit 3")
            .compile(&dir.path().join("a"), &dir.path().join("b"), &log)
            .await;

        assert!(matches!(result, Err(CompileFailure::Rejected { exit_code: Some(3) })));
        assert!(std::fs::read_to_string(&log).unwrap().contains("unbound identifier"));
    }

    #[tokio::test]
    async fn test_success_without_bundle_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = shell_compiler("true")
            .compile(&dir.path().join("a"), &dir.path().join("b"), &dir.path().join("log"))
            .await;
        assert!(matches!(result, Err(CompileFailure::NoOutput)));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = CommandCompiler::new(CompilerConfig {
            program: "/nonexistent/compiler".to_string(),
            ..CompilerConfig::default()
        });
        let err = compiler
            .compile(&dir.path().join("a"), &dir.path().join("b"), &dir.path().join("log"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_compiler_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = shell_compiler("sleep 5");
        compiler.config.timeout_ms = 100;
        let result = compiler
            .compile(&dir.path().join("a"), &dir.path().join("b"), &dir.path().join("log"))
            .await;
        assert!(matches!(result, Err(CompileFailure::TimedOut(100))));
    }
}
