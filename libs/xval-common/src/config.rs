// Grader configuration schema, shared by the worker and the CLI
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fixed directories the grader reads from and writes to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub submission_dir: PathBuf,
    pub wheats_dir: PathBuf,
    pub chaffs_dir: PathBuf,
    pub tests_dir: PathBuf,
    /// Starter files whose names identify the code/common import targets
    pub stencil_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Staged inputs and per-job workspaces
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Layout {
    /// Every root resolved against `base` when relative
    pub fn resolved_against(&self, base: &Path) -> Layout {
        let resolve = |dir: &PathBuf| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                base.join(dir)
            }
        };
        Layout {
            submission_dir: resolve(&self.submission_dir),
            wheats_dir: resolve(&self.wheats_dir),
            chaffs_dir: resolve(&self.chaffs_dir),
            tests_dir: resolve(&self.tests_dir),
            stencil_dir: resolve(&self.stencil_dir),
            results_dir: resolve(&self.results_dir),
            work_dir: resolve(&self.work_dir),
            cache_dir: resolve(&self.cache_dir),
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        let source = PathBuf::from("/autograder/source");
        Self {
            submission_dir: PathBuf::from("/autograder/submission"),
            wheats_dir: source.join("impls/wheat"),
            chaffs_dir: source.join("impls/chaff"),
            tests_dir: source.join("tests"),
            stencil_dir: source.join("stencil"),
            results_dir: PathBuf::from("/autograder/results"),
            work_dir: PathBuf::from("/autograder/work"),
            cache_dir: source.join("cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub code_marker: String,
    pub tests_marker: String,
    pub common_marker: String,
    /// Housekeeping file names never treated as code or tests
    pub placeholders: Vec<String>,
    pub require_common: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            code_marker: ".arr".to_string(),
            tests_marker: "tests".to_string(),
            common_marker: "common".to_string(),
            placeholders: vec![
                "README".to_string(),
                "README.md".to_string(),
                ".gitkeep".to_string(),
            ],
            require_common: false,
        }
    }
}

/// External compiler invocation
///
/// `args` may reference `{source}`, `{output}` and `{compiled_dir}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// The compiler's own incremental cache, distinct from the bundle store
    pub compiled_dir: PathBuf,
    pub timeout_ms: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        let pyret = PathBuf::from("/autograder/pyret-lang/pyret-lang");
        let mut env = BTreeMap::new();
        env.insert(
            "NODE_PATH".to_string(),
            pyret.join("node_modules").display().to_string(),
        );
        Self {
            program: "nodejs".to_string(),
            args: [
                "build/phaseA/pyret.jarr",
                "--build-runnable",
                "{source}",
                "--outfile",
                "{output}",
                "--standalone-file",
                "/autograder/source/runner.js",
                "--builtin-js-dir",
                "src/js/trove/",
                "--builtin-arr-dir",
                "src/arr/trove",
                "--compiled-dir",
                "{compiled_dir}",
                "--require-config",
                "src/scripts/standalone-configA.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            working_dir: Some(pyret),
            env,
            compiled_dir: PathBuf::from("/autograder/source/compiled"),
            timeout_ms: 600_000,
        }
    }
}

/// How a compiled bundle is executed; `args` must reference `{bundle}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "NODE_PATH".to_string(),
            "/autograder/pyret-lang/pyret-lang/node_modules".to_string(),
        );
        Self {
            program: "nodejs".to_string(),
            args: vec!["{bundle}".to_string()],
            env,
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Name the suite is copied to inside a job workspace
    pub suite_file_name: String,
    pub bundle_file_name: String,
    /// Helper files whose import directives are dropped from suites
    pub excluded_includes: Vec<String>,
    pub strip_comments: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            suite_file_name: "tests.arr".to_string(),
            bundle_file_name: "tests.js".to_string(),
            excluded_includes: vec!["hw.code-ignore.arr".to_string()],
            strip_comments: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Substring of stderr that marks memory exhaustion
    pub oom_marker: String,
    pub location_field: String,
    /// Where students are told to double-check runtime errors
    pub reference_environment: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            oom_marker: "memory".to_string(),
            location_field: "loc".to_string(),
            reference_environment: "code.pyret.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    /// Defaults to the available parallelism of the host
    pub max_parallel_jobs: Option<usize>,
}

/// Top-level grader configuration (`config/grader.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub layout: Layout,
    pub discovery: DiscoveryConfig,
    pub compiler: CompilerConfig,
    pub runtime: RuntimeConfig,
    pub rewrite: RewriteConfig,
    pub classifier: ClassifierConfig,
    pub concurrency: Concurrency,
}

/// Substitute `{name}` placeholders in an argument template
pub fn render_args(template: &[String], values: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            values.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_layout_resolves_against_base() {
        let layout = Layout {
            wheats_dir: PathBuf::from("source/impls/wheat"),
            chaffs_dir: PathBuf::from("source/impls/chaff"),
            work_dir: PathBuf::from("work"),
            ..Layout::default()
        };
        let resolved = layout.resolved_against(Path::new("/srv/grader"));

        assert_eq!(resolved.wheats_dir, PathBuf::from("/srv/grader/source/impls/wheat"));
        assert_eq!(resolved.chaffs_dir, PathBuf::from("/srv/grader/source/impls/chaff"));
        assert_eq!(resolved.work_dir, PathBuf::from("/srv/grader/work"));
        assert_eq!(resolved.results_dir, PathBuf::from("/autograder/results"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: GraderConfig = serde_json::from_str(
            r#"{ "runtime": { "program": "sh" }, "rewrite": { "strip_comments": false } }"#,
        )
        .unwrap();

        assert_eq!(config.runtime.program, "sh");
        assert_eq!(config.runtime.args, vec!["{bundle}"]);
        assert!(!config.rewrite.strip_comments);
        assert_eq!(config.rewrite.suite_file_name, "tests.arr");
        assert_eq!(config.discovery.placeholders.len(), 3);
    }

    #[test]
    fn test_render_args() {
        let template = vec!["--in".to_string(), "{source}".to_string(), "-o={output}".to_string()];
        let args = render_args(&template, &[("source", "/w/tests.arr"), ("output", "/w/tests.js")]);
        assert_eq!(args, vec!["--in", "/w/tests.arr", "-o=/w/tests.js"]);
    }
}
