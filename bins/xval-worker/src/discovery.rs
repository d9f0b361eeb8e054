/// Artifact Discovery - Finding Implementations and Suites on Disk
///
/// **Responsibility:**
/// Walk the fixed collaborator-provided directories and the submission root,
/// returning the files each grading role should use.
///
/// **Strictness:**
/// A submission role with more than one candidate is reported as ambiguous
/// rather than silently resolved; the orchestrator turns that into a
/// `MissingArtifact` outcome for every job that needs the role.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use xval_common::config::DiscoveryConfig;
use xval_common::types::{ArtifactSource, Role};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// A file found under a discovery root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Path relative to the root, with `/` separators
    pub rel: String,
    pub path: PathBuf,
}

/// Student files selected for each role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub code: ArtifactSource,
    pub tests: ArtifactSource,
    pub common: ArtifactSource,
}

fn is_placeholder(path: &Path, placeholders: &[String]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if placeholders.iter().any(|p| *p == name) {
        return true;
    }
    // empty marker files
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

/// Every non-placeholder file under `root`, sorted by path
///
/// A missing root yields no files.
pub fn discover_files(root: &Path, placeholders: &[String]) -> Result<Vec<Discovered>, DiscoveryError> {
    if !root.exists() {
        warn!(root = %root.display(), "Discovery root does not exist");
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| DiscoveryError::Walk {
            path: root.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() || is_placeholder(entry.path(), placeholders) {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        found.push(Discovered {
            rel,
            path: entry.path().to_path_buf(),
        });
    }

    debug!(root = %root.display(), count = found.len(), "Discovered files");
    Ok(found)
}

fn classify(name: &str, config: &DiscoveryConfig) -> Option<Role> {
    if name.contains(&config.common_marker) {
        Some(Role::Common)
    } else if name.contains(&config.tests_marker) {
        Some(Role::Tests)
    } else if name.contains(&config.code_marker) {
        Some(Role::Code)
    } else {
        None
    }
}

fn select(role: Role, mut candidates: Vec<PathBuf>, required: bool) -> ArtifactSource {
    match candidates.len() {
        0 if required => ArtifactSource::Missing { role },
        0 => ArtifactSource::Absent,
        1 => ArtifactSource::Present(candidates.remove(0)),
        _ => ArtifactSource::Ambiguous { role, candidates },
    }
}

/// Pick the student's code, tests and optional common module by file name
pub fn discover_submission(root: &Path, config: &DiscoveryConfig) -> Result<Submission, DiscoveryError> {
    let mut code = Vec::new();
    let mut tests = Vec::new();
    let mut common = Vec::new();

    for file in discover_files(root, &config.placeholders)? {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match classify(&name, config) {
            Some(Role::Common) => common.push(file.path),
            Some(Role::Tests) => tests.push(file.path),
            Some(Role::Code) => code.push(file.path),
            None => debug!(file = %file.rel, "Ignoring submission file with no role"),
        }
    }

    let submission = Submission {
        code: select(Role::Code, code, true),
        tests: select(Role::Tests, tests, true),
        common: select(Role::Common, common, config.require_common),
    };

    for source in [&submission.code, &submission.tests, &submission.common] {
        if let Some(reason) = source.unavailable_reason() {
            warn!(reason = %reason, "Submission is incomplete");
        }
    }
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_files_skips_placeholders_and_empty_markers() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README", "docs");
        write(dir.path(), "nested/.gitkeep", "");
        write(dir.path(), "nested/empty.arr", "");
        write(dir.path(), "nested/b.arr", "x");
        write(dir.path(), "a.arr", "x");

        let found = discover_files(dir.path(), &DiscoveryConfig::default().placeholders).unwrap();
        let rels: Vec<&str> = found.iter().map(|d| d.rel.as_str()).collect();
        assert_eq!(rels, vec!["a.arr", "nested/b.arr"]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_files(&dir.path().join("absent"), &[]).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_submission_roles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "hw-code.arr", "fun f(): 1 end");
        write(dir.path(), "hw-tests.arr", "check: f() is 1 end");
        write(dir.path(), "sub/hw-common.arr", "data D: d end");
        write(dir.path(), "notes.txt", "hello");

        let submission = discover_submission(dir.path(), &DiscoveryConfig::default()).unwrap();
        assert_eq!(submission.code, ArtifactSource::Present(dir.path().join("hw-code.arr")));
        assert_eq!(submission.tests, ArtifactSource::Present(dir.path().join("hw-tests.arr")));
        assert_eq!(
            submission.common,
            ArtifactSource::Present(dir.path().join("sub/hw-common.arr"))
        );
    }

    #[test]
    fn test_multiple_code_files_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.arr", "x");
        write(dir.path(), "b.arr", "y");
        write(dir.path(), "hw-tests.arr", "z");

        let submission = discover_submission(dir.path(), &DiscoveryConfig::default()).unwrap();
        assert!(matches!(
            submission.code,
            ArtifactSource::Ambiguous { role: Role::Code, ref candidates } if candidates.len() == 2
        ));
        assert!(submission.tests.path().is_some());
        assert_eq!(submission.common, ArtifactSource::Absent);
    }

    #[test]
    fn test_required_common_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "hw.arr", "x");
        let config = DiscoveryConfig {
            require_common: true,
            ..DiscoveryConfig::default()
        };

        let submission = discover_submission(dir.path(), &config).unwrap();
        assert_eq!(submission.common, ArtifactSource::Missing { role: Role::Common });
        assert_eq!(submission.tests, ArtifactSource::Missing { role: Role::Tests });
    }
}
