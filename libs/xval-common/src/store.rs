use crate::types::{JobKey, JobResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result slot semantics - defines only where results live on disk
/// Ensures worker, aggregator and CLI never drift: slot paths are
/// deterministic in the job key, and every write is complete-or-absent.

pub const RESULT_FILE: &str = "results.json";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed result in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory owning a job's durable result
pub fn slot_dir(results_dir: &Path, key: &JobKey) -> PathBuf {
    results_dir.join(key.slug())
}

/// Path of a job's persisted result
pub fn result_path(results_dir: &Path, key: &JobKey) -> PathBuf {
    slot_dir(results_dir, key).join(RESULT_FILE)
}

/// Write bytes via a sibling temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(path.file_name().unwrap_or_default());
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = parent.join(tmp_name);

    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

/// Persist a job result into its slot, replacing any earlier write
pub fn store_result(results_dir: &Path, result: &JobResult) -> Result<PathBuf, StoreError> {
    let path = result_path(results_dir, &result.key());
    let payload = serde_json::to_vec(result).map_err(|e| StoreError::Malformed {
        path: path.clone(),
        source: e,
    })?;
    write_atomic(&path, &payload)?;
    Ok(path)
}

/// Read a job result back from its slot
pub fn load_result(results_dir: &Path, key: &JobKey) -> Result<Option<JobResult>, StoreError> {
    let path = result_path(results_dir, key);
    if !path.exists() {
        return Ok(None);
    }
    read_result_file(&path).map(Some)
}

fn read_result_file(path: &Path) -> Result<JobResult, StoreError> {
    let data = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&data).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Every persisted result under `results_dir`, ordered by job key
pub fn list_results(results_dir: &Path) -> Result<Vec<JobResult>, StoreError> {
    let mut results = Vec::new();
    if !results_dir.exists() {
        return Ok(results);
    }

    let entries = fs::read_dir(results_dir).map_err(|e| StoreError::io(results_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(results_dir, e))?;
        let path = entry.path().join(RESULT_FILE);
        if path.is_file() {
            results.push(read_result_file(&path)?);
        }
    }

    results.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Phase, ResultKind};

    #[test]
    fn test_result_path_deterministic() {
        let key = JobKey::new(Phase::CorrectnessCheck, "student/hw.arr", "instructor/t.arr");
        let root = Path::new("/results");
        assert_eq!(result_path(root, &key), result_path(root, &key));
        assert!(result_path(root, &key).ends_with(RESULT_FILE));
    }

    #[test]
    fn test_overwrite_replaces_provisional_result() {
        let dir = tempfile::tempdir().unwrap();
        let key = JobKey::new(Phase::TestQualityVsWheat, "wheat/w.arr", "student/hw-tests.arr");

        store_result(dir.path(), &JobResult::err(&key, ResultKind::Timeout, "Timeout")).unwrap();
        store_result(dir.path(), &JobResult::ok(&key, vec![])).unwrap();

        let loaded = load_result(dir.path(), &key).unwrap().unwrap();
        assert!(loaded.is_ok());

        // no temp files left beside the slot
        let leftovers: Vec<_> = fs::read_dir(slot_dir(dir.path(), &key))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(RESULT_FILE)]);
    }

    #[test]
    fn test_list_results_sorted_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let chaff = JobKey::new(Phase::TestQualityVsChaff, "chaff/c.arr", "student/t.arr");
        let first = JobKey::new(Phase::CorrectnessCheck, "student/hw.arr", "instructor/b.arr");
        let second = JobKey::new(Phase::CorrectnessCheck, "student/hw.arr", "instructor/a.arr");
        for key in [&chaff, &first, &second] {
            store_result(dir.path(), &JobResult::ok(key, vec![])).unwrap();
        }
        fs::write(dir.path().join(REPORT_FILE), "{}").unwrap();

        let keys: Vec<JobKey> = list_results(dir.path())
            .unwrap()
            .iter()
            .map(JobResult::key)
            .collect();
        assert_eq!(keys, vec![second, first, chaff]);
    }

    #[test]
    fn test_missing_slot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let key = JobKey::new(Phase::CorrectnessCheck, "a", "b");
        assert!(load_result(dir.path(), &key).unwrap().is_none());
    }
}
