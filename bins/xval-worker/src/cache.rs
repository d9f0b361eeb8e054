/// Artifact Store - Content-Addressed Cache of Compiled Bundles
///
/// **Core Responsibility:**
/// Avoid recompiling a test bundle whose inputs have not changed.
///
/// **Correctness Rules:**
/// - The key covers every compilation input (resolved suite text,
///   implementation, common module, compiler identity)
/// - Entries are published with a single rename: complete or absent
/// - Every entry carries a digest of its bytes; an entry that fails
///   verification is evicted and reported as a miss
/// - Compile failures are never cached
///
/// **Concurrency:**
/// Misses for the same key inside one process are single-flighted so a
/// run compiles each distinct input once. Separate processes sharing the
/// directory may still race; the last rename wins, which is harmless
/// because compilation is deterministic for identical input.

use crate::compiler::CompileFailure;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use xval_common::store::write_atomic;

fn hex_digest(digest: impl AsRef<[u8]>) -> String {
    let digest = digest.as_ref();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex_digest(Sha256::digest(bytes))
}

/// Content-derived cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash an ordered list of inputs; each part is length-prefixed
    pub fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Fingerprint(hex_digest(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage behind the artifact store
pub trait ArtifactCache: Send + Sync {
    /// Materialise the entry for `key` at `dest`; `Ok(false)` on a miss
    fn lookup(&self, key: &Fingerprint, dest: &Path) -> io::Result<bool>;

    /// Record the bundle at `bundle` under `key`
    fn publish(&self, key: &Fingerprint, bundle: &Path) -> io::Result<()>;
}

/// Directory-backed cache; one `<key>.bundle` file per entry
///
/// Entry format: 64 hex digest characters, `\n`, then the bundle bytes.
#[derive(Debug, Clone)]
pub struct FsArtifactCache {
    root: PathBuf,
}

impl FsArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.bundle", key.as_str()))
    }

    fn evict(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(entry = %path.display(), error = %e, "Failed to evict cache entry");
            }
        }
    }
}

impl ArtifactCache for FsArtifactCache {
    fn lookup(&self, key: &Fingerprint, dest: &Path) -> io::Result<bool> {
        let path = self.entry_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let verified = data
            .iter()
            .position(|b| *b == b'\n')
            .filter(|&idx| idx == 64)
            .and_then(|idx| {
                let (header, body) = (&data[..idx], &data[idx + 1..]);
                (header == sha256_hex(body).as_bytes()).then_some(body)
            });

        match verified {
            Some(body) => {
                fs::write(dest, body)?;
                Ok(true)
            }
            None => {
                warn!(key = key.short(), "Cache entry failed verification; evicting");
                self.evict(&path);
                Ok(false)
            }
        }
    }

    fn publish(&self, key: &Fingerprint, bundle: &Path) -> io::Result<()> {
        let body = fs::read(bundle)?;
        let mut entry = Vec::with_capacity(body.len() + 65);
        entry.extend_from_slice(sha256_hex(&body).as_bytes());
        entry.push(b'\n');
        entry.extend_from_slice(&body);

        write_atomic(&self.entry_path(key), &entry)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// In-process cache, mainly for tests
#[derive(Debug, Default)]
pub struct MemoryArtifactCache {
    entries: Mutex<HashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl ArtifactCache for MemoryArtifactCache {
    fn lookup(&self, key: &Fingerprint, dest: &Path) -> io::Result<bool> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "cache lock poisoned"))?;
        match entries.get(key) {
            Some(body) => {
                fs::write(dest, body)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn publish(&self, key: &Fingerprint, bundle: &Path) -> io::Result<()> {
        let body = fs::read(bundle)?;
        self.entries
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "cache lock poisoned"))?
            .insert(key.clone(), body);
        Ok(())
    }
}

/// How a bundle was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Compiled,
}

/// Read-through cache in front of the compiler
pub struct ArtifactStore {
    cache: Arc<dyn ArtifactCache>,
    inflight: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicUsize,
    compiles: AtomicUsize,
}

impl ArtifactStore {
    pub fn new(cache: Arc<dyn ArtifactCache>) -> Self {
        Self {
            cache,
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
        }
    }

    fn key_lock(&self, key: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.entry(key.clone()).or_default().clone()
    }

    /// Drop our handle on the key lock; the last holder removes the entry
    fn release_key(&self, key: &Fingerprint, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if inflight
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            inflight.remove(key);
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn lookup(&self, key: &Fingerprint, dest: &Path) -> bool {
        let cache = Arc::clone(&self.cache);
        let (key, dest) = (key.clone(), dest.to_path_buf());
        let outcome = tokio::task::spawn_blocking(move || cache.lookup(&key, &dest)).await;
        match outcome {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                warn!(error = %e, "Cache lookup failed; treating as miss");
                false
            }
            Err(e) => {
                warn!(error = %e, "Cache lookup task failed; treating as miss");
                false
            }
        }
    }

    async fn publish(&self, key: &Fingerprint, bundle: &Path) {
        let cache = Arc::clone(&self.cache);
        let (owned_key, bundle) = (key.clone(), bundle.to_path_buf());
        let outcome = tokio::task::spawn_blocking(move || cache.publish(&owned_key, &bundle)).await;
        match outcome {
            Ok(Ok(())) => debug!(key = key.short(), "Published bundle"),
            Ok(Err(e)) => warn!(key = key.short(), error = %e, "Failed to publish bundle"),
            Err(e) => warn!(key = key.short(), error = %e, "Publish task failed"),
        }
    }

    /// Place the bundle for `key` at `dest`, compiling on a miss
    ///
    /// `compile` must write the bundle to `dest`; an absent or empty file
    /// afterwards counts as a compile failure. Failures are not published.
    pub async fn get_or_compile<F, Fut>(
        &self,
        key: &Fingerprint,
        dest: &Path,
        compile: F,
    ) -> Result<CacheStatus, CompileFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CompileFailure>>,
    {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.lookup_or_compile(key, dest, compile).await
        };
        self.release_key(key, lock);
        result
    }

    async fn lookup_or_compile<F, Fut>(
        &self,
        key: &Fingerprint,
        dest: &Path,
        compile: F,
    ) -> Result<CacheStatus, CompileFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CompileFailure>>,
    {
        if self.lookup(key, dest).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = key.short(), "✓ Bundle cache hit");
            return Ok(CacheStatus::Hit);
        }

        info!(key = key.short(), "Bundle cache miss; compiling");
        self.compiles.fetch_add(1, Ordering::Relaxed);
        compile().await?;

        let produced = tokio::fs::metadata(dest)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(CompileFailure::NoOutput);
        }

        self.publish(key, dest).await;
        Ok(CacheStatus::Compiled)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of compile attempts, successful or not
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(text: &str) -> Fingerprint {
        Fingerprint::of(&[text.as_bytes()])
    }

    #[test]
    fn test_fingerprint_separates_parts() {
        assert_ne!(Fingerprint::of(&[b"ab", b"c"]), Fingerprint::of(&[b"a", b"bc"]));
        assert_eq!(Fingerprint::of(&[b"ab", b"c"]), Fingerprint::of(&[b"ab", b"c"]));
        assert_eq!(key("x").as_str().len(), 64);
    }

    #[test]
    fn test_fs_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsArtifactCache::new(dir.path().join("cache")).unwrap();
        let bundle = dir.path().join("bundle.js");
        fs::write(&bundle, "console.log(1)").unwrap();

        let dest = dir.path().join("out.js");
        assert!(!cache.lookup(&key("a"), &dest).unwrap());

        cache.publish(&key("a"), &bundle).unwrap();
        assert!(cache.lookup(&key("a"), &dest).unwrap());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "console.log(1)");
    }

    #[test]
    fn test_fs_cache_evicts_corrupted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsArtifactCache::new(dir.path()).unwrap();
        let bundle = dir.path().join("bundle.js");
        fs::write(&bundle, "good").unwrap();
        cache.publish(&key("a"), &bundle).unwrap();

        let entry = cache.entry_path(&key("a"));
        let mut bytes = fs::read(&entry).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'X';
        fs::write(&entry, bytes).unwrap();

        let dest = dir.path().join("out.js");
        assert!(!cache.lookup(&key("a"), &dest).unwrap());
        assert!(!entry.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_fs_cache_rejects_truncated_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsArtifactCache::new(dir.path()).unwrap();
        fs::write(cache.entry_path(&key("a")), "abc").unwrap();
        assert!(!cache.lookup(&key("a"), &dir.path().join("out")).unwrap());
    }

    #[tokio::test]
    async fn test_store_compiles_once_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Arc::new(MemoryArtifactCache::new()));
        let calls = AtomicUsize::new(0);

        for n in 0..3 {
            let dest = dir.path().join(format!("b{n}.js"));
            let status = store
                .get_or_compile(&key("suite"), &dest, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::fs::write(&dest, "bundle").await.unwrap();
                    Ok(())
                })
                .await
                .unwrap();
            assert_eq!(status, if n == 0 { CacheStatus::Compiled } else { CacheStatus::Hit });
            assert_eq!(fs::read_to_string(&dest).unwrap(), "bundle");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.hits(), 2);
        assert_eq!(store.compiles(), 1);
    }

    #[tokio::test]
    async fn test_store_does_not_cache_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryArtifactCache::new());
        let store = ArtifactStore::new(cache.clone());
        let dest = dir.path().join("b.js");

        let first = store
            .get_or_compile(&key("bad"), &dest, || async { Err(CompileFailure::Rejected { exit_code: Some(1) }) })
            .await;
        assert!(matches!(first, Err(CompileFailure::Rejected { .. })));

        // empty output is a failure too, and still not cached
        let second = store
            .get_or_compile(&key("bad"), &dest, || async {
                tokio::fs::write(&dest, "").await.unwrap();
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(CompileFailure::NoOutput)));
        assert_eq!(cache.len(), 0);
        assert_eq!(store.compiles(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compile_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(Arc::new(MemoryArtifactCache::new())));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for n in 0..4 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            let dest = dir.path().join(format!("c{n}.js"));
            handles.push(tokio::spawn(async move {
                store
                    .get_or_compile(&key("shared"), &dest, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        tokio::fs::write(&dest, "bundle").await.unwrap();
                        Ok(())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_key_locks_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Arc::new(MemoryArtifactCache::new()));

        for n in 0..5 {
            let dest = dir.path().join(format!("k{n}.js"));
            store
                .get_or_compile(&key(&format!("suite-{n}")), &dest, || async {
                    tokio::fs::write(&dest, "bundle").await.unwrap();
                    Ok(())
                })
                .await
                .unwrap();
            assert_eq!(store.inflight_len(), 0);
        }

        // a failed compile releases its lock too
        let dest = dir.path().join("bad.js");
        let failed = store
            .get_or_compile(&key("bad"), &dest, || async { Err(CompileFailure::NoOutput) })
            .await;
        assert!(failed.is_err());
        assert_eq!(store.inflight_len(), 0);
        assert_eq!(store.compiles(), 6);
    }
}
