//! Two-tier computation cache: a memory tier (`DashMap`) in front of an
//! optional durable tier that stores one JSON blob per (node id, fingerprint)
//! plus a metadata sidecar, under a configurable directory.
//!
//! TTL semantics: `None` never expires during the process lifetime; a zero
//! TTL is never valid because validity is `elapsed < ttl`. All expiry checks
//! go through an injectable [`Clock`] so tests can simulate time.

use crate::core::errors::{LazyflowError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Time source for TTL checks
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic expiry tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<std::sync::RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::RwLock::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).expect("duration out of range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("clock lock poisoned")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    node_id: String,
    fingerprint: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_valid(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> bool {
        let Some(ttl) = ttl else {
            return true; // no TTL: valid for the process lifetime
        };
        let elapsed = now.signed_duration_since(self.created_at);
        if elapsed < chrono::Duration::zero() {
            return true;
        }
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => elapsed < ttl,
            Err(_) => true, // TTL too large to represent: effectively unbounded
        }
    }
}

/// Sidecar metadata persisted next to each durable entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    node_id: String,
    fingerprint: String,
    created_at: DateTime<Utc>,
    ttl_secs: Option<f64>,
}

/// Outcome of a cache lookup. A miss is an ordinary value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Value),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Hit(v) => Some(v),
            Self::Miss => None,
        }
    }
}

/// Cache observability counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub disk_entries: Option<usize>,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Rough estimation of JSON memory usage
fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 8,
        Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 24,
        Value::Array(arr) => arr.iter().map(estimate_size).sum::<usize>() + 24,
        Value::Object(obj) => {
            obj.iter()
                .map(|(k, v)| k.len() + estimate_size(v))
                .sum::<usize>()
                + 24
        }
    }
}

/// Durable tier: one `<stem>.json` blob and `<stem>.meta.json` sidecar per
/// entry. Writes go through a temp file and `rename` so a partially written
/// blob is never read as a valid entry.
#[derive(Debug)]
struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| LazyflowError::persistence("create cache directory", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn stem(key: &CacheKey) -> String {
        // node ids are arbitrary strings; hash them into a safe file name
        let id_hash = blake3::hash(key.node_id.as_bytes()).to_hex();
        format!("{}-{}", &id_hash.as_str()[..16], key.fingerprint)
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(key)))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::stem(key)))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| LazyflowError::persistence("write cache entry", e))?;
        fs::rename(&tmp, path).map_err(|e| LazyflowError::persistence("commit cache entry", e))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        let blob = serde_json::to_vec(&entry.value)
            .map_err(|e| LazyflowError::persistence("serialize cache value", e))?;
        let meta = EntryMeta {
            node_id: key.node_id.clone(),
            fingerprint: key.fingerprint.clone(),
            created_at: entry.created_at,
            ttl_secs: ttl.map(|d| d.as_secs_f64()),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| LazyflowError::persistence("serialize cache metadata", e))?;
        // blob first: a sidecar without a blob is ignored on load, the
        // reverse would look like a valid entry with no metadata
        self.write_atomic(&self.blob_path(key), &blob)?;
        self.write_atomic(&self.meta_path(key), &meta_bytes)?;
        Ok(())
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let meta_path = self.meta_path(key);
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta_bytes = fs::read(&meta_path)
            .map_err(|e| LazyflowError::persistence("read cache metadata", e))?;
        let meta: EntryMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| LazyflowError::persistence("decode cache metadata", e))?;
        if meta.node_id != key.node_id || meta.fingerprint != key.fingerprint {
            // hash-prefix collision between two node ids; treat as absent
            return Ok(None);
        }
        let blob = match fs::read(self.blob_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LazyflowError::persistence("read cache entry", e)),
        };
        let value: Value = serde_json::from_slice(&blob)
            .map_err(|e| LazyflowError::persistence("decode cache value", e))?;
        Ok(Some(CacheEntry {
            value,
            created_at: meta.created_at,
        }))
    }

    fn remove(&self, key: &CacheKey) {
        let _ = fs::remove_file(self.blob_path(key));
        let _ = fs::remove_file(self.meta_path(key));
    }

    /// Remove every entry whose sidecar names `node_id`
    fn remove_node(&self, node_id: &str) -> Result<()> {
        for meta in self.metas()? {
            if meta.node_id == node_id {
                self.remove(&CacheKey {
                    node_id: meta.node_id,
                    fingerprint: meta.fingerprint,
                });
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| LazyflowError::persistence("list cache directory", e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json" || e == "tmp").unwrap_or(false) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn metas(&self) -> Result<Vec<EntryMeta>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| LazyflowError::persistence("list cache directory", e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.ends_with(".meta.json") {
                continue;
            }
            match fs::read(&path).ok().and_then(|b| serde_json::from_slice(&b).ok()) {
                Some(meta) => out.push(meta),
                None => warn!(path = %path.display(), "skipping unreadable cache sidecar"),
            }
        }
        Ok(out)
    }

    fn entry_count(&self) -> Option<usize> {
        self.metas().ok().map(|m| m.len())
    }
}

/// Two-tier TTL cache for computation results
#[derive(Debug)]
pub struct ComputationCache {
    memory: DashMap<CacheKey, CacheEntry>,
    disk: Option<DiskStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ComputationCache {
    /// Ephemeral cache, memory tier only
    pub fn in_memory() -> Self {
        Self {
            memory: DashMap::new(),
            disk: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    /// Cache with a durable tier under `dir` (created if absent)
    pub fn persistent<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let disk = DiskStore::open(dir.as_ref())?;
        Ok(Self {
            memory: DashMap::new(),
            disk: Some(disk),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source (tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Look up a result. Memory tier first; a disk hit is promoted into
    /// memory. Expired entries are evicted and reported as misses.
    pub fn get(&self, node_id: &str, fingerprint: &str, ttl: Option<Duration>) -> CacheLookup {
        let key = CacheKey {
            node_id: node_id.to_string(),
            fingerprint: fingerprint.to_string(),
        };
        let now = self.clock.now();

        if let Some(entry) = self.memory.get(&key) {
            if entry.is_valid(now, ttl) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(entry.value.clone());
            }
            drop(entry);
            debug!(node_id, "memory cache entry expired");
            self.memory.remove(&key);
            if let Some(disk) = &self.disk {
                disk.remove(&key);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Miss;
        }

        if let Some(disk) = &self.disk {
            match disk.load(&key) {
                Ok(Some(entry)) => {
                    if entry.is_valid(now, ttl) {
                        debug!(node_id, "disk cache hit, promoting to memory");
                        self.memory.insert(key, entry.clone());
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return CacheLookup::Hit(entry.value);
                    }
                    disk.remove(&key);
                }
                Ok(None) => {}
                Err(e) => {
                    // degrade to a miss rather than failing the evaluation
                    warn!(node_id, error = %e, "disk cache read failed");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss
    }

    /// Store a result. The memory tier is updated first and survives any
    /// durable-tier failure, which is surfaced as `CachePersistence`.
    pub fn set(
        &self,
        node_id: &str,
        fingerprint: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = CacheKey {
            node_id: node_id.to_string(),
            fingerprint: fingerprint.to_string(),
        };
        let entry = CacheEntry {
            value,
            created_at: self.clock.now(),
        };
        self.memory.insert(key.clone(), entry.clone());
        if let Some(disk) = &self.disk {
            disk.store(&key, &entry, ttl)?;
        }
        Ok(())
    }

    /// Drop all entries for `node_id`, across all fingerprints and both tiers
    pub fn invalidate(&self, node_id: &str) {
        self.memory.retain(|key, _| key.node_id != node_id);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove_node(node_id) {
                warn!(node_id, error = %e, "disk cache invalidation failed");
            }
        }
        debug!(node_id, "cache invalidated");
    }

    /// Empty both tiers. Counters are preserved.
    pub fn clear_all(&self) {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.clear() {
                warn!(error = %e, "disk cache clear failed");
            }
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        let memory_bytes = self
            .memory
            .iter()
            .map(|entry| estimate_size(&entry.value().value))
            .sum();
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            memory_bytes,
            disk_entries: self.disk.as_ref().and_then(|d| d.entry_count()),
        }
    }
}
