//! Content-hash cache around node invocations.
//!
//! Keys are SHA-256 digests of `{flow_id, tool, args}` with framework-injected
//! arguments (names starting with `__`) left out, so the same call made from
//! different lines hashes identically. Writes are last-write-wins and never
//! fail the node that produced them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::contracts::RunInfo;
use crate::error::{Error, Result};

/// Prefix of argument names injected by the framework rather than the flow.
pub const INJECTED_ARG_PREFIX: &str = "__";

/// Hash key of one cacheable invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub hash_id: String,
    /// Canonical JSON the hash was computed from.
    pub cache_string: String,
}

/// A cached node result and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub hash_id: String,
    pub cached_run_id: String,
    pub cached_flow_run_id: String,
    pub flow_id: String,
    pub cache_string: String,
    pub result: Value,
    pub end_time: DateTime<Utc>,
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Miss,
    Hit {
        cached_run_id: String,
        cached_flow_run_id: String,
        result: Value,
    },
}

/// Backing store for cache records.
pub trait CacheStore: Send + Sync {
    fn get(&self, hash_id: &str) -> Result<Option<CacheRecord>>;

    fn put(&self, record: CacheRecord) -> Result<()>;
}

/// Store local to one process.
#[derive(Default)]
pub struct MemoryCacheStore {
    records: RwLock<FxHashMap<String, CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, hash_id: &str) -> Result<Option<CacheRecord>> {
        Ok(self.records.read().get(hash_id).cloned())
    }

    fn put(&self, record: CacheRecord) -> Result<()> {
        self.records.write().insert(record.hash_id.clone(), record);
        Ok(())
    }
}

/// One JSON file per hash under a directory, shareable between processes.
///
/// Records are written to a temporary file and renamed into place so a
/// concurrent reader sees either the old record or the new one.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, hash_id: &str) -> PathBuf {
        self.dir.join(format!("{hash_id}.json"))
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, hash_id: &str) -> Result<Option<CacheRecord>> {
        let path = self.record_path(hash_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Cache(format!("corrupt record {}: {e}", path.display())))?;
        Ok(Some(record))
    }

    fn put(&self, record: CacheRecord) -> Result<()> {
        let bytes = serde_json::to_vec(&record)?;
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", record.hash_id, uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, self.record_path(&record.hash_id))?;
        Ok(())
    }
}

/// Hashing, lookups and writes for cacheable nodes.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// Deterministic key for invoking `tool` with `args` inside `flow_id`.
    pub fn calculate_cache_info(flow_id: &str, tool: &str, args: &Map<String, Value>) -> CacheInfo {
        let stable_args: Map<String, Value> = args
            .iter()
            .filter(|(name, _)| !name.starts_with(INJECTED_ARG_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        // serde_json maps are ordered, so the rendering is canonical.
        let cache_string = json!({
            "flow_id": flow_id,
            "tool": tool,
            "args": stable_args,
        })
        .to_string();
        let hash_id = hex::encode(Sha256::digest(cache_string.as_bytes()));
        CacheInfo {
            hash_id,
            cache_string,
        }
    }

    /// Look up a previous result. Store failures count as a miss.
    pub fn get_cache_result(&self, info: &CacheInfo) -> CacheLookup {
        match self.store.get(&info.hash_id) {
            Ok(Some(record)) => CacheLookup::Hit {
                cached_run_id: record.cached_run_id,
                cached_flow_run_id: record.cached_flow_run_id,
                result: record.result,
            },
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                tracing::warn!(hash_id = %info.hash_id, error = %e, "Failed to read cache record");
                CacheLookup::Miss
            }
        }
    }

    /// Store the result of a completed node run.
    pub fn persist_result(&self, run_info: &RunInfo, info: &CacheInfo, flow_id: &str) -> Result<()> {
        if info.hash_id.is_empty() {
            return Ok(());
        }
        let record = CacheRecord {
            hash_id: info.hash_id.clone(),
            cached_run_id: run_info.run_id.clone(),
            cached_flow_run_id: run_info.parent_run_id.clone(),
            flow_id: flow_id.to_string(),
            cache_string: info.cache_string.clone(),
            result: run_info.output.clone().unwrap_or(Value::Null),
            end_time: run_info.end_time.unwrap_or_else(Utc::now),
        };
        self.store.put(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn finished_run(output: Value) -> RunInfo {
        let mut info = RunInfo::new("square", "run", "run_square_0", "run_0", Some(0));
        info.output = Some(output);
        info.end_time = Some(Utc::now());
        info
    }

    #[test]
    fn test_hash_ignores_injected_args() {
        let a = CacheManager::calculate_cache_info(
            "flow",
            "square",
            &args(&[("x", json!(3)), ("__line_index", json!(0))]),
        );
        let b = CacheManager::calculate_cache_info(
            "flow",
            "square",
            &args(&[("__line_index", json!(7)), ("x", json!(3))]),
        );
        assert_eq!(a, b);
        assert_eq!(a.hash_id.len(), 64);
    }

    #[test]
    fn test_hash_depends_on_flow_tool_and_args() {
        let base = CacheManager::calculate_cache_info("flow", "square", &args(&[("x", json!(3))]));
        let other_arg = CacheManager::calculate_cache_info("flow", "square", &args(&[("x", json!(4))]));
        let other_tool = CacheManager::calculate_cache_info("flow", "cube", &args(&[("x", json!(3))]));
        let other_flow = CacheManager::calculate_cache_info("other", "square", &args(&[("x", json!(3))]));
        assert_ne!(base.hash_id, other_arg.hash_id);
        assert_ne!(base.hash_id, other_tool.hash_id);
        assert_ne!(base.hash_id, other_flow.hash_id);
    }

    #[test]
    fn test_memory_roundtrip_and_overwrite() {
        let manager = CacheManager::in_memory();
        let info = CacheManager::calculate_cache_info("flow", "square", &args(&[("x", json!(3))]));
        assert_eq!(manager.get_cache_result(&info), CacheLookup::Miss);

        manager.persist_result(&finished_run(json!(9)), &info, "flow").unwrap();
        manager.persist_result(&finished_run(json!(10)), &info, "flow").unwrap();

        match manager.get_cache_result(&info) {
            CacheLookup::Hit {
                cached_run_id,
                cached_flow_run_id,
                result,
            } => {
                assert_eq!(cached_run_id, "run_square_0");
                assert_eq!(cached_flow_run_id, "run_0");
                assert_eq!(result, json!(10));
            }
            CacheLookup::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn test_empty_hash_is_not_persisted() {
        let store = Arc::new(MemoryCacheStore::new());
        let manager = CacheManager::new(store.clone());
        let info = CacheInfo {
            hash_id: String::new(),
            cache_string: String::new(),
        };
        manager.persist_result(&finished_run(json!(1)), &info, "flow").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_shared_between_managers() {
        let temp = TempDir::new().unwrap();
        let writer = CacheManager::new(Arc::new(FileCacheStore::new(temp.path()).unwrap()));
        let reader = CacheManager::new(Arc::new(FileCacheStore::new(temp.path()).unwrap()));
        let info = CacheManager::calculate_cache_info("flow", "square", &args(&[("x", json!(2))]));

        writer.persist_result(&finished_run(json!(4)), &info, "flow").unwrap();
        assert!(matches!(
            reader.get_cache_result(&info),
            CacheLookup::Hit { result, .. } if result == json!(4)
        ));
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = FileCacheStore::new(temp.path()).unwrap();
        let info = CacheManager::calculate_cache_info("flow", "square", &args(&[]));
        fs::write(store.dir().join(format!("{}.json", info.hash_id)), b"{not json").unwrap();
        let manager = CacheManager::new(Arc::new(store));
        assert_eq!(manager.get_cache_result(&info), CacheLookup::Miss);
    }
}
