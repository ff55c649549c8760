// =============================================================================
// Storage facade — atomic read-modify-write over named JSON collections
// =============================================================================
//
// Each collection is a JSON-encoded ordered sequence persisted as one file
// under the data directory. Guarantees:
//   - atomic read-modify-write per named collection (per-collection async
//     mutex; the closure sees a snapshot and its result replaces it),
//   - atomic file persistence via the tmp + rename pattern,
//   - identifiers lower-cased on read,
//   - bounded lock-acquisition timeout and bounded retry with exponential
//     backoff when a writer reports a conflict.
//
// No multi-collection transactions: every invariant lives within a single
// collection or is re-checked on read by the caller.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// Collection names. Fixed at startup; unknown names are a programming error
/// surfaced as `CoreError::Storage`.
pub mod collections {
    pub const SECTORS: &str = "sectors";
    pub const AGENTS: &str = "agents";
    pub const DISCUSSIONS: &str = "discussions";
    pub const EXECUTION_LOGS: &str = "executionLogs";
    pub const USER_ACCOUNT: &str = "userAccount";
    pub const SIMULATION_RULES: &str = "simulation_rules";

    pub const ALL: [&str; 6] = [
        SECTORS,
        AGENTS,
        DISCUSSIONS,
        EXECUTION_LOGS,
        USER_ACCOUNT,
        SIMULATION_RULES,
    ];
}

/// Base delay for the conflict-retry backoff.
const RETRY_BASE_DELAY_MS: u64 = 25;

pub struct KeyedStore {
    dir: PathBuf,
    /// Bound on waiting for a collection lock.
    op_timeout: Duration,
    /// Attempts for a conflicting `update` closure before giving up.
    retry_attempts: u32,
    collections: HashMap<&'static str, Arc<Mutex<Vec<Value>>>>,
}

impl KeyedStore {
    /// Open the store rooted at `dir`, loading every known collection file.
    /// Missing files start as empty collections.
    pub fn open(
        dir: impl AsRef<Path>,
        op_timeout: Duration,
        retry_attempts: u32,
    ) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::Storage(format!("create data dir {}: {e}", dir.display())))?;

        let mut collections = HashMap::new();
        for name in collections::ALL {
            let values = load_collection(&dir, name)?;
            collections.insert(name, Arc::new(Mutex::new(values)));
        }

        info!(dir = %dir.display(), "keyed store opened");
        Ok(Self {
            dir,
            op_timeout,
            retry_attempts,
            collections,
        })
    }

    fn collection(&self, name: &str) -> CoreResult<Arc<Mutex<Vec<Value>>>> {
        self.collections
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::Storage(format!("unknown collection '{name}'")))
    }

    /// Read a typed snapshot of a collection.
    pub async fn read<T: DeserializeOwned>(&self, name: &str) -> CoreResult<Vec<T>> {
        let coll = self.collection(name)?;
        let guard = tokio::time::timeout(self.op_timeout, coll.lock())
            .await
            .map_err(|_| CoreError::StorageConflict {
                collection: name.to_string(),
            })?;
        decode(name, &guard)
    }

    /// Atomic read-modify-write on a collection.
    ///
    /// The closure receives the decoded sequence and may mutate it freely; if
    /// it returns `Ok`, the mutated sequence replaces the collection and is
    /// persisted atomically. If it returns `Err`, nothing is written.
    ///
    /// A closure returning `StorageConflict` is retried with exponential
    /// backoff up to the configured attempt count.
    pub async fn update<T, R, F>(&self, name: &str, mut f: F) -> CoreResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut Vec<T>) -> CoreResult<R>,
    {
        let coll = self.collection(name)?;

        let mut attempt = 0u32;
        loop {
            let mut guard = tokio::time::timeout(self.op_timeout, coll.lock())
                .await
                .map_err(|_| CoreError::StorageConflict {
                    collection: name.to_string(),
                })?;

            let mut typed: Vec<T> = decode(name, &guard)?;
            match f(&mut typed) {
                Ok(result) => {
                    let encoded: Vec<Value> = typed
                        .iter()
                        .map(serde_json::to_value)
                        .collect::<Result<_, _>>()
                        .map_err(|e| CoreError::Storage(format!("encode '{name}': {e}")))?;
                    persist(&self.dir, name, &encoded)?;
                    *guard = encoded;
                    return Ok(result);
                }
                Err(CoreError::StorageConflict { .. }) if attempt < self.retry_attempts => {
                    drop(guard);
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt.min(6));
                    debug!(collection = name, attempt, delay_ms = delay, "storage conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for KeyedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStore")
            .field("dir", &self.dir)
            .field("collections", &self.collections.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

fn collection_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn load_collection(dir: &Path, name: &str) -> CoreResult<Vec<Value>> {
    let path = collection_path(dir, name);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| CoreError::Storage(format!("read {}: {e}", path.display())))?;
    let parsed: Value = serde_json::from_str(&content)
        .map_err(|e| CoreError::Storage(format!("parse {}: {e}", path.display())))?;

    let mut values = match parsed {
        Value::Array(items) => items,
        other => {
            warn!(collection = name, "collection file was not an array, resetting");
            let _ = other;
            Vec::new()
        }
    };

    for value in &mut values {
        lowercase_id(value);
    }

    debug!(collection = name, count = values.len(), "collection loaded");
    Ok(values)
}

fn persist(dir: &Path, name: &str, values: &[Value]) -> CoreResult<()> {
    let path = collection_path(dir, name);
    let content = serde_json::to_string_pretty(&Value::Array(values.to_vec()))
        .map_err(|e| CoreError::Storage(format!("serialize '{name}': {e}")))?;

    // Atomic write: tmp sibling, then rename.
    let tmp_path = dir.join(format!("{name}.json.tmp"));
    std::fs::write(&tmp_path, &content)
        .map_err(|e| CoreError::Storage(format!("write {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, &path)
        .map_err(|e| CoreError::Storage(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

fn decode<T: DeserializeOwned>(name: &str, values: &[Value]) -> CoreResult<Vec<T>> {
    values
        .iter()
        .map(|v| serde_json::from_value(v.clone()))
        .collect::<Result<_, _>>()
        .map_err(|e| CoreError::Storage(format!("decode '{name}': {e}")))
}

/// Identifiers are lower-cased on read so lookups never depend on the casing
/// a client supplied.
fn lowercase_id(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        if let Some(Value::String(id)) = obj.get_mut("id") {
            *id = id.to_lowercase();
        }
    }
}
