//! otx-checkpoint
//!
//! Durable key/value state carried between run cycles.
//!
//! # Contract
//! - A checkpoint is read once at the start of a tick and written at most once,
//!   only when the tick completed. The write is the single commit point.
//! - Merging is shallow and non-destructive: keys the importer does not return
//!   are kept as-is; `last_run` is always stamped last so the importer cannot
//!   override it.
//! - Stores replace the whole mapping on write; there is no partial update.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// String-keyed mapping of JSON values. Key order is stable (sorted) so the
/// persisted file diffs cleanly between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(BTreeMap<String, Value>);

impl Checkpoint {
    /// Epoch seconds of the most recent completed cycle.
    pub const LAST_RUN: &'static str = "last_run";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn last_run(&self) -> Option<i64> {
        self.0.get(Self::LAST_RUN).and_then(Value::as_i64)
    }

    /// Copy of `self` with every key of `partial` overwritten, then
    /// `last_run` set to `last_run`.
    pub fn merged(&self, partial: &Checkpoint, last_run: i64) -> Checkpoint {
        let mut next = self.0.clone();
        for (k, v) in partial.iter() {
            next.insert(k.clone(), v.clone());
        }
        next.insert(Self::LAST_RUN.to_string(), Value::from(last_run));
        Checkpoint(next)
    }

    /// Decode from a JSON object. Anything else is rejected so a corrupted
    /// state file is reported instead of silently treated as empty.
    pub fn from_json(v: Value) -> Result<Self> {
        match v {
            Value::Object(map) => Ok(Checkpoint(map.into_iter().collect())),
            Value::Null => Ok(Checkpoint::new()),
            other => Err(anyhow!(
                "checkpoint must be a JSON object, got {}",
                short_kind(&other)
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Checkpoint(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Checkpoint {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Checkpoint(map)
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn short_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Process-external durable state. Single writer: the run cycle.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Replace the persisted checkpoint wholesale.
    async fn store(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// In-process store. Used for tests and dry runs; counts writes so callers can
/// prove "no write happened".
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    current: Option<Checkpoint>,
    writes: u64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                current: Some(checkpoint),
                writes: 0,
            }),
        }
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.lock().current.clone()
    }

    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Poison is ignored; the guarded data is a plain value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.lock().current.clone())
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.lock();
        inner.current = Some(checkpoint.clone());
        inner.writes += 1;
        Ok(())
    }
}

/// Checkpoint persisted as a pretty JSON object on disk.
///
/// Writes go to `<path>.tmp`, are fsynced, then renamed over `<path>`, so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read checkpoint {:?}", self.path))
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let v: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse checkpoint {:?}", self.path))?;
        let cp = Checkpoint::from_json(v).with_context(|| format!("decode {:?}", self.path))?;
        Ok(Some(cp))
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            bail!("checkpoint path is empty");
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }

        let body = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
        let temp_path = self.temp_path();
        let mut f = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("open {:?}", temp_path))?;
        f.write_all(body.as_bytes())
            .await
            .with_context(|| format!("write {:?}", temp_path))?;
        f.write_all(b"\n").await?;
        f.sync_all()
            .await
            .with_context(|| format!("sync {:?}", temp_path))?;
        drop(f);

        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("rename {:?} -> {:?}", temp_path, self.path))?;
        Ok(())
    }
}
