//! otx-audit
//!
//! Audit units ("work") bound the lifetime of one run cycle on the downstream
//! platform: opened before the import, closed with a summary on success.
//!
//! [`WorkLog`] is the file-backed tracker: an append-only JSON Lines log of
//! [`WorkRecord`]s with an optional SHA-256 hash chain. Units opened but never
//! closed stay visible through [`open_units`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Tracker contract
// ---------------------------------------------------------------------------

/// Opaque identifier of one audit unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditUnitId(String);

impl AuditUnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuditUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opens and closes traceable units of work.
///
/// The run cycle calls `open` exactly once per tick, `close` exactly once per
/// successful tick, and `report_error` at most once per failed tick. A unit
/// with a reported error stays open.
#[async_trait::async_trait]
pub trait AuditUnitTracker: Send + Sync {
    async fn open(&self, label: &str) -> Result<AuditUnitId>;

    async fn close(&self, unit: &AuditUnitId, summary: &str) -> Result<()>;

    async fn report_error(&self, unit: &AuditUnitId, message: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Work records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkEventKind {
    Initiated,
    ErrorReported,
    Processed,
}

impl WorkEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkEventKind::Initiated => "initiated",
            WorkEventKind::ErrorReported => "error_reported",
            WorkEventKind::Processed => "processed",
        }
    }
}

/// One line of the work log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub seq: u64,
    pub unit_id: AuditUnitId,
    pub connector_id: String,
    pub ts_utc: DateTime<Utc>,
    pub kind: WorkEventKind,
    /// Label for `initiated`, error text for `error_reported`, summary for `processed`.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_self: Option<String>,
}

impl WorkRecord {
    /// SHA-256 over every field except `hash_self`. Each field is length
    /// prefixed so adjacent fields cannot trade bytes.
    pub fn digest(&self) -> String {
        let ts = self.ts_utc.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        for field in [
            self.unit_id.as_str(),
            self.connector_id.as_str(),
            ts.as_str(),
            self.kind.as_str(),
            self.message.as_str(),
            self.hash_prev.as_deref().unwrap_or(""),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Link to `prev` and stamp `hash_self`.
    fn seal(&mut self, prev: Option<String>) {
        self.hash_prev = prev;
        self.hash_self = Some(self.digest());
    }

    fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        serde_json::from_str(line).with_context(|| format!("parse work record at line {line_no}"))
    }
}

// ---------------------------------------------------------------------------
// WorkLog
// ---------------------------------------------------------------------------

/// Append-only JSONL tracker. One line per record.
///
/// Reopening an existing log resumes the sequence counter and the hash chain
/// from the last line. Only units opened by this instance can be closed or
/// annotated through it; a unit leaves that set once it is closed or has an
/// error reported, so the set never outgrows the in-flight ticks.
pub struct WorkLog {
    path: PathBuf,
    connector_id: String,
    hash_chain: bool,
    state: Mutex<ChainState>,
}

#[derive(Debug, Default)]
struct ChainState {
    last_hash: Option<String>,
    seq: u64,
    in_flight: BTreeMap<AuditUnitId, String>,
}

impl WorkLog {
    /// Creates parent dirs and resumes from the last record of any existing log.
    pub fn open(
        path: impl AsRef<Path>,
        connector_id: impl Into<String>,
        hash_chain: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }

        let mut state = ChainState::default();
        if path.exists() {
            if let Some(line) = read_last_line(&path)? {
                let last = WorkRecord::parse_line(&line, 0)
                    .with_context(|| format!("resume work log {:?}", path))?;
                state.seq = last.seq + 1;
                state.last_hash = last.hash_self;
            }
        }

        Ok(Self {
            path,
            connector_id: connector_id.into(),
            hash_chain,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number the next record will carry.
    pub async fn seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    /// Units opened here that are neither closed nor annotated with an error.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn append(
        &self,
        state: &mut ChainState,
        unit_id: &AuditUnitId,
        kind: WorkEventKind,
        message: &str,
    ) -> Result<()> {
        let mut record = WorkRecord {
            seq: state.seq,
            unit_id: unit_id.clone(),
            connector_id: self.connector_id.clone(),
            ts_utc: Utc::now(),
            kind,
            message: message.to_string(),
            hash_prev: None,
            hash_self: None,
        };
        if self.hash_chain {
            record.seal(state.last_hash.clone());
        }

        let mut line = serde_json::to_string(&record).context("serialize work record")?;
        line.push('\n');
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open work log {:?}", self.path))?;
        f.write_all(line.as_bytes())
            .await
            .context("write work log line failed")?;
        f.flush().await.context("flush work log failed")?;

        // Only advance in-memory state once the line is on disk.
        state.seq += 1;
        if self.hash_chain {
            state.last_hash = record.hash_self;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditUnitTracker for WorkLog {
    async fn open(&self, label: &str) -> Result<AuditUnitId> {
        let unit_id = AuditUnitId::new(format!("work_{}_{}", self.connector_id, Uuid::new_v4()));
        let mut state = self.state.lock().await;
        self.append(&mut state, &unit_id, WorkEventKind::Initiated, label)
            .await?;
        state.in_flight.insert(unit_id.clone(), label.to_string());
        Ok(unit_id)
    }

    async fn close(&self, unit: &AuditUnitId, summary: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_flight.contains_key(unit) {
            bail!("work unit {unit} is not in flight");
        }
        self.append(&mut state, unit, WorkEventKind::Processed, summary)
            .await?;
        state.in_flight.remove(unit);
        Ok(())
    }

    async fn report_error(&self, unit: &AuditUnitId, message: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_flight.contains_key(unit) {
            bail!("work unit {unit} is not in flight");
        }
        self.append(&mut state, unit, WorkEventKind::ErrorReported, message)
            .await?;
        // Stays open in the log; nothing in this process will touch it again.
        state.in_flight.remove(unit);
        Ok(())
    }
}

/// Last non-blank line, read backwards from the end in fixed-size chunks.
fn read_last_line(path: &Path) -> Result<Option<String>> {
    const CHUNK: u64 = 4096;

    let mut f = File::open(path).with_context(|| format!("open work log {:?}", path))?;
    let mut end = f.metadata()?.len();
    let mut tail: Vec<u8> = Vec::new();

    loop {
        let start = end.saturating_sub(CHUNK);
        let mut chunk = vec![0u8; (end - start) as usize];
        f.seek(SeekFrom::Start(start))?;
        f.read_exact(&mut chunk)
            .with_context(|| format!("read work log {:?}", path))?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let content_end = tail
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|i| i + 1)
            .unwrap_or(0);
        let line_start = match tail[..content_end].iter().rposition(|&b| b == b'\n') {
            Some(nl) => Some(nl + 1),
            None if start == 0 => Some(0),
            None => None,
        };
        if let Some(line_start) = line_start {
            if content_end == 0 {
                return Ok(None);
            }
            let line = std::str::from_utf8(&tail[line_start..content_end])
                .with_context(|| format!("work log {:?} ends in invalid UTF-8", path))?;
            return Ok(Some(line.trim().to_string()));
        }
        end = start;
    }
}

// ---------------------------------------------------------------------------
// Reading / inspection
// ---------------------------------------------------------------------------

pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<WorkRecord>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read work log {:?}", path.as_ref()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| WorkRecord::parse_line(line.trim(), i + 1))
        .collect()
}

/// A unit that was initiated and never processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenUnit {
    pub unit_id: AuditUnitId,
    pub label: String,
    pub errors: Vec<String>,
}

/// Units left open in the log at `path`, in initiation order.
pub fn open_units(path: impl AsRef<Path>) -> Result<Vec<OpenUnit>> {
    let mut order: Vec<AuditUnitId> = Vec::new();
    let mut open: BTreeMap<AuditUnitId, OpenUnit> = BTreeMap::new();
    for record in read_records(path)? {
        match record.kind {
            WorkEventKind::Initiated => {
                order.push(record.unit_id.clone());
                open.insert(
                    record.unit_id.clone(),
                    OpenUnit {
                        unit_id: record.unit_id,
                        label: record.message,
                        errors: Vec::new(),
                    },
                );
            }
            WorkEventKind::ErrorReported => {
                if let Some(u) = open.get_mut(&record.unit_id) {
                    u.errors.push(record.message);
                }
            }
            WorkEventKind::Processed => {
                open.remove(&record.unit_id);
            }
        }
    }
    Ok(order.into_iter().filter_map(|id| open.remove(&id)).collect())
}

/// Outcome of walking a work log's hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCheck {
    Intact { records: usize },
    Broken { line: usize, reason: String },
}

pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainCheck> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read work log {:?}", path.as_ref()))?;

    let mut expected_prev: Option<String> = None;
    let mut records = 0usize;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = i + 1;
        let record = WorkRecord::parse_line(line, line_no)?;
        records += 1;

        if record.hash_prev != expected_prev {
            return Ok(ChainCheck::Broken {
                line: line_no,
                reason: format!(
                    "previous-hash link mismatch: expected {:?}, found {:?}",
                    expected_prev, record.hash_prev
                ),
            });
        }
        if let Some(stamped) = &record.hash_self {
            let recomputed = record.digest();
            if *stamped != recomputed {
                return Ok(ChainCheck::Broken {
                    line: line_no,
                    reason: format!("record digest mismatch: stamped {stamped}, recomputed {recomputed}"),
                });
            }
        }
        expected_prev = record.hash_self;
    }

    Ok(ChainCheck::Intact { records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> WorkRecord {
        WorkRecord {
            seq: 0,
            unit_id: AuditUnitId::new("w"),
            connector_id: "c".to_string(),
            ts_utc: Utc::now(),
            kind: WorkEventKind::Initiated,
            message: message.to_string(),
            hash_prev: None,
            hash_self: None,
        }
    }

    #[tokio::test]
    async fn open_close_writes_two_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = WorkLog::open(dir.path().join("work.jsonl"), "alienvault", true).unwrap();

        let unit = log.open("AlienVault run @ 2024-01-01 00:00:00").await.unwrap();
        assert!(unit.as_str().starts_with("work_alienvault_"));
        log.close(&unit, "done").await.unwrap();

        let records = read_records(log.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, WorkEventKind::Initiated);
        assert_eq!(records[1].kind, WorkEventKind::Processed);
        assert_eq!(records[1].message, "done");
        assert_eq!(records[1].hash_prev, records[0].hash_self);
        assert_eq!(log.seq().await, 2);
    }

    #[tokio::test]
    async fn closing_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = WorkLog::open(dir.path().join("work.jsonl"), "c", false).unwrap();
        let unit = log.open("run").await.unwrap();
        log.close(&unit, "ok").await.unwrap();
        assert!(log.close(&unit, "again").await.is_err());
        assert!(log.report_error(&unit, "late").await.is_err());
    }

    #[tokio::test]
    async fn error_report_leaves_unit_open_in_log_but_not_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.jsonl");
        let log = WorkLog::open(&path, "c", true).unwrap();

        for i in 0..5 {
            let unit = log.open(&format!("run {i}")).await.unwrap();
            log.report_error(&unit, "feed unreachable").await.unwrap();
        }
        assert_eq!(log.in_flight().await, 0);

        let open = open_units(&path).unwrap();
        assert_eq!(open.len(), 5);
        assert_eq!(open[0].label, "run 0");
        assert_eq!(open[0].errors, vec!["feed unreachable".to_string()]);
    }

    #[test]
    fn digest_ignores_hash_self_and_covers_message() {
        let base = record("m");
        let mut stamped = base.clone();
        stamped.hash_self = Some("anything".to_string());
        assert_eq!(base.digest(), stamped.digest());
        assert_ne!(base.digest(), record("m2").digest());
    }

    #[test]
    fn digest_survives_json_round_trip() {
        let mut r = record("label");
        r.seal(Some("abc".to_string()));
        let back: WorkRecord =
            serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(back.digest(), r.hash_self.unwrap());
    }

    #[test]
    fn last_line_is_found_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        std::fs::write(&path, "").unwrap();
        assert_eq!(read_last_line(&path).unwrap(), None);

        std::fs::write(&path, "only\n\n").unwrap();
        assert_eq!(read_last_line(&path).unwrap().as_deref(), Some("only"));

        let long = "x".repeat(10_000);
        std::fs::write(&path, format!("first\n{long}\n")).unwrap();
        assert_eq!(read_last_line(&path).unwrap(), Some(long));
    }
}
