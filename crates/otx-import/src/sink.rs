//! Where converted bundles go.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::bundle::PulseBundle;

#[async_trait::async_trait]
pub trait BundleSink: Send + Sync {
    async fn submit(&self, bundle: &PulseBundle) -> Result<()>;
}

/// One JSON file per pulse, named by pulse id. Resubmitting a pulse replaces
/// its file, so replayed ticks do not duplicate output.
#[derive(Debug, Clone)]
pub struct DirectoryBundleSink {
    dir: PathBuf,
}

impl DirectoryBundleSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, pulse_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(pulse_id)))
    }
}

/// Pulse ids are hex, but nothing guarantees it; keep file names tame. The
/// short digest of the raw id keeps ids that sanitise alike apart.
fn file_stem(pulse_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(pulse_id.as_bytes()));
    let safe: String = pulse_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}-{}", &digest[..12])
}

#[async_trait::async_trait]
impl BundleSink for DirectoryBundleSink {
    async fn submit(&self, bundle: &PulseBundle) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create bundle dir {:?}", self.dir))?;

        let path = self.path_for(&bundle.pulse_id);
        let temp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&bundle.bundle).context("serialize bundle")?;

        let mut f = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("open {:?}", temp_path))?;
        f.write_all(&body)
            .await
            .with_context(|| format!("write {:?}", temp_path))?;
        f.sync_all()
            .await
            .with_context(|| format!("fsync {:?}", temp_path))?;
        drop(f);

        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("rename {:?} -> {:?}", temp_path, path))?;

        tracing::debug!(pulse_id = %bundle.pulse_id, path = %path.display(), "bundle written");
        Ok(())
    }
}

/// Keeps submitted bundles in memory, in submission order.
#[derive(Debug, Default)]
pub struct MemoryBundleSink {
    submitted: Mutex<Vec<PulseBundle>>,
}

impl MemoryBundleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<PulseBundle> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl BundleSink for MemoryBundleSink {
    async fn submit(&self, bundle: &PulseBundle) -> Result<()> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(bundle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn bundle(id: &str, marker: u32) -> PulseBundle {
        PulseBundle {
            pulse_id: id.to_string(),
            modified: Utc::now(),
            bundle: json!({"type": "bundle", "marker": marker}),
            stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn resubmission_overwrites_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryBundleSink::new(dir.path().join("bundles"));

        sink.submit(&bundle("abc123", 1)).await.unwrap();
        sink.submit(&bundle("abc123", 2)).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.path_for("abc123")).unwrap()).unwrap();
        assert_eq!(written["marker"], 2);
    }

    #[test]
    fn hostile_ids_stay_inside_dir() {
        let sink = DirectoryBundleSink::new("/tmp/b");
        let path = sink.path_for("../../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/tmp/b")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("______etc_passwd-"), "{name}");
        assert!(name.ends_with(".json"), "{name}");
    }

    #[tokio::test]
    async fn ids_that_sanitise_alike_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectoryBundleSink::new(dir.path());

        assert_ne!(sink.path_for("a.b"), sink.path_for("a_b"));
        assert_ne!(sink.path_for(""), sink.path_for("_"));

        sink.submit(&bundle("a.b", 1)).await.unwrap();
        sink.submit(&bundle("a_b", 2)).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(entries.len(), 2);
        let first: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.path_for("a.b")).unwrap()).unwrap();
        assert_eq!(first["marker"], 1);
    }
}
