//! Local filesystem historical writer
//!
//! Appends every committed value as one JSON line, partitioned by feature,
//! day and bucket liveness:
//!
//! ```text
//! /data/kestrel/historical/
//!   ├─ user.clicks/
//!   │   ├─ _schema.json
//!   │   ├─ 2024-05-01/
//!   │   │   ├─ alive.jsonl      (non-windowed values and alive buckets)
//!   │   │   └─ dead.jsonl       (final values of closed buckets)
//!   │   └─ 2024-05-02/
//!   └─ user.profile/
//! ```
//!
//! Commits are buffered per feature; nothing reaches the disk before a flush.

use async_trait::async_trait;
use kestrel_core::{DescriptorLookup, Error, FeatureDescriptor, HistoricalWriter, Result, WriteNotification};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalWriterConfig {
    /// Base directory, created if missing
    pub path: PathBuf,
}

impl Default for LocalWriterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".kestrel/historical"),
        }
    }
}

#[derive(Debug, Serialize)]
struct SchemaFile<'a> {
    feature: &'a FeatureDescriptor,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    members: Vec<FeatureDescriptor>,
}

pub struct LocalWriter {
    base_path: PathBuf,
    buffers: Mutex<HashMap<String, Vec<WriteNotification>>>,
    closed: AtomicBool,
}

impl LocalWriter {
    pub fn new(config: LocalWriterConfig) -> Result<Self> {
        let base_path = config.path;
        std::fs::create_dir_all(&base_path).map_err(|e| {
            Error::writer(format!(
                "failed to create base directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(Self {
            base_path,
            buffers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File a notification is appended to
    fn partition_path(&self, wn: &WriteNotification) -> PathBuf {
        let day = wn
            .value
            .as_ref()
            .map(|v| v.timestamp.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "undated".to_string());
        let file = if wn.is_dead_bucket() { "dead.jsonl" } else { "alive.jsonl" };
        self.base_path.join(&wn.fqn).join(day).join(file)
    }

    fn take(&self, fqn: Option<&str>) -> Result<Vec<WriteNotification>> {
        let mut buffers = self.buffers.lock().map_err(|_| Error::writer("buffer lock poisoned"))?;
        Ok(match fqn {
            Some(f) => buffers.remove(f).unwrap_or_default(),
            None => buffers.drain().flat_map(|(_, v)| v).collect(),
        })
    }

    fn restore(&self, pending: Vec<WriteNotification>) {
        if let Ok(mut buffers) = self.buffers.lock() {
            for wn in pending {
                buffers.entry(wn.fqn.clone()).or_default().push(wn);
            }
        }
    }

    async fn write_out(&self, pending: Vec<WriteNotification>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut files: BTreeMap<PathBuf, Vec<u8>> = BTreeMap::new();
        for wn in &pending {
            let buf = files.entry(self.partition_path(wn)).or_default();
            serde_json::to_writer(&mut *buf, wn)?;
            buf.push(b'\n');
        }

        let count = pending.len();
        for (path, bytes) in files {
            if let Err(e) = append(&path, &bytes).await {
                // keep the batch for the next flush
                self.restore(pending);
                return Err(e);
            }
        }
        tracing::debug!(records = count, "historical flush complete");
        Ok(())
    }
}

async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            Error::writer(format!("failed to create directory '{}': {}", parent.display(), e))
        })?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::writer(format!("failed to open '{}': {}", path.display(), e)))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::writer(format!("failed to write '{}': {}", path.display(), e)))?;
    file.sync_all()
        .await
        .map_err(|e| Error::writer(format!("failed to sync '{}': {}", path.display(), e)))?;
    Ok(())
}

#[async_trait]
impl HistoricalWriter for LocalWriter {
    async fn commit(&self, notification: WriteNotification) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::writer("writer is closed"));
        }
        self.buffers
            .lock()
            .map_err(|_| Error::writer("buffer lock poisoned"))?
            .entry(notification.fqn.clone())
            .or_default()
            .push(notification);
        Ok(())
    }

    async fn flush(&self, fqn: &str) -> Result<()> {
        let pending = self.take(Some(fqn))?;
        self.write_out(pending).await
    }

    async fn flush_all(&self) -> Result<()> {
        let pending = self.take(None)?;
        self.write_out(pending).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.flush_all().await
    }

    async fn bind_feature(
        &self,
        fd: &FeatureDescriptor,
        feature_set: Option<&[String]>,
        lookup: &dyn DescriptorLookup,
    ) -> Result<()> {
        let members = feature_set
            .unwrap_or_default()
            .iter()
            .map(|m| lookup.descriptor(m))
            .collect::<Result<Vec<_>>>()?;

        let dir = self.base_path.join(&fd.fqn);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::writer(format!("failed to create directory '{}': {}", dir.display(), e)))?;
        let schema = serde_json::to_vec_pretty(&SchemaFile { feature: fd, members })?;
        let path = dir.join("_schema.json");
        fs::write(&path, schema)
            .await
            .map_err(|e| Error::writer(format!("failed to write '{}': {}", path.display(), e)))?;

        tracing::debug!(fqn = %fd.fqn, path = %path.display(), "bound historical feature");
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kestrel_core::{Payload, Primitive, Value};
    use tempfile::TempDir;

    struct NoMembers;

    impl DescriptorLookup for NoMembers {
        fn descriptor(&self, fqn: &str) -> Result<FeatureDescriptor> {
            Ok(FeatureDescriptor::new(fqn, Primitive::Int))
        }
    }

    fn writer(dir: &TempDir) -> LocalWriter {
        LocalWriter::new(LocalWriterConfig {
            path: dir.path().to_path_buf(),
        })
        .unwrap()
    }

    fn wn(fqn: &str, bucket: &str, active: bool) -> WriteNotification {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        WriteNotification::new(fqn, "e1", Value::new(Payload::from(2.0), ts)).with_bucket(bucket, active)
    }

    #[tokio::test]
    async fn test_nothing_written_before_flush() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        w.commit(wn("ns.a", "", false)).await.unwrap();
        assert!(!dir.path().join("ns.a").exists());

        w.flush("ns.a").await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("ns.a/2024-05-01/alive.jsonl")).unwrap();
        let back: WriteNotification = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(back, wn("ns.a", "", false));
    }

    #[tokio::test]
    async fn test_partitions_dead_buckets() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        w.commit(wn("ns.b", "1a", true)).await.unwrap();
        w.commit(wn("ns.b", "19", false)).await.unwrap();
        w.commit(wn("ns.b", "18", false)).await.unwrap();
        w.flush_all().await.unwrap();

        let dead = std::fs::read_to_string(dir.path().join("ns.b/2024-05-01/dead.jsonl")).unwrap();
        assert_eq!(dead.lines().count(), 2);
        let alive = std::fs::read_to_string(dir.path().join("ns.b/2024-05-01/alive.jsonl")).unwrap();
        assert_eq!(alive.lines().count(), 1);

        // a second flush appends
        w.commit(wn("ns.b", "17", false)).await.unwrap();
        w.flush("ns.b").await.unwrap();
        let dead = std::fs::read_to_string(dir.path().join("ns.b/2024-05-01/dead.jsonl")).unwrap();
        assert_eq!(dead.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_bind_writes_schema_with_members() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        let fd = FeatureDescriptor::new("ns.set", Primitive::Headless);
        let members = vec!["ns.a".to_string(), "ns.b".to_string()];
        w.bind_feature(&fd, Some(&members), &NoMembers).await.unwrap();

        let schema: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("ns.set/_schema.json")).unwrap()).unwrap();
        assert_eq!(schema["feature"]["fqn"], "ns.set");
        assert_eq!(schema["members"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_commits() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        w.commit(wn("ns.a", "", false)).await.unwrap();
        w.close().await.unwrap();
        assert!(dir.path().join("ns.a/2024-05-01/alive.jsonl").exists());
        assert!(matches!(
            w.commit(wn("ns.a", "", false)).await,
            Err(Error::WriterUnavailable(_))
        ));
    }
}
