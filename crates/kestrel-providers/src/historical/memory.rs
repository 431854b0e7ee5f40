//! Historical writer that keeps everything in memory
//!
//! Meant for tests and single-process demos: commits are buffered, flushes
//! move them to the persisted list.

use async_trait::async_trait;
use kestrel_core::{DescriptorLookup, Error, FeatureDescriptor, HistoricalWriter, Result, WriteNotification};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryWriter {
    buffered: Mutex<Vec<WriteNotification>>,
    persisted: Mutex<Vec<WriteNotification>>,
    bound: Mutex<BTreeMap<String, Option<Vec<String>>>>,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything flushed so far, in commit order
    pub fn persisted(&self) -> Vec<WriteNotification> {
        self.persisted.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Committed but not yet flushed
    pub fn buffered(&self) -> Vec<WriteNotification> {
        self.buffered.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Features seen by `bind_feature`, with their set members if any
    pub fn bound(&self) -> BTreeMap<String, Option<Vec<String>>> {
        self.bound.lock().map(|b| b.clone()).unwrap_or_default()
    }

    fn drain(&self, fqn: Option<&str>) -> Result<()> {
        let mut buffered = self.buffered.lock().map_err(|_| Error::writer("buffer lock poisoned"))?;
        let (moved, kept): (Vec<_>, Vec<_>) = buffered
            .drain(..)
            .partition(|wn| fqn.is_none_or(|f| wn.fqn == f));
        *buffered = kept;
        drop(buffered);

        self.persisted
            .lock()
            .map_err(|_| Error::writer("persisted lock poisoned"))?
            .extend(moved);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HistoricalWriter for MemoryWriter {
    async fn commit(&self, notification: WriteNotification) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::writer("writer is closed"));
        }
        self.buffered
            .lock()
            .map_err(|_| Error::writer("buffer lock poisoned"))?
            .push(notification);
        Ok(())
    }

    async fn flush(&self, fqn: &str) -> Result<()> {
        self.drain(Some(fqn))
    }

    async fn flush_all(&self) -> Result<()> {
        self.drain(None)
    }

    async fn close(&self) -> Result<()> {
        self.drain(None)?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn bind_feature(
        &self,
        fd: &FeatureDescriptor,
        feature_set: Option<&[String]>,
        _lookup: &dyn DescriptorLookup,
    ) -> Result<()> {
        self.bound
            .lock()
            .map_err(|_| Error::writer("bound lock poisoned"))?
            .insert(fd.fqn.clone(), feature_set.map(<[String]>::to_vec));
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "memory"
    }
}
