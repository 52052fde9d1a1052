use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info};

use crate::json;
use crate::model::RawRecord;

/// Where partial ingestion output lives between runs.
pub trait CheckpointStore {
    /// Prior results; empty when nothing was saved yet.
    fn load(&self) -> Result<Vec<RawRecord>>;
    /// Replace the stored results with `records`.
    fn save(&mut self, records: &[RawRecord]) -> Result<()>;
}

/// JSON array of records on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

impl CheckpointStore for JsonFileStore {
    fn load(&self) -> Result<Vec<RawRecord>> {
        json::load_or_default(&self.path)
    }

    fn save(&mut self, records: &[RawRecord]) -> Result<()> {
        json::save(&self.path, records)
    }
}

/// Accumulated results plus the flush cadence.
pub struct Checkpoint<S: CheckpointStore> {
    store: S,
    records: Vec<RawRecord>,
    every: usize,
}

impl<S: CheckpointStore> Checkpoint<S> {
    pub fn open(store: S, every: usize) -> Result<Self> {
        let records = store.load()?;
        if !records.is_empty() {
            info!(records = records.len(), "Resuming from checkpoint");
        }
        Ok(Checkpoint {
            store,
            records,
            every: every.max(1),
        })
    }

    /// Locators that already have a result.
    pub fn processed(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.url.as_str()).collect()
    }

    pub fn push(&mut self, record: RawRecord) {
        self.records.push(record);
    }

    /// True after every `every`-th item processed in this run.
    pub fn should_flush(&self, count: usize) -> bool {
        count > 0 && count % self.every == 0
    }

    pub fn persist(&mut self) -> Result<()> {
        self.store.save(&self.records)?;
        debug!(records = self.records.len(), "Checkpoint saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
impl<S: CheckpointStore> Checkpoint<S> {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }
}

/// In-memory store that counts writes.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    pub saved: Vec<RawRecord>,
    pub writes: usize,
}

#[cfg(test)]
impl CheckpointStore for MemoryStore {
    fn load(&self) -> Result<Vec<RawRecord>> {
        Ok(self.saved.clone())
    }

    fn save(&mut self, records: &[RawRecord]) -> Result<()> {
        self.saved = records.to_vec();
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
impl CheckpointStore for &mut MemoryStore {
    fn load(&self) -> Result<Vec<RawRecord>> {
        (**self).load()
    }

    fn save(&mut self, records: &[RawRecord]) -> Result<()> {
        (**self).save(records)
    }
}
