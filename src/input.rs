//! Input seam: per-timestep fields per dataset.

use std::collections::{BTreeMap, HashMap};

use crate::grid::Field;

/// Supplies the field for a dataset at a timestep. `None` is a detection
/// gap for every object type detected from that dataset.
pub trait FieldSource: Send {
    fn field_at(&mut self, dataset: &str, time: u64) -> Option<Field>;

    /// Filepath the field came from, when one exists. Recorded in the
    /// `records/filepaths` output.
    fn filepath_at(&self, _dataset: &str, _time: u64) -> Option<String> {
        None
    }
}

/// In-memory field source, used by tests and synthetic runs.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    frames: HashMap<String, BTreeMap<u64, Field>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: &str, time: u64, field: Field) {
        self.frames
            .entry(dataset.to_string())
            .or_default()
            .insert(time, field);
    }
}

impl FieldSource for InMemorySource {
    fn field_at(&mut self, dataset: &str, time: u64) -> Option<Field> {
        self.frames.get(dataset).and_then(|by_time| by_time.get(&time).cloned())
    }
}

/// Record of which file supplied each timestep, per dataset.
#[derive(Debug, Clone, Default)]
pub struct InputRecords {
    entries: HashMap<String, Vec<(u64, String)>>,
}

impl InputRecords {
    pub fn record(&mut self, dataset: &str, time: u64, filepath: Option<String>) {
        if let Some(filepath) = filepath {
            self.entries
                .entry(dataset.to_string())
                .or_default()
                .push((time, filepath));
        }
    }

    pub fn entries(&self) -> &HashMap<String, Vec<(u64, String)>> {
        &self.entries
    }
}
