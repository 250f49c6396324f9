use std::collections::VecDeque;

use anyhow::Context as _;

use crate::encode::backend::BackendKind;
use crate::export::state::ExportState;
use crate::foundation::error::{ErrorKind, ExportResult};
use crate::model::settings::ExportSettings;

/// One finished (or refused) export.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub run_id: u64,
    pub project_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub settings: ExportSettings,
    /// Timeline duration in seconds.
    pub duration_secs: f64,
    pub total_frames: u64,
    pub frames_rendered: u64,
    pub output_size_bytes: Option<u64>,
    pub wall_clock_secs: f64,
    pub success: bool,
    pub state: ExportState,
    pub backend: Option<BackendKind>,
    pub message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// Bounded ring of recent exports; the oldest entry is dropped when full.
#[derive(Clone, Debug)]
pub struct ExportHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl ExportHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_json(&self) -> ExportResult<String> {
        Ok(serde_json::to_string_pretty(&self.entries).context("serialize export history")?)
    }
}
