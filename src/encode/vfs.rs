use std::collections::BTreeMap;

use crate::foundation::error::{ExportError, ExportResult};

/// Memory-limited in-process file store used to stage frames for the transcoder.
///
/// Names iterate in lexicographic order, so zero-padded frame names replay in frame order.
#[derive(Debug, Default)]
pub struct Vfs {
    files: BTreeMap<String, Vec<u8>>,
    used: u64,
    limit: u64,
}

impl Vfs {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            files: BTreeMap::new(),
            used: 0,
            limit: limit_bytes,
        }
    }

    /// Store `bytes` under `name`, replacing any previous file of that name.
    pub fn write(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> ExportResult<()> {
        let name = name.into();
        let replaced = self.files.get(&name).map_or(0, |f| f.len() as u64);
        let next = self.used - replaced + bytes.len() as u64;
        if next > self.limit {
            return Err(ExportError::resource(format!(
                "in-process file store limit exceeded: {next} > {} bytes",
                self.limit
            )));
        }
        self.used = next;
        self.files.insert(name, bytes);
        Ok(())
    }

    pub fn read(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        let bytes = self.files.remove(name)?;
        self.used -= bytes.len() as u64;
        Some(bytes)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit
    }

    /// Remove every file, returning them in name order.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, Vec<u8>)> {
        self.used = 0;
        std::mem::take(&mut self.files).into_iter()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.used = 0;
    }
}

/// Staged name of frame `n`.
pub fn frame_name(n: u64) -> String {
    format!("frame_{n:08}.png")
}
