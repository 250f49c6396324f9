use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rayon::prelude::*;

use crate::foundation::error::{ExportError, ExportResult};
use crate::media::handle::DecodeHandle;
use crate::media::source::MediaLoader;
use crate::model::media::{MediaId, MediaItem};

/// Counters kept across the cache lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub opened: u64,
    pub hits: u64,
    pub evicted: u64,
    pub failed: u64,
}

/// Outcome of [`MediaCache::preload_all`].
#[derive(Clone, Debug, Default)]
pub struct PreloadReport {
    pub loaded: Vec<MediaId>,
    pub failed: Vec<(MediaId, String)>,
    /// Visual items left for lazy opening because the cache was full.
    pub deferred: Vec<MediaId>,
}

/// LRU-bounded map from media id to live decode handle.
///
/// Items that fail to open are remembered, so a corrupt asset is only tried once per run.
pub struct MediaCache {
    handles: LruCache<MediaId, DecodeHandle>,
    failed: HashMap<MediaId, String>,
    loader: Arc<dyn MediaLoader>,
    open_timeout: Duration,
    stats: CacheStats,
}

impl MediaCache {
    pub fn new(capacity: usize, loader: Arc<dyn MediaLoader>, open_timeout: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            handles: LruCache::new(cap),
            failed: HashMap::new(),
            loader,
            open_timeout,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.handles.cap().get()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, id: &MediaId) -> bool {
        self.handles.contains(id)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Error message recorded for an item that failed to open.
    pub fn failure(&self, id: &MediaId) -> Option<&str> {
        self.failed.get(id).map(String::as_str)
    }

    /// Return the live handle for `item`, opening it (and evicting the least recently used
    /// handle) on a miss.
    pub fn get(&mut self, item: &MediaItem) -> ExportResult<&mut DecodeHandle> {
        if let Some(msg) = self.failed.get(&item.id) {
            return Err(ExportError::transient(msg.clone()));
        }
        if self.handles.contains(&item.id) {
            self.stats.hits += 1;
            return self
                .handles
                .get_mut(&item.id)
                .ok_or_else(|| ExportError::transient(format!("handle for '{}' vanished", item.id)));
        }

        match DecodeHandle::open(item.clone(), self.loader.clone(), self.open_timeout) {
            Ok(handle) => self.insert(handle),
            Err(e) => {
                self.record_failure(&item.id, &e);
                return Err(e);
            }
        }
        self.handles
            .get_mut(&item.id)
            .ok_or_else(|| ExportError::transient(format!("handle for '{}' vanished", item.id)))
    }

    /// Open every visual item concurrently, up to the cache capacity.
    ///
    /// Failures are recorded, not returned; the renderer draws placeholders for them later.
    #[tracing::instrument(level = "debug", skip_all, fields(items = items.len()))]
    pub fn preload_all(&mut self, items: &[MediaItem]) -> PreloadReport {
        let mut report = PreloadReport::default();
        let room = self.capacity().saturating_sub(self.handles.len());

        let mut pending = Vec::new();
        for item in items.iter().filter(|i| i.kind.is_visual()) {
            if self.handles.contains(&item.id)
                || self.failed.contains_key(&item.id)
                || pending.iter().any(|p: &&MediaItem| p.id == item.id)
            {
                continue;
            }
            if pending.len() < room {
                pending.push(item);
            } else {
                report.deferred.push(item.id.clone());
            }
        }

        let loader = &self.loader;
        let timeout = self.open_timeout;
        let opened: Vec<(MediaId, ExportResult<DecodeHandle>)> = pending
            .par_iter()
            .map(|item| {
                let res = DecodeHandle::open((*item).clone(), loader.clone(), timeout);
                (item.id.clone(), res)
            })
            .collect();

        for (id, res) in opened {
            match res {
                Ok(handle) => {
                    self.insert(handle);
                    report.loaded.push(id);
                }
                Err(e) => {
                    self.record_failure(&id, &e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        tracing::debug!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "media preload finished"
        );
        report
    }

    pub fn evict(&mut self, id: &MediaId) -> bool {
        self.handles.pop(id).is_some()
    }

    /// Release every handle and forget recorded failures.
    pub fn clear(&mut self) {
        self.handles.clear();
        self.failed.clear();
    }

    fn insert(&mut self, handle: DecodeHandle) {
        self.stats.opened += 1;
        let id = handle.id().clone();
        if let Some((old_id, _old)) = self.handles.push(id.clone(), handle)
            && old_id != id
        {
            self.stats.evicted += 1;
            tracing::debug!(evicted = %old_id, "media cache evicted least recently used handle");
        }
    }

    fn record_failure(&mut self, id: &MediaId, e: &ExportError) {
        self.stats.failed += 1;
        tracing::warn!(media = %id, error = %e, "media failed to open");
        self.failed.insert(id.clone(), e.to_string());
    }
}
