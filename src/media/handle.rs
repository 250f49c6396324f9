use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::foundation::error::{ExportError, ExportResult};
use crate::media::source::{MediaLoader, Picture};
use crate::model::media::{MediaId, MediaItem};

struct SeekRequest {
    seq: u64,
    t: f64,
}

enum WorkerReply {
    Opened {
        natural: (u32, u32),
        duration_secs: Option<f64>,
        still: bool,
    },
    Frame {
        seq: u64,
        result: ExportResult<Picture>,
    },
}

/// Result of a settled (or abandoned) seek.
#[derive(Debug)]
pub enum SeekOutcome {
    Ready(Picture),
    /// The seek failed or timed out; the last good picture stands in.
    Stale { picture: Picture, error: ExportError },
    /// The seek failed and no picture was ever produced.
    Unavailable(ExportError),
}

impl SeekOutcome {
    pub fn picture(&self) -> Option<&Picture> {
        match self {
            Self::Ready(p) | Self::Stale { picture: p, .. } => Some(p),
            Self::Unavailable(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// A live decoder for one media item.
///
/// Decoding runs on a dedicated worker thread. Each seek carries a sequence number, so a reply
/// that arrives after its seek timed out is recognised as stale and dropped.
pub struct DecodeHandle {
    id: MediaId,
    requests: Option<Sender<SeekRequest>>,
    replies: Receiver<WorkerReply>,
    next_seq: u64,
    natural: (u32, u32),
    duration_secs: Option<f64>,
    still: Option<Picture>,
    last_good: Option<Picture>,
    last_time: f64,
    _worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DecodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeHandle")
            .field("id", &self.id)
            .field("natural", &self.natural)
            .field("still", &self.still.is_some())
            .field("last_time", &self.last_time)
            .finish()
    }
}

impl DecodeHandle {
    /// Open `item` and wait until it yields a first decodable frame.
    #[tracing::instrument(level = "debug", skip(loader), fields(media = %item.id))]
    pub fn open(
        item: MediaItem,
        loader: Arc<dyn MediaLoader>,
        open_timeout: Duration,
    ) -> ExportResult<Self> {
        let id = item.id.clone();
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<SeekRequest>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<WorkerReply>();

        let worker = std::thread::Builder::new()
            .name(format!("reelcast-decode-{}", item.id))
            .spawn(move || decode_worker(item, loader, req_rx, reply_tx))
            .map_err(|e| ExportError::resource(format!("failed to spawn decode worker: {e}")))?;

        let deadline = Instant::now() + open_timeout;
        let (natural, duration_secs, still) = match recv_until(&reply_rx, deadline) {
            Ok(WorkerReply::Opened {
                natural,
                duration_secs,
                still,
            }) => (natural, duration_secs, still),
            Ok(WorkerReply::Frame { result, .. }) => {
                return Err(result.err().unwrap_or_else(|| {
                    ExportError::transient(format!("decoder for '{id}' replied before opening"))
                }));
            }
            Err(e) => return Err(open_error(&id, e, open_timeout)),
        };

        let mut handle = Self {
            id,
            requests: Some(req_tx),
            replies: reply_rx,
            next_seq: 1,
            natural,
            duration_secs,
            still: None,
            last_good: None,
            last_time: 0.0,
            _worker: Some(worker),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match handle.seek(0.0, remaining.max(Duration::from_millis(1))) {
            SeekOutcome::Ready(p) => {
                if still {
                    handle.still = Some(p);
                    // Stills never seek again.
                    handle.requests = None;
                }
                Ok(handle)
            }
            SeekOutcome::Stale { error, .. } | SeekOutcome::Unavailable(error) => Err(
                ExportError::transient(format!("'{}' produced no decodable frame: {error}", handle.id)),
            ),
        }
    }

    pub fn id(&self) -> &MediaId {
        &self.id
    }

    pub fn natural_size(&self) -> (u32, u32) {
        self.natural
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.duration_secs
    }

    pub fn is_still(&self) -> bool {
        self.still.is_some()
    }

    /// Source time of the most recent successful seek.
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    pub fn last_good(&self) -> Option<&Picture> {
        self.last_good.as_ref()
    }

    /// Seek to `t` and wait up to `timeout` for the frame to settle.
    pub fn seek(&mut self, t: f64, timeout: Duration) -> SeekOutcome {
        if let Some(still) = &self.still {
            return SeekOutcome::Ready(still.clone());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let sent = self
            .requests
            .as_ref()
            .map(|tx| tx.send(SeekRequest { seq, t }).is_ok());
        if sent != Some(true) {
            return self.fallback(ExportError::transient(format!(
                "decoder for '{}' stopped",
                self.id
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match recv_until(&self.replies, deadline) {
                Ok(WorkerReply::Frame { seq: got, result }) if got == seq => {
                    return match result {
                        Ok(picture) => {
                            self.last_good = Some(picture.clone());
                            self.last_time = t;
                            SeekOutcome::Ready(picture)
                        }
                        Err(e) => self.fallback(e),
                    };
                }
                // Stale reply to an abandoned seek.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!(media = %self.id, t, ?timeout, "seek did not settle in time");
                    return self.fallback(ExportError::transient(format!(
                        "seek to {t:.3}s in '{}' timed out after {} ms",
                        self.id,
                        timeout.as_millis()
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.fallback(ExportError::transient(format!(
                        "decoder for '{}' stopped",
                        self.id
                    )));
                }
            }
        }
    }

    fn fallback(&self, error: ExportError) -> SeekOutcome {
        match &self.last_good {
            Some(p) => SeekOutcome::Stale {
                picture: p.clone(),
                error,
            },
            None => SeekOutcome::Unavailable(error),
        }
    }
}

impl Drop for DecodeHandle {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop; it is not joined so a slow decode
        // cannot stall teardown.
        self.requests = None;
    }
}

fn recv_until(rx: &Receiver<WorkerReply>, deadline: Instant) -> Result<WorkerReply, RecvTimeoutError> {
    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
}

fn open_error(id: &MediaId, e: RecvTimeoutError, timeout: Duration) -> ExportError {
    match e {
        RecvTimeoutError::Timeout => ExportError::transient(format!(
            "'{id}' did not open within {} ms",
            timeout.as_millis()
        )),
        RecvTimeoutError::Disconnected => {
            ExportError::transient(format!("decoder for '{id}' exited during open"))
        }
    }
}

fn decode_worker(
    item: MediaItem,
    loader: Arc<dyn MediaLoader>,
    requests: Receiver<SeekRequest>,
    replies: Sender<WorkerReply>,
) {
    let mut source = match loader.open(&item) {
        Ok(source) => source,
        Err(e) => {
            let _ = replies.send(WorkerReply::Frame {
                seq: 0,
                result: Err(e),
            });
            return;
        }
    };
    let opened = WorkerReply::Opened {
        natural: source.natural_size(),
        duration_secs: source.duration_secs().or(item.duration_secs),
        still: source.is_still(),
    };
    if replies.send(opened).is_err() {
        return;
    }

    while let Ok(mut req) = requests.recv() {
        // Only the newest pending seek matters.
        while let Ok(newer) = requests.try_recv() {
            req = newer;
        }
        let result = source.frame_at(req.t);
        if replies
            .send(WorkerReply::Frame {
                seq: req.seq,
                result,
            })
            .is_err()
        {
            break;
        }
    }
    tracing::trace!(media = %item.id, "decode worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::media::source::{FrameSource, StillImageSource};
    use crate::model::media::MediaKind;

    struct SlowSource {
        delay: Duration,
        calls: Arc<AtomicU32>,
    }

    impl FrameSource for SlowSource {
        fn natural_size(&self) -> (u32, u32) {
            (2, 2)
        }
        fn duration_secs(&self) -> Option<f64> {
            Some(10.0)
        }
        fn frame_at(&mut self, t: f64) -> ExportResult<Picture> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                std::thread::sleep(self.delay);
            }
            let v = (t * 10.0) as u8;
            Ok(Picture::solid(2, 2, [v, v, v, 255]))
        }
    }

    struct Loader {
        delay: Duration,
        calls: Arc<AtomicU32>,
    }

    impl MediaLoader for Loader {
        fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
            match item.kind {
                MediaKind::Image => Ok(Box::new(StillImageSource::new(Picture::solid(
                    3,
                    1,
                    [9, 9, 9, 255],
                )))),
                _ => Ok(Box::new(SlowSource {
                    delay: self.delay,
                    calls: self.calls.clone(),
                })),
            }
        }
    }

    fn loader(delay_ms: u64) -> Arc<dyn MediaLoader> {
        Arc::new(Loader {
            delay: Duration::from_millis(delay_ms),
            calls: Arc::new(AtomicU32::new(0)),
        })
    }

    #[test]
    fn fast_seek_is_ready() {
        let item = MediaItem::new("v", MediaKind::Video, "v.mp4");
        let mut h = DecodeHandle::open(item, loader(0), Duration::from_secs(2)).unwrap();
        let out = h.seek(0.5, Duration::from_secs(2));
        assert!(out.is_ready());
        assert_eq!(h.last_time(), 0.5);
        assert_eq!(h.natural_size(), (2, 2));
    }

    #[test]
    fn timed_out_seek_falls_back_to_last_good() {
        let item = MediaItem::new("v", MediaKind::Video, "v.mp4");
        let mut h = DecodeHandle::open(item, loader(300), Duration::from_secs(2)).unwrap();
        let first = h.last_good().cloned().unwrap();
        match h.seek(5.0, Duration::from_millis(20)) {
            SeekOutcome::Stale { picture, error } => {
                assert_eq!(picture, first);
                assert!(error.to_string().contains("timed out"));
            }
            other => panic!("expected stale outcome, got {other:?}"),
        }
        // The late reply to the abandoned seek must not satisfy the next one.
        let next = h.seek(0.2, Duration::from_secs(2));
        let p = next.picture().unwrap();
        assert_eq!(p.rgba8_premul[0], 2);
    }

    #[test]
    fn still_images_skip_the_worker() {
        let item = MediaItem::new("i", MediaKind::Image, "i.png");
        let mut h = DecodeHandle::open(item, loader(0), Duration::from_secs(2)).unwrap();
        assert!(h.is_still());
        assert!(h.seek(123.0, Duration::from_millis(1)).is_ready());
    }

    #[test]
    fn open_failure_is_transient() {
        struct Failing;
        impl MediaLoader for Failing {
            fn open(&self, _: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
                Err(ExportError::transient("corrupt"))
            }
        }
        let item = MediaItem::new("x", MediaKind::Video, "x.mp4");
        let err = DecodeHandle::open(item, Arc::new(Failing), Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }
}
