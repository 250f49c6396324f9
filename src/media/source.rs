use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context as _;
use lru::LruCache;

use crate::foundation::error::{ExportError, ExportResult};
use crate::foundation::math::premultiply_rgba8_in_place;
use crate::media::probe::{self, VideoSourceInfo};
use crate::model::media::{MediaItem, MediaKind};
use crate::tool::TranscodeTool;

/// A decoded picture in premultiplied RGBA8.
#[derive(Clone, Debug, PartialEq)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub rgba8_premul: Arc<Vec<u8>>,
}

impl Picture {
    pub fn new(width: u32, height: u32, rgba8_premul: Vec<u8>) -> ExportResult<Self> {
        let expected = width as usize * height as usize * 4;
        if rgba8_premul.len() != expected {
            return Err(ExportError::transient(format!(
                "picture data has {} bytes, expected {expected}",
                rgba8_premul.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba8_premul: Arc::new(rgba8_premul),
        })
    }

    /// Build from straight-alpha RGBA8.
    pub fn from_straight(width: u32, height: u32, mut rgba8: Vec<u8>) -> ExportResult<Self> {
        premultiply_rgba8_in_place(&mut rgba8);
        Self::new(width, height, rgba8)
    }

    pub fn solid(width: u32, height: u32, premul: [u8; 4]) -> Self {
        let data = premul.repeat(width as usize * height as usize);
        Self {
            width,
            height,
            rgba8_premul: Arc::new(data),
        }
    }
}

pub fn decode_image(bytes: &[u8]) -> ExportResult<Picture> {
    let dyn_img = image::load_from_memory(bytes).context("decode image from memory")?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Picture::from_straight(width, height, rgba.into_raw())
}

/// An opened, seekable stream of pictures.
pub trait FrameSource: Send {
    fn natural_size(&self) -> (u32, u32);

    fn duration_secs(&self) -> Option<f64>;

    /// Picture presented at `t` seconds of source time.
    fn frame_at(&mut self, t: f64) -> ExportResult<Picture>;

    /// Whether every timestamp yields the same picture.
    fn is_still(&self) -> bool {
        false
    }
}

/// Opens catalog items into frame sources.
pub trait MediaLoader: Send + Sync {
    fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>>;
}

pub struct StillImageSource {
    picture: Picture,
}

impl StillImageSource {
    pub fn new(picture: Picture) -> Self {
        Self { picture }
    }
}

impl FrameSource for StillImageSource {
    fn natural_size(&self) -> (u32, u32) {
        (self.picture.width, self.picture.height)
    }

    fn duration_secs(&self) -> Option<f64> {
        None
    }

    fn frame_at(&mut self, _t: f64) -> ExportResult<Picture> {
        Ok(self.picture.clone())
    }

    fn is_still(&self) -> bool {
        true
    }
}

/// Video decoded through the transcoding tool in prefetched batches.
///
/// Frames are keyed by millisecond timestamp and kept in a small LRU so sequential export seeks
/// mostly hit memory.
pub struct FfmpegVideoSource {
    tool: TranscodeTool,
    info: Arc<VideoSourceInfo>,
    frames: LruCache<u64, Picture>,
    prefetch_frames: u32,
}

impl FfmpegVideoSource {
    pub fn open(tool: TranscodeTool, item: &MediaItem, prefetch_frames: u32) -> ExportResult<Self> {
        let info = probe::probe_video(&tool, &item.locator)?;
        let capacity = NonZeroUsize::new((prefetch_frames as usize * 2).max(8))
            .unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            tool,
            info: Arc::new(info),
            frames: LruCache::new(capacity),
            prefetch_frames: prefetch_frames.max(1),
        })
    }

    fn key_for_time(source_time_secs: f64) -> u64 {
        (source_time_secs.max(0.0) * 1000.0).round() as u64
    }

    fn step_ms(&self) -> f64 {
        let fps = self.info.source_fps();
        if fps.is_finite() && fps > 0.0 {
            1000.0 / fps
        } else {
            1.0
        }
    }

    fn prefetch_for_key(&mut self, key_ms: u64) -> ExportResult<()> {
        let step_ms = self.step_ms();
        let window_ms = (step_ms * f64::from(self.prefetch_frames)).max(step_ms);
        let bucket = ((key_ms as f64) / window_ms).floor();
        let start_key_ms = (bucket * window_ms).round().max(0.0) as u64;
        let start_secs = (start_key_ms as f64) / 1000.0;
        let batch =
            probe::decode_video_frames_rgba8(&self.tool, &self.info, start_secs, self.prefetch_frames)?;

        for (offset, rgba) in batch.into_iter().enumerate() {
            let key = ((start_key_ms as f64) + (offset as f64) * step_ms).round() as u64;
            if self.frames.contains(&key) {
                self.frames.promote(&key);
                continue;
            }
            let picture = Picture::from_straight(self.info.width, self.info.height, rgba)?;
            self.frames.put(key, picture);
        }
        Ok(())
    }

    /// Nearest cached frame not later than `key_ms` within one frame step.
    fn lookup(&mut self, key_ms: u64) -> Option<Picture> {
        if let Some(p) = self.frames.get(&key_ms) {
            return Some(p.clone());
        }
        let step = self.step_ms().ceil() as u64;
        (1..=step)
            .filter_map(|d| key_ms.checked_sub(d))
            .find_map(|k| self.frames.get(&k).cloned())
    }
}

impl FrameSource for FfmpegVideoSource {
    fn natural_size(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn duration_secs(&self) -> Option<f64> {
        (self.info.duration_secs > 0.0).then_some(self.info.duration_secs)
    }

    fn frame_at(&mut self, t: f64) -> ExportResult<Picture> {
        let key = Self::key_for_time(t);
        if let Some(p) = self.lookup(key) {
            return Ok(p);
        }
        self.prefetch_for_key(key)?;
        if let Some(p) = self.lookup(key) {
            return Ok(p);
        }

        // Sparse request outside the prefetched window.
        let mut one = probe::decode_video_frames_rgba8(&self.tool, &self.info, t.max(0.0), 1)?;
        let rgba = one.pop().ok_or_else(|| {
            ExportError::transient(format!(
                "no video frame at {t:.3}s in '{}'",
                self.info.source_path.display()
            ))
        })?;
        let picture = Picture::from_straight(self.info.width, self.info.height, rgba)?;
        self.frames.put(key, picture.clone());
        Ok(picture)
    }
}

/// Video frames decoded per batch by [`FsMediaLoader`].
const VIDEO_PREFETCH_FRAMES: u32 = 12;

/// Loads images with the `image` crate and video through the transcoding tool.
#[derive(Clone, Debug)]
pub struct FsMediaLoader {
    tool: Option<TranscodeTool>,
}

impl FsMediaLoader {
    pub fn new(tool: Option<TranscodeTool>) -> Self {
        Self { tool }
    }
}

impl MediaLoader for FsMediaLoader {
    fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
        match item.kind {
            MediaKind::Image => {
                let bytes = std::fs::read(&item.locator).with_context(|| {
                    format!("read image '{}'", item.locator.display())
                })?;
                Ok(Box::new(StillImageSource::new(decode_image(&bytes)?)))
            }
            MediaKind::Video => {
                let tool = self.tool.clone().ok_or_else(|| {
                    ExportError::transient(format!(
                        "cannot decode video '{}': no transcoding tool available",
                        item.id
                    ))
                })?;
                Ok(Box::new(FfmpegVideoSource::open(tool, item, VIDEO_PREFETCH_FRAMES)?))
            }
            MediaKind::Audio => Err(ExportError::validation(format!(
                "media '{}' is audio and has no pictures",
                item.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn decode_image_png_dimensions_and_premul() {
        let src_rgba = vec![100u8, 50u8, 200u8, 128u8];
        let img = image::RgbaImage::from_raw(1, 1, src_rgba).unwrap();

        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();

        let picture = decode_image(&buf).unwrap();
        assert_eq!((picture.width, picture.height), (1, 1));
        assert_eq!(
            picture.rgba8_premul.as_slice(),
            &[
                ((100u16 * 128 + 127) / 255) as u8,
                ((50u16 * 128 + 127) / 255) as u8,
                ((200u16 * 128 + 127) / 255) as u8,
                128u8
            ]
        );
    }

    #[test]
    fn picture_rejects_wrong_length() {
        assert!(Picture::new(2, 2, vec![0; 15]).is_err());
        assert!(Picture::new(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn still_source_ignores_time() {
        let mut src = StillImageSource::new(Picture::solid(2, 1, [1, 2, 3, 255]));
        assert!(src.is_still());
        assert_eq!(src.frame_at(0.0).unwrap(), src.frame_at(99.0).unwrap());
    }

    #[test]
    fn loader_without_tool_fails_video() {
        let loader = FsMediaLoader::new(None);
        let item = MediaItem::new("v", MediaKind::Video, "clip.mp4");
        let err = loader.open(&item).err().unwrap();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::TransientMedia);
    }
}
