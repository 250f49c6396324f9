use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::foundation::error::{ExportError, ExportResult};
use crate::tool::TranscodeTool;

/// Stream facts reported by the probe binary.
#[derive(Clone, Debug)]
pub struct VideoSourceInfo {
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub duration_secs: f64,
    pub has_audio: bool,
}

impl VideoSourceInfo {
    pub fn source_fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

pub fn probe_video(tool: &TranscodeTool, source_path: &Path) -> ExportResult<VideoSourceInfo> {
    #[derive(serde::Deserialize)]
    struct ProbeStream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        r_frame_rate: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeOut {
        streams: Vec<ProbeStream>,
        format: Option<ProbeFormat>,
    }

    let mut cmd = tool
        .probe_command()
        .ok_or_else(|| ExportError::transient("no probe binary next to the transcoding tool"))?;
    let out = cmd
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(source_path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ExportError::transient(format!("failed to run probe: {e}")))?;
    if !out.status.success() {
        return Err(ExportError::transient(format!(
            "probe failed for '{}': {}",
            source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
        .map_err(|e| ExportError::transient(format!("probe json parse failed: {e}")))?;
    let video_stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| {
            ExportError::transient(format!("no video stream in '{}'", source_path.display()))
        })?;
    let (Some(width), Some(height)) = (video_stream.width, video_stream.height) else {
        return Err(ExportError::transient("probe did not report video dimensions"));
    };
    if width == 0 || height == 0 {
        return Err(ExportError::transient("probe reported zero video dimensions"));
    }

    let (fps_num, fps_den) = parse_ff_ratio(video_stream.r_frame_rate.as_deref().unwrap_or("0/1"))
        .ok_or_else(|| ExportError::transient("invalid video r_frame_rate"))?;
    let duration_secs = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoSourceInfo {
        source_path: source_path.to_path_buf(),
        width,
        height,
        fps_num,
        fps_den,
        duration_secs,
        has_audio,
    })
}

/// Decode up to `frame_count` straight-alpha RGBA frames starting at `start_time_secs`.
///
/// Fewer frames come back near the end of the stream.
pub fn decode_video_frames_rgba8(
    tool: &TranscodeTool,
    source: &VideoSourceInfo,
    start_time_secs: f64,
    frame_count: u32,
) -> ExportResult<Vec<Vec<u8>>> {
    if frame_count == 0 {
        return Ok(Vec::new());
    }

    let out = tool
        .command()
        .args(["-v", "error", "-ss", &format!("{start_time_secs:.6}")])
        .arg("-i")
        .arg(&source.source_path)
        .args([
            "-frames:v",
            &frame_count.to_string(),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ExportError::transient(format!("failed to run video decode: {e}")))?;

    if !out.status.success() {
        return Err(ExportError::transient(format!(
            "video decode batch failed for '{}': {}",
            source.source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    split_frames(&out.stdout, source.frame_bytes(), frame_count)
}

fn split_frames(raw: &[u8], frame_len: usize, max_frames: u32) -> ExportResult<Vec<Vec<u8>>> {
    if frame_len == 0 {
        return Err(ExportError::transient(
            "decoded video frame size is zero (invalid source dimensions)",
        ));
    }
    if raw.len() < frame_len || !raw.len().is_multiple_of(frame_len) {
        return Err(ExportError::transient(format!(
            "decoded video batch has invalid size: got {} bytes, expected multiples of {frame_len}",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(frame_len)
        .take(max_frames as usize)
        .map(<[u8]>::to_vec)
        .collect())
}

fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let (a, b) = s.split_once('/')?;
    let a = a.parse::<u32>().ok()?;
    let b = b.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}
