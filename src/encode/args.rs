//! Command-line templates for the external transcoding tool.

use std::process::Command;

use crate::foundation::core::Fps;
use crate::model::settings::{ExportFormat, QualityTier};

/// Software codec selection for a format and tier.
pub fn software_codec_args(format: ExportFormat, quality: QualityTier) -> Vec<String> {
    let mut args: Vec<&str> = Vec::new();
    match format {
        ExportFormat::Webm => {
            let crf = match quality {
                QualityTier::Low => "38",
                QualityTier::Medium => "32",
                QualityTier::High => "24",
            };
            args.extend(["-c:v", "libvpx-vp9", "-b:v", "0", "-crf", crf, "-row-mt", "1"]);
            args.extend(["-pix_fmt", "yuv420p"]);
        }
        ExportFormat::Mp4 | ExportFormat::Mov | ExportFormat::H264 => {
            let (crf, preset) = match quality {
                QualityTier::Low => ("28", "veryfast"),
                QualityTier::Medium => ("23", "fast"),
                QualityTier::High => ("18", "medium"),
            };
            args.extend(["-c:v", "libx264", "-preset", preset, "-crf", crf]);
            args.extend(["-pix_fmt", "yuv420p"]);
        }
    }
    args.into_iter().map(str::to_string).collect()
}

/// Hardware H.264 codec selection; rate control is bitrate-based.
pub fn hardware_codec_args(encoder: &str, quality: QualityTier) -> Vec<String> {
    let bitrate = quality.bitrate_bps().to_string();
    let maxrate = (u64::from(quality.bitrate_bps()) * 3 / 2).to_string();
    // QSV sessions reject yuv420p input on several drivers.
    let pix_fmt = if encoder == "h264_qsv" { "nv12" } else { "yuv420p" };
    vec![
        "-c:v".into(),
        encoder.into(),
        "-b:v".into(),
        bitrate,
        "-maxrate".into(),
        maxrate,
        "-pix_fmt".into(),
        pix_fmt.into(),
    ]
}

/// Muxer name passed to `-f`.
pub fn muxer(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Mp4 => "mp4",
        ExportFormat::Mov => "mov",
        ExportFormat::Webm => "webm",
        ExportFormat::H264 => "h264",
    }
}

/// Container flags for seekable file output.
pub fn file_container_args(format: ExportFormat) -> Vec<String> {
    let mut args = vec!["-an".to_string()];
    if matches!(format, ExportFormat::Mp4 | ExportFormat::Mov) {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.extend(["-f".into(), muxer(format).into()]);
    args
}

/// Container flags for non-seekable pipe output.
pub fn pipe_container_args(format: ExportFormat) -> Vec<String> {
    let mut args = vec!["-an".to_string()];
    if matches!(format, ExportFormat::Mp4 | ExportFormat::Mov) {
        args.extend(["-movflags".into(), "frag_keyframe+empty_moov".into()]);
    }
    args.extend(["-f".into(), muxer(format).into()]);
    args
}

/// Raw premultiplied-then-flattened RGBA frames on stdin.
pub fn push_rawvideo_input(cmd: &mut Command, width: u32, height: u32, fps: Fps) {
    cmd.args([
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
        &format!("{width}x{height}"),
    ]);
    // For rawvideo input, `-r` before `-i` sets the input frame rate.
    cmd.args(["-r", &fps.as_ratio_arg()]);
    cmd.args(["-i", "pipe:0"]);
}
