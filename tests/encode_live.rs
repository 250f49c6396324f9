//! End-to-end encodes through real encoders. Tool-backed cases return early when `ffmpeg` and
//! `ffprobe` are not installed.

mod common;

use std::sync::Arc;

use reelcast::{
    BackendChoice, BackendFactory, BackendKind, CapabilityProbe, ExportContext, ExportEngine,
    ExportFormat, ExportSettings, ExportState, Fps, TranscodeTool,
};

use common::{GIB, SyntheticLoader, catalog, host, media_element, project_with, test_config};

fn engine(tool: Option<TranscodeTool>) -> ExportEngine {
    let factory = BackendFactory::new(
        test_config(),
        Arc::new(CapabilityProbe::fixed(host(tool, 8 * GIB))),
    );
    ExportEngine::with_factory(
        factory,
        ExportContext::new(Arc::new(catalog()), Arc::new(SyntheticLoader)),
    )
}

/// Container duration, or decoded frame count over `fps` when the container does not carry one.
fn probe_duration(tool: &TranscodeTool, path: &std::path::Path, fps: Fps) -> Option<f64> {
    let out = tool
        .probe_command()?
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=nw=1:nk=1"])
        .arg(path)
        .output()
        .ok()?;
    if let Ok(secs) = String::from_utf8_lossy(&out.stdout).trim().parse::<f64>() {
        return Some(secs);
    }
    let out = tool
        .probe_command()?
        .args([
            "-v",
            "error",
            "-count_frames",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=nb_read_frames",
            "-of",
            "default=nw=1:nk=1",
        ])
        .arg(path)
        .output()
        .ok()?;
    let frames: u64 = String::from_utf8_lossy(&out.stdout).trim().parse().ok()?;
    Some(fps.frames_to_secs(frames))
}

fn round_trip(kind: BackendKind, format: ExportFormat) {
    let Some(tool) = TranscodeTool::locate(None) else {
        eprintln!("skipping: ffmpeg not found");
        return;
    };
    if tool.probe_path.is_none() {
        eprintln!("skipping: ffprobe not found");
        return;
    }

    let engine = engine(Some(tool.clone()));
    let project = project_with(
        "live",
        reelcast::Canvas::new(64, 36),
        vec![media_element("a", "clip", 0.0, 1.0), media_element("b", "still", 1.0, 1.0)],
    );
    let fps = Fps::integer(30).unwrap();
    let settings = ExportSettings::new("live", format, fps).with_backend(BackendChoice::from(kind));

    let outcome = engine.export_blocking(project, settings).unwrap();
    assert_eq!(outcome.state, ExportState::Completed, "{:?}", outcome.message);
    let output = outcome.output.unwrap();
    assert!(output.size_bytes > 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(&output.filename);
    std::fs::write(&path, &output.bytes).unwrap();
    let probed = probe_duration(&tool, &path, fps).expect("probe duration");
    assert!(
        (probed - 2.0).abs() <= fps.frame_duration_secs() + 1e-6,
        "probed {probed}s"
    );
}

#[test]
fn native_mp4_duration_round_trips() {
    round_trip(BackendKind::Native, ExportFormat::Mp4);
}

#[test]
fn in_process_webm_duration_round_trips() {
    round_trip(BackendKind::InProcess, ExportFormat::Webm);
}

#[test]
fn capture_backend_writes_an_annex_b_stream_without_a_tool() {
    let engine = engine(None);
    let project = project_with(
        "cap",
        reelcast::Canvas::new(32, 32),
        vec![media_element("a", "clip", 0.0, 0.5)],
    );
    let settings = ExportSettings::new("cap", ExportFormat::H264, Fps::integer(20).unwrap());

    let outcome = engine.export_blocking(project, settings).unwrap();

    assert_eq!(outcome.state, ExportState::Completed, "{:?}", outcome.message);
    assert_eq!(outcome.backend, Some(BackendKind::Capture));
    assert_eq!(outcome.frames_rendered, 10);
    let output = outcome.output.unwrap();
    assert!(output.bytes.starts_with(&[0, 0, 0, 1]) || output.bytes.starts_with(&[0, 0, 1]));
    assert_eq!(output.filename, "cap.h264");
}
