mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use reelcast::{
    Background, BackendChoice, BackendKind, CancellationToken, ErrorKind, ExportConfig,
    ExportContext, ExportFormat, ExportSettings, ExportState, Fps, QualityTier, Rgba8,
};

use common::{
    DarkLoader, GIB, clip_project, collector_engine, collector_engine_with, media_element,
    project_with, test_config,
};

fn settings(fps: u32) -> ExportSettings {
    ExportSettings::new("scenario", ExportFormat::Mp4, Fps::integer(fps).unwrap())
        .with_quality(QualityTier::Medium)
}

#[test]
fn empty_timeline_is_rejected_before_a_backend_exists() {
    let (engine, probe) = collector_engine(test_config(), 8 * GIB);

    let err = engine.start_export(clip_project("empty", 0.0), settings(30)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!probe.state().initialized);
    let history = engine.history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].error_kind, Some(ErrorKind::Validation));
}

#[test]
fn five_second_clip_renders_every_frame_and_reaches_full_progress() {
    let (engine, probe) = collector_engine(test_config(), 8 * GIB);
    let last = Arc::new(Mutex::new(None));
    let l = last.clone();
    engine.on_progress(move |_, p| *l.lock() = Some(p.clone()));

    let outcome = engine.export_blocking(clip_project("b", 5.0), settings(30)).unwrap();

    assert_eq!(outcome.state, ExportState::Completed);
    assert_eq!(outcome.total_frames, 150);
    assert_eq!(outcome.frames_rendered, 150);
    assert_eq!(probe.state().frames_ingested, 150);
    assert!(probe.state().finalized);

    let last = last.lock().clone().unwrap();
    assert_eq!(last.state, ExportState::Completed);
    assert_eq!(last.fraction_complete, 1.0);
    assert_eq!(last.current_frame, 150);

    let output = outcome.output.unwrap();
    assert_eq!(output.backend, BackendKind::Native);
    assert_eq!(output.filename, "scenario.mp4");
    assert!((output.duration_secs - 5.0).abs() < 1e-9);
    assert!(engine.history()[0].success);
}

#[test]
fn cancel_at_frame_sixty_stops_and_releases_media() {
    let (engine, probe) = collector_engine(test_config(), 8 * GIB);
    let token = CancellationToken::new();
    let t = token.clone();
    engine.on_progress(move |_, p| {
        if p.state == ExportState::Rendering && p.current_frame == 60 {
            t.cancel();
        }
    });

    let run = engine
        .start_export_with(clip_project("c", 5.0), settings(30), None, token)
        .unwrap();
    let outcome = run.wait();

    assert_eq!(outcome.state, ExportState::Cancelled);
    assert!(outcome.output.is_none());
    assert_eq!(outcome.frames_rendered, 60);
    assert_eq!(outcome.media_cache_len, 0);
    assert_eq!(probe.state().cancel_calls, 1);
    assert!(!probe.state().finalized);

    let entry = engine.history().pop().unwrap();
    assert_eq!(entry.state, ExportState::Cancelled);
    assert!(!entry.success);
    assert_eq!(entry.output_size_bytes, None);
}

#[test]
fn unknown_media_renders_placeholder_and_completes() {
    let (engine, _probe) = collector_engine(test_config(), 8 * GIB);
    let project = project_with(
        "d",
        reelcast::Canvas::new(32, 18),
        vec![
            media_element("ok", "clip", 0.0, 1.0),
            media_element("missing", "not-in-catalog", 0.0, 1.0),
        ],
    );

    let outcome = engine.export_blocking(project, settings(10)).unwrap();

    assert_eq!(outcome.state, ExportState::Completed);
    assert_eq!(outcome.frames_rendered, 10);
    assert!(outcome.stats.placeholders >= 10);
}

#[test]
fn explicit_backend_that_cannot_write_the_format_is_a_configuration_error() {
    let (engine, probe) = collector_engine(test_config(), 8 * GIB);
    let s = settings(30).with_backend(BackendChoice::Capture);

    let err = engine.start_export(clip_project("e", 2.0), s).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!probe.state().initialized);
    assert_eq!(probe.state().frames_ingested, 0);
    assert!(!engine.is_active("e"));
}

#[test]
fn backend_failure_mid_run_is_recorded_as_failed() {
    use reelcast::FrameCollector;

    let (mut engine, _) = collector_engine(test_config(), 8 * GIB);
    engine
        .factory_mut()
        .register(BackendKind::Native, common::collector_builder(FrameCollector::new().failing_at(5)));

    let outcome = engine.export_blocking(clip_project("f", 1.0), settings(30)).unwrap();

    assert_eq!(outcome.state, ExportState::Failed);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Backend));
    assert_eq!(outcome.frames_rendered, 5);
    assert!(outcome.output.is_none());
    assert_eq!(outcome.media_cache_len, 0);
}

#[test]
fn stalled_video_seeks_fail_the_run() {
    let config = ExportConfig {
        max_consecutive_seek_failures: 3,
        ..common::quick_seek_config()
    };
    let (engine, collector) = collector_engine_with(
        config,
        8 * GIB,
        ExportContext::new(Arc::new(common::catalog()), Arc::new(DarkLoader)),
    );

    let outcome = engine.export_blocking(clip_project("g", 2.0), settings(30)).unwrap();

    assert_eq!(outcome.state, ExportState::Failed);
    assert_eq!(outcome.error_kind, Some(ErrorKind::TransientMedia));
    assert_eq!(outcome.frames_rendered, 3);
    assert!(outcome.message.unwrap_or_default().contains("consecutive frames"));
    assert_eq!(collector.state().cancel_calls, 1);
    assert!(!engine.history()[0].success);
}

#[test]
fn persistent_black_output_adds_one_warning() {
    let config = ExportConfig {
        verify_every_n_frames: 10,
        black_run_threshold: 3,
        ..test_config()
    };
    let (engine, _collector) = collector_engine_with(
        config,
        8 * GIB,
        ExportContext::new(Arc::new(common::catalog()), Arc::new(DarkLoader)),
    );
    let mut project = (*project_with(
        "h",
        reelcast::Canvas::new(32, 18),
        vec![media_element("s", "still", 0.0, 4.0)],
    ))
    .clone();
    project.background = Background::Solid { color: Rgba8::BLACK };

    let outcome = engine.export_blocking(Arc::new(project), settings(10)).unwrap();

    assert_eq!(outcome.state, ExportState::Completed);
    assert_eq!(outcome.frames_rendered, 40);
    let black: Vec<&String> = outcome
        .warnings
        .iter()
        .filter(|w| w.contains("black frames"))
        .collect();
    assert_eq!(black.len(), 1);
    assert!(black[0].contains("frame 20"));
    assert_eq!(outcome.stats.degraded_runs, 1);
}
