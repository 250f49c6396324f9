use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use reelcast::{
    BackendFactory, BackendKind, ExportConfig, ExportContext, ExportEngine, ExportFormat,
    ExportSettings, ExportState, Fps, FsMediaLoader, InMemoryCatalog, MediaCatalog, MediaItem, Project,
    QualityTier,
};

#[derive(Parser, Debug)]
#[command(name = "reelcast", version)]
struct Cli {
    /// Export config JSON; defaults plus `REELCAST_*` environment overrides when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a project bundle to a video file.
    Export(ExportArgs),
    /// Print host capabilities and the backend ranking as JSON.
    Probe(ProbeArgs),
    /// Print the pre-flight memory estimate for a project bundle as JSON.
    Estimate(EstimateArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Project bundle JSON: `{ "project": ..., "media": [...] }`.
    #[arg(long)]
    project: PathBuf,

    #[arg(long, default_value = "medium")]
    quality: QualityTier,

    /// Output format; taken from the output extension when omitted.
    #[arg(long)]
    format: Option<ExportFormat>,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    /// Output size as WIDTHxHEIGHT; defaults to the project canvas.
    #[arg(long)]
    resolution: Option<String>,
}

#[derive(Parser, Debug)]
struct ExportArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Output file.
    #[arg(long)]
    out: PathBuf,

    /// Export even when the memory estimate exceeds the maximum threshold.
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Ignore memoized results and probe again.
    #[arg(long)]
    refresh: bool,
}

#[derive(Parser, Debug)]
struct EstimateArgs {
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Auto,
    Capture,
    InProcess,
    Native,
    Hardware,
}

impl BackendArg {
    fn kind(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::Capture => Some(BackendKind::Capture),
            Self::InProcess => Some(BackendKind::InProcess),
            Self::Native => Some(BackendKind::Native),
            Self::Hardware => Some(BackendKind::Hardware),
        }
    }
}

#[derive(serde::Deserialize)]
struct Bundle {
    project: Project,
    #[serde(default)]
    media: Vec<MediaItem>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ExportConfig::load(path)?.with_env_overrides(),
        None => ExportConfig::from_env(),
    };
    match cli.cmd {
        Command::Export(args) => cmd_export(config, args),
        Command::Probe(args) => cmd_probe(config, args),
        Command::Estimate(args) => cmd_estimate(config, args),
    }
}

fn read_bundle(path: &Path) -> anyhow::Result<(Project, InMemoryCatalog)> {
    let f = File::open(path).with_context(|| format!("open project bundle '{}'", path.display()))?;
    let bundle: Bundle =
        serde_json::from_reader(BufReader::new(f)).with_context(|| "parse project bundle JSON")?;

    let root = path.parent().unwrap_or_else(|| Path::new("."));
    let catalog = bundle
        .media
        .into_iter()
        .map(|mut item| {
            if item.locator.is_relative() {
                item.locator = root.join(&item.locator);
            }
            item
        })
        .collect();
    Ok((bundle.project, catalog))
}

fn settings_for(run: &RunArgs, out: Option<&Path>) -> anyhow::Result<ExportSettings> {
    let format = match (run.format, out) {
        (Some(f), _) => f,
        (None, Some(out)) => out
            .extension()
            .and_then(|e| e.to_str())
            .map(str::parse::<ExportFormat>)
            .transpose()?
            .unwrap_or(ExportFormat::Mp4),
        (None, None) => ExportFormat::Mp4,
    };
    let filename = out
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("export")
        .to_string();

    let mut settings = ExportSettings::new(filename, format, Fps::integer(run.fps)?)
        .with_quality(run.quality);
    if let Some(kind) = run.backend.kind() {
        settings = settings.with_backend(kind.into());
    }
    if let Some(res) = &run.resolution {
        let (w, h) = res
            .split_once(['x', 'X'])
            .with_context(|| format!("resolution '{res}' is not WIDTHxHEIGHT"))?;
        let canvas = reelcast::Canvas::new(
            w.trim().parse().with_context(|| format!("resolution width '{w}'"))?,
            h.trim().parse().with_context(|| format!("resolution height '{h}'"))?,
        );
        settings = settings.with_resolution(canvas);
    }
    Ok(settings)
}

fn cmd_export(config: ExportConfig, args: ExportArgs) -> anyhow::Result<()> {
    let (project, catalog) = read_bundle(&args.run.project)?;
    let mut settings = settings_for(&args.run, Some(&args.out))?;
    settings.override_memory_gate = args.force;

    let factory = BackendFactory::system(config);
    let loader = FsMediaLoader::new(factory.probe_capabilities().transcoder.clone());
    let engine = ExportEngine::with_factory(
        factory,
        ExportContext::new(Arc::new(catalog), Arc::new(loader)),
    );
    engine.on_progress(|run_id, p| {
        if p.state == ExportState::Rendering && p.current_frame > 0 && p.current_frame % 30 == 0 {
            tracing::info!(
                run_id,
                frame = p.current_frame,
                total = p.total_frames,
                fps = p.rolling_rate_fps,
                eta_secs = p.estimated_remaining_secs.map(|s| s.round()),
                "progress"
            );
        }
    });

    let outcome = engine.export_blocking(Arc::new(project), settings)?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    let Some(output) = outcome.output else {
        anyhow::bail!(
            "export {}: {}",
            outcome.state,
            outcome.message.unwrap_or_default()
        );
    };

    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&args.out, &output.bytes)
        .with_context(|| format!("write output '{}'", args.out.display()))?;

    eprintln!(
        "wrote {} ({} bytes, {:.2}s, {} backend)",
        args.out.display(),
        output.size_bytes,
        output.duration_secs,
        output.backend
    );
    Ok(())
}

fn cmd_probe(config: ExportConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let factory = BackendFactory::system(config);
    let caps = if args.refresh {
        factory.refresh_capabilities()
    } else {
        factory.probe_capabilities()
    };
    let settings = ExportSettings::new("probe", ExportFormat::Mp4, Fps::integer(30)?);
    let rec = factory.recommend(&settings, reelcast::Canvas::new(1920, 1080), 60.0, 4);
    let report = serde_json::json!({
        "capabilities": &*caps,
        "recommendation": rec,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_estimate(config: ExportConfig, args: EstimateArgs) -> anyhow::Result<()> {
    let (project, catalog) = read_bundle(&args.run.project)?;
    let settings = settings_for(&args.run, None)?;
    let factory = BackendFactory::system(config);

    let canvas = settings.output_canvas(project.canvas);
    let duration = project.total_duration_secs();
    let handles = project
        .referenced_media()
        .iter()
        .filter(|id| catalog.resolve_media_item(id).is_some_and(|item| item.kind.is_visual()))
        .count()
        .min(factory.config().media_cache_capacity);
    let kind = factory.resolve(&settings, canvas, duration, handles, None)?;
    let estimate = factory.estimator().estimate(&settings, canvas, duration, kind, handles);

    let report = serde_json::json!({
        "backend": kind,
        "total_frames": settings.fps.total_frames(duration),
        "estimate": estimate,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
