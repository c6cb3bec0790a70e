use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::batch::{
    plan_batch, process_item, upscale_file, BatchOptions, BatchResult, OutputOptions,
};
use tilescale_core::comparison::ComparisonRunner;
use tilescale_core::config::{
    config_path, data_dir, initialize_data_dir, AppConfig, UpscaleSettings,
    SUPPORTED_OUTPUT_FORMATS,
};
use tilescale_core::image_io::default_output_name;
use tilescale_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use tilescale_core::model_registry::ModelRegistry;
use tilescale_core::ort_upsampler::OrtModelLoader;
use tilescale_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use tilescale_core::{ModelCache, PrecisionMode, ProgressEvent, ProgressSink, UpscaleEngine, UpscaleRequest};

const DEFAULT_MODEL: &str = "RealESRGAN_x4plus";
const PROGRESS_BAR_WIDTH: usize = 30;

#[derive(Parser, Debug)]
#[command(name = "tilescale", about = "Tiled AI image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a single image
    Upscale(UpscaleArgs),
    /// Upscale every image in a directory
    Batch(BatchArgs),
    /// Upscale one image with several models
    Compare(CompareArgs),
    /// List known models
    Models(ModelsArgs),
}

/// Options shared by every command that writes images.
#[derive(Args, Debug, Default)]
struct ProcessArgs {
    #[arg(short = 's', long, help = "Target scale factor (defaults to upscale.default_scale)")]
    scale: Option<u32>,
    #[arg(long, help = "Output format: png, jpg, webp, bmp, tiff")]
    format: Option<String>,
    #[arg(long, help = "JPEG quality (1-100)")]
    quality: Option<u8>,
    #[arg(long)]
    tile_size: Option<u32>,
    #[arg(long)]
    overlap: Option<u32>,
    #[arg(long, help = "Load models in fp32 and keep buffers in fp32")]
    full_precision: bool,
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    #[arg(short = 'm', long, default_value = DEFAULT_MODEL)]
    model: String,
    #[command(flatten)]
    process: ProcessArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    input_dir: PathBuf,
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,
    #[arg(short = 'm', long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(short = 'r', long)]
    recursive: bool,
    #[arg(long)]
    skip_existing: bool,
    #[arg(short = 'j', long, default_value_t = 1, help = "Images processed concurrently")]
    jobs: usize,
    #[command(flatten)]
    process: ProcessArgs,
}

#[derive(Args, Debug)]
struct CompareArgs {
    input: PathBuf,
    #[arg(short = 'm', long = "model", required = true, help = "Model to compare (repeatable)")]
    models: Vec<String>,
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Print results as JSON")]
    json: bool,
    #[command(flatten)]
    process: ProcessArgs,
}

#[derive(Args, Debug)]
struct ModelsArgs {
    #[arg(long, help = "Print the catalog as JSON")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_runtime_lib_status(&runtime_report);
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let settings = load_settings(&resolved_data_dir)?;
    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &settings).await,
        Commands::Batch(args) => run_batch_command(args, &settings).await,
        Commands::Compare(args) => run_compare(args, &settings).await,
        Commands::Models(args) => run_models(args, &settings),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_log_filter(&options);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_settings(data_dir: &Path) -> Result<UpscaleSettings> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.settings(data_dir)
}

fn build_registry(settings: &UpscaleSettings) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::with_builtin_models(settings.models_dir.clone());
    registry.discover()?;
    Ok(registry)
}

fn build_engine(settings: &UpscaleSettings, full_precision: bool) -> Result<Arc<UpscaleEngine>> {
    let loader = OrtModelLoader::new(
        build_registry(settings)?,
        settings.backend,
        settings.trt_cache_dir.clone(),
    );
    let progress = Arc::new(ProgressSink::new());
    attach_progress_renderer(&progress);

    let reduced_precision = settings.fp16 && !full_precision;
    let cache = ModelCache::new(
        Arc::new(loader),
        progress,
        settings.max_loaded_models,
        reduced_precision,
    )?;
    info!(
        backend = %settings.backend,
        capacity = settings.max_loaded_models,
        reduced_precision,
        "Upscale engine ready"
    );
    Ok(Arc::new(UpscaleEngine::new(Arc::new(cache))))
}

/// Explicit `--format` wins, then a supported extension on `--output`, then the config default.
fn resolve_format(explicit: Option<&str>, output: Option<&Path>, default: &str) -> Result<String> {
    let from_output = output
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .map(|ext| if ext == "tif" { "tiff".to_string() } else { ext })
        .filter(|ext| SUPPORTED_OUTPUT_FORMATS.contains(&ext.as_str()));

    let format = match explicit {
        Some(format) => format.trim().to_ascii_lowercase(),
        None => from_output.unwrap_or_else(|| default.to_string()),
    };
    if !SUPPORTED_OUTPUT_FORMATS.contains(&format.as_str()) {
        bail!(
            "unsupported output format '{format}' (expected one of: {})",
            SUPPORTED_OUTPUT_FORMATS.join(", ")
        );
    }
    Ok(format)
}

fn build_request(model_id: &str, process: &ProcessArgs, settings: &UpscaleSettings) -> UpscaleRequest {
    let mut request = settings.request(model_id);
    if let Some(scale) = process.scale {
        request.target_scale = scale;
    }
    if let Some(tile_size) = process.tile_size {
        request.tile_size = tile_size;
    }
    if let Some(overlap) = process.overlap {
        request.overlap = overlap;
    }
    if process.full_precision {
        request.precision = PrecisionMode::Full;
    }
    request
}

fn output_options(
    process: &ProcessArgs,
    output: Option<&Path>,
    settings: &UpscaleSettings,
) -> Result<OutputOptions> {
    Ok(OutputOptions {
        format: resolve_format(process.format.as_deref(), output, &settings.format)?,
        jpeg_quality: process.quality.unwrap_or(settings.jpeg_quality).clamp(1, 100),
    })
}

async fn run_upscale(args: UpscaleArgs, settings: &UpscaleSettings) -> Result<()> {
    let request = build_request(&args.model, &args.process, settings);
    let options = output_options(&args.process, args.output.as_deref(), settings)?;
    let output = args.output.clone().unwrap_or_else(|| {
        settings.output_dir.join(default_output_name(
            &args.input,
            request.target_scale,
            &request.model_id,
            &options.format,
        ))
    });

    let engine = build_engine(settings, args.process.full_precision)?;
    let task_engine = Arc::clone(&engine);
    let input = args.input.clone();
    let task_output = output.clone();
    let result = tokio::task::spawn_blocking(move || {
        upscale_file(&task_engine, &input, &task_output, &request, &options)
    })
    .await
    .context("upscale task panicked");
    engine.cache().unload_all();

    result??;
    println!("{}", output.display());
    Ok(())
}

async fn run_batch_command(args: BatchArgs, settings: &UpscaleSettings) -> Result<()> {
    if args.jobs == 0 {
        bail!("--jobs must be at least 1");
    }
    let request = build_request(&args.model, &args.process, settings);
    let options = BatchOptions {
        input_dir: args.input_dir.clone(),
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| settings.output_dir.clone()),
        recursive: args.recursive,
        skip_existing: args.skip_existing,
        output: output_options(&args.process, None, settings)?,
    };
    let items = plan_batch(&options, &request)?;
    if items.is_empty() {
        warn!(input_dir = %options.input_dir.display(), "No images found");
        return Ok(());
    }
    info!(images = items.len(), jobs = args.jobs, model = %request.model_id, "Starting batch");

    let engine = build_engine(settings, args.process.full_precision)?;
    let request = Arc::new(request);
    let options = Arc::new(options);
    let permits = Arc::new(Semaphore::new(args.jobs));
    let mut tasks = JoinSet::new();

    for item in items.iter().cloned() {
        let engine = Arc::clone(&engine);
        let request = Arc::clone(&request);
        let options = Arc::clone(&options);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let input = item.input.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                process_item(&engine, &item, &request, &options)
            })
            .await?;
            anyhow::Ok((input, outcome))
        });
    }

    let mut result = BatchResult::new(items.len());
    let mut task_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(anyhow::Error::from).and_then(|r| r) {
            Ok((input, outcome)) => result.record(&input, outcome, engine.progress()),
            Err(e) => task_error = Some(e),
        }
    }
    engine.cache().unload_all();
    eprintln!();

    if let Some(e) = task_error {
        return Err(e.context("batch worker failed"));
    }
    println!(
        "{} completed, {} skipped, {} failed (of {})",
        result.completed, result.skipped, result.failed, result.total
    );
    for error in &result.errors {
        eprintln!("  {error}");
    }
    if result.failed > 0 {
        bail!("{} image(s) failed", result.failed);
    }
    Ok(())
}

async fn run_compare(args: CompareArgs, settings: &UpscaleSettings) -> Result<()> {
    let template = build_request(&args.models[0], &args.process, settings);
    let options = output_options(&args.process, None, settings)?;
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| settings.output_dir.clone());

    let engine = build_engine(settings, args.process.full_precision)?;
    let task_engine = Arc::clone(&engine);
    let input = args.input.clone();
    let models = args.models.clone();
    let comparison = tokio::task::spawn_blocking(move || {
        ComparisonRunner::new(&task_engine).compare(&input, &models, &template, &output_dir, &options)
    })
    .await
    .context("comparison task panicked")?;
    engine.cache().unload_all();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }
    for result in &comparison.results {
        match (&result.output_path, &result.error) {
            (Some(path), _) => println!(
                "{:<32} {:>8}  {}",
                result.model_id,
                format_duration(result.duration_seconds),
                path.display()
            ),
            (None, error) => println!(
                "{:<32} {:>8}  FAILED: {}",
                result.model_id,
                format_duration(result.duration_seconds),
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    Ok(())
}

fn run_models(args: ModelsArgs, settings: &UpscaleSettings) -> Result<()> {
    let registry = build_registry(settings)?;
    if args.json {
        println!("{}", registry.to_json()?);
        return Ok(());
    }
    for entry in registry.list() {
        let scale = entry
            .scale
            .map(|s| format!("{s}x"))
            .unwrap_or_else(|| "?".to_string());
        let status = if registry.is_downloaded(&entry.name) {
            "installed"
        } else {
            "missing"
        };
        println!(
            "{:<32} {:>4}  {:<12} {:<9}  {}",
            entry.name, scale, entry.architecture, status, entry.description
        );
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let total = secs.round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn render_bar(done: usize, total: usize) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    format!("[{}{}] {:5.1}%", "█".repeat(filled), "░".repeat(empty), fraction * 100.0)
}

/// One-line rendering of an event for the terminal. Tile progress redraws in
/// place (`\r`), everything else gets its own line.
fn describe_event(event: &ProgressEvent) -> Option<String> {
    let line = match event {
        ProgressEvent::ModelLoading { model_id } => format!("Loading {model_id}..."),
        ProgressEvent::ModelLoaded {
            model_id,
            scale,
            precision,
        } => format!("Loaded {model_id} ({scale}x, {precision})"),
        ProgressEvent::ModelEvicted { .. } => return None,
        ProgressEvent::TileProgress {
            pass_num,
            total_passes,
            tiles_done,
            tiles_total,
        } => {
            return Some(format!(
                "\r{} | Pass {pass_num}/{total_passes} | Tile {tiles_done}/{tiles_total}    ",
                render_bar(*tiles_done, *tiles_total)
            ))
        }
        ProgressEvent::TileSizeReduced { model_id, from, to } => {
            format!("Out of memory with {model_id}, tile size {from} -> {to}")
        }
        ProgressEvent::PrecisionFallback { model_id } => {
            format!("{model_id} does not support fp16, retrying in fp32")
        }
        ProgressEvent::ImageComplete {
            output,
            duration_seconds,
            ..
        } => format!("Saved {output} ({})", format_duration(*duration_seconds)),
        ProgressEvent::ImageError { input, error } => format!("Failed {input}: {error}"),
        ProgressEvent::BatchProgress {
            done,
            total,
            current,
        } => format!("[{done}/{total}] {current}"),
        ProgressEvent::ComparisonModelStart {
            model_id,
            index,
            total,
        } => format!("Model {}/{total}: {model_id}", index + 1),
        ProgressEvent::ComparisonModelDone { .. } => return None,
    };
    Some(format!("\r{line}\n"))
}

fn attach_progress_renderer(progress: &ProgressSink) {
    progress.subscribe(|event| {
        if let Some(text) = describe_event(event) {
            eprint!("{text}");
        }
    });
}



#[cfg(test)]
mod progress_tests {
    use super::*;
    use tilescale_core::Precision;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(2.345), "2.3s");
        assert_eq!(format_duration(45.0), "45.0s");
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(3600.0), "01:00:00");
    }

    #[test]
    fn bar_fills_proportionally() {
        assert_eq!(render_bar(0, 4), format!("[{}]   0.0%", "░".repeat(30)));
        assert_eq!(render_bar(4, 4), format!("[{}] 100.0%", "█".repeat(30)));
        assert!(render_bar(1, 2).starts_with(&format!("[{}", "█".repeat(15))));
        assert_eq!(render_bar(3, 0), render_bar(0, 1));
    }

    #[test]
    fn tile_progress_redraws_in_place() {
        let text = describe_event(&ProgressEvent::TileProgress {
            pass_num: 1,
            total_passes: 2,
            tiles_done: 3,
            tiles_total: 6,
        })
        .unwrap();
        assert!(text.starts_with('\r'));
        assert!(!text.ends_with('\n'));
        assert!(text.contains("Pass 1/2 | Tile 3/6"));
    }

    #[test]
    fn other_events_get_their_own_line() {
        let text = describe_event(&ProgressEvent::ModelLoaded {
            model_id: "RealESRGAN_x4plus".into(),
            scale: 4,
            precision: Precision::Reduced,
        })
        .unwrap();
        assert_eq!(text, "\rLoaded RealESRGAN_x4plus (4x, fp16)\n");

        assert!(describe_event(&ProgressEvent::ModelEvicted {
            model_id: "x".into()
        })
        .is_none());
    }
}
