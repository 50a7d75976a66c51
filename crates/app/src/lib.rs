use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use restora_core::cache::SegmentCache;
use restora_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use restora_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use restora_core::model::{ExecutionStyle, ModelRegistry};
use restora_core::pipeline::SegmentProcessor;
use restora_core::raster::{PixelLayout, RasterImage};

#[derive(Parser)]
#[command(name = "restora", about = "Neural photo restoration and upscaling")]
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

#[derive(Subcommand)]
enum Commands {
    /// Restore or upscale a single photo
    Run(RunArgs),
    /// List the available models
    Models,
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to the input photo (PNG or JPEG)")]
    input: PathBuf,

    #[arg(short = 'o', long, help = "Output path (defaults to <input>_restored.png)")]
    output: Option<PathBuf>,

    #[arg(short = 'm', long, default_value = "restormer-defocus")]
    model: String,

    #[arg(long, help = "Override the models directory from config")]
    models_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(resolved_data_dir.as_path());

    match cli.command {
        Commands::Run(run) => restore_photo(run, resolved_data_dir).await,
        Commands::Models => {
            list_models();
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
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

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

async fn restore_photo(args: RunArgs, data_dir: PathBuf) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let models_dir = args
        .models_dir
        .unwrap_or_else(|| resolve_relative_to(&data_dir, &config.paths.models_dir));
    let cache_dir = resolve_relative_to(&data_dir, &config.paths.cache_dir);

    let registry = ModelRegistry::with_builtin_models(models_dir);
    let cache = SegmentCache::new(cache_dir)?;
    let mut processor = SegmentProcessor::new(registry, cache);

    let input_image = load_photo(&args.input)?;
    let output_path = args
        .output
        .unwrap_or_else(|| default_output_path(&args.input));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling after the current segment...");
            let _ = cancel_tx.send(true);
        }
    });

    let progress: Box<dyn Fn(u8) + Send> = Box::new(|percent| {
        eprint!("\rRestoring: {percent:3}%");
    });

    let start = Instant::now();
    info!(
        input = %args.input.display(),
        model = %args.model,
        width = input_image.width(),
        height = input_image.height(),
        "starting restoration"
    );

    let result = processor
        .process(&input_image, &args.model, Some(progress), Some(cancel_rx))
        .await;
    eprintln!();
    let restored = result?;

    save_photo(&restored, &output_path)?;
    info!(
        output = %output_path.display(),
        width = restored.width(),
        height = restored.height(),
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "restoration complete"
    );
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn list_models() {
    let registry = ModelRegistry::with_builtin_models(PathBuf::from("models"));
    println!("{:<20} {:>6} {:>6}  {}", "NAME", "TILE", "SCALE", "DESCRIPTION");
    for spec in registry.list() {
        let style = match spec.style {
            ExecutionStyle::DenseTensor => "dense",
            ExecutionStyle::VisionPipeline => "vision",
        };
        println!(
            "{:<20} {:>6} {:>5}x  {} ({style})",
            spec.name, spec.input_size, spec.scale_factor, spec.description
        );
    }
}

fn load_photo(path: &Path) -> Result<RasterImage> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to open input photo: {}", path.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    RasterImage::new(decoded.into_raw(), width, height, PixelLayout::Rgb8).map_err(Into::into)
}

fn save_photo(photo: &RasterImage, path: &Path) -> Result<()> {
    let rgb = photo.to_rgb8()?;
    let (width, height) = (rgb.width(), rgb.height());
    let encoded = image::RgbImage::from_raw(width, height, rgb.into_data())
        .context("restored image buffer does not match its dimensions")?;
    encoded
        .save(path)
        .with_context(|| format!("failed to write output photo: {}", path.display()))
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    input.with_file_name(format!("{stem}_restored.png"))
}
