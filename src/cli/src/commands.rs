//! CLI command definitions and dispatch.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use shale_core::error::Result;
use shale_core::options::{Platform, PrepareOptions};
use shale_engine::analyze::registry;
use shale_engine::image::cache::ImageCache;
use shale_engine::{analyze_all, diff_all, ImageSource};

/// Shale — container image inspection and comparison.
#[derive(Parser)]
#[command(name = "shale", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Analyze a single image
    Analyze(AnalyzeArgs),
    /// Compare two images
    Diff(DiffArgs),
    /// Manage the unpack cache
    Cache(CacheArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Args)]
pub struct CommonArgs {
    /// Analyzers to run (repeatable), e.g. -t apt -t file
    #[arg(short = 't', long = "type", default_values = ["size"])]
    pub types: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    pub output: OutputFormat,

    /// Consult and populate the unpack cache
    #[arg(short = 'c', long)]
    pub cache: bool,

    /// Platform for multi-platform images, e.g. linux/arm64
    #[arg(long)]
    pub platform: Option<String>,

    /// Per-analyzer timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Registry transport attempts
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Image reference (registry, daemon://, tar://, dir://)
    pub image: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct DiffArgs {
    /// First image reference
    pub image1: String,

    /// Second image reference
    pub image2: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Remove every cached image filesystem
    Purge,
}

/// Run the requested command, returning the process exit code.
pub async fn dispatch(cli: Cli) -> i32 {
    let result = match cli.command {
        Command::Analyze(args) => run_analyze(args).await,
        Command::Diff(args) => run_diff(args).await,
        Command::Cache(args) => run_cache(args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

fn prepare_options(common: &CommonArgs) -> Result<PrepareOptions> {
    let platform = match &common.platform {
        Some(value) => Some(Platform::parse(value)?),
        None => None,
    };
    Ok(PrepareOptions {
        include_layers: common.types.iter().any(|t| registry::requires_layers(t)),
        use_cache: common.cache,
        platform,
        retries: common.retries,
    })
}

async fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    // Unknown analyzer names fail before any image work
    registry::resolve_all(&args.common.types)?;
    let opts = prepare_options(&args.common)?;

    let source = ImageSource::with_defaults(args.common.retries)?;
    let image = Arc::new(source.prepare(&args.image, &opts).await?);

    let timeout = Duration::from_secs(args.common.timeout);
    let results = analyze_all(&args.common.types, Arc::clone(&image), timeout).await;

    let mut worst = 0;
    let mut rendered = Vec::new();
    for (name, result) in results {
        match result {
            Ok(analysis) => rendered.push(render_analysis(&analysis, args.common.output)?),
            Err(e) => {
                tracing::error!(analyzer = %name, error = %e, "Analyzer failed");
                worst = worst.max(e.exit_code());
            }
        }
    }
    emit(rendered, args.common.output);

    image.cleanup();
    Ok(worst)
}

async fn run_diff(args: DiffArgs) -> Result<i32> {
    registry::resolve_all(&args.common.types)?;
    let opts = prepare_options(&args.common)?;

    let source = ImageSource::with_defaults(args.common.retries)?;
    let image1 = Arc::new(source.prepare(&args.image1, &opts).await?);
    let image2 = match source.prepare(&args.image2, &opts).await {
        Ok(image) => Arc::new(image),
        Err(e) => {
            image1.cleanup();
            return Err(e);
        }
    };

    let timeout = Duration::from_secs(args.common.timeout);
    let results = diff_all(
        &args.common.types,
        Arc::clone(&image1),
        Arc::clone(&image2),
        timeout,
    )
    .await;

    let mut worst = 0;
    let mut rendered = Vec::new();
    for (name, result) in results {
        match result {
            Ok(diff) => rendered.push(render_diff(&diff, args.common.output)?),
            Err(e) => {
                tracing::error!(analyzer = %name, error = %e, "Analyzer failed");
                worst = worst.max(e.exit_code());
            }
        }
    }
    emit(rendered, args.common.output);

    image1.cleanup();
    image2.cleanup();
    Ok(worst)
}

fn run_cache(args: CacheArgs) -> Result<i32> {
    match args.command {
        CacheCommand::Purge => {
            let cache = ImageCache::new(ImageCache::default_root())?;
            cache.purge()?;
            Ok(0)
        }
    }
}

fn render_analysis(
    result: &shale_engine::AnalyzeResult,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Json => result.to_json(),
        OutputFormat::Text => Ok(result.to_text()),
    }
}

fn render_diff(result: &shale_engine::DiffResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => result.to_json(),
        OutputFormat::Text => Ok(result.to_text()),
    }
}

fn emit(rendered: Vec<String>, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("[{}]", rendered.join(",\n")),
        OutputFormat::Text => {
            for section in rendered {
                println!("{section}");
            }
        }
    }
}
