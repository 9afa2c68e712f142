//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use recordflow_core::{
    AssetRefiner, Collaborators, LogProgress, PipelineConfig, ProgressReporter, ProgressSnapshot,
    RunSummary, Services, run_pipeline,
};
use recordflow_crawler::Crawler;
use recordflow_shared::{
    AppConfig, BackoffPolicy, CrawlConfig, init_config, load_config, load_config_from,
    parse_website, validate_config,
};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// RecordFlow: verify and enrich directory-style business records.
#[derive(Parser)]
#[command(
    name = "recordflow",
    version,
    about = "Resolve, crawl, and enrich business records with a resumable worker pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.recordflow/recordflow.toml.
    #[arg(long, global = true, env = "RECORDFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the enrichment pipeline over the input file.
    Run {
        /// Continue after the last checkpoint and append to existing output.
        #[arg(long)]
        resume: bool,

        /// Stop after this many input records.
        #[arg(long)]
        limit: Option<usize>,

        /// Number of parallel workers.
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        workers: Option<u16>,

        /// Input NDJSON file.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output NDJSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Drop records without a usable website.
        #[arg(long)]
        require_website: bool,
    },

    /// Crawl and refine a single website, printing the result as JSON.
    Crawl {
        /// Website root URL.
        url: String,

        /// Content store root (defaults to paths.content_store).
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the raw manifest without refinement.
        #[arg(long)]
        raw: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "recordflow=info",
        1 => "recordflow=debug",
        _ => "recordflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            resume,
            limit,
            workers,
            input,
            output,
            require_website,
        } => {
            let mut config = resolve_config(config_path)?;
            if let Some(workers) = workers {
                config.pipeline.workers = usize::from(workers);
            }
            if let Some(input) = input {
                config.paths.input = input;
            }
            if let Some(output) = output {
                config.paths.output = output;
            }
            config.pipeline.require_website |= require_website;
            validate_config(&config)?;

            let reporter: Arc<dyn ProgressReporter> = match cli.log_format {
                LogFormat::Text => Arc::new(CliProgress::new()),
                LogFormat::Json => Arc::new(LogProgress),
            };
            cmd_run(&config, resume, limit, reporter).await
        }
        Command::Crawl { url, out, raw } => {
            let config = resolve_config(config_path)?;
            cmd_crawl(&config, &url, out, raw).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    resume: bool,
    limit: Option<usize>,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let mut pipeline = PipelineConfig::from_app_config(config);
    pipeline.resume = resume;
    pipeline.limit = limit;

    if !pipeline.input.is_file() {
        return Err(eyre!(
            "input file not found: {}",
            pipeline.input.display()
        ));
    }
    let services = Services::from_config(config)?;

    info!(
        input = %pipeline.input.display(),
        workers = pipeline.workers,
        resume,
        limit,
        "starting run"
    );

    let checkpoint = pipeline.checkpoint.clone();
    let summary = tokio::select! {
        result = run_pipeline(pipeline, services, reporter) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(checkpoint = %checkpoint.display(), "interrupted; rerun with --resume to continue");
            return Err(eyre!("interrupted"));
        }
    };

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run finished");
    println!("  Processed: {}", summary.completed);
    println!("  Written:   {}", summary.written);
    println!(
        "  Retried:   {} ({} ledger entries)",
        summary.retried, summary.retry_entries
    );
    println!("  Dropped:   {}", summary.dropped);
    println!("  Last index: {}", summary.last_processed_index);
    if !summary.usage.is_empty() {
        println!();
        println!("  {:<10} {:>12} {:>12} {:>10}", "Stage", "Input", "Output", "Cost");
        for (stage, usage) in &summary.usage {
            let cost = summary.cost_by_stage.get(stage).copied().unwrap_or_default();
            println!(
                "  {:<10} {:>12} {:>12} {:>10}",
                stage.as_str(),
                usage.input_tokens,
                usage.output_tokens,
                format!("${cost:.4}")
            );
        }
    }
    println!("  Total cost: ${:.4}", summary.total_cost);
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

async fn cmd_crawl(config: &AppConfig, url: &str, out: Option<PathBuf>, raw: bool) -> Result<()> {
    let root = parse_website(url).ok_or_else(|| eyre!("invalid URL '{url}'"))?;
    let content_store = out.unwrap_or_else(|| config.paths.content_store.clone());

    let crawler = Crawler::new(CrawlConfig::from(config), content_store)?;
    info!(%root, "crawling single site");
    let manifest = crawler.crawl(&root).await?;

    if raw {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    let collaborators = Collaborators::from_config(&config.services)?;
    let refiner = AssetRefiner::new(
        collaborators.ranking,
        config.refine.clone(),
        BackoffPolicy::from(&config.services),
    );
    let refinement = refiner.refine(&manifest).await?;

    let report = serde_json::json!({
        "manifest": manifest,
        "refined": refinement.assets,
        "usage": refinement.usage,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress bar driven by the pipeline's periodic snapshots.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn report(&self, s: &ProgressSnapshot) {
        self.bar.set_length(s.total as u64);
        self.bar.set_position(s.completed as u64);
        let eta = s
            .eta
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "?".to_string());
        self.bar.set_message(format!(
            "{:.1}% | written {} | retried {} | dropped {} | ETA {eta} | ${:.4}",
            s.percent(),
            s.written,
            s.retried,
            s.dropped,
            s.cost
        ));
    }

    fn finish(&self, _snapshot: &ProgressSnapshot) {
        self.bar.finish_and_clear();
    }
}
