//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use oncall_core::{AnalysisService, LlmProvider, OpenRouterClient, build_engine};
use oncall_retrieval::{ChunkingOptions, KnowledgeBase, RetrievalQuery};
use oncall_shared::{
    AnalysisReport, AppConfig, Artifact, ProgressEvent, TaskResult, init_config, init_config_at,
    load_config_or_default, validate_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Oncall Lens: evidence-backed incident analysis.
#[derive(Parser)]
#[command(
    name = "oncall-lens",
    version,
    about = "Analyze incident artifacts against past postmortems and produce a ranked root-cause report.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.oncall-lens/oncall-lens.toml).
    #[arg(long, env = "ONCALL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Analyze incident artifacts (logs, stack traces, diffs, ...).
    Analyze {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Retrieval preset: hybrid, ensemble, or a single strategy name.
        #[arg(long)]
        preset: Option<String>,

        /// Print raw text/event-stream frames instead of a progress bar.
        #[arg(long)]
        events: bool,

        /// Print the final report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the knowledge base and print the fused ranking.
    Search {
        /// Query text.
        query: String,

        /// Retrieval preset: hybrid, ensemble, or a single strategy name.
        #[arg(long)]
        preset: Option<String>,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Knowledge-base utilities.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Knowledge-base subcommands.
#[derive(Subcommand)]
pub(crate) enum KbAction {
    /// Show document, chunk and facet counts.
    Stats,
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
        0 => "oncall=info",
        1 => "oncall=debug",
        _ => "oncall=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so stdout stays clean for reports and event frames.
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
        Command::Analyze {
            files,
            preset,
            events,
            json,
        } => cmd_analyze(config_path, &files, preset, events, json).await,
        Command::Search {
            query,
            preset,
            top_k,
        } => cmd_search(config_path, &query, preset, top_k).await,
        Command::Kb { action } => match action {
            KbAction::Stats => cmd_kb_stats(config_path),
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn load(config_path: Option<&Path>, preset: Option<String>) -> Result<AppConfig> {
    let mut config = load_config_or_default(config_path)?;
    if let Some(preset) = preset {
        config.retrieval.preset = preset;
        config.retrieval.weights.clear();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

async fn cmd_analyze(
    config_path: Option<&Path>,
    files: &[PathBuf],
    preset: Option<String>,
    events: bool,
    json: bool,
) -> Result<()> {
    let config = load(config_path, preset)?;
    validate_api_key(&config)?;

    let artifacts = files
        .iter()
        .map(|path| {
            let bytes =
                std::fs::read(path).map_err(|e| eyre!("cannot read {}: {e}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(Artifact::new(name, bytes))
        })
        .collect::<Result<Vec<_>>>()?;

    let llm: Arc<dyn LlmProvider> = Arc::new(OpenRouterClient::from_config(&config.llm)?);
    let service = AnalysisService::from_config(&config, llm)?;
    let _sweeper = service.spawn_sweeper();

    let task_id = service.create(artifacts)?;
    info!(%task_id, "analysis started");

    if events {
        let mut frames = pin!(service.event_stream(task_id)?);
        while let Some(frame) = frames.next().await {
            print!("{frame}");
        }
    } else {
        let progress = CliProgress::new();
        let mut subscription = service.subscribe(task_id)?;
        while let Some(event) = subscription.next_event().await {
            match event {
                Ok(event) => progress.update(&event),
                Err(e) => {
                    progress.finish();
                    return Err(e.into());
                }
            }
        }
        progress.finish();
    }

    match service.get_result(task_id)? {
        TaskResult::Completed { report } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
        TaskResult::Failed { error } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&error)?);
            }
            Err(eyre!("analysis failed: {error}"))
        }
        TaskResult::Pending => Err(eyre!("analysis {task_id} did not complete")),
    }
}

fn print_report(report: &AnalysisReport) {
    println!();
    println!("{}", report.report);
    println!();
    println!("  Confidence: {:.0}%", report.confidence * 100.0);
    println!(
        "  Files:      {} of {} processed",
        report.files_processed, report.files_total
    );
    println!("  Time:       {:.1}s", report.processing_time_ms as f64 / 1000.0);

    if !report.root_causes.is_empty() {
        println!();
        println!("  Root causes:");
        for (i, cause) in report.root_causes.iter().enumerate() {
            println!(
                "    {}. [{}] {} ({:.0}%)",
                i + 1,
                cause.category,
                cause.description,
                cause.confidence * 100.0
            );
        }
    }

    if !report.sources.is_empty() {
        println!();
        println!("  Similar incidents:");
        for source in &report.sources {
            println!("    - {} ({}, {:.3})", source.title, source.source, source.score);
        }
    }

    if !report.recommendations.is_empty() {
        println!();
        println!("  Recommendations:");
        for rec in &report.recommendations {
            println!("    - {} {}: {}", rec.priority, rec.category, rec.action);
        }
    }
    println!();
}

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn update(&self, event: &ProgressEvent) {
        self.bar.set_position(u64::from(event.percentage));
        self.bar
            .set_message(format!("{}: {}", event.stage, event.message));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// search / kb
// ---------------------------------------------------------------------------

async fn cmd_search(
    config_path: Option<&Path>,
    query: &str,
    preset: Option<String>,
    top_k: Option<usize>,
) -> Result<()> {
    let config = load(config_path, preset)?;
    let engine = build_engine(&config, None)?;
    let weights = engine.weights_from_config(&config.retrieval)?;

    let top_k = top_k.unwrap_or(config.retrieval.top_k);
    let outcome = engine
        .retrieve(&RetrievalQuery::new(query, top_k), &weights)
        .await?;

    for note in &outcome.degraded {
        warn!("{note}");
    }
    if outcome.documents.is_empty() {
        println!("No matching documents.");
        return Ok(());
    }

    for (i, doc) in outcome.documents.iter().enumerate() {
        let rerank = doc
            .rerank_score
            .map(|s| format!(", rerank {s:.3}"))
            .unwrap_or_default();
        println!(
            "{:>2}. {} ({})  fused {:.3}{rerank}",
            i + 1,
            doc.title(),
            doc.source(),
            doc.fused_score
        );
    }
    println!();
    println!("  Confidence: {:.0}%", outcome.top_confidence() * 100.0);
    Ok(())
}

fn cmd_kb_stats(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path, None)?;
    let chunking = ChunkingOptions {
        size: config.retrieval.chunk_size,
        overlap: config.retrieval.chunk_overlap,
    };
    let kb = KnowledgeBase::load(Path::new(&config.retrieval.knowledge_base_path), chunking)?;
    let stats = kb.stats();

    println!("  Path:      {}", config.retrieval.knowledge_base_path);
    println!("  Documents: {}", stats.documents);
    println!("  Chunks:    {}", stats.chunks);
    println!("  Bytes:     {}", stats.total_bytes);
    for (field, values) in &stats.facets {
        println!();
        println!("  {field}:");
        for (value, count) in values {
            println!("    {value}: {count}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => init_config_at(path)?,
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path, None)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
