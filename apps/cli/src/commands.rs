//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::RwLock;
use tracing::info;
use url::Url;

use concierge_core::{AnswerStreamer, Fragment, IngestService, OpenAiGenerator, Retriever};
use concierge_index::OpenAiEmbedder;
use concierge_policy::RuleSet;
use concierge_shared::{
    AppConfig, CrawlConfig, PolicyConfig, init_config, load_config, validate_api_key,
};
use concierge_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Concierge: a crawl-and-ask knowledge base for your own sites.
#[derive(Parser)]
#[command(
    name = "concierge",
    version,
    about = "Crawl allowlisted sites into a local knowledge base and ask questions against it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Initialize the config file with defaults.
    Init,

    /// Crawl and index content from the configured or given seeds.
    Ingest {
        /// Seed URL (can be specified multiple times; defaults to config).
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// Maximum pages to fetch this run (defaults to config).
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Ask a question against the indexed content.
    Ask {
        /// The question.
        message: String,
    },

    /// Show the status of the latest ingestion run.
    Status,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "concierge=info",
        1 => "concierge=debug",
        _ => "concierge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init => cmd_init().await,
        Command::Ingest { seeds, max_pages } => cmd_ingest(seeds, max_pages).await,
        Command::Ask { message } => cmd_ask(&message).await,
        Command::Status => cmd_status().await,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_init() -> Result<()> {
    let path = init_config()?;
    println!("Created config file at {}", path.display());
    println!("Edit [policy] to set seeds and allow/deny patterns before ingesting.");
    Ok(())
}

async fn cmd_ingest(seed_args: Vec<String>, max_pages: Option<usize>) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let seed_strings = if seed_args.is_empty() {
        config.policy.seeds.clone()
    } else {
        seed_args
    };
    if seed_strings.is_empty() {
        return Err(eyre!(
            "no seeds: pass --seed or set [policy] seeds in the config file"
        ));
    }

    let mut seeds = Vec::with_capacity(seed_strings.len());
    for raw in &seed_strings {
        seeds.push(Url::parse(raw).map_err(|e| eyre!("invalid seed URL '{raw}': {e}"))?);
    }

    let mut crawl_config = CrawlConfig::from(&config);
    if let Some(cap) = max_pages {
        crawl_config.page_cap = cap;
    }
    let policy_config = PolicyConfig::from(&config);

    let storage = open_storage(&config).await?;
    let index = Arc::new(RwLock::new(
        IngestService::rebuild_index(&storage).await?,
    ));
    let embedder = Arc::new(build_embedder(&config)?);

    let stop = Arc::new(AtomicBool::new(false));
    let service = Arc::new(IngestService::new(
        crawl_config,
        policy_config,
        embedder,
        index,
        storage,
        stop,
    ));

    // First Ctrl-C stops the run cooperatively; a second one kills the process.
    {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nstopping after in-flight pages...");
                service.request_stop();
            }
        });
    }

    info!(seeds = seeds.len(), "starting ingestion");
    let spinner = make_spinner("crawling and indexing...");
    let report = service.run(seeds).await?;
    spinner.finish_and_clear();

    println!();
    println!("  Ingestion complete");
    println!("  Discovered: {}", report.pages_discovered);
    println!("  Fetched:    {}", report.pages_fetched);
    println!("  Indexed:    {}", report.pages_indexed);
    println!("  Failed:     {}", report.pages_failed);
    println!("  Skipped:    {}", report.pages_skipped);
    if report.cap_reached {
        println!("  Note: page cap reached before the frontier drained.");
    }
    println!("  Time:       {:.1}s", report.duration.as_secs_f64());
    println!();
    Ok(())
}

async fn cmd_ask(message: &str) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let storage = open_storage(&config).await?;
    if storage.count_documents().await? == 0 {
        return Err(eyre!("the knowledge base is empty; run `concierge ingest` first"));
    }

    let index = Arc::new(RwLock::new(
        IngestService::rebuild_index(&storage).await?,
    ));
    let embedder = Arc::new(build_embedder(&config)?);
    let api_key = api_key(&config)?;
    let generator = Arc::new(OpenAiGenerator::new(
        &api_key,
        &config.models.base_url,
        config.models.chat_model.clone(),
    )?);

    let retriever = Arc::new(Retriever::new(
        embedder,
        index,
        storage.clone(),
        config.defaults.top_k,
    ));
    let rules = RuleSet::compile(&config.policy.allow_patterns, &config.policy.deny_patterns)?;
    let streamer = Arc::new(AnswerStreamer::new(retriever, generator, storage, rules));

    let mut rx = streamer.answer(message.to_string());
    let mut stdout = std::io::stdout();
    while let Some(fragment) = rx.recv().await {
        match fragment {
            Fragment::Delta(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            Fragment::Sources(sources) => {
                println!("\n\nSources:");
                for source in sources {
                    match source.title {
                        Some(title) => println!("  {title}: {} ({})", source.url, source.image_url),
                        None => println!("  {} ({})", source.url, source.image_url),
                    }
                }
            }
            Fragment::Error(message) => {
                println!();
                return Err(eyre!("generation failed: {message}"));
            }
            Fragment::Done => {
                println!();
            }
        }
    }
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let status = IngestService::status_of(&storage).await?;
    let documents = storage.count_documents().await?;

    println!();
    println!("  State:      {}", status.state.as_str());
    if let Some(run_id) = &status.run_id {
        println!("  Run:        {run_id}");
        println!("  Discovered: {}", status.pages_discovered);
        println!("  Indexed:    {}", status.pages_indexed);
        println!("  Failed:     {}", status.pages_failed);
        if let Some(elapsed) = status.elapsed {
            println!("  Elapsed:    {:.1}s", elapsed.as_secs_f64());
        }
        if let Some(error) = &status.error {
            println!("  Error:      {error}");
        }
    }
    println!("  Documents:  {documents}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let db_path = expand_home(&config.defaults.data_dir).join("concierge.db");
    Ok(Arc::new(Storage::open(&db_path).await?))
}

fn build_embedder(config: &AppConfig) -> Result<OpenAiEmbedder> {
    let api_key = api_key(config)?;
    Ok(OpenAiEmbedder::new(
        &api_key,
        &config.models.base_url,
        config.models.embed_model.clone(),
    )?)
}

fn api_key(config: &AppConfig) -> Result<String> {
    std::env::var(&config.models.api_key_env)
        .map_err(|_| eyre!("set the {} environment variable", config.models.api_key_env))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn make_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}
