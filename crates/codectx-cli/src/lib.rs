//! Command-line interface for codectx.

pub mod display;
pub mod index_client;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use codectx_config::CodectxConfig;
use codectx_index::{NoopDisplay, RunOutcome, SearchQueryOptions, SearchResultWithContext, StatusDisplay};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use display::ProgressDisplay;
use index_client::IndexClient;

#[derive(Debug, Parser)]
#[command(
    name = "codectx",
    version,
    about = "Index a codebase and search it by meaning and by keyword"
)]
pub struct Cli {
    /// Configuration file to use instead of the standard locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Index a project directory
    Index(IndexArgs),
    /// Search the index
    Search(SearchArgs),
    /// Show what is indexed
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Project root
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Project name (defaults to the directory name)
    #[arg(long)]
    pub project: Option<String>,

    /// Report status snapshots instead of drawing a progress bar
    #[arg(long)]
    pub background: bool,

    /// Drop the existing index before indexing
    #[arg(long)]
    pub rebuild: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub query: String,

    /// Project root whose index to search
    #[arg(long, default_value = ".")]
    pub path: PathBuf,

    #[arg(long)]
    pub file_type: Option<String>,

    #[arg(long)]
    pub language: Option<String>,

    /// Restrict to these project ids (repeatable)
    #[arg(long = "project")]
    pub projects: Vec<String>,

    #[arg(long)]
    pub min_score: Option<f32>,

    #[arg(short, long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(default_value = ".")]
    pub path: PathBuf,

    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    fn query_options(&self) -> SearchQueryOptions {
        let mut options = SearchQueryOptions::new();
        if let Some(file_type) = &self.file_type {
            options = options.with_file_type(file_type.trim_start_matches('.'));
        }
        if let Some(language) = &self.language {
            options = options.with_language(language.to_lowercase());
        }
        if !self.projects.is_empty() {
            options = options.with_project_ids(self.projects.iter().cloned());
        }
        if let Some(min_score) = self.min_score {
            options = options.with_min_score(min_score);
        }
        options
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("warn,codectx_index=info,codectx_cli=info"),
            1 => EnvFilter::new("info,codectx_index=debug,codectx_cli=debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // Results go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Parse arguments and run the selected command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file {} does not exist", path.display());
            }
            CodectxConfig::load_from(std::slice::from_ref(path))
        }
        None => CodectxConfig::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Commands::Index(args) => cmd_index(&config, args).await,
        Commands::Search(args) => cmd_search(&config, args).await,
        Commands::Status(args) => cmd_status(&config, args).await,
    }
}

async fn cmd_index(config: &CodectxConfig, args: IndexArgs) -> Result<()> {
    let display: Arc<dyn StatusDisplay> = if args.background || args.json {
        Arc::new(NoopDisplay)
    } else {
        Arc::new(ProgressDisplay::new())
    };
    let client = IndexClient::new(config, &args.path, args.project.clone(), display).await?;
    let coordinator = client.coordinator().clone();

    let started = client.start_index(args.rebuild)?;
    if args.background {
        println!("{}", serde_json::to_string(&started)?);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = coordinator.wait_idle() => break,
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                warn!("Interrupted, cancelling indexing after the current batch");
                coordinator.cancel();
            }
            _ = ticker.tick(), if args.background => {
                println!("{}", serde_json::to_string(&coordinator.get_status())?);
            }
        }
    }

    match coordinator.last_outcome() {
        Some(RunOutcome::Completed(stats)) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if args.background {
                println!(
                    "Indexed {} chunks from {} files",
                    stats.chunks_embedded, stats.files_processed
                );
            }
            Ok(())
        }
        Some(RunOutcome::Cancelled { embedded }) => {
            if args.json {
                println!("{}", serde_json::json!({ "cancelled": true, "embedded": embedded }));
            } else if args.background {
                println!("Cancelled after {embedded} chunks");
            }
            Ok(())
        }
        Some(RunOutcome::Failed(message)) => bail!("Indexing failed: {message}"),
        None => bail!("Indexing ended without an outcome"),
    }
}

async fn cmd_search(config: &CodectxConfig, args: SearchArgs) -> Result<()> {
    let client = IndexClient::new(config, &args.path, None, Arc::new(NoopDisplay)).await?;
    let results = client
        .search(&args.query, &args.query_options(), args.limit)
        .await?;

    if args.json {
        let output = serde_json::json!({
            "query": args.query,
            "resultCount": results.len(),
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[SearchResultWithContext]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (rank, r) in results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] {}:{}-{}",
            rank + 1,
            r.score,
            r.file_path,
            r.line_range.start,
            r.line_range.end
        );
        for line in r.content.lines().take(3) {
            println!("       {line}");
        }
    }
    println!("\n{} result(s)", results.len());
}

async fn cmd_status(config: &CodectxConfig, args: StatusArgs) -> Result<()> {
    let client = IndexClient::new(config, &args.path, None, Arc::new(NoopDisplay)).await?;
    let summary = client.summary().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Project:    {} ({})", summary.project, summary.project_id);
    println!("State:      {}", summary.state_dir.display());
    match &summary.embedding {
        Some(info) => println!("Embeddings: {info}"),
        None => println!("Embeddings: (nothing indexed yet)"),
    }
    println!("Chunks:     {} vectors, {} keyword documents", summary.stored_chunks, summary.keyword_documents);
    let mut projects: Vec<_> = summary.manifest.projects.values().collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    for project in projects {
        println!(
            "  - {}: {} files, {} chunks, indexed {}",
            project.name,
            project.file_count,
            project.chunk_count,
            project.indexed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
