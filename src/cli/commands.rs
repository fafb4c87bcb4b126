//! CLI command definitions for debate-arena.
//!
//! `run` plays a tournament from a configuration file, `validate` checks a
//! configuration without contacting any model, and `standings` rebuilds the
//! table from a stored result log.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::{LiteLlmClient, LlmProvider, DEFAULT_MODEL};
use crate::storage::{read_records, JsonlResultStore};
use crate::tournament::{AgentStanding, TournamentConfig, TournamentManager, TournamentSummary};

/// Exit code when the schedule could not be completed.
const EXIT_INCOMPLETE: u8 = 2;

/// Multi-agent debate tournaments between LLM-backed agents.
#[derive(Parser)]
#[command(name = "debate-arena")]
#[command(about = "Run debate tournaments between LLM-backed agents")]
#[command(version)]
#[command(
    long_about = "debate-arena pits LLM-backed agents against each other in structured debates.\n\nEvery debate is judged by a voting panel and appended to results.jsonl; standings are\nrecomputed from that log.\n\nExample usage:\n  debate-arena run --config tournament.yaml --output ./tournament-output"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a tournament. Resumes from an existing result log.
    Run(RunArgs),

    /// Check a tournament configuration.
    Validate(ValidateArgs),

    /// Recompute verdicts and standings from a result log.
    Standings(StandingsArgs),
}

/// Arguments for `debate-arena run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Tournament configuration (YAML or JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output directory; overrides `output_dir` from the configuration.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Model endpoint base URL; overrides `endpoint.api_base`.
    #[arg(long, env = "DEBATE_ARENA_API_BASE")]
    pub api_base: Option<String>,

    /// Debates running at once; overrides `concurrency_limit`.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `debate-arena validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Tournament configuration (YAML or JSON).
    #[arg(short, long)]
    pub config: PathBuf,
}

/// Arguments for `debate-arena standings`.
#[derive(Parser, Debug)]
pub struct StandingsArgs {
    /// Result log (`results.jsonl`).
    #[arg(short, long)]
    pub results: PathBuf,

    /// Print the standings as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Exposed so `main` can read the log level before initializing tracing.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI args and run the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_tournament_command(args).await,
        Commands::Validate(args) => run_validate_command(args),
        Commands::Standings(args) => run_standings_command(args).await,
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run_tournament_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = TournamentConfig::load(&args.config)?;
    if let Some(output) = args.output {
        config = config.with_output_dir(output);
    }
    if let Some(api_base) = args.api_base {
        config = config.with_api_base(api_base);
    }
    if let Some(limit) = args.concurrency {
        config = config.with_concurrency_limit(limit);
    }
    config.validate()?;

    let api_key = config.endpoint.resolve_api_key();
    if api_key.is_none() {
        if let Some(var) = &config.endpoint.api_key_env {
            warn!(env = %var, "No API key found, calling the endpoint without one");
        }
    }
    let provider: Arc<dyn LlmProvider> = Arc::new(LiteLlmClient::new(
        config.endpoint.api_base.clone(),
        api_key,
        DEFAULT_MODEL,
        config.endpoint.request_timeout(),
    )?);

    let store = Arc::new(JsonlResultStore::open(config.results_path()).await?);
    info!(
        api_base = %config.endpoint.api_base,
        results = %store.path().display(),
        stored_records = store.len().await,
        "Opened result log"
    );

    let standings_path = config.standings_path();
    let manager = TournamentManager::new(config, provider, store)?
        .with_summary_path(standings_path.clone());

    let stop = manager.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after in-flight model calls");
            stop.stop();
        }
    });

    let summary = manager.run().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
        println!("  Standings written to {}", standings_path.display());
    }

    Ok(if summary.schedule_complete {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}

fn print_summary(summary: &TournamentSummary) {
    if summary.schedule_complete {
        println!("✓ Tournament completed");
    } else {
        println!("✗ Tournament schedule incomplete");
    }
    println!(
        "  Matches: {} recorded, {} completed, {} aborted, {} undetermined, {} cancelled",
        summary.matches_recorded,
        summary.completed,
        summary.aborted,
        summary.undetermined,
        summary.cancelled
    );
    if summary.reused > 0 {
        println!("  Reused from earlier runs: {}", summary.reused);
    }
    if let Some(champion) = &summary.champion {
        println!("  Champion: {}", champion);
    }
    for problem in &summary.inconsistencies {
        println!("  Inconsistency: {}", problem);
    }
    println!();
    print_standings(&summary.standings);
}

fn print_standings(standings: &[AgentStanding]) {
    println!(
        "{:>4}  {:<20} {:>6} {:>4} {:>4} {:>4} {:>4} {:>6}",
        "rank", "agent", "played", "W", "L", "T", "U", "points"
    );
    for row in standings {
        println!(
            "{:>4}  {:<20} {:>6} {:>4} {:>4} {:>4} {:>4} {:>6}",
            row.rank, row.agent_id, row.played, row.wins, row.losses, row.ties, row.undetermined, row.points
        );
    }
}

// ============================================================================
// Validate
// ============================================================================

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<ExitCode> {
    let config = TournamentConfig::load(&args.config)?;
    config.validate()?;

    println!("✓ Configuration is valid: {}", args.config.display());
    println!(
        "  {} topics, {} debaters, {} judges",
        config.topics.len(),
        config.debaters().count(),
        config.judges().count()
    );
    println!(
        "  Shape: {:?}, {} rounds per debate, panel of {}",
        config.tournament_shape, config.rounds_per_debate, config.panel_size
    );
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Standings
// ============================================================================

async fn run_standings_command(args: StandingsArgs) -> anyhow::Result<ExitCode> {
    if !args.results.exists() {
        anyhow::bail!("Result log not found: {}", args.results.display());
    }
    let report = standings_from_log(&args.results).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    } else {
        println!(
            "{} records in {}",
            report.summary.matches_recorded,
            args.results.display()
        );
        if report.reconciled > 0 {
            println!(
                "  {} verdicts differed from their votes; recomputed outcomes are used",
                report.reconciled
            );
        }
        println!();
        print_standings(&report.summary.standings);
    }
    Ok(ExitCode::SUCCESS)
}

/// Standings rebuilt from a result log.
struct StandingsReport {
    summary: TournamentSummary,
    /// Records whose verdict and outcome were recomputed from their votes.
    reconciled: usize,
}

/// Reads the log without taking it over from a running writer, recomputes
/// every verdict from its votes and builds the standings from the result.
async fn standings_from_log(path: &Path) -> anyhow::Result<StandingsReport> {
    let mut records = read_records(path).await?;

    let mut reconciled = 0usize;
    for record in &mut records {
        if record.reconcile_verdict() {
            warn!(
                match_id = %record.id,
                outcome = record.outcome.label(),
                "Stored verdict differs from recomputed tally"
            );
            reconciled += 1;
        }
    }

    let started_at = records
        .iter()
        .map(|r| r.started_at)
        .min()
        .unwrap_or_else(chrono::Utc::now);
    Ok(StandingsReport {
        summary: TournamentSummary::from_records(Uuid::nil(), None, &[], &records, started_at),
        reconciled,
    })
}
