use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use biblio_etl::config::{ConfigLoader, ResolvedConfig};
use biblio_etl::domain::{SnapshotId, SnapshotSelector};
use biblio_etl::error::BiblioError;
use biblio_etl::openalex::OpenAlexHttpClient;
use biblio_etl::output::{
    ConsoleOutput, InfoResult, JsonOutput, ListResult, OutputMode, PruneResult, UnlockResult,
};
use biblio_etl::refresh::{ProgressSink, RefreshMode, RefreshOutcome, Refresher};
use biblio_etl::store::Store;
use biblio_etl::summary::SnapshotSummary;

#[derive(Parser)]
#[command(name = "biblio-etl")]
#[command(about = "Institutional bibliometrics ETL: OpenAlex works to Parquet snapshots")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch works and persist a new snapshot")]
    Refresh(RefreshArgs),
    #[command(about = "Serve the latest snapshot without contacting OpenAlex")]
    Fallback,
    #[command(about = "Rebuild a snapshot from a cached raw file")]
    Rebuild(RebuildArgs),
    #[command(about = "List persisted snapshots")]
    List,
    #[command(about = "Show a snapshot's manifest and summary")]
    Info(InfoArgs),
    #[command(about = "Delete old snapshots")]
    Prune(PruneArgs),
    #[command(about = "Remove a stale write lock")]
    Unlock,
}

#[derive(Args)]
struct RefreshArgs {
    #[arg(long, conflicts_with = "incremental")]
    full: bool,

    #[arg(long)]
    incremental: bool,
}

#[derive(Args)]
struct RebuildArgs {
    snapshot_id: String,
}

#[derive(Args)]
struct InfoArgs {
    #[arg(default_value = "latest")]
    snapshot: String,
}

#[derive(Args)]
struct PruneArgs {
    #[arg(long)]
    keep: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BiblioError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BiblioError) -> u8 {
    match error {
        BiblioError::SnapshotNotFound(_) => 2,
        BiblioError::NetworkTransient(_)
        | BiblioError::RateLimited { .. }
        | BiblioError::ApiStatus { .. }
        | BiblioError::RetryExhausted { .. }
        | BiblioError::SchemaMismatch(_) => 3,
        BiblioError::WriteConflict(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::from_settings(&config.store);

    match cli.command {
        Commands::Refresh(args) => {
            let mode = match (args.full, args.incremental) {
                (true, _) => RefreshMode::Full,
                (_, true) => RefreshMode::Incremental,
                _ => RefreshMode::Auto,
            };
            let refresher = refresher(store, &config)?;
            let outcome = refresher.refresh(mode, sink(output_mode))?;
            print_refresh(&outcome, output_mode)
        }
        Commands::Fallback => {
            let refresher = refresher(store, &config)?;
            let outcome = refresher.fallback(sink(output_mode))?;
            print_refresh(&outcome, output_mode)
        }
        Commands::Rebuild(args) => {
            let raw_id = args.snapshot_id.parse::<SnapshotId>()?;
            let refresher = refresher(store, &config)?;
            let outcome = refresher.rebuild_from_raw(&raw_id, sink(output_mode))?;
            print_refresh(&outcome, output_mode)
        }
        Commands::List => {
            let result = ListResult {
                latest: store.latest_id()?,
                snapshots: store.list_manifests()?,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_list(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    ConsoleOutput::print_list(&result);
                    Ok(())
                }
            }
        }
        Commands::Info(args) => {
            let selector = args.snapshot.parse::<SnapshotSelector>()?;
            let snapshot = store.read(&selector)?;
            let result = InfoResult {
                summary: SnapshotSummary::from_tables(&snapshot.tables),
                manifest: snapshot.manifest,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_info(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    ConsoleOutput::print_info(&result);
                    Ok(())
                }
            }
        }
        Commands::Prune(args) => {
            let _lock = store.acquire_write_lock()?;
            let keep = args.keep.unwrap_or(config.store.keep_snapshots);
            let removed = store.prune(keep)?;
            let result = PruneResult {
                kept: store.list_snapshots()?.len(),
                removed,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_prune(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    ConsoleOutput::print_prune(&result);
                    Ok(())
                }
            }
        }
        Commands::Unlock => {
            let result = UnlockResult {
                removed: store.force_unlock()?,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_unlock(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    ConsoleOutput::print_unlock(&result);
                    Ok(())
                }
            }
        }
    }
}

fn refresher(
    store: Store,
    config: &ResolvedConfig,
) -> Result<Refresher<OpenAlexHttpClient>, BiblioError> {
    let client = OpenAlexHttpClient::new(&config.api, config.retry)?;
    Ok(Refresher::new(store, client, config))
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::NonInteractive => &JsonOutput,
        OutputMode::Interactive => &ConsoleOutput,
    }
}

fn print_refresh(outcome: &RefreshOutcome, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_refresh(outcome).into_diagnostic(),
        OutputMode::Interactive => {
            ConsoleOutput::print_refresh(outcome);
            Ok(())
        }
    }
}
