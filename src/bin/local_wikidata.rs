use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use local_wikidata::app::{App, ProgressSink};
use local_wikidata::config::{ConfigLoader, ResolvedConfig};
use local_wikidata::domain::SystemClock;
use local_wikidata::error::MirrorError;
use local_wikidata::fetch::WikidataHttpClient;
use local_wikidata::import::CancelToken;
use local_wikidata::output::{JsonOutput, TextOutput};

#[derive(Parser)]
#[command(name = "local-wikidata")]
#[command(about = "Local Wikidata mirror: resumable dump import, full-text search and a write-through entity cache")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./local-wikidata.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Database path, overriding config and DATABASE_PATH
    #[arg(long, global = true)]
    db: Option<Utf8PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Import (or resume importing) a Wikidata JSON dump")]
    Import(ImportArgs),
    #[command(about = "Show one entity, fetching it from Wikidata when not mirrored")]
    Get(GetArgs),
    #[command(about = "Full-text search over labels, descriptions and aliases")]
    Search(SearchArgs),
    #[command(about = "Show mirror statistics and import progress")]
    Stats,
    #[command(about = "Rebuild the full-text index from stored entities")]
    Reindex,
}

#[derive(Args)]
struct ImportArgs {
    /// Dump file (.json, .json.gz or .json.bz2)
    #[arg(long)]
    dump: Option<Utf8PathBuf>,

    /// Discard the saved checkpoint and start from the beginning
    #[arg(long)]
    restart: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    /// Stop after this many committed batches
    #[arg(long)]
    max_batches: Option<u64>,
}

#[derive(Args)]
struct GetArgs {
    id: String,

    /// Never contact Wikidata
    #[arg(long)]
    offline: bool,
}

#[derive(Args)]
struct SearchArgs {
    query: String,

    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MirrorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::NotFound(_) => 2,
        MirrorError::UpstreamUnavailable(_) | MirrorError::UpstreamStatus { .. } => 3,
        MirrorError::ImportAborted { .. } => 4,
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
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let app = open_app(config)?;
    let sink: &dyn ProgressSink = if cli.json { &JsonOutput } else { &TextOutput };

    match cli.command {
        Commands::Import(args) => {
            let mut options = app.config().import_options();
            options.restart = args.restart;
            options.max_batches = args.max_batches;
            if let Some(batch_size) = args.batch_size {
                options.batch_size = batch_size.max(1);
            }
            if let Some(workers) = args.workers {
                options.workers = workers.max(1);
            }
            let report = app.import(args.dump.as_deref(), options, CancelToken::new(), sink)?;
            if cli.json {
                JsonOutput::print_import(&report).into_diagnostic()?;
            } else {
                TextOutput::print_import(&report).into_diagnostic()?;
            }
        }
        Commands::Get(args) => {
            let result = if args.offline {
                app.get_offline(&args.id)?
            } else {
                app.get(&args.id, sink)?
            };
            if cli.json {
                JsonOutput::print_entity(&result).into_diagnostic()?;
            } else {
                TextOutput::print_entity(&result).into_diagnostic()?;
            }
        }
        Commands::Search(args) => {
            let result = app.search(&args.query, args.limit)?;
            if cli.json {
                JsonOutput::print_search(&result).into_diagnostic()?;
            } else {
                TextOutput::print_search(&result).into_diagnostic()?;
            }
        }
        Commands::Stats => {
            let result = app.stats()?;
            if cli.json {
                JsonOutput::print_stats(&result).into_diagnostic()?;
            } else {
                TextOutput::print_stats(&result).into_diagnostic()?;
            }
        }
        Commands::Reindex => {
            let result = app.reindex(sink)?;
            if cli.json {
                JsonOutput::print_reindex(&result).into_diagnostic()?;
            } else {
                TextOutput::print_reindex(&result).into_diagnostic()?;
            }
        }
    }
    Ok(())
}

fn open_app(config: ResolvedConfig) -> Result<App<WikidataHttpClient>, MirrorError> {
    let fetcher = WikidataHttpClient::new(config.api_url.clone(), config.fetch_timeout)?;
    App::open(config, fetcher, Arc::new(SystemClock))
}
