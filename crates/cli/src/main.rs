use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use core_model::{EngineKind, HistoryEngine, ListOptions, ListSort};
use engine::{EngineConfig, JsonHistoryStore};
use reconcile::{FsFileReader, NoDiagnostics, ReconcileOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

#[derive(Parser)]
#[command(name = "chronik")]
#[command(about = "Crash-safe conversation history store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Collection directory; overrides the config file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    engine: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    List(ListArgs),
    Show {
        id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Reconcile(ReconcileArgs),
    Migrate {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        sequential: bool,
    },
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Backups {
        #[command(subcommand)]
        command: BackupsCommand,
    },
    Delete {
        id: String,
    },
    Doctor {
        /// Remove orphaned temp files left by interrupted writes.
        #[arg(long, default_value_t = false)]
        sweep: bool,
    },
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    limit: Option<usize>,
    /// Include unreadable records.
    #[arg(long, default_value_t = false)]
    all: bool,
    #[arg(long, default_value_t = false)]
    oldest_first: bool,
}

#[derive(Args)]
struct ReconcileArgs {
    id: String,
    #[arg(long)]
    max_tools: Option<usize>,
    #[arg(long, default_value_t = false)]
    diagnostics: bool,
    /// Directory relative tool paths resolve against.
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum BackupsCommand {
    List {
        id: String,
    },
    Restore {
        id: String,
        #[arg(long)]
        backup: Option<PathBuf>,
    },
    Prune {
        #[arg(long)]
        older_than: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_json_store(kind: EngineKind, root: &Path, config: EngineConfig) -> anyhow::Result<JsonHistoryStore> {
    match kind {
        EngineKind::Json => JsonHistoryStore::open(root, config)
            .with_context(|| format!("failed to open collection at {}", root.display())),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = config::Config::load(cli.config.as_deref())?;
    let t = Instant::now();

    let root = cli.root.clone().unwrap_or_else(|| config.root());
    let engine_name = cli.engine.as_deref().unwrap_or_else(|| config.engine_name());
    let kind: EngineKind = engine_name.parse()?;
    let engine_config = config.engine_config()?;
    info!(root = %root.display(), engine = %kind, "opening collection");

    match cli.command {
        Commands::List(args) => {
            let engine = engine::open_engine(kind, &root, engine_config)?;
            let opts = ListOptions {
                limit: args.limit,
                sort: if args.oldest_first {
                    ListSort::UpdatedAsc
                } else {
                    ListSort::UpdatedDesc
                },
                include_broken: args.all,
            };
            let items = engine.list(&opts)?;
            info!(records = items.len(), elapsed = ?t.elapsed(), "records listed");
            ui::print_list(&items);
        }
        Commands::Show { id, json } => {
            let mut engine = engine::open_engine(kind, &root, engine_config)?;
            let record = engine.load(&id)?;
            info!(messages = record.messages.len(), elapsed = ?t.elapsed(), "record loaded");
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{}", record.title);
                ui::print_messages(&record.messages);
            }
        }
        Commands::Reconcile(args) => {
            let mut store = open_json_store(kind, &root, engine_config)?;
            let workspace = match args.workspace {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let opts = ReconcileOptions {
                max_tools: args.max_tools.or(config.max_tools),
                diagnostics: args.diagnostics,
            };
            let reader = FsFileReader::new(workspace);
            let (messages, report) =
                store.reconcile_conversation(&args.id, &opts, &reader, &NoDiagnostics)?;
            info!(
                messages = messages.len(),
                synthetic = report.synthetic_messages,
                elapsed = ?t.elapsed(),
                "conversation reconciled"
            );
            if args.json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                ui::print_messages(&messages);
                ui::print_report(&report);
            }
        }
        Commands::Migrate { dry_run, sequential } => {
            let mut store = open_json_store(kind, &root, engine_config)?;
            let summary = store.migrate_if_needed(dry_run, !sequential)?;
            info!(
                migrated = summary.migrated_count,
                failed = summary.failed_count,
                elapsed = ?t.elapsed(),
                "migration finished"
            );
            ui::print_summary(&summary, dry_run);
            if summary.failed_count > 0 {
                return Err(anyhow::anyhow!("{} record(s) failed to migrate", summary.failed_count));
            }
        }
        Commands::Search { query, limit } => {
            let mut engine = engine::open_engine(kind, &root, engine_config)?;
            info!(query = %query, "searching");
            let hits = engine.search(&query, limit)?;
            if hits.is_empty() {
                info!(elapsed = ?t.elapsed(), "no results");
                return Ok(());
            }
            info!(hits = hits.len(), elapsed = ?t.elapsed(), "search finished");
            ui::print_hits(&hits);
        }
        Commands::Backups { command } => {
            let mut store = open_json_store(kind, &root, engine_config)?;
            match command {
                BackupsCommand::List { id } => {
                    let backups = store.backups(&id)?;
                    info!(backups = backups.len(), "backups listed");
                    ui::print_backups(&backups);
                }
                BackupsCommand::Restore { id, backup } => {
                    let used = store.restore_backup(&id, backup.as_deref())?;
                    info!(backup = %used.display(), elapsed = ?t.elapsed(), "record restored");
                    println!("restored {id} from {}", used.display());
                }
                BackupsCommand::Prune { older_than } => {
                    let age = humantime::parse_duration(&older_than)
                        .with_context(|| format!("invalid --older-than: {older_than:?}"))?;
                    let age = chrono::Duration::from_std(age).context("--older-than is too large")?;
                    let removed = store.prune_backups(age)?;
                    println!("removed {removed} backup(s)");
                }
            }
        }
        Commands::Delete { id } => {
            let mut engine = engine::open_engine(kind, &root, engine_config)?;
            engine.delete(&id)?;
            info!(id = %id, elapsed = ?t.elapsed(), "record deleted");
        }
        Commands::Doctor { sweep } => {
            let store = open_json_store(kind, &root, engine_config)?;
            if sweep {
                let removed = store.sweep_temp_files()?;
                info!(removed, "temp files swept");
            }
            let health = store.health()?;
            ui::print_health(&health);
            let stats = store.cache_stats();
            info!(hits = stats.hits, misses = stats.misses, elapsed = ?t.elapsed(), "doctor finished");
        }
    }
    Ok(())
}
