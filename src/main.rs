use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tdmdb::{
    Filter, ImportData, ImportRequest, LockMode, RowQuery, Scope, SqlImportRequest,
    SqliteSourceExecutor, StaticSourceResolver, StoreConfig, TableTarget, TestDataStore,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tdmdb")]
#[command(about = "Operator tooling for the tdmdb test data store")]
struct Cli {
    /// Store database file
    #[arg(long, default_value = "tdmdb.db")]
    db: PathBuf,

    /// SQLite file used as the source system for SQL imports, refreshes and cleanups
    #[arg(long)]
    source: Option<PathBuf>,

    /// Use in-process locks instead of the shared lock table
    #[arg(long)]
    local_locks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    All,
    Available,
    Occupied,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::All => Scope::All,
            ScopeArg::Available => Scope::Available,
            ScopeArg::Occupied => Scope::Occupied,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List catalog entries
    Tables {
        #[arg(long)]
        project: Option<Uuid>,
    },
    /// Print rows of a table
    Rows {
        #[arg(long)]
        table: String,
        #[arg(long, value_enum, default_value_t = ScopeArg::All)]
        scope: ScopeArg,
        /// COLUMN=VALUE, matched exactly
        #[arg(long)]
        equals: Vec<String>,
        /// COLUMN=VALUE, matched as a substring
        #[arg(long)]
        contains: Vec<String>,
        #[arg(long)]
        ignore_case: bool,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Lease rows to an actor
    Occupy {
        #[arg(long)]
        table: String,
        #[arg(long)]
        actor: String,
        row_ids: Vec<String>,
    },
    /// Release leased rows
    Release {
        #[arg(long)]
        table: String,
        row_ids: Vec<String>,
    },
    /// Import a JSON document of the form {"columns": [...], "rows": [{...}]}
    ImportJson {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        system: Option<Uuid>,
        #[arg(long)]
        environment: Option<Uuid>,
        #[arg(long)]
        title: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Import the result of a query on the source system
    ImportSql {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,
    },
    /// Delete a table and its catalog entry
    Drop {
        #[arg(long)]
        table: String,
    },
    /// Remove every row of a table
    Truncate {
        #[arg(long)]
        table: String,
    },
    /// Run a stored cleanup configuration now
    Cleanup {
        #[arg(long)]
        config: Uuid,
    },
    /// Refresh a table from its recorded source query
    Refresh {
        #[arg(long)]
        table: String,
        #[arg(long)]
        save_occupied: bool,
    },
    /// Run scheduled cleanups and refreshes until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::new(&cli.db).scheduler_enabled(matches!(cli.command, Command::Serve));
    if cli.local_locks {
        config = config.lock_mode(LockMode::Local);
    }

    let mut resolver = StaticSourceResolver::new();
    if let Some(source) = &cli.source {
        resolver = resolver.with_default(Arc::new(SqliteSourceExecutor::new(source)));
    }

    let store = TestDataStore::open(config, Arc::new(resolver))
        .await
        .with_context(|| format!("failed to open store {}", cli.db.display()))?;

    let outcome = run(&store, cli.command).await;
    store.shutdown().await?;
    outcome
}

async fn run(store: &TestDataStore, command: Command) -> Result<()> {
    match command {
        Command::Tables { project } => {
            let entries = store.list_tables(project).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Rows {
            table,
            scope,
            equals,
            contains,
            ignore_case,
            offset,
            limit,
        } => {
            let mut query = RowQuery::new().scope(scope.into());
            for pair in &equals {
                let (column, value) = split_pair(pair)?;
                query = query.filter(with_case(Filter::equals(column, value), ignore_case));
            }
            for pair in &contains {
                let (column, value) = split_pair(pair)?;
                query = query.filter(with_case(Filter::contains(column, value), ignore_case));
            }
            query.offset = offset;
            query.limit = limit;

            let page = store.get_rows(&table, &query).await?;
            page.rows.print();
            println!("{} of {} rows", page.rows.row_count(), page.records_total);
        }
        Command::Occupy {
            table,
            actor,
            row_ids,
        } => {
            let taken = store.occupy(&table, &actor, &row_ids).await?;
            println!("{} of {} rows occupied by {}", taken, row_ids.len(), actor);
        }
        Command::Release { table, row_ids } => {
            let released = store.release(&table, &row_ids).await?;
            println!("{} rows released", released);
        }
        Command::ImportJson {
            project,
            system,
            environment,
            title,
            file,
        } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let data: ImportData = serde_json::from_str(&text)
                .with_context(|| format!("{} is not an import document", file.display()))?;

            let mut target = TableTarget::new(project, title);
            target.system_id = system;
            target.environment_id = environment;

            let outcome = store.import_rows(ImportRequest { target, data }).await?;
            println!(
                "{} rows imported into {} ({:?})",
                outcome.rows_inserted, outcome.table_name, outcome.schema_change
            );
        }
        Command::ImportSql {
            project,
            title,
            query,
            timeout_secs,
        } => {
            let outcome = store
                .import_from_sql(SqlImportRequest {
                    target: TableTarget::new(project, title),
                    query,
                    query_timeout_secs: timeout_secs,
                })
                .await?;
            println!("{} rows imported into {}", outcome.rows_inserted, outcome.table_name);
        }
        Command::Drop { table } => {
            store.delete_table(&table).await?;
            println!("{} deleted", table);
        }
        Command::Truncate { table } => {
            let removed = store.truncate_table(&table).await?;
            println!("{} rows removed from {}", removed, table);
        }
        Command::Cleanup { config } => {
            for result in store.run_cleanup(config).await? {
                match &result.error {
                    None => println!(
                        "{}: {} of {} rows removed",
                        result.table_name, result.records_removed, result.records_total
                    ),
                    Some(error) => println!("{}: failed: {}", result.table_name, error),
                }
            }
        }
        Command::Refresh {
            table,
            save_occupied,
        } => {
            let result = store.run_refresh(&table, save_occupied, None).await?;
            println!(
                "{}: {} rows removed, {} rows inserted",
                result.table_name, result.records_removed, result.records_inserted
            );
        }
        Command::Serve => {
            println!("scheduler running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }
    Ok(())
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .ok_or_else(|| anyhow!("expected COLUMN=VALUE, got '{}'", pair))
}

fn with_case(filter: Filter, ignore_case: bool) -> Filter {
    if ignore_case {
        filter.case_insensitive()
    } else {
        filter
    }
}
