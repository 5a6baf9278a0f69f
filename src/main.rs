use fleetquery::format::{rows_to_csv, rows_to_json};
use fleetquery::observability::init_tracing;
use fleetquery::sink::DEFAULT_ARCHIVE_WORKERS;
use fleetquery::{
    archive_rows, batches, build_jobs, AzCliExecutor, CachedExecutor, DataExplorerExecutor,
    FanoutEngine, IngestScheduler,
    KqlLoader, LocalJsonSink, Materialized, MemoCache, OutputFormat, QueryLoader, QueryRequest,
    RemoteExecutor, ResultSink, RetryingMaterializer, Settings, Template, Timespan,
    WorkspaceDetails, WorkspaceDirectory, WorkspaceId,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleetquery")]
#[command(about = "Fan-out queries and ingestion across a fleet of log workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Which workspaces to target
#[derive(Args)]
struct Targets {
    /// Comma-separated workspace ids
    #[arg(short, long, value_delimiter = ',')]
    workspaces: Vec<String>,

    /// Workspace inventory CSV (customerId, SecOps Group, ...)
    #[arg(long)]
    workspace_list: Option<PathBuf>,

    /// Agency alias to select from the inventory (ALL for every workspace)
    #[arg(long, default_value = "ALL")]
    agency: String,
}

impl Targets {
    fn resolve(&self) -> Result<Vec<WorkspaceId>> {
        let mut ids: Vec<WorkspaceId> = self
            .workspaces
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(WorkspaceId::from)
            .collect();
        if let Some(path) = &self.workspace_list {
            let directory = WorkspaceDirectory::from_path(path)
                .with_context(|| format!("Failed to read workspace list {}", path.display()))?;
            ids.extend(directory.ids(Some(&self.agency)));
        }
        if ids.is_empty() {
            anyhow::bail!("no workspaces given: use --workspaces or --workspace-list");
        }
        Ok(ids)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query across workspaces and print the merged rows
    Query {
        /// Inline query, kql/<file>, kql://<path> or https URL
        query: String,

        #[command(flatten)]
        targets: Targets,

        /// ISO-8601 duration (default: P7D)
        #[arg(short, long, default_value = "P7D")]
        timespan: String,

        /// Output format: json, csv, list or cmd
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Backend-side filter applied to each call's output
        #[arg(long)]
        post_filter: Option<String>,

        /// Query each workspace on its own instead of grouped batches
        #[arg(long)]
        individually: bool,

        /// Also archive rows as JSON files under this prefix
        #[arg(long)]
        archive: Option<String>,

        /// Root directory for archived rows
        #[arg(long, default_value = "datalake")]
        archive_root: PathBuf,

        /// Comma-separated row fields forming archive file names
        #[arg(long, default_value = "TenantId")]
        archive_keys: String,
    },
    /// Show how workspaces would be batched and the calls that would run
    Plan {
        query: String,

        #[command(flatten)]
        targets: Targets,

        #[arg(short, long, default_value = "P7D")]
        timespan: String,
    },
    /// Run a query with retries and print it as a table
    Materialize {
        query: String,

        #[command(flatten)]
        targets: Targets,

        #[arg(short, long, default_value = "P7D")]
        timespan: String,
    },
    /// Run ingestion statements on the Data Explorer cluster (AZURE_DATAEXPLORER)
    Ingest {
        /// Statements run once against the shared resource (file or query reference)
        #[arg(long)]
        global_script: Option<String>,

        /// Per-workspace statement template ($customerId, $id, $name, $ingest_function)
        #[arg(long)]
        template: Option<String>,

        /// JSON array of workspace details ({customerId, id, name})
        #[arg(long)]
        details: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let settings = Settings::from_env()?;
    init_tracing(&settings.log_level);

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding work");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::Query {
            query,
            targets,
            timespan,
            format,
            post_filter,
            individually,
            archive,
            archive_root,
            archive_keys,
        } => {
            let format: OutputFormat = format.parse()?;
            let mut request = QueryRequest::new(targets.resolve()?, query, Timespan::parse(&timespan)?);
            if let Some(filter) = post_filter {
                request = request.with_post_filter(filter);
            }
            if individually {
                request = request.individually();
            }
            let engine = build_engine(&settings)?;

            if format == OutputFormat::Cmd {
                for command in engine.dry_run(&request).await? {
                    println!("{}", command);
                }
                return Ok(());
            }

            let result = engine.query_with_cancel(&request, &cancel).await?;
            for failure in &result.failures {
                warn!("{} failed: {}", failure.workspace, failure.message);
            }
            if let Some(prefix) = archive {
                let keys: Vec<String> = archive_keys.split(',').map(|k| k.trim().to_string()).collect();
                let sink: Arc<dyn ResultSink> =
                    Arc::new(LocalJsonSink::new(archive_root).with_modified_key("TimeGenerated"));
                let written = archive_rows(
                    sink,
                    result.rows.clone(),
                    &prefix,
                    "TimeGenerated",
                    &keys,
                    DEFAULT_ARCHIVE_WORKERS,
                )
                .await?;
                info!("Archived {} rows under {}", written, prefix);
            }
            match format {
                OutputFormat::Json => println!("{}", rows_to_json(&result.rows)?),
                _ => print!("{}", rows_to_csv(&result.rows)?),
            }
            Ok(())
        }
        Commands::Plan {
            query,
            targets,
            timespan,
        } => {
            let ids = targets.resolve()?;
            let planned = batches(ids.iter().cloned(), settings.fanout.max_fanout)?;
            println!("{} workspaces in {} batches", ids.len(), planned.len());
            let engine = build_engine(&settings)?;
            let request = QueryRequest::new(ids, query, Timespan::parse(&timespan)?);
            for (batch, command) in planned.iter().zip(engine.dry_run(&request).await?) {
                let members: Vec<&str> = batch.iter().map(|w| w.as_str()).collect();
                println!("\n[{}]\n{}", members.join(", "), command);
            }
            Ok(())
        }
        Commands::Materialize {
            query,
            targets,
            timespan,
        } => {
            let engine = Arc::new(build_engine(&settings)?);
            let materializer = RetryingMaterializer::new(engine, settings.retry.clone());
            let outcome = materializer
                .materialize_with_cancel(&query, &Timespan::parse(&timespan)?, &targets.resolve()?, &cancel)
                .await?;
            if let Materialized::Failed { error, .. } = &outcome {
                warn!("Query failed: {}", error);
            }
            println!("{}", outcome.into_table()?);
            Ok(())
        }
        Commands::Ingest {
            global_script,
            template,
            details,
        } => {
            let loader = KqlLoader::new(settings.kql_dir.clone(), settings.kql_base_url.clone())?;
            let global = match global_script {
                Some(reference) => read_script(&loader, &reference).await?,
                None => String::new(),
            };
            let template = match template {
                Some(reference) => Template::new(read_script(&loader, &reference).await?),
                None => Template::new(""),
            };
            let details: Vec<WorkspaceDetails> = match details {
                Some(path) => {
                    let raw: Vec<serde_json::Value> = serde_json::from_str(
                        &std::fs::read_to_string(&path)
                            .with_context(|| format!("Failed to read {}", path.display()))?,
                    )?;
                    raw.iter()
                        .map(|ws| {
                            let field = |name: &str| ws.get(name).and_then(|v| v.as_str()).unwrap_or("");
                            WorkspaceDetails::new(field("customerId"), field("id"), field("name"))
                        })
                        .collect()
                }
                None => Vec::new(),
            };

            let jobs = build_jobs(&global, &template, &details)?;
            if jobs.is_empty() {
                anyhow::bail!("no ingest statements to run");
            }

            let executor = build_data_explorer(&settings).await?;
            let scheduler = IngestScheduler::new(Arc::new(executor), settings.ingest.clone());
            let summary = scheduler.run_with_cancel(jobs, &cancel).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if !summary.is_complete_success() {
                anyhow::bail!(
                    "{} of {} ingest jobs failed, {} outstanding",
                    summary.failed,
                    summary.submitted,
                    summary.running
                );
            }
            Ok(())
        }
    }
}

/// Script text from a local file, or through the loader for query references
async fn read_script(loader: &KqlLoader, reference: &str) -> Result<String> {
    if Path::new(reference).is_file() {
        return tokio::fs::read_to_string(reference)
            .await
            .with_context(|| format!("Failed to read {}", reference));
    }
    Ok(loader.load(reference).await?)
}

/// Executor for the cluster named by AZURE_DATAEXPLORER
async fn build_data_explorer(settings: &Settings) -> Result<DataExplorerExecutor> {
    let setting = settings
        .data_explorer
        .as_deref()
        .context("AZURE_DATAEXPLORER is not set (expected <cluster url>/<database>)")?;
    let executor = DataExplorerExecutor::from_setting(setting, settings.remote_timeout())?;
    let executor = match &settings.data_explorer_token {
        Some(token) => executor.with_token(token.clone()),
        None => executor.with_az_cli_token().await?,
    };
    info!("Ingesting into {} on {}", executor.database(), executor.cluster());
    Ok(executor)
}

/// Fan-out engine over the az CLI with memoized calls and query loading
fn build_engine(settings: &Settings) -> Result<FanoutEngine> {
    let cache = Arc::new(MemoCache::new());
    let az: Arc<dyn RemoteExecutor> = Arc::new(AzCliExecutor::new(settings.remote_timeout()));
    let executor = Arc::new(CachedExecutor::new(az, Arc::clone(&cache), settings.cache_ttl()));
    let loader = KqlLoader::new(settings.kql_dir.clone(), settings.kql_base_url.clone())?
        .with_cache(cache, settings.cache_ttl());
    Ok(FanoutEngine::new(executor, Arc::new(loader), settings.fanout.clone()))
}
