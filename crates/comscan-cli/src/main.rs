use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comscan_core::ResourceSet;
use comscan_source::IdentityResolver;
use comscan_storage::{MemoryStore, PgStore, RecordBatch, RecordStore};
use comscan_sync::{job_channel, maybe_build_scheduler, session_pool, JobTracker, Orchestrator, SyncConfig};
use comscan_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "comscan")]
#[command(about = "Company metadata scanner")]
struct Cli {
    /// Keep records in process memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the ingestion workers.
    Serve,
    /// Resolve one company and ingest the requested kinds in this process.
    Scrape {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        jobs: bool,
        #[arg(long)]
        posts: bool,
        #[arg(long)]
        employees: bool,
        #[arg(long)]
        events: bool,
        /// Shorthand for every kind.
        #[arg(long)]
        all: bool,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("comscan=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, cli.memory).await?,
        Commands::Scrape {
            name,
            link,
            jobs,
            posts,
            employees,
            events,
            all,
        } => {
            let kinds = if all {
                ResourceSet::all()
            } else {
                ResourceSet::from_flags(jobs, posts, employees, events)
            };
            scrape(&config, cli.memory, name, link, kinds).await?;
        }
        Commands::Migrate => {
            if cli.memory {
                bail!("--memory has no schema to migrate");
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig, memory: bool) -> Result<Arc<dyn RecordStore>> {
    if memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

async fn serve(config: &SyncConfig, memory: bool) -> Result<()> {
    let store = open_store(config, memory).await?;
    let sessions = session_pool(config)?;
    let tracker = config.job_tracker();
    let (jobs, receiver) = job_channel(tracker.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        sessions.clone(),
        store.clone(),
        config.throttle(),
        tracker,
    ));
    orchestrator.spawn_workers(config.workers, receiver, jobs.clone());
    info!(workers = config.workers, credentials = sessions.rotator().len(), "ingestion workers started");

    let scheduler = maybe_build_scheduler(config, store.clone(), jobs.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting refresh scheduler")?;
        info!(cron = %config.refresh_cron, "refresh scheduler started");
    }

    let state = AppState::new(IdentityResolver::new(sessions), store, jobs);
    comscan_web::serve(state, config.web_port).await
}

async fn scrape(
    config: &SyncConfig,
    memory: bool,
    name: Option<String>,
    link: Option<String>,
    kinds: ResourceSet,
) -> Result<()> {
    let store = open_store(config, memory).await?;
    let sessions = session_pool(config)?;

    let company = IdentityResolver::new(sessions.clone())
        .resolve(name.as_deref(), link.as_deref())
        .await?;
    store
        .upsert(RecordBatch::Companies(vec![company.clone()]))
        .await
        .context("saving company")?;
    info!(internal_id = company.internal_id, kinds = %kinds, "company saved");

    if kinds.is_empty() {
        println!("{}", serde_json::to_string_pretty(&company)?);
        return Ok(());
    }

    let orchestrator = Orchestrator::new(sessions, store, config.throttle(), JobTracker::new());
    let record = orchestrator.run_inline(company, kinds).await;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
