use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsletter_queue::{
    AppError,
    config::Config,
    database::Database,
    engine::{GenerationEngine, HttpStreamEngine, ScriptedEngine},
    job_scheduling::{
        InMemoryJobStore, JobId, JobQueueRunner, JobStatus, JobStore, NewGenerationJob,
    },
};

#[derive(Parser)]
#[command(name = "newsletter-queue")]
#[command(version)]
#[command(about = "Background job queue for streaming newsletter generation")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (defaults to $CONFIG_FILE or config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL", global = true)]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Keep jobs in memory instead of the database
        #[arg(long)]
        in_memory: bool,

        /// Echo prompts back instead of calling the generation endpoint
        #[arg(long)]
        dry_run: bool,

        /// Jobs to enqueue before starting (`@path` reads the prompt from a file)
        #[arg(long = "prompt", value_name = "PROMPT")]
        prompts: Vec<String>,
    },

    /// Enqueue a generation job and print its id
    Enqueue {
        /// Prompt text, or `@path` to read it from a file
        #[arg(short, long)]
        prompt: String,

        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        #[arg(long)]
        trace_id: Option<String>,
    },

    /// Print a job as JSON
    Show { id: JobId },

    /// Print the most recent jobs as JSON, newest first
    List {
        /// Only jobs in this state (queued, running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: u64,
    },

    /// Cancel a queued or running job
    Cancel { id: JobId },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("newsletter_queue={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    match cli.command {
        Command::Run {
            in_memory,
            dry_run,
            prompts,
        } => run(config, in_memory, dry_run, prompts).await,
        Command::Enqueue {
            prompt,
            priority,
            trace_id,
        } => {
            let store = open_store(&config).await?;
            let mut new_job = NewGenerationJob::new(read_prompt(&prompt)?).with_priority(priority);
            if let Some(trace_id) = trace_id {
                new_job = new_job.with_trace_id(trace_id);
            }
            let job = store.enqueue(new_job).await?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Show { id } => {
            let store = open_store(&config).await?;
            let job = store
                .get(id)
                .await?
                .ok_or_else(|| AppError::not_found("generation_job", id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::List { status, limit } => {
            let status = status.as_deref().map(JobStatus::from_str).transpose()?;
            let database = open_database(&config).await?;
            let jobs = database.job_repository().list_recent(status, limit).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Command::Cancel { id } => {
            let store = open_store(&config).await?;
            // not started: only the store write and the local registry are involved
            let runner = JobQueueRunner::new(
                store,
                Arc::new(ScriptedEngine::default()),
                config.job_queue.clone(),
            );
            if runner.cancel(id).await? {
                println!("cancelled {id}");
            } else {
                println!("job {id} already finished");
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: Config, in_memory: bool, dry_run: bool, prompts: Vec<String>) -> Result<()> {
    info!(
        "Starting newsletter queue v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store: Arc<dyn JobStore> = if in_memory {
        info!("Using in-memory job store");
        Arc::new(InMemoryJobStore::new())
    } else {
        open_store(&config).await?
    };

    let engine: Arc<dyn GenerationEngine> = if dry_run {
        info!("Dry run: prompts are echoed back");
        Arc::new(ScriptedEngine::echo(Duration::from_millis(50)))
    } else {
        let engine = HttpStreamEngine::new(&config.engine)?;
        info!("Streaming generations from {}", engine.endpoint());
        Arc::new(engine)
    };

    for prompt in &prompts {
        let job = store
            .enqueue(NewGenerationJob::new(read_prompt(prompt)?))
            .await?;
        info!("Enqueued job {}", job.id);
    }

    let runner = Arc::new(JobQueueRunner::new(store, engine, config.job_queue.clone()));
    runner.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    runner.stop().await;
    let status = runner.status();
    if status.active_job_count > 0 {
        warn!("{} job(s) still registered at exit", status.active_job_count);
    }
    Ok(())
}

async fn open_database(config: &Config) -> Result<Database> {
    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    Ok(database)
}

async fn open_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    let database = open_database(config).await?;
    Ok(Arc::new(database.job_repository()))
}

/// `@path` reads the prompt from a file
fn read_prompt(arg: &str) -> Result<String> {
    let prompt = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt from {path}"))?,
        None => arg.to_string(),
    };
    if prompt.trim().is_empty() {
        return Err(AppError::validation("prompt must not be empty").into());
    }
    Ok(prompt)
}
