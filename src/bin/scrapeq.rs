//! scrapeq CLI: operator interface to the job pipeline.

use clap::{Parser, Subcommand};
use scrapeq::config::Config;
use scrapeq::db::{Db, PgmqQueue};
use scrapeq::engine::{CommandJobBody, Worker};
use scrapeq::model::{TaskId, WorkId};
use scrapeq::service::{self, IntakeService, ResultPath, Upload};
use scrapeq::store::JobStore;
use scrapeq::telemetry::{TelemetryConfig, init_telemetry};
use scrapeq::tokens::{TokenPool, capacity_from_available_memory};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scrapeq", about = "Token-bounded background scraping jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker: seed the token pool if needed, then process tasks
    Serve,
    /// Submit a CSV upload
    Submit {
        /// Path to the CSV file
        file: PathBuf,
        /// Cap on tasks attached to the work
        #[arg(long)]
        max_tasks: Option<u32>,
    },
    /// Show the status of a work or task
    Status {
        /// Work or task ID
        id: uuid::Uuid,
    },
    /// Print the result location of a completed task
    Result {
        /// Task ID
        task_id: uuid::Uuid,
    },
    /// Cancel a work; tasks already running still finish
    Cancel {
        /// Work ID
        work_id: uuid::Uuid,
    },
    /// List recent works
    List {
        /// Maximum works to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Admission token pool operations
    Tokens {
        #[command(subcommand)]
        action: TokensAction,
    },
}

#[derive(Subcommand)]
enum TokensAction {
    /// Show available tokens
    Show,
    /// Re-seed the pool (only while no tasks are running)
    Reset {
        /// New capacity
        capacity: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        command => cmd_client(config, command).await,
    }
}

/// One-shot operator commands against the shared database.
async fn cmd_client(config: Config, command: Command) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::for_cli())?;
    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    db.migrate().await?;

    match command {
        Command::Serve => anyhow::bail!("serve is not a client command"),
        Command::Submit { file, max_tasks } => cmd_submit(&config, db, file, max_tasks).await,
        Command::Status { id } => cmd_status(&db, id).await,
        Command::Result { task_id } => cmd_result(&db, task_id).await,
        Command::Cancel { work_id } => {
            let work = db.cancel_work(WorkId(work_id)).await?;
            println!("Cancelled: {} ({})", work.id, work.filename);
            Ok(())
        }
        Command::List { limit } => cmd_list(&db, limit).await,
        Command::Tokens { action } => {
            let pool = TokenPool::with_key(Arc::new(db), &config.token_key);
            match action {
                TokensAction::Show => println!("Available tokens: {}", pool.available().await?),
                TokensAction::Reset { capacity } => {
                    println!("Token pool reset to {}", pool.reset(capacity).await?)
                }
            }
            Ok(())
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::for_worker(&config))?;

    let program = config
        .scraper_command
        .clone()
        .ok_or_else(|| anyhow::anyhow!("SCRAPER_COMMAND must be set to run a worker"))?;

    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    db.migrate().await?;
    let queue = PgmqQueue::new(db.clone(), &config.queue_name);
    queue.ensure().await?;

    let tokens = TokenPool::with_key(Arc::new(db.clone()), &config.token_key);
    let hint = config
        .token_capacity
        .unwrap_or_else(capacity_from_available_memory);
    if let Err(e) = tokens.initialize(hint).await {
        // Still make sure a pool exists so tasks can eventually run.
        tracing::warn!("token pool initialization failed: {e}; falling back to one token");
        tokens.initialize(1).await?;
    }

    let worker = Worker::new(
        Arc::new(db),
        Arc::new(queue),
        tokens,
        Arc::new(CommandJobBody::new(program)),
        config.worker.clone(),
    );

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_submit(
    config: &Config,
    db: Db,
    file: PathBuf,
    max_tasks: Option<u32>,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&file).await?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let queue = PgmqQueue::new(db.clone(), &config.queue_name);
    queue.ensure().await?;
    let intake = IntakeService::new(Arc::new(db), Arc::new(queue), &config.upload_dir);

    let mut upload = Upload::new(filename, bytes);
    if let Some(max) = max_tasks {
        upload = upload.max_tasks(max);
    }
    let submission = intake.submit(upload).await?;

    println!("Work: {}", submission.work_id);
    println!("Task: {}", submission.task_id);
    Ok(())
}

async fn cmd_status(db: &Db, id: uuid::Uuid) -> anyhow::Result<()> {
    let Some(report) = service::get_status(db, id).await? else {
        anyhow::bail!("no work or task with id {id}");
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.kind == service::RecordKind::Work {
        let tasks = db.list_tasks(WorkId(id)).await?;
        println!("\n{:<36}  {:<10}  {:<8}  RESULT", "TASK", "STATUS", "ATTEMPTS");
        for task in &tasks {
            println!(
                "{:<36}  {:<10}  {:<8}  {}",
                task.id,
                task.status,
                task.attempts,
                task.result_path.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

async fn cmd_result(db: &Db, task_id: uuid::Uuid) -> anyhow::Result<()> {
    match service::get_result_path(db, TaskId(task_id)).await? {
        ResultPath::Ready(path) => println!("{path}"),
        ResultPath::NotReady(status) => anyhow::bail!("task {task_id} is not finished (status: {status})"),
        ResultPath::NotFound => anyhow::bail!("no task with id {task_id}"),
        ResultPath::Missing(path) => anyhow::bail!("result file {path} of task {task_id} no longer exists"),
    }
    Ok(())
}

async fn cmd_list(db: &Db, limit: i64) -> anyhow::Result<()> {
    let works = db.list_works(limit).await?;
    if works.is_empty() {
        println!("No works found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<30}  CREATED",
        "ID", "STATUS", "FILENAME"
    );
    println!("{}", "-".repeat(100));
    for work in &works {
        let name = if work.filename.chars().count() > 30 {
            format!("{}…", work.filename.chars().take(29).collect::<String>())
        } else {
            work.filename.clone()
        };
        println!(
            "{:<36}  {:<12}  {:<30}  {}",
            work.id,
            work.status,
            name,
            work.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} work(s)", works.len());
    Ok(())
}
