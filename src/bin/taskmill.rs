//! taskmill CLI — operator interface to the dispatch engine.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use taskmill::clock::SystemClock;
use taskmill::config::Config;
use taskmill::db::Db;
use taskmill::delivery::DeliveryPipeline;
use taskmill::executor::CommandExecutor;
use taskmill::model::work::{WorkId, WorkItem, WorkStatus};
use taskmill::model::worker::WorkerId;
use taskmill::scheduler::Scheduler;
use taskmill::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskmill", about = "Work routing and dispatch engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon
    Serve {
        /// Executor command run for each work item
        #[arg(long, default_value = "taskmill-exec")]
        executor: PathBuf,
        /// Scratch directory for executor handoff files
        #[arg(long)]
        scratch: Option<PathBuf>,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Worker operations
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Event delivery operations
    Delivery {
        #[command(subcommand)]
        action: DeliveryAction,
    },
    /// Show engine status
    Status,
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit a new work item
    Submit {
        /// Short human-readable title
        title: String,
        /// Routing scope UUID; unscoped items are never auto-routed
        #[arg(long)]
        scope: Option<uuid::Uuid>,
        /// Priority (lower = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Routing tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Due timestamp, RFC 3339
        #[arg(long)]
        due: Option<String>,
        /// Preferred worker UUID, tried before any rule
        #[arg(long)]
        prefer: Option<uuid::Uuid>,
        /// JSON context blob
        #[arg(long)]
        context: Option<String>,
    },
    /// List work items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Execute an assigned work item now, bypassing the schedule
    Run {
        /// Work item ID (full UUID or prefix)
        id: String,
        /// Executor command
        #[arg(long, default_value = "taskmill-exec")]
        executor: PathBuf,
        /// Scratch directory for executor handoff files
        #[arg(long)]
        scratch: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// List workers with capacity and load
    List,
}

#[derive(Subcommand)]
enum DeliveryAction {
    /// List recent delivery attempts
    List {
        /// Maximum attempts to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Replay a failed delivery attempt
    Retry {
        /// Attempt UUID
        id: uuid::Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { executor, scratch } => cmd_serve(executor, scratch).await,
        Command::Work { action } => {
            let db = connect().await?;
            match action {
                WorkAction::Submit {
                    title,
                    scope,
                    priority,
                    tags,
                    due,
                    prefer,
                    context,
                } => cmd_work_submit(&db, title, scope, priority, tags, due, prefer, context).await,
                WorkAction::List { status, limit } => cmd_work_list(&db, status, limit).await,
                WorkAction::Show { id } => cmd_work_show(&db, &id).await,
                WorkAction::Run {
                    id,
                    executor,
                    scratch,
                } => cmd_work_run(&db, &id, executor, scratch).await,
            }
        }
        Command::Worker { action } => {
            let db = connect().await?;
            match action {
                WorkerAction::List => cmd_worker_list(&db).await,
            }
        }
        Command::Delivery { action } => {
            let db = connect().await?;
            match action {
                DeliveryAction::List { limit } => cmd_delivery_list(&db, limit).await,
                DeliveryAction::Retry { id } => cmd_delivery_retry(&db, id).await,
            }
        }
        Command::Status => {
            let db = connect().await?;
            cmd_status(&db).await
        }
    }
}

async fn connect() -> anyhow::Result<Db> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn scratch_dir(scratch: Option<PathBuf>) -> PathBuf {
    scratch.unwrap_or_else(|| std::env::temp_dir().join("taskmill"))
}

/// Clip a column value without splitting a multibyte character. Titles
/// and error text are arbitrary operator/receiver input.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn cmd_serve(executor: PathBuf, scratch: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskmill".to_string(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let clock = Arc::new(SystemClock);
    let pipeline = DeliveryPipeline::new(db.clone(), clock.clone())?;
    let executor = Arc::new(CommandExecutor::new(executor, scratch_dir(scratch)));

    let scheduler = Arc::new(Scheduler::new(db, executor, pipeline, clock, config));

    let sched = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sched.shutdown();
    });

    scheduler.run().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_work_submit(
    db: &Db,
    title: String,
    scope: Option<uuid::Uuid>,
    priority: i32,
    tags: Vec<String>,
    due: Option<String>,
    prefer: Option<uuid::Uuid>,
    context: Option<String>,
) -> anyhow::Result<()> {
    let mut item = WorkItem::new(title);
    item.scope_id = scope;
    item.priority = priority;
    item.tags = tags;
    item.preferred_worker_id = prefer.map(WorkerId);
    if let Some(due) = due {
        item.due_at = Some(
            chrono::DateTime::parse_from_rfc3339(&due)
                .map_err(|e| anyhow::anyhow!("invalid due timestamp: {e}"))?
                .with_timezone(&chrono::Utc),
        );
    }
    if let Some(json) = context {
        item.context = serde_json::from_str(&json)?;
    }

    db.insert_work_item(&item).await?;
    println!("Created: {} (status: {})", item.id.0, item.status);

    // Fire work.created so receivers see submissions, not just routing.
    let clock = Arc::new(SystemClock);
    let pipeline = DeliveryPipeline::new(db.clone(), clock)?;
    let event = taskmill::event::DomainEvent::new(
        taskmill::event::names::WORK_CREATED,
        item.scope_id,
        serde_json::to_value(&item)?,
    );
    pipeline.emit(&event).await?;
    Ok(())
}

async fn cmd_work_list(db: &Db, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let status_filter: Option<WorkStatus> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let items = db.list_work_items(status_filter, limit).await?;
    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<11}  {:<4}  {:<8}  {:<30}  CREATED",
        "ID", "STATUS", "PRI", "WORKER", "TITLE"
    );
    println!("{}", "-".repeat(90));

    for item in &items {
        let worker = item
            .worker_id
            .map(|w| w.0.to_string()[..8].to_string())
            .unwrap_or_else(|| "-".to_string());
        let title = clip(&item.title, 30);
        println!(
            "{:<8}  {:<11}  {:<4}  {:<8}  {:<30}  {}",
            item.id,
            item.status.to_string(),
            item.priority,
            worker,
            title,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

/// Resolve a work item by full UUID or unique ID prefix.
async fn resolve_work_id(db: &Db, id_str: &str) -> anyhow::Result<WorkId> {
    if id_str.len() >= 36 {
        return Ok(WorkId(uuid::Uuid::parse_str(id_str)?));
    }
    let items = db.list_work_items(None, 100).await?;
    let matches: Vec<_> = items
        .iter()
        .filter(|item| item.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no work item matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} work items match prefix '{id_str}' — be more specific"),
    }
}

async fn cmd_work_show(db: &Db, id_str: &str) -> anyhow::Result<()> {
    let id = resolve_work_id(db, id_str).await?;
    let item = db.get_work_item(id).await?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}

async fn cmd_work_run(
    db: &Db,
    id_str: &str,
    executor: PathBuf,
    scratch: Option<PathBuf>,
) -> anyhow::Result<()> {
    let id = resolve_work_id(db, id_str).await?;
    let config = Config::from_env()?;
    let clock = Arc::new(SystemClock);
    let pipeline = DeliveryPipeline::new(db.clone(), clock.clone())?;
    let executor = Arc::new(CommandExecutor::new(executor, scratch_dir(scratch)));
    let scheduler = Scheduler::new(db.clone(), executor, pipeline, clock, config);

    let outcome = scheduler.execute_now(id).await?;
    if outcome.success {
        println!("Completed: {} in {}ms", outcome.work_id, outcome.duration_ms);
    } else {
        println!(
            "Failed: {} ({})",
            outcome.work_id,
            outcome.failure.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn cmd_worker_list(db: &Db) -> anyhow::Result<()> {
    let workers = db.list_workers().await?;
    if workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<9}  {:<7}  {:<8}  CAPABILITIES",
        "ID", "NAME", "STATUS", "MODE", "LOAD"
    );
    println!("{}", "-".repeat(90));

    for worker in &workers {
        let capacity = worker
            .capacity
            .map(|c| c.to_string())
            .unwrap_or_else(|| "∞".to_string());
        println!(
            "{:<8}  {:<20}  {:<9}  {:<7}  {:<8}  {}",
            &worker.id.0.to_string()[..8],
            worker.name,
            worker.status.to_string(),
            worker.mode.to_string(),
            format!("{}/{capacity}", worker.active_count),
            worker.capabilities.join(",")
        );
    }

    println!("\n{} worker(s)", workers.len());
    Ok(())
}

async fn cmd_delivery_list(db: &Db, limit: i64) -> anyhow::Result<()> {
    let attempts = db.list_delivery_attempts(limit).await?;
    if attempts.is_empty() {
        println!("No delivery attempts found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<9}  {:<4}  {:<30}  UPDATED",
        "ID", "EVENT", "STATUS", "TRY", "ERROR"
    );
    println!("{}", "-".repeat(100));

    for attempt in &attempts {
        let error_display = clip(attempt.error.as_deref().unwrap_or("-"), 30);
        println!(
            "{:<8}  {:<20}  {:<9}  {:<4}  {:<30}  {}",
            &attempt.id.to_string()[..8],
            attempt.event,
            attempt.status.to_string(),
            attempt.attempts,
            error_display,
            attempt.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} attempt(s)", attempts.len());
    Ok(())
}

async fn cmd_delivery_retry(db: &Db, id: uuid::Uuid) -> anyhow::Result<()> {
    let clock = Arc::new(SystemClock);
    let pipeline = DeliveryPipeline::new(db.clone(), clock)?;
    pipeline.retry_attempt(id).await?;
    let attempt = db.get_delivery_attempt(id).await?;
    println!("Attempt {} is now {}", id, attempt.status);
    Ok(())
}

async fn cmd_status(db: &Db) -> anyhow::Result<()> {
    let eligible = db.count_eligible().await?;
    let unrouted = db.count_unrouted().await?;
    let workers = db.list_workers().await?;
    let active: i32 = workers.iter().map(|w| w.active_count).sum();
    let available = workers.iter().filter(|w| w.is_available()).count();

    println!("Eligible backlog:  {eligible}");
    println!("Unrouted pending:  {unrouted}");
    println!(
        "Workers:           {} total, {} available, {} item(s) in flight",
        workers.len(),
        available,
        active
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::clip;

    #[test]
    fn clip_never_splits_a_multibyte_char() {
        assert_eq!(clip("short", 30), "short");
        assert_eq!(clip("exactly30-characters-long-yes!", 30).len(), 30);
        // 'é' is two bytes; a cut landing inside it backs off.
        let title = format!("{}é tail", "x".repeat(29));
        assert_eq!(clip(&title, 30), "x".repeat(29));
    }
}
