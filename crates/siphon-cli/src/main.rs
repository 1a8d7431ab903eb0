use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use siphon_client::{FixtureClient, HttpPageClient, SourceClient};
use siphon_core::{
    EngineConfig, ExtractedRecord, InMemoryJobStore, InMemoryResultStore, Job, JobSpec, JobState,
    JobStore, Page, PageRequest, ResultStore, Scheduler, StatsAggregator, TracingRunnerReporter,
    request_cancel,
};
use siphon_db::{Database, DatabaseConfig, PgJobStore, PgResultStore};

#[derive(Parser)]
#[command(name = "siphon", version, about = "Resumable paginated extraction jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool against PostgreSQL until Ctrl-C
    Worker {
        /// Seconds between scans for newly submitted or orphaned jobs
        #[arg(long, env = "SIPHON_POLL_INTERVAL", default_value_t = 5)]
        poll_interval: u64,

        /// Allow HTTP sources on private or loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Create a PENDING job for a worker to pick up
    Submit {
        /// Source kind ("http" or "fixture")
        #[arg(short, long)]
        source: String,

        /// Source parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
    },

    /// Show a job
    Status { id: Uuid },

    /// List jobs in creation order
    List {
        /// Only jobs in this state
        #[arg(short, long)]
        state: Option<JobState>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Cursor from a previous page
        #[arg(short, long)]
        cursor: Option<String>,
    },

    /// Page through a job's extracted records
    Results {
        id: Uuid,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Cursor from a previous page
        #[arg(short, long)]
        cursor: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// Request cancellation of a job
    Cancel { id: Uuid },

    /// Delete a finished job and its records
    Remove { id: Uuid },

    /// Aggregate job and record statistics
    Stats,

    /// Run fixture jobs through an in-memory engine and print the stats
    Demo {
        #[arg(long, default_value_t = 5)]
        jobs: usize,

        /// Records served per job
        #[arg(long, default_value_t = 50)]
        records: u64,

        #[arg(long, default_value_t = 10)]
        page_size: u64,

        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Simulated latency per page fetch
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,

        /// Cancel the last submitted job shortly after it starts
        #[arg(long, default_value_t = false)]
        cancel_last: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("siphon=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            poll_interval,
            allow_private_urls,
        } => {
            let db = connect_db().await?;
            cmd_worker(&db, Duration::from_secs(poll_interval.max(1)), allow_private_urls).await?;
        }
        Commands::Submit { source, params } => {
            let db = connect_db().await?;
            cmd_submit(&db.job_store(), &source, &params).await?;
        }
        Commands::Status { id } => {
            let db = connect_db().await?;
            cmd_status(&db.job_store(), &db.result_store(), id).await?;
        }
        Commands::List {
            state,
            limit,
            cursor,
        } => {
            let db = connect_db().await?;
            let request = PageRequest::parse(cursor.as_deref(), limit)?;
            cmd_list(&db.job_store(), state, request).await?;
        }
        Commands::Results {
            id,
            limit,
            cursor,
            format,
        } => {
            let db = connect_db().await?;
            let request = PageRequest::parse(cursor.as_deref(), limit)?;
            cmd_results(&db.job_store(), &db.result_store(), id, request, format).await?;
        }
        Commands::Cancel { id } => {
            let db = connect_db().await?;
            let job = request_cancel(&db.job_store(), id).await?;
            println!("{} {}", job.id, job.state);
        }
        Commands::Remove { id } => {
            let db = connect_db().await?;
            cmd_remove(&db.job_store(), &db.result_store(), id).await?;
        }
        Commands::Stats => {
            let db = connect_db().await?;
            let snapshot = StatsAggregator::new(db.job_store(), db.result_store())
                .snapshot()
                .await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Demo {
            jobs,
            records,
            page_size,
            workers,
            latency_ms,
            cancel_last,
        } => {
            let fixture = serde_json::json!({
                "token": "demo_token_12345",
                "records": records,
                "page_size": page_size,
                "latency_ms": latency_ms,
            });
            cmd_demo(jobs, fixture, workers, cancel_last).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_worker(db: &Database, poll_interval: Duration, allow_private_urls: bool) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let mut http = HttpPageClient::new().context("Failed to create HTTP client")?;
    if allow_private_urls {
        http = http.allow_private_urls();
    }

    let scheduler = Scheduler::start(
        db.job_store().with_max_page_size(config.max_page_size),
        db.result_store().with_max_page_size(config.max_page_size),
        SourceClient::new(http),
        config,
        Arc::new(TracingRunnerReporter),
    );

    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = scheduler.recover().await {
                    tracing::error!(error = %e, "Recovery scan failed");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

async fn cmd_submit(store: &PgJobStore, source: &str, params: &str) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(params).context("--params must be a JSON object")?;
    anyhow::ensure!(params.is_object(), "--params must be a JSON object");

    let job = store.create(JobSpec::new(source, params)).await?;
    tracing::info!(job_id = %job.id, %source, "Job submitted");
    println!("{}", job.id);
    Ok(())
}

async fn cmd_status(jobs: &PgJobStore, results: &PgResultStore, id: Uuid) -> Result<()> {
    let mut job = jobs.get(id).await?;
    if !job.state.is_terminal() {
        job.record_count = results.count(id).await?;
    }
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cmd_list(store: &PgJobStore, state: Option<JobState>, request: PageRequest) -> Result<()> {
    let page = store.list(state, request).await?;

    if page.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &page.items {
        print_job_line(job);
    }
    if let Some(next) = page.next_cursor {
        println!("\nNext page: --cursor {next}");
    }
    Ok(())
}

fn print_job_line(job: &Job) {
    let error = job
        .error
        .as_deref()
        .map(|e| format!(" ({e})"))
        .unwrap_or_default();
    println!(
        "  {} {:<10} {:<8} {:>8} records  {}{}",
        job.id,
        job.state.as_str(),
        job.spec.source,
        job.record_count,
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        error,
    );
}

async fn cmd_results(
    jobs: &PgJobStore,
    results: &PgResultStore,
    id: Uuid,
    request: PageRequest,
    format: OutputFormat,
) -> Result<()> {
    // Unknown ids fail here rather than printing an empty page.
    jobs.get(id).await?;
    let page = results.page(id, request).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
        OutputFormat::Csv => {
            write_csv(&page, std::io::stdout().lock())?;
            if let Some(next) = page.next_cursor {
                eprintln!("Next page: --cursor {next}");
            }
        }
    }
    Ok(())
}

fn write_csv(page: &Page<ExtractedRecord>, out: impl Write) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(["offset", "external_id", "created_at", "data"])?;
    for record in &page.items {
        writer.write_record([
            record.offset.to_string(),
            record.external_id.clone(),
            record.created_at.to_rfc3339(),
            record.data.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

async fn cmd_remove(jobs: &PgJobStore, results: &PgResultStore, id: Uuid) -> Result<()> {
    let job = jobs.get(id).await?;
    anyhow::ensure!(
        job.state.is_terminal(),
        "Job {id} is still {}; cancel it first",
        job.state
    );

    let removed = results.remove(id).await?;
    jobs.delete(id).await?;
    println!("Removed job {id} and {removed} records");
    Ok(())
}

async fn cmd_demo(
    jobs: usize,
    params: serde_json::Value,
    workers: usize,
    cancel_last: bool,
) -> Result<()> {
    let store = InMemoryJobStore::new();
    let results = InMemoryResultStore::new();
    let scheduler = Scheduler::start(
        store.clone(),
        results,
        FixtureClient::new(),
        EngineConfig::default().with_workers(workers),
        Arc::new(TracingRunnerReporter),
    );

    let mut ids = Vec::with_capacity(jobs);
    for n in 0..jobs {
        let mut params = params.clone();
        params["demo_job"] = serde_json::json!(n);
        ids.push(scheduler.submit(JobSpec::new("fixture", params)).await?);
    }
    // One job with a rejected token shows the failure path.
    let rejected = scheduler
        .submit(JobSpec::new(
            "fixture",
            serde_json::json!({"token": "invalid_token_demo"}),
        ))
        .await?;
    ids.push(rejected);

    if cancel_last && jobs > 0 {
        let last = ids[jobs - 1];
        while store.get(last).await?.state == JobState::Pending {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.cancel(last).await?;
    }

    loop {
        let snapshot = scheduler.stats().await?;
        if snapshot.active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for id in &ids {
        print_job_line(&scheduler.status(*id).await?);
    }
    println!("{}", serde_json::to_string_pretty(&scheduler.stats().await?)?);

    scheduler.shutdown().await;
    Ok(())
}
