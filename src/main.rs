use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobkeeper::background_jobs::jobs::{
    DatabaseBackupJob, DATABASE_BACKUP_JOB_TYPE, DATABASE_BACKUP_SCHEDULE,
};
use jobkeeper::background_jobs::{
    Actor, AuditEvent, EngineError, Job, JobEngine, JobFilter, JobStatus, Payload, SqliteAuditLog,
};
use jobkeeper::config::{AppConfig, CliConfig, FileConfig, DEFAULT_METRICS_PORT};
use jobkeeper::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "jobkeeper", about = "Background job scheduler and runner")]
struct CliArgs {
    /// Directory holding jobs.db and job_audit.db.
    #[clap(long, global = true, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Prefix of the run tokens issued by this process.
    #[clap(long, global = true)]
    pub node_id: Option<String>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, global = true, default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Name the admin commands act as.
    #[clap(long, global = true)]
    pub operator: Option<String>,

    /// Role of the operator: admin, operator or viewer.
    #[clap(long, global = true)]
    pub operator_role: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and dispatcher until Ctrl-C.
    Run,
    /// List jobs, newest first.
    List {
        #[clap(long)]
        job_type: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one job.
    Show { job_id: String },
    /// Requeue a failed job.
    Retry { job_id: String },
    /// Cancel a queued job.
    Cancel { job_id: String },
    /// Take a database backup now, under the global lock.
    BackupNow,
    /// Show audit events, for one job or the most recent overall.
    Audit {
        job_id: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// List schedules, or enable/disable one.
    Schedules {
        #[clap(long, conflicts_with = "disable")]
        enable: Option<String>,
        #[clap(long)]
        disable: Option<String>,
    },
}

fn build_engine(config: &AppConfig) -> Result<(JobEngine, Arc<SqliteAuditLog>)> {
    let (builder, audit_log) = JobEngine::open_sqlite(&config.db_dir)?;
    let engine = builder.settings(config.engine.clone()).build();

    let backup = DatabaseBackupJob::new(
        config.jobs_db_path(),
        config.backup.backup_dir.clone(),
        config.backup.retention_count,
    );
    let schedule_time = config
        .backup
        .enabled
        .then_some(config.backup.schedule_time.as_str());
    backup.register(&engine, schedule_time)?;

    if !config.backup.enabled {
        match engine.admin().set_schedule_enabled(
            &Actor::system("config"),
            DATABASE_BACKUP_SCHEDULE,
            false,
        ) {
            Ok(_) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok((engine, audit_log))
}

fn print_job(job: &Job) {
    println!("{}", job.id);
    println!("  type:         {}", job.job_type);
    println!("  status:       {}", job.status);
    println!("  attempts:     {}/{}", job.attempt_count, job.max_attempts);
    println!("  created:      {} by {}", job.created_at, job.created_by);
    if let Some(at) = job.scheduled_at {
        println!("  scheduled:    {}", at);
    }
    if let Some(at) = job.started_at {
        println!("  started:      {}", at);
    }
    if let Some(at) = job.completed_at {
        println!("  completed:    {}", at);
    }
    if let Some(error) = &job.last_error {
        println!("  last error:   {}", error);
    }
}

fn print_audit_event(event: &AuditEvent) {
    let from = event
        .from
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {}  {} -> {}  by {}{}",
        event.timestamp,
        event.job_id,
        from,
        event.to,
        event.actor,
        event
            .reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );
}

async fn run_engine(config: &AppConfig, engine: JobEngine) -> Result<()> {
    let shutdown = engine.shutdown_token();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down");
        signal_token.cancel();
    });

    if config.metrics_port != 0 {
        metrics::init_metrics();
        let port = config.metrics_port;
        let metrics_token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port, metrics_token).await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    engine.run().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        node_id: cli_args.node_id.clone(),
        metrics_port: cli_args.metrics_port,
        operator: cli_args.operator.clone(),
        operator_role: cli_args.operator_role.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening job databases in {:?}...", config.db_dir);
    let (engine, audit_log) = build_engine(&config)?;
    let operator = &config.operator;

    match cli_args.command {
        Command::Run => run_engine(&config, engine).await?,
        Command::List {
            job_type,
            status,
            limit,
        } => {
            let mut filter = JobFilter {
                limit,
                ..Default::default()
            };
            if let Some(job_type) = job_type {
                filter = filter.with_type(job_type);
            }
            if let Some(status) = status {
                let status = JobStatus::parse(&status)
                    .with_context(|| format!("Unknown job status: {}", status))?;
                filter = filter.with_status(status);
            }
            for job in engine.admin().list(operator, &filter)? {
                println!(
                    "{}  {:<24} {:<10} {}/{}  {}",
                    job.id,
                    job.job_type,
                    job.status,
                    job.attempt_count,
                    job.max_attempts,
                    job.created_at
                );
            }
        }
        Command::Show { job_id } => print_job(&engine.admin().get(operator, &job_id)?),
        Command::Retry { job_id } => print_job(&engine.admin().retry(operator, &job_id)?),
        Command::Cancel { job_id } => print_job(&engine.admin().cancel(operator, &job_id)?),
        Command::BackupNow => {
            let job_id = engine
                .run_now(DATABASE_BACKUP_JOB_TYPE, Payload::empty(), operator)
                .await?;
            engine.wait_idle().await;
            print_job(&engine.admin().get(operator, &job_id)?);
        }
        Command::Audit { job_id, limit } => {
            let events = match job_id {
                Some(job_id) => {
                    engine.admin().get(operator, &job_id)?;
                    audit_log.events_for_job(&job_id)?
                }
                None => audit_log.recent(limit)?,
            };
            for event in &events {
                print_audit_event(event);
            }
        }
        Command::Schedules { enable, disable } => {
            if let Some(name) = enable {
                engine.admin().set_schedule_enabled(operator, &name, true)?;
            }
            if let Some(name) = disable {
                engine.admin().set_schedule_enabled(operator, &name, false)?;
            }
            let now = chrono::Utc::now();
            for schedule in engine.admin().list_schedules(operator)? {
                let next = schedule
                    .next_run_after(now)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<28} {:<20} {:<24} {:<8} next: {}",
                    schedule.definition.name,
                    schedule.definition.job_type,
                    schedule.definition.cadence.to_string(),
                    if schedule.definition.enabled { "enabled" } else { "disabled" },
                    next
                );
            }
        }
    }

    Ok(())
}
