//! Taskgate job worker runtime.
//!
//! Consumes queued job specifications, runs the configured agent command per
//! job, and keeps the persisted job registry current, including periodic
//! retention sweeps.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::env;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use taskgate_application::{
    JOBS_CHANNEL, JobRegistry, QueueHandler, QueueJob, QueueTransport, RetentionPolicy,
    SubscribeOptions,
};
use taskgate_core::{AppError, AppResult};
use taskgate_domain::{JobRecordPatch, JobSpec, JobStatus};
use taskgate_infrastructure::{FsWorkspaceCleaner, PostgresRecordStore, RedisQueueTransport};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    redis_url: String,
    concurrency: usize,
    agent_command: String,
    workdir_root: String,
    retention: RetentionPolicy,
    retention_sweep_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    let records = PostgresRecordStore::new(pool);
    records.ensure_schema().await?;

    let registry = JobRegistry::new(Arc::new(records), Arc::new(FsWorkspaceCleaner::new()));
    let client = redis::Client::open(config.redis_url.as_str())
        .map_err(|error| AppError::Internal(format!("invalid redis url: {error}")))?;
    let transport = RedisQueueTransport::new(client);

    info!(
        concurrency = config.concurrency,
        sweep_interval_ms = config.retention_sweep_interval_ms,
        "taskgate-worker started"
    );

    let retention_registry = registry.clone();
    let retention_policy = config.retention.clone();
    let sweep_interval = Duration::from_millis(config.retention_sweep_interval_ms);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            let now = Utc::now();

            match retention_registry.enforce_cleanup(&retention_policy, now).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(removed = removed.len(), "retention cleanup evicted job records");
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "retention cleanup failed"),
            }

            match retention_registry.sweep_due_deletions(now).await {
                Ok(swept) if !swept.is_empty() => {
                    info!(swept = swept.len(), "deletion sweep removed job records");
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "deletion sweep failed"),
            }
        }
    });

    let handler = job_handler(registry, config.clone());
    let mut options = SubscribeOptions::new(config.concurrency, handler);
    options.on_failed = Some(Arc::new(|job: &QueueJob, error: &AppError| {
        warn!(job_id = %job.id, error = %error, "job handler failed");
    }));
    options.on_completed = Some(Arc::new(|job: &QueueJob| {
        info!(job_id = %job.id, "job handler finished");
    }));

    let subscription = transport.subscribe(JOBS_CHANNEL, options).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| AppError::Internal(format!("failed to wait for shutdown: {error}")))?;
    info!("shutdown requested; draining in-flight jobs");
    subscription.close().await?;
    info!("taskgate-worker stopped");

    Ok(())
}

fn job_handler(registry: JobRegistry, config: WorkerConfig) -> QueueHandler {
    Arc::new(move |queue_job: QueueJob| {
        let registry = registry.clone();
        let config = config.clone();
        Box::pin(async move {
            let spec: JobSpec = serde_json::from_value(queue_job.payload.clone())
                .map_err(|error| {
                    AppError::Validation(format!(
                        "undecodable job payload for item '{}': {error}",
                        queue_job.id
                    ))
                })?;

            run_job(&registry, &config, spec).await
        })
    })
}

async fn run_job(registry: &JobRegistry, config: &WorkerConfig, spec: JobSpec) -> AppResult<()> {
    let job_id = spec.job_id.clone();
    let workdir = format!(
        "{}/{job_id}",
        config.workdir_root.trim_end_matches('/')
    );

    tokio::fs::create_dir_all(workdir.as_str())
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to create workdir '{workdir}' for job '{job_id}': {error}"
            ))
        })?;

    registry
        .update(
            job_id.as_str(),
            JobRecordPatch {
                status: Some(JobStatus::Running),
                workdir: Some(workdir.clone()),
                ..JobRecordPatch::default()
            },
            Utc::now(),
        )
        .await?;

    info!(job_id = %job_id, job_type = %spec.job_type, "job started");

    match run_agent(config.agent_command.as_str(), workdir.as_str(), &spec).await {
        Ok(summary) => {
            registry
                .update(
                    job_id.as_str(),
                    JobRecordPatch {
                        status: Some(JobStatus::Ok),
                        summary: Some(summary),
                        ..JobRecordPatch::default()
                    },
                    Utc::now(),
                )
                .await?;
            info!(job_id = %job_id, "job succeeded");
            Ok(())
        }
        Err(error) => {
            let failure = error.to_string();
            if let Err(patch_error) = registry
                .update(
                    job_id.as_str(),
                    JobRecordPatch {
                        status: Some(JobStatus::Failed),
                        error: Some(failure.clone()),
                        ..JobRecordPatch::default()
                    },
                    Utc::now(),
                )
                .await
            {
                warn!(
                    job_id = %job_id,
                    error = %patch_error,
                    "failed to record job failure"
                );
            }
            Err(error)
        }
    }
}

/// Runs the agent command with the job specification on stdin.
///
/// A zero exit status succeeds and stdout becomes the job summary; anything
/// else fails with stderr as the failure message.
async fn run_agent(agent_command: &str, workdir: &str, spec: &JobSpec) -> AppResult<String> {
    let input = serde_json::to_vec(spec).map_err(|error| {
        AppError::Internal(format!(
            "failed to serialize job '{}' for the agent: {error}",
            spec.job_id
        ))
    })?;

    let mut child = tokio::process::Command::new(agent_command)
        .arg(spec.job_type.as_str())
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            AppError::Internal(format!("failed to spawn agent '{agent_command}': {error}"))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_slice()).await.map_err(|error| {
            AppError::Internal(format!("failed to send job to the agent: {error}"))
        })?;
    }

    let output = child.wait_with_output().await.map_err(|error| {
        AppError::Internal(format!("failed to wait for agent '{agent_command}': {error}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(output.stderr.as_slice());
        return Err(AppError::Internal(format!(
            "agent exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(output.stdout.as_slice())
        .trim()
        .to_owned())
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
        let concurrency = parse_env_usize("WORKER_CONCURRENCY", 2)?;
        let agent_command = required_env("AGENT_COMMAND")?;
        let workdir_root =
            env::var("WORKDIR_ROOT").unwrap_or_else(|_| "/var/lib/taskgate/work".to_owned());
        let retention_sweep_interval_ms =
            parse_env_u64("RETENTION_SWEEP_INTERVAL_MS", 60_000)?;

        if concurrency == 0 {
            return Err(AppError::Validation(
                "WORKER_CONCURRENCY must be greater than zero".to_owned(),
            ));
        }

        if retention_sweep_interval_ms == 0 {
            return Err(AppError::Validation(
                "RETENTION_SWEEP_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        let retention = RetentionPolicy {
            max_entries: optional_env_usize("RETENTION_MAX_ENTRIES")?,
            max_age_seconds: optional_env_i64("RETENTION_MAX_AGE_SECONDS")?,
            resumable_job_types: env::var("RETENTION_RESUMABLE_JOB_TYPES")
                .unwrap_or_else(|_| "coding_task".to_owned())
                .split(',')
                .map(|job_type| job_type.trim().to_owned())
                .filter(|job_type| !job_type.is_empty())
                .collect::<BTreeSet<String>>(),
        };

        Ok(Self {
            database_url,
            redis_url,
            concurrency,
            agent_command,
            workdir_root,
            retention,
            retention_sweep_interval_ms,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn optional_env_usize(name: &str) -> AppResult<Option<usize>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
        Err(_) => Ok(None),
    }
}

fn optional_env_i64(name: &str) -> AppResult<Option<i64>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
        Err(_) => Ok(None),
    }
}
