mod config;
mod errors;
mod harness;
mod pipeline;
mod protocol;
mod ratelimit;
mod runner;
mod screener;
mod sqlbox;
mod sqlexec;
mod sqlguard;
mod testspec;
mod verdict;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{get_config, init_config};
use crate::pipeline::{Pipeline, QuerySubmission, ScriptSubmission, SessionRequest};
use crate::ratelimit::{Admission, RateLimiter};
use crate::runner::ProcessRunner;
use crate::sqlbox::{DockerBackend, InstanceManager};
use crate::verdict::ExecutionResult;

/// Worker job enum - represents the submission kinds the worker grades
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerJob {
    /// Grade a script submission against its test specs
    Script(ScriptSubmission),
    /// Run a query submission against the session's isolated instance
    Query(QuerySubmission),
    /// Describe the session's schema for the practice UI
    Schema(SessionRequest),
    /// Reset the session's instance to its initial state
    Reset(SessionRequest),
}

impl WorkerJob {
    fn submission_id(&self) -> i64 {
        match self {
            WorkerJob::Script(job) => job.submission_id,
            WorkerJob::Query(job) => job.submission_id,
            WorkerJob::Schema(job) | WorkerJob::Reset(job) => job.submission_id,
        }
    }

    fn author_id(&self) -> i64 {
        match self {
            WorkerJob::Script(job) => job.author_id,
            WorkerJob::Query(job) => job.author_id,
            WorkerJob::Schema(job) | WorkerJob::Reset(job) => job.author_id,
        }
    }
}

const QUEUE_NAME: &str = "practice:queue";
const RESULT_CHANNEL: &str = "practice:results";
const RESULT_KEY_PREFIX: &str = "practice:result:";
const RESULT_TTL_SECS: u64 = 3600;

type WorkerPipeline = Pipeline<ProcessRunner, DockerBackend>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("practice_judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();
    init_config()?;
    let config = get_config();

    // Optional deployment-specific screen policy additions
    if let Ok(policy_path) = std::env::var("SCREEN_POLICY_FILE") {
        screener::init_policy(&policy_path)?;
        info!("Loaded screen policy overrides from {}", policy_path);
    }

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());

    info!("Starting Practice Judge Worker...");

    let client = redis::Client::open(redis_url.clone())?;
    let mut conn = get_redis_connection(&client).await?;
    info!("Connected to Redis at {}", redis_url);

    let pipeline: Arc<WorkerPipeline> = Arc::new(Pipeline::new(
        ProcessRunner::from_config(),
        InstanceManager::new(
            DockerBackend::new(config.sql_image.clone()),
            Duration::from_secs(config.sql_startup_timeout_secs),
            Duration::from_secs(3),
        ),
    ));
    info!(
        "Pipeline initialized (interpreter: {}, sql image: {})",
        config.python_bin, config.sql_image
    );

    let limiter = RateLimiter::new(
        config.rate_max_requests,
        Duration::from_secs(config.rate_window_secs),
        Duration::from_secs(config.rate_cooldown_secs),
    );

    let _sweep_handle = spawn_sweeper(pipeline.clone());
    info!(
        "Sandbox sweeper running every {}s (max age {}s)",
        config.sweep_interval_secs, config.sweep_max_age_secs
    );

    info!("Waiting for jobs...");

    loop {
        // Block and wait for a job from the queue (BLPOP)
        let result: Option<(String, String)> = match conn.blpop(QUEUE_NAME, 0.0).await {
            Ok(res) => res,
            Err(e) => {
                warn!("Redis BLPOP failed: {}. Attempting to reconnect...", e);
                conn = get_redis_connection(&client).await?;
                continue;
            }
        };

        let Some((_, job_data)) = result else {
            continue;
        };

        let job = match serde_json::from_str::<WorkerJob>(&job_data) {
            Ok(job) => job,
            Err(e) => {
                warn!("Failed to parse job data: {}", e);
                continue;
            }
        };

        let submission_id = job.submission_id();
        let identity = format!("user_{}", job.author_id());

        let result = match limiter.admit(&identity) {
            Admission::Allowed { remaining, .. } => {
                info!(
                    "Received job: submission_id={}, author={} ({} requests remaining)",
                    submission_id, identity, remaining
                );
                grade(&pipeline, &job).await
            }
            Admission::Denied { retry_after } => {
                warn!(
                    "Rate limit exceeded for {}: retry after {}s",
                    identity,
                    retry_after.as_secs()
                );
                ExecutionResult::errored(
                    submission_id,
                    format!(
                        "Rate limit exceeded. Please try again in {} seconds.",
                        retry_after.as_secs()
                    ),
                )
            }
        };

        if let Err(e) = store_result(&mut conn, &client, &result).await {
            error!("Failed to store result for {}: {}", submission_id, e);
        }
        info!(
            "Job completed: submission_id={}, status={}",
            submission_id, result.status
        );
    }
}

async fn grade(pipeline: &WorkerPipeline, job: &WorkerJob) -> ExecutionResult {
    match job {
        WorkerJob::Script(script) => pipeline.grade_script(script).await,
        WorkerJob::Query(query) => pipeline.grade_query(query).await,
        WorkerJob::Schema(request) => pipeline.schema(request).await,
        WorkerJob::Reset(request) => pipeline.reset_session(request).await,
    }
}

/// Store a verdict in Redis: keyed result for polling plus a pub/sub
/// notification for subscribed listeners
async fn store_result(
    conn: &mut MultiplexedConnection,
    client: &redis::Client,
    result: &ExecutionResult,
) -> Result<()> {
    let result_json = serde_json::to_string(result)?;
    let result_key = format!("{}{}", RESULT_KEY_PREFIX, result.submission_id);

    if let Err(e) = conn
        .set_ex::<_, _, ()>(&result_key, &result_json, RESULT_TTL_SECS)
        .await
    {
        warn!("Redis set_ex failed: {}. Reconnecting and retrying...", e);
        let mut new_conn = get_redis_connection(client).await?;
        new_conn
            .set_ex::<_, _, ()>(&result_key, &result_json, RESULT_TTL_SECS)
            .await?;
        *conn = new_conn;
    }

    if let Err(e) = conn.publish::<_, _, ()>(RESULT_CHANNEL, &result_json).await {
        warn!("Redis publish failed: {}. Reconnecting and retrying...", e);
        let mut new_conn = get_redis_connection(client).await?;
        new_conn
            .publish::<_, _, ()>(RESULT_CHANNEL, &result_json)
            .await?;
        *conn = new_conn;
    }

    Ok(())
}

/// Periodic garbage collection of aged SQL sandboxes, independent of
/// request handling
fn spawn_sweeper(pipeline: Arc<WorkerPipeline>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = get_config();
        let interval = Duration::from_secs(config.sweep_interval_secs);
        let max_age = Duration::from_secs(config.sweep_max_age_secs);

        loop {
            sleep(interval).await;
            let reaped = pipeline.instances().sweep(max_age).await;
            if reaped > 0 {
                info!(
                    "Sweep reaped {} aged sandbox instance(s), {} still registered",
                    reaped,
                    pipeline.instances().session_count()
                );
            }
        }
    })
}

async fn get_redis_connection(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!("Failed to connect to Redis: {}. Retrying in 3 seconds...", e);
                sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
