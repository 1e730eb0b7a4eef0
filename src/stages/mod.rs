pub mod digest;
pub mod enrichment;
pub mod graph;
pub mod indexing;
pub mod tagging;
pub mod trends;
pub mod vision;

use crate::context::AppContext;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tgpulse_bus::{Envelope, EventPayload, StreamMessage, stream_key};
use tgpulse_db::db;

/// Longest we'll honor a provider-advised rate-limit sleep.
const MAX_RATE_LIMIT_SLEEP: Duration = Duration::from_secs(60);

/// The error taxonomy every stage maps into. The harness owns the policy:
/// what retries, what skips, what poisons, what kills the worker.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited, advised to wait {0:?}")]
    RateLimited(Duration),

    #[error("schema-invalid input: {0}")]
    SchemaInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("conflict: side effect already applied")]
    Conflict,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn class(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::RateLimited(_) => "rate_limited",
            StageError::SchemaInvalid(_) => "schema_invalid",
            StageError::NotFound(_) => "not_found",
            StageError::QuotaExhausted(_) => "quota_exhausted",
            StageError::Conflict => "conflict",
            StageError::Fatal(_) => "fatal",
        }
    }

    /// The reason string carried on the fallback downstream event for the
    /// terminal-skip classes.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            StageError::NotFound(_) => Some("not_found"),
            StageError::QuotaExhausted(_) => Some("quota_exhausted"),
            StageError::Conflict => Some("conflict"),
            _ => None,
        }
    }
}

impl From<crate::providers::ProviderError> for StageError {
    fn from(err: crate::providers::ProviderError) -> Self {
        use crate::providers::ProviderError;
        match err {
            ProviderError::RateLimited {
                retry_after_secs, ..
            } => StageError::RateLimited(Duration::from_secs(retry_after_secs)),
            ProviderError::BadResponse { .. } => StageError::SchemaInvalid(err.to_string()),
            _ => StageError::Transient(err.to_string()),
        }
    }
}

impl From<tgpulse_db::QueryError> for StageError {
    fn from(err: tgpulse_db::QueryError) -> Self {
        if err.is_unique_violation() {
            StageError::Conflict
        } else {
            StageError::Transient(err.to_string())
        }
    }
}

impl From<tgpulse_db::PoolError> for StageError {
    fn from(err: tgpulse_db::PoolError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<tgpulse_bus::BusError> for StageError {
    fn from(err: tgpulse_bus::BusError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<tgpulse_cas::CasError> for StageError {
    fn from(err: tgpulse_cas::CasError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<crate::quota::QuotaError> for StageError {
    fn from(err: crate::quota::QuotaError) -> Self {
        StageError::Transient(err.to_string())
    }
}

/// What a stage hands back to the harness on success: optionally a
/// downstream event (idempotency key + payload) and an outcome label for
/// metrics.
pub struct StageResult<Out> {
    pub downstream: Option<(String, Out)>,
    pub outcome: &'static str,
}

/// Placeholder Out type for stages that terminate a chain (vision, graph,
/// digest). Never published: those stages always return `downstream: None`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct NoDownstream {}

impl EventPayload for NoDownstream {
    const SCHEMA_NAME: &'static str = "internal.none";
    const SCHEMA_VERSION: u32 = 1;
}

/// One pipeline stage. The harness drives the consumer-group loop; the
/// stage supplies the per-event side effects and the fallback event that
/// keeps the chain alive on skip/failure.
pub trait Stage: Send + Sync + 'static {
    type In: EventPayload + Send + Sync;
    type Out: EventPayload + Send + Sync;

    const NAME: &'static str;
    const GROUP: &'static str;

    fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<Self::In>,
    ) -> impl Future<Output = Result<StageResult<Self::Out>, StageError>> + Send;

    /// The downstream event to publish when this stage terminal-skips.
    /// Stages whose downstream is conditional (trend detection) or absent
    /// (vision, graph, digest) return None; everyone else must return Some
    /// so the chain never dead-ends silently.
    fn fallback(&self, envelope: &Envelope<Self::In>, reason: &str)
    -> Option<(String, Self::Out)>;
}

/// Runs a whole stage: N parallel workers under one supervised task. If any
/// worker dies on a fatal error the rest are aborted and the supervisor
/// restarts the stage with backoff.
pub async fn run_stage<S: Stage>(
    stage: Arc<S>,
    ctx: AppContext,
    workers: usize,
    cancel: tokio_util::sync::CancellationToken,
) -> miette::Result<()> {
    let mut join_set = tokio::task::JoinSet::new();
    for worker_idx in 0..workers {
        join_set.spawn(run_stage_worker(
            stage.clone(),
            ctx.clone(),
            worker_idx,
            cancel.clone(),
        ));
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(miette::miette!("{} worker panicked: {join_err}", S::NAME)),
        }
    }
    Ok(())
}

/// Runs one worker of one stage until cancelled. Claims fresh messages,
/// reclaims stale pending ones, and moves poison past the retry budget to
/// the DLQ.
pub async fn run_stage_worker<S: Stage>(
    stage: Arc<S>,
    ctx: AppContext,
    worker_idx: usize,
    cancel: tokio_util::sync::CancellationToken,
) -> miette::Result<()> {
    let consumer = format!("{}:{}:{worker_idx}", ctx.instance_id, S::NAME);
    let stages_config = &ctx.config.stages;

    for tenant in &ctx.config.tenants {
        let key = stream_key(S::In::SCHEMA_NAME, tenant);
        ctx.bus
            .ensure_group(&key, S::GROUP)
            .await
            .map_err(|e| miette::miette!("couldn't create consumer group on {key}: {e}"))?;
    }
    info!("{} worker {worker_idx} consuming as {consumer}", S::NAME);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        for tenant in &ctx.config.tenants {
            let key = stream_key(S::In::SCHEMA_NAME, tenant);

            // Reclaim stale pending work before asking for fresh messages.
            let mut messages = match reclaim_stale::<S>(&ctx, &key, tenant, &consumer).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!("{} worker {worker_idx} reclaim failed: {err}", S::NAME);
                    Vec::new()
                }
            };

            match ctx
                .bus
                .read_group(
                    &key,
                    S::GROUP,
                    &consumer,
                    stages_config.batch_size,
                    stages_config.block_ms,
                )
                .await
            {
                Ok(fresh) => messages.extend(fresh),
                Err(err) => {
                    warn!("{} worker {worker_idx} read failed: {err}", S::NAME);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }

            for message in messages {
                match process_one::<S>(&stage, &ctx, tenant, &key, &message).await {
                    Ok(()) => {}
                    Err(err @ StageError::Fatal(_)) => {
                        // Crash this worker; the supervisor restarts it
                        // with backoff.
                        error!("{} worker {worker_idx} fatal error: {err}", S::NAME);
                        return Err(miette::miette!("{} stage fatal: {err}", S::NAME));
                    }
                    Err(err) => {
                        // A harness-side bus/db hiccup. The message stays
                        // pending and gets redelivered; side effects are
                        // idempotent, so replaying is safe.
                        warn!(
                            "{} worker {worker_idx} couldn't finish message {}: {err}",
                            S::NAME, message.id
                        );
                        metrics::counter!("stage_errors_total", "stage" => S::NAME, "error_class" => err.class())
                            .increment(1);
                    }
                }

                // Cancellation drains the current batch, not mid-message.
                if cancel.is_cancelled() {
                    debug!("{} worker {worker_idx} draining for shutdown", S::NAME);
                }
            }
        }
    }

    info!("{} worker {worker_idx} exited", S::NAME);
    Ok(())
}

async fn reclaim_stale<S: Stage>(
    ctx: &AppContext,
    key: &str,
    tenant: &str,
    consumer: &str,
) -> Result<Vec<StreamMessage>, tgpulse_bus::BusError> {
    let stages_config = &ctx.config.stages;
    let pending = ctx
        .bus
        .pending(key, S::GROUP, stages_config.batch_size)
        .await?;

    let mut stale = Vec::new();
    let mut poisoned = Vec::new();
    for entry in pending {
        if entry.idle_ms < stages_config.pending_idle_ms {
            continue;
        }
        if entry.delivery_count > stages_config.max_retries {
            poisoned.push(entry.id);
        } else {
            stale.push(entry.id);
        }
    }

    // Poisoned messages must be claimed first so we have their bodies to
    // copy into the DLQ.
    let for_dlq = ctx
        .bus
        .claim(key, S::GROUP, consumer, stages_config.pending_idle_ms as usize, &poisoned)
        .await?;
    for message in for_dlq {
        metrics::counter!("stage_dlq_total", "stage" => S::NAME, "error_class" => "retry_exhausted")
            .increment(1);
        ctx.bus
            .move_to_dlq(
                S::In::SCHEMA_NAME,
                tenant,
                S::GROUP,
                &message,
                "retry budget exhausted",
            )
            .await?;
    }

    ctx.bus
        .claim(key, S::GROUP, consumer, stages_config.pending_idle_ms as usize, &stale)
        .await
}

async fn process_one<S: Stage>(
    stage: &Arc<S>,
    ctx: &AppContext,
    tenant: &str,
    key: &str,
    message: &StreamMessage,
) -> Result<(), StageError> {
    let envelope = match Envelope::<S::In>::decode(&message.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Bad shape or incompatible version: poison, straight to DLQ.
            metrics::counter!("stage_dlq_total", "stage" => S::NAME, "error_class" => err.error_class())
                .increment(1);
            ctx.bus
                .move_to_dlq(S::In::SCHEMA_NAME, tenant, S::GROUP, message, &err.to_string())
                .await?;
            return Ok(());
        }
    };

    // Per-stage idempotency: the dedup row is written only after the side
    // effect and downstream publish are both durable, so replays re-run the
    // (idempotent) side effects rather than dropping the event.
    let dedup_key = format!("{}:{}", envelope.idempotency_key, S::NAME);
    {
        let mut conn = ctx.conn()?;
        if db::is_processed(&mut conn, &dedup_key)? {
            debug!("{} already processed {dedup_key}; acking duplicate", S::NAME);
            metrics::counter!("stage_duplicates_total", "stage" => S::NAME).increment(1);
            ctx.bus.ack(key, S::GROUP, &message.id).await?;
            return Ok(());
        }
    }

    let result = loop {
        match stage.handle(ctx, &envelope).await {
            Err(StageError::RateLimited(advised)) => {
                // Sleep exactly what the provider asked for (capped), then
                // try again without consuming a delivery attempt.
                let wait = advised.min(MAX_RATE_LIMIT_SLEEP);
                info!("{} rate limited; sleeping {wait:?} as advised", S::NAME);
                tokio::time::sleep(wait).await;
                continue;
            }
            other => break other,
        }
    };

    match result {
        Ok(result) => {
            if let Some((idem_key, payload)) = result.downstream {
                publish_downstream::<S>(ctx, tenant, &envelope.trace_id, idem_key, payload).await?;
            }
            finish::<S>(ctx, key, &message.id, &dedup_key).await?;
            metrics::counter!("stage_processed_total", "stage" => S::NAME, "outcome" => result.outcome)
                .increment(1);
            Ok(())
        }
        Err(err) => match &err {
            StageError::Transient(reason) => {
                // Leave unacked; the pending-reclaim path redelivers it and
                // eventually DLQs it if it never succeeds.
                warn!("{} transient failure, leaving for redelivery: {reason}", S::NAME);
                metrics::counter!("stage_errors_total", "stage" => S::NAME, "error_class" => err.class())
                    .increment(1);
                Ok(())
            }
            StageError::SchemaInvalid(reason) => {
                metrics::counter!("stage_dlq_total", "stage" => S::NAME, "error_class" => "schema_invalid")
                    .increment(1);
                ctx.bus
                    .move_to_dlq(S::In::SCHEMA_NAME, tenant, S::GROUP, message, reason)
                    .await?;
                Ok(())
            }
            StageError::NotFound(_) | StageError::QuotaExhausted(_) | StageError::Conflict => {
                // Terminal-skip: the pipeline continues. Publish the
                // fallback downstream event with the reason so nothing
                // dead-ends.
                let reason = err.skip_reason().expect("skip classes always have a reason");
                if let Some((idem_key, payload)) = stage.fallback(&envelope, reason) {
                    publish_downstream::<S>(ctx, tenant, &envelope.trace_id, idem_key, payload)
                        .await?;
                }
                finish::<S>(ctx, key, &message.id, &dedup_key).await?;
                metrics::counter!("stage_processed_total", "stage" => S::NAME, "outcome" => reason)
                    .increment(1);
                Ok(())
            }
            StageError::RateLimited(_) => unreachable!("handled in the retry loop above"),
            StageError::Fatal(_) => Err(err),
        },
    }
}

async fn publish_downstream<S: Stage>(
    ctx: &AppContext,
    tenant: &str,
    trace_id: &str,
    idem_key: String,
    payload: S::Out,
) -> Result<(), StageError> {
    let envelope = Envelope::new(tenant, trace_id, idem_key, payload);
    let out_key = stream_key(S::Out::SCHEMA_NAME, tenant);
    ctx.bus.publish(&out_key, &envelope.encode()).await?;
    Ok(())
}

/// Ack only after the dedup marker is durable. Crash between the two leaves
/// the message pending, which is the at-least-once contract working as
/// intended.
async fn finish<S: Stage>(
    ctx: &AppContext,
    key: &str,
    message_id: &str,
    dedup_key: &str,
) -> Result<(), StageError> {
    {
        let mut conn = ctx.conn()?;
        db::try_mark_processed(&mut conn, dedup_key, S::NAME)?;
    }
    ctx.bus.ack(key, S::GROUP, message_id).await?;
    Ok(())
}
