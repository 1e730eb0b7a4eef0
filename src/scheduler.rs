use crate::context::AppContext;
use crate::parser::{self, ParseMode};
use chrono::Utc;
use log::{debug, error, info, warn};
use miette::IntoDiagnostic;
use rand::Rng;
use std::time::Duration;
use tgpulse_db::db;
use tgpulse_db::models::DbChannel;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const LOCK_KEY: &str = "scheduler:lock";

#[derive(Debug)]
pub struct ParseJob {
    pub channel: DbChannel,
    pub mode: ParseMode,
    pub since: chrono::DateTime<Utc>,
}

/// Plans one tick's worth of jobs from the due-channel list. Pure so the
/// mode/since decisions can be tested without a database.
pub fn plan_jobs(
    channels: Vec<DbChannel>,
    now: chrono::DateTime<Utc>,
    lpa_max_age_hours: i64,
    historical_hours: i64,
    incremental_minutes: i64,
) -> Vec<ParseJob> {
    channels
        .into_iter()
        .map(|channel| {
            let mode = parser::decide_mode(channel.last_parsed_at, now, lpa_max_age_hours);
            let since = parser::since_date(
                mode,
                channel.last_parsed_at,
                now,
                historical_hours,
                incremental_minutes,
            );
            ParseJob {
                channel,
                mode,
                since,
            }
        })
        .collect()
}

/// The ingestion scheduler. Exactly one instance per deployment does any
/// work, enforced by the coordinator lock; the rest stay in standby and
/// keep trying to take over.
pub async fn run_scheduler(ctx: AppContext, cancel: CancellationToken) -> miette::Result<()> {
    let config = ctx.config.scheduler.clone();
    let lock_ttl_ms = config.lock_ttl_sec * 1000;
    let renew_every = Duration::from_secs(config.lock_ttl_sec / 3);
    let tick_every = Duration::from_secs(config.interval_sec);

    // The bounded parse worker pool. Jobs are routed by channel id so the
    // same channel never runs on two workers at once.
    let mut workers = JoinSet::new();
    let mut senders = Vec::with_capacity(config.parse_concurrency);
    for worker_idx in 0..config.parse_concurrency {
        let (send, recv) = mpsc::channel::<ParseJob>(2);
        senders.push(send);
        workers.spawn(parse_worker(ctx.clone(), recv, worker_idx, cancel.clone()));
    }

    'standby: loop {
        if cancel.is_cancelled() {
            break;
        }

        let held = ctx
            .coordinator
            .try_lock(LOCK_KEY, &ctx.instance_id, lock_ttl_ms)
            .await
            .into_diagnostic()?;
        metrics::gauge!("scheduler_lock_held").set(if held { 1.0 } else { 0.0 });

        if !held {
            debug!("Scheduler lock is held elsewhere; standing by");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(config.lock_ttl_sec)) => continue 'standby,
                _ = cancel.cancelled() => break 'standby,
            }
        }

        info!("Acquired scheduler lock; this instance is active");

        'holding: loop {
            if let Err(err) = tick(&ctx, &senders).await {
                // A failed tick is retried next interval; the channels it
                // would have dispatched are still the most-stale ones.
                error!("Scheduler tick failed: {err}");
            }
            metrics::gauge!("scheduler_last_tick_ts").set(Utc::now().timestamp() as f64);

            // Wait out the interval while renewing the lock at TTL/3.
            let deadline = tokio::time::Instant::now() + tick_every;
            loop {
                let renew_sleep = renew_every.min(
                    deadline.saturating_duration_since(tokio::time::Instant::now()),
                );
                tokio::select! {
                    _ = tokio::time::sleep(renew_sleep) => {}
                    _ = cancel.cancelled() => break 'standby,
                }

                let renewed = ctx
                    .coordinator
                    .renew_lock(LOCK_KEY, &ctx.instance_id, lock_ttl_ms)
                    .await
                    .into_diagnostic()?;
                if !renewed {
                    warn!("Lost the scheduler lock; dropping back to standby");
                    metrics::gauge!("scheduler_lock_held").set(0.0);
                    break 'holding;
                }

                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    // Closing the senders drains the pool: workers finish their in-flight
    // job and exit on channel close.
    drop(senders);
    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            error!("Parse worker panicked: {err}");
        }
    }

    let _ = ctx.coordinator.unlock(LOCK_KEY, &ctx.instance_id).await;
    metrics::gauge!("scheduler_lock_held").set(0.0);
    info!("Scheduler exited");
    Ok(())
}

async fn tick(ctx: &AppContext, senders: &[mpsc::Sender<ParseJob>]) -> miette::Result<()> {
    let channels = {
        let mut conn = ctx.conn().into_diagnostic()?;
        db::due_channels(&mut conn, ctx.config.scheduler.batch_size).into_diagnostic()?
    };
    debug!("Scheduler tick: {} due channel(s)", channels.len());

    let jobs = plan_jobs(
        channels,
        Utc::now(),
        ctx.config.parser.lpa_max_age_hours,
        ctx.config.parser.historical_hours,
        ctx.config.parser.incremental_minutes,
    );

    for job in jobs {
        metrics::counter!("parser_jobs_dispatched", "mode" => job.mode.as_str()).increment(1);
        let route = (job.channel.id.as_u128() % senders.len() as u128) as usize;
        if senders[route].send(job).await.is_err() {
            // Worker gone; the supervisor is about to restart us anyway.
            warn!("Parse worker {route} is gone; dropping job");
        }
    }
    Ok(())
}

async fn parse_worker(
    ctx: AppContext,
    mut recv: mpsc::Receiver<ParseJob>,
    worker_idx: usize,
    cancel: CancellationToken,
) {
    info!("Parse worker {worker_idx} launched");

    while let Some(job) = recv.recv().await {
        if cancel.is_cancelled() {
            break;
        }

        let max_retries = ctx.config.scheduler.job_max_retries;
        let mut attempt = 0;
        loop {
            match parser::parse_channel(&ctx, &job.channel, job.mode, job.since).await {
                Ok(outcome) => {
                    metrics::counter!(
                        "parser_jobs_completed_total",
                        "status" => format!("{:?}", outcome.status),
                    )
                    .increment(1);
                    break;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > max_retries {
                        // last_parsed_at was never advanced, so the next
                        // scheduler tick picks this channel right back up.
                        error!(
                            "Parse job for channel {} failed after {max_retries} retries: {err}",
                            job.channel.id
                        );
                        metrics::counter!("parser_jobs_failed_total").increment(1);
                        break;
                    }
                    let backoff_secs = 2u64.pow(attempt.min(6));
                    let jitter = rand::thread_rng().gen_range(0..1000);
                    warn!(
                        "Parse job for channel {} failed (attempt {attempt}/{max_retries}), \
                        retrying in {backoff_secs}s: {err}",
                        job.channel.id
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(
                            Duration::from_secs(backoff_secs) + Duration::from_millis(jitter),
                        ) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    info!("Parse worker {worker_idx} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn channel(last_parsed_at: Option<&str>) -> DbChannel {
        DbChannel {
            id: Uuid::new_v4(),
            tenant: "t".into(),
            tg_channel_id: Some(1),
            username: None,
            title: None,
            active: true,
            last_parsed_at: last_parsed_at.map(|s| s.parse().unwrap()),
            settings: serde_json::json!({}),
            created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn tick_plans_modes_per_channel_staleness() {
        let now = "2026-01-05T12:00:00Z".parse().unwrap();
        let jobs = plan_jobs(
            vec![
                channel(None),
                channel(Some("2026-01-05T11:50:00Z")),
                channel(Some("2026-01-02T12:00:00Z")),
            ],
            now,
            48,
            24,
            5,
        );

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].mode, ParseMode::Historical);
        assert_eq!(jobs[1].mode, ParseMode::Incremental);
        assert_eq!(jobs[2].mode, ParseMode::Historical);

        // Historical jobs start at now − historical window.
        assert_eq!(jobs[0].since, "2026-01-04T12:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap());
        // Incremental starts at last_parsed_at − overlap.
        assert_eq!(jobs[1].since, "2026-01-05T11:45:00Z".parse::<chrono::DateTime<Utc>>().unwrap());
    }
}
