use crate::context::AppContext;
use chrono::Utc;
use log::{info, warn};
use miette::IntoDiagnostic;
use std::time::Duration;
use tgpulse_bus::{EventPayload, stream_key};
use tgpulse_bus::{PostEnriched, PostIndexed, PostParsed, PostTagged, PostVision};
use tgpulse_db::db;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const EXPIRY_DELETE_BATCH: i64 = 1000;
/// Streams keep a day of history; anything a consumer hasn't handled within
/// that window is already in the DLQ. DLQ streams themselves are never
/// trimmed.
const STREAM_RETENTION_HOURS: i64 = 24;

const TRIMMED_STREAMS: &[&str] = &[
    PostParsed::SCHEMA_NAME,
    PostTagged::SCHEMA_NAME,
    PostEnriched::SCHEMA_NAME,
    PostIndexed::SCHEMA_NAME,
    PostVision::SCHEMA_NAME,
];

/// Housekeeping: post expiry, stream trimming, and the storage-usage
/// reconciliation that keeps the counters honest against the CAS.
pub async fn run_maintenance(ctx: AppContext, cancel: CancellationToken) -> miette::Result<()> {
    info!("Maintenance task started");

    loop {
        sweep_expired_posts(&ctx).await?;
        trim_streams(&ctx).await;
        reconcile_storage(&ctx).await?;

        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("Maintenance task exited");
    Ok(())
}

async fn sweep_expired_posts(ctx: &AppContext) -> miette::Result<()> {
    let now = Utc::now();
    let mut total = 0usize;
    loop {
        let deleted = {
            let mut conn = ctx.conn().into_diagnostic()?;
            db::delete_expired_posts(&mut conn, now, EXPIRY_DELETE_BATCH).into_diagnostic()?
        };
        total += deleted;
        if deleted < EXPIRY_DELETE_BATCH as usize {
            break;
        }
    }
    if total > 0 {
        info!("Expired {total} post(s) past retention");
        metrics::counter!("posts_expired_total").increment(total as u64);
    }
    Ok(())
}

async fn trim_streams(ctx: &AppContext) {
    // Stream entry ids are millisecond timestamps, so MINID by age is just
    // arithmetic.
    let cutoff = Utc::now() - chrono::Duration::hours(STREAM_RETENTION_HOURS);
    let min_id = format!("{}-0", cutoff.timestamp_millis());

    for tenant in &ctx.config.tenants {
        for stream in TRIMMED_STREAMS {
            let key = stream_key(stream, tenant);
            match ctx.bus.trim_before(&key, &min_id).await {
                Ok(trimmed) if trimmed > 0 => {
                    info!("Trimmed {trimmed} entries from {key}");
                }
                Ok(_) => {}
                Err(err) => warn!("Couldn't trim {key}: {err}"),
            }
        }
    }
}

async fn reconcile_storage(ctx: &AppContext) -> miette::Result<()> {
    for tenant in &ctx.config.tenants {
        for content_type in ["media", "vision", "crawl"] {
            let prefix = format!("{content_type}/{tenant}/");
            let (bytes, objects) = match ctx.cas.usage_under_prefix(&prefix).await {
                Ok(usage) => usage,
                Err(err) => {
                    warn!("Couldn't list {prefix} for reconciliation: {err}");
                    continue;
                }
            };

            let mut conn = ctx.conn().into_diagnostic()?;
            let previous = db::get_storage_usage(&mut conn, tenant, content_type)
                .into_diagnostic()?
                .map(|u| u.bytes)
                .unwrap_or(0);
            if previous != bytes as i64 {
                info!(
                    "Reconciling {tenant}/{content_type} storage: counter {previous}, actual {bytes}"
                );
            }
            db::set_storage_usage(&mut conn, tenant, content_type, bytes as i64, objects as i64)
                .into_diagnostic()?;
        }
    }
    Ok(())
}
