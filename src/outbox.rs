use crate::context::AppContext;
use log::{debug, error, info, warn};
use miette::IntoDiagnostic;
use serde::Deserialize;
use std::time::Duration;
use tgpulse_bus::{dlq_key, stream_key};
use tgpulse_db::db;
use tokio_util::sync::CancellationToken;

const RELAY_BATCH: i64 = 100;
const RELAY_IDLE: Duration = Duration::from_millis(500);
const RELAY_MAX_RETRIES: i32 = 5;

/// The envelope fields the relay needs to route a payload; the rest passes
/// through opaque.
#[derive(Deserialize)]
struct EnvelopeHead {
    tenant: String,
}

/// The outbox relay: drains rows the parser wrote transactionally and turns
/// them into stream publishes. Publishing is at-least-once; consumers dedup
/// on idempotency keys.
pub async fn run_outbox_relay(ctx: AppContext, cancel: CancellationToken) -> miette::Result<()> {
    info!("Outbox relay started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let rows = {
            let mut conn = ctx.conn().into_diagnostic()?;
            db::claim_outbox_batch(&mut conn, RELAY_BATCH).into_diagnostic()?
        };

        if rows.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(RELAY_IDLE) => continue,
                _ = cancel.cancelled() => break,
            }
        }

        let mut published = Vec::new();
        for row in &rows {
            let head: EnvelopeHead = match serde_json::from_value(row.payload.clone()) {
                Ok(head) => head,
                Err(err) => {
                    // A payload we can't route is poison; park it in the
                    // default tenant's DLQ rather than retrying forever.
                    error!("Outbox row {} has an unroutable payload: {err}", row.id);
                    let body = row.payload.to_string();
                    let key = dlq_key(&row.event_type, "unroutable");
                    if ctx.bus.publish(&key, &body).await.is_ok() {
                        published.push(row.id);
                    }
                    continue;
                }
            };

            let body = row.payload.to_string();

            if row.retries >= RELAY_MAX_RETRIES {
                warn!(
                    "Outbox row {} exhausted its retries; moving to DLQ",
                    row.id
                );
                let key = dlq_key(&row.event_type, &head.tenant);
                if ctx.bus.publish(&key, &body).await.is_ok() {
                    published.push(row.id);
                    metrics::counter!("outbox_dlq_total", "event_type" => row.event_type.clone())
                        .increment(1);
                }
                continue;
            }

            let key = stream_key(&row.event_type, &head.tenant);
            match ctx.bus.publish(&key, &body).await {
                Ok(stream_id) => {
                    debug!("Relayed outbox row {} to {key} as {stream_id}", row.id);
                    published.push(row.id);
                }
                Err(err) => {
                    warn!("Failed to relay outbox row {}: {err}", row.id);
                    let mut conn = ctx.conn().into_diagnostic()?;
                    db::record_outbox_failure(&mut conn, row.id, &err.to_string())
                        .into_diagnostic()?;
                }
            }
        }

        if !published.is_empty() {
            let mut conn = ctx.conn().into_diagnostic()?;
            db::mark_outbox_processed(&mut conn, &published).into_diagnostic()?;
            metrics::counter!("outbox_relayed_total").increment(published.len() as u64);
        }
    }

    info!("Outbox relay exited");
    Ok(())
}
