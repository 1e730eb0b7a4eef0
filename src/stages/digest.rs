use crate::context::AppContext;
use crate::stages::{NoDownstream, Stage, StageError, StageResult};
use chrono::{TimeZone, Utc};
use log::{info, warn};
use serde_json::json;
use tgpulse_bus::{DigestGenerate, Envelope};
use tgpulse_db::db;
use tgpulse_db::models::NewDigestHistory;
use tgpulse_db::statuses::DigestStatus;

/// Digest generation requests, deduplicated per `(user, digest_date)` and
/// serialized per user through a coordinator lock so a double-click can't
/// race itself.
pub struct DigestStage;

const DIGEST_LOCK_TTL_MS: u64 = 30_000;

impl Stage for DigestStage {
    type In = DigestGenerate;
    type Out = NoDownstream;

    const NAME: &'static str = "digest";
    const GROUP: &'static str = "digest_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<DigestGenerate>,
    ) -> Result<StageResult<NoDownstream>, StageError> {
        let payload = &envelope.payload;
        let user_id = payload.user_id;
        let lock_key = format!("digest:lock:{user_id}");

        // The lock is the double-click guard: whoever loses it returns
        // early and the winner's history row is the only one.
        let locked = ctx
            .coordinator
            .try_lock(&lock_key, &ctx.instance_id, DIGEST_LOCK_TTL_MS)
            .await?;
        if !locked {
            info!("Digest for {user_id} already in flight; returning early");
            return Ok(StageResult {
                downstream: None,
                outcome: "locked",
            });
        }

        let result = self.generate(ctx, envelope).await;

        // Release even on error; the TTL would clean up after a crash.
        let _ = ctx.coordinator.unlock(&lock_key, &ctx.instance_id).await;
        result
    }

    fn fallback(
        &self,
        _envelope: &Envelope<DigestGenerate>,
        _reason: &str,
    ) -> Option<(String, NoDownstream)> {
        // Digest failures surface as a terminal history row, not as an
        // event.
        None
    }
}

impl DigestStage {
    async fn generate(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<DigestGenerate>,
    ) -> Result<StageResult<NoDownstream>, StageError> {
        let payload = &envelope.payload;
        let tenant = &envelope.tenant;

        let history_id = {
            let mut conn = ctx.conn()?;
            db::try_insert_digest_history(
                &mut conn,
                &NewDigestHistory {
                    tenant,
                    user_id: payload.user_id,
                    digest_date: payload.digest_date,
                    status: DigestStatus::Pending.into(),
                },
            )?
        };
        let Some(history_id) = history_id else {
            info!(
                "Digest for user {} on {} already exists; deduplicated",
                payload.user_id, payload.digest_date
            );
            return Ok(StageResult {
                downstream: None,
                outcome: "duplicate",
            });
        };

        {
            let mut conn = ctx.conn()?;
            db::update_digest_status(&mut conn, history_id, DigestStatus::Processing, None, None)?;
        }

        let from = Utc
            .from_utc_datetime(&payload.digest_date.and_hms_opt(0, 0, 0).expect("midnight is always valid"));
        let to = from + chrono::Duration::days(1);
        let posts = {
            let mut conn = ctx.conn()?;
            db::posts_in_window(&mut conn, tenant, from, to)?
        };

        let summaries: Vec<serde_json::Value> = posts
            .iter()
            .map(|p| {
                json!({
                    "post_id": p.id,
                    "channel_id": p.channel_id,
                    "posted_at": p.posted_at,
                    "content": p.content,
                })
            })
            .collect();

        // One attempt only: a failed digest is a terminal history row, and
        // the user sees a single failure message rather than retry spam.
        match ctx.providers.generate_digest(payload.user_id, &summaries).await {
            Ok(digest_ref) => {
                let mut conn = ctx.conn()?;
                db::update_digest_status(
                    &mut conn,
                    history_id,
                    DigestStatus::Sent,
                    Some(&digest_ref),
                    Some(Utc::now()),
                )?;
                metrics::counter!("digests_generated_total", "outcome" => "sent").increment(1);
                Ok(StageResult {
                    downstream: None,
                    outcome: "sent",
                })
            }
            Err(err) => {
                warn!("Digest generation for {} failed: {err}", payload.user_id);
                let mut conn = ctx.conn()?;
                db::update_digest_status(
                    &mut conn,
                    history_id,
                    DigestStatus::Failed,
                    Some(&err.to_string()),
                    None,
                )?;
                metrics::counter!("digests_generated_total", "outcome" => "failed").increment(1);
                Ok(StageResult {
                    downstream: None,
                    outcome: "failed",
                })
            }
        }
    }
}
