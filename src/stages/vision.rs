use crate::context::AppContext;
use crate::quota::{self, QuotaDecision};
use crate::stages::{NoDownstream, Stage, StageError, StageResult};
use log::{debug, info};
use serde_json::json;
use tgpulse_bus::{Envelope, PostVision};
use tgpulse_cas::vision_key;
use tgpulse_db::db;

/// Vision/OCR analysis of one stored blob, aggregated per post. A post with
/// a three-media album ends up with a single enrichment row whose data
/// carries all three entries.
pub struct VisionStage;

/// An empty allowlist allows everyone; entries match username, channel
/// uuid, or numeric source id.
fn allowlisted(allowlist: &[String], channel: &tgpulse_db::models::DbChannel) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| {
        channel.username.as_deref() == Some(entry.as_str())
            || channel.id.to_string() == *entry
            || channel
                .tg_channel_id
                .map(|id| id.to_string() == *entry)
                .unwrap_or(false)
    })
}

fn trigger_tags_satisfied(trigger: &[String], tags: &[String]) -> bool {
    trigger.is_empty() || tags.iter().any(|t| trigger.contains(t))
}

impl Stage for VisionStage {
    type In = PostVision;
    type Out = NoDownstream;

    const NAME: &'static str = "vision";
    const GROUP: &'static str = "vision_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostVision>,
    ) -> Result<StageResult<NoDownstream>, StageError> {
        let payload = &envelope.payload;
        let post_id = payload.post_id;
        let tenant = &envelope.tenant;

        let (post, channel) = {
            let mut conn = ctx.conn()?;
            db::get_post_with_channel(&mut conn, post_id)?
                .ok_or_else(|| StageError::NotFound(format!("post {post_id}")))?
        };

        // Policy gates, cheapest first.
        if !allowlisted(&ctx.config.vision.channel_allowlist, &channel) {
            debug!("Channel {} not allowlisted for vision; skipping", channel.id);
            return Ok(StageResult {
                downstream: None,
                outcome: "not_allowlisted",
            });
        }

        if !ctx.config.vision.trigger_tags.is_empty() {
            let tags: Vec<String> = {
                let mut conn = ctx.conn()?;
                db::get_enrichment(&mut conn, post_id, "tags")?
                    .and_then(|row| {
                        row.data
                            .get("tags")
                            .and_then(|t| serde_json::from_value(t.clone()).ok())
                    })
                    .unwrap_or_default()
            };
            if !trigger_tags_satisfied(&ctx.config.vision.trigger_tags, &tags) {
                debug!("Post {post_id} tags don't trigger vision; skipping");
                return Ok(StageResult {
                    downstream: None,
                    outcome: "no_trigger_tags",
                });
            }
        }

        if quota::check_quota_before_upload(ctx, tenant, 0)? == QuotaDecision::Exhausted {
            return Err(StageError::QuotaExhausted(format!("tenant {tenant}")));
        }

        // The blob must exist before we bother the provider.
        if ctx.cas.head(&payload.s3_key).await?.is_none() {
            return Err(StageError::NotFound(format!("blob {}", payload.s3_key)));
        }
        let image = ctx.cas.get(&payload.s3_key).await?;

        ctx.providers.vision_breaker.check()?;
        let analysis = match ctx.providers.analyze_image(&image, &payload.mime).await {
            Ok(result) => result,
            Err(err) if err.is_transient() && ctx.config.vision.ocr_fallback_enabled => {
                info!("Vision provider unavailable for {post_id}; falling back to OCR: {err}");
                ctx.providers.ocr_image(&image, &payload.mime).await?
            }
            Err(err) => return Err(err.into()),
        };

        // Aggregate across the post's media: one enrichment row per post,
        // with parallel entries per blob.
        let media = {
            let mut conn = ctx.conn()?;
            db::post_media_objects(&mut conn, post_id)?
        };
        let existing = {
            let mut conn = ctx.conn()?;
            db::get_enrichment(&mut conn, post_id, "vision")?
        };
        let mut results = existing
            .as_ref()
            .and_then(|row| row.data.get("results").cloned())
            .and_then(|v| {
                if let serde_json::Value::Object(map) = v {
                    Some(map)
                } else {
                    None
                }
            })
            .unwrap_or_default();
        results.insert(
            payload.sha256.clone(),
            serde_json::to_value(&analysis)
                .map_err(|e| StageError::SchemaInvalid(format!("vision result: {e}")))?,
        );

        let s3_keys_list: Vec<serde_json::Value> = media
            .iter()
            .map(|m| json!({ "sha256": m.sha256, "s3_key": m.s3_key }))
            .collect();

        let data = json!({
            "provider": analysis.provider,
            "model": analysis.model,
            "s3_keys_list": s3_keys_list,
            "results": results,
        });

        // Artifact first, then the row, then the accounting, all by exact
        // bytes written.
        let artifact_key = vision_key(
            tenant,
            &payload.sha256,
            &analysis.provider,
            &analysis.model,
            ctx.config.vision.schema_version,
        );
        let serialized = serde_json::to_string(&data)
            .map_err(|e| StageError::SchemaInvalid(format!("vision artifact: {e}")))?;
        let put = ctx.cas.put_json_gz(&artifact_key, &serialized).await?;

        {
            let mut conn = ctx.conn()?;
            db::upsert_enrichment(&mut conn, post_id, "vision", &analysis.provider, Some(&data))?;
            db::add_storage_usage(&mut conn, tenant, "vision", put.bytes_written as i64, 1)?;
        }
        metrics::counter!("enrichment_requests_total", "kind" => "vision", "outcome" => "success")
            .increment(1);

        Ok(StageResult {
            downstream: None,
            outcome: "analyzed",
        })
    }

    fn fallback(
        &self,
        _envelope: &Envelope<PostVision>,
        _reason: &str,
    ) -> Option<(String, NoDownstream)> {
        // Vision terminates its branch; skips surface as missing vision
        // fields, never as user-visible errors.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn channel(username: Option<&str>, tg_id: Option<i64>) -> tgpulse_db::models::DbChannel {
        tgpulse_db::models::DbChannel {
            id: Uuid::new_v4(),
            tenant: "t".into(),
            tg_channel_id: tg_id,
            username: username.map(str::to_string),
            title: None,
            active: true,
            last_parsed_at: None,
            settings: serde_json::json!({}),
            created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_allowlist_allows_everyone() {
        assert!(allowlisted(&[], &channel(Some("news"), Some(5))));
    }

    #[test]
    fn allowlist_matches_username_or_numeric_id() {
        let allow = list(&["news", "42"]);
        assert!(allowlisted(&allow, &channel(Some("news"), None)));
        assert!(allowlisted(&allow, &channel(None, Some(42))));
        assert!(!allowlisted(&allow, &channel(Some("other"), Some(5))));
    }

    #[test]
    fn trigger_tags_empty_always_fires() {
        assert!(trigger_tags_satisfied(&[], &list(&["anything"])));
        assert!(trigger_tags_satisfied(&list(&["a"]), &list(&["a", "b"])));
        assert!(!trigger_tags_satisfied(&list(&["a"]), &list(&["b"])));
    }
}
