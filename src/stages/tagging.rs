use crate::context::AppContext;
use crate::quota::{self, QuotaDecision};
use crate::stages::{Stage, StageError, StageResult};
use log::debug;
use serde_json::json;
use tgpulse_bus::{Envelope, PostParsed, PostTagged};
use tgpulse_db::db;
use tgpulse_db::statuses::EnrichmentStatus;

/// Tagging stage: first enrichment hop after persistence. Produces a flat
/// lowercase tag list, upserts it as enrichment, and advances the post's
/// status.
pub struct TaggingStage;

fn tagged_key(post_id: uuid::Uuid) -> String {
    format!("{post_id}:tagged:v1")
}

impl Stage for TaggingStage {
    type In = PostParsed;
    type Out = PostTagged;

    const NAME: &'static str = "tagging";
    const GROUP: &'static str = "tag_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostParsed>,
    ) -> Result<StageResult<PostTagged>, StageError> {
        let post_id = envelope.payload.post_id;

        let (post, channel) = {
            let mut conn = ctx.conn()?;
            db::get_post_with_channel(&mut conn, post_id)?
                .ok_or_else(|| StageError::NotFound(format!("post {post_id}")))?
        };

        // Provider budget. Exhausted budget still publishes an empty-tag
        // event so the rest of the pipeline keeps moving.
        if quota::take_provider_budget(ctx, &envelope.tenant, "tagging").await? == QuotaDecision::Exhausted {
            debug!("Tagging budget exhausted for tenant {}", envelope.tenant);
            metrics::counter!("enrichment_requests_total", "kind" => "tags", "outcome" => "skipped")
                .increment(1);
            return Ok(StageResult {
                downstream: Some((
                    tagged_key(post_id),
                    PostTagged {
                        post_id,
                        channel_id: channel.id,
                        tags: Vec::new(),
                        reason: Some("budget_exhausted".into()),
                    },
                )),
                outcome: "budget_exhausted",
            });
        }

        let tags = ctx.providers.tag(&post.content).await?;
        debug!("Post {post_id} tagged with {} tag(s)", tags.len());

        {
            let mut conn = ctx.conn()?;
            db::upsert_enrichment(
                &mut conn,
                post_id,
                "tags",
                &ctx.config.providers.tagging_model,
                Some(&json!({ "tags": tags })),
            )?;
            db::transition_enrichment_status(&mut conn, post_id, EnrichmentStatus::Tagged)?;
        }
        metrics::counter!("enrichment_requests_total", "kind" => "tags", "outcome" => "success")
            .increment(1);

        Ok(StageResult {
            downstream: Some((
                tagged_key(post_id),
                PostTagged {
                    post_id,
                    channel_id: channel.id,
                    tags,
                    reason: None,
                },
            )),
            outcome: "tagged",
        })
    }

    fn fallback(
        &self,
        envelope: &Envelope<PostParsed>,
        reason: &str,
    ) -> Option<(String, PostTagged)> {
        Some((
            tagged_key(envelope.payload.post_id),
            PostTagged {
                post_id: envelope.payload.post_id,
                channel_id: envelope.payload.channel_id,
                tags: Vec::new(),
                reason: Some(reason.to_string()),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn fallback_always_emits_downstream() {
        let envelope = Envelope::new(
            "t",
            "tr",
            "k",
            PostParsed {
                post_id: Uuid::new_v4(),
                channel_id: Uuid::new_v4(),
                tg_message_id: 1,
                posted_at: Utc::now(),
                content_hash: "h".into(),
                word_count: 3,
                grouped_id: None,
                has_media: false,
            },
        );

        for reason in ["not_found", "quota_exhausted", "conflict"] {
            let (key, payload) = TaggingStage
                .fallback(&envelope, reason)
                .expect("tagging must always emit downstream");
            assert_eq!(key, format!("{}:tagged:v1", envelope.payload.post_id));
            assert!(payload.tags.is_empty());
            assert_eq!(payload.reason.as_deref(), Some(reason));
        }
    }
}
