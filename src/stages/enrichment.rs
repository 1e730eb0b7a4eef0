use crate::context::AppContext;
use crate::quota::{self, QuotaDecision, crawl_policy_reason};
use crate::stages::{Stage, StageError, StageResult};
use log::debug;
use tgpulse_bus::{Envelope, PostEnriched, PostTagged};
use tgpulse_cas::crawl_key;
use tgpulse_db::db;
use tgpulse_db::statuses::EnrichmentStatus;

/// Web-crawl enrichment. Most posts don't qualify; they still flow through
/// with a reason so downstream indexing always fires.
pub struct EnrichmentStage;

fn enriched_key(post_id: uuid::Uuid) -> String {
    format!("{post_id}:enriched:v1")
}

fn skip(post_id: uuid::Uuid, channel_id: uuid::Uuid, reason: &str) -> StageResult<PostEnriched> {
    metrics::counter!(
        "enrichment_requests_total",
        "kind" => "crawl",
        "outcome" => reason.to_string(),
    )
    .increment(1);
    StageResult {
        downstream: Some((
            enriched_key(post_id),
            PostEnriched {
                post_id,
                channel_id,
                kind: "none".into(),
                reason: Some(reason.to_string()),
            },
        )),
        outcome: "skipped",
    }
}

fn extract_urls(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .map(|w| w.trim_start_matches('(').trim_end_matches([')', ',', '.', ';']))
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(str::to_string)
        .collect()
}

impl Stage for EnrichmentStage {
    type In = PostTagged;
    type Out = PostEnriched;

    const NAME: &'static str = "enrichment";
    const GROUP: &'static str = "enrich_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostTagged>,
    ) -> Result<StageResult<PostEnriched>, StageError> {
        let post_id = envelope.payload.post_id;
        let channel_id = envelope.payload.channel_id;

        let post = {
            let mut conn = ctx.conn()?;
            db::get_post(&mut conn, post_id)?
                .ok_or_else(|| StageError::NotFound(format!("post {post_id}")))?
        };

        // Trigger policy first; it's free.
        if let Some(reason) = crawl_policy_reason(
            &envelope.payload.tags,
            post.word_count as usize,
            &ctx.config.enrichment.trigger_tags,
            ctx.config.enrichment.min_word_count,
        ) {
            debug!("Post {post_id} does not qualify for crawl: {reason}");
            let result = skip(post_id, channel_id, reason);
            finish_status(ctx, post_id)?;
            return Ok(result);
        }

        if quota::take_provider_budget(ctx, &envelope.tenant, "crawl").await? == QuotaDecision::Exhausted {
            let result = skip(post_id, channel_id, "budget_exhausted");
            finish_status(ctx, post_id)?;
            return Ok(result);
        }

        let urls = extract_urls(&post.content);
        if urls.is_empty() {
            let result = skip(post_id, channel_id, "no_urls");
            finish_status(ctx, post_id)?;
            return Ok(result);
        }

        let crawled = ctx.providers.crawl(&urls).await?;
        let serialized = serde_json::to_string(&crawled)
            .map_err(|e| StageError::SchemaInvalid(format!("crawl result unserializable: {e}")))?;

        // Artifact to CAS, row to the DB, usage by exact bytes written.
        let key = crawl_key(&envelope.tenant, &post.content_hash);
        let put = ctx.cas.put_json_gz(&key, &serialized).await?;
        {
            let mut conn = ctx.conn()?;
            db::upsert_enrichment(&mut conn, post_id, "crawl", "crawler", Some(&crawled))?;
            db::add_storage_usage(
                &mut conn,
                &envelope.tenant,
                "crawl",
                put.bytes_written as i64,
                1,
            )?;
            db::transition_enrichment_status(&mut conn, post_id, EnrichmentStatus::Enriched)?;
        }
        metrics::counter!("enrichment_requests_total", "kind" => "crawl", "outcome" => "success")
            .increment(1);

        Ok(StageResult {
            downstream: Some((
                enriched_key(post_id),
                PostEnriched {
                    post_id,
                    channel_id,
                    kind: "enrichment".into(),
                    reason: None,
                },
            )),
            outcome: "enriched",
        })
    }

    fn fallback(
        &self,
        envelope: &Envelope<PostTagged>,
        reason: &str,
    ) -> Option<(String, PostEnriched)> {
        Some((
            enriched_key(envelope.payload.post_id),
            PostEnriched {
                post_id: envelope.payload.post_id,
                channel_id: envelope.payload.channel_id,
                kind: "none".into(),
                reason: Some(reason.to_string()),
            },
        ))
    }
}

/// Posts that skip the crawl still advance to `enriched`; the status tracks
/// pipeline position, not whether a crawl happened.
fn finish_status(ctx: &AppContext, post_id: uuid::Uuid) -> Result<(), StageError> {
    let mut conn = ctx.conn()?;
    db::transition_enrichment_status(&mut conn, post_id, EnrichmentStatus::Enriched)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn url_extraction_strips_surrounding_punctuation() {
        let urls = extract_urls("see https://example.com/a, and (http://b.io/x).");
        assert_eq!(urls, vec!["https://example.com/a", "http://b.io/x"]);
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn skip_result_always_carries_downstream_event() {
        let result = skip(Uuid::new_v4(), Uuid::new_v4(), "below_min_words");
        let (_, payload) = result.downstream.expect("skip must still publish");
        assert_eq!(payload.kind, "none");
        assert_eq!(payload.reason.as_deref(), Some("below_min_words"));
    }

    #[test]
    fn fallback_always_emits_downstream() {
        let envelope = Envelope::new(
            "t",
            "tr",
            "k",
            PostTagged {
                post_id: Uuid::new_v4(),
                channel_id: Uuid::new_v4(),
                tags: vec!["a".into()],
                reason: None,
            },
        );
        let (_, payload) = EnrichmentStage
            .fallback(&envelope, "not_found")
            .expect("enrichment must always emit downstream");
        assert_eq!(payload.reason.as_deref(), Some("not_found"));
    }
}
