use crate::context::AppContext;
use crate::stages::{Stage, StageError, StageResult};
use log::debug;
use serde_json::json;
use tgpulse_bus::{Envelope, PostEnriched, PostIndexed};
use tgpulse_db::db;
use tgpulse_db::statuses::{EnrichmentStatus, IndexStatus};

/// Vector indexing. Embeds the post and upserts it into the vector store;
/// the graph half of indexing runs in its own consumer (see graph.rs).
pub struct IndexingStage;

fn indexed_key(post_id: uuid::Uuid) -> String {
    format!("{post_id}:indexed:v1")
}

impl Stage for IndexingStage {
    type In = PostEnriched;
    type Out = PostIndexed;

    const NAME: &'static str = "indexing";
    const GROUP: &'static str = "indexing_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostEnriched>,
    ) -> Result<StageResult<PostIndexed>, StageError> {
        let post_id = envelope.payload.post_id;
        let channel_id = envelope.payload.channel_id;

        let post = {
            let mut conn = ctx.conn()?;
            db::get_post(&mut conn, post_id)?
        };

        // A deleted post is a skip, not a failure: mark it processed and
        // keep the chain moving.
        let Some(post) = post else {
            debug!("Post {post_id} vanished before indexing; skipping");
            metrics::counter!("indexing_processed_total", "status" => "skipped").increment(1);
            let mut conn = ctx.conn()?;
            db::set_embedding_status(&mut conn, post_id, IndexStatus::Skipped, None)?;
            return Ok(StageResult {
                downstream: Some((
                    indexed_key(post_id),
                    PostIndexed {
                        post_id,
                        channel_id,
                        status: "skipped".into(),
                        reason: Some("post_not_found".into()),
                    },
                )),
                outcome: "skipped",
            });
        };

        // The embedding provider gets a cheap cached health probe before we
        // commit to the call; an unhealthy provider turns into the normal
        // transient-retry path.
        {
            let mut conn = ctx.conn()?;
            db::set_embedding_status(&mut conn, post_id, IndexStatus::Processing, None)?;
        }

        let embedding = match ctx.providers.embed(&post.content).await {
            Ok(embedding) => embedding,
            Err(err) => {
                let mut conn = ctx.conn()?;
                db::set_embedding_status(
                    &mut conn,
                    post_id,
                    IndexStatus::Failed,
                    Some(&err.to_string()),
                )?;
                return Err(err.into());
            }
        };

        ctx.providers
            .index_vector(
                post_id,
                &embedding,
                json!({
                    "tenant": envelope.tenant,
                    "channel_id": channel_id,
                    "posted_at": post.posted_at,
                    "content_hash": post.content_hash,
                }),
            )
            .await?;

        {
            let mut conn = ctx.conn()?;
            db::set_embedding_status(&mut conn, post_id, IndexStatus::Completed, None)?;
            db::transition_enrichment_status(&mut conn, post_id, EnrichmentStatus::Indexed)?;
        }
        metrics::counter!("indexing_processed_total", "status" => "completed").increment(1);

        Ok(StageResult {
            downstream: Some((
                indexed_key(post_id),
                PostIndexed {
                    post_id,
                    channel_id,
                    status: "completed".into(),
                    reason: None,
                },
            )),
            outcome: "completed",
        })
    }

    fn fallback(
        &self,
        envelope: &Envelope<PostEnriched>,
        reason: &str,
    ) -> Option<(String, PostIndexed)> {
        metrics::counter!("indexing_processed_total", "status" => "skipped").increment(1);
        Some((
            indexed_key(envelope.payload.post_id),
            PostIndexed {
                post_id: envelope.payload.post_id,
                channel_id: envelope.payload.channel_id,
                status: "skipped".into(),
                reason: Some(reason.to_string()),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fallback_always_emits_downstream() {
        let envelope = Envelope::new(
            "t",
            "tr",
            "k",
            PostEnriched {
                post_id: Uuid::new_v4(),
                channel_id: Uuid::new_v4(),
                kind: "none".into(),
                reason: None,
            },
        );
        let (key, payload) = IndexingStage
            .fallback(&envelope, "quota_exhausted")
            .expect("indexing must always emit downstream");
        assert_eq!(key, format!("{}:indexed:v1", envelope.payload.post_id));
        assert_eq!(payload.status, "skipped");
    }
}
