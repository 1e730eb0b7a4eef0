use crate::context::AppContext;
use crate::stages::{NoDownstream, Stage, StageError, StageResult};
use log::debug;
use serde_json::json;
use tgpulse_bus::{Envelope, PostParsed};
use tgpulse_db::db;
use tgpulse_db::statuses::{IndexStatus, PostSource};

/// Graph writer: a separate consumer of `posts.parsed` that maintains the
/// relationship graph. Every write is a parameterized MERGE, so replays
/// converge instead of duplicating.
pub struct GraphStage;

impl Stage for GraphStage {
    type In = PostParsed;
    type Out = NoDownstream;

    const NAME: &'static str = "graph";
    const GROUP: &'static str = "graph_writer";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostParsed>,
    ) -> Result<StageResult<NoDownstream>, StageError> {
        let post_id = envelope.payload.post_id;

        let post = {
            let mut conn = ctx.conn()?;
            db::get_post(&mut conn, post_id)?
                .ok_or_else(|| StageError::NotFound(format!("post {post_id}")))?
        };

        ctx.providers
            .graph_merge(
                "MERGE (p:Post {id: $post_id}) \
                 SET p.tenant = $tenant, p.posted_at = $posted_at, p.source = $source \
                 MERGE (c:Channel {id: $channel_id}) \
                 MERGE (p)-[:POSTED_IN]->(c)",
                json!({
                    "post_id": post_id,
                    "tenant": envelope.tenant,
                    "posted_at": post.posted_at,
                    "source": post.source,
                    "channel_id": post.channel_id,
                }),
            )
            .await?;

        if let Some(author) = &post.author {
            ctx.providers
                .graph_merge(
                    "MERGE (a:Author {name: $author}) \
                     MERGE (p:Post {id: $post_id}) \
                     MERGE (a)-[:AUTHOR_OF]->(p)",
                    json!({ "author": author, "post_id": post_id }),
                )
                .await?;
        }

        if let (Some(from_channel), Some(from_message)) =
            (post.forward_from_channel_id, post.forward_from_message_id)
        {
            ctx.providers
                .graph_merge(
                    "MERGE (s:ForwardSource {channel_id: $from_channel, message_id: $from_message}) \
                     MERGE (p:Post {id: $post_id}) \
                     MERGE (p)-[:FORWARDED_FROM]->(s)",
                    json!({
                        "from_channel": from_channel,
                        "from_message": from_message,
                        "post_id": post_id,
                    }),
                )
                .await?;
        }

        if let Some(reply_to) = post.reply_to_message_id {
            ctx.providers
                .graph_merge(
                    "MERGE (p:Post {id: $post_id}) \
                     MERGE (t:Post {channel_id: $channel_id, tg_message_id: $reply_to}) \
                     MERGE (p)-[:REPLIES_TO]->(t)",
                    json!({
                        "post_id": post_id,
                        "channel_id": post.channel_id,
                        "reply_to": reply_to,
                    }),
                )
                .await?;
        }

        // Persona DMs additionally live in a dialogue container.
        if post.source.parse() == Ok(PostSource::Persona) {
            ctx.providers
                .graph_merge(
                    "MERGE (per:Persona {channel_id: $channel_id}) \
                     MERGE (d:Dialogue {channel_id: $channel_id}) \
                     MERGE (p:Post {id: $post_id}) \
                     MERGE (per)-[:PARTICIPATES_IN]->(d) \
                     MERGE (p)-[:PART_OF]->(d)",
                    json!({ "channel_id": post.channel_id, "post_id": post_id }),
                )
                .await?;
        }

        {
            let mut conn = ctx.conn()?;
            db::set_graph_status(&mut conn, post_id, IndexStatus::Completed, None)?;
        }
        debug!("Graph writes for post {post_id} merged");

        Ok(StageResult {
            downstream: None,
            outcome: "merged",
        })
    }

    fn fallback(
        &self,
        _envelope: &Envelope<PostParsed>,
        _reason: &str,
    ) -> Option<(String, NoDownstream)> {
        // The graph writer is a side chain; the main pipeline's events flow
        // through the tagging path.
        None
    }
}
