use crate::context::AppContext;
use crate::parser::adaptive;
use crate::stages::{Stage, StageError, StageResult};
use chrono::Utc;
use log::{debug, info};
use tgpulse_bus::{Envelope, PostIndexed, TrendEmerging};
use tgpulse_db::db;
use tgpulse_db::models::{DbTrendCluster, NewTrendCluster};
use tgpulse_db::statuses::ClusterStatus;
use uuid::Uuid;

/// Trend detection over the indexed stream: resolve each post to a cluster
/// by embedding similarity, maintain rolling stats, and emit
/// `trends.emerging` only when every threshold clears.
pub struct TrendStage;

/// How much of the old coherence estimate survives each observation.
const COHERENCE_DECAY: f64 = 0.9;
/// Cap on the tracked source set; diversity beyond this is "diverse enough".
const MAX_TRACKED_SOURCES: usize = 64;

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Copy)]
pub struct EmissionCheck {
    pub freq_short: i64,
    pub baseline: f64,
    pub source_diversity: usize,
    pub coherence: f64,
    pub in_cooldown: bool,
    pub is_generic: bool,
}

/// Returns the first blocking reason, or None when the cluster qualifies as
/// an emerging trend. Reason labels feed the skip-reason metric.
pub fn emission_block_reason(
    check: EmissionCheck,
    freq_ratio_threshold: f64,
    min_source_diversity: usize,
    coherence_threshold: f64,
) -> Option<&'static str> {
    if check.is_generic {
        return Some("generic");
    }
    if check.in_cooldown {
        return Some("cooldown");
    }
    let ratio = check.freq_short as f64 / check.baseline.max(f64::EPSILON);
    if ratio < freq_ratio_threshold {
        return Some("ratio_low");
    }
    if check.source_diversity < min_source_diversity {
        return Some("source_diversity_too_low");
    }
    if check.coherence < coherence_threshold {
        return Some("coherence_low");
    }
    None
}

fn best_cluster<'a>(
    clusters: &'a [DbTrendCluster],
    embedding: &[f64],
) -> Option<(&'a DbTrendCluster, f64)> {
    clusters
        .iter()
        .map(|c| (c, cosine_similarity(&c.centroid, embedding)))
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("similarities are never NaN"))
}

/// Decides whether a near-miss against `closest` should seed a subtopic
/// under it. The hierarchy is capped at two levels, so a near-miss against
/// a subtopic attaches to that subtopic's parent instead of nesting
/// further; the parent check keeps a malformed level-2 row without a
/// parent from ever becoming one.
pub fn subtopic_parent(
    closest: &DbTrendCluster,
    similarity: f64,
    subtopic_threshold: f64,
    assign_threshold: f64,
) -> Option<Uuid> {
    if similarity < subtopic_threshold || similarity >= assign_threshold {
        return None;
    }
    if closest.level >= 2 {
        closest.parent_id
    } else {
        Some(closest.id)
    }
}

impl Stage for TrendStage {
    type In = PostIndexed;
    type Out = TrendEmerging;

    const NAME: &'static str = "trends";
    const GROUP: &'static str = "trend_workers";

    async fn handle(
        &self,
        ctx: &AppContext,
        envelope: &Envelope<PostIndexed>,
    ) -> Result<StageResult<TrendEmerging>, StageError> {
        let payload = &envelope.payload;
        let tenant = &envelope.tenant;

        if payload.status != "completed" {
            // A skipped indexing pass has no vector to cluster on.
            return Ok(StageResult {
                downstream: None,
                outcome: "unindexed",
            });
        }

        let post = {
            let mut conn = ctx.conn()?;
            db::get_post(&mut conn, payload.post_id)?
                .ok_or_else(|| StageError::NotFound(format!("post {}", payload.post_id)))?
        };

        // Album members all carry the same content burst; count the album
        // once.
        if let Some(grouped_id) = post.grouped_id {
            let first = ctx
                .coordinator
                .claim_once(
                    &format!("trend_album:{tenant}:{}:{grouped_id}", post.channel_id),
                    86_400,
                )
                .await?;
            if !first {
                debug!("Album {grouped_id} already counted for trends");
                return Ok(StageResult {
                    downstream: None,
                    outcome: "album_duplicate",
                });
            }
        }

        let embedding = ctx.providers.embed(&post.content).await?;

        let clusters = {
            let mut conn = ctx.conn()?;
            db::active_clusters(&mut conn, tenant)?
        };

        let now = Utc::now();
        let best = best_cluster(&clusters, &embedding);
        let assigned = match best {
            Some((cluster, similarity))
                if similarity >= ctx.config.trend.similarity_threshold =>
            {
                // Rolling stats: bump the short window, fold the similarity
                // into coherence, remember the source channel.
                let mut sources = cluster.source_channels.clone();
                if !sources.contains(&post.channel_id) && sources.len() < MAX_TRACKED_SOURCES {
                    sources.push(post.channel_id);
                }
                let coherence =
                    COHERENCE_DECAY * cluster.coherence + (1.0 - COHERENCE_DECAY) * similarity;
                let freq_short = cluster.freq_short + 1;
                let baseline = cluster.baseline
                    + ctx.config.trend.baseline_alpha * (1.0 - cluster.baseline);

                {
                    let mut conn = ctx.conn()?;
                    db::update_cluster_stats(
                        &mut conn,
                        cluster.id,
                        freq_short,
                        baseline,
                        coherence,
                        &sources,
                        now,
                    )?;
                }

                (
                    EmissionCheck {
                        freq_short,
                        baseline,
                        source_diversity: sources.len(),
                        coherence,
                        in_cooldown: cluster.cooldown_until.map(|u| u > now).unwrap_or(false),
                        is_generic: cluster.is_generic,
                    },
                    cluster.id,
                    cluster.label.clone(),
                )
            }
            other => {
                // No cluster close enough to join outright. A near-miss
                // seeds a subtopic under the closest main topic; anything
                // further away seeds a fresh main topic. Labels come from
                // the post's tags when we have them.
                let parent_id = other.and_then(|(closest, similarity)| {
                    subtopic_parent(
                        closest,
                        similarity,
                        ctx.config.trend.subtopic_similarity_threshold,
                        ctx.config.trend.similarity_threshold,
                    )
                });
                let level = if parent_id.is_some() { 2 } else { 1 };

                let label = {
                    let mut conn = ctx.conn()?;
                    db::get_enrichment(&mut conn, post.id, "tags")?
                        .and_then(|row| {
                            row.data.get("tags").and_then(|t| {
                                t.as_array()
                                    .and_then(|a| a.first())
                                    .and_then(|v| v.as_str())
                                    .map(str::to_string)
                            })
                        })
                        .unwrap_or_else(|| "untitled".to_string())
                };
                let primary_topic = match (parent_id, &other) {
                    // A subtopic inherits its parent's main topic.
                    (Some(_), Some((closest, _))) => closest.primary_topic.clone(),
                    _ => label.clone(),
                };

                let cluster_id = Uuid::new_v4();
                let new_cluster = NewTrendCluster {
                    id: cluster_id,
                    tenant,
                    label: &label,
                    primary_topic: &primary_topic,
                    centroid: embedding.clone(),
                    status: ClusterStatus::Emerging.into(),
                    is_generic: false,
                    coherence: 1.0,
                    parent_id,
                    level,
                    freq_short: 1,
                    baseline: 1.0,
                    source_channels: vec![post.channel_id],
                };
                {
                    let mut conn = ctx.conn()?;
                    db::insert_cluster(&mut conn, &new_cluster)?;
                }
                match parent_id {
                    Some(parent) => {
                        debug!("Seeded subtopic cluster {cluster_id} ({label}) under {parent}")
                    }
                    None => debug!("Seeded new trend cluster {cluster_id} ({label})"),
                }

                (
                    EmissionCheck {
                        freq_short: 1,
                        baseline: 1.0,
                        source_diversity: 1,
                        coherence: 1.0,
                        in_cooldown: false,
                        is_generic: false,
                    },
                    cluster_id,
                    label,
                )
            }
        };

        let (check, cluster_id, label) = assigned;

        // Quiet hours make emission harder, not easier: both thresholds
        // inflate.
        let freq_ratio_threshold =
            adaptive::quiet_adjusted_now(ctx.config.trend.freq_ratio_threshold, now);
        let coherence_threshold =
            adaptive::quiet_adjusted_now(ctx.config.trend.coherence_threshold, now).min(1.0);

        match emission_block_reason(
            check,
            freq_ratio_threshold,
            ctx.config.trend.min_source_diversity,
            coherence_threshold,
        ) {
            Some(reason) => {
                metrics::counter!("trend_detection_threshold_reasons", "reason" => reason)
                    .increment(1);
                Ok(StageResult {
                    downstream: None,
                    outcome: reason,
                })
            }
            None => {
                let cooldown_until =
                    now + chrono::Duration::minutes(ctx.config.trend.cooldown_minutes);
                {
                    let mut conn = ctx.conn()?;
                    db::set_cluster_cooldown(&mut conn, cluster_id, cooldown_until)?;
                }
                info!(
                    "Cluster {cluster_id} ({label}) is emerging: freq {} over baseline {:.2}",
                    check.freq_short, check.baseline
                );
                Ok(StageResult {
                    downstream: Some((
                        format!("{cluster_id}:emerging:{}", now.timestamp()),
                        TrendEmerging {
                            cluster_id,
                            label,
                            freq_ratio: check.freq_short as f64 / check.baseline.max(f64::EPSILON),
                            source_diversity: check.source_diversity as i32,
                            coherence: check.coherence,
                            sample_post_ids: vec![post.id],
                        },
                    )),
                    outcome: "emerging",
                })
            }
        }
    }

    fn fallback(
        &self,
        _envelope: &Envelope<PostIndexed>,
        _reason: &str,
    ) -> Option<(String, TrendEmerging)> {
        // Emission is conditional by design; a skip here is not a silent
        // drop because posts.indexed was already the chain's terminal
        // success event.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    fn passing_check() -> EmissionCheck {
        EmissionCheck {
            freq_short: 10,
            baseline: 3.0,
            source_diversity: 4,
            coherence: 0.7,
            in_cooldown: false,
            is_generic: false,
        }
    }

    #[test]
    fn qualifying_cluster_emits() {
        assert_eq!(emission_block_reason(passing_check(), 3.0, 3, 0.55), None);
    }

    #[test]
    fn low_diversity_blocks_with_the_expected_reason() {
        let check = EmissionCheck {
            source_diversity: 2,
            ..passing_check()
        };
        assert_eq!(
            emission_block_reason(check, 3.0, 3, 0.55),
            Some("source_diversity_too_low")
        );
    }

    #[test]
    fn each_threshold_blocks_independently() {
        let ratio_low = EmissionCheck {
            freq_short: 5,
            baseline: 3.0,
            ..passing_check()
        };
        assert_eq!(emission_block_reason(ratio_low, 3.0, 3, 0.55), Some("ratio_low"));

        let coherence_low = EmissionCheck {
            coherence: 0.4,
            ..passing_check()
        };
        assert_eq!(
            emission_block_reason(coherence_low, 3.0, 3, 0.55),
            Some("coherence_low")
        );

        let cooling = EmissionCheck {
            in_cooldown: true,
            ..passing_check()
        };
        assert_eq!(emission_block_reason(cooling, 3.0, 3, 0.55), Some("cooldown"));

        let generic = EmissionCheck {
            is_generic: true,
            ..passing_check()
        };
        assert_eq!(emission_block_reason(generic, 3.0, 3, 0.55), Some("generic"));
    }

    #[test]
    fn ratio_boundary_is_inclusive() {
        // freq 9 over baseline 3 is exactly 3.0, which qualifies.
        let check = EmissionCheck {
            freq_short: 9,
            baseline: 3.0,
            ..passing_check()
        };
        assert_eq!(emission_block_reason(check, 3.0, 3, 0.55), None);
    }

    fn cluster(level: i32, parent_id: Option<Uuid>) -> DbTrendCluster {
        DbTrendCluster {
            id: Uuid::new_v4(),
            tenant: "t".into(),
            label: "topic".into(),
            primary_topic: "topic".into(),
            centroid: vec![1.0, 0.0],
            status: "emerging".into(),
            is_generic: false,
            coherence: 0.8,
            parent_id,
            level,
            freq_short: 1,
            baseline: 1.0,
            source_channels: vec![],
            cooldown_until: None,
            last_activity_at: "2026-01-05T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn near_miss_on_a_main_topic_seeds_a_subtopic_under_it() {
        let main = cluster(1, None);
        assert_eq!(subtopic_parent(&main, 0.75, 0.70, 0.83), Some(main.id));
    }

    #[test]
    fn near_miss_on_a_subtopic_attaches_to_its_parent() {
        // The level cap: never a level-3 cluster.
        let parent = Uuid::new_v4();
        let sub = cluster(2, Some(parent));
        assert_eq!(subtopic_parent(&sub, 0.75, 0.70, 0.83), Some(parent));

        // A level-2 row with no parent can't become one either.
        let orphan = cluster(2, None);
        assert_eq!(subtopic_parent(&orphan, 0.75, 0.70, 0.83), None);
    }

    #[test]
    fn similarity_outside_the_band_never_makes_a_subtopic() {
        let main = cluster(1, None);
        // Too far: a fresh main topic instead.
        assert_eq!(subtopic_parent(&main, 0.5, 0.70, 0.83), None);
        // Close enough to join outright: the assignment path owns it.
        assert_eq!(subtopic_parent(&main, 0.9, 0.70, 0.83), None);
        // Boundary: the subtopic threshold itself is inclusive.
        assert_eq!(subtopic_parent(&main, 0.70, 0.70, 0.83), Some(main.id));
    }

    #[test]
    fn cosine_similarity_basics() {
        assert_float_eq!(
            cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]),
            1.0,
            abs <= 1e-12
        );
        assert_float_eq!(
            cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]),
            0.0,
            abs <= 1e-12
        );
        assert_float_eq!(
            cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]),
            -1.0,
            abs <= 1e-12
        );
        // Mismatched or empty vectors degrade to zero rather than panic.
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
