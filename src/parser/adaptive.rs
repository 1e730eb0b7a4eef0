use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use tgpulse_db::db;
use uuid::Uuid;

/// Cached per-channel posting statistics. Recomputed from the posts table at
/// most once per TTL; consumers read the coordinator cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub p95_interarrival_secs: f64,
    pub sample_count: usize,
    pub computed_at: DateTime<Utc>,
}

pub const STATS_CACHE_TTL_SECS: u64 = 3600;

const NIGHT_MULTIPLIER: f64 = 1.5;
const WEEKEND_MULTIPLIER: f64 = 1.8;

/// p95 of the inter-arrival gaps in a sorted timestamp series. Fewer than
/// two samples means we know nothing; callers fall back to defaults.
pub fn compute_stats(posted_at: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<ChannelStats> {
    if posted_at.len() < 2 {
        return None;
    }

    let mut gaps: Vec<f64> = posted_at
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds().max(0) as f64)
        .collect();
    gaps.sort_by(|a, b| a.partial_cmp(b).expect("gaps are never NaN"));

    // Nearest-rank p95.
    let rank = ((gaps.len() as f64) * 0.95).ceil() as usize;
    let p95 = gaps[rank.clamp(1, gaps.len()) - 1];

    Some(ChannelStats {
        p95_interarrival_secs: p95,
        sample_count: posted_at.len(),
        computed_at: now,
    })
}

/// Quiet-hours inflation for a base threshold. Nights are 22:00–08:00 local;
/// weekends take precedence when both apply because they inflate harder.
/// Returns the adjusted threshold and the label for the metric.
pub fn quiet_adjusted(base: f64, local_hour: u32, weekday: Weekday) -> (f64, Option<&'static str>) {
    let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
    let night = local_hour >= 22 || local_hour < 8;

    if weekend {
        (base * WEEKEND_MULTIPLIER, Some("weekend"))
    } else if night {
        (base * NIGHT_MULTIPLIER, Some("night"))
    } else {
        (base, None)
    }
}

/// Adjusts a threshold for the current wall-clock moment and emits the
/// quiet_reason metric when inflation kicked in.
pub fn quiet_adjusted_now(base: f64, now: DateTime<Utc>) -> f64 {
    let (adjusted, reason) = quiet_adjusted(base, now.hour(), now.weekday());
    if let Some(reason) = reason {
        metrics::counter!("adaptive_quiet_reason_total", "quiet_reason" => reason).increment(1);
    }
    adjusted
}

/// Fetches channel stats through the coordinator cache, recomputing from
/// the posts table on a miss.
pub async fn channel_stats(
    ctx: &AppContext,
    channel_id: Uuid,
) -> Result<Option<ChannelStats>, crate::parser::ParseError> {
    if !ctx.config.feature.adaptive_thresholds {
        return Ok(None);
    }

    let cache_key = channel_id.to_string();
    if let Some(cached) = ctx.coordinator.get_channel_stats(&cache_key).await? {
        if let Ok(stats) = serde_json::from_str::<ChannelStats>(&cached) {
            return Ok(Some(stats));
        }
        // A cache entry we can't parse is stale format; recompute below.
        debug!("Discarding unparseable stats cache for channel {channel_id}");
    }

    let now = Utc::now();
    let window_start = now - chrono::Duration::days(ctx.config.parser.stats_window_days);
    let stamps = {
        let mut conn = ctx.conn()?;
        db::channel_posted_at_window(&mut conn, channel_id, window_start)?
    };

    let stats = compute_stats(&stamps, now);
    if let Some(stats) = &stats {
        let encoded = serde_json::to_string(stats)
            .expect("channel stats contain no non-serializable values");
        ctx.coordinator
            .cache_channel_stats(&cache_key, &encoded, STATS_CACHE_TTL_SECS)
            .await?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(gaps_secs: &[i64]) -> Vec<DateTime<Utc>> {
        let start: DateTime<Utc> = "2026-01-05T10:00:00Z".parse().unwrap();
        let mut out = vec![start];
        let mut cursor = start;
        for gap in gaps_secs {
            cursor += chrono::Duration::seconds(*gap);
            out.push(cursor);
        }
        out
    }

    #[test]
    fn p95_of_uniform_series_is_the_gap() {
        let stamps = series(&[60; 50]);
        let stats = compute_stats(&stamps, Utc::now()).unwrap();
        assert_eq!(stats.p95_interarrival_secs, 60.0);
        assert_eq!(stats.sample_count, 51);
    }

    #[test]
    fn p95_ignores_the_top_tail() {
        // 99 one-minute gaps and one huge outlier; p95 must not be the
        // outlier.
        let mut gaps = vec![60i64; 99];
        gaps.push(86_400);
        let stats = compute_stats(&series(&gaps), Utc::now()).unwrap();
        assert_eq!(stats.p95_interarrival_secs, 60.0);
    }

    #[test]
    fn too_few_samples_is_none() {
        assert!(compute_stats(&[], Utc::now()).is_none());
        assert!(compute_stats(&series(&[]), Utc::now()).is_none());
    }

    #[test]
    fn night_and_weekend_inflation() {
        // Tuesday 13:00: no inflation.
        let (value, reason) = quiet_adjusted(1.0, 13, Weekday::Tue);
        assert_eq!(value, 1.0);
        assert!(reason.is_none());

        // Tuesday 23:00: night.
        let (value, reason) = quiet_adjusted(1.0, 23, Weekday::Tue);
        assert_eq!(value, 1.5);
        assert_eq!(reason, Some("night"));

        // Tuesday 07:59 still counts as night.
        let (value, _) = quiet_adjusted(1.0, 7, Weekday::Tue);
        assert_eq!(value, 1.5);

        // Saturday afternoon: weekend.
        let (value, reason) = quiet_adjusted(1.0, 13, Weekday::Sat);
        assert_eq!(value, 1.8);
        assert_eq!(reason, Some("weekend"));

        // Saturday night: the weekend multiplier wins.
        let (value, reason) = quiet_adjusted(1.0, 23, Weekday::Sat);
        assert_eq!(value, 1.8);
        assert_eq!(reason, Some("weekend"));
    }
}
