use crate::context::AppContext;
use humansize::{DECIMAL, format_size};
use log::{debug, info};
use thiserror::Error;
use tgpulse_bus::RateDecision;
use tgpulse_db::db;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("database error during quota check")]
    Db(#[from] tgpulse_db::QueryError),

    #[error("coordinator error during quota check")]
    Bus(#[from] tgpulse_bus::BusError),

    #[error("couldn't get a database connection")]
    Pool(#[from] tgpulse_db::PoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    /// Storage or budget exhausted. Terminal-skip for this pass; the
    /// pipeline continues.
    Exhausted,
}

/// Per-tenant storage check before any CAS upload. Sums usage across all
/// content types against the configured ceiling.
pub fn check_quota_before_upload(
    ctx: &AppContext,
    tenant: &str,
    incoming_bytes: u64,
) -> Result<QuotaDecision, QuotaError> {
    let max_bytes = (ctx.config.quota.per_tenant_max_gb * 1e9) as i64;

    let mut conn = ctx.conn()?;
    let mut used: i64 = 0;
    for content_type in ["media", "vision", "crawl"] {
        if let Some(usage) = db::get_storage_usage(&mut conn, tenant, content_type)? {
            used += usage.bytes;
        }
    }

    if used + incoming_bytes as i64 > max_bytes {
        info!(
            "Tenant {tenant} storage quota exhausted: {} used of {}, incoming {}",
            format_size(used as u64, DECIMAL),
            format_size(max_bytes as u64, DECIMAL),
            format_size(incoming_bytes, DECIMAL),
        );
        metrics::counter!("quota_denied_total", "tenant" => tenant.to_string(), "kind" => "storage")
            .increment(1);
        return Ok(QuotaDecision::Exhausted);
    }
    debug!(
        "Tenant {tenant} storage check passed ({} of {} used)",
        format_size(used as u64, DECIMAL),
        format_size(max_bytes as u64, DECIMAL),
    );
    Ok(QuotaDecision::Allowed)
}

/// Provider-call budget, a token bucket in the coordinator. Used for
/// tagging and crawl calls; ingestion never consults this (ingestion
/// commits fail open).
pub async fn take_provider_budget(
    ctx: &AppContext,
    tenant: &str,
    provider: &str,
) -> Result<QuotaDecision, QuotaError> {
    let (capacity, refill) = match provider {
        "crawl" => (
            ctx.config.quota.crawl_bucket_capacity,
            ctx.config.quota.crawl_refill_per_sec,
        ),
        _ => (
            ctx.config.quota.tagging_bucket_capacity,
            ctx.config.quota.tagging_refill_per_sec,
        ),
    };

    match ctx
        .coordinator
        .take_token(tenant, provider, capacity, refill)
        .await
    {
        Ok(RateDecision::Allowed) => Ok(QuotaDecision::Allowed),
        Ok(RateDecision::Limited) => {
            metrics::counter!("quota_denied_total", "tenant" => tenant.to_string(), "kind" => "budget")
                .increment(1);
            Ok(QuotaDecision::Exhausted)
        }
        // Unreachable coordinator fails closed here: budget paths are
        // non-critical and skipping is cheap.
        Err(err) => {
            debug!("Coordinator unreachable during budget check: {err}");
            Ok(QuotaDecision::Exhausted)
        }
    }
}

/// The web-crawl trigger policy. A post qualifies only when its tags
/// intersect the configured trigger set, it is long enough to be worth
/// crawling, and the tenant still has crawl budget (checked separately).
pub fn crawl_policy_reason(
    tags: &[String],
    word_count: usize,
    trigger_tags: &[String],
    min_word_count: usize,
) -> Option<&'static str> {
    if !tags.iter().any(|t| trigger_tags.iter().any(|tt| tt == t)) {
        return Some("no_trigger_tags");
    }
    if word_count < min_word_count {
        return Some("below_min_words");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn crawl_policy_requires_trigger_tag_intersection() {
        let trigger = tags(&["a"]);
        assert_eq!(
            crawl_policy_reason(&tags(&["b", "c"]), 600, &trigger, 500),
            Some("no_trigger_tags")
        );
        assert_eq!(crawl_policy_reason(&tags(&["a", "b"]), 600, &trigger, 500), None);
    }

    #[test]
    fn crawl_policy_requires_min_words() {
        let trigger = tags(&["a"]);
        assert_eq!(
            crawl_policy_reason(&tags(&["a", "b"]), 100, &trigger, 500),
            Some("below_min_words")
        );
        // Boundary: exactly min_word_count qualifies.
        assert_eq!(crawl_policy_reason(&tags(&["a"]), 500, &trigger, 500), None);
    }
}
