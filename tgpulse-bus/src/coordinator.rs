use crate::streams::{BusError, StreamBus};
use chrono::Utc;
use log::debug;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
}

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

// Token bucket state lives in a hash {tokens, ts_ms}. The current time is
// passed in from the client because scripts must stay deterministic.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local state = redis.call('hmget', KEYS[1], 'tokens', 'ts_ms')
local tokens = tonumber(state[1]) or capacity
local ts_ms = tonumber(state[2]) or now_ms
local elapsed = math.max(0, now_ms - ts_ms) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_per_sec)
local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end
redis.call('hset', KEYS[1], 'tokens', tokens, 'ts_ms', now_ms)
redis.call('pexpire', KEYS[1], math.ceil(capacity / refill_per_sec * 2000))
return allowed
"#;

// Sliding window over a sorted set of event timestamps.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('zremrangebyscore', KEYS[1], 0, now_ms - window_ms)
local count = redis.call('zcard', KEYS[1])
if count >= limit then
    return 0
end
redis.call('zadd', KEYS[1], now_ms, now_ms .. '-' .. math.random(1000000))
redis.call('pexpire', KEYS[1], window_ms)
return 1
"#;

/// Ephemeral coordination state: locks, high-watermark cursors, rate-limit
/// buckets, quarantine markers, cached statistics, idempotency keys. All of
/// it lives in Redis with TTLs; losing it is an availability event, not a
/// correctness one.
#[derive(Clone)]
pub struct Coordinator {
    conn: ConnectionManager,
}

impl Coordinator {
    pub fn new(bus: &StreamBus) -> Self {
        Coordinator {
            conn: bus.connection(),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Coordinator { conn })
    }

    // -- locks --------------------------------------------------------------

    /// Non-blocking acquire. `holder` must be unique per process so renew
    /// and release can verify ownership.
    pub async fn try_lock(&self, key: &str, holder: &str, ttl_ms: u64) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    /// Extends the TTL if and only if we still hold the lock.
    pub async fn renew_lock(&self, key: &str, holder: &str, ttl_ms: u64) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(holder)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    pub async fn unlock(&self, key: &str, holder: &str) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    // -- high-watermark cursors --------------------------------------------

    /// Written before `last_parsed_at` is committed so a crash mid-batch
    /// leaves a trail; cleared once the channel cursor is durable.
    pub async fn set_parse_hwm(&self, channel: &str, hwm: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(format!("parse_hwm:{channel}"), hwm).await?;
        Ok(())
    }

    pub async fn get_parse_hwm(&self, channel: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(format!("parse_hwm:{channel}")).await?)
    }

    pub async fn clear_parse_hwm(&self, channel: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(format!("parse_hwm:{channel}")).await?;
        Ok(())
    }

    // -- quarantine ---------------------------------------------------------

    pub async fn quarantine_channel(
        &self,
        channel: &str,
        reason: &str,
        ttl_secs: u64,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(format!("parse_quarantine:{channel}"), reason, ttl_secs)
            .await?;
        debug!("Channel {channel} quarantined for {ttl_secs}s: {reason}");
        Ok(())
    }

    pub async fn is_quarantined(&self, channel: &str) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(format!("parse_quarantine:{channel}")).await?)
    }

    // -- cached statistics --------------------------------------------------

    pub async fn cache_channel_stats(
        &self,
        channel: &str,
        stats_json: &str,
        ttl_secs: u64,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(format!("parse_stats:{channel}"), stats_json, ttl_secs)
            .await?;
        Ok(())
    }

    pub async fn get_channel_stats(&self, channel: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(format!("parse_stats:{channel}")).await?)
    }

    // -- idempotency --------------------------------------------------------

    /// SET NX with TTL. Returns true when this caller is first, false when
    /// the key was already claimed (the duplicate case).
    pub async fn claim_once(&self, key: &str, ttl_secs: u64) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(claimed.is_some())
    }

    // -- rate limits --------------------------------------------------------

    /// Token bucket per `(tenant, provider)`. One token per call.
    pub async fn take_token(
        &self,
        tenant: &str,
        provider: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> Result<RateDecision, BusError> {
        let mut conn = self.conn.clone();
        let allowed: i64 = redis::Script::new(TOKEN_BUCKET_SCRIPT)
            .key(format!("rate:{tenant}:{provider}"))
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(if allowed == 1 {
            RateDecision::Allowed
        } else {
            RateDecision::Limited
        })
    }

    /// Sliding-window counter, used for per-source limits.
    pub async fn check_window(
        &self,
        key: &str,
        window_ms: u64,
        limit: u32,
    ) -> Result<RateDecision, BusError> {
        let mut conn = self.conn.clone();
        let allowed: i64 = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(format!("window:{key}"))
            .arg(Utc::now().timestamp_millis())
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(if allowed == 1 {
            RateDecision::Allowed
        } else {
            RateDecision::Limited
        })
    }
}
