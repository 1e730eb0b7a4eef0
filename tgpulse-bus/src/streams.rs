use log::{debug, warn};
use miette::Diagnostic;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use thiserror::Error;

/// Field name under which the JSON envelope travels in a stream entry.
const DATA_FIELD: &str = "data";
const ERROR_FIELD: &str = "last_error";
const SOURCE_ID_FIELD: &str = "source_id";

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("redis command failed")]
    Redis(#[from] RedisError),

    #[error("stream entry {0} has no data field")]
    MissingData(String),
}

/// Streams are keyed per tenant so one tenant's backlog can never starve
/// another's consumers.
pub fn stream_key(stream: &str, tenant: &str) -> String {
    format!("{stream}:{tenant}")
}

pub fn dlq_key(stream: &str, tenant: &str) -> String {
    format!("{stream}.dlq:{tenant}")
}

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Thin wrapper over the Redis streams commands this pipeline uses. The
/// connection manager reconnects on its own, so clones of this are handed
/// to every worker.
#[derive(Clone)]
pub struct StreamBus {
    conn: ConnectionManager,
}

impl StreamBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(StreamBus { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        StreamBus { conn }
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Creates the consumer group if it doesn't exist yet. BUSYGROUP means
    /// someone else got there first, which is fine.
    pub async fn ensure_group(&self, key: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn.xgroup_create_mkstream(key, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// XADD of one envelope body. Returns the assigned stream id, which is
    /// monotonically increasing per stream.
    pub async fn publish(&self, key: &str, body: &str) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(key, "*", &[(DATA_FIELD, body)]).await?;
        Ok(id)
    }

    /// Claims up to `count` fresh messages for this consumer, blocking up to
    /// `block_ms`. An empty result just means the block timed out.
    pub async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn.xread_options(&[key], &[">"], &options).await?;

        let mut messages = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                messages.push(to_message(entry)?);
            }
        }
        Ok(messages)
    }

    pub async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(key, group, &[id]).await?;
        Ok(())
    }

    /// Pending entries for the group, with delivery counts. The caller
    /// decides which are stale enough to steal and which have exhausted
    /// their retry budget.
    pub async fn pending(
        &self,
        key: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BusError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(key, group, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    /// XCLAIM: steal messages idle longer than `min_idle_ms` onto this
    /// consumer. Returns the claimed bodies for reprocessing.
    pub async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, BusError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn.xclaim(key, group, consumer, min_idle_ms, ids).await?;

        let mut messages = Vec::new();
        for entry in reply.ids {
            // XCLAIM can return an id with no fields when the entry was
            // XDEL'd under us; skip those.
            if entry.map.is_empty() {
                warn!("Claimed stream entry {} has already been deleted", entry.id);
                continue;
            }
            messages.push(to_message(entry)?);
        }
        Ok(messages)
    }

    /// Atomically (from the group's point of view) moves one poisoned
    /// message to the stream's DLQ: append there first, then ack here, so a
    /// crash in between duplicates into the DLQ rather than losing the
    /// message.
    pub async fn move_to_dlq(
        &self,
        stream: &str,
        tenant: &str,
        group: &str,
        message: &StreamMessage,
        last_error: &str,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let key = stream_key(stream, tenant);
        let dlq = dlq_key(stream, tenant);

        let _: String = conn
            .xadd(
                &dlq,
                "*",
                &[
                    (DATA_FIELD, message.data.as_str()),
                    (ERROR_FIELD, last_error),
                    (SOURCE_ID_FIELD, message.id.as_str()),
                ],
            )
            .await?;
        let _: i64 = conn.xack(&key, group, &[&message.id]).await?;
        debug!("Moved {} from {key} to {dlq}: {last_error}", message.id);
        Ok(())
    }

    /// XTRIM MINID maintenance. Never called for DLQ streams; those are
    /// drained by operators.
    pub async fn trim_before(&self, key: &str, min_id: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(key)
            .arg("MINID")
            .arg(min_id)
            .query_async(&mut conn)
            .await?;
        Ok(trimmed)
    }

    pub async fn len(&self, key: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.xlen(key).await?)
    }
}

fn to_message(entry: StreamId) -> Result<StreamMessage, BusError> {
    let value = entry
        .map
        .get(DATA_FIELD)
        .ok_or_else(|| BusError::MissingData(entry.id.clone()))?;
    let data: String = redis::from_redis_value(value)
        .map_err(|_| BusError::MissingData(entry.id.clone()))?;
    Ok(StreamMessage { id: entry.id, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_tenant_scoped() {
        assert_eq!(stream_key("posts.parsed", "acme"), "posts.parsed:acme");
        assert_eq!(dlq_key("posts.parsed", "acme"), "posts.parsed.dlq:acme");
    }
}
