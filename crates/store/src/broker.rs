use std::{fmt, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, RedisError,
    aio::ConnectionManager,
    streams::{StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamReadReply},
};
use scanrelay_core::{
    config::RedisConfig,
    models::{JobContext, JobId, QueueMessage},
};
use tokio::time::{Instant, sleep};

use crate::{
    ContextStore, MESSAGE_FIELD, StoreError, StoreResult, StreamEntry, StreamQueue,
    decode_context, encode_context, encode_message,
};

/// Interval between non-blocking reads while waiting for new entries. Reads are polled rather
/// than issued with `BLOCK` so the shared multiplexed connection is never parked server-side.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis-backed context store (`SET NX EX` / `GET`) and stream queue (`XADD` / `XREADGROUP` /
/// `XAUTOCLAIM`).
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker").field("connection", &"ConnectionManager").finish()
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl RedisBroker {
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        tracing::info!("Connecting to Redis at {}", config.url);
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis");
        Ok(Self { conn })
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;
        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| stream_entry(entry, 1))
            .collect())
    }

    async fn delivery_count(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(reply.ids.first().map_or(1, |pending| pending.times_delivered as u64))
    }
}

fn stream_entry(entry: StreamId, deliveries: u64) -> StreamEntry {
    let data = entry.get::<String>(MESSAGE_FIELD);
    StreamEntry { id: entry.id, data, deliveries }
}

#[async_trait]
impl ContextStore for RedisBroker {
    async fn put(&self, context: &JobContext, ttl: Duration) -> StoreResult<()> {
        let key = context.id.context_key();
        let json = encode_context(context)?;
        tracing::debug!("Context SET: {} (TTL: {:?})", key, ttl);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        match reply {
            Some(_) => Ok(()),
            None => Err(StoreError::Collision(context.id)),
        }
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<JobContext>> {
        let key = id.context_key();
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(&key).await?;
        match data {
            Some(json) => {
                tracing::debug!("Context HIT: {}", key);
                decode_context(id, &json).map(Some)
            }
            None => {
                tracing::debug!("Context MISS: {}", key);
                Ok(None)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamQueue for RedisBroker {
    async fn publish(&self, stream: &str, message: &QueueMessage) -> StoreResult<String> {
        let json = encode_message(message)?;
        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(MESSAGE_FIELD)
            .arg(json)
            .query_async(&mut conn)
            .await?;
        tracing::debug!("Stream XADD: {} {}", stream, entry_id);
        Ok(entry_id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match result {
            Ok(()) => {
                tracing::info!("Created consumer group {} on {}", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::info!("Consumer group {} on {} already exists", group, stream);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let entries = self.read_group(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        if !reply.deleted_ids.is_empty() {
            tracing::warn!(
                "Dropped {} pending entries deleted from {}",
                reply.deleted_ids.len(),
                stream
            );
        }
        let mut entries = Vec::with_capacity(reply.claimed.len());
        for entry in reply.claimed {
            let deliveries = self.delivery_count(stream, group, &entry.id).await?;
            tracing::info!("Reclaimed {} from {} (delivery {})", entry.id, stream, deliveries);
            entries.push(stream_entry(entry, deliveries));
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("XDEL").arg(stream).arg(entry_id).query_async::<i64>(&mut conn).await?;
        Ok(())
    }
}
