use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use scanrelay_core::models::{JobContext, JobId, QueueMessage};
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};

use crate::{
    ContextStore, StoreError, StoreResult, StreamEntry, StreamQueue, decode_context,
    encode_context, encode_message,
};

/// In-process broker with the same semantics as [`crate::RedisBroker`]: write-once contexts
/// with expiry, and streams with consumer groups, pending entries and redelivery.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    published: Notify,
}

#[derive(Debug, Default)]
struct State {
    contexts: HashMap<String, (String, Instant)>,
    streams: HashMap<String, Stream>,
}

#[derive(Debug, Default)]
struct Stream {
    last_seq: u64,
    entries: BTreeMap<u64, Option<String>>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    /// Delivered but unacknowledged entries.
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

fn entry_id(seq: u64) -> String { format!("{seq}-0") }

fn parse_entry_id(id: &str) -> StoreResult<u64> {
    id.split_once('-').map_or(id, |(seq, _)| seq).parse().map_err(|_| StoreError::Malformed {
        what: "entry id",
        reason: id.to_string(),
    })
}

impl MemoryBroker {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a raw entry, bypassing message encoding. Used to simulate corrupt producers.
    pub fn publish_raw(&self, stream: &str, data: Option<String>) -> String {
        let id = {
            let mut state = self.lock();
            let stream = state.streams.entry(stream.to_string()).or_default();
            stream.last_seq += 1;
            let seq = stream.last_seq;
            stream.entries.insert(seq, data);
            entry_id(seq)
        };
        self.published.notify_waiters();
        id
    }

    /// Number of entries currently stored in a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Number of delivered but unacknowledged entries in a group.
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Drops a context entry as if its TTL had elapsed.
    pub fn expire(&self, id: &JobId) { self.lock().contexts.remove(&id.context_key()); }

    fn try_claim(
        &self,
        stream_name: &str,
        group_name: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut state = self.lock();
        let missing_group = || {
            StoreError::Command(format!(
                "NOGROUP no consumer group '{group_name}' for stream '{stream_name}'"
            ))
        };
        let stream = state.streams.get_mut(stream_name).ok_or_else(missing_group)?;
        let Stream { entries, groups, .. } = stream;
        let group = groups.get_mut(group_name).ok_or_else(missing_group)?;

        let fresh: Vec<(u64, Option<String>)> = entries
            .range(group.last_delivered + 1..)
            .take(count)
            .map(|(&seq, data)| (seq, data.clone()))
            .collect();
        let mut delivered = Vec::with_capacity(fresh.len());
        for (seq, data) in fresh {
            group.last_delivered = seq;
            let delivered_at = Instant::now();
            let pending = Pending { consumer: consumer.to_string(), delivered_at, deliveries: 1 };
            group.pending.insert(seq, pending);
            delivered.push(StreamEntry { id: entry_id(seq), data, deliveries: 1 });
        }
        Ok(delivered)
    }

    /// Delivery count of a pending entry.
    pub fn deliveries(&self, stream: &str, group: &str, entry_id: &str) -> Option<u64> {
        let seq = parse_entry_id(entry_id).ok()?;
        let state = self.lock();
        let group = state.streams.get(stream)?.groups.get(group)?;
        group.pending.get(&seq).map(|pending| pending.deliveries)
    }
}

#[async_trait]
impl ContextStore for MemoryBroker {
    async fn put(&self, context: &JobContext, ttl: Duration) -> StoreResult<()> {
        let key = context.id.context_key();
        let json = encode_context(context)?;
        let now = Instant::now();
        let mut state = self.lock();
        if state.contexts.get(&key).is_some_and(|(_, expires)| *expires > now) {
            return Err(StoreError::Collision(context.id));
        }
        state.contexts.insert(key, (json, now + ttl));
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<JobContext>> {
        let key = id.context_key();
        let data = {
            let mut state = self.lock();
            match state.contexts.get(&key) {
                Some((_, expires)) if *expires <= Instant::now() => {
                    state.contexts.remove(&key);
                    None
                }
                Some((json, _)) => Some(json.clone()),
                None => None,
            }
        };
        data.map(|json| decode_context(id, &json)).transpose()
    }

    async fn ping(&self) -> StoreResult<()> { Ok(()) }
}

#[async_trait]
impl StreamQueue for MemoryBroker {
    async fn publish(&self, stream: &str, message: &QueueMessage) -> StoreResult<String> {
        let json = encode_message(message)?;
        Ok(self.publish_raw(stream, Some(json)))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut state = self.lock();
        let stream = state.streams.entry(stream.to_string()).or_default();
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
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
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();
            let entries = self.try_claim(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if timeout_at(deadline, published).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn reclaim(
        &self,
        stream_name: &str,
        group_name: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut state = self.lock();
        let missing_group = || {
            StoreError::Command(format!(
                "NOGROUP no consumer group '{group_name}' for stream '{stream_name}'"
            ))
        };
        let stream = state.streams.get_mut(stream_name).ok_or_else(missing_group)?;
        let Stream { entries, groups, .. } = stream;
        let group = groups.get_mut(group_name).ok_or_else(missing_group)?;

        let now = Instant::now();
        let idle = group
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();
        let mut reclaimed = vec![];
        for seq in idle {
            if reclaimed.len() == count {
                break;
            }
            let Some(data) = entries.get(&seq) else {
                group.pending.remove(&seq);
                continue;
            };
            let Some(pending) = group.pending.get_mut(&seq) else { continue };
            tracing::debug!("Reclaiming {} from consumer {}", entry_id(seq), pending.consumer);
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            reclaimed.push(StreamEntry {
                id: entry_id(seq),
                data: data.clone(),
                deliveries: pending.deliveries,
            });
        }
        Ok(reclaimed)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StoreResult<()> {
        let seq = parse_entry_id(entry_id)?;
        let mut state = self.lock();
        if let Some(group) = state.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            group.pending.remove(&seq);
        }
        Ok(())
    }

    async fn delete(&self, stream: &str, entry_id: &str) -> StoreResult<()> {
        let seq = parse_entry_id(entry_id)?;
        let mut state = self.lock();
        if let Some(stream) = state.streams.get_mut(stream) {
            stream.entries.remove(&seq);
        }
        Ok(())
    }
}
