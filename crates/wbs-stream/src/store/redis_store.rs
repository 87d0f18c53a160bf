//! Redis Streams backed store.
//!
//! Ordinary commands share one `ConnectionManager`. `XREADGROUP ... BLOCK`
//! holds its connection for the whole block timeout, so every consumer name
//! gets a dedicated multiplexed connection for its reads.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{Client, RedisError, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CounterStore, StreamStore};
use crate::entry::{Entry, EntryId, EntryRange, PendingEntry, PendingSummary, StartPosition};
use crate::error::{StoreError, StoreResult};

const BUSY_GROUP: &str = "BUSYGROUP";
const NO_GROUP: &str = "NOGROUP";
const KEY_MUST_EXIST: &str = "requires the key to exist";
const ID_NOT_INCREASING: &str = "equal or smaller than";

/// Stream store talking to a Redis server.
pub struct RedisStreamStore {
    client: Client,
    manager: ConnectionManager,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamStore").finish_non_exhaustive()
    }
}

impl RedisStreamStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!(url = %url, "Connected to Redis stream store");
        Ok(Self {
            client,
            manager,
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn reader(&self, consumer: &str) -> StoreResult<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        readers.insert(consumer.to_string(), conn.clone());
        debug!(consumer = %consumer, "Opened dedicated read connection");
        Ok(conn)
    }

    async fn forget_reader(&self, consumer: &str) {
        self.readers.lock().await.remove(consumer);
    }
}

fn parse_id(raw: &str) -> StoreResult<EntryId> {
    raw.parse().map_err(|_| StoreError::InvalidEntryId {
        id: raw.to_string(),
    })
}

fn to_entry(stream: &str, raw: StreamId) -> StoreResult<Entry> {
    let id = parse_id(&raw.id)?;
    let mut fields = BTreeMap::new();
    for (name, value) in raw.map {
        fields.insert(name, field_value(&value)?);
    }
    Ok(Entry::new(id, stream, fields))
}

fn field_value(value: &Value) -> StoreResult<String> {
    redis::from_redis_value::<String>(value).map_err(|e| StoreError::Protocol {
        cause: format!("Field value is not a string: {e}"),
    })
}

fn group_error(err: RedisError, stream: &str, group: &str) -> StoreError {
    let message = err.to_string();
    if err.code() == Some(NO_GROUP) || message.contains(NO_GROUP) {
        StoreError::GroupMissing {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        StoreError::Redis(err)
    }
}

fn create_group_error(err: RedisError, stream: &str, group: &str) -> StoreError {
    let message = err.to_string();
    if err.code() == Some(BUSY_GROUP) || message.contains(BUSY_GROUP) {
        StoreError::GroupExists {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else if message.contains(KEY_MUST_EXIST) {
        StoreError::StreamMissing {
            stream: stream.to_string(),
        }
    } else {
        StoreError::Redis(err)
    }
}

fn append_error(err: RedisError, stream: &str, id: Option<EntryId>) -> StoreError {
    if err.to_string().contains(ID_NOT_INCREASING) {
        StoreError::IdNotIncreasing {
            stream: stream.to_string(),
            id: id.unwrap_or(EntryId::ZERO),
        }
    } else {
        StoreError::Redis(err)
    }
}

fn range_bound(id: Option<EntryId>, open: &str) -> String {
    id.map_or_else(|| open.to_string(), |id| id.to_string())
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> StoreResult<()> {
        let offset = match start {
            StartPosition::Beginning => "0".to_string(),
            StartPosition::Latest => "$".to_string(),
            StartPosition::After(id) => id.to_string(),
        };
        let mut conn = self.conn();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(offset)
            .query_async(&mut conn)
            .await;

        result.map_err(|e| create_group_error(e, stream, group))
    }

    async fn append(
        &self,
        stream: &str,
        id: Option<EntryId>,
        fields: &BTreeMap<String, String>,
    ) -> StoreResult<EntryId> {
        let mut command = redis::cmd("XADD");
        command
            .arg(stream)
            .arg(id.map_or_else(|| "*".to_string(), |id| id.to_string()));
        for (name, value) in fields {
            command.arg(name).arg(value);
        }

        let mut conn = self.conn();
        let result: Result<String, RedisError> = command.query_async(&mut conn).await;
        match result {
            Ok(raw) => parse_id(&raw),
            Err(e) => Err(append_error(e, stream, id)),
        }
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<Entry>> {
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        let mut conn = self.reader(consumer).await?;
        let result: Result<Option<StreamReadReply>, RedisError> = redis::cmd("XREADGROUP")
            .arg(&options)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.forget_reader(consumer).await;
                }
                return Err(group_error(e, stream, group));
            }
        };

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for raw in key.ids {
                entries.push(to_entry(&key.key, raw)?);
            }
        }
        Ok(entries)
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool> {
        let mut conn = self.conn();
        let acknowledged: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(acknowledged > 0)
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, stream, group))?;

        match reply {
            StreamPendingReply::Empty => Ok(PendingSummary::default()),
            StreamPendingReply::Data(data) => Ok(PendingSummary {
                total: data.count as u64,
                lowest: Some(parse_id(&data.start_id)?),
                highest: Some(parse_id(&data.end_id)?),
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending as u64))
                    .collect(),
            }),
        }
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        range: EntryRange,
        limit: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let mut conn = self.conn();
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(range_bound(range.start, "-"))
            .arg(range_bound(range.end, "+"))
            .arg(limit)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, stream, group))?;

        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntry {
                    id: parse_id(&p.id)?,
                    consumer: p.consumer,
                    delivery_count: p.times_delivered as u64,
                    idle: Duration::from_millis(p.last_delivered_ms as u64),
                })
            })
            .collect()
    }

    async fn lookup(&self, stream: &str, id: EntryId) -> StoreResult<Option<Entry>> {
        let mut conn = self.conn();
        let raw_id = id.to_string();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(&raw_id)
            .arg(&raw_id)
            .query_async(&mut conn)
            .await?;

        reply
            .ids
            .into_iter()
            .next()
            .map(|raw| to_entry(stream, raw))
            .transpose()
    }
}

#[async_trait]
impl CounterStore for RedisStreamStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let value: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
