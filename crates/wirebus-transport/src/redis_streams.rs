//! # Redis Transport
//!
//! Channels are Redis streams. Entries carry their bytes in a single
//! `payload` field.
//!
//! | Operation | Commands |
//! |-----------|----------|
//! | publish | `XADD <channel> MAXLEN ~ <n> * payload <bytes>` |
//! | ensure_group | `XGROUP CREATE <channel> <group> <id> MKSTREAM` |
//! | read_group | `XREADGROUP GROUP <group> <consumer> [BLOCK ms] STREAMS ... > / 0` |
//! | claim_stale | `XPENDING <channel> <group> IDLE <ms> - + <n>` then `XCLAIM` |
//! | touch | `XCLAIM <channel> <group> <consumer> 0 <id> JUSTID` if still owned |
//! | expire | `PEXPIRE <channel> <ms>` |
//! | leases | `SET NX PX` semantics via scripts |
//!
//! Commands share one multiplexed connection. Blocking reads would stall it,
//! so they use connections from a small pool instead.

use crate::transport::{ReadCursor, StartPosition, StreamEntry, Transport, TransportResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use wirebus_types::{EntryId, TransportError};

use crate::memory::DEFAULT_MAX_STREAM_LENGTH;

const PAYLOAD_FIELD: &str = "payload";

const ACQUIRE_LEASE: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
elseif current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const TOUCH_PENDING: &str = r"
local owned = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1, ARGV[2])
if #owned == 0 then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
";

/// Classify a Redis error. Anything that smells like the connection is
/// reported as [`TransportError::ConnectionLost`] so loops reconnect.
pub(crate) fn map_err(err: RedisError) -> TransportError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        TransportError::ConnectionLost(err.to_string())
    } else if err.code() == Some("NOGROUP") {
        TransportError::GroupMissing(err.to_string())
    } else {
        TransportError::Broker(err.to_string())
    }
}

/// Strip credentials from a connection URL for logging.
pub(crate) fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn parse_id(id: &str) -> TransportResult<EntryId> {
    id.parse()
        .map_err(|e| TransportError::Broker(format!("unexpected stream id: {e}")))
}

/// Transport backed by Redis streams.
pub struct RedisTransport {
    url: String,
    client: Client,
    conn: ConnectionManager,
    read_pool: Mutex<Vec<ConnectionManager>>,
    acquire_lease: Script,
    release_lease: Script,
    touch_pending: Script,
    closed: AtomicBool,
    max_stream_length: usize,
}

impl RedisTransport {
    /// Connect to `url` (for example `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> TransportResult<Self> {
        Self::connect_with(url, DEFAULT_MAX_STREAM_LENGTH).await
    }

    pub async fn connect_with(url: &str, max_stream_length: usize) -> TransportResult<Self> {
        let client = Client::open(url).map_err(map_err)?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;
        info!(url = %redact(url), "Connected to Redis");
        Ok(Self {
            url: url.to_string(),
            client,
            conn,
            read_pool: Mutex::new(Vec::new()),
            acquire_lease: Script::new(ACQUIRE_LEASE),
            release_lease: Script::new(RELEASE_LEASE),
            touch_pending: Script::new(TOUCH_PENDING),
            closed: AtomicBool::new(false),
            max_stream_length,
        })
    }

    fn conn(&self) -> TransportResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn take_read_conn(&self) -> TransportResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let pooled = self.read_pool.lock().pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self.client.get_connection_manager().await.map_err(map_err),
        }
    }

    fn return_read_conn(&self, conn: ConnectionManager) {
        if !self.closed.load(Ordering::SeqCst) {
            self.read_pool.lock().push(conn);
        }
    }

    /// Delivery counts of `consumer`'s pending entries on `channel`.
    async fn pending_counts(
        &self,
        conn: &mut ConnectionManager,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> TransportResult<HashMap<String, u32>> {
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(channel)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query_async(conn)
            .await
            .map_err(map_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, _, _, deliveries)| (id, deliveries as u32))
            .collect())
    }

    fn to_entry(
        channel: &str,
        stream_id: &StreamId,
        delivery_count: u32,
    ) -> TransportResult<Option<StreamEntry>> {
        let Some(payload) = stream_id.get::<Vec<u8>>(PAYLOAD_FIELD) else {
            return Ok(None);
        };
        Ok(Some(StreamEntry {
            channel: channel.to_string(),
            id: parse_id(&stream_id.id)?,
            payload: Arc::from(payload),
            delivery_count,
        }))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn open(&self) -> TransportResult<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> TransportResult<EntryId> {
        let mut conn = self.conn()?;
        let id: String = conn
            .xadd_maxlen(
                channel,
                StreamMaxlen::Approx(self.max_stream_length),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await
            .map_err(map_err)?;
        debug!(channel, id = %id, bytes = payload.len(), "Entry published");
        parse_id(&id)
    }

    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> TransportResult<()> {
        let mut conn = self.conn()?;
        let start_id = match start {
            StartPosition::Latest => "$".to_string(),
            StartPosition::Beginning => "0".to_string(),
            StartPosition::After(id) => id.to_string(),
        };
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(channel, group, start_id).await;
        match created {
            Ok(()) => {
                debug!(channel, group, ?start, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn read_group(
        &self,
        channels: &[String],
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> TransportResult<Vec<StreamEntry>> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }
        let start = match cursor {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        };
        let ids = vec![start; channels.len()];
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));

        // BLOCK 0 waits forever, so a zero block means no BLOCK at all.
        let blocking = cursor == ReadCursor::New && !block.is_zero();
        let mut conn = if blocking {
            options = options.block(block.as_millis().max(1) as usize);
            self.take_read_conn().await?
        } else {
            self.conn()?
        };

        let reply: Option<StreamReadReply> = conn
            .xread_options(channels, ids.as_slice(), &options)
            .await
            .map_err(map_err)?;
        if blocking {
            self.return_read_conn(conn.clone());
        }

        let mut batch = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            let counts = match cursor {
                ReadCursor::New => HashMap::new(),
                ReadCursor::Pending => {
                    self.pending_counts(&mut conn, &key.key, group, consumer, count.max(1))
                        .await?
                }
            };
            for stream_id in &key.ids {
                let deliveries = counts.get(&stream_id.id).copied().unwrap_or(1);
                match Self::to_entry(&key.key, stream_id, deliveries)? {
                    Some(entry) => batch.push(entry),
                    None => {
                        // Pending entry whose data was trimmed from the stream.
                        let _: i64 = conn
                            .xack(&key.key, group, &[&stream_id.id])
                            .await
                            .map_err(map_err)?;
                    }
                }
            }
        }
        Ok(batch)
    }

    async fn ack(&self, channel: &str, group: &str, id: EntryId) -> TransportResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn
            .xack(channel, group, &[id.to_string()])
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TransportResult<Vec<StreamEntry>> {
        let mut conn = self.conn()?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(channel)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: HashMap<String, u32> = rows
            .iter()
            .map(|(id, _, _, n)| (id.clone(), *n as u32 + 1))
            .collect();
        let ids: Vec<&str> = rows.iter().map(|(id, _, _, _)| id.as_str()).collect();
        let reply: StreamClaimReply = conn
            .xclaim(channel, group, consumer, min_idle_ms, ids.as_slice())
            .await
            .map_err(map_err)?;

        let mut claimed = Vec::new();
        for stream_id in &reply.ids {
            let n = deliveries.get(&stream_id.id).copied().unwrap_or(1);
            if let Some(entry) = Self::to_entry(channel, stream_id, n)? {
                claimed.push(entry);
            }
        }
        if !claimed.is_empty() {
            debug!(channel, group, consumer, claimed = claimed.len(), "Claimed stale entries");
        }
        Ok(claimed)
    }

    async fn touch(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> TransportResult<bool> {
        let mut conn = self.conn()?;
        let touched: i64 = self
            .touch_pending
            .key(channel)
            .arg(group)
            .arg(consumer)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(touched == 1)
    }

    async fn expire(&self, channel: &str, ttl: Duration) -> TransportResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn
            .pexpire(channel, ttl.as_millis().max(1) as i64)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> TransportResult<bool> {
        let mut conn = self.conn()?;
        let acquired: i64 = self
            .acquire_lease
            .key(key)
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(acquired == 1)
    }

    async fn lease_holder(&self, key: &str) -> TransportResult<Option<String>> {
        let mut conn = self.conn()?;
        let holder: Option<String> = conn.get(key).await.map_err(map_err)?;
        Ok(holder)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> TransportResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = self
            .release_lease
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.read_pool.lock().clear();
        info!(url = %redact(&self.url), "Redis transport closed");
        Ok(())
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}
