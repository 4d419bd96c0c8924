//! Store adapter: the thin interface to the shared key-value/log store.
//!
//! Every piece of shared mutable state lives behind [`BufferStore`]. The
//! production backend is [`RedisStore`]; [`MemoryStore`] provides the same
//! contract in-process for tests and embedding.
//!
//! Two operations are deliberately atomic inside the store rather than
//! read-modify-write on the client:
//!
//! - [`BufferStore::create`] (SET NX EX) — only one writer can ever win the
//!   election for an absent buffer.
//! - [`BufferStore::append_message`] — a contributor's append plus
//!   extend-deadline-to-max happens in one step, so two slaves racing on the
//!   same snapshot cannot silently drop each other's message.

use crate::error::BufferError;
use crate::state::{BufferState, BufferedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Abstraction over the shared backing store.
///
/// Implementations must be safe to share across invocations; the coordinator
/// holds them behind an `Arc`.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Read the raw value at `key`, `None` when absent or expired.
    async fn read(&self, key: &str) -> Result<Option<String>, BufferError>;

    /// Whole-value replace with a TTL. Never a partial merge.
    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BufferError>;

    /// Atomic set-if-absent with a TTL. Returns `true` when this caller
    /// created the key, `false` when it already existed.
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BufferError>;

    /// Atomically append a message to the buffer state at `key`: push onto
    /// the message list, bump the monotonic counter and size estimate,
    /// extend the deadline to `max(current, deadline_ms)`, refresh the TTL.
    ///
    /// Returns the new message count, or `None` when the key is absent (the
    /// caller should then contend for buffer creation instead).
    async fn append_message(
        &self,
        key: &str,
        message_json: &str,
        deadline_ms: i64,
        ttl: Duration,
    ) -> Result<Option<u64>, BufferError>;

    /// Delete `key`. Returns `true` when something was removed.
    async fn delete(&self, key: &str) -> Result<bool, BufferError>;

    /// Append `record` to the log at `key`, trimming it to the newest
    /// `max_len` entries (oldest dropped first).
    async fn append_log(&self, key: &str, record: &str, max_len: u64) -> Result<(), BufferError>;

    /// Read every record currently in the log at `key`, oldest first.
    async fn read_log(&self, key: &str) -> Result<Vec<String>, BufferError>;
}

/// Server-side append: push, bump counters, extend deadline to max, re-set
/// with a fresh TTL. Runs as one atomic unit inside Redis.
///
/// Stored state always holds at least one message (buffers are deleted
/// rather than emptied), so cjson never sees an empty message list it would
/// re-encode as an object.
const APPEND_MESSAGE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return false
end
local state = cjson.decode(raw)
table.insert(state['messages'], cjson.decode(ARGV[1]))
state['total_messages'] = state['total_messages'] + 1
state['approx_size_bytes'] = state['approx_size_bytes'] + string.len(ARGV[1])
local deadline = tonumber(ARGV[2])
if deadline > state['deadline'] then
  state['deadline'] = deadline
end
redis.call('SET', KEYS[1], cjson.encode(state), 'EX', tonumber(ARGV[3]))
return #state['messages']
"#;

/// Redis-backed store using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    append_script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, BufferError> {
        let client = redis::Client::open(url)
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;

        info!(url = %url, "Connected to Redis backing store");

        Ok(Self {
            conn,
            append_script: Script::new(APPEND_MESSAGE_SCRIPT),
        })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // Redis EX takes whole seconds; round up so the TTL never undercuts
        // the requested lifetime.
        ttl.as_secs_f64().ceil().max(1.0) as u64
    }
}

#[async_trait]
impl BufferStore for RedisStore {
    async fn read(&self, key: &str) -> Result<Option<String>, BufferError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BufferError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))
    }

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BufferError> {
        let mut conn = self.conn.clone();
        // SET NX EX returns OK on creation and nil when the key exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn append_message(
        &self,
        key: &str,
        message_json: &str,
        deadline_ms: i64,
        ttl: Duration,
    ) -> Result<Option<u64>, BufferError> {
        let mut conn = self.conn.clone();
        let appended: Option<u64> = self
            .append_script
            .key(key)
            .arg(message_json)
            .arg(deadline_ms)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        Ok(appended)
    }

    async fn delete(&self, key: &str) -> Result<bool, BufferError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn append_log(&self, key: &str, record: &str, max_len: u64) -> Result<(), BufferError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("RPUSH").arg(key).arg(record).ignore();
        if max_len > 0 {
            pipe.cmd("LTRIM")
                .arg(key)
                .arg(-(max_len as i64))
                .arg(-1)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))
    }

    async fn read_log(&self, key: &str) -> Result<Vec<String>, BufferError> {
        let mut conn = self.conn.clone();
        let records: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| BufferError::StoreUnavailable(e.to_string()))?;
        Ok(records)
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process store with the same contract as [`RedisStore`], including lazy
/// TTL expiry and atomic append semantics (one mutex hold per operation).
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    logs: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live (non-expired) entry, dropping it if the TTL lapsed.
    fn live_value(entries: &mut HashMap<String, MemoryEntry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl BufferStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, BufferError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BufferError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BufferError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn append_message(
        &self,
        key: &str,
        message_json: &str,
        deadline_ms: i64,
        ttl: Duration,
    ) -> Result<Option<u64>, BufferError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(raw) = Self::live_value(&mut entries, key) else {
            return Ok(None);
        };

        let mut state = BufferState::decode(&raw).map_err(|e| BufferError::Serialization {
            buffer_id: key.to_string(),
            message: e.to_string(),
        })?;
        let message: BufferedMessage =
            serde_json::from_str(message_json).map_err(|e| BufferError::Serialization {
                buffer_id: key.to_string(),
                message: e.to_string(),
            })?;

        state.messages.push(message);
        state.total_messages += 1;
        state.approx_size_bytes += message_json.len() as u64;
        let deadline = DateTime::<Utc>::from_timestamp_millis(deadline_ms)
            .unwrap_or(state.deadline);
        if deadline > state.deadline {
            state.deadline = deadline;
        }
        let count = state.messages.len() as u64;

        let encoded = state.encode().map_err(|e| BufferError::Serialization {
            buffer_id: key.to_string(),
            message: e.to_string(),
        })?;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: encoded,
                expires_at: Instant::now() + ttl,
            },
        );

        debug!(key = %key, count = count, "appended message in-memory");
        Ok(Some(count))
    }

    async fn delete(&self, key: &str) -> Result<bool, BufferError> {
        let mut entries = self.entries.lock().unwrap();
        let existed = Self::live_value(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn append_log(&self, key: &str, record: &str, max_len: u64) -> Result<(), BufferError> {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(key.to_string()).or_default();
        log.push_back(record.to_string());
        if max_len > 0 {
            while log.len() as u64 > max_len {
                log.pop_front();
            }
        }
        Ok(())
    }

    async fn read_log(&self, key: &str) -> Result<Vec<String>, BufferError> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(key)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }
}
