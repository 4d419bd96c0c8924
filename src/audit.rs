//! Best-effort audit log writer.
//!
//! One record per accepted message and one per flush event, appended to a
//! namespaced log trimmed to a bounded length. Audit writes never fail the
//! primary buffer or flush path; failures are logged and swallowed.

use crate::config::DebounceConfig;
use crate::state::{BufferRole, BufferedMessage, FlushResult};
use crate::store::BufferStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Serialize)]
struct MessageRecord<'a> {
    kind: &'static str,
    at: DateTime<Utc>,
    buffer_id: &'a str,
    message_id: uuid::Uuid,
    role: &'static str,
    priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    originator_id: Option<&'a str>,
}

#[derive(Serialize)]
struct FlushRecord<'a> {
    kind: &'static str,
    at: DateTime<Utc>,
    buffer_id: &'a str,
    trigger: &'static str,
    flushed: usize,
    retained: usize,
    processing_ms: u128,
}

/// Writes audit records through the store adapter's append-only log.
pub struct AuditLogWriter {
    store: Arc<dyn BufferStore>,
    enabled: bool,
    max_length: u64,
}

impl AuditLogWriter {
    pub fn new(store: Arc<dyn BufferStore>, config: &DebounceConfig) -> Self {
        Self {
            store,
            enabled: config.enable_audit_log,
            max_length: config.audit_log_max_length,
        }
    }

    /// Record an accepted message. Never fails the caller.
    pub async fn record_message(
        &self,
        log_key: &str,
        buffer_id: &str,
        message: &BufferedMessage,
        role: BufferRole,
    ) {
        if !self.enabled {
            return;
        }
        let record = MessageRecord {
            kind: "message",
            at: Utc::now(),
            buffer_id,
            message_id: message.id,
            role: role.as_str(),
            priority: message.priority,
            originator_id: message.originator_id.as_deref(),
        };
        self.append(log_key, buffer_id, &record).await;
    }

    /// Record a flush event. Never fails the caller.
    pub async fn record_flush(&self, log_key: &str, buffer_id: &str, result: &FlushResult) {
        if !self.enabled {
            return;
        }
        let record = FlushRecord {
            kind: "flush",
            at: result.flush_time,
            buffer_id,
            trigger: result.trigger.as_str(),
            flushed: result.flushed_messages.len(),
            retained: result.remaining_messages.len(),
            processing_ms: result.processing_time.as_millis(),
        };
        self.append(log_key, buffer_id, &record).await;
    }

    async fn append<R: Serialize>(&self, log_key: &str, buffer_id: &str, record: &R) {
        let encoded = match serde_json::to_string(record) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(buffer_id = %buffer_id, error = %e, "failed to encode audit record");
                return;
            }
        };
        if let Err(e) = self.store.append_log(log_key, &encoded, self.max_length).await {
            warn!(buffer_id = %buffer_id, error = %e, "audit log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BufferError;
    use crate::state::MessagePayload;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store whose log writes always fail; everything else delegates.
    struct BrokenLogStore(MemoryStore);

    #[async_trait]
    impl BufferStore for BrokenLogStore {
        async fn read(&self, key: &str) -> Result<Option<String>, BufferError> {
            self.0.read(key).await
        }
        async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BufferError> {
            self.0.write(key, value, ttl).await
        }
        async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BufferError> {
            self.0.create(key, value, ttl).await
        }
        async fn append_message(
            &self,
            key: &str,
            message_json: &str,
            deadline_ms: i64,
            ttl: Duration,
        ) -> Result<Option<u64>, BufferError> {
            self.0.append_message(key, message_json, deadline_ms, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool, BufferError> {
            self.0.delete(key).await
        }
        async fn append_log(&self, _: &str, _: &str, _: u64) -> Result<(), BufferError> {
            Err(BufferError::StoreUnavailable("log shard down".into()))
        }
        async fn read_log(&self, key: &str) -> Result<Vec<String>, BufferError> {
            self.0.read_log(key).await
        }
    }

    #[tokio::test]
    async fn test_records_message_and_flush() {
        let store = Arc::new(MemoryStore::new());
        let config = DebounceConfig::default();
        let writer = AuditLogWriter::new(store.clone(), &config);

        let message = MessagePayload::new("hello").priority(1).into_message();
        writer
            .record_message("ns:audit:b1", "b1", &message, BufferRole::Slave)
            .await;

        let records = store.read_log("ns:audit:b1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("\"kind\":\"message\""));
        assert!(records[0].contains("\"role\":\"slave\""));
    }

    #[tokio::test]
    async fn test_disabled_writer_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let config = DebounceConfig {
            enable_audit_log: false,
            ..Default::default()
        };
        let writer = AuditLogWriter::new(store.clone(), &config);

        let message = MessagePayload::new("hello").into_message();
        writer
            .record_message("ns:audit:b1", "b1", &message, BufferRole::Master)
            .await;
        assert!(store.read_log("ns:audit:b1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_failure_is_swallowed() {
        let store = Arc::new(BrokenLogStore(MemoryStore::new()));
        let config = DebounceConfig::default();
        let writer = AuditLogWriter::new(store, &config);

        let message = MessagePayload::new("hello").into_message();
        // Must not panic or propagate.
        writer
            .record_message("ns:audit:b1", "b1", &message, BufferRole::Slave)
            .await;
    }
}
