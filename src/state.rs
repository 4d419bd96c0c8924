//! Buffer state model: the canonical in-flight buffer representation and its
//! JSON (de)serialization.
//!
//! One [`BufferState`] exists per `buffer_id` in the backing store. It is
//! created by the first contributor that observes an absent key, appended to
//! by every later contributor, shrunk only at flush time, and deleted when
//! nothing remains. The `deadline` field is serialized as epoch milliseconds
//! so the store's atomic append primitive can compare it numerically.

use crate::config::FlushPattern;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Role an invocation ends up playing for a given buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    /// The single invocation that waits out the window and flushes.
    Master,
    /// A contributor that appended its message and returned immediately.
    Slave,
}

impl BufferRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferRole::Master => "master",
            BufferRole::Slave => "slave",
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// The debounce window elapsed.
    Time,
    /// The buffer reached `max_size` before the window elapsed.
    Size,
    /// A caller invoked the manual flush override.
    Manual,
    /// A caller forced an urgent flush on priority grounds.
    Priority,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Time => "time",
            FlushTrigger::Size => "size",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Priority => "priority",
        }
    }
}

/// A single buffered message. Created once when appended, immutable
/// thereafter, destroyed when flushed or the buffer is cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Unique message ID. Random v4 so concurrent independent writers cannot
    /// collide.
    pub id: Uuid,
    /// Message content.
    pub content: String,
    /// When the message was accepted.
    pub timestamp: DateTime<Utc>,
    /// Priority, higher is more urgent. Defaults to 0.
    #[serde(default)]
    pub priority: u32,
    /// Optional caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Optional identifier of the contributor that appended the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator_id: Option<String>,
}

impl BufferedMessage {
    /// Approximate storage footprint of the message, in bytes.
    pub fn approx_size(&self) -> u64 {
        serde_json::to_string(self).map_or(0, |s| s.len() as u64)
    }
}

/// Builder-style payload for [`add_message`](crate::DebounceCoordinator::add_message).
#[derive(Debug, Clone)]
pub struct MessagePayload {
    content: String,
    priority: u32,
    metadata: Option<Value>,
    originator_id: Option<String>,
}

impl MessagePayload {
    /// Create a payload with the given content and default priority 0.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            priority: 0,
            metadata: None,
            originator_id: None,
        }
    }

    /// Set the message priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach caller-supplied metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Record which contributor appended the message.
    pub fn originator(mut self, originator_id: impl Into<String>) -> Self {
        self.originator_id = Some(originator_id.into());
        self
    }

    /// Materialize the payload into a stored message.
    pub(crate) fn into_message(self) -> BufferedMessage {
        BufferedMessage {
            id: Uuid::new_v4(),
            content: self.content,
            timestamp: Utc::now(),
            priority: self.priority,
            metadata: self.metadata,
            originator_id: self.originator_id,
        }
    }
}

impl From<&str> for MessagePayload {
    fn from(content: &str) -> Self {
        MessagePayload::new(content)
    }
}

impl From<String> for MessagePayload {
    fn from(content: String) -> Self {
        MessagePayload::new(content)
    }
}

/// The in-flight buffer for one `buffer_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferState {
    /// Flush policy the master applies when the window elapses.
    pub pattern: FlushPattern,
    /// Buffered messages in arrival order. Storage never reorders them.
    pub messages: Vec<BufferedMessage>,
    /// Monotonic count of every message ever accepted into this buffer.
    /// Never decreases, even across partial flushes.
    pub total_messages: u64,
    /// Absolute time after which the master should flush. Stored as epoch
    /// milliseconds so the store can extend it with a numeric max.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub deadline: DateTime<Utc>,
    /// When the buffer was created.
    pub created_at: DateTime<Utc>,
    /// When the buffer last flushed, if it ever did.
    #[serde(default)]
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Size cap the flush policies operate against.
    pub max_size: usize,
    /// Approximate accumulated message bytes.
    pub approx_size_bytes: u64,
}

impl BufferState {
    /// Fresh state holding a single message, deadline one window from now.
    pub fn new(
        message: BufferedMessage,
        pattern: FlushPattern,
        max_size: usize,
        window: Duration,
    ) -> Self {
        let now = Utc::now();
        let approx_size_bytes = message.approx_size();
        Self {
            pattern,
            messages: vec![message],
            total_messages: 1,
            deadline: deadline_after(now, window),
            created_at: now,
            last_flush_at: None,
            max_size,
            approx_size_bytes,
        }
    }

    /// Append a message and extend the deadline forward only, never
    /// shortening it. Mirrors the store's atomic append primitive; used by
    /// in-process backends.
    pub fn append(&mut self, message: BufferedMessage, window: Duration) {
        self.approx_size_bytes += message.approx_size();
        self.messages.push(message);
        self.total_messages += 1;
        let candidate = deadline_after(Utc::now(), window);
        if candidate > self.deadline {
            self.deadline = candidate;
        }
    }

    /// State carrying only the retained remainder after a partial flush.
    /// The monotonic counter and creation time survive; the deadline resets
    /// to one window from now.
    pub fn with_remainder(self, retained: Vec<BufferedMessage>, window: Duration) -> Self {
        let now = Utc::now();
        let approx_size_bytes = retained.iter().map(BufferedMessage::approx_size).sum();
        Self {
            messages: retained,
            deadline: deadline_after(now, window),
            last_flush_at: Some(now),
            approx_size_bytes,
            ..self
        }
    }

    /// Time left until the deadline, zero if it already elapsed.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Encode for storage.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored value. Callers treat failures as absent state.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// `now + window` with millisecond precision, matching the stored deadline
/// representation.
pub(crate) fn deadline_after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now + ChronoDuration::milliseconds(window.as_millis() as i64)
}

/// Outcome of one flush invocation. Produced once, not persisted beyond the
/// audit log.
#[derive(Debug, Clone, Serialize)]
pub struct FlushResult {
    /// Messages leaving the buffer now.
    pub flushed_messages: Vec<BufferedMessage>,
    /// Messages staying behind. Non-empty only for partial-flush policies.
    pub remaining_messages: Vec<BufferedMessage>,
    /// What caused the flush.
    pub trigger: FlushTrigger,
    /// When the flush completed.
    pub flush_time: DateTime<Utc>,
    /// Wall time spent selecting and persisting the flush.
    pub processing_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> BufferedMessage {
        MessagePayload::new(content).into_message()
    }

    #[test]
    fn test_new_state_deadline_in_future() {
        let state = BufferState::new(
            message("hello"),
            FlushPattern::CollectSend,
            10,
            Duration::from_secs(2),
        );
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.total_messages, 1);
        assert!(state.deadline > Utc::now());
        assert!(state.approx_size_bytes > 0);
    }

    #[test]
    fn test_append_extends_deadline_forward_only() {
        let mut state = BufferState::new(
            message("first"),
            FlushPattern::CollectSend,
            10,
            Duration::from_secs(60),
        );
        let original_deadline = state.deadline;

        // A shorter window must not pull the deadline back.
        state.append(message("second"), Duration::from_secs(1));
        assert_eq!(state.deadline, original_deadline);
        assert_eq!(state.total_messages, 2);

        // A longer window pushes it forward.
        state.append(message("third"), Duration::from_secs(120));
        assert!(state.deadline > original_deadline);
        assert_eq!(state.messages.len(), 3);
    }

    #[test]
    fn test_remainder_preserves_monotonic_counter() {
        let mut state = BufferState::new(
            message("a"),
            FlushPattern::Throttle,
            2,
            Duration::from_secs(2),
        );
        state.append(message("b"), Duration::from_secs(2));
        state.append(message("c"), Duration::from_secs(2));

        let retained = vec![state.messages[2].clone()];
        let remainder = state.with_remainder(retained, Duration::from_secs(2));

        assert_eq!(remainder.total_messages, 3);
        assert_eq!(remainder.messages.len(), 1);
        assert!(remainder.last_flush_at.is_some());
        assert!(remainder.deadline > Utc::now());
    }

    #[test]
    fn test_time_remaining_clamps_to_zero() {
        let mut state = BufferState::new(
            message("a"),
            FlushPattern::CollectSend,
            10,
            Duration::from_secs(1),
        );
        state.deadline = Utc::now() - ChronoDuration::seconds(5);
        assert_eq!(state.time_remaining(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn test_encode_decode_preserves_deadline_millis() {
        let state = BufferState::new(
            MessagePayload::new("payload")
                .priority(2)
                .originator("worker-7")
                .into_message(),
            FlushPattern::Priority,
            5,
            Duration::from_millis(1500),
        );
        let encoded = state.encode().unwrap();
        // Deadline must be a bare integer for the store-side numeric max.
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert!(value["deadline"].is_i64() || value["deadline"].is_u64());

        let decoded = BufferState::decode(&encoded).unwrap();
        assert_eq!(decoded.deadline.timestamp_millis(), state.deadline.timestamp_millis());
        assert_eq!(decoded.messages[0].priority, 2);
        assert_eq!(decoded.messages[0].originator_id.as_deref(), Some("worker-7"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(BufferState::decode("not json").is_err());
        assert!(BufferState::decode("{\"messages\": 3}").is_err());
    }
}
