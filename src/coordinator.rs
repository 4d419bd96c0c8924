//! Debounce coordinator: the orchestrating state machine.
//!
//! Each call to [`DebounceCoordinator::add_message`] is one stateless
//! invocation. The first contributor to an absent buffer becomes the
//! *master*: it writes fresh state via an atomic set-if-absent, then polls
//! the store in bounded sleep increments until the deadline elapses, applies
//! the flush policy, and returns the full batch. Every later contributor is a
//! *slave*: its message and deadline extension are applied in a single atomic
//! store-side append and it returns immediately.
//!
//! The poll loop is the sole suspension point. Each iteration re-reads state
//! (slaves may have extended the deadline), checks the cooperative cancel
//! flag, and flushes early once the buffer reaches `max_size`. A buffer whose
//! deadline keeps being extended polls indefinitely; that is the point of
//! reset-on-activity debounce, not a defect.

use crate::audit::AuditLogWriter;
use crate::config::DebounceConfig;
use crate::error::BufferError;
use crate::policy::select_for_flush;
use crate::state::{
    deadline_after, BufferRole, BufferState, FlushResult, FlushTrigger, MessagePayload,
};
use crate::store::BufferStore;
use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How many append/create alternations an invocation attempts before giving
/// up on a settled election.
const ELECTION_ATTEMPTS: usize = 3;

/// Result of accepting one message into a buffer.
#[derive(Debug)]
pub struct AddMessageOutcome {
    pub buffer_id: String,
    pub message_id: Uuid,
    /// Whether this invocation ended up flushing (master) or only
    /// contributing (slave).
    pub role: BufferRole,
    pub accepted: bool,
    /// 1-based position of the message within the buffer at append time.
    pub position: u64,
    /// The flush produced by this invocation. Always `Some` for a master,
    /// always `None` for a slave (the batch is still pending).
    pub flush: Option<FlushResult>,
}

/// Deletes the shared buffer state if a master invocation is dropped
/// mid-poll (host abort), so no future invocation waits on a buffer that
/// will never be completed. Disarmed on every deliberate exit path.
struct CleanupGuard {
    store: Arc<dyn BufferStore>,
    key: String,
    armed: bool,
}

impl CleanupGuard {
    fn new(store: Arc<dyn BufferStore>, key: String) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match store.delete(&key).await {
                    Ok(_) => warn!(key = %key, "master aborted mid-poll; deleted orphaned buffer state"),
                    Err(e) => warn!(key = %key, error = %e, "cleanup delete after abort failed"),
                }
            });
        }
    }
}

/// Coordinates debounced buffering across stateless invocations through a
/// shared [`BufferStore`].
pub struct DebounceCoordinator {
    config: DebounceConfig,
    store: Arc<dyn BufferStore>,
    audit: AuditLogWriter,
}

impl DebounceCoordinator {
    /// Create a coordinator. Invalid configuration is rejected here and
    /// never reaches the store.
    pub fn new(config: DebounceConfig, store: Arc<dyn BufferStore>) -> Result<Self, BufferError> {
        config.validate()?;
        let audit = AuditLogWriter::new(Arc::clone(&store), &config);
        Ok(Self {
            config,
            store,
            audit,
        })
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Accept a message into the buffer for `buffer_id`.
    ///
    /// If the buffer exists, the message is appended atomically, the deadline
    /// is extended forward (never shortened), and the call returns
    /// immediately with [`BufferRole::Slave`]. If the buffer is absent, this
    /// invocation becomes the master: the call blocks through the debounce
    /// window and returns the [`FlushResult`] in the outcome.
    #[instrument(skip(self, payload), fields(buffer_id = %buffer_id))]
    pub async fn add_message(
        &self,
        buffer_id: &str,
        payload: impl Into<MessagePayload>,
    ) -> Result<AddMessageOutcome, BufferError> {
        let message = payload.into().into_message();
        let message_id = message.id;
        let key = self.config.buffer_key(buffer_id);
        let audit_key = self.config.audit_key(buffer_id);
        let window = self.config.debounce_window();
        let ttl = self.config.state_ttl(window);
        let message_json =
            serde_json::to_string(&message).map_err(|e| BufferError::Serialization {
                buffer_id: buffer_id.to_string(),
                message: e.to_string(),
            })?;

        for attempt in 0..ELECTION_ATTEMPTS {
            // Existing buffer: contribute atomically and return.
            let deadline_ms = deadline_after(Utc::now(), window).timestamp_millis();
            if let Some(position) = self
                .store
                .append_message(&key, &message_json, deadline_ms, ttl)
                .await?
            {
                debug!(position = position, "joined existing buffer as slave");
                self.audit
                    .record_message(&audit_key, buffer_id, &message, BufferRole::Slave)
                    .await;
                return Ok(AddMessageOutcome {
                    buffer_id: buffer_id.to_string(),
                    message_id,
                    role: BufferRole::Slave,
                    accepted: true,
                    position,
                    flush: None,
                });
            }

            // Absent buffer: contend for mastership with set-if-absent, so
            // only one of two racing creators can win.
            let state = BufferState::new(
                message.clone(),
                self.config.pattern,
                self.config.max_size,
                window,
            );
            let encoded = state.encode().map_err(|e| BufferError::Serialization {
                buffer_id: buffer_id.to_string(),
                message: e.to_string(),
            })?;
            if self.store.create(&key, &encoded, ttl).await? {
                info!(
                    window_ms = window.as_millis() as u64,
                    pattern = self.config.pattern.as_str(),
                    "elected master for buffer"
                );
                self.audit
                    .record_message(&audit_key, buffer_id, &message, BufferRole::Master)
                    .await;
                let flush = self.run_master(buffer_id, &key).await?;
                return Ok(AddMessageOutcome {
                    buffer_id: buffer_id.to_string(),
                    message_id,
                    role: BufferRole::Master,
                    accepted: true,
                    position: 1,
                    flush: Some(flush),
                });
            }

            // Another creator won between our append and create; append to
            // their buffer on the next pass.
            debug!(attempt = attempt, "lost buffer creation race; retrying as slave");
        }

        warn!(
            attempts = ELECTION_ATTEMPTS,
            "every buffer creation attempt lost to a concurrent creator"
        );
        Err(BufferError::ElectionContended(buffer_id.to_string()))
    }

    /// Manual flush override, usable independent of the debounce wait.
    /// Flushing an absent buffer yields an empty result.
    #[instrument(skip(self), fields(buffer_id = %buffer_id))]
    pub async fn flush(
        &self,
        buffer_id: &str,
        trigger: FlushTrigger,
    ) -> Result<FlushResult, BufferError> {
        let key = self.config.buffer_key(buffer_id);
        match self.read_state(buffer_id, &key).await? {
            Some(state) => self.flush_state(buffer_id, &key, state, trigger).await,
            None => Ok(FlushResult {
                flushed_messages: Vec::new(),
                remaining_messages: Vec::new(),
                trigger,
                flush_time: Utc::now(),
                processing_time: Duration::ZERO,
            }),
        }
    }

    /// Read-only inspection of the current buffer state. Idempotent, no side
    /// effects; undecodable stored state reads as absent.
    pub async fn get_buffer(&self, buffer_id: &str) -> Result<Option<BufferState>, BufferError> {
        let key = self.config.buffer_key(buffer_id);
        self.read_state(buffer_id, &key).await
    }

    /// Delete all state for `buffer_id`. An in-flight master observes the
    /// vanished key and fails with [`BufferError::BufferVanished`] rather
    /// than returning an empty batch.
    pub async fn clear_buffer(&self, buffer_id: &str) -> Result<bool, BufferError> {
        let existed = self.store.delete(&self.config.buffer_key(buffer_id)).await?;
        let _ = self.store.delete(&self.config.cancel_key(buffer_id)).await;
        info!(buffer_id = %buffer_id, existed = existed, "cleared buffer");
        Ok(existed)
    }

    /// Set the cooperative cancellation flag. The master poll loop consults
    /// it each iteration; on observation it deletes the buffer and fails
    /// with [`BufferError::Cancelled`], dropping accumulated messages.
    pub async fn cancel_buffer(&self, buffer_id: &str) -> Result<(), BufferError> {
        let ttl = self.config.state_ttl(self.config.debounce_window());
        self.store
            .write(&self.config.cancel_key(buffer_id), "1", ttl)
            .await?;
        info!(buffer_id = %buffer_id, "cancellation requested");
        Ok(())
    }

    /// Clear the cooperative cancellation flag. Effective only if no master
    /// has observed it yet.
    pub async fn resume_buffer(&self, buffer_id: &str) -> Result<(), BufferError> {
        self.store.delete(&self.config.cancel_key(buffer_id)).await?;
        info!(buffer_id = %buffer_id, "cancellation flag cleared");
        Ok(())
    }

    /// The master poll loop: sleep in bounded increments, re-observe state
    /// (slaves extend the deadline), flush once the deadline elapses or the
    /// buffer fills.
    async fn run_master(&self, buffer_id: &str, key: &str) -> Result<FlushResult, BufferError> {
        let poll_interval = self.config.poll_interval();
        let mut guard = CleanupGuard::new(Arc::clone(&self.store), key.to_string());

        loop {
            if self.cancel_requested(buffer_id).await {
                guard.disarm();
                let _ = self.store.delete(key).await;
                let _ = self.store.delete(&self.config.cancel_key(buffer_id)).await;
                warn!(buffer_id = %buffer_id, "master cancelled; dropping accumulated messages");
                return Err(BufferError::Cancelled(buffer_id.to_string()));
            }

            let state = match self.read_state_with_retry(buffer_id, key).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    // The key was deleted out from under us. This is data
                    // loss, not an empty batch.
                    guard.disarm();
                    error!(buffer_id = %buffer_id, "buffer state vanished mid-poll");
                    return Err(BufferError::BufferVanished(buffer_id.to_string()));
                }
                Err(e) => {
                    // Persistent store failure: abort the poll but leave the
                    // accumulated state for a later invocation to recover.
                    guard.disarm();
                    return Err(e);
                }
            };

            if state.messages.len() >= state.max_size {
                guard.disarm();
                return self
                    .flush_state(buffer_id, key, state, FlushTrigger::Size)
                    .await;
            }

            let remaining = state.time_remaining(Utc::now());
            if remaining.is_zero() {
                // This freshly-read state is the authoritative final list.
                guard.disarm();
                return self
                    .flush_state(buffer_id, key, state, FlushTrigger::Time)
                    .await;
            }

            tokio::time::sleep(remaining.min(poll_interval)).await;
        }
    }

    /// Apply the flush policy and persist the outcome: the remainder replaces
    /// the state under a fresh window, or the key is deleted when nothing
    /// remains.
    async fn flush_state(
        &self,
        buffer_id: &str,
        key: &str,
        mut state: BufferState,
        trigger: FlushTrigger,
    ) -> Result<FlushResult, BufferError> {
        let started = Instant::now();
        let window = self.config.debounce_window();

        let messages = std::mem::take(&mut state.messages);
        let selection = select_for_flush(
            state.pattern,
            messages,
            state.max_size,
            self.config.priority_levels,
        );

        if selection.retained.is_empty() {
            self.store.delete(key).await?;
        } else {
            let remainder = state.with_remainder(selection.retained.clone(), window);
            let encoded = remainder.encode().map_err(|e| BufferError::Serialization {
                buffer_id: buffer_id.to_string(),
                message: e.to_string(),
            })?;
            self.store
                .write(key, &encoded, self.config.state_ttl(window))
                .await?;
        }

        let result = FlushResult {
            flushed_messages: selection.flushed,
            remaining_messages: selection.retained,
            trigger,
            flush_time: Utc::now(),
            processing_time: started.elapsed(),
        };

        info!(
            buffer_id = %buffer_id,
            flushed = result.flushed_messages.len(),
            retained = result.remaining_messages.len(),
            trigger = trigger.as_str(),
            "flushed buffer"
        );
        self.audit
            .record_flush(&self.config.audit_key(buffer_id), buffer_id, &result)
            .await;
        Ok(result)
    }

    /// Single-attempt read with decode tolerance: invalid stored state reads
    /// as absent, logged as a warning, never retried.
    async fn read_state(
        &self,
        buffer_id: &str,
        key: &str,
    ) -> Result<Option<BufferState>, BufferError> {
        let Some(raw) = self.store.read(key).await? else {
            return Ok(None);
        };
        match BufferState::decode(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(buffer_id = %buffer_id, error = %e, "stored state undecodable; treating as absent");
                Ok(None)
            }
        }
    }

    /// Poll-loop read: transient store errors are retried with exponential
    /// backoff inside the configured budget before surfacing.
    async fn read_state_with_retry(
        &self,
        buffer_id: &str,
        key: &str,
    ) -> Result<Option<BufferState>, BufferError> {
        let strategy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.config.store_retry_budget()),
            ..Default::default()
        };
        let raw = retry(strategy, || async {
            self.store.read(key).await.map_err(|e| {
                warn!(buffer_id = %buffer_id, error = %e, "transient store read failed; retrying");
                BackoffError::transient(e)
            })
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match BufferState::decode(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(buffer_id = %buffer_id, error = %e, "stored state undecodable; treating as absent");
                Ok(None)
            }
        }
    }

    /// Best-effort check of the cooperative cancel flag; a store error here
    /// never aborts the poll.
    async fn cancel_requested(&self, buffer_id: &str) -> bool {
        match self.store.read(&self.config.cancel_key(buffer_id)).await {
            Ok(flag) => flag.is_some(),
            Err(e) => {
                warn!(buffer_id = %buffer_id, error = %e, "could not read cancel flag");
                false
            }
        }
    }
}
