//! Error taxonomy for buffer coordination.
//!
//! The crate distinguishes four failure classes with different handling
//! contracts:
//!
//! - [`BufferError::StoreUnavailable`]: I/O to the backing store failed.
//!   Retryable; the master poll loop retries reads internally with backoff,
//!   slaves surface it to the caller after the operation's own attempt.
//! - [`BufferError::BufferVanished`]: state was deleted out from under an
//!   active master. Always fatal, never treated as "nothing to flush".
//! - [`BufferError::ConfigurationInvalid`]: rejected at construction, never
//!   reaches the store.
//! - [`BufferError::Serialization`]: state could not be encoded for storage.
//!   Undecodable state on *read* is downgraded to absent and logged, not
//!   surfaced through this variant.

use thiserror::Error;

/// Errors surfaced by the debounce coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum BufferError {
    /// I/O to the backing store failed after exhausting any retry budget.
    #[error("store operation failed: {0}")]
    StoreUnavailable(String),

    /// Buffer state was deleted while a master was waiting to flush it.
    ///
    /// This indicates the accumulated batch is gone; callers must not
    /// interpret it as an empty flush.
    #[error("buffer '{0}' vanished while a flush was pending")]
    BufferVanished(String),

    /// Configuration was rejected before any store interaction.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Buffer state could not be encoded for storage.
    #[error("failed to serialize state for buffer '{buffer_id}': {message}")]
    Serialization {
        buffer_id: String,
        message: String,
    },

    /// A cooperative cancellation flag stopped the master before its flush.
    ///
    /// Messages accumulated so far are dropped; no new master is elected.
    #[error("buffer '{0}' was cancelled before its flush completed")]
    Cancelled(String),

    /// Every append/create alternation lost to a concurrent creator.
    ///
    /// The store itself was reachable throughout; retrying the call is
    /// expected to settle once the racing creators' buffers stabilize.
    #[error("election for buffer '{0}' did not settle")]
    ElectionContended(String),
}

impl BufferError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BufferError::StoreUnavailable(_) | BufferError::ElectionContended(_)
        )
    }
}
