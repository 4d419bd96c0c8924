//! Coalesce - debounced message buffering over a shared store
//!
//! This library accumulates bursts of rapid, closely-spaced messages that
//! belong to the same logical conversation and delivers them downstream as a
//! single consolidated batch after a period of inactivity. No long-lived
//! process hosts a timer: every call is a stateless, ephemeral invocation
//! that coordinates with past, concurrent, and future invocations purely
//! through a shared Redis-compatible store.
//!
//! The first contributor to an absent buffer is elected *master* and blocks
//! through the debounce window; every later contributor is a *slave* that
//! appends its message, extends the deadline, and returns immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! use coalesce::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(RedisStore::connect("redis://127.0.0.1/").await?);
//!     let coordinator = DebounceCoordinator::new(DebounceConfig::default(), store)?;
//!
//!     // Blocks until the window elapses if this call wins the election;
//!     // returns immediately with a pending indicator otherwise.
//!     let outcome = coordinator.add_message("conv-42", "hello").await?;
//!     if let Some(flush) = outcome.flush {
//!         println!("delivered {} messages", flush.flushed_messages.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod state;
pub mod store;

// Re-export main types
pub use audit::AuditLogWriter;
pub use config::{DebounceConfig, FlushPattern};
pub use coordinator::{AddMessageOutcome, DebounceCoordinator};
pub use error::BufferError;
pub use policy::{select_for_flush, FlushSelection};
pub use state::{
    BufferRole, BufferState, BufferedMessage, FlushResult, FlushTrigger, MessagePayload,
};
pub use store::{BufferStore, MemoryStore, RedisStore};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{DebounceConfig, FlushPattern};
    pub use crate::coordinator::{AddMessageOutcome, DebounceCoordinator};
    pub use crate::error::BufferError;
    pub use crate::state::{BufferRole, FlushResult, FlushTrigger, MessagePayload};
    pub use crate::store::{BufferStore, MemoryStore, RedisStore};
}
