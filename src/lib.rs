//! # Scorecard Sync
//!
//! Namespace-scoped change synchronization for the tournament scoring
//! backend. Clients write through optimistic-concurrency mutations and read
//! back through a durable, globally versioned changelog, either by pulling
//! (with optional long-poll) or by listening to a push stream of version
//! numbers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use scorecard_sync::{MutationOp, SyncEngine};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::start_in_memory().await?;
//!
//!     // A client records a score it believes is new (base 0)
//!     engine
//!         .mutate("t1", "c1", vec![MutationOp::upsert("score", "5", json!({"strokes": 4}), 0)])
//!         .await?;
//!
//!     // Another client catches up from cursor 0
//!     let response = engine.sync("t1", 0, Duration::ZERO).await?;
//!     for change in &response.changes {
//!         println!("v{} {} {}/{}", change.version, change.op, change.entity_type, change.entity_id);
//!     }
//!
//!     // Next call resumes from the returned cursor, waiting up to 30s
//!     let _ = engine.sync("t1", response.version, Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Engine API** (`core`) - [`SyncEngine`], the cloneable facade
//! 2. **Mutation Processor** (`mutation`) - validation, conflict rule, atomic batches
//! 3. **Storage** (`storage`, `schema`, `sequencer`) - SQLite entity table,
//!    changelog and the global version counter
//! 4. **Broadcaster** (`subscriptions`) - in-memory "namespace advanced" fan-out
//! 5. **Read paths** (`sync`) - pull with long-poll, push stream
//! 6. **HTTP** (`http`) - axum router over the engine
//!
//! The durable tables are the source of truth. The broadcaster only shortens
//! the time until a waiting reader looks at them again, so a dropped
//! notification delays a client but never loses a change.

// Internal modules
mod core;
mod error;
mod types;

pub mod config;
pub mod mutation;
pub mod schema;
pub mod sequencer;
pub mod storage;
pub mod subscriptions;
pub mod sync;

// HTTP API (requires http feature)
#[cfg(feature = "http")]
pub mod http;

// Public API exports
pub use crate::core::{EngineStats, SyncEngine};
pub use config::{DeletePolicy, ServerConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use storage::{StoreStats, SyncStore};
pub use subscriptions::{Broadcaster, SubscriberId, Subscription};
pub use types::{
    ChangelogEntry, ConflictRef, Entity, EntityKey, MutateRequest, MutationOp, MutationOutcome,
    Op, SyncResponse,
};

// Re-export commonly used external types for convenience
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use scorecard_sync::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{DeletePolicy, SyncConfig};
    pub use crate::core::{EngineStats, SyncEngine};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::types::{
        ChangelogEntry, Entity, MutationOp, MutationOutcome, Op, SyncResponse,
    };
    pub use serde_json::{json, Value as JsonValue};
}
