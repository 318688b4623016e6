//! # Tributary Ingest
//!
//! Ingests a sharded, ordered change-log stream into a downstream pipeline
//! with at-least-once delivery.
//!
//! A stream is split into shards that close and split into children over
//! time. Each shard is consumed by at most one worker at a time, enforced
//! by lease-based coordination (`tributary-coordination`). Progress is
//! committed only up to the point the downstream pipeline has durably
//! accepted — acknowledged, not merely read.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────┐   acquire/complete/surrender
//!            │ StreamScheduler├──────────────────────────────┐
//!            └───────┬────────┘                              ▼
//!        spawn per leased shard                      ┌───────────────┐
//!            ┌───────▼────────┐  save progress       │  Coordinator  │
//!            │ ShardConsumer  │  (non-ack mode)      └───────▲───────┘
//!            └───────┬────────┘                              │
//!     register checkpoint per flush                  commit / surrender
//!            ┌───────▼────────┐                              │
//!            │   AckTracker   ├──────────────────────────────┘
//!            └────────────────┘  drains positively-acknowledged prefix
//! ```
//!
//! The [`StreamScheduler`] leases shards and runs a [`ShardConsumer`] per
//! lease on a bounded worker set. In acknowledgement mode every flush to
//! the downstream buffer registers a checkpoint with the [`AckTracker`],
//! whose monitor loop commits the longest contiguous positively-
//! acknowledged prefix per shard — a pending head blocks all commits, a
//! negative or timed-out head surrenders the shard. When a consumer
//! finishes, the scheduler registers the shard's children with the
//! coordinator before marking the parent completed, so lineage survives a
//! crash between the two steps.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod acks;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod memory;
pub mod metrics;
pub mod record;
pub mod scheduler;
pub mod source;
pub mod tracker;

pub use acks::{AckOutcomeCallback, AckSet, AckSetFactory};
pub use buffer::{BufferError, SinkBuffer};
pub use checkpoint::{AckOutcome, CheckpointStatus, ShardCheckpointer};
pub use config::IngestConfig;
pub use consumer::ShardConsumer;
pub use discovery::ShardDiscovery;
pub use error::IngestError;
pub use factory::ShardConsumerFactory;
pub use memory::InMemoryChangeLog;
pub use metrics::{IngestMetrics, IngestMetricsSnapshot};
pub use record::ChangeRecord;
pub use scheduler::StreamScheduler;
pub use source::{ChangeLogSource, CursorPosition, ShardCursor, ShardInfo, ShardPoll, SourceError};
pub use tracker::{AckTracker, ShardTrackingState};
