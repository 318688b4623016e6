//! # Tributary Coordination
//!
//! Lease-based partition coordination for sharded change-log ingestion.
//!
//! A *partition* is the unit of exclusive ownership over one shard of a
//! change-log stream. Workers acquire partitions through a
//! [`SourceCoordinator`], which guarantees that at most one worker holds a
//! given partition at a time, persists per-partition progress, and tracks
//! the partition lifecycle (`Pending` → `Leased` → `Completed`, with
//! surrender returning a partition to `Pending` for retry).
//!
//! The coordinator is a boundary: production deployments back it with a
//! shared store, while [`InMemoryCoordinator`] provides full lease semantics
//! in-process for embedded use and tests.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod partition;

pub use coordinator::{backfill_done_key, SourceCoordinator};
pub use error::{CoordinationError, CoordinationResult};
pub use memory::InMemoryCoordinator;
pub use partition::{PartitionStatus, ProgressState, ShardPartition};
