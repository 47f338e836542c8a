//! Partition-ordered event queue for the Statevar engine.
//!
//! The [`PartitionedQueue`] serializes event consumption per partition key
//! (`domain::entity_id` by default) while letting unrelated partitions run
//! concurrently. Within one partition, consumer invocation *N+1* does not
//! begin until invocation *N* has settled -- succeeded, failed, or been
//! abandoned by its caller. A failing consumer never poisons its
//! partition; subsequent events on the same key are still attempted.

pub mod queue;

pub use queue::{PartitionedQueue, QueueError};
