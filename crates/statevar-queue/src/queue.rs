//! The partitioned queue implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use statevar_types::StateVariableEvent;

/// Errors surfaced by the queue's handle futures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The spawned consumer task failed (panicked or was aborted). The
    /// partition itself keeps draining.
    #[error("queue consumer task failed: {message}")]
    Consumer {
        /// Description of the task failure.
        message: String,
    },
}

/// The function that derives a partition key from an event.
type PartitionKeyFn = dyn Fn(&StateVariableEvent) -> String + Send + Sync;

/// The completion future of the newest enqueued event on a partition.
type TailFuture = Shared<BoxFuture<'static, ()>>;

/// Bookkeeping for one partition's newest tail.
struct PartitionTail {
    /// Sequence number of the enqueue that installed this tail.
    seq: u64,
    /// Settles when that enqueue's consumer has finished (or failed).
    done: TailFuture,
}

/// A queue that serializes consumption per partition key.
///
/// Enqueue registration is synchronous: the ordering of two `enqueue`
/// calls on the same key is fixed at call time, and execution proceeds on
/// spawned tasks whether or not the returned handle is awaited.
pub struct PartitionedQueue {
    partition_key: Arc<PartitionKeyFn>,
    tails: Arc<Mutex<HashMap<String, PartitionTail>>>,
    next_seq: AtomicU64,
}

impl Default for PartitionedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionedQueue {
    /// Create a queue partitioned by `domain::entity_id`.
    pub fn new() -> Self {
        Self {
            partition_key: Arc::new(|event: &StateVariableEvent| event.partition_key()),
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create a queue with a custom partition key function.
    pub fn with_partition_key<F>(key_fn: F) -> Self
    where
        F: Fn(&StateVariableEvent) -> String + Send + Sync + 'static,
    {
        Self {
            partition_key: Arc::new(key_fn),
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Enqueue one event for consumption on its partition.
    ///
    /// The consumer runs on a spawned task after the partition's previous
    /// invocation settles. The returned handle yields the consumer's
    /// result; dropping it does not cancel consumption.
    pub fn enqueue<C, Fut, T>(&self, event: StateVariableEvent, consumer: C) -> JoinHandle<T>
    where
        C: FnOnce(StateVariableEvent) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let key = (self.partition_key)(&event);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!(partition = %key, seq, event_id = %event.event_id, "enqueue");

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = {
            let mut tails = lock_tails(&self.tails);
            let previous = tails.get(&key).map(|tail| tail.done.clone());
            let done: TailFuture = async move {
                // A dropped sender (failed consumer) settles the tail too.
                let _ = done_rx.await;
            }
            .boxed()
            .shared();
            tails.insert(key.clone(), PartitionTail { seq, done });
            previous
        };

        let tails = Arc::clone(&self.tails);
        tokio::spawn(async move {
            if let Some(done) = previous {
                done.await;
            }
            let result = consumer(event).await;
            let _ = done_tx.send(());
            let mut guard = lock_tails(&tails);
            if guard.get(&key).is_some_and(|tail| tail.seq == seq) {
                guard.remove(&key);
            }
            result
        })
    }

    /// Enqueue a batch, preserving per-partition order across the batch,
    /// and await every result.
    ///
    /// Each element settles independently; a failed consumer task shows up
    /// as [`QueueError::Consumer`] in its slot without affecting the rest.
    pub async fn enqueue_batch<C, Fut, T>(
        &self,
        events: Vec<StateVariableEvent>,
        consumer: C,
    ) -> Vec<Result<T, QueueError>>
    where
        C: Fn(StateVariableEvent) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<JoinHandle<T>> = events
            .into_iter()
            .map(|event| self.enqueue(event, consumer.clone()))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|source| QueueError::Consumer {
                message: source.to_string(),
            }));
        }
        results
    }

    /// How many partitions still have unsettled work.
    ///
    /// Converges to zero once every outstanding consumer settles.
    pub fn pending_partitions(&self) -> usize {
        lock_tails(&self.tails).len()
    }
}

/// Lock the tail map, recovering from a poisoned mutex (a consumer panic
/// on another task must not wedge the queue).
fn lock_tails(
    tails: &Arc<Mutex<HashMap<String, PartitionTail>>>,
) -> MutexGuard<'_, HashMap<String, PartitionTail>> {
    tails.lock().unwrap_or_else(PoisonError::into_inner)
}
