//! Debounce/batch scheduler.
//!
//! Collects items for a fixed delay counted from the first accepted item
//! (no idle reset), then hands the whole batch to the consumer exactly once,
//! in acceptance order. Deliveries are serialized: a new window's delivery
//! waits for the previous consumer invocation to finish, so the consumer
//! never runs concurrently with itself.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives each closed batch exactly once.
#[async_trait]
pub trait BatchConsumer<T>: Send + Sync {
    async fn accept(&self, batch: Vec<T>);
}

struct Inner<T> {
    queue: Vec<T>,
    /// A timer is armed for the current window.
    armed: bool,
    /// Handle of the most recent delivery task.
    handle: Option<JoinHandle<()>>,
    /// Fires the armed timer early (shutdown flush).
    flush: Option<Arc<Notify>>,
    closed: bool,
}

/// Time-windowed batch accumulator, generic over the item type.
pub struct DelayedBatch<T> {
    delay: Duration,
    consumer: Arc<dyn BatchConsumer<T>>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Send + 'static> DelayedBatch<T> {
    pub fn new(delay: Duration, consumer: Arc<dyn BatchConsumer<T>>) -> Self {
        Self {
            delay,
            consumer,
            inner: Arc::new(Mutex::new(Inner {
                queue: Vec::new(),
                armed: false,
                handle: None,
                flush: None,
                closed: false,
            })),
        }
    }

    /// Append an item to the open batch, opening one (and arming the window
    /// timer) if none is open. Items accepted after `join` are dropped.
    pub fn accept(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            debug!("batch scheduler closed, dropping item");
            return;
        }
        inner.queue.push(item);
        if !inner.armed {
            self.arm(&mut inner);
        }
    }

    /// Force delivery of any pending batch, wait for the consumer invocation
    /// to finish, and close the scheduler. Shutdown only.
    pub async fn join(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            if let Some(flush) = inner.flush.take() {
                flush.notify_one();
            }
            inner.handle.take()
        };
        if let Some(handle) = handle {
            // Delivery tasks are chained, so awaiting the most recent one
            // also waits out any still-running predecessor.
            let _ = handle.await;
        }
    }

    fn arm(&self, inner: &mut Inner<T>) {
        let notify = Arc::new(Notify::new());
        inner.armed = true;
        inner.flush = Some(Arc::clone(&notify));

        let previous = inner.handle.take();
        let shared = Arc::clone(&self.inner);
        let consumer = Arc::clone(&self.consumer);
        // Sample the deadline now so the window is counted from the accept
        // that opened it, not from the spawned task's first poll.
        let sleep = tokio::time::sleep(self.delay);

        inner.handle = Some(tokio::spawn(async move {
            tokio::select! {
                () = sleep => {}
                () = notify.notified() => {}
            }
            // Serialize with the previous window's consumer invocation.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let batch = {
                let mut inner = shared.lock();
                inner.armed = false;
                inner.flush = None;
                std::mem::take(&mut inner.queue)
            };
            if !batch.is_empty() {
                consumer.accept(batch).await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, advance};

    struct Recording {
        batches: Mutex<Vec<(Instant, Vec<&'static str>)>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BatchConsumer<&'static str> for Recording {
        async fn accept(&self, batch: Vec<&'static str>) {
            self.batches.lock().push((Instant::now(), batch));
        }
    }

    /// Lets the spawned timer tasks make progress under a paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_from_first_item() {
        let consumer = Recording::new();
        let batch = DelayedBatch::new(Duration::from_millis(100), consumer.clone());
        let start = Instant::now();

        batch.accept("a");
        advance(Duration::from_millis(50)).await;
        // a second accept must not reset the window
        batch.accept("b");
        advance(Duration::from_millis(49)).await;
        settle().await;
        assert!(consumer.batches.lock().is_empty());

        advance(Duration::from_millis(1)).await;
        settle().await;
        {
            let delivered = consumer.batches.lock();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].1, vec!["a", "b"]);
            assert_eq!(delivered[0].0 - start, Duration::from_millis(100));
        }

        // a later accept opens a fresh window
        advance(Duration::from_millis(50)).await;
        batch.accept("c");
        advance(Duration::from_millis(100)).await;
        settle().await;
        let delivered = consumer.batches.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].1, vec!["c"]);
        assert_eq!(delivered[1].0 - start, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn join_flushes_pending_batch() {
        let consumer = Recording::new();
        let batch = DelayedBatch::new(Duration::from_millis(100), consumer.clone());

        batch.accept("a");
        advance(Duration::from_millis(10)).await;
        batch.join().await;

        let delivered = consumer.batches.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn join_without_pending_batch_returns() {
        let consumer = Recording::new();
        let batch = DelayedBatch::new(Duration::from_millis(100), consumer.clone());
        batch.join().await;
        assert!(consumer.batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_after_join_never_delivers() {
        let consumer = Recording::new();
        let batch = DelayedBatch::new(Duration::from_millis(100), consumer.clone());

        batch.accept("a");
        batch.join().await;
        batch.accept("b");
        advance(Duration::from_millis(500)).await;
        settle().await;

        let delivered = consumer.batches.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_item_is_dropped_across_window_boundary() {
        let consumer = Recording::new();
        let batch = DelayedBatch::new(Duration::from_millis(100), consumer.clone());

        batch.accept("a");
        advance(Duration::from_millis(100)).await;
        settle().await;
        // this accept races the previous delivery; it must open a new window
        batch.accept("b");
        advance(Duration::from_millis(100)).await;
        settle().await;

        let delivered = consumer.batches.lock();
        let all: Vec<&str> = delivered.iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(all, vec!["a", "b"]);
        assert_eq!(delivered.len(), 2);
    }
}
