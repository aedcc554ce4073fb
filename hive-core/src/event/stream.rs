use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::envelope::AgentEvent;
use super::filter::EventFilter;

/// The queue half shared between the bus listener (producer side) and an
/// [`EventSubscription`] (consumer side).
///
/// Filtering happens at enqueue time, so the bounded queue only ever
/// holds events the subscriber asked for; of N matching events published,
/// the subscriber sees at most N, oldest dropped first on overflow.
pub(super) struct SubscriberShared {
    queue: Mutex<VecDeque<AgentEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    filter: EventFilter,
    dropped_local: AtomicUsize,
    dropped_bus: Arc<AtomicUsize>,
}

impl SubscriberShared {
    pub(super) fn new(
        capacity: usize,
        filter: EventFilter,
        dropped_bus: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            filter,
            dropped_local: AtomicUsize::new(0),
            dropped_bus,
        })
    }

    /// Called from the bus listener. Non-matching events are skipped; a
    /// full queue drops its oldest entry and advances the drop counters.
    pub(super) fn enqueue(&self, event: &AgentEvent) {
        if self.is_closed() || !self.filter.matches(event) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped_local.fetch_add(1, Ordering::Relaxed);
                self.dropped_bus.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "hive::event",
                    total_dropped = self.dropped_local.load(Ordering::Relaxed),
                    "subscriber queue overflow; oldest event dropped"
                );
            }
            queue.push_back(event.clone());
        }
        self.notify.notify_one();
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<AgentEvent> {
        self.queue.lock().pop_front()
    }
}

/// One subscriber's view of the bus: a bounded FIFO of matching events.
///
/// Dropping or [`close`](Self::close)-ing the subscription unsubscribes;
/// the bus prunes closed queues on its next publish.
pub struct EventSubscription {
    shared: Arc<SubscriberShared>,
}

impl EventSubscription {
    pub(super) fn new(shared: Arc<SubscriberShared>) -> Self {
        Self { shared }
    }

    /// Receive the next matching event, awaiting if necessary. Returns
    /// `None` once the subscription (or the bus) is closed and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            if let Some(event) = self.shared.pop() {
                return Some(event);
            }
            if self.shared.is_closed() {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Pop a queued event without awaiting.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.shared.pop()
    }

    /// Wait up to `duration` for the next matching event.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<AgentEvent> {
        timeout(duration, self.recv()).await.ok().flatten()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Convert into a boxed async stream of matching events, ending when
    /// the subscription closes.
    pub fn into_async_stream(self) -> BoxStream<'static, AgentEvent> {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
        .boxed()
    }

    /// Events dropped from this subscription's queue due to overflow.
    pub fn dropped(&self) -> usize {
        self.shared.dropped_local.load(Ordering::Relaxed)
    }

    /// Unsubscribe. Idempotent: closing twice is a no-op, and a closed
    /// subscription's `recv` drains the queue then returns `None`.
    pub fn close(&mut self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}
