use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task;

use super::envelope::AgentEvent;
use super::filter::EventFilter;
use super::sink::EventSink;
use super::stream::{EventSubscription, SubscriberShared};

/// Default per-subscriber queue depth.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000;

/// Snapshot of bus health for monitoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusMetrics {
    /// Maximum events buffered per subscriber before overflow.
    pub capacity: usize,
    /// Events published since the bus was created.
    pub published: usize,
    /// Events dropped across all subscribers due to overflow.
    pub dropped: usize,
}

/// Identity fields a scoped bus stamps onto every publish.
///
/// Only fields the publisher left unset are filled in, so a node can still
/// publish on behalf of a sibling by setting the field explicitly.
#[derive(Clone, Debug, Default)]
pub struct EventScope {
    pub graph_id: Option<String>,
    pub stream_id: Option<String>,
    pub execution_id: Option<String>,
    pub node_id: Option<String>,
}

impl EventScope {
    fn merged(&self, child: &EventScope) -> EventScope {
        EventScope {
            graph_id: child.graph_id.clone().or_else(|| self.graph_id.clone()),
            stream_id: child.stream_id.clone().or_else(|| self.stream_id.clone()),
            execution_id: child
                .execution_id
                .clone()
                .or_else(|| self.execution_id.clone()),
            node_id: child.node_id.clone().or_else(|| self.node_id.clone()),
        }
    }

    fn stamp(&self, event: &mut AgentEvent) {
        if event.graph_id.is_none() {
            event.graph_id = self.graph_id.clone();
        }
        if event.stream_id.is_empty() {
            if let Some(stream) = &self.stream_id {
                event.stream_id = stream.clone();
            }
        }
        if event.execution_id.is_none() {
            event.execution_id = self.execution_id.clone();
        }
        if event.node_id.is_none() {
            event.node_id = self.node_id.clone();
        }
    }
}

struct BusInner {
    ingress: flume::Sender<AgentEvent>,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
    listener: Mutex<Option<ListenerState>>,
    closed: AtomicBool,
    capacity: usize,
    published: AtomicUsize,
    dropped: Arc<AtomicUsize>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

/// Typed pub/sub bus for [`AgentEvent`]s.
///
/// Publishing goes through an unbounded ingress channel, so publishers
/// never block and never observe subscriber failures. A single listener
/// task drains the ingress in FIFO order, hands each event to the
/// registered sinks, then enqueues it onto every matching subscriber
/// queue. Each subscriber owns a bounded FIFO of `capacity` events; on
/// overflow the oldest event is dropped and the drop counters advance.
///
/// The bus is cheap to clone; clones share the ingress, subscribers, and
/// sinks. [`child`](Self::child) derives a clone that stamps scope
/// identity onto everything it publishes.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    scope: EventScope,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (ingress, egress) = flume::unbounded();
        let bus = Self {
            inner: Arc::new(BusInner {
                ingress,
                subscribers: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
                capacity,
                published: AtomicUsize::new(0),
                dropped: Arc::new(AtomicUsize::new(0)),
            }),
            scope: EventScope::default(),
        };
        bus.start_listener(egress);
        bus
    }

    fn start_listener(&self, egress: flume::Receiver<AgentEvent>) {
        let mut guard = self.inner.listener.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = egress.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => {
                            {
                                let mut sinks = inner.sinks.lock();
                                for sink in sinks.iter_mut() {
                                    if let Err(error) = sink.handle(&event) {
                                        tracing::warn!(
                                            target: "hive::event",
                                            sink = sink.name(),
                                            %error,
                                            "event sink failed; continuing"
                                        );
                                    }
                                }
                            }
                            let mut subscribers = inner.subscribers.lock();
                            subscribers.retain(|subscriber| !subscriber.is_closed());
                            for subscriber in subscribers.iter() {
                                subscriber.enqueue(&event);
                            }
                        }
                    }
                }
            }
        });
        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Publish an event. Never blocks and never fails from the publisher's
    /// point of view; overflow is accounted per subscriber.
    pub fn publish(&self, mut event: AgentEvent) {
        self.scope.stamp(&mut event);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if self.inner.ingress.send(event).is_err() {
            // Listener already shut down during session teardown.
            tracing::debug!(target: "hive::event", "publish after bus shutdown dropped");
        }
    }

    /// Subscribe with a filter. The subscription sees matching events in
    /// publication order; the filter is applied before enqueue, so only
    /// matching events occupy (or overflow) the bounded queue.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let shared = SubscriberShared::new(
            self.inner.capacity,
            filter,
            Arc::clone(&self.inner.dropped),
        );
        if self.inner.closed.load(Ordering::Acquire) {
            shared.close();
        } else {
            self.inner.subscribers.lock().push(Arc::clone(&shared));
        }
        EventSubscription::new(shared)
    }

    /// Derive a bus that stamps the given scope onto every publish.
    /// Scopes nest: a child of a child merges, innermost wins.
    #[must_use]
    pub fn child(&self, scope: EventScope) -> EventBus {
        EventBus {
            inner: Arc::clone(&self.inner),
            scope: self.scope.merged(&scope),
        }
    }

    /// Shorthand for a graph-scoped child.
    #[must_use]
    pub fn child_for_graph(&self, graph_id: impl Into<String>) -> EventBus {
        self.child(EventScope {
            graph_id: Some(graph_id.into()),
            ..EventScope::default()
        })
    }

    /// Shorthand for a node-scoped child.
    #[must_use]
    pub fn child_for_node(&self, node_id: impl Into<String>) -> EventBus {
        self.child(EventScope {
            node_id: Some(node_id.into()),
            ..EventScope::default()
        })
    }

    /// Register a sink. Sinks run on the listener task in registration
    /// order.
    pub fn add_sink<S: EventSink + 'static>(&self, sink: S) {
        self.inner.sinks.lock().push(Box::new(sink));
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            capacity: self.inner.capacity,
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the listener task and end every open subscription once its
    /// queue is drained. Subsequent publishes are dropped.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let state = { self.inner.listener.lock().take() };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
        let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
        for subscriber in subscribers {
            subscriber.close();
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("scope", &self.scope)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
