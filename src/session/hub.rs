//! Per-session output fan-out.
//!
//! Every attached subscriber gets its own bounded queue so that one slow
//! consumer can only ever cost itself dropped chunks, never stall delivery
//! to the others. This replaces a single-shared-ring-buffer-with-read-
//! cursors design: that shape makes isolating a slow reader from a fast one
//! impossible without penalizing everybody sharing the ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Chunk {
    pub offset: f64,
    pub kind: ChunkKind,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Output,
    Resize { cols: u16, rows: u16 },
    Ended { reason: &'static str, exit_status: Option<i32> },
}

struct SubscriberState {
    id: u64,
    queue: Mutex<VecDeque<Chunk>>,
    notify: Notify,
    dropped: AtomicU64,
    /// Fired whenever `deliver` evicts a queued chunk for this subscriber,
    /// independent of whether anything is currently awaiting `recv()`'s
    /// normal queue-pop path. Lets a transport's select loop learn about a
    /// slow-consumer eviction on its own branch rather than only noticing
    /// after its next successfully completed chunk delivery.
    dropped_notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    writer_permitted: bool,
}

/// Handle returned by [`Hub::subscribe`]. Consume it with [`Subscriber::recv`].
/// Dropping it unsubscribes from the hub automatically, so transports don't
/// need to remember to call [`Hub::unsubscribe`] on every exit path.
pub struct Subscriber {
    state: Arc<SubscriberState>,
    hub: Hub,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.state.id;
        tokio::spawn(async move { hub.unsubscribe(id).await });
    }
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn writer_permitted(&self) -> bool {
        self.state.writer_permitted
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Resolves the next time the hub evicts a queued chunk for this
    /// subscriber. Meant to be raced in a `select!` alongside `recv()` so a
    /// transport learns about backpressure even while busy delivering (or
    /// blocked sending) an earlier chunk.
    pub async fn dropped_signal(&self) {
        self.state.dropped_notify.notified().await;
    }

    /// Waits for the next chunk. Returns `None` once the hub has marked this
    /// subscriber closed (session ended) and the queue has drained.
    pub async fn recv(&self) -> Option<Chunk> {
        loop {
            {
                let mut q = self.state.queue.lock().await;
                if let Some(chunk) = q.pop_front() {
                    return Some(chunk);
                }
                if self.state.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.state.notify.notified().await;
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct SubscribeConfig {
    pub writer_permitted: bool,
    pub queue_capacity: Option<usize>,
    /// How many recently-published chunks to replay synchronously on
    /// subscribe, before any newly-published chunk is delivered.
    pub replay_backlog: usize,
    /// Set by `Session::attach` when the session is already `exited`. The
    /// new subscriber is queued a synthetic `Ended` chunk and marked closed
    /// immediately, rather than being left to wait on a hub whose output
    /// pump is dead and will never publish or call `close_all` again.
    pub already_ended: Option<(&'static str, Option<i32>)>,
}

const RECENT_CAPACITY: usize = 1024;

/// Per-session fan-out point. Cheap to clone; clones share the subscriber
/// list.
#[derive(Clone)]
pub struct Hub {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberState>>>>,
    recent: Arc<Mutex<VecDeque<Chunk>>>,
    next_id: Arc<AtomicU64>,
    default_capacity: usize,
}

impl Hub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            default_capacity,
        }
    }

    pub async fn subscribe(&self, config: SubscribeConfig) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            id,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            dropped_notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: config.queue_capacity.unwrap_or(self.default_capacity),
            writer_permitted: config.writer_permitted,
        });

        if config.replay_backlog > 0 {
            let recent = self.recent.lock().await;
            let skip = recent.len().saturating_sub(config.replay_backlog);
            let mut q = state.queue.lock().await;
            for chunk in recent.iter().skip(skip) {
                q.push_back(chunk.clone());
            }
        }

        self.subscribers.lock().await.push(Arc::clone(&state));

        if let Some((reason, exit_status)) = config.already_ended {
            Self::deliver(
                &state,
                Chunk {
                    offset: 0.0,
                    kind: ChunkKind::Ended { reason, exit_status },
                    data: Vec::new(),
                },
            )
            .await;
            state.closed.store(true, Ordering::Release);
            state.notify.notify_one();
        }

        Subscriber {
            state,
            hub: self.clone(),
        }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Called only by the session's output pump (single producer).
    pub async fn publish(&self, chunk: Chunk) {
        {
            let mut recent = self.recent.lock().await;
            if recent.len() >= RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(chunk.clone());
        }
        let subs = self.subscribers.lock().await;
        for sub in subs.iter() {
            Self::deliver(sub, chunk.clone()).await;
        }
    }

    async fn deliver(sub: &Arc<SubscriberState>, chunk: Chunk) {
        let mut q = sub.queue.lock().await;
        if q.len() >= sub.capacity {
            q.pop_front();
            sub.dropped.fetch_add(1, Ordering::Relaxed);
            sub.dropped_notify.notify_one();
        }
        q.push_back(chunk);
        drop(q);
        sub.notify.notify_one();
    }

    /// Marks every subscriber closed and wakes them so `recv` returns `None`
    /// once their queue drains. Called once by the session's reaper, and
    /// again (with no exit status) by a live session's shutdown notice.
    pub async fn close_all(&self, reason: &'static str, exit_status: Option<i32>) {
        let subs = self.subscribers.lock().await;
        for sub in subs.iter() {
            Self::deliver(
                sub,
                Chunk {
                    offset: 0.0,
                    kind: ChunkKind::Ended { reason, exit_status },
                    data: Vec::new(),
                },
            )
            .await;
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(data: &[u8]) -> Chunk {
        Chunk {
            offset: 0.0,
            kind: ChunkKind::Output,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn two_subscribers_receive_identical_order() {
        let hub = Hub::new(DEFAULT_QUEUE_CAPACITY);
        let a = hub.subscribe(SubscribeConfig::default()).await;
        let b = hub.subscribe(SubscribeConfig::default()).await;

        hub.publish(output(b"one")).await;
        hub.publish(output(b"two")).await;

        assert_eq!(a.recv().await.unwrap().data, b"one");
        assert_eq!(a.recv().await.unwrap().data, b"two");
        assert_eq!(b.recv().await.unwrap().data, b"one");
        assert_eq!(b.recv().await.unwrap().data, b"two");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_affecting_others() {
        let hub = Hub::new(4);
        let slow = hub.subscribe(SubscribeConfig::default()).await;
        let fast = hub.subscribe(SubscribeConfig::default()).await;

        for i in 0..10u8 {
            hub.publish(output(&[i])).await;
        }

        // `slow` never drained; only the last 4 chunks remain, oldest dropped.
        assert!(slow.dropped_count() >= 6);
        let first_remaining = slow.recv().await.unwrap();
        assert_eq!(first_remaining.data, vec![6]);

        // `fast` drains as it goes and sees everything if it kept up —
        // here it didn't drain either, so it sees the same tail.
        let fast_first = fast.recv().await.unwrap();
        assert_eq!(fast_first.data, vec![6]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_future_publishes() {
        let hub = Hub::new(DEFAULT_QUEUE_CAPACITY);
        let a = hub.subscribe(SubscribeConfig::default()).await;
        hub.unsubscribe(a.id()).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_delivers_ended_then_none() {
        let hub = Hub::new(DEFAULT_QUEUE_CAPACITY);
        let sub = hub.subscribe(SubscribeConfig::default()).await;
        hub.close_all("normal", Some(0)).await;

        let chunk = sub.recv().await.unwrap();
        assert!(matches!(
            chunk.kind,
            ChunkKind::Ended { reason: "normal", exit_status: Some(0) }
        ));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_already_ended_delivers_ended_then_none_immediately() {
        let hub = Hub::new(DEFAULT_QUEUE_CAPACITY);
        let sub = hub
            .subscribe(SubscribeConfig {
                already_ended: Some(("normal", Some(0))),
                ..SubscribeConfig::default()
            })
            .await;

        let chunk = sub.recv().await.unwrap();
        assert!(matches!(
            chunk.kind,
            ChunkKind::Ended { reason: "normal", exit_status: Some(0) }
        ));
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count().await, 1);
    }
}
