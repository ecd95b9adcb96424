//! Commit-event fan-out with per-subscriber bounded queues and heartbeats.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::core::{JournalEvent, WriterIndex};

/// Outcome of one `next_event` wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeWait {
    Event(JournalEvent),
    /// Events were dropped from a full queue since the last dequeue.
    Gap { writer_index: WriterIndex, lost: u64 },
    Heartbeat,
    TimedOut,
    ShuttingDown,
}

struct IndexQueue {
    events: VecDeque<JournalEvent>,
    lost: u64,
}

impl IndexQueue {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            lost: 0,
        }
    }
}

struct SubscriberState {
    // BTreeMap keeps dequeue scans deterministic across indices.
    queues: BTreeMap<WriterIndex, IndexQueue>,
    heartbeat_seen: u64,
}

struct SubscriberInner {
    state: Mutex<SubscriberState>,
    wake: Condvar,
}

impl SubscriberInner {
    fn notify(&self) {
        self.wake.notify_all();
    }
}

/// Handle returned by `subscribe`; pass back to `next_event` and
/// `unsubscribe`.
pub struct Subscription {
    id: u64,
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct BridgeInner {
    heartbeat: Duration,
    capacity: usize,
    halted: AtomicBool,
    heartbeat_gen: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<SubscriberInner>>>,
    next_subscriber_id: AtomicU64,
    ticker: Mutex<Option<Ticker>>,
}

struct Ticker {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

/// Fans journal-commit events out to per-connection subscribers.
///
/// Commit callbacks never block here: a full queue drops its oldest event
/// and the subscriber observes a gap marker on its next dequeue. Slow
/// clients recover by replaying from a journal position, not from the
/// bridge.
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<BridgeInner>,
}

impl EventBridge {
    pub fn new(heartbeat: Duration, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                heartbeat,
                capacity: queue_capacity.max(1),
                halted: AtomicBool::new(false),
                heartbeat_gen: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Create bounded queues for the given writer indices.
    pub fn subscribe(&self, indices: impl IntoIterator<Item = WriterIndex>) -> Subscription {
        let mut queues = BTreeMap::new();
        for index in indices {
            queues.entry(index).or_insert_with(IndexQueue::new);
        }
        let inner = Arc::new(SubscriberInner {
            state: Mutex::new(SubscriberState {
                queues,
                heartbeat_seen: self.inner.heartbeat_gen.load(Ordering::Acquire),
            }),
            wake: Condvar::new(),
        });
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::AcqRel);
        self.inner
            .subscribers
            .lock()
            .expect("bridge subscribers lock")
            .insert(id, Arc::clone(&inner));
        Subscription { id, inner }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner
            .subscribers
            .lock()
            .expect("bridge subscribers lock")
            .remove(&subscription.id);
        subscription.inner.notify();
    }

    /// Append to every subscriber queue bound to the event's index,
    /// dropping the oldest entry when a queue is full.
    pub fn publish(&self, event: JournalEvent) {
        if self.inner.halted.load(Ordering::Acquire) {
            return;
        }
        let subscribers = self.inner.subscribers.lock().expect("bridge subscribers lock");
        for subscriber in subscribers.values() {
            let mut state = subscriber.state.lock().expect("subscriber lock");
            let Some(queue) = state.queues.get_mut(&event.writer_index) else {
                continue;
            };
            if queue.events.len() >= self.inner.capacity {
                queue.events.pop_front();
                queue.lost += 1;
            }
            queue.events.push_back(event.clone());
            drop(state);
            subscriber.notify();
        }
    }

    /// Block until the next event, gap marker or heartbeat, up to
    /// `timeout`. Returns `ShuttingDown` promptly once the bridge halts.
    pub fn next_event(&self, subscription: &Subscription, timeout: Duration) -> BridgeWait {
        let deadline = Instant::now() + timeout;
        let mut state = subscription.inner.state.lock().expect("subscriber lock");
        loop {
            if self.inner.halted.load(Ordering::Acquire) {
                return BridgeWait::ShuttingDown;
            }

            for (index, queue) in state.queues.iter_mut() {
                if queue.events.is_empty() && queue.lost == 0 {
                    continue;
                }
                if queue.lost > 0 {
                    let lost = queue.lost;
                    queue.lost = 0;
                    return BridgeWait::Gap {
                        writer_index: *index,
                        lost,
                    };
                }
                if let Some(event) = queue.events.pop_front() {
                    return BridgeWait::Event(event);
                }
            }

            let generation = self.inner.heartbeat_gen.load(Ordering::Acquire);
            if generation != state.heartbeat_seen {
                state.heartbeat_seen = generation;
                return BridgeWait::Heartbeat;
            }

            let now = Instant::now();
            if now >= deadline {
                return BridgeWait::TimedOut;
            }
            let (next, _) = subscription
                .inner
                .wake
                .wait_timeout(state, deadline - now)
                .expect("subscriber lock");
            state = next;
        }
    }

    /// Start the heartbeat ticker. Idempotent; also re-arms a bridge that
    /// was halted, so a stopped server can start again.
    pub fn start(&self) {
        let mut ticker = self.inner.ticker.lock().expect("bridge ticker lock");
        if ticker.is_some() {
            return;
        }
        self.inner.halted.store(false, Ordering::Release);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let join = thread::Builder::new()
            .name("annal-bridge-heartbeat".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(inner.heartbeat) {
                        Err(RecvTimeoutError::Timeout) => {
                            inner.heartbeat_gen.fetch_add(1, Ordering::AcqRel);
                            let subscribers =
                                inner.subscribers.lock().expect("bridge subscribers lock");
                            for subscriber in subscribers.values() {
                                subscriber.notify();
                            }
                        }
                        _ => break,
                    }
                }
            })
            .expect("spawn bridge heartbeat thread");
        *ticker = Some(Ticker { stop: stop_tx, join });
    }

    /// Stop the ticker and release every waiting `next_event` caller.
    pub fn halt(&self) {
        self.inner.halted.store(true, Ordering::Release);
        let ticker = self.inner.ticker.lock().expect("bridge ticker lock").take();
        if let Some(ticker) = ticker {
            drop(ticker.stop);
            let _ = ticker.join.join();
        }
        let subscribers = self.inner.subscribers.lock().expect("bridge subscribers lock");
        for subscriber in subscribers.values() {
            subscriber.notify();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("bridge subscribers lock")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn event(index: WriterIndex, seq: u64) -> JournalEvent {
        JournalEvent::new(index, seq, Bytes::from_static(b"tx"))
    }

    fn bridge(heartbeat_ms: u64, capacity: usize) -> EventBridge {
        EventBridge::new(Duration::from_millis(heartbeat_ms), capacity)
    }

    #[test]
    fn delivers_events_in_publication_order() {
        let bridge = bridge(1_000, 16);
        let sub = bridge.subscribe([0]);

        bridge.publish(event(0, 1));
        bridge.publish(event(0, 2));
        bridge.publish(event(0, 3));

        for expected in 1..=3 {
            match bridge.next_event(&sub, Duration::ZERO) {
                BridgeWait::Event(e) => assert_eq!(e.seq, expected),
                other => panic!("expected event {expected}, got {other:?}"),
            }
        }
        assert_eq!(bridge.next_event(&sub, Duration::ZERO), BridgeWait::TimedOut);
    }

    #[test]
    fn unsubscribed_index_receives_nothing() {
        let bridge = bridge(1_000, 16);
        let sub = bridge.subscribe([1]);

        bridge.publish(event(0, 1));
        assert_eq!(bridge.next_event(&sub, Duration::ZERO), BridgeWait::TimedOut);
    }

    #[test]
    fn full_queue_drops_oldest_and_reports_gap() {
        let bridge = bridge(1_000, 2);
        let sub = bridge.subscribe([0]);

        for seq in 1..=5 {
            bridge.publish(event(0, seq));
        }

        match bridge.next_event(&sub, Duration::ZERO) {
            BridgeWait::Gap { writer_index, lost } => {
                assert_eq!(writer_index, 0);
                assert_eq!(lost, 3);
            }
            other => panic!("expected gap, got {other:?}"),
        }
        match bridge.next_event(&sub, Duration::ZERO) {
            BridgeWait::Event(e) => assert_eq!(e.seq, 4),
            other => panic!("expected e4, got {other:?}"),
        }
        match bridge.next_event(&sub, Duration::ZERO) {
            BridgeWait::Event(e) => assert_eq!(e.seq, 5),
            other => panic!("expected e5, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_arrives_without_events() {
        let bridge = bridge(20, 16);
        let sub = bridge.subscribe([0]);
        bridge.start();

        let wait = bridge.next_event(&sub, Duration::from_millis(500));
        bridge.halt();
        assert_eq!(wait, BridgeWait::Heartbeat);
    }

    #[test]
    fn halt_releases_blocked_waiters() {
        let bridge = bridge(10_000, 16);
        let sub = bridge.subscribe([0]);
        bridge.start();

        let waiter = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.next_event(&sub, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        bridge.halt();

        let wait = waiter.join().unwrap();
        assert!(
            matches!(wait, BridgeWait::ShuttingDown | BridgeWait::Heartbeat),
            "halt must release the waiter, got {wait:?}"
        );
    }

    #[test]
    fn events_interleave_with_heartbeats_in_order() {
        let bridge = bridge(5, 16);
        let sub = bridge.subscribe([0]);
        bridge.start();

        bridge.publish(event(0, 1));
        thread::sleep(Duration::from_millis(30));
        bridge.publish(event(0, 2));

        let mut seqs = Vec::new();
        loop {
            match bridge.next_event(&sub, Duration::ZERO) {
                BridgeWait::Event(e) => seqs.push(e.seq),
                BridgeWait::Heartbeat => continue,
                BridgeWait::TimedOut => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        bridge.halt();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bridge = bridge(1_000, 16);
        let sub = bridge.subscribe([0]);
        bridge.publish(event(0, 1));
        bridge.unsubscribe(sub);
        assert_eq!(bridge.subscriber_count(), 0);
        // Publishing to nobody must not panic or block.
        bridge.publish(event(0, 2));
    }
}
