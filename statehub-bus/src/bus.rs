use crate::error::{BusError, BusResult};
use crate::replay::ReplayBuffer;
use crate::subscription::{DeliveryPolicy, PolicyState, SubscribeOptions, Subscription};
use crate::topic::TopicPattern;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statehub_types::{BatchId, Event, EventId, SubscriptionId, TaskHandle};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum undelivered events before `publish` fails.
    pub max_queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub throttled: u64,
    /// Debounced events replaced by a newer one before their timer fired.
    pub debounced: u64,
    pub failures: u64,
    pub replayed: u64,
    pub subscriptions: usize,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    throttled: AtomicU64,
    debounced: AtomicU64,
    failures: AtomicU64,
    replayed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum Queued {
    Broadcast(Event),
    Replay {
        subscription: SubscriptionId,
        event: Event,
    },
}

struct BusInner {
    config: BusConfig,
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    drain_lock: Mutex<()>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    replay: Mutex<HashMap<String, ReplayBuffer>>,
    next_seq: AtomicU64,
    counters: Counters,
}

/// Topic-based publish/subscribe.
///
/// `publish` only enqueues. Events reach subscribers when the queue is
/// drained, either by [`EventBus::process_pending`] or by the loop started
/// with [`EventBus::spawn_delivery_loop`]. The queue is drained by one caller
/// at a time, so an immediate subscription sees events in publish order.
///
/// Cloning is cheap; clones share the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                drain_lock: Mutex::new(()),
                subscriptions: RwLock::new(HashMap::new()),
                replay: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    // ── Publishing ───────────────────────────────────────────────

    /// Enqueues an event for delivery.
    pub fn publish(&self, event: Event) -> BusResult<EventId> {
        let id = event.id;
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.config.max_queue_size {
                warn!(topic = %event.topic, "Event queue full, rejecting publish");
                return Err(BusError::QueueFull {
                    capacity: self.inner.config.max_queue_size,
                });
            }
            trace!(topic = %event.topic, event_id = %id, "Event published");
            queue.push_back(Queued::Broadcast(event));
        }
        bump(&self.inner.counters.published);
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Publishes `payload` on `topic` with default metadata.
    pub fn emit(&self, topic: impl Into<String>, payload: Value) -> BusResult<EventId> {
        self.publish(Event::new(topic, payload))
    }

    /// Enqueues several events under one batch id, numbered in order.
    ///
    /// Either all events are accepted or none are.
    pub fn publish_batch(&self, events: Vec<Event>) -> BusResult<BatchId> {
        let batch_id = BatchId::new();
        let count = events.len();
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() + count > self.inner.config.max_queue_size {
                return Err(BusError::QueueFull {
                    capacity: self.inner.config.max_queue_size,
                });
            }
            for (seq, mut event) in events.into_iter().enumerate() {
                event.batch_id = Some(batch_id);
                event.sequence = Some(seq as u32);
                queue.push_back(Queued::Broadcast(event));
            }
        }
        self.inner
            .counters
            .published
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(batch_id = %batch_id, count, "Event batch published");
        self.inner.notify.notify_one();
        Ok(batch_id)
    }

    fn record_replay(&self, event: &Event) {
        if let Some(buffer) = self.inner.replay.lock().get_mut(&event.topic) {
            buffer.push(event.clone());
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Registers `callback` for topics matching `pattern`.
    ///
    /// If replay is enabled for matching topics, their recent events are
    /// queued for this subscription alone and delivered by the next drain.
    pub fn subscribe(
        &self,
        pattern: &str,
        callback: impl Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> BusResult<SubscriptionId> {
        let pattern = TopicPattern::parse(pattern)?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription::new(
            seq,
            pattern,
            Arc::new(callback),
            options,
        ));
        let id = sub.id;
        debug!(subscription = %id, pattern = sub.pattern.as_str(), policy = ?sub.options.policy, "Subscribed");

        let history = self.replay_history(&sub.pattern);
        self.inner.subscriptions.write().insert(id, sub);

        if !history.is_empty() {
            let mut queue = self.inner.queue.lock();
            for event in history {
                queue.push_back(Queued::Replay {
                    subscription: id,
                    event,
                });
            }
            drop(queue);
            self.inner.notify.notify_one();
        }
        Ok(id)
    }

    fn replay_history(&self, pattern: &TopicPattern) -> Vec<Event> {
        let mut replay = self.inner.replay.lock();
        let mut history: Vec<_> = replay
            .iter_mut()
            .filter(|(topic, _)| pattern.matches(topic))
            .flat_map(|(_, buffer)| buffer.recent())
            .collect();
        history.sort_by_key(|(at, _)| *at);
        history.into_iter().map(|(_, event)| event).collect()
    }

    /// Removes a subscription. Pending timers for it are discarded.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                sub.deactivate();
                debug!(subscription = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Keeps the last `max_events` events of `topic` younger than `max_age`
    /// for replay to new subscribers.
    pub fn enable_replay(&self, topic: impl Into<String>, max_events: usize, max_age: Duration) {
        let topic = topic.into();
        debug!(topic = %topic, max_events, "Replay enabled");
        self.inner
            .replay
            .lock()
            .insert(topic, ReplayBuffer::new(max_events, max_age));
    }

    pub fn disable_replay(&self, topic: &str) {
        self.inner.replay.lock().remove(topic);
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Events waiting to be drained.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    // ── Delivery ─────────────────────────────────────────────────

    /// Delivers every queued event. Returns the number of queue items handled.
    ///
    /// Returns 0 immediately if another caller is draining; that caller
    /// picks up anything enqueued meanwhile. Debounce and batch timers need
    /// a Tokio runtime; without one they fire immediately.
    pub fn process_pending(&self) -> usize {
        let Some(_guard) = self.inner.drain_lock.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        loop {
            let next = self.inner.queue.lock().pop_front();
            let Some(item) = next else { break };
            handled += 1;
            match item {
                Queued::Broadcast(event) => {
                    self.dispatch(&event);
                    // Recorded after delivery so subscribers present at
                    // dispatch time never see the event again as replay.
                    self.record_replay(&event);
                }
                Queued::Replay {
                    subscription,
                    event,
                } => self.replay_to(subscription, &event),
            }
        }
        handled
    }

    /// Drains the queue whenever events arrive, until cancelled.
    pub fn spawn_delivery_loop(&self) -> TaskHandle {
        let bus = self.clone();
        TaskHandle::spawn("event-delivery", move |token| async move {
            loop {
                bus.process_pending();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = bus.inner.notify.notified() => {}
                }
                tokio::task::yield_now().await;
            }
            bus.process_pending();
        })
    }

    /// Delivers every partially filled batch now.
    pub fn flush_batches(&self) -> usize {
        let subs: Vec<Arc<Subscription>> =
            self.inner.subscriptions.read().values().cloned().collect();
        let mut flushed = 0;
        for sub in subs {
            let aggregate = {
                let mut state = sub.state.lock();
                match &mut *state {
                    PolicyState::Batch { generation, events } if !events.is_empty() => {
                        *generation += 1;
                        Some(Event::aggregate(sub.pattern.as_str(), &std::mem::take(events)))
                    }
                    _ => None,
                }
            };
            if let Some(event) = aggregate {
                self.invoke(&sub, &event);
                flushed += 1;
            }
        }
        flushed
    }

    fn dispatch(&self, event: &Event) {
        let active: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .read()
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        let mut matched: Vec<Arc<Subscription>> =
            active.into_iter().filter(|s| s.accepts(event)).collect();
        matched.sort_by_key(|s| (Reverse(s.options.priority), s.seq));

        if matched.is_empty() {
            trace!(topic = %event.topic, "No subscribers");
        }
        for sub in matched {
            self.deliver(&sub, event);
        }
    }

    fn deliver(&self, sub: &Arc<Subscription>, event: &Event) {
        match sub.options.policy {
            DeliveryPolicy::Immediate => self.invoke(sub, event),
            DeliveryPolicy::Once => {
                if sub.deactivate() {
                    self.inner.subscriptions.write().remove(&sub.id);
                    self.invoke(sub, event);
                }
            }
            DeliveryPolicy::Throttle { interval } => {
                let now = tokio::time::Instant::now();
                let allowed = match &mut *sub.state.lock() {
                    PolicyState::Throttle { last } => {
                        if last.is_some_and(|at| now.duration_since(at) < interval) {
                            false
                        } else {
                            *last = Some(now);
                            true
                        }
                    }
                    _ => true,
                };
                if allowed {
                    self.invoke(sub, event);
                } else {
                    bump(&self.inner.counters.throttled);
                    trace!(subscription = %sub.id, topic = %event.topic, "Throttled");
                }
            }
            DeliveryPolicy::Debounce { wait } => {
                let scheduled = match &mut *sub.state.lock() {
                    PolicyState::Debounce {
                        generation,
                        pending,
                    } => {
                        *generation += 1;
                        if pending.replace(event.clone()).is_some() {
                            bump(&self.inner.counters.debounced);
                        }
                        Some(*generation)
                    }
                    _ => None,
                };
                if let Some(generation) = scheduled {
                    self.schedule_timer(Arc::clone(sub), wait, generation);
                }
            }
            DeliveryPolicy::Batch { max_size, max_wait } => {
                let (full, open_timer) = match &mut *sub.state.lock() {
                    PolicyState::Batch { generation, events } => {
                        events.push(event.clone());
                        if events.len() >= max_size.max(1) {
                            *generation += 1;
                            (Some(std::mem::take(events)), None)
                        } else if events.len() == 1 {
                            (None, Some(*generation))
                        } else {
                            (None, None)
                        }
                    }
                    _ => (None, None),
                };
                if let Some(events) = full {
                    self.invoke(sub, &Event::aggregate(sub.pattern.as_str(), &events));
                } else if let Some(generation) = open_timer {
                    self.schedule_timer(Arc::clone(sub), max_wait, generation);
                }
            }
        }
    }

    fn schedule_timer(&self, sub: Arc<Subscription>, wait: Duration, generation: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(wait).await;
                    bus.fire_timer(&sub, generation);
                });
            }
            Err(_) => {
                warn!(subscription = %sub.id, "No runtime for delivery timer, firing now");
                self.fire_timer(&sub, generation);
            }
        }
    }

    /// Debounce or batch timer expiry. Stale generations are ignored.
    fn fire_timer(&self, sub: &Subscription, generation: u64) {
        if !sub.is_active() {
            return;
        }
        let due = match &mut *sub.state.lock() {
            PolicyState::Debounce {
                generation: current,
                pending,
            } if *current == generation => pending.take(),
            PolicyState::Batch {
                generation: current,
                events,
            } if *current == generation && !events.is_empty() => {
                *current += 1;
                Some(Event::aggregate(sub.pattern.as_str(), &std::mem::take(events)))
            }
            _ => None,
        };
        if let Some(event) = due {
            self.invoke(sub, &event);
        }
    }

    /// Replayed history bypasses the delivery policy.
    fn replay_to(&self, id: SubscriptionId, event: &Event) {
        let sub = self.inner.subscriptions.read().get(&id).cloned();
        if let Some(sub) = sub.filter(|s| s.is_active() && s.accepts(event)) {
            bump(&self.inner.counters.replayed);
            self.invoke(&sub, event);
        }
    }

    fn invoke(&self, sub: &Subscription, event: &Event) {
        let reason = match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
            Ok(Ok(())) => {
                bump(&self.inner.counters.delivered);
                return;
            }
            Ok(Err(reason)) => reason,
            Err(panic) => panic_message(panic),
        };
        bump(&self.inner.counters.failures);
        let err = BusError::DeliveryFailed {
            subscription: sub.id,
            reason,
        };
        warn!(topic = %event.topic, pattern = sub.pattern.as_str(), "{}", err);
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            debounced: c.debounced.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
            subscriptions: self.subscription_count(),
            pending: self.pending(),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
