use crate::topic::TopicPattern;
use parking_lot::Mutex;
use statehub_types::{Event, SubscriptionId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Subscriber callback. `Err` counts as a delivery failure.
pub type Callback = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

/// Extra predicate evaluated after topic matching.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// How matched events reach a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Every event, in publish order.
    #[default]
    Immediate,
    /// The first event only, then the subscription removes itself.
    Once,
    /// Only the latest event once `wait` passes with no newer one.
    Debounce { wait: Duration },
    /// Events arriving within `interval` of the last delivery are dropped.
    Throttle { interval: Duration },
    /// One aggregate event per `max_size` events or `max_wait`, whichever first.
    Batch { max_size: usize, max_wait: Duration },
}

/// Options for [`crate::EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub policy: DeliveryPolicy,
    /// Higher priorities are invoked first for the same event.
    pub priority: i32,
    pub filter: Option<EventFilter>,
    /// Name matched against `Event::target`.
    pub subscriber: Option<String>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn filter(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn subscriber(mut self, name: impl Into<String>) -> Self {
        self.subscriber = Some(name.into());
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("policy", &self.policy)
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

/// Per-subscription delivery state.
#[derive(Debug, Default)]
pub(crate) enum PolicyState {
    #[default]
    Stateless,
    Throttle {
        last: Option<Instant>,
    },
    Debounce {
        generation: u64,
        pending: Option<Event>,
    },
    Batch {
        generation: u64,
        events: Vec<Event>,
    },
}

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub seq: u64,
    pub pattern: TopicPattern,
    pub callback: Callback,
    pub options: SubscribeOptions,
    pub state: Mutex<PolicyState>,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(
        seq: u64,
        pattern: TopicPattern,
        callback: Callback,
        options: SubscribeOptions,
    ) -> Self {
        let state = match options.policy {
            DeliveryPolicy::Throttle { .. } => PolicyState::Throttle { last: None },
            DeliveryPolicy::Debounce { .. } => PolicyState::Debounce {
                generation: 0,
                pending: None,
            },
            DeliveryPolicy::Batch { .. } => PolicyState::Batch {
                generation: 0,
                events: Vec::new(),
            },
            DeliveryPolicy::Immediate | DeliveryPolicy::Once => PolicyState::Stateless,
        };
        Self {
            id: SubscriptionId::new(),
            seq,
            pattern,
            callback,
            options,
            state: Mutex::new(state),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the subscription inactive. Returns true for the first caller.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Topic, target and filter checks.
    pub fn accepts(&self, event: &Event) -> bool {
        if !self.pattern.matches(&event.topic) {
            return false;
        }
        if let Some(target) = &event.target {
            if self.options.subscriber.as_ref() != Some(target) {
                return false;
            }
        }
        self.options.filter.as_ref().is_none_or(|f| f(event))
    }
}
