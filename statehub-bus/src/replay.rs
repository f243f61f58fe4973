use statehub_types::Event;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Recent events of one replay-enabled topic.
///
/// Bounded by count (oldest evicted first) and by age.
#[derive(Debug)]
pub(crate) struct ReplayBuffer {
    max_events: usize,
    max_age: Duration,
    events: VecDeque<(Instant, Event)>,
}

impl ReplayBuffer {
    pub fn new(max_events: usize, max_age: Duration) -> Self {
        Self {
            max_events,
            max_age,
            events: VecDeque::with_capacity(max_events.min(256)),
        }
    }

    pub fn push(&mut self, event: Event) {
        let now = Instant::now();
        self.events.push_back((now, event));
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        self.evict_expired(now);
    }

    /// Events younger than the max age, oldest first.
    pub fn recent(&mut self) -> Vec<(Instant, Event)> {
        self.evict_expired(Instant::now());
        self.events.iter().cloned().collect()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) < self.max_age {
                break;
            }
            self.events.pop_front();
        }
    }
}
