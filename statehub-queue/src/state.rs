//! Bookkeeping behind the queue lock: priority order, coalescing slots,
//! the open batch and sealed units waiting for a dispatch slot.

use crate::request::UpdateRequest;
use statehub_types::{overlay, BatchId, OperationId, OperationKind, Priority};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::time::Instant;

/// Ordering key: highest priority first, then arrival.
type Slot = (Reverse<Priority>, u64);

struct Queued {
    request: UpdateRequest,
    seq: u64,
}

/// A batch, or a single request, dispatched as one unit.
pub(crate) struct Unit {
    pub batch_id: Option<BatchId>,
    pub requests: Vec<UpdateRequest>,
    pub opened_at: Instant,
}

#[derive(Default)]
pub(crate) struct QueueState {
    order: BTreeMap<Slot, OperationId>,
    queued: HashMap<OperationId, Queued>,
    coalesce: HashMap<(String, OperationKind), OperationId>,
    open_batch: Vec<UpdateRequest>,
    open_since: Option<Instant>,
    ready: VecDeque<Unit>,
    in_flight: HashSet<OperationId>,
    pub active_units: usize,
    pub paused: bool,
    next_seq: u64,
}

pub(crate) enum Removed {
    Cancelled(UpdateRequest),
    InFlight,
    NotFound,
}

impl QueueState {
    /// Requests not yet started: queued, batched or sealed.
    pub fn waiting(&self) -> usize {
        self.queued.len()
            + self.open_batch.len()
            + self.ready.iter().map(|u| u.requests.len()).sum::<usize>()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active_units == 0 && (self.paused || self.waiting() == 0)
    }

    fn is_tracked(&self, id: &OperationId) -> bool {
        self.queued.contains_key(id)
            || self.in_flight.contains(id)
            || self.open_batch.iter().any(|r| r.id == *id)
            || self
                .ready
                .iter()
                .any(|u| u.requests.iter().any(|r| r.id == *id))
    }

    pub fn push(&mut self, request: UpdateRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if request.kind.is_coalescable() {
            self.coalesce.insert(request.coalesce_slot(), request.id);
        }
        self.order.insert((Reverse(request.priority), seq), request.id);
        self.queued.insert(request.id, Queued { request, seq });
    }

    /// Merges `incoming` into a queued request with the same coalesce slot.
    ///
    /// Returns the surviving id, or gives `incoming` back when nothing
    /// matches.
    pub fn coalesce(&mut self, incoming: UpdateRequest) -> Result<OperationId, UpdateRequest> {
        let Some(&target) = self.coalesce.get(&incoming.coalesce_slot()) else {
            return Err(incoming);
        };
        let Some(existing) = self.queued.get_mut(&target) else {
            return Err(incoming);
        };

        let old_slot = (Reverse(existing.request.priority), existing.seq);
        let request = &mut existing.request;
        request.payload = overlay(&request.payload, &incoming.payload);
        request.dependencies.extend(incoming.dependencies);
        request.dependencies.remove(&target);
        request.priority = request.priority.max(incoming.priority);
        request.max_retries = request.max_retries.max(incoming.max_retries);
        if incoming.source.is_some() {
            request.source = incoming.source;
        }
        if request.on_cancel.is_none() {
            request.on_cancel = incoming.on_cancel;
        }

        let new_slot = (Reverse(request.priority), existing.seq);
        if new_slot != old_slot {
            self.order.remove(&old_slot);
            self.order.insert(new_slot, target);
        }
        Ok(target)
    }

    fn take_queued(&mut self, id: &OperationId) -> Option<UpdateRequest> {
        let queued = self.queued.remove(id)?;
        self.order
            .remove(&(Reverse(queued.request.priority), queued.seq));
        let slot = queued.request.coalesce_slot();
        if self.coalesce.get(&slot) == Some(id) {
            self.coalesce.remove(&slot);
        }
        Some(queued.request)
    }

    /// First queued request, in priority order, whose dependencies have all
    /// finished.
    fn next_admissible(&self) -> Option<OperationId> {
        self.order.values().copied().find(|id| {
            self.queued
                .get(id)
                .is_some_and(|q| !q.request.dependencies.iter().any(|d| self.is_tracked(d)))
        })
    }

    fn seal_batch(&mut self) {
        if self.open_batch.is_empty() {
            return;
        }
        let opened_at = self.open_since.take().unwrap_or_else(Instant::now);
        self.ready.push_back(Unit {
            batch_id: Some(BatchId::new()),
            requests: std::mem::take(&mut self.open_batch),
            opened_at,
        });
    }

    /// When the open batch times out, if there is one.
    pub fn batch_deadline(&self, timeout: std::time::Duration) -> Option<Instant> {
        self.open_since.map(|since| since + timeout)
    }

    /// Admits work and hands back the units that may start now.
    ///
    /// `batching` routes coalescable kinds through the open batch, which is
    /// sealed when full, when `batch_timeout` has passed, or when `force` is
    /// set and nothing else is admissible.
    pub fn take_startable(&mut self, limits: Limits, now: Instant, force: bool) -> Vec<Unit> {
        let mut start = Vec::new();
        if self.paused {
            return start;
        }
        loop {
            if self.active_units < limits.max_concurrent {
                if let Some(unit) = self.ready.pop_front() {
                    self.begin(&unit);
                    start.push(unit);
                    continue;
                }
                if let Some(id) = self.next_admissible() {
                    let Some(request) = self.take_queued(&id) else {
                        break;
                    };
                    if limits.batching && request.kind.is_coalescable() {
                        if self.open_batch.is_empty() {
                            self.open_since = Some(now);
                        }
                        self.open_batch.push(request);
                        if self.open_batch.len() >= limits.batch_size {
                            self.seal_batch();
                        }
                    } else {
                        let unit = Unit {
                            batch_id: None,
                            requests: vec![request],
                            opened_at: now,
                        };
                        self.begin(&unit);
                        start.push(unit);
                    }
                    continue;
                }
            }
            let timed_out = self
                .batch_deadline(limits.batch_timeout)
                .is_some_and(|deadline| deadline <= now);
            if !self.open_batch.is_empty() && (force || timed_out) {
                self.seal_batch();
                continue;
            }
            break;
        }
        start
    }

    fn begin(&mut self, unit: &Unit) {
        self.active_units += 1;
        self.in_flight.extend(unit.requests.iter().map(|r| r.id));
    }

    pub fn finish(&mut self, ids: impl IntoIterator<Item = OperationId>) {
        self.active_units = self.active_units.saturating_sub(1);
        for id in ids {
            self.in_flight.remove(&id);
        }
    }

    /// Removes a request that has not started.
    pub fn remove(&mut self, id: &OperationId) -> Removed {
        if let Some(request) = self.take_queued(id) {
            return Removed::Cancelled(request);
        }
        if let Some(pos) = self.open_batch.iter().position(|r| r.id == *id) {
            let request = self.open_batch.remove(pos);
            if self.open_batch.is_empty() {
                self.open_since = None;
            }
            return Removed::Cancelled(request);
        }
        let sealed = self.ready.iter().enumerate().find_map(|(u, unit)| {
            unit.requests.iter().position(|r| r.id == *id).map(|pos| (u, pos))
        });
        if let Some((u, pos)) = sealed {
            let request = self.ready[u].requests.remove(pos);
            if self.ready[u].requests.is_empty() {
                self.ready.remove(u);
            }
            return Removed::Cancelled(request);
        }
        if self.in_flight.contains(id) {
            return Removed::InFlight;
        }
        Removed::NotFound
    }

    /// Ids of every not-yet-started request of `kind`.
    pub fn waiting_of_kind(&self, kind: OperationKind) -> Vec<OperationId> {
        let queued = self
            .order
            .values()
            .filter(|id| self.queued.get(id).is_some_and(|q| q.request.kind == kind))
            .copied();
        let batched = self
            .open_batch
            .iter()
            .chain(self.ready.iter().flat_map(|u| u.requests.iter()))
            .filter(|r| r.kind == kind)
            .map(|r| r.id);
        queued.chain(batched).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub batch_timeout: std::time::Duration,
    pub batching: bool,
}
