//! Request pool: admit, dedup, prioritize and dispatch frame fetches
//!
//! **Why**: Many viewports want frames at once, but only a handful of
//! transfers may run concurrently. Requests are queued on three lanes
//! (interactive > thumbnail > prefetch), each with its own cap, all sharing
//! one global budget derived from the platform concurrency hint.
//!
//! **Used by**: FrameDisplayDispatcher (interactive), PrefetchPlanner and
//! StudyPrefetcher (prefetch), hosts (thumbnail).
//!
//! # Scheduling model
//!
//! - `add_request()` only queues (or joins) and wakes the pool
//! - `tick()` recomputes caps from the hint and dispatches up to the budget
//! - Fetches run elsewhere and reply on a completion channel
//! - `pump()` drains replies on the owning thread: decrement the lane,
//!   store the frame, run every waiter, then `tick()` again
//!
//! Callbacks never run while the pool lock is held, so they may call
//! `add_request()`/`tick()` again.
//!
//! # Dedup
//!
//! At most one fetch per key is outstanding. A request whose key is already
//! resolved settles from the store; one whose key is in flight joins it.
//! Both checks run again at dispatch time, so a duplicate that was queued
//! before the first fetch started never consumes a slot.
//!
//! # Known limitations
//!
//! No timeout and no retry: a fetch that never replies holds its lane slot
//! forever, a failed fetch is reported once and forgotten. The budget is
//! shared by every viewport, so one busy viewport can starve another.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace, warn};

use crate::entities::{
    ConcurrencyHint, Fetch, FetchReply, FetchRequest, Frame, FrameKey, FrameStore, Lane,
    LoadError, LoadOptions, ViewportId,
};

pub type DoneCallback = Box<dyn FnOnce(Frame) + Send + 'static>;
pub type FailCallback = Box<dyn FnOnce(LoadError) + Send + 'static>;

/// Completion callbacks of one caller
struct Waiter {
    on_done: DoneCallback,
    on_fail: FailCallback,
}

impl Waiter {
    fn settle(self, result: Result<Frame, LoadError>) {
        match result {
            Ok(frame) => (self.on_done)(frame),
            Err(error) => (self.on_fail)(error),
        }
    }
}

/// One queued fetch
struct Request {
    viewport: Option<ViewportId>,
    key: FrameKey,
    prevent_cache: bool,
    waiter: Waiter,
}

/// Queue and counters of one lane
#[derive(Default)]
struct LaneQueue {
    queue: VecDeque<Request>,
    in_flight: usize,
    max_concurrent: usize,
}

/// Outstanding fetch and everybody waiting for it
struct InFlight {
    ticket: u64,
    lane: Lane,
    prevent_cache: bool,
    waiters: Vec<Waiter>,
}

struct Settled {
    waiter: Waiter,
    result: Result<Frame, LoadError>,
}

#[derive(Default)]
struct PoolState {
    lanes: [LaneQueue; Lane::COUNT],
    in_flight: HashMap<FrameKey, InFlight>,
    /// Resolved at admission, delivered on the next pump
    settled: VecDeque<Settled>,
    awake: bool,
    next_ticket: u64,
}

impl PoolState {
    fn lane(&self, lane: Lane) -> &LaneQueue {
        &self.lanes[lane.index()]
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneQueue {
        &mut self.lanes[lane.index()]
    }

    fn total_in_flight(&self) -> usize {
        self.lanes.iter().map(|l| l.in_flight).sum()
    }

    fn queues_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.queue.is_empty())
    }

    fn is_idle(&self) -> bool {
        self.queues_empty() && self.total_in_flight() == 0 && self.settled.is_empty()
    }

    /// Highest-priority lane with queued work and spare capacity
    fn next_lane(&self) -> Option<Lane> {
        Lane::PRIORITY.into_iter().find(|&lane| {
            let l = self.lane(lane);
            !l.queue.is_empty() && l.in_flight < l.max_concurrent
        })
    }
}

/// Pool counters (monotonic)
#[derive(Debug, Default)]
pub struct PoolStats {
    issued: AtomicU64,
    joined: AtomicU64,
    store_hits: AtomicU64,
    failures: AtomicU64,
}

impl PoolStats {
    /// Fetches actually started
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Requests that joined an in-flight fetch
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Requests answered straight from the store
    pub fn store_hits(&self) -> u64 {
        self.store_hits.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Shared {
    state: Mutex<PoolState>,
    store: Arc<dyn FrameStore>,
    fetcher: Arc<dyn Fetch>,
    hint: Arc<dyn ConcurrencyHint>,
    replies_tx: Sender<FetchReply>,
    replies_rx: Receiver<FetchReply>,
    stats: PoolStats,
}

/// Three-lane request pool. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct RequestPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        let mut dbg = f.debug_struct("RequestPool");
        for lane in Lane::PRIORITY {
            let l = state.lane(lane);
            dbg.field(lane.name(), &(l.queue.len(), l.in_flight, l.max_concurrent));
        }
        dbg.field("awake", &state.awake).finish()
    }
}

/// Outcome of admitting one dequeued request
enum Admission {
    Issued(FetchRequest),
    Joined,
    Settled,
}

impl RequestPool {
    pub fn new(
        store: Arc<dyn FrameStore>,
        fetcher: Arc<dyn Fetch>,
        hint: Arc<dyn ConcurrencyHint>,
    ) -> Self {
        let (replies_tx, replies_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                store,
                fetcher,
                hint,
                replies_tx,
                replies_rx,
                stats: PoolStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &Arc<dyn FrameStore> {
        &self.shared.store
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Queue a fetch of `key` on `lane`.
    ///
    /// If the key is already resolved the callbacks settle on the next pump;
    /// if a fetch for it is in flight they join that fetch. Otherwise a request
    /// is queued at the tail, or at the head when `prepend` is set. Does not
    /// dispatch: call `tick()` once the batch is queued.
    #[allow(clippy::too_many_arguments)]
    pub fn add_request(
        &self,
        viewport: Option<ViewportId>,
        key: FrameKey,
        lane: Lane,
        prevent_cache: bool,
        on_done: DoneCallback,
        on_fail: FailCallback,
        prepend: bool,
    ) {
        let waiter = Waiter { on_done, on_fail };
        let cached = self.shared.store.get(&key);

        let mut state = self.lock();
        state.awake = true;

        if let Some(frame) = cached {
            trace!("{} already resolved, settling from store", key);
            self.shared.stats.store_hits.fetch_add(1, Ordering::Relaxed);
            state.settled.push_back(Settled {
                waiter,
                result: Ok(frame),
            });
            return;
        }

        if let Some(entry) = state.in_flight.get_mut(&key) {
            trace!("{} in flight (#{}), joining", key, entry.ticket);
            self.shared.stats.joined.fetch_add(1, Ordering::Relaxed);
            entry.waiters.push(waiter);
            return;
        }

        let request = Request {
            viewport,
            key,
            prevent_cache,
            waiter,
        };
        let queue = &mut state.lane_mut(lane).queue;
        if prepend {
            queue.push_front(request);
        } else {
            queue.push_back(request);
        }
    }

    /// Drop every queued request of `lane`. In-flight fetches are untouched.
    pub fn clear_lane(&self, lane: Lane) -> usize {
        let mut state = self.lock();
        let dropped = std::mem::take(&mut state.lane_mut(lane).queue).len();
        state.awake = !state.is_idle();
        if dropped > 0 {
            debug!("Cleared {} queued {} request(s)", dropped, lane);
        }
        dropped
    }

    /// Drop the queued requests of `lane` that belong to `viewport`.
    pub fn clear_lane_for(&self, lane: Lane, viewport: ViewportId) -> usize {
        self.clear_lane_owned_by(lane, Some(viewport))
    }

    /// Drop the queued requests of `lane` whose owner is `owner`. `None`
    /// matches requests not tied to any viewport.
    pub fn clear_lane_owned_by(&self, lane: Lane, owner: Option<ViewportId>) -> usize {
        let mut state = self.lock();
        let queue = &mut state.lane_mut(lane).queue;
        let before = queue.len();
        queue.retain(|r| r.viewport != owner);
        let dropped = before - queue.len();
        state.awake = !state.is_idle();
        if dropped > 0 {
            match owner {
                Some(id) => debug!("Cleared {} queued {} request(s) of viewport {}", dropped, lane, id),
                None => debug!("Cleared {} queued unowned {} request(s)", dropped, lane),
            }
        }
        dropped
    }

    /// One scheduling pass.
    ///
    /// Caps are recomputed from the current hint, the budget is
    /// `hint - total in flight`, and lanes are drained in strict priority
    /// order: a lower lane is used only when every higher lane is empty or
    /// at its own cap.
    pub fn tick(&self) {
        let hint = self.shared.hint.max_concurrent_transfers().max(1);
        let issued = {
            let mut state = self.lock();
            for lane in Lane::PRIORITY {
                state.lane_mut(lane).max_concurrent = lane.max_concurrent(hint);
            }

            let mut budget = hint.saturating_sub(state.total_in_flight());
            let mut issued = Vec::new();
            while budget > 0 {
                let Some(lane) = state.next_lane() else {
                    break;
                };
                let Some(request) = state.lane_mut(lane).queue.pop_front() else {
                    break;
                };
                if let Admission::Issued(fetch) = self.admit(&mut state, lane, request) {
                    issued.push(fetch);
                    budget -= 1;
                }
            }

            state.awake = !state.is_idle();
            if !state.awake {
                trace!("Request pool asleep");
            }
            issued
        };

        for request in issued {
            self.shared.stats.issued.fetch_add(1, Ordering::Relaxed);
            self.shared.fetcher.fetch(request, self.shared.replies_tx.clone());
        }
    }

    /// Turn a dequeued request into a fetch, a join or a store hit.
    fn admit(&self, state: &mut PoolState, lane: Lane, request: Request) -> Admission {
        let Request {
            key,
            prevent_cache,
            waiter,
            ..
        } = request;

        if let Some(frame) = self.shared.store.get(&key) {
            self.shared.stats.store_hits.fetch_add(1, Ordering::Relaxed);
            state.settled.push_back(Settled {
                waiter,
                result: Ok(frame),
            });
            return Admission::Settled;
        }

        if let Some(entry) = state.in_flight.get_mut(&key) {
            self.shared.stats.joined.fetch_add(1, Ordering::Relaxed);
            entry.waiters.push(waiter);
            return Admission::Joined;
        }

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.lane_mut(lane).in_flight += 1;
        state.in_flight.insert(
            key.clone(),
            InFlight {
                ticket,
                lane,
                prevent_cache,
                waiters: vec![waiter],
            },
        );
        trace!("dispatch #{} {} on {}", ticket, key, lane);

        Admission::Issued(FetchRequest {
            ticket,
            key,
            options: LoadOptions {
                prevent_cache,
                priority: lane,
            },
        })
    }

    /// Settle one reply: free the slot, store the frame, run waiters, tick.
    fn complete(&self, reply: FetchReply) {
        let FetchReply { ticket, key, result } = reply;

        let entry = {
            let mut state = self.lock();
            match state.in_flight.get(&key) {
                Some(entry) if entry.ticket == ticket => {}
                _ => {
                    warn!("Reply #{} for {} matches no in-flight fetch, ignored", ticket, key);
                    return;
                }
            }
            let Some(entry) = state.in_flight.remove(&key) else {
                return;
            };
            let lane = state.lane_mut(entry.lane);
            lane.in_flight = lane.in_flight.saturating_sub(1);
            entry
        };

        match &result {
            Ok(frame) if !entry.prevent_cache => self.shared.store.put(frame.clone()),
            Ok(_) => {}
            Err(e) => {
                self.shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!("fetch #{} on {} failed: {}", ticket, entry.lane, e);
            }
        }

        trace!("settle #{} {} ({} waiter(s))", ticket, key, entry.waiters.len());
        for waiter in entry.waiters {
            waiter.settle(result.clone());
        }

        self.tick();
    }

    fn take_settled(&self) -> Option<Settled> {
        self.lock().settled.pop_front()
    }

    /// Process everything that is ready without blocking.
    ///
    /// Returns the number of replies and store hits settled.
    pub fn pump(&self) -> usize {
        let mut settled = 0;
        loop {
            if let Ok(reply) = self.shared.replies_rx.try_recv() {
                self.complete(reply);
                settled += 1;
                continue;
            }
            if let Some(s) = self.take_settled() {
                s.waiter.settle(s.result);
                settled += 1;
                self.tick();
                continue;
            }
            break;
        }
        settled
    }

    /// Like `pump()`, but wait up to `timeout` for the first reply when
    /// nothing is ready yet.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        let ready = self.pump();
        if ready > 0 {
            return ready;
        }
        match self.shared.replies_rx.recv_timeout(timeout) {
            Ok(reply) => {
                self.complete(reply);
                1 + self.pump()
            }
            Err(_) => 0,
        }
    }

    /// Asleep iff every lane is empty and nothing is in flight or pending delivery.
    pub fn is_awake(&self) -> bool {
        self.lock().awake
    }

    pub fn in_flight(&self, lane: Lane) -> usize {
        self.lock().lane(lane).in_flight
    }

    pub fn total_in_flight(&self) -> usize {
        self.lock().total_in_flight()
    }

    /// Cap computed by the last `tick()`
    pub fn max_concurrent(&self, lane: Lane) -> usize {
        self.lock().lane(lane).max_concurrent
    }

    pub fn queued(&self, lane: Lane) -> usize {
        self.lock().lane(lane).queue.len()
    }

    /// Queued keys of `lane`, front first
    pub fn queued_keys(&self, lane: Lane) -> Vec<FrameKey> {
        self.lock().lane(lane).queue.iter().map(|r| r.key.clone()).collect()
    }

    pub fn is_in_flight(&self, key: &FrameKey) -> bool {
        self.lock().in_flight.contains_key(key)
    }
}
