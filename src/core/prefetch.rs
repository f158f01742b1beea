//! Prefetch planner: keep a window of unresolved frames queued around each
//! viewport's current index.
//!
//! **Why**: Scrolling a stack should rarely wait on the network. While the
//! user looks at frame N, frames N±1, N±2, ... are warmed on the low-priority
//! prefetch lane, nearest first.
//!
//! **Used by**: Engine (attach, eviction wiring, debounced re-plan),
//! FrameDisplayDispatcher (`on_resolved` after a paint).
//!
//! # Bookkeeping
//!
//! Each viewport carries a `PrefetchState`: the sorted set of indices still to
//! request. Indices leave the set when their frame resolves and come back when
//! the store evicts the key. An empty set disables planning until an eviction
//! re-populates it. A full store stops planning altogether: every viewport
//! is disabled until the host enables it again.
//!
//! # Window
//!
//! `prefetch_window()` walks outward from the current index over the sorted
//! set, alternating below/above, and stops each side independently once the
//! distance exceeds `max_images_to_prefetch`. Candidates are submitted in
//! reverse with `prepend`, so the lane queue ends up nearest-first.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::debounced_preloader::DebouncedPreloader;
use super::event_bus::EventBus;
use super::events::{LoadFailed, Subsystem};
use super::request_pool::RequestPool;
use crate::entities::{CacheFullListener, EvictionListener, FrameKey, Lane, Viewport, ViewportId};

/// Planner options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Max distance from the current index on each side (None = unbounded)
    pub max_images_to_prefetch: Option<usize>,
    /// Keep earlier queued prefetches when re-planning
    pub preserve_existing_pool: bool,
    /// Quiet time after the last display before a re-plan
    pub replan_delay_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_images_to_prefetch: None,
            preserve_existing_pool: false,
            replan_delay_ms: 300,
        }
    }
}

/// Indices of `indices` to request around `current`, nearest first.
///
/// Alternates lower/higher neighbours. Each side stops at the first index
/// farther than `max_distance`; the other side keeps growing.
pub fn prefetch_window(
    indices: &BTreeSet<usize>,
    current: usize,
    max_distance: Option<usize>,
) -> Vec<usize> {
    let within = |i: &usize| max_distance.is_none_or(|max| i.abs_diff(current) <= max);
    let mut lower = indices.range(..current).rev().copied().take_while(within);
    let mut higher = indices
        .range((Bound::Excluded(current), Bound::Unbounded))
        .copied()
        .take_while(within);

    let mut window = Vec::new();
    loop {
        let (lo, hi) = (lower.next(), higher.next());
        if lo.is_none() && hi.is_none() {
            break;
        }
        window.extend(lo);
        window.extend(hi);
    }
    window
}

struct PlannerShared {
    pool: RequestPool,
    bus: EventBus,
    config: Mutex<PrefetchConfig>,
    viewports: Mutex<HashMap<ViewportId, Viewport>>,
    replans: Mutex<DebouncedPreloader>,
}

/// Per-viewport prefetch planner. Cloning yields another handle.
#[derive(Clone)]
pub struct PrefetchPlanner {
    shared: Arc<PlannerShared>,
}

impl std::fmt::Debug for PrefetchPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchPlanner")
            .field("viewports", &self.viewports_snapshot().len())
            .field("config", &self.config())
            .finish()
    }
}

impl PrefetchPlanner {
    pub fn new(pool: RequestPool, bus: EventBus, config: PrefetchConfig) -> Self {
        let replans = DebouncedPreloader::new(config.replan_delay_ms);
        Self {
            shared: Arc::new(PlannerShared {
                pool,
                bus,
                config: Mutex::new(config),
                viewports: Mutex::new(HashMap::new()),
                replans: Mutex::new(replans),
            }),
        }
    }

    fn viewports(&self) -> MutexGuard<'_, HashMap<ViewportId, Viewport>> {
        self.shared.viewports.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn replans(&self) -> MutexGuard<'_, DebouncedPreloader> {
        self.shared.replans.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn viewports_snapshot(&self) -> Vec<Viewport> {
        self.viewports().values().cloned().collect()
    }

    pub fn config(&self) -> PrefetchConfig {
        self.shared.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_config(&self, config: PrefetchConfig) {
        self.replans().set_delay(config.replan_delay_ms);
        *self.shared.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn viewport(&self, id: ViewportId) -> Option<Viewport> {
        self.viewports().get(&id).cloned()
    }

    /// Register `viewport` and fill its to-request set with every index
    /// except the current one and those already resolved.
    pub fn initialize(&self, viewport: &Viewport) {
        let store = self.shared.pool.store();
        {
            let mut guard = viewport.lock();
            let state = &mut *guard;
            let current = state.current_index;
            state.prefetch.indices = state
                .keys
                .iter()
                .enumerate()
                .filter(|&(i, key)| i != current && !store.has(key))
                .map(|(i, _)| i)
                .collect();
            state.prefetch.enabled = true;
            state.prefetch.exhausted = false;
            debug!(
                "Prefetch initialized for {}: {} of {} indices to request",
                viewport.id(),
                state.prefetch.indices.len(),
                state.keys.len()
            );
        }
        self.viewports().insert(viewport.id(), viewport.clone());
    }

    /// Queue the prefetch window around the current index.
    ///
    /// Returns the number of requests submitted.
    pub fn plan(&self, viewport: &Viewport) -> usize {
        let config = self.config();
        let store = self.shared.pool.store();
        let id = viewport.id();

        let candidates: Vec<(usize, FrameKey)> = {
            let mut guard = viewport.lock();
            let state = &mut *guard;
            if !state.prefetch.enabled {
                trace!("Prefetch disabled for {}", id);
                return 0;
            }

            let keys = &state.keys;
            state
                .prefetch
                .indices
                .retain(|&i| keys.get(i).is_some_and(|key| !store.has(key)));

            if state.prefetch.indices.is_empty() {
                debug!("Prefetch for {} exhausted, disabling", id);
                state.prefetch.enabled = false;
                state.prefetch.exhausted = true;
                return 0;
            }

            prefetch_window(
                &state.prefetch.indices,
                state.current_index,
                config.max_images_to_prefetch,
            )
            .into_iter()
            .map(|i| (i, keys[i].clone()))
            .collect()
        };

        if !config.preserve_existing_pool {
            self.shared.pool.clear_lane_for(Lane::Prefetch, id);
        }

        debug!("Prefetch plan for {}: {} candidate(s)", id, candidates.len());
        let count = candidates.len();
        for (index, key) in candidates.into_iter().rev() {
            self.submit(viewport, index, key);
        }
        self.shared.pool.tick();
        count
    }

    fn submit(&self, viewport: &Viewport, index: usize, key: FrameKey) {
        let id = viewport.id();
        let planner: Weak<PlannerShared> = Arc::downgrade(&self.shared);
        let resolved = viewport.clone();
        let bus = self.shared.bus.clone();

        self.shared.pool.add_request(
            Some(id),
            key,
            Lane::Prefetch,
            false,
            Box::new(move |_frame| {
                if let Some(shared) = planner.upgrade() {
                    PrefetchPlanner { shared }.on_resolved(&resolved, index);
                }
            }),
            Box::new(move |error| {
                warn!("Prefetch of index {} for {} failed: {}", index, id, error);
                bus.emit(LoadFailed {
                    viewport: Some(id),
                    key: error.key().clone(),
                    error,
                    subsystem: Subsystem::Prefetch,
                });
            }),
            true,
        );
    }

    /// `index` resolved: drop it from the to-request set.
    pub fn on_resolved(&self, viewport: &Viewport, index: usize) {
        if viewport.lock().prefetch.indices.remove(&index) {
            trace!("Prefetch {} resolved index {}", viewport.id(), index);
        }
    }

    /// `key` was evicted: re-add every index of `viewport` that maps to it.
    ///
    /// Re-enables an exhausted plan. Returns true if anything was re-added.
    pub fn on_evicted(&self, viewport: &Viewport, key: &FrameKey) -> bool {
        let indices = viewport.indices_of(key);
        if indices.is_empty() {
            return false;
        }
        let mut state = viewport.lock();
        let mut added = false;
        for i in indices {
            added |= state.prefetch.indices.insert(i);
        }
        if added {
            trace!("Evicted {} re-queued for {}", key, viewport.id());
            if state.prefetch.exhausted {
                state.prefetch.enabled = true;
                state.prefetch.exhausted = false;
            }
        }
        added
    }

    /// Dispatch one store eviction to every registered viewport.
    pub fn handle_eviction(&self, key: &FrameKey) {
        for viewport in self.viewports_snapshot() {
            self.on_evicted(&viewport, key);
        }
    }

    /// Store eviction listener that forwards to `handle_eviction`.
    pub fn eviction_listener(&self) -> EvictionListener {
        let planner = Arc::downgrade(&self.shared);
        Arc::new(move |key: &FrameKey| {
            if let Some(shared) = planner.upgrade() {
                PrefetchPlanner { shared }.handle_eviction(key);
            }
        })
    }

    /// Store cache-full listener: stop every planner and drop the whole
    /// prefetch lane, study requests included.
    pub fn cache_full_listener(&self) -> CacheFullListener {
        let planner = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = planner.upgrade() {
                let planner = PrefetchPlanner { shared };
                let stopped = planner.disable_all();
                let dropped = planner.shared.pool.clear_lane(Lane::Prefetch);
                if stopped > 0 || dropped > 0 {
                    warn!(
                        "Frame store full: prefetch stopped for {} viewport(s), {} queued request(s) dropped",
                        stopped, dropped
                    );
                }
            }
        })
    }

    pub fn enable(&self, viewport: &Viewport) {
        let mut state = viewport.lock();
        state.prefetch.enabled = true;
        state.prefetch.exhausted = false;
    }

    /// Stop planning for `viewport` and drop its queued prefetches.
    pub fn disable(&self, viewport: &Viewport) {
        {
            let mut state = viewport.lock();
            state.prefetch.enabled = false;
            state.prefetch.exhausted = false;
        }
        self.replans().cancel(viewport.id());
        self.shared.pool.clear_lane_for(Lane::Prefetch, viewport.id());
    }

    /// Stop planning for every registered viewport.
    ///
    /// Returns how many were enabled.
    pub fn disable_all(&self) -> usize {
        let mut stopped = 0;
        for viewport in self.viewports_snapshot() {
            if viewport.prefetch_enabled() {
                stopped += 1;
            }
            self.disable(&viewport);
        }
        stopped
    }

    /// Forget `id`: no more planning, evictions or queued prefetches for it.
    pub fn detach(&self, id: ViewportId) {
        if let Some(viewport) = self.viewports().remove(&id) {
            viewport.lock().prefetch.enabled = false;
        }
        self.replans().cancel(id);
        self.shared.pool.clear_lane_for(Lane::Prefetch, id);
    }

    /// Re-plan `id` once it has been still for `replan_delay_ms`.
    pub fn schedule_replan(&self, id: ViewportId, now: Instant) {
        self.replans().schedule(id, now);
    }

    pub fn replan_pending(&self, id: ViewportId) -> bool {
        self.replans().is_pending(id)
    }

    /// Run every re-plan whose delay elapsed. Returns the number planned.
    pub fn poll_replans(&self, now: Instant) -> usize {
        let due = self.replans().tick_at(now);
        let mut planned = 0;
        for id in due {
            match self.viewport(id) {
                Some(viewport) => {
                    self.plan(&viewport);
                    planned += 1;
                }
                None => trace!("Re-plan for detached viewport {} dropped", id),
            }
        }
        planned
    }
}
