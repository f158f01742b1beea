//! Frame display dispatcher: move a viewport to an index and paint only the
//! frame it still wants.
//!
//! Per viewport: `Idle -> Loading(target) -> Idle (painted | discarded)`.
//!
//! Every retarget bumps the viewport's generation. A completion captures the
//! generation it was issued under and paints only if it is still current, so
//! a late frame for a superseded target is dropped without a trace.
//!
//! Sequential mode queues targets FIFO and issues the next one only after the
//! previous settled (painted, failed or superseded). Every intermediate index
//! is loaded and shown in request order.

use std::sync::Arc;

use log::{debug, trace};

use super::event_bus::EventBus;
use super::events::{FrameDisplayed, LoadFailed, LoadStarted, Subsystem};
use super::prefetch::PrefetchPlanner;
use super::request_pool::RequestPool;
use crate::entities::{DisplaySurface, Frame, FrameKey, Lane, LoadError, Viewport};

/// One issued display load
#[derive(Debug, Clone)]
struct DisplayLoad {
    index: usize,
    key: FrameKey,
    generation: u64,
    prevent_cache: bool,
    sequential: bool,
}

#[derive(Clone)]
pub struct FrameDisplayDispatcher {
    pool: RequestPool,
    surface: Arc<dyn DisplaySurface>,
    bus: EventBus,
    planner: Option<PrefetchPlanner>,
}

impl std::fmt::Debug for FrameDisplayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDisplayDispatcher")
            .field("planner", &self.planner.is_some())
            .finish()
    }
}

impl FrameDisplayDispatcher {
    pub fn new(pool: RequestPool, surface: Arc<dyn DisplaySurface>, bus: EventBus) -> Self {
        Self {
            pool,
            surface,
            bus,
            planner: None,
        }
    }

    /// Report resolved indices to `planner` after each paint.
    pub fn with_planner(mut self, planner: PrefetchPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    /// Move `viewport` to `index` (clamped into the stack).
    ///
    /// No-op (false) if the target is already current, before or after
    /// clamping, or the stack is empty. Otherwise the viewport retargets
    /// immediately and the frame loads on the interactive lane.
    pub fn go_to(&self, viewport: &Viewport, index: isize) -> bool {
        let load = {
            let mut state = viewport.lock();
            if index == state.current_index as isize {
                return false;
            }
            let Some(target) = state.clamp_index(index) else {
                debug!("go_to on empty viewport {} ignored", viewport.id());
                return false;
            };
            if target == state.current_index {
                return false;
            }

            state.pending_targets.clear();
            state.current_index = target;
            state.generation += 1;
            DisplayLoad {
                index: target,
                key: state.keys[target].clone(),
                generation: state.generation,
                prevent_cache: state.prevent_cache,
                sequential: false,
            }
        };
        self.issue(viewport, load);
        true
    }

    /// Load and paint the current index unconditionally (initial display).
    pub fn refresh(&self, viewport: &Viewport) -> bool {
        let load = {
            let mut state = viewport.lock();
            if state.is_empty() {
                return false;
            }
            state.generation += 1;
            let index = state.current_index;
            DisplayLoad {
                index,
                key: state.keys[index].clone(),
                generation: state.generation,
                prevent_cache: state.prevent_cache,
                sequential: false,
            }
        };
        self.issue(viewport, load);
        true
    }

    /// Queue `index` for in-order display.
    ///
    /// Returns false for an empty stack.
    pub fn go_to_sequential(&self, viewport: &Viewport, index: isize) -> bool {
        {
            let mut state = viewport.lock();
            let Some(target) = state.clamp_index(index) else {
                return false;
            };
            state.pending_targets.push_back(target);
        }
        self.advance_pending(viewport);
        true
    }

    /// Issue the next sequential target unless one is still loading.
    ///
    /// Entries equal to the current index are dequeued as no-ops.
    pub fn advance_pending(&self, viewport: &Viewport) {
        let load = {
            let mut state = viewport.lock();
            if state.sequential_busy {
                return;
            }
            loop {
                let Some(target) = state.pending_targets.pop_front() else {
                    return;
                };
                if target == state.current_index {
                    trace!("sequential target {} already current", target);
                    continue;
                }
                state.current_index = target;
                state.generation += 1;
                state.sequential_busy = true;
                break DisplayLoad {
                    index: target,
                    key: state.keys[target].clone(),
                    generation: state.generation,
                    prevent_cache: state.prevent_cache,
                    sequential: true,
                };
            }
        };
        self.issue(viewport, load);
    }

    fn issue(&self, viewport: &Viewport, load: DisplayLoad) {
        let id = viewport.id();
        trace!("display {} index {} (gen {})", id, load.index, load.generation);
        self.bus.emit(LoadStarted {
            viewport: id,
            index: load.index,
            key: load.key.clone(),
        });

        let on_done = {
            let this = self.clone();
            let viewport = viewport.clone();
            let load = load.clone();
            Box::new(move |frame: Frame| this.completed(&viewport, &load, frame))
        };
        let on_fail = {
            let this = self.clone();
            let viewport = viewport.clone();
            let load = load.clone();
            Box::new(move |error: LoadError| this.failed(&viewport, &load, error))
        };

        self.pool.add_request(
            Some(id),
            load.key,
            Lane::Interactive,
            load.prevent_cache,
            on_done,
            on_fail,
            false,
        );
        self.pool.tick();
    }

    fn completed(&self, viewport: &Viewport, load: &DisplayLoad, frame: Frame) {
        if viewport.generation() != load.generation {
            trace!(
                "stale frame {} for {} dropped (gen {} superseded)",
                load.key,
                viewport.id(),
                load.generation
            );
        } else {
            self.surface.display(viewport.id(), &frame);
            self.bus.emit(FrameDisplayed {
                viewport: viewport.id(),
                index: load.index,
                key: load.key.clone(),
            });
            if let Some(planner) = &self.planner {
                planner.on_resolved(viewport, load.index);
            }
        }
        self.settled(viewport, load);
    }

    fn failed(&self, viewport: &Viewport, load: &DisplayLoad, error: LoadError) {
        debug!("display load {} for {} failed: {}", load.key, viewport.id(), error);
        self.bus.emit(LoadFailed {
            viewport: Some(viewport.id()),
            key: load.key.clone(),
            error,
            subsystem: Subsystem::Display,
        });
        self.settled(viewport, load);
    }

    fn settled(&self, viewport: &Viewport, load: &DisplayLoad) {
        if load.sequential {
            viewport.lock().sequential_busy = false;
            self.advance_pending(viewport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::downcast_event;
    use crate::core::frame_store::LruFrameStore;
    use crate::core::prefetch::PrefetchConfig;
    use crate::core::testing::{ManualFetcher, RecordingSurface, noop_done, noop_fail};
    use crate::entities::{FixedHint, FrameStore};

    struct Fixture {
        dispatcher: FrameDisplayDispatcher,
        fetcher: Arc<ManualFetcher>,
        surface: Arc<RecordingSurface>,
        bus: EventBus,
        store: Arc<LruFrameStore>,
    }

    fn fixture(hint: usize) -> Fixture {
        let store = Arc::new(LruFrameStore::new(1000, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let surface = Arc::new(RecordingSurface::new());
        let bus = EventBus::new();
        let pool = RequestPool::new(store.clone(), fetcher.clone(), Arc::new(FixedHint(hint)));
        let dispatcher = FrameDisplayDispatcher::new(pool, surface.clone(), bus.clone());
        Fixture {
            dispatcher,
            fetcher,
            surface,
            bus,
            store,
        }
    }

    fn viewport(n: usize, current: usize) -> Viewport {
        Viewport::new((0..n).map(|i| FrameKey::from(format!("k{i}"))).collect(), current)
    }

    fn pump(f: &Fixture) {
        f.dispatcher.pool().pump();
    }

    #[test]
    fn test_go_to_same_index_is_noop() {
        let f = fixture(4);
        let vp = viewport(10, 3);
        assert!(!f.dispatcher.go_to(&vp, 3));
        // Clamps onto the current index
        let last = viewport(5, 4);
        assert!(!f.dispatcher.go_to(&last, 40));
        assert_eq!(f.fetcher.issued_count(), 0);
    }

    #[test]
    fn test_go_to_retargets_before_load() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        assert!(f.dispatcher.go_to(&vp, 4));
        assert_eq!(vp.current_index(), 4);
        assert!(f.surface.painted_keys().is_empty());

        f.fetcher.complete_ok("k4");
        pump(&f);
        assert_eq!(f.surface.painted(), vec![(vp.id(), "k4".to_string())]);
    }

    #[test]
    fn test_go_to_clamps() {
        let f = fixture(4);
        let vp = viewport(5, 2);
        assert!(f.dispatcher.go_to(&vp, -7));
        assert_eq!(vp.current_index(), 0);
        assert!(f.dispatcher.go_to(&vp, 99));
        assert_eq!(vp.current_index(), 4);
        assert_eq!(f.fetcher.issued_keys(), vec!["k0", "k4"]);
    }

    #[test]
    fn test_empty_viewport_is_noop() {
        let f = fixture(4);
        let vp = viewport(0, 0);
        assert!(!f.dispatcher.go_to(&vp, 1));
        assert!(!f.dispatcher.refresh(&vp));
        assert!(!f.dispatcher.go_to_sequential(&vp, 0));
    }

    #[test]
    fn test_stale_response_suppressed() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        f.dispatcher.go_to(&vp, 5);
        f.dispatcher.go_to(&vp, 6);
        f.dispatcher.go_to(&vp, 7);

        f.fetcher.complete_ok("k5");
        f.fetcher.complete_ok("k6");
        pump(&f);
        assert!(f.surface.painted_keys().is_empty());

        f.fetcher.complete_ok("k7");
        pump(&f);
        assert_eq!(f.surface.painted_keys(), vec!["k7"]);
    }

    #[test]
    fn test_return_to_earlier_target_joins_fetch() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        f.dispatcher.go_to(&vp, 5);
        f.dispatcher.go_to(&vp, 6);
        f.dispatcher.go_to(&vp, 5);
        assert_eq!(f.fetcher.issued_keys(), vec!["k5", "k6"]);

        f.fetcher.complete_ok("k5");
        pump(&f);
        // Only the latest waiter paints
        assert_eq!(f.surface.painted_keys(), vec!["k5"]);
    }

    #[test]
    fn test_lifecycle_events() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        f.dispatcher.go_to(&vp, 2);
        f.dispatcher.go_to(&vp, 3);
        f.fetcher.complete_ok("k3");
        f.fetcher.complete_err("k2");
        pump(&f);

        let events = f.bus.poll();
        let started = events.iter().filter_map(downcast_event::<LoadStarted>).count();
        let displayed: Vec<_> = events.iter().filter_map(downcast_event::<FrameDisplayed>).collect();
        let failed: Vec<_> = events.iter().filter_map(downcast_event::<LoadFailed>).collect();

        assert_eq!(started, 2);
        assert_eq!(displayed.len(), 1);
        assert_eq!(displayed[0].index, 3);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key.as_str(), "k2");
        assert_eq!(failed[0].subsystem, Subsystem::Display);
    }

    #[test]
    fn test_failure_does_not_paint() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        f.dispatcher.go_to(&vp, 1);
        f.fetcher.complete_err("k1");
        pump(&f);
        assert!(f.surface.painted_keys().is_empty());
        assert_eq!(vp.current_index(), 1);
    }

    #[test]
    fn test_refresh_paints_current_from_store() {
        let f = fixture(4);
        let vp = viewport(3, 1);
        f.store.put(crate::core::testing::test_frame("k1"));
        assert!(f.dispatcher.refresh(&vp));
        pump(&f);
        assert_eq!(f.surface.painted_keys(), vec!["k1"]);
        assert_eq!(f.fetcher.issued_count(), 0);
    }

    #[test]
    fn test_sequential_mode_ordering() {
        let f = fixture(6);
        let vp = viewport(10, 0);

        // Warm 4 and 5 on the prefetch lane so they are in flight first
        for key in ["k4", "k5"] {
            f.dispatcher.pool().add_request(None, FrameKey::from(key), Lane::Prefetch, false, noop_done(), noop_fail(), false);
        }
        f.dispatcher.pool().tick();

        f.dispatcher.go_to_sequential(&vp, 3);
        f.dispatcher.go_to_sequential(&vp, 4);
        f.dispatcher.go_to_sequential(&vp, 5);
        assert_eq!(vp.pending_targets(), vec![4, 5]);

        // Completions arrive in reverse order
        f.fetcher.complete_ok("k5");
        f.fetcher.complete_ok("k4");
        pump(&f);
        assert!(f.surface.painted_keys().is_empty());

        f.fetcher.complete_ok("k3");
        pump(&f);
        assert_eq!(f.surface.painted_keys(), vec!["k3", "k4", "k5"]);
        assert!(vp.pending_targets().is_empty());
    }

    #[test]
    fn test_sequential_continues_after_failure() {
        let f = fixture(4);
        let vp = viewport(10, 0);
        f.dispatcher.go_to_sequential(&vp, 1);
        f.dispatcher.go_to_sequential(&vp, 2);

        f.fetcher.complete_err("k1");
        pump(&f);
        f.fetcher.complete_ok("k2");
        pump(&f);
        assert_eq!(f.surface.painted_keys(), vec!["k2"]);
    }

    #[test]
    fn test_sequential_current_target_dequeued() {
        let f = fixture(4);
        let vp = viewport(10, 2);
        f.dispatcher.go_to_sequential(&vp, 2);
        assert!(vp.pending_targets().is_empty());
        assert_eq!(f.fetcher.issued_count(), 0);
    }

    #[test]
    fn test_paint_reports_resolved_to_planner() {
        let store = Arc::new(LruFrameStore::new(1000, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let pool = RequestPool::new(store, fetcher.clone(), Arc::new(FixedHint(4)));
        let bus = EventBus::new();
        let planner = PrefetchPlanner::new(pool.clone(), bus.clone(), PrefetchConfig::default());
        let dispatcher = FrameDisplayDispatcher::new(pool.clone(), Arc::new(RecordingSurface::new()), bus)
            .with_planner(planner.clone());

        let vp = viewport(5, 0);
        planner.initialize(&vp);
        planner.disable(&vp);
        dispatcher.go_to(&vp, 3);
        fetcher.complete_ok("k3");
        pool.pump();
        assert_eq!(vp.prefetch_indices(), vec![1, 2, 4]);
    }
}
