//! Engine: one scheduler value wiring pool, planner, dispatcher and player.
//!
//! The host owns an `Engine`, attaches stacks as viewports and calls
//! `update(now)` from its loop. Everything (callbacks, paints, re-plans,
//! clip steps) happens inside `update` or inside the navigation call that
//! triggered it, on the host thread.
//!
//! Wiring:
//! - store evictions -> `PrefetchPlanner::handle_eviction`
//! - store full -> every planner disabled, prefetch lane dropped, study
//!   prefetch detached
//! - `FrameDisplayed` -> debounced re-plan of that viewport, and a debounced
//!   study prefetch when it is the active study viewport
//! - dispatcher paints -> `PrefetchPlanner::on_resolved`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, info};

use super::clip_player::{ClipPlayer, SyncedStacks};
use super::debounced_preloader::DebouncedPreloader;
use super::dispatcher::FrameDisplayDispatcher;
use super::event_bus::EventBus;
use super::events::FrameDisplayed;
use super::prefetch::PrefetchPlanner;
use super::request_pool::RequestPool;
use super::study_prefetch::StudyPrefetcher;
use crate::config::Config;
use crate::entities::{
    ConcurrencyHint, DisplaySurface, Fetch, FrameKey, FrameStore, StackRenderer, Viewport,
    ViewportId,
};

/// Work done by one `update()`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    /// Replies and store hits delivered
    pub settled: usize,
    pub replans: usize,
    pub clip_steps: usize,
    /// Debounced study prefetches run
    pub study_prefetches: usize,
}

impl UpdateReport {
    pub fn is_idle(&self) -> bool {
        self.settled == 0 && self.replans == 0 && self.clip_steps == 0 && self.study_prefetches == 0
    }
}

pub struct Engine {
    pool: RequestPool,
    bus: EventBus,
    planner: PrefetchPlanner,
    dispatcher: FrameDisplayDispatcher,
    clips: ClipPlayer,
    study: StudyPrefetcher,
    /// Attach order is study order
    viewports: IndexMap<ViewportId, Viewport>,
    /// Viewports painted since the last update, awaiting a re-plan schedule
    displayed: Arc<Mutex<Vec<ViewportId>>>,
    /// Viewport whose new images re-run study prefetch
    study_active: Option<ViewportId>,
    study_replans: DebouncedPreloader,
    /// Raised by the store, consumed by `update`
    cache_full: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Arc<dyn FrameStore>,
        fetcher: Arc<dyn Fetch>,
        surface: Arc<dyn DisplaySurface>,
        hint: Arc<dyn ConcurrencyHint>,
    ) -> Self {
        let bus = EventBus::new();
        let pool = RequestPool::new(Arc::clone(&store), fetcher, hint);
        let planner = PrefetchPlanner::new(pool.clone(), bus.clone(), config.prefetch.clone());
        store.subscribe_evictions(planner.eviction_listener());
        store.subscribe_full(planner.cache_full_listener());
        let cache_full = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cache_full);
        store.subscribe_full(Arc::new(move || flag.store(true, Ordering::Relaxed)));

        let dispatcher =
            FrameDisplayDispatcher::new(pool.clone(), surface, bus.clone()).with_planner(planner.clone());
        let clips = ClipPlayer::new(dispatcher.clone(), bus.clone(), config.clip.clone());
        let study = StudyPrefetcher::new(pool.clone(), bus.clone(), config.study.clone());

        let displayed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&displayed);
        bus.subscribe::<FrameDisplayed, _>(move |event| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(event.viewport);
        });

        info!(
            "Engine ready (prefetch window: {}, replan delay: {}ms)",
            config
                .prefetch
                .max_images_to_prefetch
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            config.prefetch.replan_delay_ms
        );

        Self {
            pool,
            bus,
            planner,
            dispatcher,
            clips,
            study,
            viewports: IndexMap::new(),
            displayed,
            study_active: None,
            study_replans: DebouncedPreloader::new(config.study.prefetch_delay_ms),
            cache_full,
        }
    }

    /// Attach a stack: show `start`, then plan its prefetch window.
    pub fn attach(&mut self, keys: Vec<FrameKey>, start: usize) -> Viewport {
        self.attach_with(keys, start, false)
    }

    pub fn attach_with(&mut self, keys: Vec<FrameKey>, start: usize, prevent_cache: bool) -> Viewport {
        let viewport = Viewport::new(keys, start).with_prevent_cache(prevent_cache);
        debug!(
            "Attach viewport {} ({} frames, start {})",
            viewport.id(),
            viewport.len(),
            viewport.current_index()
        );
        self.viewports.insert(viewport.id(), viewport.clone());
        self.planner.initialize(&viewport);
        self.dispatcher.refresh(&viewport);
        self.planner.plan(&viewport);
        viewport
    }

    /// Detach a viewport. Outstanding loads for it settle unseen.
    pub fn detach(&mut self, id: ViewportId) -> bool {
        let Some(viewport) = self.viewports.shift_remove(&id) else {
            return false;
        };
        self.clips.remove(id);
        self.planner.detach(id);
        self.study_replans.cancel(id);
        if self.study_active == Some(id) {
            self.study_active = None;
        }
        {
            let mut state = viewport.lock();
            state.generation += 1;
            state.pending_targets.clear();
        }
        debug!("Detached viewport {}", id);
        true
    }

    pub fn viewport(&self, id: ViewportId) -> Option<&Viewport> {
        self.viewports.get(&id)
    }

    pub fn viewports(&self) -> impl Iterator<Item = &Viewport> {
        self.viewports.values()
    }

    pub fn go_to(&self, id: ViewportId, index: isize) -> bool {
        self.viewports
            .get(&id)
            .is_some_and(|vp| self.dispatcher.go_to(vp, index))
    }

    /// Step by `delta` frames from the current index (clamped).
    pub fn scroll(&self, id: ViewportId, delta: isize) -> bool {
        let Some(vp) = self.viewports.get(&id) else {
            return false;
        };
        let target = vp.current_index() as isize + delta;
        self.dispatcher.go_to(vp, target)
    }

    pub fn go_to_sequential(&self, id: ViewportId, index: isize) -> bool {
        self.viewports
            .get(&id)
            .is_some_and(|vp| self.dispatcher.go_to_sequential(vp, index))
    }

    pub fn play(&mut self, id: ViewportId, fps: Option<f64>, now: Instant) -> bool {
        match self.viewports.get(&id) {
            Some(vp) => self.clips.play(vp, fps, now),
            None => false,
        }
    }

    pub fn stop(&mut self, id: ViewportId) {
        self.clips.stop(id);
    }

    /// Move `ids` together during playback of any of them.
    pub fn sync(&mut self, ids: &[ViewportId]) {
        let stacks: Vec<Viewport> = ids.iter().filter_map(|id| self.viewports.get(id).cloned()).collect();
        let renderer: Arc<dyn StackRenderer> = Arc::new(SyncedStacks::new(self.dispatcher.clone(), stacks.clone()));
        for vp in &stacks {
            self.clips.set_renderer(vp, Some(Arc::clone(&renderer)));
        }
    }

    /// Make `active` the study's active stack and prefetch around it.
    ///
    /// Every other planner is stopped and `active` plans alone; whole
    /// neighbouring stacks (attach order) go on the prefetch lane. New images
    /// on `active` re-run the study prefetch once they settle for
    /// `prefetch_delay_ms`.
    pub fn prefetch_study(&mut self, active: ViewportId) -> usize {
        let Some(viewport) = self.viewports.get(&active).cloned() else {
            return 0;
        };
        self.stop_prefetching();
        self.planner.enable(&viewport);
        self.planner.plan(&viewport);
        self.study_active = Some(active);
        self.run_study_prefetch(active)
    }

    fn run_study_prefetch(&self, active: ViewportId) -> usize {
        let Some(position) = self.viewports.get_index_of(&active) else {
            return 0;
        };
        let stacks: Vec<Vec<FrameKey>> = self.viewports.values().map(|vp| vp.lock().keys.clone()).collect();
        self.study.prefetch(&stacks, position)
    }

    /// Stop every prefetch: disable all planners, detach study prefetch and
    /// drop queued prefetches.
    pub fn stop_prefetching(&mut self) -> usize {
        if let Some(id) = self.study_active.take() {
            self.study_replans.cancel(id);
        }
        self.planner.disable_all();
        self.study.stop_prefetching()
    }

    pub fn study_active(&self) -> Option<ViewportId> {
        self.study_active
    }

    /// Advance everything due at `now`.
    pub fn update(&mut self, now: Instant) -> UpdateReport {
        let clip_steps = self.clips.update(now);
        let settled = self.pool.pump();

        // Planners were already stopped by the store listener
        if self.cache_full.swap(false, Ordering::Relaxed) && self.study_active.is_some() {
            debug!("Study prefetch detached after the store filled");
            if let Some(id) = self.study_active.take() {
                self.study_replans.cancel(id);
            }
        }

        let painted: Vec<ViewportId> =
            std::mem::take(&mut *self.displayed.lock().unwrap_or_else(|e| e.into_inner()));
        for id in painted {
            self.planner.schedule_replan(id, now);
            if self.study_active == Some(id) {
                self.study_replans.schedule(id, now);
            }
        }
        let replans = self.planner.poll_replans(now);

        let mut study_prefetches = 0;
        for id in self.study_replans.tick_at(now) {
            if self.study_active == Some(id) {
                self.run_study_prefetch(id);
                study_prefetches += 1;
            }
        }

        UpdateReport {
            settled,
            replans,
            clip_steps,
            study_prefetches,
        }
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn planner(&self) -> &PrefetchPlanner {
        &self.planner
    }

    pub fn dispatcher(&self) -> &FrameDisplayDispatcher {
        &self.dispatcher
    }

    pub fn clips(&self) -> &ClipPlayer {
        &self.clips
    }

    pub fn clips_mut(&mut self) -> &mut ClipPlayer {
        &mut self.clips
    }

    pub fn study(&self) -> &StudyPrefetcher {
        &self.study
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame_store::LruFrameStore;
    use crate::core::testing::{ManualFetcher, RecordingSurface};
    use crate::entities::{FixedHint, Lane};
    use std::time::Duration;

    fn keys(prefix: &str, n: usize) -> Vec<FrameKey> {
        (0..n).map(|i| FrameKey::from(format!("{prefix}{i}"))).collect()
    }

    fn engine(config: Config, capacity: usize) -> (Engine, Arc<ManualFetcher>, Arc<RecordingSurface>, Arc<LruFrameStore>) {
        let store = Arc::new(LruFrameStore::new(capacity, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let surface = Arc::new(RecordingSurface::new());
        let engine = Engine::new(&config, store.clone(), fetcher.clone(), surface.clone(), Arc::new(FixedHint(2)));
        (engine, fetcher, surface, store)
    }

    fn windowed(max: usize) -> Config {
        let mut config = Config::default();
        config.prefetch.max_images_to_prefetch = Some(max);
        config.prefetch.replan_delay_ms = 100;
        config
    }

    /// Complete every pending fetch and update until nothing is outstanding.
    fn settle_all(engine: &mut Engine, fetcher: &ManualFetcher, t: &mut Instant) {
        for _ in 0..50 {
            *t += Duration::from_millis(200);
            engine.update(*t);
            let pending = fetcher.pending_keys();
            if pending.is_empty() {
                return;
            }
            for key in pending {
                fetcher.complete_ok(&key);
            }
        }
        panic!("fetches still pending after 50 rounds");
    }

    #[test]
    fn test_attach_shows_start_then_prefetches() {
        let (mut engine, fetcher, surface, _) = engine(windowed(1), 100);
        let vp = engine.attach(keys("a", 10), 5);

        // Interactive first, prefetch window queued behind it
        assert_eq!(fetcher.issued_keys(), vec!["a5", "a4"]);
        assert_eq!(engine.pool().queued_keys(Lane::Prefetch), vec![FrameKey::from("a6")]);

        fetcher.complete_ok("a5");
        let report = engine.update(Instant::now());
        assert_eq!(report.settled, 1);
        assert_eq!(surface.painted_keys(), vec!["a5"]);
        assert_eq!(vp.current_index(), 5);
    }

    #[test]
    fn test_display_schedules_debounced_replan() {
        let (mut engine, fetcher, _, _) = engine(windowed(1), 100);
        let vp = engine.attach(keys("a", 10), 5);
        let t0 = Instant::now();

        fetcher.complete_ok("a5");
        fetcher.complete_ok("a4");
        engine.update(t0);
        assert!(engine.planner().replan_pending(vp.id()));

        engine.go_to(vp.id(), 8);
        fetcher.complete_ok("a6");
        fetcher.complete_ok("a8");
        engine.update(t0 + Duration::from_millis(50));

        // Debounced from the latest display
        assert_eq!(engine.update(t0 + Duration::from_millis(120)).replans, 0);
        let report = engine.update(t0 + Duration::from_millis(150));
        assert_eq!(report.replans, 1);
        assert_eq!(fetcher.issued_keys().last().map(String::as_str), Some("a7"));
        assert_eq!(engine.pool().queued_keys(Lane::Prefetch), vec![FrameKey::from("a9")]);
    }

    #[test]
    fn test_eviction_repopulates_plan() {
        let (mut engine, fetcher, _, store) = engine(windowed(1), 100);
        let vp = engine.attach(keys("a", 10), 5);
        fetcher.complete_ok("a5");
        fetcher.complete_ok("a4");
        engine.update(Instant::now());
        assert!(!vp.prefetch_indices().contains(&4));

        store.remove(&FrameKey::from("a4"));
        assert!(vp.prefetch_indices().contains(&4));
    }

    #[test]
    fn test_detach_suppresses_late_paint() {
        let (mut engine, fetcher, surface, _) = engine(windowed(1), 100);
        let vp = engine.attach(keys("a", 10), 5);
        assert!(engine.detach(vp.id()));
        assert!(!engine.detach(vp.id()));

        fetcher.complete_ok("a5");
        engine.update(Instant::now());
        assert!(surface.painted_keys().is_empty());
        assert_eq!(engine.pool().queued(Lane::Prefetch), 0);
        assert!(!engine.go_to(vp.id(), 2));
    }

    #[test]
    fn test_clip_playback_through_engine() {
        let (mut engine, fetcher, surface, _) = engine(windowed(0), 100);
        let vp = engine.attach(keys("a", 3), 0);
        let t0 = Instant::now();
        assert!(engine.play(vp.id(), Some(10.0), t0));

        engine.update(t0 + Duration::from_millis(100));
        assert_eq!(vp.current_index(), 1);
        fetcher.complete_ok("a0");
        fetcher.complete_ok("a1");
        engine.update(t0 + Duration::from_millis(150));
        // a0 was superseded by the first step
        assert_eq!(surface.painted_keys(), vec!["a1"]);

        engine.stop(vp.id());
        assert!(!engine.clips().is_playing(vp.id()));
    }

    #[test]
    fn test_study_prefetch_uses_attach_order() {
        let mut config = windowed(0);
        config.study.display_set_count = 1;
        config.study.order = Some(crate::core::study_prefetch::PrefetchOrder::Downward);
        let (mut engine, fetcher, _, _) = engine(config, 100);
        let a = engine.attach(keys("a", 1), 0);
        engine.attach(keys("b", 2), 0);
        engine.attach(keys("c", 2), 0);
        assert_eq!(fetcher.issued_keys(), vec!["a0", "b0"]);

        // b0 joins its in-flight display load, b1 waits behind the budget
        assert_eq!(engine.prefetch_study(a.id()), 2);
        assert_eq!(engine.pool().queued_keys(Lane::Prefetch), vec![FrameKey::from("b1")]);
        assert_eq!(engine.stop_prefetching(), 1);
        assert_eq!(engine.pool().queued(Lane::Prefetch), 0);
    }

    #[test]
    fn test_full_store_stops_prefetch() {
        let mut config = Config::default();
        config.prefetch.replan_delay_ms = 100;
        let (mut engine, fetcher, surface, store) = engine(config, 3);
        let vp = engine.attach(keys("a", 10), 0);
        let mut t = Instant::now();

        // a0 display, then a1..a3 prefetched until a3 overflows the store
        settle_all(&mut engine, &fetcher, &mut t);
        assert_eq!(fetcher.issued_keys(), vec!["a0", "a1", "a2", "a3"]);
        assert!(!vp.prefetch_enabled());
        assert_eq!(engine.pool().queued(Lane::Prefetch), 0);
        assert!(!store.has(&FrameKey::from("a0")));

        for _ in 0..4 {
            assert!(engine.scroll(vp.id(), 1));
            settle_all(&mut engine, &fetcher, &mut t);
        }
        assert_eq!(vp.current_index(), 4);
        assert_eq!(surface.painted_keys(), vec!["a0", "a1", "a2", "a3", "a4"]);
        // Only the frame that was never loaded is fetched
        assert_eq!(fetcher.issued_count(), 5);
    }

    #[test]
    fn test_new_image_reruns_study_prefetch() {
        let mut config = windowed(0);
        config.study.display_set_count = 1;
        config.study.order = Some(crate::core::study_prefetch::PrefetchOrder::Downward);
        config.study.prefetch_delay_ms = 100;
        let (mut engine, fetcher, _, store) = engine(config, 100);
        let a = engine.attach(keys("a", 3), 0);
        let b = engine.attach(keys("b", 2), 0);
        engine.attach(keys("c", 2), 0);
        let mut t = Instant::now();

        assert_eq!(engine.prefetch_study(a.id()), 2);
        assert_eq!(engine.study_active(), Some(a.id()));
        assert!(!b.prefetch_enabled());
        settle_all(&mut engine, &fetcher, &mut t);
        assert!(store.has(&FrameKey::from("b1")));

        store.remove(&FrameKey::from("b1"));
        assert!(engine.go_to(a.id(), 1));
        settle_all(&mut engine, &fetcher, &mut t);

        // Debounced from the a1 paint
        assert_eq!(engine.update(t + Duration::from_millis(50)).study_prefetches, 0);
        assert_eq!(engine.update(t + Duration::from_millis(100)).study_prefetches, 1);
        assert_eq!(fetcher.issued_keys().iter().filter(|k| *k == "b1").count(), 2);

        // New images on other stacks do not trigger it
        engine.go_to(b.id(), 1);
        settle_all(&mut engine, &fetcher, &mut t);
        assert_eq!(engine.update(t + Duration::from_millis(500)).study_prefetches, 0);

        engine.stop_prefetching();
        assert_eq!(engine.study_active(), None);
        engine.go_to(a.id(), 2);
        settle_all(&mut engine, &fetcher, &mut t);
        assert_eq!(engine.update(t + Duration::from_millis(500)).study_prefetches, 0);
    }

    #[test]
    fn test_attach_with_prevent_cache() {
        let (mut engine, fetcher, _, store) = engine(windowed(0), 100);
        let vp = engine.attach_with(keys("a", 2), 0, true);
        assert!(vp.prevent_cache());
        assert!(fetcher.last_options().is_some_and(|o| o.prevent_cache));

        fetcher.complete_ok("a0");
        engine.update(Instant::now());
        assert!(!store.has(&FrameKey::from("a0")));
    }
}
