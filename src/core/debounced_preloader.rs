//! Debounced preloader - delays a viewport's prefetch re-plan after it moves.
//!
//! While a viewport is scrolled or played, every displayed frame would
//! otherwise clear and rebuild its prefetch window. Instead:
//! 1. The displayed frame is loaded immediately on the interactive lane
//! 2. The re-plan fires once the viewport has been still for `delay`
//!
//! Each viewport has its own deadline; re-scheduling pushes it back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::entities::ViewportId;

/// Per-viewport debounce timer.
///
/// # Usage
/// ```ignore
/// // On frame displayed:
/// preloader.schedule(viewport_id, now);
///
/// // In update loop:
/// for id in preloader.tick_at(now) {
///     planner.plan(id);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DebouncedPreloader {
    delay: Duration,
    /// viewport -> trigger time
    pending: HashMap<ViewportId, Instant>,
}

impl Default for DebouncedPreloader {
    fn default() -> Self {
        Self::new(300)
    }
}

impl DebouncedPreloader {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            pending: HashMap::new(),
        }
    }

    pub fn set_delay(&mut self, delay_ms: u64) {
        self.delay = Duration::from_millis(delay_ms);
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }

    /// Schedule a re-plan for `viewport`.
    /// If already pending, resets its timer (debounce behavior).
    pub fn schedule(&mut self, viewport: ViewportId, now: Instant) {
        self.pending.insert(viewport, now + self.delay);
        log::trace!(
            "DebouncedPreloader: scheduled re-plan for {} in {}ms",
            viewport,
            self.delay.as_millis()
        );
    }

    pub fn cancel(&mut self, viewport: ViewportId) {
        if self.pending.remove(&viewport).is_some() {
            log::trace!("DebouncedPreloader: cancelled re-plan for {}", viewport);
        }
    }

    /// Viewports whose delay has elapsed at `now`, removed from the pending set.
    /// Earliest deadline first.
    pub fn tick_at(&mut self, now: Instant) -> Vec<ViewportId> {
        let mut due: Vec<(Instant, ViewportId)> = self
            .pending
            .iter()
            .filter(|&(_, &at)| now >= at)
            .map(|(&id, &at)| (at, id))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.pending.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_pending(&self, viewport: ViewportId) -> bool {
        self.pending.contains_key(&viewport)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_immediate_no_trigger() {
        let mut preloader = DebouncedPreloader::new(100);
        let id = Uuid::new_v4();
        let now = Instant::now();

        preloader.schedule(id, now);
        assert!(preloader.is_pending(id));
        assert!(preloader.tick_at(now).is_empty());
    }

    #[test]
    fn test_trigger_after_delay() {
        let mut preloader = DebouncedPreloader::new(10);
        let id = Uuid::new_v4();
        let now = Instant::now();

        preloader.schedule(id, now);
        assert_eq!(preloader.tick_at(now + Duration::from_millis(10)), vec![id]);
        assert!(!preloader.is_pending(id));
        // Fires once
        assert!(preloader.tick_at(now + Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn test_debounce_resets_timer() {
        let mut preloader = DebouncedPreloader::new(50);
        let id = Uuid::new_v4();
        let t0 = Instant::now();

        preloader.schedule(id, t0);
        preloader.schedule(id, t0 + Duration::from_millis(30));

        assert!(preloader.tick_at(t0 + Duration::from_millis(60)).is_empty());
        assert_eq!(preloader.tick_at(t0 + Duration::from_millis(80)), vec![id]);
    }

    #[test]
    fn test_viewports_are_independent() {
        let mut preloader = DebouncedPreloader::new(50);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let t0 = Instant::now();

        preloader.schedule(a, t0);
        preloader.schedule(b, t0 + Duration::from_millis(40));
        preloader.cancel(b);
        preloader.schedule(b, t0 + Duration::from_millis(20));

        assert_eq!(preloader.tick_at(t0 + Duration::from_millis(75)), vec![a, b]);
        assert_eq!(preloader.pending_count(), 0);
    }

    #[test]
    fn test_cancel() {
        let mut preloader = DebouncedPreloader::new(10);
        let id = Uuid::new_v4();
        let now = Instant::now();

        preloader.schedule(id, now);
        preloader.cancel(id);
        assert!(!preloader.is_pending(id));
        assert!(preloader.tick_at(now + Duration::from_millis(100)).is_empty());
    }
}
