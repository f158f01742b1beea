//! Study-level prefetch: warm whole neighbouring stacks of the active one.
//!
//! Where the planner warms frames around an index, this warms entire stacks
//! the user is likely to open next (the series before/after the active one in
//! a study). Everything goes on the prefetch lane with no callbacks beyond
//! failure reporting; frames land in the store and later displays hit it.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::event_bus::EventBus;
use super::events::{LoadFailed, Subsystem};
use super::request_pool::RequestPool;
use crate::entities::{FrameKey, Lane};

/// Which stacks to pick relative to the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchOrder {
    /// First stacks of the study
    TopDown,
    /// Stacks after the active one
    Downward,
    /// Stacks before the active one, nearest first
    Upward,
    /// Alternating before/after, nearest first
    Closest,
    /// Every stack
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyPrefetchConfig {
    /// None disables study prefetch
    pub order: Option<PrefetchOrder>,
    pub display_set_count: usize,
    /// Count the active stack itself as a candidate
    pub include_active: bool,
    pub prevent_cache: bool,
    /// Quiet time after a new image on the active stack before re-running
    pub prefetch_delay_ms: u64,
}

impl Default for StudyPrefetchConfig {
    fn default() -> Self {
        Self {
            order: Some(PrefetchOrder::Closest),
            display_set_count: 1,
            include_active: false,
            prevent_cache: false,
            prefetch_delay_ms: 300,
        }
    }
}

/// Indices of the stacks to prefetch, in request order.
pub fn select_stacks(
    order: PrefetchOrder,
    stack_count: usize,
    active: usize,
    count: usize,
    include_active: bool,
) -> Vec<usize> {
    if active >= stack_count {
        return Vec::new();
    }
    match order {
        PrefetchOrder::All => (0..stack_count).collect(),
        PrefetchOrder::TopDown => (0..stack_count)
            .filter(|&i| include_active || i != active)
            .take(count)
            .collect(),
        PrefetchOrder::Downward => {
            let begin = if include_active { active } else { active + 1 };
            (begin..stack_count).take(count).collect()
        }
        PrefetchOrder::Upward => {
            let end = if include_active { active + 1 } else { active };
            (0..end).rev().take(count).collect()
        }
        PrefetchOrder::Closest => {
            let mut selected = Vec::with_capacity(count.min(stack_count));
            if include_active && count > 0 {
                selected.push(active);
            }
            let mut left = active.checked_sub(1);
            let mut right = active + 1;
            while selected.len() < count && (left.is_some() || right < stack_count) {
                if let Some(l) = left {
                    selected.push(l);
                    left = l.checked_sub(1);
                }
                if right < stack_count && selected.len() < count {
                    selected.push(right);
                    right += 1;
                }
            }
            selected
        }
    }
}

pub struct StudyPrefetcher {
    pool: RequestPool,
    bus: EventBus,
    config: StudyPrefetchConfig,
}

impl StudyPrefetcher {
    pub fn new(pool: RequestPool, bus: EventBus, config: StudyPrefetchConfig) -> Self {
        Self { pool, bus, config }
    }

    pub fn config(&self) -> &StudyPrefetchConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: StudyPrefetchConfig) {
        self.config = config;
    }

    /// Queue the unresolved frames of the stacks selected around `active`.
    ///
    /// Study requests still queued from an earlier call are dropped first.
    /// Returns the number of requests submitted.
    pub fn prefetch(&self, stacks: &[Vec<FrameKey>], active: usize) -> usize {
        self.pool.clear_lane_owned_by(Lane::Prefetch, None);
        let Some(order) = self.config.order else {
            debug!("Study prefetch has no order configured, skipping");
            return 0;
        };

        let selected = select_stacks(
            order,
            stacks.len(),
            active,
            self.config.display_set_count,
            self.config.include_active,
        );
        let store = self.pool.store();
        let keys: Vec<&FrameKey> = selected
            .iter()
            .flat_map(|&i| stacks[i].iter())
            .filter(|key| !store.has(key))
            .collect();

        info!(
            "Study prefetch ({:?}): {} stack(s), {} frame(s) to fetch",
            order,
            selected.len(),
            keys.len()
        );

        for key in &keys {
            let bus = self.bus.clone();
            self.pool.add_request(
                None,
                (*key).clone(),
                Lane::Prefetch,
                self.config.prevent_cache,
                Box::new(|_| {}),
                Box::new(move |error| {
                    bus.emit(LoadFailed {
                        viewport: None,
                        key: error.key().clone(),
                        error,
                        subsystem: Subsystem::StudyPrefetch,
                    });
                }),
                false,
            );
        }
        self.pool.tick();
        keys.len()
    }

    /// Drop every queued prefetch (stack and study level).
    pub fn stop_prefetching(&self) -> usize {
        self.pool.clear_lane(Lane::Prefetch)
    }
}

impl std::fmt::Debug for StudyPrefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyPrefetcher").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::core::frame_store::LruFrameStore;
    use crate::core::testing::{ManualFetcher, test_frame};
    use crate::entities::{FixedHint, FrameStore};

    #[test]
    fn test_select_topdown() {
        assert_eq!(select_stacks(PrefetchOrder::TopDown, 5, 0, 2, false), vec![1, 2]);
        assert_eq!(select_stacks(PrefetchOrder::TopDown, 5, 3, 2, false), vec![0, 1]);
        assert_eq!(select_stacks(PrefetchOrder::TopDown, 5, 0, 2, true), vec![0, 1]);
    }

    #[test]
    fn test_select_downward_and_upward() {
        assert_eq!(select_stacks(PrefetchOrder::Downward, 5, 1, 2, false), vec![2, 3]);
        assert_eq!(select_stacks(PrefetchOrder::Downward, 5, 4, 2, false), Vec::<usize>::new());
        assert_eq!(select_stacks(PrefetchOrder::Upward, 5, 3, 2, false), vec![2, 1]);
        assert_eq!(select_stacks(PrefetchOrder::Upward, 5, 3, 2, true), vec![3, 2]);
    }

    #[test]
    fn test_select_closest_alternates() {
        assert_eq!(select_stacks(PrefetchOrder::Closest, 6, 2, 4, false), vec![1, 3, 0, 4]);
        // Left side exhausted, right keeps going
        assert_eq!(select_stacks(PrefetchOrder::Closest, 6, 0, 3, false), vec![1, 2, 3]);
        assert_eq!(select_stacks(PrefetchOrder::Closest, 3, 1, 1, true), vec![1]);
        assert_eq!(select_stacks(PrefetchOrder::Closest, 3, 1, 10, false), vec![0, 2]);
    }

    #[test]
    fn test_select_all_and_bad_active() {
        assert_eq!(select_stacks(PrefetchOrder::All, 3, 1, 0, false), vec![0, 1, 2]);
        assert!(select_stacks(PrefetchOrder::Closest, 3, 7, 2, false).is_empty());
    }

    fn stacks() -> Vec<Vec<FrameKey>> {
        (0..3)
            .map(|s| (0..3).map(|i| FrameKey::from(format!("s{s}-{i}"))).collect())
            .collect()
    }

    #[test]
    fn test_prefetch_skips_resolved_frames() {
        let store = Arc::new(LruFrameStore::new(100, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let pool = RequestPool::new(store.clone(), fetcher.clone(), Arc::new(FixedHint(64)));
        store.put(test_frame("s1-1"));

        let config = StudyPrefetchConfig {
            order: Some(PrefetchOrder::Downward),
            display_set_count: 1,
            ..StudyPrefetchConfig::default()
        };
        let prefetcher = StudyPrefetcher::new(pool.clone(), EventBus::new(), config);
        assert_eq!(prefetcher.prefetch(&stacks(), 0), 2);
        assert_eq!(fetcher.issued_keys(), vec!["s1-0", "s1-2"]);
        assert_eq!(pool.in_flight(Lane::Prefetch), 2);
    }

    #[test]
    fn test_no_order_prefetches_nothing() {
        let store = Arc::new(LruFrameStore::new(100, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let pool = RequestPool::new(store, fetcher.clone(), Arc::new(FixedHint(4)));
        let config = StudyPrefetchConfig {
            order: None,
            ..StudyPrefetchConfig::default()
        };
        let prefetcher = StudyPrefetcher::new(pool, EventBus::new(), config);
        assert_eq!(prefetcher.prefetch(&stacks(), 0), 0);
        assert_eq!(fetcher.issued_count(), 0);
    }

    #[test]
    fn test_stop_prefetching_clears_queue() {
        let store = Arc::new(LruFrameStore::new(100, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let pool = RequestPool::new(store, fetcher.clone(), Arc::new(FixedHint(2)));
        let config = StudyPrefetchConfig {
            order: Some(PrefetchOrder::All),
            ..StudyPrefetchConfig::default()
        };
        let prefetcher = StudyPrefetcher::new(pool.clone(), EventBus::new(), config);
        assert_eq!(prefetcher.prefetch(&stacks(), 0), 9);
        // Prefetch cap with hint 2 is 1
        assert_eq!(fetcher.issued_count(), 1);
        assert_eq!(prefetcher.stop_prefetching(), 8);
        assert_eq!(pool.in_flight(Lane::Prefetch), 1);
    }

    #[test]
    fn test_repeated_prefetch_does_not_pile_up() {
        let store = Arc::new(LruFrameStore::new(100, usize::MAX));
        let fetcher = Arc::new(ManualFetcher::new());
        let pool = RequestPool::new(store, fetcher.clone(), Arc::new(FixedHint(2)));
        let config = StudyPrefetchConfig {
            order: Some(PrefetchOrder::All),
            ..StudyPrefetchConfig::default()
        };
        let prefetcher = StudyPrefetcher::new(pool.clone(), EventBus::new(), config);

        // s0-0 in flight, 8 queued behind the prefetch cap
        assert_eq!(prefetcher.prefetch(&stacks(), 0), 9);
        pool.add_request(
            Some(uuid::Uuid::new_v4()),
            FrameKey::from("window"),
            Lane::Prefetch,
            false,
            Box::new(|_| {}),
            Box::new(|_| {}),
            false,
        );
        assert_eq!(pool.queued(Lane::Prefetch), 9);

        prefetcher.prefetch(&stacks(), 0);
        prefetcher.prefetch(&stacks(), 0);
        assert_eq!(pool.queued(Lane::Prefetch), 9);
        assert_eq!(fetcher.issued_count(), 1);
        // Requests owned by a viewport survive
        assert!(pool.queued_keys(Lane::Prefetch).contains(&FrameKey::from("window")));
    }

    #[test]
    fn test_order_serde() {
        let order: PrefetchOrder = serde_json::from_str("\"topdown\"").unwrap();
        assert_eq!(order, PrefetchOrder::TopDown);
        assert_eq!(serde_json::to_string(&PrefetchOrder::Closest).unwrap(), "\"closest\"");
    }
}
