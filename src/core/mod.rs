//! Core engine modules - request pool, prefetch, display, playback, workers
//!
//! These modules form the frame-loading scheduler, independent of any UI.

pub mod clip_player;
pub mod debounced_preloader;
pub mod dispatcher;
pub mod engine;
pub mod event_bus;
pub mod events;
pub mod fetcher;
pub mod frame_store;
pub mod prefetch;
pub mod request_pool;
pub mod study_prefetch;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use clip_player::{ClipConfig, ClipPlayer, ClipState, SyncedStacks, play_clip_timeouts};
pub use debounced_preloader::DebouncedPreloader;
pub use dispatcher::FrameDisplayDispatcher;
pub use engine::{Engine, UpdateReport};
pub use event_bus::EventBus;
pub use events::{ClipStopped, FrameDisplayed, LoadFailed, LoadStarted, Subsystem};
pub use fetcher::ThreadedFetcher;
pub use frame_store::{CacheStats, LruFrameStore};
pub use prefetch::{PrefetchConfig, PrefetchPlanner, prefetch_window};
pub use request_pool::{PoolStats, RequestPool};
pub use study_prefetch::{PrefetchOrder, StudyPrefetchConfig, StudyPrefetcher};
pub use workers::Workers;
