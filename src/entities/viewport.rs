//! Viewport: one visible frame stack.
//!
//! A `Viewport` is a cheap handle (`Arc<Mutex<ViewportState>>`) shared by the
//! dispatcher, the prefetch planner and the clip player. All mutation happens
//! on the scheduler thread; the mutex only makes the handle `Send + Sync`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::frame::FrameKey;

pub type ViewportId = Uuid;

/// Per-viewport prefetch bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct PrefetchState {
    /// Indices still to request, sorted
    pub indices: BTreeSet<usize>,
    pub enabled: bool,
    /// Disabled because `indices` ran empty (an eviction re-enables)
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct ViewportState {
    pub keys: Vec<FrameKey>,
    /// Latest requested index (set before its frame arrives)
    pub current_index: usize,
    pub prevent_cache: bool,
    /// Sequential-mode targets, FIFO
    pub pending_targets: VecDeque<usize>,
    /// Bumped on every retarget; completions compare against it
    pub generation: u64,
    /// A sequential-mode load is outstanding
    pub sequential_busy: bool,
    pub prefetch: PrefetchState,
}

impl ViewportState {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Clamp a signed index into `[0, len - 1]`. None for an empty stack.
    pub fn clamp_index(&self, index: isize) -> Option<usize> {
        let last = self.keys.len().checked_sub(1)?;
        Some(index.clamp(0, last as isize) as usize)
    }
}

/// Handle to a viewport. Clones share state.
#[derive(Clone, Debug)]
pub struct Viewport {
    id: ViewportId,
    state: Arc<Mutex<ViewportState>>,
}

impl Viewport {
    /// Attach a stack. `current_index` is clamped into the stack.
    pub fn new(keys: Vec<FrameKey>, current_index: usize) -> Self {
        let current_index = current_index.min(keys.len().saturating_sub(1));
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ViewportState {
                keys,
                current_index,
                prevent_cache: false,
                pending_targets: VecDeque::new(),
                generation: 0,
                sequential_busy: false,
                prefetch: PrefetchState::default(),
            })),
        }
    }

    pub fn with_prevent_cache(self, prevent_cache: bool) -> Self {
        self.lock().prevent_cache = prevent_cache;
        self
    }

    pub fn id(&self) -> ViewportId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, ViewportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_index(&self) -> usize {
        self.lock().current_index
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every index whose key equals `key` (stacks may repeat a key)
    pub fn indices_of(&self, key: &FrameKey) -> Vec<usize> {
        self.lock()
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| *k == key)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn prevent_cache(&self) -> bool {
        self.lock().prevent_cache
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn pending_targets(&self) -> Vec<usize> {
        self.lock().pending_targets.iter().copied().collect()
    }

    /// Snapshot of the prefetch to-request set
    pub fn prefetch_indices(&self) -> Vec<usize> {
        self.lock().prefetch.indices.iter().copied().collect()
    }

    pub fn prefetch_enabled(&self) -> bool {
        self.lock().prefetch.enabled
    }
}
