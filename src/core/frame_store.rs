//! In-memory frame store with LRU eviction and eviction notifications
//!
//! Structure: HashMap<FrameKey, Frame> + IndexSet<FrameKey> recency queue
//! - O(1) lookup by key
//! - Front of the IndexSet is least recently used
//! - Bounded by frame count and by total pixel bytes
//!
//! Evicted keys are reported to listeners after the store lock is released,
//! so a listener may query the store again. An insert that had to evict also
//! raises the cache-full signal once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexSet;
use log::debug;

use crate::entities::{CacheFullListener, EvictionListener, Frame, FrameKey, FrameStore};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    frames: HashMap<FrameKey, Frame>,
    lru_order: IndexSet<FrameKey>,
    bytes: usize,
}

impl StoreInner {
    fn remove(&mut self, key: &FrameKey) -> Option<Frame> {
        let frame = self.frames.remove(key)?;
        self.lru_order.shift_remove(key);
        self.bytes = self.bytes.saturating_sub(frame.mem());
        Some(frame)
    }
}

pub struct LruFrameStore {
    inner: Mutex<StoreInner>,
    listeners: RwLock<Vec<EvictionListener>>,
    full_listeners: RwLock<Vec<CacheFullListener>>,
    stats: Arc<CacheStats>,
    /// Maximum frames before eviction
    capacity: usize,
    /// Maximum pixel bytes before eviction
    max_bytes: usize,
}

impl std::fmt::Debug for LruFrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruFrameStore")
            .field("len", &self.len())
            .field("bytes", &self.bytes())
            .field("capacity", &self.capacity)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl LruFrameStore {
    /// Create a store bounded by `capacity` frames and `max_bytes` bytes.
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("LruFrameStore created: capacity={}, max_bytes={}", capacity, max_bytes);
        Self {
            inner: Mutex::new(StoreInner::default()),
            listeners: RwLock::new(Vec::new()),
            full_listeners: RwLock::new(Vec::new()),
            stats: Arc::new(CacheStats::new()),
            capacity,
            max_bytes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, evicted: &[FrameKey]) {
        if evicted.is_empty() {
            return;
        }
        self.stats.record_evictions(evicted.len());
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for key in evicted {
            for listener in &listeners {
                listener(key);
            }
        }
    }

    /// Drop one frame explicitly. Listeners are notified.
    pub fn remove(&self, key: &FrameKey) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.notify(std::slice::from_ref(key));
        }
        removed
    }

    /// Drop everything. Listeners are notified for each key.
    pub fn clear(&self) {
        let evicted: Vec<FrameKey> = {
            let mut inner = self.lock();
            inner.frames.clear();
            inner.bytes = 0;
            inner.lru_order.drain(..).collect()
        };
        debug!("Cleared frame store ({} frames)", evicted.len());
        self.notify(&evicted);
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<FrameKey> {
        self.lock().lru_order.iter().cloned().collect()
    }
}

impl FrameStore for LruFrameStore {
    fn has(&self, key: &FrameKey) -> bool {
        self.lock().frames.contains_key(key)
    }

    /// Updates recency on hit.
    fn get(&self, key: &FrameKey) -> Option<Frame> {
        let mut inner = self.lock();
        match inner.frames.get(key).cloned() {
            Some(frame) => {
                self.stats.record_hit();
                inner.lru_order.shift_remove(key);
                inner.lru_order.insert(key.clone());
                Some(frame)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Insert, then evict least recently used frames while over either limit.
    /// The frame just inserted is never evicted by its own insert.
    fn put(&self, frame: Frame) {
        let key = frame.key().clone();
        let evicted = {
            let mut inner = self.lock();
            inner.remove(&key);
            inner.bytes += frame.mem();
            inner.frames.insert(key.clone(), frame);
            inner.lru_order.insert(key.clone());

            let mut evicted = Vec::new();
            while inner.frames.len() > self.capacity || inner.bytes > self.max_bytes {
                let Some(oldest) = inner.lru_order.first().cloned() else {
                    break;
                };
                if oldest == key {
                    break;
                }
                inner.remove(&oldest);
                evicted.push(oldest);
            }
            evicted
        };

        if evicted.is_empty() {
            return;
        }
        debug!("LRU evicted {} frame(s) to fit {}", evicted.len(), key);
        self.notify(&evicted);

        let listeners = self.full_listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in &listeners {
            listener();
        }
    }

    fn subscribe_evictions(&self, listener: EvictionListener) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    fn subscribe_full(&self, listener: CacheFullListener) {
        self.full_listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }
}
