//! Abstract traits for dependency inversion.
//!
//! These traits are the seams to collaborators the scheduler does not own:
//! the frame store, the fetch primitive, the paint primitive and the
//! platform concurrency hint. `core` depends on these, never on concrete
//! implementations.

use std::sync::Arc;

use crossbeam_channel::Sender;

use super::frame::{Frame, FrameKey, LoadError};
use super::lane::Lane;
use super::viewport::{Viewport, ViewportId};

/// Eviction listener registered on a frame store.
pub type EvictionListener = Arc<dyn Fn(&FrameKey) + Send + Sync>;

/// Fired when an insert had to evict frames to stay within the store bounds.
pub type CacheFullListener = Arc<dyn Fn() + Send + Sync>;

/// Content-addressable store of resolved frames.
pub trait FrameStore: Send + Sync {
    /// Is `key` already resolved in the store
    fn has(&self, key: &FrameKey) -> bool;

    /// Resolved frame for `key`, if any
    fn get(&self, key: &FrameKey) -> Option<Frame>;

    /// Insert a freshly loaded frame (may evict others)
    fn put(&self, frame: Frame);

    /// Register a callback fired with the key of every evicted frame.
    fn subscribe_evictions(&self, listener: EvictionListener);

    /// Register a callback fired once per insert that overflowed the store,
    /// after the eviction callbacks of that insert.
    fn subscribe_full(&self, listener: CacheFullListener);
}

/// Per-fetch options handed to the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Bypass the store: result is delivered but never cached
    pub prevent_cache: bool,
    /// Lane the request was admitted on, as a priority hint for the transport
    pub priority: Lane,
}

/// Blocking load primitive (decode a file, pull over the network, ...).
///
/// Runs on a worker thread, never on the scheduler thread.
pub trait FrameLoader: Send + Sync {
    fn load(&self, key: &FrameKey, options: LoadOptions) -> Result<Frame, LoadError>;
}

/// One fetch issued by the request pool.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Pool-assigned id, echoed back in the reply
    pub ticket: u64,
    pub key: FrameKey,
    pub options: LoadOptions,
}

/// Settled fetch, delivered on the pool's completion channel.
#[derive(Debug)]
pub struct FetchReply {
    pub ticket: u64,
    pub key: FrameKey,
    pub result: Result<Frame, LoadError>,
}

/// Asynchronous fetch primitive: start the work, reply on the channel.
///
/// Must not block and must not call back into the pool synchronously.
/// Exactly one reply per request is expected; a request that never replies
/// holds its lane slot forever.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: FetchRequest, reply: Sender<FetchReply>);
}

/// Paint primitive.
pub trait DisplaySurface: Send + Sync {
    fn display(&self, viewport: ViewportId, frame: &Frame);
}

/// Platform hint for how many transfers may run at once.
///
/// Re-read on every scheduling pass, never cached.
pub trait ConcurrencyHint: Send + Sync {
    fn max_concurrent_transfers(&self) -> usize;
}

impl<F> ConcurrencyHint for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn max_concurrent_transfers(&self) -> usize {
        self()
    }
}

/// Constant concurrency hint.
#[derive(Debug, Clone, Copy)]
pub struct FixedHint(pub usize);

impl ConcurrencyHint for FixedHint {
    fn max_concurrent_transfers(&self) -> usize {
        self.0
    }
}

/// Concurrency hint derived from the logical CPU count.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuHint;

impl ConcurrencyHint for CpuHint {
    fn max_concurrent_transfers(&self) -> usize {
        num_cpus::get()
    }
}

/// Moves one or more composited stacks to a new index together.
pub trait StackRenderer: Send + Sync {
    fn render_index(&self, viewport: &Viewport, index: usize);
}

/// Blanket impls: Arc<T> implements traits if T does
impl<T: FrameStore + ?Sized> FrameStore for Arc<T> {
    fn has(&self, key: &FrameKey) -> bool {
        (**self).has(key)
    }

    fn get(&self, key: &FrameKey) -> Option<Frame> {
        (**self).get(key)
    }

    fn put(&self, frame: Frame) {
        (**self).put(frame)
    }

    fn subscribe_evictions(&self, listener: EvictionListener) {
        (**self).subscribe_evictions(listener)
    }

    fn subscribe_full(&self, listener: CacheFullListener) {
        (**self).subscribe_full(listener)
    }
}

impl<T: FrameLoader + ?Sized> FrameLoader for Arc<T> {
    fn load(&self, key: &FrameKey, options: LoadOptions) -> Result<Frame, LoadError> {
        (**self).load(key, options)
    }
}

impl<T: DisplaySurface + ?Sized> DisplaySurface for Arc<T> {
    fn display(&self, viewport: ViewportId, frame: &Frame) {
        (**self).display(viewport, frame)
    }
}
