//! Entities module - plain data types and collaborator traits
//!
//! Nothing here schedules or spawns; `core` builds the engine on top of
//! these types. Traits live here so `core` depends on `entities`, not the
//! other way round.

pub mod frame;
pub mod lane;
pub mod traits;
pub mod viewport;

pub use frame::{Frame, FrameKey, LoadError};
pub use lane::Lane;
pub use traits::{
    CacheFullListener, ConcurrencyHint, CpuHint, DisplaySurface, EvictionListener, Fetch, FetchReply, FetchRequest,
    FixedHint, FrameLoader, FrameStore, LoadOptions, StackRenderer,
};
pub use viewport::{PrefetchState, Viewport, ViewportId, ViewportState};
