//! Load-lifecycle and playback events published on the `EventBus`.
//!
//! These are the pluggable hooks: `LoadStarted` (onStart), `FrameDisplayed`
//! (onEnd), `LoadFailed` (onError) and `ClipStopped`.

use crate::entities::{FrameKey, LoadError, ViewportId};

/// Which component reported a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Display,
    Prefetch,
    StudyPrefetch,
}

/// A viewport started loading the frame it now targets
#[derive(Debug, Clone)]
pub struct LoadStarted {
    pub viewport: ViewportId,
    pub index: usize,
    pub key: FrameKey,
}

/// A frame was painted into its viewport
#[derive(Debug, Clone)]
pub struct FrameDisplayed {
    pub viewport: ViewportId,
    pub index: usize,
    pub key: FrameKey,
}

#[derive(Debug, Clone)]
pub struct LoadFailed {
    /// None for requests not owned by a viewport (study prefetch)
    pub viewport: Option<ViewportId>,
    pub key: FrameKey,
    pub error: LoadError,
    pub subsystem: Subsystem,
}

/// Non-looping playback ran off the end of its stack
#[derive(Debug, Clone)]
pub struct ClipStopped {
    pub viewport: ViewportId,
}
