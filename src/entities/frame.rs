//! Frame keys, loaded frames and load errors.
//!
//! A `FrameKey` is the opaque identity of one loadable unit of image data
//! (one slice of a stack, one frame of a multi-frame instance). A `Frame` is
//! the decoded result: cheap to clone, pixel buffer shared behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a loadable frame.
///
/// Cloning only bumps a refcount, so keys are passed around by value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameKey(Arc<str>);

impl FrameKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FrameKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Decoded frame. Clone is cheap (pixels are shared).
#[derive(Clone, Debug)]
pub struct Frame {
    key: FrameKey,
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(key: FrameKey, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            key,
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Memory footprint of the pixel buffer in bytes
    pub fn mem(&self) -> usize {
        self.pixels.len()
    }

    /// True if both handles share the same pixel buffer
    pub fn same_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// Why a frame failed to load.
///
/// `Clone` because one failed fetch is reported to every caller that joined it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("frame {0} not found")]
    NotFound(FrameKey),
    #[error("failed to decode {key}: {reason}")]
    Decode { key: FrameKey, reason: String },
    #[error("transfer of {key} failed: {reason}")]
    Transfer { key: FrameKey, reason: String },
    #[error("fetch of {0} was dropped before completing")]
    Dropped(FrameKey),
}

impl LoadError {
    pub fn key(&self) -> &FrameKey {
        match self {
            LoadError::NotFound(key) | LoadError::Dropped(key) => key,
            LoadError::Decode { key, .. } | LoadError::Transfer { key, .. } => key,
        }
    }
}
