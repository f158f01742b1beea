//! Synthetic collaborators for the demo binary: a loader that sleeps and
//! fabricates pixels, and a surface that only logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::entities::{DisplaySurface, Frame, FrameKey, FrameLoader, LoadError, LoadOptions, ViewportId};

/// Key of frame `index` in stack `stack`
pub fn frame_key(stack: usize, index: usize) -> FrameKey {
    FrameKey::from(format!("stack{stack}/frame{index:04}"))
}

pub fn stack_keys(stack: usize, frames: usize) -> Vec<FrameKey> {
    (0..frames).map(|i| frame_key(stack, i)).collect()
}

/// Loader that waits `latency` per frame and fails every `fail_every`-th load.
#[derive(Debug)]
pub struct SyntheticLoader {
    latency: Duration,
    fail_every: Option<u64>,
    width: u32,
    height: u32,
    loads: AtomicU64,
}

impl SyntheticLoader {
    pub fn new(latency: Duration, fail_every: Option<u64>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|&n| n > 0),
            width: 64,
            height: 64,
            loads: AtomicU64::new(0),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl FrameLoader for SyntheticLoader {
    fn load(&self, key: &FrameKey, options: LoadOptions) -> Result<Frame, LoadError> {
        let n = self.loads.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.fail_every.is_some_and(|every| n % every == 0) {
            return Err(LoadError::Transfer {
                key: key.clone(),
                reason: format!("synthetic failure (load #{n})"),
            });
        }

        let len = (self.width * self.height * 4) as usize;
        let shade = (n % 251) as u8;
        debug!("loaded {} ({} lane, {} bytes)", key, options.priority, len);
        Ok(Frame::new(key.clone(), self.width, self.height, vec![shade; len]))
    }
}

/// Surface that logs every paint and counts them.
#[derive(Debug, Default)]
pub struct LoggingSurface {
    painted: AtomicU64,
}

impl LoggingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn painted(&self) -> u64 {
        self.painted.load(Ordering::Relaxed)
    }
}

impl DisplaySurface for LoggingSurface {
    fn display(&self, viewport: ViewportId, frame: &Frame) {
        self.painted.fetch_add(1, Ordering::Relaxed);
        info!(
            "paint {} <- {} ({}x{})",
            viewport,
            frame.key(),
            frame.width(),
            frame.height()
        );
    }
}
