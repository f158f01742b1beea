//! Request lanes: one concurrency cap and one priority rank each.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of fetch work. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Frames a user is waiting to see right now
    Interactive,
    /// Small previews (first frame of a stack, etc.)
    Thumbnail,
    /// Best-effort warming around the current index
    Prefetch,
}

impl Lane {
    pub const COUNT: usize = 3;

    /// All lanes, highest priority first
    pub const PRIORITY: [Lane; Lane::COUNT] = [Lane::Interactive, Lane::Thumbnail, Lane::Prefetch];

    pub fn index(self) -> usize {
        match self {
            Lane::Interactive => 0,
            Lane::Thumbnail => 1,
            Lane::Prefetch => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Lane::Interactive => "interactive",
            Lane::Thumbnail => "thumbnail",
            Lane::Prefetch => "prefetch",
        }
    }

    /// Per-lane cap derived from the platform concurrency hint, floored at 1.
    pub fn max_concurrent(self, hint: usize) -> usize {
        let cap = match self {
            Lane::Interactive => hint,
            Lane::Thumbnail => hint.saturating_sub(2),
            Lane::Prefetch => hint.saturating_sub(1),
        };
        cap.max(1)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
