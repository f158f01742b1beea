//! stackfetch - frame-loading scheduler for multi-frame image viewers
//!
//! Re-exports all modules for use by binary targets.

// Core engine (pool, prefetch, display, playback, workers)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod sim;

// Re-export commonly used types from core
pub use core::engine::{Engine, UpdateReport};
pub use core::event_bus::{BoxedEvent, EventBus, downcast_event};
pub use core::request_pool::RequestPool;

// Re-export entities
pub use entities::{Frame, FrameKey, Lane, LoadError, Viewport, ViewportId};
