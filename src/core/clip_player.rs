//! Clip playback - steps viewports through their stacks on a timer.
//!
//! Timers are deadlines, not threads: the host calls `update(now)` from its
//! loop (60 Hz is plenty) and every due clip takes one step through the
//! dispatcher.
//!
//! Two timing modes:
//! - **Fixed**: one interval of `1000 / |fps|` ms
//! - **Variable**: a per-frame delay table derived from the frame-time
//!   vector. Each step first re-arms with the delay of the index it leaves,
//!   then advances.
//!
//! Negative fps plays in reverse. Running off either end wraps when looping,
//! otherwise stops the clip and emits `ClipStopped`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::dispatcher::FrameDisplayDispatcher;
use super::event_bus::EventBus;
use super::events::ClipStopped;
use crate::entities::{StackRenderer, Viewport, ViewportId};

/// Playback defaults for newly played viewports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    pub frames_per_second: f64,
    #[serde(rename = "loop")]
    pub looping: bool,
    /// Inter-frame delays in ms, one per frame
    pub frame_time_vector: Option<Vec<f64>>,
    /// Divides every frame-time-vector delay
    pub speed: f64,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 30.0,
            looping: true,
            frame_time_vector: None,
            speed: 1.0,
        }
    }
}

/// Per-step delays (ms) for a frame-time vector, and whether they vary.
///
/// Delay `i - 1` is `floor(vector[i] / speed)` for `i` in `1..len`; the first
/// entry is discarded. One more delay is appended for the last frame: the mean
/// of the others when they vary, otherwise the common value. A speed that is
/// not a positive finite number counts as 1.
pub fn play_clip_timeouts(vector: &[f64], speed: f64) -> (Vec<u64>, bool) {
    let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };

    let mut timeouts: Vec<u64> = vector
        .iter()
        .skip(1)
        .map(|&ms| {
            let delay = (ms / speed).floor();
            if delay.is_finite() && delay > 0.0 { delay as u64 } else { 0 }
        })
        .collect();

    let Some(&first) = timeouts.first() else {
        return (timeouts, false);
    };
    let varying = timeouts.iter().any(|&d| d != first);
    let last = if varying {
        let total: u128 = timeouts.iter().map(|&d| u128::from(d)).sum();
        (total / timeouts.len() as u128) as u64
    } else {
        first
    };
    timeouts.push(last);
    (timeouts, varying)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClipTimer {
    Interval { period: Duration, next_due: Instant },
    Timeout { due: Instant },
}

/// Per-viewport playback bookkeeping.
#[derive(Debug, Clone)]
pub struct ClipState {
    pub frames_per_second: f64,
    pub frame_time_vector: Option<Vec<f64>>,
    pub speed: f64,
    pub reverse: bool,
    pub looping: bool,
    pub using_variable_timing: bool,
    timeouts: Vec<u64>,
    timer: Option<ClipTimer>,
}

impl ClipState {
    fn from_config(config: &ClipConfig) -> Self {
        Self {
            frames_per_second: config.frames_per_second,
            frame_time_vector: config.frame_time_vector.clone(),
            speed: config.speed,
            reverse: config.frames_per_second < 0.0,
            looping: config.looping,
            using_variable_timing: false,
            timeouts: Vec::new(),
            timer: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.timer.is_some()
    }

    fn delay_at(&self, index: usize) -> Duration {
        Duration::from_millis(self.timeouts.get(index).copied().unwrap_or(0))
    }
}

struct Clip {
    viewport: Viewport,
    state: ClipState,
    renderer: Option<Arc<dyn StackRenderer>>,
}

/// Outcome of one playback step
enum Step {
    Go(usize),
    Stop,
}

pub struct ClipPlayer {
    dispatcher: FrameDisplayDispatcher,
    bus: EventBus,
    config: ClipConfig,
    clips: HashMap<ViewportId, Clip>,
}

impl ClipPlayer {
    pub fn new(dispatcher: FrameDisplayDispatcher, bus: EventBus, config: ClipConfig) -> Self {
        Self {
            dispatcher,
            bus,
            config,
            clips: HashMap::new(),
        }
    }

    fn clip_mut(&mut self, viewport: &Viewport) -> &mut Clip {
        let config = &self.config;
        self.clips.entry(viewport.id()).or_insert_with(|| Clip {
            viewport: viewport.clone(),
            state: ClipState::from_config(config),
            renderer: None,
        })
    }

    pub fn state(&self, id: ViewportId) -> Option<&ClipState> {
        self.clips.get(&id).map(|c| &c.state)
    }

    pub fn is_playing(&self, id: ViewportId) -> bool {
        self.clips.get(&id).is_some_and(|c| c.state.is_playing())
    }

    /// Route this viewport's steps through `renderer` (synchronized stacks).
    pub fn set_renderer(&mut self, viewport: &Viewport, renderer: Option<Arc<dyn StackRenderer>>) {
        self.clip_mut(viewport).renderer = renderer;
    }

    /// Per-frame delay table for the next `play` without an explicit fps.
    pub fn set_frame_time_vector(&mut self, viewport: &Viewport, vector: Option<Vec<f64>>, speed: f64) {
        let state = &mut self.clip_mut(viewport).state;
        state.frame_time_vector = vector;
        state.speed = speed;
    }

    pub fn set_loop(&mut self, viewport: &Viewport, looping: bool) {
        self.clip_mut(viewport).state.looping = looping;
    }

    /// Start (or restart) playback.
    ///
    /// `fps`, when given, replaces the stored rate and drops any frame-time
    /// vector. A zero or non-finite rate does not start, nor does one so slow
    /// its period does not fit a `Duration`. Returns true if a
    /// timer is running afterwards.
    pub fn play(&mut self, viewport: &Viewport, fps: Option<f64>, now: Instant) -> bool {
        let len = viewport.len();
        let clip = self.clip_mut(viewport);
        let state = &mut clip.state;
        state.timer = None;

        if let Some(fps) = fps {
            state.frames_per_second = fps;
            state.frame_time_vector = None;
        }
        if !state.frames_per_second.is_finite() || state.frames_per_second == 0.0 {
            warn!(
                "Clip for {} not started: invalid frame rate {}",
                viewport.id(),
                state.frames_per_second
            );
            return false;
        }
        state.reverse = state.frames_per_second < 0.0;

        let (timeouts, varying) = match &state.frame_time_vector {
            Some(vector) if vector.len() == len => play_clip_timeouts(vector, state.speed),
            Some(vector) => {
                debug!(
                    "Frame-time vector of {} entries ignored for a stack of {}",
                    vector.len(),
                    len
                );
                (Vec::new(), false)
            }
            None => (Vec::new(), false),
        };
        let timer = if varying {
            ClipTimer::Timeout { due: now }
        } else {
            let interval = Duration::try_from_secs_f64(1.0 / state.frames_per_second.abs())
                .ok()
                .and_then(|period| Some((period, now.checked_add(period)?)));
            let Some((period, next_due)) = interval else {
                warn!(
                    "Clip for {} not started: frame rate {} is too slow",
                    viewport.id(),
                    state.frames_per_second
                );
                return false;
            };
            ClipTimer::Interval { period, next_due }
        };
        state.timeouts = timeouts;
        state.using_variable_timing = varying;
        state.timer = Some(timer);
        debug!(
            "Clip for {} playing at {} fps{}{}",
            viewport.id(),
            state.frames_per_second,
            if state.using_variable_timing { " (variable timing)" } else { "" },
            if state.looping { ", looping" } else { "" }
        );
        true
    }

    /// Stop playback. Idempotent.
    pub fn stop(&mut self, id: ViewportId) {
        if let Some(clip) = self.clips.get_mut(&id) {
            if clip.state.timer.take().is_some() {
                debug!("Clip for {} stopped", id);
            }
        }
    }

    /// Forget a detached viewport.
    pub fn remove(&mut self, id: ViewportId) {
        self.clips.remove(&id);
    }

    /// Fire every due timer once. Returns the number of steps taken.
    pub fn update(&mut self, now: Instant) -> usize {
        let mut steps = 0;
        let mut stopped = Vec::new();

        for (&id, clip) in self.clips.iter_mut() {
            let Some(timer) = clip.state.timer else {
                continue;
            };
            let current = clip.viewport.current_index();
            match timer {
                ClipTimer::Interval { period, next_due } => {
                    if now < next_due {
                        continue;
                    }
                    // Host stalled: skip missed ticks instead of bursting
                    let next_due = match next_due.checked_add(period) {
                        Some(due) if due > now => due,
                        _ => now.checked_add(period).unwrap_or(now),
                    };
                    clip.state.timer = Some(ClipTimer::Interval { period, next_due });
                }
                ClipTimer::Timeout { due } => {
                    if now < due {
                        continue;
                    }
                    let delay = clip.state.delay_at(current);
                    clip.state.timer = Some(ClipTimer::Timeout {
                        due: now.checked_add(delay).unwrap_or(now),
                    });
                }
            }

            steps += 1;
            match next_step(&clip.state, current, clip.viewport.len()) {
                Step::Go(next) => {
                    trace!("Clip {} step {} -> {}", id, current, next);
                    match &clip.renderer {
                        Some(renderer) => renderer.render_index(&clip.viewport, next),
                        None => {
                            self.dispatcher.go_to(&clip.viewport, next as isize);
                        }
                    }
                }
                Step::Stop => {
                    clip.state.timer = None;
                    stopped.push(id);
                }
            }
        }

        for id in stopped {
            debug!("Clip for {} reached the end", id);
            self.bus.emit(ClipStopped { viewport: id });
        }
        steps
    }
}

fn next_step(state: &ClipState, current: usize, len: usize) -> Step {
    let Some(last) = len.checked_sub(1) else {
        return Step::Stop;
    };
    let next = if state.reverse {
        current.checked_sub(1)
    } else {
        Some(current + 1).filter(|&n| n <= last)
    };
    match next {
        Some(next) => Step::Go(next),
        None if state.looping => Step::Go(if state.reverse { last } else { 0 }),
        None => Step::Stop,
    }
}

/// Moves a group of composited stacks to the same index together.
pub struct SyncedStacks {
    dispatcher: FrameDisplayDispatcher,
    stacks: Vec<Viewport>,
}

impl SyncedStacks {
    pub fn new(dispatcher: FrameDisplayDispatcher, stacks: Vec<Viewport>) -> Self {
        Self { dispatcher, stacks }
    }

    pub fn stacks(&self) -> &[Viewport] {
        &self.stacks
    }
}

impl StackRenderer for SyncedStacks {
    fn render_index(&self, viewport: &Viewport, index: usize) {
        self.dispatcher.go_to(viewport, index as isize);
        for stack in self.stacks.iter().filter(|s| s.id() != viewport.id()) {
            self.dispatcher.go_to(stack, index as isize);
        }
    }
}
