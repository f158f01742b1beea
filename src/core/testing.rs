//! Test doubles shared by the core unit tests.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::core::request_pool::{DoneCallback, FailCallback};
use crate::entities::{
    DisplaySurface, Fetch, FetchReply, FetchRequest, Frame, FrameKey, LoadError, LoadOptions,
    ViewportId,
};

pub fn test_frame(key: &str) -> Frame {
    Frame::new(FrameKey::from(key), 2, 2, vec![0; 16])
}

pub fn noop_done() -> DoneCallback {
    Box::new(|_| {})
}

pub fn noop_fail() -> FailCallback {
    Box::new(|_| {})
}

/// Callbacks that append `tag:ok:key` / `tag:err:key` to a shared log.
pub fn recording_callbacks(tag: &'static str) -> (Arc<Mutex<Vec<String>>>, DoneCallback, FailCallback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2) = (Arc::clone(&log), Arc::clone(&log));
    let done: DoneCallback = Box::new(move |f| l1.lock().unwrap().push(format!("{tag}:ok:{}", f.key())));
    let fail: FailCallback = Box::new(move |e| l2.lock().unwrap().push(format!("{tag}:err:{}", e.key())));
    (log, done, fail)
}

/// Fetch double: records requests and replies only when told to.
#[derive(Default)]
pub struct ManualFetcher {
    issued: Mutex<Vec<FetchRequest>>,
    pending: Mutex<Vec<(FetchRequest, Sender<FetchReply>)>>,
}

impl ManualFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    /// Every key ever issued, in dispatch order
    pub fn issued_keys(&self) -> Vec<String> {
        self.issued.lock().unwrap().iter().map(|r| r.key.to_string()).collect()
    }

    pub fn last_options(&self) -> Option<LoadOptions> {
        self.issued.lock().unwrap().last().map(|r| r.options)
    }

    /// Keys issued but not yet completed
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.lock().unwrap().iter().map(|(r, _)| r.key.to_string()).collect()
    }

    fn take(&self, key: &str) -> (FetchRequest, Sender<FetchReply>) {
        let mut pending = self.pending.lock().unwrap();
        let pos = pending
            .iter()
            .position(|(r, _)| r.key.as_str() == key)
            .unwrap_or_else(|| panic!("no pending fetch for {key}"));
        pending.remove(pos)
    }

    pub fn complete_ok(&self, key: &str) {
        let (request, tx) = self.take(key);
        tx.send(FetchReply {
            ticket: request.ticket,
            result: Ok(test_frame(key)),
            key: request.key,
        })
        .unwrap();
    }

    pub fn complete_err(&self, key: &str) {
        let (request, tx) = self.take(key);
        tx.send(FetchReply {
            ticket: request.ticket,
            result: Err(LoadError::NotFound(request.key.clone())),
            key: request.key,
        })
        .unwrap();
    }

    /// Send a reply with an arbitrary ticket without touching the pending list.
    pub fn send_raw(&self, ticket: u64, key: &str) {
        let pending = self.pending.lock().unwrap();
        let (_, tx) = pending.first().expect("at least one pending fetch");
        tx.send(FetchReply {
            ticket,
            key: FrameKey::from(key),
            result: Ok(test_frame(key)),
        })
        .unwrap();
    }
}

impl Fetch for ManualFetcher {
    fn fetch(&self, request: FetchRequest, reply: Sender<FetchReply>) {
        self.issued.lock().unwrap().push(request.clone());
        self.pending.lock().unwrap().push((request, reply));
    }
}

/// Display double: records `(viewport, key)` for every paint.
#[derive(Default)]
pub struct RecordingSurface {
    painted: Mutex<Vec<(ViewportId, String)>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn painted_keys(&self) -> Vec<String> {
        self.painted.lock().unwrap().iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn painted(&self) -> Vec<(ViewportId, String)> {
        self.painted.lock().unwrap().clone()
    }
}

impl DisplaySurface for RecordingSurface {
    fn display(&self, viewport: ViewportId, frame: &Frame) {
        self.painted.lock().unwrap().push((viewport, frame.key().to_string()));
    }
}
