//! Default fetch primitive: run a `FrameLoader` on the worker pool and
//! report on the request pool's completion channel.

use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{trace, warn};

use super::workers::Workers;
use crate::entities::{Fetch, FetchReply, FetchRequest, FrameLoader};

pub struct ThreadedFetcher {
    workers: Workers,
    loader: Arc<dyn FrameLoader>,
}

impl ThreadedFetcher {
    pub fn new(workers: Workers, loader: Arc<dyn FrameLoader>) -> Self {
        Self { workers, loader }
    }

    pub fn workers(&self) -> &Workers {
        &self.workers
    }
}

impl Fetch for ThreadedFetcher {
    fn fetch(&self, request: FetchRequest, reply: Sender<FetchReply>) {
        let loader = Arc::clone(&self.loader);
        self.workers.execute(move || {
            let FetchRequest { ticket, key, options } = request;
            trace!("fetch #{} {} ({}) started", ticket, key, options.priority);
            let result = loader.load(&key, options);
            if let Err(ref e) = result {
                warn!("fetch #{} failed: {}", ticket, e);
            }
            // Receiver gone means the pool was dropped; nothing left to notify
            let _ = reply.send(FetchReply { ticket, key, result });
        });
    }
}
