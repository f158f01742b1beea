//! Pub/Sub event bus for load-lifecycle hooks.
//!
//! Architecture:
//! - Hooks subscribe to an event type with a callback (immediate invocation)
//! - emit() invokes callbacks immediately AND queues for deferred processing
//! - poll() returns queued events for batch processing in the host loop
//!
//! Callback order: FIFO (first-subscribed, first-called) within same event type.
//! Cross-type order undefined.
//!
//! Callbacks run on the emitting thread (the scheduler thread), outside the
//! subscriber lock, so a hook may subscribe or emit again.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Marker trait for events. Events must be Send + Sync + 'static.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

// Blanket impl for all qualifying types
impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Type-erased callback
type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Boxed event for queue storage
pub type BoxedEvent = Box<dyn Event>;

/// Pub/Sub event bus with deferred processing support.
///
/// Cloning yields another handle to the same subscribers and queue.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_types", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to events of type E.
    ///
    /// # Example
    /// ```ignore
    /// bus.subscribe::<FrameDisplayed, _>(move |e| {
    ///     planner.schedule_replan(e.viewport);
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Emit event: invoke callbacks immediately AND queue for deferred processing.
    pub fn emit<E: Event + Clone>(&self, event: E) {
        // Snapshot callbacks so hooks run without the lock held
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();
        for cb in &callbacks {
            cb(&event);
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(0..evict_count);
        }
        queue.push(Box::new(event));
    }

    /// Take all queued events (emitted since last poll).
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Clear subscribers for type E
    pub fn unsubscribe_all<E: Event>(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).remove(&TypeId::of::<E>());
    }

    /// Check if there are subscribers for event type E
    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Helper: downcast BoxedEvent to concrete type
///
/// Must deref to `dyn Event` before `as_any()`, otherwise the blanket impl
/// on `Box<dyn Event>` answers and the downcast always fails.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug)]
    struct Loaded {
        index: usize,
    }

    #[derive(Clone, Debug)]
    struct Stopped;

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let sum = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sum);

        bus.subscribe::<Loaded, _>(move |e| {
            s.fetch_add(e.index, Ordering::SeqCst);
        });

        bus.emit(Loaded { index: 10 });
        assert_eq!(sum.load(Ordering::SeqCst), 10);

        bus.emit(Loaded { index: 5 });
        assert_eq!(sum.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_emit_queues_for_poll() {
        let bus = EventBus::new();
        bus.emit(Loaded { index: 1 });
        bus.emit(Stopped);

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(downcast_event::<Loaded>(&events[0]).map(|e| e.index), Some(1));
        assert!(downcast_event::<Stopped>(&events[1]).is_some());
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_hook_can_reenter_bus() {
        let bus = EventBus::new();
        let inner = bus.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        bus.subscribe::<Loaded, _>(move |_| {
            // Emitting from inside a hook must not deadlock
            inner.emit(Stopped);
        });
        bus.subscribe::<Stopped, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Loaded { index: 0 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe::<Stopped, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.has_subscribers::<Stopped>());

        bus.unsubscribe_all::<Stopped>();
        bus.emit(Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.queue_len(), 1);
    }

    #[test]
    fn test_queue_evicts_oldest_when_full() {
        let bus = EventBus::new();
        for index in 0..MAX_QUEUE_SIZE + 1 {
            bus.emit(Loaded { index });
        }
        let events = bus.poll();
        assert_eq!(events.len(), MAX_QUEUE_SIZE / 2 + 1);
        let last = downcast_event::<Loaded>(events.last().unwrap()).unwrap();
        assert_eq!(last.index, MAX_QUEUE_SIZE);
    }
}
