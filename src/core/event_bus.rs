//! Pub/Sub event bus between the worker, the watcher and the foreground.
//!
//! Architecture:
//! - Foreground subscribes to event types with callbacks (invoked on the emitting thread)
//! - emit() invokes callbacks immediately AND queues for deferred processing
//! - poll() returns queued events for batch processing in the consumer's loop
//!
//! The worker holds an `EventEmitter`, never the bus itself. Callbacks run on
//! the worker (or watcher) thread, so they must be cheap and must not block.
//!
//! Callback order: FIFO (first-subscribed, first-called) within same event type.

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

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type Subscribers = Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>;
type Queue = Arc<Mutex<Vec<BoxedEvent>>>;

/// Boxed event for queue storage
pub type BoxedEvent = Box<dyn Event>;

/// Event bus owned by the pipeline context
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Subscribers,
    queue: Queue,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type E.
    ///
    /// # Example
    /// ```ignore
    /// let dirty = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&dirty);
    /// bus.subscribe::<RedrawRequestedEvent, _>(move |_| flag.store(true, Ordering::Release));
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

    /// Invoke callbacks immediately and queue the event for poll()
    pub fn emit<E: Event + Clone>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }

    /// Take all events emitted since the last poll
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Emitter handle for producers on other threads
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            subscribers: Arc::clone(&self.subscribers),
            queue: Arc::clone(&self.queue),
        }
    }

    /// Clear subscribers for type E
    pub fn unsubscribe_all<E: Event>(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    /// Clear all subscribers and queue
    pub fn clear(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Cloneable producer side of the bus
#[derive(Clone)]
pub struct EventEmitter {
    subscribers: Subscribers,
    queue: Queue,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscriber_types", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

impl EventEmitter {
    pub fn emit<E: Event + Clone>(&self, event: E) {
        dispatch(&self.subscribers, &self.queue, event);
    }
}

fn dispatch<E: Event + Clone>(subscribers: &Subscribers, queue: &Queue, event: E) {
    // Clone the callback list so a callback may subscribe without deadlocking
    let callbacks = subscribers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&TypeId::of::<E>())
        .cloned();
    for cb in callbacks.iter().flatten() {
        cb(&event);
    }

    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
    if queue.len() >= MAX_QUEUE_SIZE {
        let evict_count = queue.len() / 2;
        warn!("Event queue full ({} events), evicting oldest {}", queue.len(), evict_count);
        queue.drain(0..evict_count);
    }
    queue.push(Box::new(event));
}

/// Downcast a queued event to its concrete type.
///
/// Must deref to `dyn Event` before `as_any()`: the blanket impl also covers
/// `Box<dyn Event>` itself, which would make every downcast fail.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{FrameReadyEvent, RedrawRequestedEvent};
    use crate::entities::CacheKey;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ready(frame: usize) -> FrameReadyEvent {
        FrameReadyEvent {
            key: CacheKey::file(Path::new("a.vpp"), frame),
            ok: true,
        }
    }

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe::<FrameReadyEvent, _>(move |e| {
            if let CacheKey::File { frame, .. } = e.key {
                c.fetch_add(frame, Ordering::SeqCst);
            }
        });

        bus.emit(ready(10));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        bus.emit(RedrawRequestedEvent);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_emitter_queues_for_poll() {
        let bus = EventBus::new();
        let emitter = bus.emitter();
        emitter.emit(ready(1));
        emitter.emit(RedrawRequestedEvent);

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert!(downcast_event::<FrameReadyEvent>(&events[0]).is_some());
        assert!(downcast_event::<RedrawRequestedEvent>(&events[1]).is_some());
        assert!(downcast_event::<FrameReadyEvent>(&events[1]).is_none());
        assert_eq!(bus.poll().len(), 0);
    }

    #[test]
    fn test_queue_eviction() {
        let bus = EventBus::new();
        for i in 0..MAX_QUEUE_SIZE + 1 {
            bus.emit(ready(i));
        }
        assert!(bus.queue_len() <= MAX_QUEUE_SIZE);
        let events = bus.poll();
        let last = downcast_event::<FrameReadyEvent>(events.last().unwrap()).unwrap();
        assert_eq!(last.key, CacheKey::file(Path::new("a.vpp"), MAX_QUEUE_SIZE));
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe::<RedrawRequestedEvent, _>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(RedrawRequestedEvent);
        bus.unsubscribe_all::<RedrawRequestedEvent>();
        bus.emit(RedrawRequestedEvent);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.poll().len(), 2);
    }
}
