//! Fan-out of change events to registered handlers.
//!
//! Handlers run synchronously, in registration order, on the processing
//! loop. A slow handler delays every other handler and the loop itself. A
//! panicking handler is logged and skipped; the others still get the event.
//!
//! Handlers must not register or remove handlers from inside a callback: the
//! dispatcher lock is held while callbacks run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::counter;
use shoal_core::{ChangeEvent, ChangeKind};
use tracing::{debug, error, trace};

/// Receiver of cache notifications. Objects are shared read-only; clone
/// what you need to keep past the call.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &T) {}
    fn on_update(&self, _old: &T, _new: &T) {}
    fn on_delete(&self, _obj: &T) {}
}

type AddFn<T> = Box<dyn Fn(&T) + Send + Sync>;
type UpdateFn<T> = Box<dyn Fn(&T, &T) + Send + Sync>;
type DeleteFn<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Handler built from optional closures.
pub struct HandlerFuncs<T> {
    add: Option<AddFn<T>>,
    update: Option<UpdateFn<T>>,
    delete: Option<DeleteFn<T>>,
}

impl<T> Default for HandlerFuncs<T> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<T> HandlerFuncs<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_add(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_update(mut self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_delete(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T> EventHandler<T> for HandlerFuncs<T> {
    fn on_add(&self, obj: &T) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &T, new: &T) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &T) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}

/// Opaque registration id returned by `add_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(u64);

struct Registration<T> {
    handle: HandlerHandle,
    handler: Arc<dyn EventHandler<T>>,
}

pub struct EventDispatcher<T> {
    handlers: Mutex<Vec<Registration<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventDispatcher<T> {
    pub fn new() -> Self {
        Self { handlers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    /// Exclusive view; events dispatched and handlers registered through the
    /// same guard are ordered with respect to each other.
    pub fn lock(&self) -> Locked<'_, T> {
        Locked { dispatcher: self, handlers: self.handlers.lock().unwrap_or_else(PoisonError::into_inner) }
    }

    pub fn add_handler(&self, handler: impl EventHandler<T> + 'static) -> HandlerHandle {
        self.lock().register(Arc::new(handler))
    }

    /// Returns whether the handle was registered.
    pub fn remove_handler(&self, handle: HandlerHandle) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|r| r.handle != handle);
        handlers.len() != before
    }

    pub fn dispatch(&self, event: &ChangeEvent<T>) {
        self.lock().dispatch(event);
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

pub struct Locked<'a, T> {
    dispatcher: &'a EventDispatcher<T>,
    handlers: MutexGuard<'a, Vec<Registration<T>>>,
}

impl<T> Locked<'_, T> {
    pub fn register(&mut self, handler: Arc<dyn EventHandler<T>>) -> HandlerHandle {
        let handle = HandlerHandle(self.dispatcher.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.push(Registration { handle, handler });
        handle
    }

    /// Register `handler` after first delivering `replay` to it (and only to it).
    pub fn register_with_replay<I>(&mut self, handler: Arc<dyn EventHandler<T>>, replay: I) -> HandlerHandle
    where
        I: IntoIterator<Item = ChangeEvent<T>>,
    {
        let handle = HandlerHandle(self.dispatcher.next_id.fetch_add(1, Ordering::Relaxed));
        let mut replayed = 0usize;
        for event in replay {
            deliver(handle, handler.as_ref(), &event);
            replayed += 1;
        }
        debug!(handler = ?handle, replayed, "handler registered");
        self.handlers.push(Registration { handle, handler });
        handle
    }

    /// Invoke the callback matching `event.kind` on every handler, in order.
    pub fn dispatch(&self, event: &ChangeEvent<T>) {
        trace!(key = %event.key, kind = %event.kind, handlers = self.handlers.len(), "dispatch");
        for reg in self.handlers.iter() {
            deliver(reg.handle, reg.handler.as_ref(), event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run one handler callback, containing a panic to that handler.
fn deliver<T>(handle: HandlerHandle, handler: &dyn EventHandler<T>, event: &ChangeEvent<T>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match (event.kind, &event.old, &event.new) {
        (ChangeKind::Add, _, Some(new)) => handler.on_add(new),
        (ChangeKind::Update, Some(old), Some(new)) => handler.on_update(old, new),
        (ChangeKind::Delete, Some(old), _) => handler.on_delete(old),
        _ => error!(key = %event.key, kind = %event.kind, "malformed change event dropped"),
    }));
    if outcome.is_err() {
        counter!("informer_handler_panics_total", 1u64, "kind" => event.kind.as_str());
        error!(key = %event.key, kind = %event.kind, handler = ?handle, "event handler panicked; remaining handlers still run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> HandlerFuncs<u32> {
        let (a, u, d) = (Arc::clone(log), Arc::clone(log), Arc::clone(log));
        HandlerFuncs::new()
            .on_add(move |o| a.lock().unwrap().push(format!("{tag}:add:{o}")))
            .on_update(move |old, new| u.lock().unwrap().push(format!("{tag}:update:{old}->{new}")))
            .on_delete(move |o| d.lock().unwrap().push(format!("{tag}:delete:{o}")))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let d = EventDispatcher::new();
        d.add_handler(recorder("h1", &log));
        d.add_handler(recorder("h2", &log));
        d.dispatch(&ChangeEvent::added("k".into(), Arc::new(1)));
        d.dispatch(&ChangeEvent::updated("k".into(), Arc::new(1), Arc::new(2)));
        d.dispatch(&ChangeEvent::deleted("k".into(), Arc::new(2)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["h1:add:1", "h2:add:1", "h1:update:1->2", "h2:update:1->2", "h1:delete:2", "h2:delete:2"]
        );
    }

    #[test]
    fn panicking_handler_does_not_starve_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let d = EventDispatcher::new();
        d.add_handler(HandlerFuncs::new().on_add(|_: &u32| panic!("boom")));
        d.add_handler(recorder("ok", &log));
        d.dispatch(&ChangeEvent::added("k".into(), Arc::new(7)));
        assert_eq!(*log.lock().unwrap(), vec!["ok:add:7"]);
    }

    #[test]
    fn removed_handler_receives_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let d = EventDispatcher::new();
        let h = d.add_handler(recorder("gone", &log));
        assert!(d.remove_handler(h));
        assert!(!d.remove_handler(h));
        d.dispatch(&ChangeEvent::added("k".into(), Arc::new(1)));
        assert!(log.lock().unwrap().is_empty());
        assert!(d.is_empty());
    }

    #[test]
    fn replay_reaches_only_the_new_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let d = EventDispatcher::new();
        d.add_handler(recorder("old", &log));
        let replay = vec![ChangeEvent::added("a".into(), Arc::new(1)), ChangeEvent::added("b".into(), Arc::new(2))];
        d.lock().register_with_replay(Arc::new(recorder("new", &log)), replay);
        assert_eq!(*log.lock().unwrap(), vec!["new:add:1", "new:add:2"]);
        assert_eq!(d.len(), 2);
    }
}
