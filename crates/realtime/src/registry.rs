//! Event listener registry
//!
//! Maps an event name to the handlers interested in it. The registry knows
//! nothing about transports: callers learn from [`Registration::first_for_event`]
//! when a wire subscription is needed, and unregistering never tears one down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// A consumer callback. Errors and panics are contained by [`EventRegistry::dispatch`].
pub type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: HandlerId,
    /// True when no other handler was registered for this event.
    pub first_for_event: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry<T> {
    id: HandlerId,
    handler: Handler<T>,
}

pub struct EventRegistry<T> {
    name: String,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<Entry<T>>>>,
}

impl<T> EventRegistry<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry<T>>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `handler` for `event`. Registering the same `Arc` twice returns
    /// the existing id.
    pub fn register(&self, event: &str, handler: Handler<T>) -> Registration {
        let mut handlers = self.lock();
        let entries = handlers.entry(event.to_string()).or_default();

        if let Some(existing) = entries.iter().find(|e| same_handler(&e.handler, &handler)) {
            return Registration {
                id: existing.id,
                first_for_event: false,
            };
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first_for_event = entries.is_empty();
        entries.push(Entry { id, handler });
        Registration {
            id,
            first_for_event,
        }
    }

    /// Remove a handler. Returns false when it was already gone.
    pub fn unregister(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let Some(entries) = handlers.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Invoke every handler for `event` in registration order.
    ///
    /// The handler list is snapshotted first, so handlers may register or
    /// unregister while being dispatched.
    pub fn dispatch(&self, event: &str, payload: &T) -> DispatchReport {
        let snapshot: Vec<(HandlerId, Handler<T>)> = match self.lock().get(event) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.id, Arc::clone(&e.handler)))
                .collect(),
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            debug!(
                component = "registry",
                event = "registry.dispatch.no_handlers",
                registry = %self.name,
                event_name = event,
                "No handlers registered"
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        component = "registry",
                        event = "registry.handler.failed",
                        registry = %self.name,
                        event_name = event,
                        handler_id = id.0,
                        error = %e,
                        "Handler returned an error"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        component = "registry",
                        event = "registry.handler.panicked",
                        registry = %self.name,
                        event_name = event,
                        handler_id = id.0,
                        "Handler panicked"
                    );
                }
            }
        }
        report
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Events that currently have at least one handler.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.lock().keys().cloned().collect();
        events.sort();
        events
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn same_handler<T>(a: &Handler<T>, b: &Handler<T>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
