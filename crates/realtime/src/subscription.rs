//! Scoped handler registrations.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::registry::{EventRegistry, HandlerId};

/// Keeps a handler registered until dropped or released.
///
/// Hold it for as long as the owning consumer lives; dropping it removes the
/// handler so nothing fires into torn-down state.
#[must_use = "dropping a Subscription unregisters its handler immediately"]
pub struct Subscription {
    event: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<T: Send + Sync + 'static>(
        registry: &Arc<EventRegistry<T>>,
        event: &str,
        id: HandlerId,
    ) -> Self {
        let weak: Weak<EventRegistry<T>> = Arc::downgrade(registry);
        let key = event.to_string();
        Self {
            event: event.to_string(),
            release: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.unregister(&key, id);
                }
            })),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Unregister now. Same as dropping.
    pub fn release(mut self) {
        self.run_release();
    }

    /// Keep the handler registered for the rest of the process.
    pub fn detach(mut self) {
        self.release = None;
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("active", &self.is_active())
            .finish()
    }
}
