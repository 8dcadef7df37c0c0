//! Subscriber types for the reactive system.
//!
//! A Subscriber is a callback registered directly on a field or calculation.
//! Subscribing hands back a [`Subscription`] that undoes the registration
//! when dropped.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered callback receiving values of type `A`.
pub(crate) struct Subscriber<A> {
    id: SubscriberId,
    notify: Rc<dyn Fn(A)>,
}

impl<A> Subscriber<A> {
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(A) + 'static,
    {
        Self {
            id: SubscriberId::new(),
            notify: Rc::new(notify),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// A clone of the callback, so it can be invoked after the subscriber
    /// list is no longer borrowed.
    pub fn handler(&self) -> Rc<dyn Fn(A)> {
        Rc::clone(&self.notify)
    }

    pub fn notify(&self, value: A) {
        (self.notify)(value);
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle, or calling [`Subscription::unsubscribe`], removes
/// the callback and releases whatever the subscription retained.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the subscription for the rest of the engine's life.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
