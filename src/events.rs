//! Repository event bus.
//!
//! Each repository owns one bus; subscribers receive ordered
//! `(resource, version, event)` tuples for every committed mutation. No
//! process-wide state — two open repositories have two independent buses.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use keel_odb::ObjectId;

/// Which repository resource changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// A ref, by full name.
    Ref(String),
    /// The staging index.
    Index,
    /// `HEAD`.
    Head,
    /// The worktree.
    Worktree,
}

/// What happened to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A ref moved (old may be `None` on creation, new on deletion).
    RefUpdated {
        /// Previous value.
        old: Option<ObjectId>,
        /// New value.
        new: Option<ObjectId>,
    },
    /// The index was saved.
    IndexSaved,
    /// A checkout completed.
    CheckoutCompleted {
        /// `HEAD` before.
        previous_head: Option<ObjectId>,
        /// `HEAD` after.
        new_head: Option<ObjectId>,
        /// `"branch"` for a full checkout, `"file"` for a pathspec one.
        kind: &'static str,
    },
}

type Subscriber = Box<dyn Fn(&Resource, u64, &Event) + Send + Sync>;

/// Ordered event delivery for one repository.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    version: AtomicU64,
}

impl EventBus {
    /// A bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Delivery happens on the mutating thread, in
    /// publish order.
    pub fn subscribe(&self, subscriber: impl Fn(&Resource, u64, &Event) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(subscriber));
    }

    /// Publish an event, assigning it the next version number.
    pub fn publish(&self, resource: &Resource, event: &Event) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for subscriber in subscribers.iter() {
            subscriber(resource, version, event);
        }
        version
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
