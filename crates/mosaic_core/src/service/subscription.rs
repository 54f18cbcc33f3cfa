//! Filtered listener subscriptions.
//!
//! # Responsibility
//! - Wrap a listener with the capability type and predicate it cares about.
//! - Deliver add/remove callbacks with failure isolation.
//!
//! # Invariants
//! - A remove callback is only delivered after the matching add callback.
//! - Each entry is delivered to one subscription at most once per direction.
//! - A weak subscription whose listener is gone is never invoked again.

use crate::logging::describe_panic;
use crate::predicate::{matches_optional, Predicate};
use crate::service::directory::Shared;
use crate::service::entry::{EntryId, ServiceEntry, ServiceType};
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Stable identifier of one subscription.
pub type SubscriptionId = Uuid;

pub type ListenerResult = Result<(), ListenerError>;

/// Failure reported by a listener callback.
///
/// Logged by the dispatcher; never propagated to the registering caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ListenerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ListenerError {}

/// Callback interface for directory events.
pub trait ServiceListener: Send + Sync {
    fn service_added(&self, entry: &Arc<ServiceEntry>) -> ListenerResult;

    fn service_removed(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        let _ = entry;
        Ok(())
    }
}

/// Listener built from two closures.
pub struct FnListener<A, R> {
    on_added: A,
    on_removed: R,
}

/// Creates a listener from add/remove closures.
pub fn listener_fn<A, R>(on_added: A, on_removed: R) -> FnListener<A, R>
where
    A: Fn(&Arc<ServiceEntry>) -> ListenerResult + Send + Sync,
    R: Fn(&Arc<ServiceEntry>) -> ListenerResult + Send + Sync,
{
    FnListener {
        on_added,
        on_removed,
    }
}

impl<A, R> ServiceListener for FnListener<A, R>
where
    A: Fn(&Arc<ServiceEntry>) -> ListenerResult + Send + Sync,
    R: Fn(&Arc<ServiceEntry>) -> ListenerResult + Send + Sync,
{
    fn service_added(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        (self.on_added)(entry)
    }

    fn service_removed(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        (self.on_removed)(entry)
    }
}

pub(crate) enum ListenerRef {
    Strong(Arc<dyn ServiceListener>),
    Weak(Weak<dyn ServiceListener>),
}

impl ListenerRef {
    fn resolve(&self) -> Option<Arc<dyn ServiceListener>> {
        match self {
            Self::Strong(listener) => Some(listener.clone()),
            Self::Weak(listener) => listener.upgrade(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Strong(_) => "strong",
            Self::Weak(_) => "weak",
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Skipped,
    /// Weak listener is unreachable; the subscription must be pruned.
    Dead,
}

/// Directory-side record of one subscription.
pub(crate) struct SubscriptionSlot {
    id: SubscriptionId,
    service_type: ServiceType,
    predicate: Option<Predicate>,
    listener: ListenerRef,
    active: AtomicBool,
    delivered: Mutex<HashSet<EntryId>>,
}

impl SubscriptionSlot {
    pub(crate) fn new(
        service_type: ServiceType,
        predicate: Option<Predicate>,
        listener: ListenerRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_type,
            predicate,
            listener,
            active: AtomicBool::new(true),
            delivered: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Returns whether the listener can still be reached.
    pub(crate) fn is_reachable(&self) -> bool {
        match &self.listener {
            ListenerRef::Strong(_) => true,
            ListenerRef::Weak(listener) => listener.strong_count() > 0,
        }
    }

    pub(crate) fn accepts(&self, entry: &ServiceEntry) -> bool {
        entry.service_type() == self.service_type
            && matches_optional(self.predicate.as_ref(), entry.properties())
    }

    pub(crate) fn deliver_added(&self, entry: &Arc<ServiceEntry>) -> Delivery {
        if !self.is_active() || !entry.is_live() || !self.accepts(entry) {
            return Delivery::Skipped;
        }
        let Some(listener) = self.listener.resolve() else {
            self.deactivate();
            return Delivery::Dead;
        };
        if !self.delivered.lock().insert(entry.id()) {
            return Delivery::Skipped;
        }

        self.invoke("added", entry, || listener.service_added(entry));
        Delivery::Delivered
    }

    pub(crate) fn deliver_removed(&self, entry: &Arc<ServiceEntry>) -> Delivery {
        if !self.is_active() || !self.accepts(entry) {
            return Delivery::Skipped;
        }
        let Some(listener) = self.listener.resolve() else {
            self.deactivate();
            return Delivery::Dead;
        };
        if !self.delivered.lock().remove(&entry.id()) {
            return Delivery::Skipped;
        }

        self.invoke("removed", entry, || listener.service_removed(entry));
        Delivery::Delivered
    }

    fn invoke(&self, phase: &str, entry: &ServiceEntry, callback: impl FnOnce() -> ListenerResult) {
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                "event=listener_failed module=directory phase={} subscription={} entry={} error={}",
                phase, self.id, entry, err
            ),
            Err(payload) => warn!(
                "event=listener_panicked module=directory phase={} subscription={} entry={} payload={}",
                phase,
                self.id,
                entry,
                describe_panic(payload.as_ref())
            ),
        }
    }
}

impl Display for SubscriptionSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{} kind={}",
            self.service_type.name(),
            self.id,
            self.listener.kind()
        )?;
        if let Some(predicate) = &self.predicate {
            write!(f, " filter={predicate}")?;
        }
        Ok(())
    }
}

/// Handle to one directory subscription.
///
/// Cloning shares the same subscription; `unsubscribe` is idempotent.
#[derive(Clone)]
pub struct Subscription {
    slot: Arc<SubscriptionSlot>,
    directory: Weak<Shared>,
}

impl Subscription {
    pub(crate) fn new(slot: Arc<SubscriptionSlot>, directory: Weak<Shared>) -> Self {
        Self { slot, directory }
    }

    pub fn id(&self) -> SubscriptionId {
        self.slot.id()
    }

    /// Returns whether events can still reach this subscription.
    pub fn is_active(&self) -> bool {
        self.slot.is_active() && self.slot.is_reachable()
    }

    /// Removes the subscription from its directory.
    pub fn unsubscribe(&self) {
        self.slot.deactivate();
        match self.directory.upgrade() {
            Some(shared) => shared.remove_subscription(self.slot.id()),
            None => trace!(
                "event=unsubscribe_skipped module=directory reason=directory_dropped subscription={}",
                self.slot.id()
            ),
        }
    }

    /// Converts this handle into a guard that unsubscribes when dropped.
    pub fn guard(self) -> SubscriptionGuard {
        SubscriptionGuard {
            subscription: Some(self),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Scope-owned subscription; dropping it unsubscribes.
pub struct SubscriptionGuard {
    subscription: Option<Subscription>,
}

impl SubscriptionGuard {
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Releases the guard without unsubscribing.
    pub fn into_inner(mut self) -> Option<Subscription> {
        self.subscription.take()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
