//! Process-wide service directory.
//!
//! # Responsibility
//! - Store live registrations and answer point lookups.
//! - Fan registration/withdrawal events out to matching subscriptions.
//!
//! # Invariants
//! - One reader/writer lock guards entries and subscriptions together.
//! - Callbacks never run while that lock is held; subscription lists are
//!   snapshotted first.
//! - Mutation plus fan-out is serialized by a re-entrant dispatch lock, so a
//!   callback may call back into the directory on the same thread.
//! - A withdrawn entry is never returned by lookups.

use crate::predicate::{matches_optional, Predicate, Properties};
use crate::service::entry::{OwnerId, ServiceEntry, ServiceType};
use crate::service::subscription::{
    Delivery, ListenerRef, ServiceListener, Subscription, SubscriptionId, SubscriptionSlot,
};
use log::{debug, info, trace};
use parking_lot::{ReentrantMutex, RwLock};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Directory usage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The directory was shut down.
    NotRunning,
    /// A typed accessor was used with a type the entry was not registered as.
    InvalidServiceType {
        expected: &'static str,
        actual: &'static str,
    },
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "service directory is no longer running"),
            Self::InvalidServiceType { expected, actual } => {
                write!(f, "service registered as `{actual}`, requested as `{expected}`")
            }
        }
    }
}

impl Error for DirectoryError {}

struct DirectoryState {
    entries: Vec<Arc<ServiceEntry>>,
    subscriptions: Vec<Arc<SubscriptionSlot>>,
}

pub(crate) struct Shared {
    dispatch: ReentrantMutex<()>,
    state: RwLock<Option<DirectoryState>>,
}

impl Shared {
    pub(crate) fn remove_subscription(&self, id: SubscriptionId) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return;
        };
        state.subscriptions.retain(|slot| {
            if slot.id() == id {
                trace!("event=subscription_removed module=directory subscription={slot}");
                return false;
            }
            if !slot.is_reachable() {
                trace!("event=subscription_pruned module=directory subscription={slot}");
                return false;
            }
            true
        });
    }

    fn prune_dead(&self) {
        let mut guard = self.state.write();
        if let Some(state) = guard.as_mut() {
            state.subscriptions.retain(|slot| {
                let keep = slot.is_active() && slot.is_reachable();
                if !keep {
                    trace!("event=subscription_pruned module=directory subscription={slot}");
                }
                keep
            });
        }
    }

    fn dispatch_added(&self, entry: &Arc<ServiceEntry>, subscriptions: &[Arc<SubscriptionSlot>]) {
        let mut dead = false;
        for slot in subscriptions {
            if slot.deliver_added(entry) == Delivery::Dead {
                dead = true;
            }
        }
        if dead {
            self.prune_dead();
        }
    }

    fn dispatch_removed(&self, entry: &Arc<ServiceEntry>, subscriptions: &[Arc<SubscriptionSlot>]) {
        let mut dead = false;
        for slot in subscriptions {
            if slot.deliver_removed(entry) == Delivery::Dead {
                dead = true;
            }
        }
        if dead {
            self.prune_dead();
        }
    }
}

/// Resolves the typed service of `entry`.
pub fn service_of<T: ?Sized + 'static>(entry: &ServiceEntry) -> DirectoryResult<Arc<T>> {
    entry
        .service::<T>()
        .ok_or(DirectoryError::InvalidServiceType {
            expected: std::any::type_name::<T>(),
            actual: entry.service_type().name(),
        })
}

/// Registry of live services and their subscribers.
///
/// Cheap to clone; clones share the same directory.
#[derive(Clone)]
pub struct ServiceDirectory {
    shared: Arc<Shared>,
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceDirectory {
    /// Creates a running, empty directory.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatch: ReentrantMutex::new(()),
                state: RwLock::new(Some(DirectoryState {
                    entries: Vec::new(),
                    subscriptions: Vec::new(),
                })),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.read().is_some()
    }

    /// Registers `service` under its capability type `T`.
    ///
    /// Matching subscriptions are notified in subscription order before this
    /// call returns.
    pub fn register<T>(
        &self,
        owner: &OwnerId,
        service: Arc<T>,
        properties: Properties,
    ) -> DirectoryResult<Arc<ServiceEntry>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let _dispatch = self.shared.dispatch.lock();
        let entry = Arc::new(ServiceEntry::new(owner.clone(), service, properties));
        let subscriptions = {
            let mut guard = self.shared.state.write();
            let state = guard.as_mut().ok_or(DirectoryError::NotRunning)?;
            state.entries.push(entry.clone());
            state.subscriptions.clone()
        };
        trace!("event=service_registered module=directory entry={entry}");

        self.shared.dispatch_added(&entry, &subscriptions);
        Ok(entry)
    }

    /// Withdraws one entry.
    ///
    /// Returns `Ok(false)` when the entry was already withdrawn or belongs to
    /// another directory.
    pub fn withdraw(&self, entry: &Arc<ServiceEntry>) -> DirectoryResult<bool> {
        let _dispatch = self.shared.dispatch.lock();
        let subscriptions = {
            let mut guard = self.shared.state.write();
            let state = guard.as_mut().ok_or(DirectoryError::NotRunning)?;
            let Some(index) = state
                .entries
                .iter()
                .position(|candidate| candidate.id() == entry.id())
            else {
                return Ok(false);
            };
            if !entry.mark_withdrawn() {
                return Ok(false);
            }
            state.entries.remove(index);
            state.subscriptions.clone()
        };
        trace!("event=service_withdrawn module=directory entry={entry}");

        self.shared.dispatch_removed(entry, &subscriptions);
        Ok(true)
    }

    /// Withdraws every live entry registered by `owner`, in registration order.
    pub fn withdraw_owned_by(&self, owner: &OwnerId) -> DirectoryResult<usize> {
        let _dispatch = self.shared.dispatch.lock();
        let (withdrawn, subscriptions) = {
            let mut guard = self.shared.state.write();
            let state = guard.as_mut().ok_or(DirectoryError::NotRunning)?;
            let mut withdrawn = Vec::new();
            state.entries.retain(|entry| {
                if entry.owner() == owner && entry.mark_withdrawn() {
                    withdrawn.push(entry.clone());
                    return false;
                }
                true
            });
            (withdrawn, state.subscriptions.clone())
        };
        debug!(
            "event=owner_withdrawn module=directory owner={} count={}",
            owner,
            withdrawn.len()
        );

        for entry in &withdrawn {
            self.shared.dispatch_removed(entry, &subscriptions);
        }
        Ok(withdrawn.len())
    }

    /// Returns some live entry of `service_type` matching `predicate`.
    pub fn find(
        &self,
        service_type: ServiceType,
        predicate: Option<&Predicate>,
    ) -> DirectoryResult<Option<Arc<ServiceEntry>>> {
        let guard = self.shared.state.read();
        let state = guard.as_ref().ok_or(DirectoryError::NotRunning)?;
        Ok(state
            .entries
            .iter()
            .find(|entry| {
                entry.is_live()
                    && entry.service_type() == service_type
                    && matches_optional(predicate, entry.properties())
            })
            .cloned())
    }

    /// Typed variant of [`ServiceDirectory::find`].
    pub fn find_service<T: ?Sized + 'static>(
        &self,
        predicate: Option<&Predicate>,
    ) -> DirectoryResult<Option<Arc<T>>> {
        match self.find(ServiceType::of::<T>(), predicate)? {
            Some(entry) => service_of::<T>(&entry).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot of every live match, in registration order.
    pub fn entries(
        &self,
        service_type: ServiceType,
        predicate: Option<&Predicate>,
    ) -> DirectoryResult<Vec<Arc<ServiceEntry>>> {
        let guard = self.shared.state.read();
        let state = guard.as_ref().ok_or(DirectoryError::NotRunning)?;
        Ok(state
            .entries
            .iter()
            .filter(|entry| {
                entry.is_live()
                    && entry.service_type() == service_type
                    && matches_optional(predicate, entry.properties())
            })
            .cloned()
            .collect())
    }

    /// Number of live entries.
    pub fn len(&self) -> DirectoryResult<usize> {
        let guard = self.shared.state.read();
        let state = guard.as_ref().ok_or(DirectoryError::NotRunning)?;
        Ok(state.entries.len())
    }

    pub fn is_empty(&self) -> DirectoryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of registered subscriptions, including not yet pruned dead ones.
    pub fn subscription_count(&self) -> DirectoryResult<usize> {
        let guard = self.shared.state.read();
        let state = guard.as_ref().ok_or(DirectoryError::NotRunning)?;
        Ok(state.subscriptions.len())
    }

    /// Subscribes a listener that the directory keeps alive.
    ///
    /// Every currently live match is replayed to `listener` before return.
    pub fn subscribe(
        &self,
        service_type: ServiceType,
        predicate: Option<Predicate>,
        listener: Arc<dyn ServiceListener>,
    ) -> DirectoryResult<Subscription> {
        self.add_subscription(service_type, predicate, ListenerRef::Strong(listener))
    }

    /// Subscribes a listener without keeping it alive.
    ///
    /// Once every strong reference to `listener` is gone, the next event that
    /// reaches the subscription drops it instead of invoking it.
    pub fn subscribe_weak(
        &self,
        service_type: ServiceType,
        predicate: Option<Predicate>,
        listener: &Arc<dyn ServiceListener>,
    ) -> DirectoryResult<Subscription> {
        self.add_subscription(
            service_type,
            predicate,
            ListenerRef::Weak(Arc::downgrade(listener)),
        )
    }

    /// Removes a subscription; idempotent.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    fn add_subscription(
        &self,
        service_type: ServiceType,
        predicate: Option<Predicate>,
        listener: ListenerRef,
    ) -> DirectoryResult<Subscription> {
        let _dispatch = self.shared.dispatch.lock();
        let slot = Arc::new(SubscriptionSlot::new(service_type, predicate, listener));
        let replay = {
            let mut guard = self.shared.state.write();
            let state = guard.as_mut().ok_or(DirectoryError::NotRunning)?;
            state.subscriptions.push(slot.clone());
            state
                .entries
                .iter()
                .filter(|entry| slot.accepts(entry))
                .cloned()
                .collect::<Vec<_>>()
        };
        trace!(
            "event=subscription_added module=directory subscription={} replay={}",
            slot,
            replay.len()
        );

        for entry in &replay {
            if slot.deliver_added(entry) == Delivery::Dead {
                self.shared.prune_dead();
                break;
            }
        }
        Ok(Subscription::new(slot, Arc::downgrade(&self.shared)))
    }

    /// Stops the directory, then withdraws every entry and notifies subscribers.
    ///
    /// Idempotent; later operations fail with [`DirectoryError::NotRunning`],
    /// including directory calls made from the removal callbacks.
    pub fn shutdown(&self) {
        let _dispatch = self.shared.dispatch.lock();
        let taken = self.shared.state.write().take();
        let Some(state) = taken else {
            return;
        };

        for entry in &state.entries {
            if entry.mark_withdrawn() {
                self.shared.dispatch_removed(entry, &state.subscriptions);
            }
        }
        for slot in &state.subscriptions {
            slot.deactivate();
        }
        info!(
            "event=directory_shutdown module=directory entries={} subscriptions={}",
            state.entries.len(),
            state.subscriptions.len()
        );
    }
}
