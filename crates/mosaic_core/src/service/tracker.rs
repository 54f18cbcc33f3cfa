//! Live mirror of matching directory entries.
//!
//! # Responsibility
//! - Keep an ordered list of live services of one type matching a predicate.
//! - Fan add/remove changes out to tracker observers.
//!
//! # Invariants
//! - The list is mutated only by directory events.
//! - The tracker subscribes weakly; the directory never keeps it alive.

use crate::logging::describe_panic;
use crate::predicate::Predicate;
use crate::service::directory::{DirectoryError, ServiceDirectory};
use crate::service::entry::{ServiceEntry, ServiceType};
use crate::service::subscription::{ListenerError, ListenerResult, ServiceListener, Subscription};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Tracker usage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Accessor used while the tracker is stopped.
    NotTracking,
    /// Tracking, but no live match exists.
    Unavailable { service_type: &'static str },
    Directory(DirectoryError),
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotTracking => write!(f, "service tracker is not tracking"),
            Self::Unavailable { service_type } => {
                write!(f, "service `{service_type}` is not currently available")
            }
            Self::Directory(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TrackerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Directory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DirectoryError> for TrackerError {
    fn from(value: DirectoryError) -> Self {
        Self::Directory(value)
    }
}

struct Tracked<T: ?Sized> {
    entry: Arc<ServiceEntry>,
    service: Arc<T>,
}

struct TrackerCore<T: ?Sized> {
    tracking: AtomicBool,
    tracked: RwLock<Vec<Tracked<T>>>,
    observers: RwLock<Vec<Arc<dyn ServiceListener>>>,
}

impl<T: ?Sized> TrackerCore<T> {
    /// Flips tracking off and empties the list in one critical section.
    fn deactivate(&self) {
        let mut tracked = self.tracked.write();
        self.tracking.store(false, Ordering::Release);
        tracked.clear();
    }

    fn notify(&self, phase: &str, entry: &Arc<ServiceEntry>) {
        let observers = self.observers.read().clone();
        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
                "added" => observer.service_added(entry),
                _ => observer.service_removed(entry),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    "event=observer_failed module=tracker phase={} entry={} error={}",
                    phase, entry, err
                ),
                Err(payload) => warn!(
                    "event=observer_panicked module=tracker phase={} entry={} payload={}",
                    phase,
                    entry,
                    describe_panic(payload.as_ref())
                ),
            }
        }
    }
}

impl<T> ServiceListener for TrackerCore<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    fn service_added(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        let service = entry.service::<T>().ok_or_else(|| {
            ListenerError::new(format!(
                "entry {} does not hold `{}`",
                entry,
                std::any::type_name::<T>()
            ))
        })?;
        {
            let mut tracked = self.tracked.write();
            // Why: checked under the list lock so a concurrent `stop` cannot clear
            // the list between this check and the push.
            if !self.tracking.load(Ordering::Acquire) {
                return Ok(());
            }
            if tracked.iter().any(|item| item.entry.id() == entry.id()) {
                return Ok(());
            }
            tracked.push(Tracked {
                entry: entry.clone(),
                service,
            });
        }
        self.notify("added", entry);
        Ok(())
    }

    fn service_removed(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        let removed = {
            let mut tracked = self.tracked.write();
            let before = tracked.len();
            tracked.retain(|item| item.entry.id() != entry.id());
            tracked.len() != before
        };
        if removed {
            self.notify("removed", entry);
        }
        Ok(())
    }
}

/// Tracks live services of type `T` matching an optional predicate.
pub struct ServiceTracker<T: ?Sized + Send + Sync + 'static> {
    directory: ServiceDirectory,
    predicate: Option<Predicate>,
    core: Arc<TrackerCore<T>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<T> ServiceTracker<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    /// Creates a stopped tracker.
    pub fn new(directory: &ServiceDirectory, predicate: Option<Predicate>) -> Self {
        Self {
            directory: directory.clone(),
            predicate,
            core: Arc::new(TrackerCore {
                tracking: AtomicBool::new(false),
                tracked: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Starts tracking; current matches are loaded before return.
    ///
    /// Calling `start` on a running tracker does nothing. A call that races
    /// another `start` returns once that call has claimed the tracker, so it
    /// may observe the list while the replay is still filling it.
    pub fn start(&self) -> TrackerResult<()> {
        if self
            .core
            .tracking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // Why: subscribing takes the directory dispatch lock, and dispatch may
        // call `start` from a callback; holding a tracker lock here deadlocks.
        let listener: Arc<dyn ServiceListener> = self.core.clone();
        match self.directory.subscribe_weak(
            ServiceType::of::<T>(),
            self.predicate.clone(),
            &listener,
        ) {
            Ok(handle) => {
                debug!(
                    "event=tracker_started module=tracker type={} tracked={}",
                    std::any::type_name::<T>(),
                    self.core.tracked.read().len()
                );
                let replaced = self.subscription.lock().replace(handle);
                if let Some(stale) = replaced {
                    stale.unsubscribe();
                }
                Ok(())
            }
            Err(err) => {
                self.core.tracking.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// Stops tracking and clears the list; observers are not notified.
    pub fn stop(&self) {
        let handle = self.subscription.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.core.deactivate();
        handle.unsubscribe();
        debug!(
            "event=tracker_stopped module=tracker type={}",
            std::any::type_name::<T>()
        );
    }

    pub fn is_tracking(&self) -> bool {
        self.core.tracking.load(Ordering::Acquire)
    }

    fn ensure_tracking(&self) -> TrackerResult<()> {
        if self.is_tracking() {
            Ok(())
        } else {
            Err(TrackerError::NotTracking)
        }
    }

    /// Tracked entries in the order the directory delivered them.
    pub fn entries(&self) -> TrackerResult<Vec<Arc<ServiceEntry>>> {
        self.ensure_tracking()?;
        Ok(self
            .core
            .tracked
            .read()
            .iter()
            .map(|item| item.entry.clone())
            .collect())
    }

    pub fn services(&self) -> TrackerResult<Vec<Arc<T>>> {
        self.ensure_tracking()?;
        Ok(self
            .core
            .tracked
            .read()
            .iter()
            .map(|item| item.service.clone())
            .collect())
    }

    /// First tracked entry, if any.
    pub fn entry(&self) -> TrackerResult<Option<Arc<ServiceEntry>>> {
        self.ensure_tracking()?;
        Ok(self.core.tracked.read().first().map(|item| item.entry.clone()))
    }

    /// First tracked service, if any.
    pub fn service(&self) -> TrackerResult<Option<Arc<T>>> {
        self.ensure_tracking()?;
        Ok(self
            .core
            .tracked
            .read()
            .first()
            .map(|item| item.service.clone()))
    }

    /// First tracked service, or [`TrackerError::Unavailable`].
    pub fn require(&self) -> TrackerResult<Arc<T>> {
        self.service()?.ok_or(TrackerError::Unavailable {
            service_type: std::any::type_name::<T>(),
        })
    }

    pub fn len(&self) -> TrackerResult<usize> {
        self.ensure_tracking()?;
        Ok(self.core.tracked.read().len())
    }

    pub fn is_empty(&self) -> TrackerResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Adds an observer of tracker changes. Existing matches are not replayed.
    pub fn add_observer(&self, observer: Arc<dyn ServiceListener>) {
        self.core.observers.write().push(observer);
    }

    /// Removes an observer by identity; returns whether it was present.
    pub fn remove_observer(&self, observer: &Arc<dyn ServiceListener>) -> bool {
        let mut observers = self.core.observers.write();
        let before = observers.len();
        observers.retain(|candidate| !Arc::ptr_eq(candidate, observer));
        observers.len() != before
    }
}

impl<T> Drop for ServiceTracker<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}
