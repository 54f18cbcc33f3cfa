//! Registry of method interceptors with a per-method applicability cache.
//!
//! # Responsibility
//! - Mirror `dyn MethodInterceptor` registrations of one directory, in
//!   registration order.
//! - Resolve and cache the interceptors interested in each method.
//!
//! # Invariants
//! - Interceptor list and cache share one lock, so a cached list is never
//!   computed from a stale interceptor list.
//! - Any interceptor registration or withdrawal clears the whole cache.

use crate::interception::error::InterceptorError;
use crate::interception::method::MethodEntry;
use crate::interception::policy::MethodInterceptor;
use crate::interception::values::Attributes;
use crate::logging::describe_panic;
use crate::service::directory::ServiceDirectory;
use crate::service::entry::{EntryId, ServiceEntry, ServiceType};
use crate::service::subscription::{ListenerError, ListenerResult, ServiceListener, Subscription};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type InterceptorResult<T> = Result<T, InterceptorError>;

/// One interceptor known to apply to a method.
#[derive(Clone)]
pub struct ApplicablePolicy {
    entry_id: EntryId,
    interceptor: Arc<dyn MethodInterceptor>,
    context: Arc<Attributes>,
}

impl ApplicablePolicy {
    /// Directory entry the interceptor was registered as.
    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn interceptor(&self) -> &Arc<dyn MethodInterceptor> {
        &self.interceptor
    }

    /// Context captured by `interested_in` for this method.
    pub fn context(&self) -> &Attributes {
        &self.context
    }
}

impl std::fmt::Debug for ApplicablePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicablePolicy")
            .field("entry_id", &self.entry_id)
            .field("context", &self.context)
            .finish()
    }
}

struct PolicyRegistration {
    entry_id: EntryId,
    interceptor: Arc<dyn MethodInterceptor>,
}

#[derive(Default)]
struct RegistryState {
    policies: Vec<PolicyRegistration>,
    cache: HashMap<MethodEntry, Arc<[ApplicablePolicy]>>,
}

struct RegistryCore {
    state: RwLock<Option<RegistryState>>,
}

impl ServiceListener for RegistryCore {
    fn service_added(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        let interceptor = entry
            .service::<dyn MethodInterceptor>()
            .ok_or_else(|| ListenerError::new(format!("entry {entry} is not an interceptor")))?;
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        state.policies.push(PolicyRegistration {
            entry_id: entry.id(),
            interceptor,
        });
        let cleared = state.cache.len();
        state.cache.clear();
        debug!(
            "event=interceptor_added module=interceptors entry={} policies={} cache_cleared={}",
            entry,
            state.policies.len(),
            cleared
        );
        Ok(())
    }

    fn service_removed(&self, entry: &Arc<ServiceEntry>) -> ListenerResult {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        state
            .policies
            .retain(|policy| policy.entry_id != entry.id());
        let cleared = state.cache.len();
        state.cache.clear();
        debug!(
            "event=interceptor_removed module=interceptors entry={} policies={} cache_cleared={}",
            entry,
            state.policies.len(),
            cleared
        );
        Ok(())
    }
}

/// Interceptors registered in one directory.
pub struct InterceptorRegistry {
    core: Arc<RegistryCore>,
    subscription: Mutex<Option<Subscription>>,
}

impl InterceptorRegistry {
    /// Starts mirroring interceptor registrations of `directory`.
    ///
    /// Interceptors already registered are loaded before return.
    pub fn attach(directory: &ServiceDirectory) -> InterceptorResult<Self> {
        let core = Arc::new(RegistryCore {
            state: RwLock::new(Some(RegistryState::default())),
        });
        let listener: Arc<dyn ServiceListener> = core.clone();
        let subscription =
            directory.subscribe(ServiceType::of::<dyn MethodInterceptor>(), None, listener)?;
        Ok(Self {
            core,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.core.state.read().is_some()
    }

    /// Interceptors interested in `method`, in registration order.
    ///
    /// Computed once per method and cached until the interceptor set changes.
    pub fn applicable(&self, method: &MethodEntry) -> InterceptorResult<Arc<[ApplicablePolicy]>> {
        {
            let guard = self.core.state.read();
            let state = guard.as_ref().ok_or(InterceptorError::NotRunning)?;
            if let Some(cached) = state.cache.get(method) {
                return Ok(cached.clone());
            }
        }

        let mut guard = self.core.state.write();
        let state = guard.as_mut().ok_or(InterceptorError::NotRunning)?;
        // Why: another thread may have filled the slot between the two locks.
        if let Some(cached) = state.cache.get(method) {
            return Ok(cached.clone());
        }

        let mut applicable = Vec::new();
        for policy in &state.policies {
            let mut context = Attributes::new();
            let interested = catch_unwind(AssertUnwindSafe(|| {
                policy.interceptor.interested_in(method, &mut context)
            }));
            match interested {
                Ok(true) => applicable.push(ApplicablePolicy {
                    entry_id: policy.entry_id,
                    interceptor: policy.interceptor.clone(),
                    context: Arc::new(context),
                }),
                Ok(false) => {}
                Err(payload) => warn!(
                    "event=interest_check_panicked module=interceptors method={} entry={} payload={}",
                    method,
                    policy.entry_id,
                    describe_panic(payload.as_ref())
                ),
            }
        }

        let applicable: Arc<[ApplicablePolicy]> = Arc::from(applicable);
        state.cache.insert(method.clone(), applicable.clone());
        debug!(
            "event=interceptors_resolved module=interceptors method={} applicable={}",
            method,
            applicable.len()
        );
        Ok(applicable)
    }

    /// Number of registered interceptors.
    pub fn policy_count(&self) -> InterceptorResult<usize> {
        let guard = self.core.state.read();
        let state = guard.as_ref().ok_or(InterceptorError::NotRunning)?;
        Ok(state.policies.len())
    }

    /// Number of methods with a cached applicable list.
    pub fn cached_methods(&self) -> InterceptorResult<usize> {
        let guard = self.core.state.read();
        let state = guard.as_ref().ok_or(InterceptorError::NotRunning)?;
        Ok(state.cache.len())
    }

    /// Detaches from the directory and drops every interceptor. Idempotent.
    pub fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(state) = self.core.state.write().take() {
            debug!(
                "event=interceptors_shutdown module=interceptors policies={}",
                state.policies.len()
            );
        }
    }
}

impl Drop for InterceptorRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
