//! Service registration identity.
//!
//! # Invariants
//! - Owner, capability type and properties never change after creation.
//! - `live` flips from `true` to `false` at most once and never back.

use crate::predicate::Properties;
use std::any::{type_name, Any, TypeId};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Stable identifier of one registration.
pub type EntryId = Uuid;

/// Capability type tag a service is registered and matched under.
#[derive(Debug, Clone, Copy)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
}

impl ServiceType {
    /// Tag for `T`, which is usually a trait object such as `dyn Greeter`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Opaque identity of the component that registered a service.
///
/// Compared by id only; the name exists for log readability.
#[derive(Debug, Clone)]
pub struct OwnerId {
    id: Uuid,
    name: Arc<str>,
}

impl OwnerId {
    /// Creates a fresh owner identity with a display name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Creates an owner identity from an externally assigned id.
    pub fn with_id(id: Uuid, name: impl AsRef<str>) -> Self {
        Self {
            id,
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for OwnerId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OwnerId {}

impl Hash for OwnerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One registration in the service directory.
///
/// Handed out as `Arc<ServiceEntry>`; identity is the [`EntryId`].
pub struct ServiceEntry {
    id: EntryId,
    owner: OwnerId,
    service_type: ServiceType,
    properties: Properties,
    // Why: boxing the `Arc<T>` itself lets unsized trait objects be stored and
    // downcast back to `Arc<T>`.
    service: Box<dyn Any + Send + Sync>,
    live: AtomicBool,
}

impl ServiceEntry {
    pub(crate) fn new<T>(owner: OwnerId, service: Arc<T>, properties: Properties) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            owner,
            service_type: ServiceType::of::<T>(),
            properties,
            service: Box::new(service),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Returns whether the entry has not been withdrawn yet.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns the service instance when `T` is the registered type.
    ///
    /// Still available after withdrawal so removal callbacks can release it.
    pub fn service<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        self.service.downcast_ref::<Arc<T>>().cloned()
    }

    /// Marks the entry withdrawn; returns `true` only for the first call.
    pub(crate) fn mark_withdrawn(&self) -> bool {
        self.live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("id", &self.id)
            .field("owner", &self.owner.name())
            .field("type", &self.service_type.name())
            .field("properties", &self.properties)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Display for ServiceEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{} (owner={})",
            self.service_type.name(),
            self.id,
            self.owner
        )
    }
}
