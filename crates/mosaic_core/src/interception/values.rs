//! Type-erased values threaded through an invocation.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// String-keyed map of typed values.
///
/// Used for per-(interceptor, method) interest context and per-call scratch.
#[derive(Default)]
pub struct Attributes {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`; returns whether a previous value was replaced.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.values.insert(key.into(), Box::new(value)).is_some()
    }

    /// Returns the value under `key` when it has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Attributes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}

/// Ordered argument list of one call.
#[derive(Default)]
pub struct Arguments {
    values: Vec<Box<dyn Any + Send>>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an argument, builder style.
    pub fn with<T: Any + Send>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    pub fn push<T: Any + Send>(&mut self, value: T) {
        self.values.push(Box::new(value));
    }

    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.values
            .get(index)
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        self.values
            .get_mut(index)
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Replaces the argument at `index`; returns `false` when out of range.
    pub fn set<T: Any + Send>(&mut self, index: usize, value: T) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = Box::new(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Arguments {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arguments")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Optional type-erased return value.
#[derive(Default)]
pub struct Value {
    inner: Option<Box<dyn Any + Send>>,
}

impl Value {
    /// The absent value, used for unit-returning calls.
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn of<T: Any + Send>(value: T) -> Self {
        Self {
            inner: Some(Box::new(value)),
        }
    }

    pub fn is_none(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.as_ref().is_some_and(|value| value.is::<T>())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Takes the value out when it has type `T`, leaving [`Value::none`].
    ///
    /// A value of another type is left in place.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }
        self.inner
            .take()
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Unwraps into `T`, handing the value back on mismatch.
    pub fn into_inner<T: Any>(self) -> Result<T, Self> {
        match self.inner {
            Some(value) => value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|value| Self { inner: Some(value) }),
            None => Err(Self::none()),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(_) => write!(f, "Value(some)"),
            None => write!(f, "Value(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Arguments, Attributes, Value};

    #[test]
    fn attributes_are_typed() {
        let mut attributes = Attributes::new();
        assert!(!attributes.insert("role", "admin".to_string()));
        assert_eq!(
            attributes.get::<String>("role").map(String::as_str),
            Some("admin")
        );
        assert!(attributes.get::<u32>("role").is_none());
        if let Some(role) = attributes.get_mut::<String>("role") {
            role.push_str("-root");
        }
        assert_eq!(
            attributes.get::<String>("role").map(String::as_str),
            Some("admin-root")
        );
        assert!(attributes.remove("role"));
        assert!(attributes.is_empty());
    }

    #[test]
    fn arguments_support_typed_replacement() {
        let mut arguments = Arguments::new().with(7_i32).with("name".to_string());
        assert_eq!(arguments.len(), 2);
        assert_eq!(arguments.get::<i32>(0), Some(&7));
        assert!(arguments.set(0, 9_i32));
        assert!(!arguments.set(5, 1_i32));
        assert_eq!(arguments.get::<i32>(0), Some(&9));
        assert!(arguments.get::<i32>(1).is_none());
    }

    #[test]
    fn value_take_leaves_mismatched_types_in_place() {
        let mut value = Value::of(42_u64);
        assert!(value.take::<String>().is_none());
        assert!(value.is_some());
        assert_eq!(value.take::<u64>(), Some(42));
        assert!(value.is_none());

        let text = Value::of("x".to_string());
        let back = text.into_inner::<u8>().expect_err("type mismatch");
        assert_eq!(back.downcast_ref::<String>().map(String::as_str), Some("x"));
    }
}
