//! Interceptor contract and the per-hook invocation views.
//!
//! # Invariants
//! - A [`Decision`] can only be obtained from the [`BeforeInvocation`] of the
//!   call it applies to.
//! - Scratch attributes are private to one (interceptor, call) pair.

use crate::interception::error::InvocationError;
use crate::interception::method::MethodEntry;
use crate::interception::values::{Arguments, Attributes, Value};
use std::any::Any;
use std::sync::Arc;

/// Cross-cutting policy applied around interceptable calls.
///
/// Registered in the service directory under `dyn MethodInterceptor`.
/// `interested_in` runs while the interceptor cache is locked, so it must not
/// call back into the registry or register services.
pub trait MethodInterceptor: Send + Sync {
    /// Decides whether this interceptor applies to `method`.
    ///
    /// Values stored in `context` are kept for every later call of `method`.
    fn interested_in(&self, method: &MethodEntry, context: &mut Attributes) -> bool;

    /// Runs before the guarded body, in registration order.
    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        Ok(invocation.proceed())
    }

    /// Runs after a successful or aborted call, in reverse order.
    fn after(&self, invocation: &mut AfterInvocation<'_>) -> Result<Value, InvocationError> {
        Ok(invocation.take_return_value())
    }

    /// Runs while an error is pending, in reverse order.
    ///
    /// Returning `Ok` recovers with a replacement value; returning `Err`
    /// hands that error to the next outer interceptor.
    fn on_exception(
        &self,
        invocation: &mut ExceptionInvocation<'_>,
        error: InvocationError,
    ) -> Result<Value, InvocationError> {
        let _ = invocation;
        Err(error)
    }
}

#[derive(Debug)]
pub(crate) enum DecisionKind {
    Proceed,
    Abort(Value),
}

/// Outcome of a before-hook.
#[derive(Debug)]
pub struct Decision {
    call_id: u64,
    kind: DecisionKind,
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self.kind, DecisionKind::Proceed)
    }

    pub fn is_abort(&self) -> bool {
        matches!(self.kind, DecisionKind::Abort(_))
    }

    pub(crate) fn into_parts(self) -> (u64, DecisionKind) {
        (self.call_id, self.kind)
    }
}

/// Fields shared by every hook view.
pub(crate) struct CallView<'a> {
    pub(crate) call_id: u64,
    pub(crate) method: &'a MethodEntry,
    pub(crate) receiver: Option<&'a Arc<dyn Any + Send + Sync>>,
    pub(crate) interceptor_context: &'a Attributes,
    pub(crate) scratch: &'a mut Attributes,
}

macro_rules! call_view_accessors {
    () => {
        pub fn method(&self) -> &MethodEntry {
            self.view.method
        }

        /// Receiver of the call, if it has one.
        pub fn receiver(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
            self.view.receiver
        }

        pub fn receiver_as<T: Any>(&self) -> Option<&T> {
            self.view
                .receiver
                .and_then(|receiver| (**receiver).downcast_ref::<T>())
        }

        /// Context recorded by `interested_in` for this method.
        pub fn interceptor_context(&self) -> &Attributes {
            self.view.interceptor_context
        }

        /// Scratch shared by this interceptor's hooks within one call.
        pub fn scratch(&self) -> &Attributes {
            &*self.view.scratch
        }

        pub fn scratch_mut(&mut self) -> &mut Attributes {
            &mut *self.view.scratch
        }
    };
}

/// View handed to [`MethodInterceptor::before`].
pub struct BeforeInvocation<'a> {
    view: CallView<'a>,
    arguments: &'a mut Arguments,
}

impl<'a> BeforeInvocation<'a> {
    pub(crate) fn new(view: CallView<'a>, arguments: &'a mut Arguments) -> Self {
        Self { view, arguments }
    }

    call_view_accessors!();

    pub fn arguments(&self) -> &Arguments {
        &*self.arguments
    }

    /// Live arguments; changes are seen by later hooks and the guarded body.
    pub fn arguments_mut(&mut self) -> &mut Arguments {
        &mut *self.arguments
    }

    /// Lets the call continue to the next interceptor or the body.
    pub fn proceed(&self) -> Decision {
        Decision {
            call_id: self.view.call_id,
            kind: DecisionKind::Proceed,
        }
    }

    /// Skips the body; `value` becomes the return value seen by after-hooks.
    pub fn abort(&self, value: Value) -> Decision {
        Decision {
            call_id: self.view.call_id,
            kind: DecisionKind::Abort(value),
        }
    }
}

/// View handed to [`MethodInterceptor::after`].
pub struct AfterInvocation<'a> {
    view: CallView<'a>,
    arguments: &'a Arguments,
    return_value: &'a mut Value,
}

impl<'a> AfterInvocation<'a> {
    pub(crate) fn new(
        view: CallView<'a>,
        arguments: &'a Arguments,
        return_value: &'a mut Value,
    ) -> Self {
        Self {
            view,
            arguments,
            return_value,
        }
    }

    call_view_accessors!();

    pub fn arguments(&self) -> &Arguments {
        self.arguments
    }

    pub fn return_value(&self) -> &Value {
        &*self.return_value
    }

    /// Moves the current return value out, leaving [`Value::none`].
    pub fn take_return_value(&mut self) -> Value {
        std::mem::take(&mut *self.return_value)
    }
}

/// View handed to [`MethodInterceptor::on_exception`].
pub struct ExceptionInvocation<'a> {
    view: CallView<'a>,
    arguments: &'a Arguments,
}

impl<'a> ExceptionInvocation<'a> {
    pub(crate) fn new(view: CallView<'a>, arguments: &'a Arguments) -> Self {
        Self { view, arguments }
    }

    call_view_accessors!();

    pub fn arguments(&self) -> &Arguments {
        self.arguments
    }
}
