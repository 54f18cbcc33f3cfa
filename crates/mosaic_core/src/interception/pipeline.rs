//! Per-call interception engine.
//!
//! # Responsibility
//! - Run before-hooks, the guarded body, then after- or exception-hooks.
//! - Keep one invocation stack per thread so nested calls stay isolated.
//!
//! # Invariants
//! - Before-hooks run in registration order; after/exception hooks run in
//!   exact reverse over the interceptors whose before-hook returned a valid
//!   decision.
//! - The body runs only when every before-hook returned Proceed.
//! - Every `enter` is balanced by one `cleanup`; a mismatched cleanup is
//!   logged and never pops another call's context.
//! - No stack or context borrow is held while the body runs.

use crate::interception::error::{InterceptorError, InvocationError};
use crate::interception::method::MethodEntry;
use crate::interception::policy::{
    AfterInvocation, BeforeInvocation, CallView, DecisionKind, ExceptionInvocation,
};
use crate::interception::registry::{ApplicablePolicy, InterceptorRegistry};
use crate::interception::values::{Arguments, Attributes, Value};
use crate::logging::describe_panic;
use log::{error, trace, warn};
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INVOCATION_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    BeforePhase,
    Proceeding,
    Aborted,
    AfterPhase,
    Done,
}

struct InvocationContext {
    call_id: u64,
    method: MethodEntry,
    receiver: Option<Arc<dyn Any + Send + Sync>>,
    arguments: Arguments,
    policies: Arc<[ApplicablePolicy]>,
    scratch: Vec<Attributes>,
    // Indices into `policies`, in the order their before-hooks completed.
    completed: Vec<usize>,
    return_value: Value,
    pending_error: Option<InvocationError>,
    phase: Phase,
}

struct Frame {
    pipeline_id: u64,
    method: MethodEntry,
    context: Rc<RefCell<InvocationContext>>,
}

/// Drives interceptable calls through the interceptors of one registry.
///
/// Cheap to clone; clones share the registry and the per-thread stacks.
#[derive(Clone)]
pub struct InvocationPipeline {
    id: u64,
    registry: Arc<InterceptorRegistry>,
}

impl InvocationPipeline {
    pub fn new(registry: Arc<InterceptorRegistry>) -> Self {
        Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    /// Number of this pipeline's calls active on the current thread.
    pub fn current_depth(&self) -> usize {
        INVOCATION_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .filter(|frame| frame.pipeline_id == self.id)
                .count()
        })
    }

    /// Starts a call and runs its before phase.
    ///
    /// Returns whether the guarded body should run. `cleanup` must follow on
    /// every path, including when this returns an error.
    pub fn enter(
        &self,
        method: MethodEntry,
        receiver: Option<Arc<dyn Any + Send + Sync>>,
        arguments: Arguments,
    ) -> Result<bool, InterceptorError> {
        let context = Rc::new(RefCell::new(InvocationContext {
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            method: method.clone(),
            receiver,
            arguments,
            policies: Arc::from(Vec::new()),
            scratch: Vec::new(),
            completed: Vec::new(),
            return_value: Value::none(),
            pending_error: None,
            phase: Phase::NotStarted,
        }));
        INVOCATION_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                pipeline_id: self.id,
                method: method.clone(),
                context: context.clone(),
            })
        });

        let policies = self.registry.applicable(&method)?;
        let mut guard = context.borrow_mut();
        guard.scratch = policies.iter().map(|_| Attributes::new()).collect();
        guard.policies = policies;
        trace!(
            "event=invocation_entered module=pipeline method={} call={} interceptors={}",
            guard.method,
            guard.call_id,
            guard.policies.len()
        );
        Ok(run_before(&mut guard))
    }

    /// Finishes a call whose body returned `value`.
    pub fn leave_normally(&self, value: Value) -> Result<Value, InvocationError> {
        self.leave(|context| context.return_value = value)
    }

    /// Finishes a call whose body raised `error`.
    pub fn leave_with_error(&self, error: InvocationError) -> Result<Value, InvocationError> {
        self.leave(|context| {
            context.return_value = Value::none();
            context.pending_error = Some(error);
        })
    }

    /// Finishes a call whose before phase did not proceed.
    pub fn leave_aborted(&self) -> Result<Value, InvocationError> {
        self.leave(|_| {})
    }

    /// Pops the call started by the matching `enter`.
    pub fn cleanup(&self, method: &MethodEntry) {
        let popped = INVOCATION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let matches = match stack.last() {
                None => {
                    error!(
                        "event=invocation_stack_empty module=pipeline method={}",
                        method
                    );
                    false
                }
                Some(top) if top.pipeline_id != self.id || top.method != *method => {
                    error!(
                        "event=invocation_stack_dirty module=pipeline on_stack={} received={}",
                        top.method, method
                    );
                    false
                }
                Some(_) => true,
            };
            if matches {
                stack.pop()
            } else {
                None
            }
        });
        // Why: argument values may run arbitrary drops, which can re-enter the
        // pipeline, so the popped frame is dropped outside the stack borrow.
        drop(popped);
    }

    /// Runs `body` as an interceptable call.
    ///
    /// Panics in hooks or `body` are converted to [`InvocationError::Panicked`]
    /// and routed through the exception phase.
    pub fn invoke<F>(
        &self,
        method: &MethodEntry,
        receiver: Option<Arc<dyn Any + Send + Sync>>,
        arguments: Arguments,
        body: F,
    ) -> Result<Value, InvocationError>
    where
        F: FnOnce(&mut Arguments) -> Result<Value, InvocationError>,
    {
        let _cleanup = CleanupGuard {
            pipeline: self,
            method,
        };
        if !self.enter(method.clone(), receiver, arguments)? {
            return self.leave_aborted();
        }

        let mut arguments = self.with_current(|context| {
            context.phase = Phase::Proceeding;
            std::mem::take(&mut context.arguments)
        })?;
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut arguments)));
        self.with_current(|context| context.arguments = arguments)?;

        match outcome {
            Ok(Ok(value)) => self.leave_normally(value),
            Ok(Err(err)) => self.leave_with_error(err),
            Err(payload) => self.leave_with_error(InvocationError::Panicked {
                message: describe_panic(payload.as_ref()),
            }),
        }
    }

    /// Typed variant of [`InvocationPipeline::invoke`].
    pub fn call<R, F>(
        &self,
        method: &MethodEntry,
        receiver: Option<Arc<dyn Any + Send + Sync>>,
        arguments: Arguments,
        body: F,
    ) -> Result<R, InvocationError>
    where
        R: Any + Send,
        F: FnOnce(&mut Arguments) -> Result<R, InvocationError>,
    {
        let value = self.invoke(method, receiver, arguments, |arguments| {
            body(arguments).map(Value::of)
        })?;
        if value.is_none() {
            // An absent value is the unit result.
            let unit: Box<dyn Any> = Box::new(());
            if let Ok(unit) = unit.downcast::<R>() {
                return Ok(*unit);
            }
        }
        value
            .into_inner::<R>()
            .map_err(|_| InvocationError::UnexpectedResultType {
                expected: type_name::<R>(),
            })
    }

    fn with_current<T>(
        &self,
        action: impl FnOnce(&mut InvocationContext) -> T,
    ) -> Result<T, InvocationError> {
        let context = INVOCATION_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .filter(|frame| frame.pipeline_id == self.id)
                .map(|frame| frame.context.clone())
        });
        let context = context.ok_or(InvocationError::NoActiveInvocation)?;
        let mut guard = context
            .try_borrow_mut()
            .map_err(|_| InvocationError::NoActiveInvocation)?;
        Ok(action(&mut guard))
    }

    fn leave(
        &self,
        prepare: impl FnOnce(&mut InvocationContext),
    ) -> Result<Value, InvocationError> {
        self.with_current(|context| {
            if matches!(
                context.phase,
                Phase::NotStarted | Phase::AfterPhase | Phase::Done
            ) {
                return Err(InvocationError::NoActiveInvocation);
            }
            prepare(context);
            run_after(context)
        })?
    }
}

struct CleanupGuard<'a> {
    pipeline: &'a InvocationPipeline,
    method: &'a MethodEntry,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.cleanup(self.method);
    }
}

fn run_before(context: &mut InvocationContext) -> bool {
    context.phase = Phase::BeforePhase;
    let policies = context.policies.clone();
    for (index, policy) in policies.iter().enumerate() {
        let InvocationContext {
            call_id,
            method,
            receiver,
            arguments,
            scratch,
            ..
        } = &mut *context;
        let mut invocation = BeforeInvocation::new(
            CallView {
                call_id: *call_id,
                method,
                receiver: receiver.as_ref(),
                interceptor_context: policy.context(),
                scratch: &mut scratch[index],
            },
            arguments,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            policy.interceptor().before(&mut invocation)
        }));

        match outcome {
            Ok(Ok(decision)) => {
                let (issued_for, kind) = decision.into_parts();
                if issued_for != context.call_id {
                    warn!(
                        "event=interceptor_failed module=pipeline phase=before method={} entry={} error=foreign_decision",
                        context.method,
                        policy.entry_id()
                    );
                    context.pending_error = Some(InvocationError::InvalidDecision {
                        method: context.method.to_string(),
                    });
                    context.phase = Phase::Aborted;
                    return false;
                }
                context.completed.push(index);
                if let DecisionKind::Abort(value) = kind {
                    trace!(
                        "event=invocation_aborted module=pipeline method={} entry={}",
                        context.method,
                        policy.entry_id()
                    );
                    context.return_value = value;
                    context.phase = Phase::Aborted;
                    return false;
                }
            }
            Ok(Err(err)) => {
                warn!(
                    "event=interceptor_failed module=pipeline phase=before method={} entry={} error={}",
                    context.method,
                    policy.entry_id(),
                    err
                );
                context.pending_error = Some(err);
                context.phase = Phase::Aborted;
                return false;
            }
            Err(payload) => {
                let message = describe_panic(payload.as_ref());
                warn!(
                    "event=interceptor_panicked module=pipeline phase=before method={} entry={} payload={}",
                    context.method,
                    policy.entry_id(),
                    message
                );
                context.pending_error = Some(InvocationError::Panicked { message });
                context.phase = Phase::Aborted;
                return false;
            }
        }
    }
    context.phase = Phase::Proceeding;
    true
}

fn run_after(context: &mut InvocationContext) -> Result<Value, InvocationError> {
    context.phase = Phase::AfterPhase;
    let policies = context.policies.clone();
    let completed = std::mem::take(&mut context.completed);
    for &index in completed.iter().rev() {
        let policy = &policies[index];
        let pending = context.pending_error.take();
        let InvocationContext {
            call_id,
            method,
            receiver,
            arguments,
            scratch,
            return_value,
            ..
        } = &mut *context;
        let view = CallView {
            call_id: *call_id,
            method,
            receiver: receiver.as_ref(),
            interceptor_context: policy.context(),
            scratch: &mut scratch[index],
        };

        let (phase, outcome) = match pending {
            Some(err) => {
                let mut invocation = ExceptionInvocation::new(view, arguments);
                (
                    "exception",
                    catch_unwind(AssertUnwindSafe(|| {
                        policy.interceptor().on_exception(&mut invocation, err)
                    })),
                )
            }
            None => {
                let mut invocation = AfterInvocation::new(view, arguments, return_value);
                (
                    "after",
                    catch_unwind(AssertUnwindSafe(|| {
                        policy.interceptor().after(&mut invocation)
                    })),
                )
            }
        };

        match outcome {
            Ok(Ok(value)) => context.return_value = value,
            Ok(Err(err)) => {
                trace!(
                    "event=interceptor_raised module=pipeline phase={} method={} entry={} error={}",
                    phase,
                    context.method,
                    policy.entry_id(),
                    err
                );
                context.return_value = Value::none();
                context.pending_error = Some(err);
            }
            Err(payload) => {
                let message = describe_panic(payload.as_ref());
                warn!(
                    "event=interceptor_panicked module=pipeline phase={} method={} entry={} payload={}",
                    phase,
                    context.method,
                    policy.entry_id(),
                    message
                );
                context.return_value = Value::none();
                context.pending_error = Some(InvocationError::Panicked { message });
            }
        }
    }
    context.completed = completed;
    context.phase = Phase::Done;

    match context.pending_error.take() {
        Some(err) => Err(err),
        None => Ok(std::mem::take(&mut context.return_value)),
    }
}

#[cfg(test)]
mod tests {
    use super::InvocationPipeline;
    use crate::interception::error::InvocationError;
    use crate::interception::method::MethodEntry;
    use crate::interception::registry::InterceptorRegistry;
    use crate::interception::values::{Arguments, Value};
    use crate::service::directory::ServiceDirectory;
    use std::sync::Arc;

    fn pipeline() -> (ServiceDirectory, InvocationPipeline) {
        let directory = ServiceDirectory::new();
        let registry = Arc::new(InterceptorRegistry::attach(&directory).expect("attach"));
        (directory, InvocationPipeline::new(registry))
    }

    #[test]
    fn plain_call_runs_body_without_interceptors() {
        let (_directory, pipeline) = pipeline();
        let method = MethodEntry::new(1, 1, 1, "Math", "double");
        let result: i32 = pipeline
            .call(&method, None, Arguments::new().with(21_i32), |args| {
                Ok(args.get::<i32>(0).copied().unwrap_or_default() * 2)
            })
            .expect("call");
        assert_eq!(result, 42);
        assert_eq!(pipeline.current_depth(), 0);
    }

    #[test]
    fn unit_calls_accept_absent_values() {
        let (_directory, pipeline) = pipeline();
        let method = MethodEntry::new(2, 1, 1, "Math", "noop");
        pipeline
            .call::<(), _>(&method, None, Arguments::new(), |_| Ok(()))
            .expect("unit call");
        let value = pipeline
            .invoke(&method, None, Arguments::new(), |_| Ok(Value::none()))
            .expect("invoke");
        assert!(value.is_none());
    }

    #[test]
    fn body_panics_become_errors_and_stack_unwinds() {
        let (_directory, pipeline) = pipeline();
        let method = MethodEntry::new(3, 1, 1, "Math", "explode");
        let err = pipeline
            .invoke(&method, None, Arguments::new(), |_| panic!("body exploded"))
            .expect_err("panic surfaces as error");
        assert!(matches!(err, InvocationError::Panicked { .. }));
        assert_eq!(pipeline.current_depth(), 0);
    }

    #[test]
    fn hooks_without_active_call_fail_and_cleanup_is_lenient() {
        let (_directory, pipeline) = pipeline();
        let method = MethodEntry::new(4, 1, 1, "Math", "stray");
        assert!(matches!(
            pipeline.leave_normally(Value::none()),
            Err(InvocationError::NoActiveInvocation)
        ));
        pipeline.cleanup(&method);

        assert!(pipeline
            .enter(method.clone(), None, Arguments::new())
            .expect("enter"));
        pipeline.cleanup(&MethodEntry::new(5, 1, 1, "Math", "other"));
        assert_eq!(pipeline.current_depth(), 1);
        pipeline.leave_normally(Value::none()).expect("leave");
        assert!(matches!(
            pipeline.leave_normally(Value::none()),
            Err(InvocationError::NoActiveInvocation)
        ));
        pipeline.cleanup(&method);
        assert_eq!(pipeline.current_depth(), 0);
    }
}
