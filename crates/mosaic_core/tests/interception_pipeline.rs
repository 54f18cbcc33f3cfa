use mosaic_core::{
    AfterInvocation, Arguments, Attributes, BeforeInvocation, Decision, ExceptionInvocation,
    InvocationError, Kernel, KernelConfig, MethodEntry, MethodInterceptor, OwnerId, Value,
};
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Journal = Arc<Mutex<Vec<String>>>;

/// Records every hook; a guarding recorder aborts when argument 0 is `false`.
struct Recorder {
    name: &'static str,
    journal: Journal,
    abort_unauthenticated: bool,
    abort_value: &'static str,
}

impl Recorder {
    fn proceeding(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: journal.clone(),
            abort_unauthenticated: false,
            abort_value: "",
        })
    }

    fn guarding(name: &'static str, journal: &Journal, abort_value: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: journal.clone(),
            abort_unauthenticated: true,
            abort_value,
        })
    }

    fn note(&self, hook: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}.{hook}", self.name));
    }
}

impl MethodInterceptor for Recorder {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.declaring_type() == "Orders"
    }

    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        self.note("before");
        let authenticated = invocation.arguments().get::<bool>(0).copied().unwrap_or(true);
        if self.abort_unauthenticated && !authenticated {
            return Ok(invocation.abort(Value::of(self.abort_value.to_string())));
        }
        Ok(invocation.proceed())
    }

    fn after(&self, invocation: &mut AfterInvocation<'_>) -> Result<Value, InvocationError> {
        self.note("after");
        Ok(invocation.take_return_value())
    }

    fn on_exception(
        &self,
        _invocation: &mut ExceptionInvocation<'_>,
        error: InvocationError,
    ) -> Result<Value, InvocationError> {
        self.note("exception");
        Err(error)
    }
}

fn kernel() -> Kernel {
    Kernel::start(KernelConfig::default()).unwrap()
}

fn place_order() -> MethodEntry {
    MethodEntry::new(10, 1, 1, "Orders", "place").with_parameters(["bool"])
}

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[test]
fn proceeding_interceptors_unwind_in_reverse() {
    let kernel = kernel();
    let owner = OwnerId::new("policies");
    let log = journal();
    for name in ["p1", "p2", "p3"] {
        kernel
            .register_interceptor(&owner, Recorder::proceeding(name, &log), Default::default())
            .unwrap();
    }

    let body_log = log.clone();
    let result: String = kernel
        .pipeline()
        .call(&place_order(), None, Arguments::new().with(true), |_| {
            body_log.lock().unwrap().push("body".to_string());
            Ok("placed".to_string())
        })
        .unwrap();

    assert_eq!(result, "placed");
    assert_eq!(
        entries(&log),
        vec![
            "p1.before", "p2.before", "p3.before", "body", "p3.after", "p2.after", "p1.after"
        ]
    );
}

#[test]
fn abort_skips_body_and_unwinds_completed_interceptors() {
    let kernel = kernel();
    let owner = OwnerId::new("policies");
    let log = journal();
    kernel
        .register_interceptor(&owner, Recorder::proceeding("logging", &log), Default::default())
        .unwrap();
    kernel
        .register_interceptor(
            &owner,
            Recorder::guarding("auth", &log, "denied"),
            Default::default(),
        )
        .unwrap();
    kernel
        .register_interceptor(&owner, Recorder::proceeding("audit", &log), Default::default())
        .unwrap();

    let ran = AtomicUsize::new(0);
    let result: String = kernel
        .pipeline()
        .call(&place_order(), None, Arguments::new().with(false), |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok("placed".to_string())
        })
        .unwrap();

    assert_eq!(result, "denied");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(
        entries(&log),
        vec!["logging.before", "auth.before", "auth.after", "logging.after"]
    );
}

/// Swallows any pending error and returns a default.
struct Fallback {
    default: i64,
}

impl MethodInterceptor for Fallback {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.name() == "total"
    }

    fn on_exception(
        &self,
        _invocation: &mut ExceptionInvocation<'_>,
        _error: InvocationError,
    ) -> Result<Value, InvocationError> {
        Ok(Value::of(self.default))
    }
}

#[test]
fn exception_hook_recovers_with_default() {
    let kernel = kernel();
    kernel
        .register_interceptor(
            &OwnerId::new("fallback"),
            Arc::new(Fallback { default: -1 }),
            Default::default(),
        )
        .unwrap();

    let method = MethodEntry::new(11, 1, 1, "Orders", "total");
    let total: i64 = kernel
        .pipeline()
        .call(&method, None, Arguments::new(), |_| {
            Err(InvocationError::new("ledger offline"))
        })
        .unwrap();
    assert_eq!(total, -1);
}

#[test]
fn unrecovered_errors_reach_the_caller_unchanged() {
    let kernel = kernel();
    let log = journal();
    kernel
        .register_interceptor(
            &OwnerId::new("policies"),
            Recorder::proceeding("p1", &log),
            Default::default(),
        )
        .unwrap();

    let err = kernel
        .pipeline()
        .invoke(&place_order(), None, Arguments::new().with(true), |_| {
            Err(InvocationError::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "missing order",
            )))
        })
        .unwrap_err();

    assert_eq!(err.to_string(), "missing order");
    assert_eq!(
        err.downcast_ref::<std::io::Error>().map(|io| io.kind()),
        Some(std::io::ErrorKind::NotFound)
    );
    assert_eq!(entries(&log), vec!["p1.before", "p1.exception"]);
}

/// Recovers only errors raised by `after` hooks nested inside it.
struct Translate;

impl MethodInterceptor for Translate {
    fn interested_in(&self, _method: &MethodEntry, _context: &mut Attributes) -> bool {
        true
    }

    fn on_exception(
        &self,
        _invocation: &mut ExceptionInvocation<'_>,
        error: InvocationError,
    ) -> Result<Value, InvocationError> {
        Ok(Value::of(format!("recovered: {error}")))
    }
}

/// Fails in `after`, turning a success into a pending error.
struct FailAfter;

impl MethodInterceptor for FailAfter {
    fn interested_in(&self, _method: &MethodEntry, _context: &mut Attributes) -> bool {
        true
    }

    fn after(&self, _invocation: &mut AfterInvocation<'_>) -> Result<Value, InvocationError> {
        Err(InvocationError::new("after failed"))
    }
}

#[test]
fn errors_from_inner_after_hooks_reach_outer_exception_hooks() {
    let kernel = kernel();
    let owner = OwnerId::new("policies");
    kernel
        .register_interceptor(&owner, Arc::new(Translate), Default::default())
        .unwrap();
    kernel
        .register_interceptor(&owner, Arc::new(FailAfter), Default::default())
        .unwrap();

    let result: String = kernel
        .pipeline()
        .call(&place_order(), None, Arguments::new(), |_| Ok("ok".to_string()))
        .unwrap();
    assert_eq!(result, "recovered: after failed");
}

/// Returns a decision minted for a different call.
struct Forger {
    stolen: Mutex<Option<Decision>>,
}

impl MethodInterceptor for Forger {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.name() == "forged"
    }

    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        let mut stolen = self.stolen.lock().unwrap();
        match stolen.take() {
            Some(decision) => Ok(decision),
            None => {
                *stolen = Some(invocation.proceed());
                Ok(invocation.proceed())
            }
        }
    }
}

#[test]
fn decisions_from_other_calls_are_rejected() {
    let kernel = kernel();
    kernel
        .register_interceptor(
            &OwnerId::new("forger"),
            Arc::new(Forger {
                stolen: Mutex::new(None),
            }),
            Default::default(),
        )
        .unwrap();
    let method = MethodEntry::new(12, 1, 1, "Orders", "forged");

    kernel
        .pipeline()
        .call::<(), _>(&method, None, Arguments::new(), |_| Ok(()))
        .unwrap();
    let ran = AtomicUsize::new(0);
    let err = kernel
        .pipeline()
        .call::<(), _>(&method, None, Arguments::new(), |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, InvocationError::InvalidDecision { .. }));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

struct Exploding;

impl MethodInterceptor for Exploding {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.name() == "fragile"
    }

    fn before(&self, _invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        panic!("interceptor bug");
    }
}

#[test]
fn panicking_hook_fails_only_that_call() {
    let kernel = kernel();
    let log = journal();
    let owner = OwnerId::new("policies");
    kernel
        .register_interceptor(&owner, Recorder::proceeding("outer", &log), Default::default())
        .unwrap();
    kernel
        .register_interceptor(&owner, Arc::new(Exploding), Default::default())
        .unwrap();

    let fragile = MethodEntry::new(13, 1, 1, "Orders", "fragile");
    let err = kernel
        .pipeline()
        .call::<(), _>(&fragile, None, Arguments::new(), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, InvocationError::Panicked { ref message } if message == "interceptor bug"));
    assert_eq!(entries(&log), vec!["outer.before", "outer.exception"]);
    assert_eq!(kernel.pipeline().current_depth(), 0);

    let fine: String = kernel
        .pipeline()
        .call(&place_order(), None, Arguments::new(), |_| Ok("ok".to_string()))
        .unwrap();
    assert_eq!(fine, "ok");
}

#[test]
fn registry_changes_invalidate_the_applicable_cache() {
    let kernel = kernel();
    let owner = OwnerId::new("policies");
    let log = journal();
    let method = place_order();
    kernel
        .pipeline()
        .call::<(), _>(&method, None, Arguments::new(), |_| Ok(()))
        .unwrap();
    assert_eq!(kernel.interceptors().applicable(&method).unwrap().len(), 0);

    let entry = kernel
        .register_interceptor(&owner, Recorder::proceeding("late", &log), Default::default())
        .unwrap();
    kernel
        .pipeline()
        .call::<(), _>(&method, None, Arguments::new(), |_| Ok(()))
        .unwrap();
    assert_eq!(entries(&log), vec!["late.before", "late.after"]);

    kernel.directory().withdraw(&entry).unwrap();
    kernel
        .pipeline()
        .call::<(), _>(&method, None, Arguments::new(), |_| Ok(()))
        .unwrap();
    assert_eq!(entries(&log).len(), 2);
    assert_eq!(kernel.interceptors().policy_count().unwrap(), 0);
}

/// Counts nested depth and records scratch isolation.
struct DepthRecorder {
    pipeline_depths: Mutex<Vec<usize>>,
}

thread_local! {
    static PIPELINE: RefCell<Option<mosaic_core::InvocationPipeline>> = const { RefCell::new(None) };
}

impl MethodInterceptor for DepthRecorder {
    fn interested_in(&self, method: &MethodEntry, context: &mut Attributes) -> bool {
        context.insert("declared_by", method.declaring_type().to_string());
        method.declaring_type() == "Nested"
    }

    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        assert!(!invocation.scratch().contains_key("entered"));
        invocation.scratch_mut().insert("entered", true);
        let depth = PIPELINE.with(|pipeline| {
            pipeline
                .borrow()
                .as_ref()
                .map(|pipeline| pipeline.current_depth())
                .unwrap_or_default()
        });
        self.pipeline_depths.lock().unwrap().push(depth);
        Ok(invocation.proceed())
    }

    fn after(&self, invocation: &mut AfterInvocation<'_>) -> Result<Value, InvocationError> {
        assert_eq!(invocation.scratch().get::<bool>("entered"), Some(&true));
        assert_eq!(
            invocation
                .interceptor_context()
                .get::<String>("declared_by")
                .map(String::as_str),
            Some("Nested")
        );
        Ok(invocation.take_return_value())
    }
}

#[test]
fn nested_calls_keep_their_own_context() {
    let kernel = kernel();
    let recorder = Arc::new(DepthRecorder {
        pipeline_depths: Mutex::new(Vec::new()),
    });
    kernel
        .register_interceptor(&OwnerId::new("depth"), recorder.clone(), Default::default())
        .unwrap();
    PIPELINE.with(|pipeline| *pipeline.borrow_mut() = Some(kernel.pipeline().clone()));

    let outer = MethodEntry::new(20, 1, 1, "Nested", "outer");
    let inner = MethodEntry::new(21, 1, 1, "Nested", "inner");
    let pipeline = kernel.pipeline().clone();
    let result: u32 = kernel
        .pipeline()
        .call(&outer, None, Arguments::new().with(2_u32), |arguments| {
            let base = arguments.get::<u32>(0).copied().unwrap_or_default();
            let nested: u32 = pipeline.call(&inner, None, Arguments::new(), |_| {
                assert_eq!(pipeline.current_depth(), 2);
                Ok(40_u32)
            })?;
            Ok(base + nested)
        })
        .unwrap();

    assert_eq!(result, 42);
    assert_eq!(*recorder.pipeline_depths.lock().unwrap(), vec![1, 2]);
    assert_eq!(kernel.pipeline().current_depth(), 0);
    PIPELINE.with(|pipeline| pipeline.borrow_mut().take());
}

/// Applies the receiver's discount percent to the price argument.
struct Discount;

impl MethodInterceptor for Discount {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.name() == "price"
    }

    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        let percent = invocation
            .receiver_as::<u32>()
            .copied()
            .unwrap_or_default();
        if let Some(price) = invocation.arguments_mut().get_mut::<u32>(0) {
            *price -= *price * percent / 100;
        }
        Ok(invocation.proceed())
    }
}

#[test]
fn receiver_and_arguments_are_visible_to_before_hooks() {
    let kernel = kernel();
    kernel
        .register_interceptor(&OwnerId::new("discount"), Arc::new(Discount), Default::default())
        .unwrap();
    let method = MethodEntry::new(30, 1, 1, "Catalog", "price");
    let receiver: Arc<dyn std::any::Any + Send + Sync> = Arc::new(10_u32);

    let price: u32 = kernel
        .pipeline()
        .call(&method, Some(receiver), Arguments::new().with(200_u32), |arguments| {
            Ok(arguments.get::<u32>(0).copied().unwrap_or_default())
        })
        .unwrap();
    assert_eq!(price, 180);
}

#[test]
fn manual_hooks_follow_enter_leave_cleanup() {
    let kernel = kernel();
    let log = journal();
    kernel
        .register_interceptor(
            &OwnerId::new("auth"),
            Recorder::guarding("auth", &log, "denied"),
            Default::default(),
        )
        .unwrap();
    let pipeline = kernel.pipeline();
    let method = place_order();

    assert!(pipeline
        .enter(method.clone(), None, Arguments::new().with(true))
        .unwrap());
    assert_eq!(pipeline.current_depth(), 1);
    let value = pipeline.leave_normally(Value::of(7_u32)).unwrap();
    assert_eq!(value.downcast_ref::<u32>(), Some(&7));
    assert!(matches!(
        pipeline.leave_normally(Value::none()),
        Err(InvocationError::NoActiveInvocation)
    ));
    pipeline.cleanup(&method);

    assert!(!pipeline
        .enter(method.clone(), None, Arguments::new().with(false))
        .unwrap());
    let value = pipeline.leave_aborted().unwrap();
    pipeline.cleanup(&method);
    assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("denied"));
    assert_eq!(pipeline.current_depth(), 0);
    assert_eq!(
        entries(&log),
        vec!["auth.before", "auth.after", "auth.before", "auth.after"]
    );
}

#[test]
fn result_type_mismatch_is_reported() {
    let kernel = kernel();
    let log = journal();
    kernel
        .register_interceptor(
            &OwnerId::new("auth"),
            Recorder::guarding("auth", &log, "denied"),
            Default::default(),
        )
        .unwrap();

    let err = kernel
        .pipeline()
        .call::<u64, _>(&place_order(), None, Arguments::new().with(false), |_| Ok(1))
        .unwrap_err();
    assert!(matches!(err, InvocationError::UnexpectedResultType { .. }));
}
