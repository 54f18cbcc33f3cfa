//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `mosaic_core` linkage.
//! - Drive one directory and interception round trip with deterministic output.

use mosaic_core::{
    properties, Arguments, Attributes, BeforeInvocation, Decision, InvocationError, Kernel,
    KernelConfig, MethodEntry, MethodInterceptor, OwnerId, Predicate,
};
use std::process::ExitCode;
use std::sync::Arc;

trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

struct English;

impl Greeter for English {
    fn greet(&self, name: &str) -> String {
        format!("hello {name}")
    }
}

/// Upper-cases the first argument of every `greet` call.
struct Shout;

impl MethodInterceptor for Shout {
    fn interested_in(&self, method: &MethodEntry, _context: &mut Attributes) -> bool {
        method.name() == "greet"
    }

    fn before(&self, invocation: &mut BeforeInvocation<'_>) -> Result<Decision, InvocationError> {
        if let Some(name) = invocation.arguments_mut().get_mut::<String>(0) {
            *name = name.to_uppercase();
        }
        Ok(invocation.proceed())
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Kernel::start(KernelConfig::default())?;
    let owner = OwnerId::new("mosaic_cli");

    let greeter: Arc<dyn Greeter> = Arc::new(English);
    kernel
        .directory()
        .register(&owner, greeter, properties([("lang", "en")]))?;
    kernel.register_interceptor(&owner, Arc::new(Shout), Default::default())?;

    let tracker = kernel.track::<dyn Greeter>(Some(Predicate::parse("(lang=en)")?))?;
    let greeter = tracker.require()?;
    let method = MethodEntry::new(1, 1, 1, "Greeter", "greet").with_parameters(["&str"]);
    let greeting: String = kernel.pipeline().call(
        &method,
        None,
        Arguments::new().with("mosaic".to_string()),
        |arguments| {
            let name = arguments.get::<String>(0).cloned().unwrap_or_default();
            Ok(greeter.greet(&name))
        },
    )?;

    println!("mosaic_core tracked={}", tracker.len()?);
    println!("mosaic_core greeting={greeting}");
    kernel.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    println!("mosaic_core ping={}", mosaic_core::ping());
    println!("mosaic_core version={}", mosaic_core::core_version());
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mosaic_core error={err}");
            ExitCode::FAILURE
        }
    }
}
