//! Kernel of the Mosaic pluggable-module runtime.
//! Provides the process-wide service directory and the method interception
//! pipeline that every other component registers into.

pub mod config;
pub mod interception;
pub mod kernel;
pub mod logging;
pub mod predicate;
pub mod service;

pub use config::{ConfigError, KernelConfig, LoggingConfig};
pub use interception::{
    AfterInvocation, ApplicablePolicy, Arguments, Attributes, BeforeInvocation, Decision,
    ExceptionInvocation, InterceptorError, InterceptorRegistry, InterceptorResult,
    InvocationError, InvocationPipeline, MethodEntry, MethodInterceptor, Value,
};
pub use kernel::{Kernel, KernelError, KernelResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use predicate::{properties, Predicate, PredicateError, Properties, PropertyValue};
pub use service::directory::{service_of, DirectoryError, DirectoryResult, ServiceDirectory};
pub use service::entry::{EntryId, OwnerId, ServiceEntry, ServiceType};
pub use service::subscription::{
    listener_fn, FnListener, ListenerError, ListenerResult, ServiceListener, Subscription,
    SubscriptionGuard, SubscriptionId,
};
pub use service::tracker::{ServiceTracker, TrackerError, TrackerResult};

/// Minimal health-check API for smoke checks.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
