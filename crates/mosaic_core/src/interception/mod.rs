//! Method-level interception.
//!
//! # Responsibility
//! - Let cross-cutting policies attach to interceptable calls through the
//!   service directory.
//! - Run the ordered before/body/after-or-exception chain for each call.
//!
//! Call sites opt in explicitly, either through [`InvocationPipeline::invoke`]
//! or by driving the `enter`/`leave_*`/`cleanup` hooks themselves.

pub mod error;
pub mod method;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod values;

pub use error::{InterceptorError, InvocationError};
pub use method::MethodEntry;
pub use pipeline::InvocationPipeline;
pub use policy::{AfterInvocation, BeforeInvocation, Decision, ExceptionInvocation, MethodInterceptor};
pub use registry::{ApplicablePolicy, InterceptorRegistry, InterceptorResult};
pub use values::{Arguments, Attributes, Value};
