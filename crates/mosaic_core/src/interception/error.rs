//! Interception error types.

use crate::service::directory::DirectoryError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Interceptor registry usage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptorError {
    /// The registry was shut down or never attached.
    NotRunning,
    Directory(DirectoryError),
}

impl Display for InterceptorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "interceptor registry is not running"),
            Self::Directory(err) => write!(f, "{err}"),
        }
    }
}

impl Error for InterceptorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Directory(err) => Some(err),
            Self::NotRunning => None,
        }
    }
}

impl From<DirectoryError> for InterceptorError {
    fn from(value: DirectoryError) -> Self {
        Self::Directory(value)
    }
}

/// Error carried through the exception phase of an invocation.
#[derive(Debug)]
pub enum InvocationError {
    /// Error raised by the guarded body or a hook; rendered unchanged.
    Source(Box<dyn Error + Send + Sync>),
    /// A hook or the guarded body panicked.
    Panicked { message: String },
    /// A before-hook returned a decision that the current call did not issue.
    InvalidDecision { method: String },
    /// A leave hook ran with no matching invocation on this thread.
    NoActiveInvocation,
    /// The final value did not have the type the caller asked for.
    UnexpectedResultType { expected: &'static str },
    /// Interceptors could not be resolved for the call.
    Interceptor(InterceptorError),
}

impl InvocationError {
    /// Wraps an arbitrary error; `&str` and `String` are accepted too.
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Source(error.into())
    }

    /// Returns the wrapped error when it has type `E`.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Source(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Unwraps the original error, handing other kinds back.
    pub fn into_source(self) -> Result<Box<dyn Error + Send + Sync>, Self> {
        match self {
            Self::Source(inner) => Ok(inner),
            other => Err(other),
        }
    }
}

impl Display for InvocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(inner) => write!(f, "{inner}"),
            Self::Panicked { message } => write!(f, "invocation panicked: {message}"),
            Self::InvalidDecision { method } => write!(
                f,
                "before-hook for {method} returned a decision not issued by this invocation"
            ),
            Self::NoActiveInvocation => write!(f, "no active invocation on this thread"),
            Self::UnexpectedResultType { expected } => {
                write!(f, "invocation result is not of type `{expected}`")
            }
            Self::Interceptor(err) => write!(f, "{err}"),
        }
    }
}

impl Error for InvocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            // Transparent: the wrapped error keeps its own cause chain.
            Self::Source(inner) => inner.source(),
            Self::Interceptor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InterceptorError> for InvocationError {
    fn from(value: InterceptorError) -> Self {
        Self::Interceptor(value)
    }
}
