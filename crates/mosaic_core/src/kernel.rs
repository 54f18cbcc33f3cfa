//! Kernel facade wiring directory, interceptors and pipeline together.
//!
//! # Responsibility
//! - Bring the runtime up from a validated [`KernelConfig`].
//! - Tear it down in dependency order.

use crate::config::{ConfigError, KernelConfig};
use crate::interception::{InterceptorError, InterceptorRegistry, InvocationPipeline, MethodInterceptor};
use crate::logging::{init_logging, LoggingError};
use crate::predicate::{Predicate, Properties};
use crate::service::directory::{DirectoryError, ServiceDirectory};
use crate::service::entry::{OwnerId, ServiceEntry};
use crate::service::tracker::{ServiceTracker, TrackerError};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Config(ConfigError),
    Logging(LoggingError),
    Directory(DirectoryError),
    Interceptor(InterceptorError),
    Tracker(TrackerError),
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(err) => write!(f, "{err}"),
            Self::Directory(err) => write!(f, "{err}"),
            Self::Interceptor(err) => write!(f, "{err}"),
            Self::Tracker(err) => write!(f, "{err}"),
        }
    }
}

impl Error for KernelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Logging(err) => Some(err),
            Self::Directory(err) => Some(err),
            Self::Interceptor(err) => Some(err),
            Self::Tracker(err) => Some(err),
        }
    }
}

impl From<ConfigError> for KernelError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LoggingError> for KernelError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

impl From<DirectoryError> for KernelError {
    fn from(value: DirectoryError) -> Self {
        Self::Directory(value)
    }
}

impl From<InterceptorError> for KernelError {
    fn from(value: InterceptorError) -> Self {
        Self::Interceptor(value)
    }
}

impl From<TrackerError> for KernelError {
    fn from(value: TrackerError) -> Self {
        Self::Tracker(value)
    }
}

/// One running service directory with its interception stack.
pub struct Kernel {
    name: String,
    directory: ServiceDirectory,
    interceptors: Arc<InterceptorRegistry>,
    pipeline: InvocationPipeline,
    running: AtomicBool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Validates `config`, initializes logging if configured, and starts.
    pub fn start(config: KernelConfig) -> KernelResult<Self> {
        let config = config.validate()?;
        if let Some(logging) = &config.logging {
            init_logging(logging)?;
        }

        let directory = ServiceDirectory::new();
        let interceptors = Arc::new(InterceptorRegistry::attach(&directory)?);
        let pipeline = InvocationPipeline::new(interceptors.clone());
        info!(
            "event=kernel_started module=kernel name={} version={}",
            config.name,
            env!("CARGO_PKG_VERSION")
        );

        Ok(Self {
            name: config.name,
            directory,
            interceptors,
            pipeline,
            running: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        &self.interceptors
    }

    pub fn pipeline(&self) -> &InvocationPipeline {
        &self.pipeline
    }

    /// Registers an interceptor as an ordinary directory service.
    pub fn register_interceptor(
        &self,
        owner: &OwnerId,
        interceptor: Arc<dyn MethodInterceptor>,
        properties: Properties,
    ) -> KernelResult<Arc<ServiceEntry>> {
        Ok(self.directory.register(owner, interceptor, properties)?)
    }

    /// Creates and starts a tracker over this kernel's directory.
    pub fn track<T>(&self, predicate: Option<Predicate>) -> KernelResult<ServiceTracker<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let tracker = ServiceTracker::new(&self.directory, predicate);
        tracker.start()?;
        Ok(tracker)
    }

    /// Detaches interceptors, then shuts the directory down. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.interceptors.shutdown();
        self.directory.shutdown();
        info!("event=kernel_stopped module=kernel name={}", self.name);
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
