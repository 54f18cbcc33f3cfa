//! Identity of one interceptable call site.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Interceptable method identity.
///
/// Used as the applicable-interceptor cache key, so equality covers every
/// field, including the module revision the method was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodEntry {
    id: u64,
    module_id: u64,
    revision_id: u64,
    declaring_type: Arc<str>,
    name: Arc<str>,
    parameter_types: Arc<[String]>,
}

impl MethodEntry {
    pub fn new(
        id: u64,
        module_id: u64,
        revision_id: u64,
        declaring_type: impl AsRef<str>,
        name: impl AsRef<str>,
    ) -> Self {
        Self {
            id,
            module_id,
            revision_id,
            declaring_type: Arc::from(declaring_type.as_ref()),
            name: Arc::from(name.as_ref()),
            parameter_types: Arc::from(Vec::new()),
        }
    }

    /// Sets the parameter type names, builder style.
    pub fn with_parameters<I, S>(mut self, parameter_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = parameter_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module_id(&self) -> u64 {
        self.module_id
    }

    pub fn revision_id(&self) -> u64 {
        self.revision_id
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }
}

impl Display for MethodEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}::{}({})@{}.{}#{}",
            self.declaring_type,
            self.name,
            self.parameter_types.join(", "),
            self.module_id,
            self.revision_id,
            self.id
        )
    }
}
