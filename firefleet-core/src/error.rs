/// Errors produced by the `firefleet-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A storage size string could not be parsed (e.g. `"2X"`, `"0G"`).
    #[error("invalid storage size '{value}': {reason}")]
    InvalidStorageSize { value: String, reason: String },

    /// A request or template field failed validation.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A persisted state string does not name a known lifecycle state.
    #[error("unknown VM state '{0}'")]
    UnknownState(String),
}

impl CoreError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }
}
