//! Error types for stratus-deploy.

use crate::transport::{RemoteError, RemoteErrorKind};

/// Result type alias using [`DeployError`].
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced by reconciliation, deployment and log retrieval.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Retryable transport failure. Only retried where a wait is designed in.
    #[error("transient remote error during {operation}: {message}")]
    TransientRemote {
        /// Remote operation that failed.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// The resource already exists.
    #[error("already exists ({operation}): {message}")]
    AlreadyExists {
        /// Remote operation that failed.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// The resource does not exist.
    #[error("not found ({operation}): {message}")]
    NotFound {
        /// Remote operation that failed.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// The provider rejected a parameter.
    #[error("invalid parameter ({operation}): {message}")]
    InvalidParameter {
        /// Remote operation that failed.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// An existing resource cannot be updated in place.
    #[error("shape conflict on {ident}: {message}")]
    ShapeConflict {
        /// Resource identifier.
        ident: String,
        /// What is incompatible.
        message: String,
    },

    /// Desired state is self-contradictory.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A polled condition never became true within the retry budget.
    #[error("gave up waiting for {waiting_for} after {attempts} attempts (last observed: {last_observed})")]
    WaitExhausted {
        /// Condition being waited on.
        waiting_for: String,
        /// Attempts made.
        attempts: u32,
        /// Last observed state.
        last_observed: String,
    },

    /// A record did not appear in its listing within the retry budget.
    #[error("{kind} {ident} not found after {attempts} attempts")]
    NotFoundAfterWait {
        /// Resource kind label.
        kind: &'static str,
        /// Resource identifier.
        ident: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The provider reported a failed function update.
    #[error("function {function} update failed: {reason}")]
    UpdateFailed {
        /// Function name.
        function: String,
        /// Provider supplied reason.
        reason: String,
    },

    /// A shape-conflict replacement deleted the function and recreating it failed.
    #[error("function {function} was deleted for replacement but recreating it failed: {source}")]
    ReplaceFailed {
        /// Function name.
        function: String,
        /// The create failure.
        #[source]
        source: Box<DeployError>,
    },

    /// A remote record did not match the expected schema.
    #[error("malformed {kind} record: {message}")]
    Schema {
        /// Resource kind label.
        kind: &'static str,
        /// Mapping failure.
        message: String,
    },

    /// Any other provider failure.
    #[error("remote error during {operation}: {message}")]
    Remote {
        /// Remote operation that failed.
        operation: &'static str,
        /// Provider message.
        message: String,
    },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

impl DeployError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a schema error for the given resource kind.
    #[must_use]
    pub fn schema(kind: &'static str, msg: impl Into<String>) -> Self {
        Self::Schema {
            kind,
            message: msg.into(),
        }
    }

    /// Whether this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RemoteError> for DeployError {
    fn from(err: RemoteError) -> Self {
        let operation = err.operation;
        let message = err.message;
        match err.kind {
            RemoteErrorKind::NotFound => Self::NotFound { operation, message },
            RemoteErrorKind::AlreadyExists => Self::AlreadyExists { operation, message },
            RemoteErrorKind::InvalidParameter => Self::InvalidParameter { operation, message },
            RemoteErrorKind::Transient => Self::TransientRemote { operation, message },
            RemoteErrorKind::Other => Self::Remote { operation, message },
        }
    }
}

impl From<figment::Error> for DeployError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
