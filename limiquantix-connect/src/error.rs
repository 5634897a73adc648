//! Error types for hypervisor connections and event subscriptions.

use thiserror::Error;

/// Errors that can occur on a hypervisor connection.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Failed to open a session (malformed URI, no driver, unreachable host).
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The hypervisor could not provide the requested information.
    #[error("Failed to retrieve {call}: {message}")]
    Retrieve {
        /// Name of the query that failed (e.g. "max_vcpus")
        call: &'static str,
        /// Reason reported by the hypervisor
        message: String,
    },

    /// The hypervisor rejected a non-query call such as a subscription.
    #[error("Call to {call} failed: {message}")]
    Remote {
        /// Name of the call that failed
        call: &'static str,
        /// Reason reported by the hypervisor
        message: String,
    },

    /// Caller-supplied argument is semantically invalid.
    #[error("{0}")]
    InvalidArgument(String),

    /// Caller-supplied argument has the wrong kind.
    #[error("wrong argument type ({0})")]
    WrongType(String),

    /// Operation is not valid in the current connection state.
    #[error("Operation invalid: {0}")]
    OperationInvalid(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad category of a [`ConnectError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    Retrieve,
    Remote,
    Argument,
    Type,
    OperationInvalid,
    Internal,
}

impl ConnectError {
    pub(crate) fn retrieve(call: &'static str, message: impl Into<String>) -> Self {
        ConnectError::Retrieve { call, message: message.into() }
    }

    pub(crate) fn remote(call: &'static str, message: impl Into<String>) -> Self {
        ConnectError::Remote { call, message: message.into() }
    }

    pub(crate) fn closed() -> Self {
        ConnectError::OperationInvalid("connection closed".to_string())
    }

    pub(crate) fn poisoned() -> Self {
        ConnectError::Internal("Lock poisoned".to_string())
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::ConnectionFailed(_) => ErrorKind::Connect,
            ConnectError::Retrieve { .. } => ErrorKind::Retrieve,
            ConnectError::Remote { .. } => ErrorKind::Remote,
            ConnectError::InvalidArgument(_) => ErrorKind::Argument,
            ConnectError::WrongType(_) => ErrorKind::Type,
            ConnectError::OperationInvalid(_) => ErrorKind::OperationInvalid,
            ConnectError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for failures detected locally before the hypervisor was contacted.
    ///
    /// These indicate a programming mistake and are never worth retrying.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Argument | ErrorKind::Type | ErrorKind::OperationInvalid
        )
    }
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectError>;
