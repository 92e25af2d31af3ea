//! Status vocabulary shared by the Lamina client crates.
//!
//! Statuses are deliberately flat and cheap to clone: a single row error may
//! be fanned out to the per-operation completion, the session error
//! collector, and the flush response list at the same time.

use thiserror::Error;

/// Result type alias for fallible Lamina operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A status describing why an operation, batch, or API call failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The caller passed malformed input (unset key column, type mismatch,
    /// mixed schemas, ...). Never retriable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The call is not legal in the current state (closed session, frozen
    /// row, configuration change with pending operations, ...).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The referenced row or tablet does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A row with the same primary key already exists.
    #[error("already present: {0}")]
    AlreadyPresent(String),

    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The service cannot accept work right now; retriable after waiting.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The connection to a remote server failed.
    #[error("network error: {0}")]
    Network(String),

    /// The remote server rejected the request as a whole.
    #[error("remote error: {0}")]
    Remote(String),

    /// The operation was abandoned before a response was produced.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A wire payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An error with no more specific classification.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// True for duplicate-primary-key failures, which sessions may be
    /// configured to suppress.
    pub fn is_already_present(&self) -> bool {
        matches!(self, Error::AlreadyPresent(_))
    }

    /// True for missing-row / missing-tablet failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True when the failure is a backpressure signal and the caller should
    /// wait and retry.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_))
    }
}

/// Returns an [`Error::InvalidArgument`] from the enclosing function.
#[macro_export]
macro_rules! invalid_argument {
    ($($format_args:tt)*) => {
        return Err($crate::invalid_argument_err!($($format_args)*).into())
    };
}

/// Constructs an [`Error::InvalidArgument`] value.
#[macro_export]
macro_rules! invalid_argument_err {
    ($($format_args:tt)*) => {
        $crate::Error::InvalidArgument(format!($($format_args)*))
    };
}

/// Returns an [`Error::IllegalState`] from the enclosing function.
#[macro_export]
macro_rules! illegal_state {
    ($($format_args:tt)*) => {
        return Err($crate::illegal_state_err!($($format_args)*).into())
    };
}

/// Constructs an [`Error::IllegalState`] value.
#[macro_export]
macro_rules! illegal_state_err {
    ($($format_args:tt)*) => {
        $crate::Error::IllegalState(format!($($format_args)*))
    };
}
