//! Error and status types for indication delivery.

use std::fmt;

use thiserror::Error;

/// CIM operation status reported back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CimStatus {
    /// Operation succeeded.
    Ok,
    /// Generic failure.
    Failed,
    /// Caller is not allowed to perform the operation.
    AccessDenied,
    /// A parameter was malformed or out of range.
    InvalidParameter,
    /// The referenced object does not exist.
    NotFound,
    /// The operation is not supported for this object.
    NotSupported,
    /// The object to be created already exists.
    AlreadyExists,
}

impl CimStatus {
    /// Numeric CMPI return code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
            Self::AccessDenied => 2,
            Self::InvalidParameter => 4,
            Self::NotFound => 6,
            Self::NotSupported => 7,
            Self::AlreadyExists => 11,
        }
    }
}

impl fmt::Display for CimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::NotFound => "NOT_FOUND",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::AlreadyExists => "ALREADY_EXISTS",
        };
        f.write_str(name)
    }
}

/// Indication sender errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndicationError {
    /// Sender used before `init` or after the last `cleanup`.
    #[error("indication sender is not initialized")]
    NotInitialized,

    /// A static filter with the same (class, id) key is already registered.
    #[error("static filter already registered: {class_name}/{filter_id}")]
    AlreadyExists {
        /// Class the filter is registered for.
        class_name: String,
        /// Filter identifier.
        filter_id: String,
    },

    /// No registered or active filter matches the query.
    #[error("no matching filter for {class_name}: {query}")]
    FilterNotFound {
        /// Class passed by the broker.
        class_name: String,
        /// Query text passed by the broker.
        query: String,
    },

    /// Malformed object path or instance data.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Broker rejected the indication.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl IndicationError {
    /// CIM status this error is reported as.
    #[must_use]
    pub fn status(&self) -> CimStatus {
        match self {
            Self::AlreadyExists { .. } => CimStatus::AlreadyExists,
            Self::FilterNotFound { .. } => CimStatus::NotFound,
            Self::InvalidParameter(_) => CimStatus::InvalidParameter,
            Self::NotInitialized | Self::Delivery(_) | Self::Failed(_) => CimStatus::Failed,
        }
    }
}

/// Result type for indication operations.
pub type Result<T> = std::result::Result<T, IndicationError>;
