use folio_core::error::codes;
use thiserror::Error;

/// Engine-level fault, recovered into a wire error code at the tool
/// boundary. `AccessDenied` carries no reason on purpose: callers never
/// learn whether a target was missing or merely forbidden.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("target is not accessible")]
    AccessDenied,

    #[error("session is expired or unknown")]
    SessionExpired,

    #[error("{message}")]
    SessionMismatch { message: String },

    #[error("batch of {requested} targets exceeds the ceiling of {ceiling}")]
    BulkLimitExceeded { requested: usize, ceiling: usize },

    #[error("{0}")]
    Execution(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn session_mismatch(message: impl Into<String>) -> Self {
        Self::SessionMismatch {
            message: message.into(),
        }
    }

    /// Wire error code for this fault.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => codes::VALIDATION_FAILED,
            Self::AccessDenied => codes::ACCESS_DENIED,
            Self::SessionExpired => codes::SESSION_EXPIRED,
            Self::SessionMismatch { .. } => codes::SESSION_MISMATCH,
            Self::BulkLimitExceeded { .. } => codes::BULK_LIMIT_EXCEEDED,
            Self::Execution(_) => codes::EXECUTION_FAILED,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}
