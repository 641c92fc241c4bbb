use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Caller-correctable denial: out of addresses, out of MACs, unknown network.
    #[error("Resource request denied: {message}")]
    ResourceRequestDenied {
        message: String,
    },

    /// Operational failure an administrator has to look at.
    #[error("Manage error: {message}")]
    Manage {
        message: String,
    },

    #[error("Backend {category} failure (exit code {code}): {stderr}")]
    Backend {
        code: i32,
        category: BackendFailure,
        stderr: String,
    },

    #[error("Not authorized to act on instance {vm_id}: {message}")]
    Authorization {
        vm_id: u64,
        message: String,
    },

    #[error("Invalid {field}: {message}")]
    Validation {
        field: String,
        message: String,
    },

    #[error("Creation error: {message}")]
    Creation {
        message: String,
    },

    #[error("Scheduling error: {message}")]
    Scheduling {
        message: String,
    },

    #[error("Metadata error: {message}")]
    Metadata {
        message: String,
    },

    #[error("Co-scheduling error: {message}")]
    CoScheduling {
        message: String,
    },
}

impl ProvisionError {
    pub fn denied(message: impl Into<String>) -> Self {
        ProvisionError::ResourceRequestDenied {
            message: message.into(),
        }
    }

    pub fn manage(message: impl Into<String>) -> Self {
        ProvisionError::Manage {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ProvisionError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Internal storage problems never leak their details to callers.
    pub fn db_problem() -> Self {
        ProvisionError::denied("internal error, db problem")
    }
}

/// Meaning of a non-zero exit code from the backend control program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFailure {
    /// Exit code 1: the program could not even reach the backend.
    PreBackend,
    /// Exit code 2: the backend rejected the parameters.
    Validation,
    /// Exit code 3: the backend failed after validation succeeded.
    Runtime,
    Generic,
}

impl BackendFailure {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            1 => BackendFailure::PreBackend,
            2 => BackendFailure::Validation,
            3 => BackendFailure::Runtime,
            _ => BackendFailure::Generic,
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendFailure::PreBackend => write!(f, "pre-backend"),
            BackendFailure::Validation => write!(f, "validation"),
            BackendFailure::Runtime => write!(f, "runtime"),
            BackendFailure::Generic => write!(f, "generic"),
        }
    }
}

/// Failure reported by the persistence collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
}

// Error context for tracking which operation failed
#[derive(Debug)]
pub struct ErrorContext {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_location: &'static str,
    pub operation: String,
    pub caller: Option<String>,
}

// Result type alias for convenience
pub type ProvisionResult<T> = Result<T, ProvisionError>;

// Helper macro for context addition
#[macro_export]
macro_rules! with_context {
    ($result:expr, $operation:expr) => {
        $crate::with_context!($result, $operation, None::<String>)
    };
    ($result:expr, $operation:expr, $caller:expr) => {
        $result.map_err(|e| {
            let context = $crate::errors::ErrorContext {
                timestamp: chrono::Utc::now(),
                source_location: std::file!(),
                operation: $operation.to_string(),
                caller: $caller.map(|c| c.to_string()),
            };
            tracing::error!(
                error = %e,
                context = ?context,
                "Operation failed"
            );
            e
        })
    };
}
