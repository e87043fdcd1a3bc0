use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ReprocessorError {
    DatabaseError(String),
    ClaimError(String),
    AdmissionError(String),
    LaunchError(String),
    ValidationError(String),
    ConfigurationError(String),
    ShutdownError(String),
}

impl fmt::Display for ReprocessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReprocessorError::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            ReprocessorError::ClaimError(msg) => write!(f, "Claim error: {msg}"),
            ReprocessorError::AdmissionError(msg) => write!(f, "Admission error: {msg}"),
            ReprocessorError::LaunchError(msg) => write!(f, "Launch error: {msg}"),
            ReprocessorError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            ReprocessorError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
            ReprocessorError::ShutdownError(msg) => write!(f, "Shutdown error: {msg}"),
        }
    }
}

impl std::error::Error for ReprocessorError {}

impl From<crate::config::ConfigurationError> for ReprocessorError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        ReprocessorError::ConfigurationError(err.to_string())
    }
}

impl From<crate::retry_policy::RetryPolicyError> for ReprocessorError {
    fn from(err: crate::retry_policy::RetryPolicyError) -> Self {
        ReprocessorError::ValidationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReprocessorError>;
