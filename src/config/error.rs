//! Configuration errors

use crate::retry_policy::RetryPolicyError;

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for '{field}' ({value}): {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    #[error("Invalid retry policy '{field}': {source}")]
    InvalidRetryPolicy {
        field: String,
        #[source]
        source: RetryPolicyError,
    },
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_required_field(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_retry_policy(field: impl Into<String>, source: RetryPolicyError) -> Self {
        Self::InvalidRetryPolicy {
            field: field.into(),
            source,
        }
    }
}
