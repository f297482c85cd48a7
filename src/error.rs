//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Denied requests are not errors: they are reported as
/// [`ConsumeResult::consumed`](crate::ratelimit::ConsumeResult) being `false`.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid configuration (bad profile, bad address, missing settings)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A profile name that is not present in the registry
    #[error("Unknown rate limit profile '{0}'")]
    UnknownProfile(String),

    /// The request carried nothing that identifies the caller
    #[error("Unable to identify caller")]
    Unidentified,

    /// The bucket store could not be reached or answered too slowly
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error belongs to the configuration class (unknown or invalid profile).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TollgateError::Configuration(_) | TollgateError::UnknownProfile(_)
        )
    }
}

impl From<crate::store::StoreError> for TollgateError {
    fn from(err: crate::store::StoreError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_unknown_profile_is_configuration_error() {
        let err = TollgateError::UnknownProfile("search".to_string());
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Unknown rate limit profile 'search'");
    }

    #[test]
    fn test_store_error_conversion() {
        let err: TollgateError = StoreError::Timeout(250).into();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
        assert!(!err.is_configuration());
    }
}
