/*!
 * Error Handling for Key Provisioning
 *
 * Provides the error taxonomy shared by the key stores, the key codec and the
 * provisioning orchestrator, with numeric error codes, user-friendly messages
 * and suggested remediation.
 */

use std::collections::HashMap;
use thiserror::Error;

/// Error type for all key provisioning operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported algorithm: {family} ({bits} bits) - {reason}")]
    UnsupportedAlgorithm {
        family: String,
        bits: u32,
        reason: String,
        error_code: u32,
    },

    #[error("Key not found: {name} ({visibility})")]
    NotFound {
        name: String,
        visibility: String,
        error_code: u32,
    },

    #[error("Key already exists: {name}")]
    AlreadyExists { name: String, error_code: u32 },

    #[error("Key creation failed for '{name}' in {store}: {cause}")]
    CreationFailed {
        name: String,
        store: String,
        cause: String,
        error_code: u32,
    },

    #[error("Private key '{name}' cannot be exported from {store}")]
    NotExportable {
        name: String,
        store: String,
        error_code: u32,
    },

    #[error("Key '{name}' was created concurrently but could not be opened afterwards")]
    CreationRaceUnresolved { name: String, error_code: u32 },

    #[error("Key store error: {operation} - {cause}")]
    StoreError {
        operation: String,
        cause: String,
        error_code: u32,
        context: HashMap<String, String>,
    },

    #[error("Key encoding error: {format} - {cause}")]
    CodecError {
        format: String,
        cause: String,
        error_code: u32,
    },

    #[error("Invalid parameter: {parameter} - {expected} - got {actual}")]
    InvalidParameter {
        parameter: String,
        expected: String,
        actual: String,
        error_code: u32,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Error code constants for different error categories
pub mod error_codes {
    // Algorithm errors: 1000-1999
    pub const UNSUPPORTED_ALGORITHM_FAMILY: u32 = 1001;
    pub const UNSUPPORTED_KEY_SIZE: u32 = 1002;

    // Lookup errors: 2000-2999
    pub const KEY_NOT_FOUND: u32 = 2001;
    pub const KEY_ALREADY_EXISTS: u32 = 2002;

    // Creation errors: 3000-3999
    pub const KEY_CREATION_FAILED: u32 = 3001;
    pub const KEY_CREATION_RACE_UNRESOLVED: u32 = 3002;

    // Export errors: 4000-4999
    pub const KEY_NOT_EXPORTABLE: u32 = 4001;
    pub const KEY_ENCODING_FAILED: u32 = 4002;
    pub const KEY_DECODING_FAILED: u32 = 4003;

    // Store errors: 5000-5999
    pub const STORE_OPEN_FAILED: u32 = 5001;
    pub const STORE_QUERY_FAILED: u32 = 5002;
    pub const STORE_DELETE_FAILED: u32 = 5003;
    pub const STORE_LOCK_POISONED: u32 = 5004;

    // Parameter and configuration errors: 9000-9999
    pub const CONFIGURATION_INVALID: u32 = 9001;
    pub const IO_FAILED: u32 = 9002;
    pub const INVALID_PARAMETER: u32 = 9999;
}

impl CryptoError {
    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            CryptoError::UnsupportedAlgorithm { error_code, .. } => *error_code,
            CryptoError::NotFound { error_code, .. } => *error_code,
            CryptoError::AlreadyExists { error_code, .. } => *error_code,
            CryptoError::CreationFailed { error_code, .. } => *error_code,
            CryptoError::NotExportable { error_code, .. } => *error_code,
            CryptoError::CreationRaceUnresolved { error_code, .. } => *error_code,
            CryptoError::StoreError { error_code, .. } => *error_code,
            CryptoError::CodecError { error_code, .. } => *error_code,
            CryptoError::InvalidParameter { error_code, .. } => *error_code,
            CryptoError::ConfigurationError(_) => error_codes::CONFIGURATION_INVALID,
            CryptoError::IoError(_) => error_codes::IO_FAILED,
        }
    }

    /// Whether this error is a race signal the orchestrator recovers from.
    ///
    /// Only `NotFound` (lost lookup race) and `AlreadyExists` (lost creation
    /// race) are transient. Everything else is terminal for the call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CryptoError::NotFound { .. } | CryptoError::AlreadyExists { .. }
        )
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            CryptoError::UnsupportedAlgorithm { family, .. } => {
                format!("The key algorithm '{}' cannot be provisioned.", family)
            }
            CryptoError::NotFound { name, .. } => {
                format!("No key named '{}' is present in the key store.", name)
            }
            CryptoError::AlreadyExists { name, .. } => {
                format!("A key named '{}' already exists in the key store.", name)
            }
            CryptoError::CreationFailed { name, store, .. } => {
                format!("The {} refused to create the key '{}'.", store, name)
            }
            CryptoError::NotExportable { name, .. } => {
                format!(
                    "The private key '{}' is bound to its key store and cannot be exported.",
                    name
                )
            }
            CryptoError::CreationRaceUnresolved { name, .. } => {
                format!(
                    "Another process created the key '{}' at the same time and it could not be opened.",
                    name
                )
            }
            CryptoError::StoreError { operation, .. } => {
                format!("Key store operation '{}' failed.", operation)
            }
            CryptoError::CodecError { format, .. } => {
                format!("Key material is not valid {}.", format)
            }
            CryptoError::InvalidParameter {
                parameter,
                expected,
                ..
            } => {
                format!(
                    "Invalid parameter '{}'. Expected {}.",
                    parameter, expected
                )
            }
            CryptoError::ConfigurationError(_) => {
                "The key provisioning configuration is invalid.".to_string()
            }
            CryptoError::IoError(_) => {
                "Input/output operation failed. Check file permissions.".to_string()
            }
        }
    }

    /// Get technical details for debugging
    pub fn technical_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();

        details.insert("error_code".to_string(), self.error_code().to_string());
        details.insert("error_type".to_string(), self.error_type().to_string());
        details.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());

        match self {
            CryptoError::StoreError {
                operation,
                cause,
                context,
                ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("cause".to_string(), cause.clone());
                details.extend(context.clone());
            }
            CryptoError::CreationFailed {
                name, store, cause, ..
            } => {
                details.insert("name".to_string(), name.clone());
                details.insert("store".to_string(), store.clone());
                details.insert("cause".to_string(), cause.clone());
            }
            CryptoError::InvalidParameter {
                parameter,
                expected,
                actual,
                ..
            } => {
                details.insert("parameter".to_string(), parameter.clone());
                details.insert("expected".to_string(), expected.clone());
                details.insert("actual".to_string(), actual.clone());
            }
            _ => {
                details.insert("details".to_string(), format!("{:?}", self));
            }
        }

        details
    }

    /// Get suggested remediation steps
    pub fn suggested_remediation(&self) -> Option<String> {
        match self {
            CryptoError::UnsupportedAlgorithm { error_code, .. } => match *error_code {
                error_codes::UNSUPPORTED_KEY_SIZE => Some(
                    "Use an RSA key size between 1024 and 16384 bits, in multiples of 8."
                        .to_string(),
                ),
                _ => Some("Use the RSA key family.".to_string()),
            },
            CryptoError::NotExportable { .. } => Some(
                "Use the key through its store, or recreate it with exportable private keys enabled."
                    .to_string(),
            ),
            CryptoError::CreationRaceUnresolved { .. } => Some(
                "Retry the call; another process is creating or deleting the same key.".to_string(),
            ),
            CryptoError::CreationFailed { .. } => Some(
                "Check that the key store is unlocked and the provider supports the requested key."
                    .to_string(),
            ),
            CryptoError::ConfigurationError(_) => {
                Some("Check the provider section of the configuration.".to_string())
            }
            _ => None,
        }
    }

    /// Get the error category/type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            CryptoError::UnsupportedAlgorithm { .. } => "UnsupportedAlgorithm",
            CryptoError::NotFound { .. } => "NotFound",
            CryptoError::AlreadyExists { .. } => "AlreadyExists",
            CryptoError::CreationFailed { .. } => "CreationFailed",
            CryptoError::NotExportable { .. } => "NotExportable",
            CryptoError::CreationRaceUnresolved { .. } => "CreationRaceUnresolved",
            CryptoError::StoreError { .. } => "StoreError",
            CryptoError::CodecError { .. } => "CodecError",
            CryptoError::InvalidParameter { .. } => "InvalidParameter",
            CryptoError::ConfigurationError(_) => "ConfigurationError",
            CryptoError::IoError(_) => "IoError",
        }
    }
}

/// Convenience constructors for common error types
impl CryptoError {
    pub fn unsupported_algorithm(family: &str, bits: u32, reason: &str, error_code: u32) -> Self {
        CryptoError::UnsupportedAlgorithm {
            family: family.to_string(),
            bits,
            reason: reason.to_string(),
            error_code,
        }
    }

    pub fn not_found(name: &str, visibility: &str) -> Self {
        CryptoError::NotFound {
            name: name.to_string(),
            visibility: visibility.to_string(),
            error_code: error_codes::KEY_NOT_FOUND,
        }
    }

    pub fn already_exists(name: &str) -> Self {
        CryptoError::AlreadyExists {
            name: name.to_string(),
            error_code: error_codes::KEY_ALREADY_EXISTS,
        }
    }

    pub fn creation_failed(name: &str, store: &str, cause: &str) -> Self {
        CryptoError::CreationFailed {
            name: name.to_string(),
            store: store.to_string(),
            cause: cause.to_string(),
            error_code: error_codes::KEY_CREATION_FAILED,
        }
    }

    pub fn not_exportable(name: &str, store: &str) -> Self {
        CryptoError::NotExportable {
            name: name.to_string(),
            store: store.to_string(),
            error_code: error_codes::KEY_NOT_EXPORTABLE,
        }
    }

    pub fn race_unresolved(name: &str) -> Self {
        CryptoError::CreationRaceUnresolved {
            name: name.to_string(),
            error_code: error_codes::KEY_CREATION_RACE_UNRESOLVED,
        }
    }

    pub fn store_error(operation: &str, cause: &str, store: &str, error_code: u32) -> Self {
        let mut context = HashMap::new();
        context.insert("store".to_string(), store.to_string());

        CryptoError::StoreError {
            operation: operation.to_string(),
            cause: cause.to_string(),
            error_code,
            context,
        }
    }

    pub fn codec_error(format: &str, cause: &str, error_code: u32) -> Self {
        CryptoError::CodecError {
            format: format.to_string(),
            cause: cause.to_string(),
            error_code,
        }
    }

    pub fn invalid_parameter(parameter: &str, expected: &str, actual: &str) -> Self {
        CryptoError::InvalidParameter {
            parameter: parameter.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            error_code: error_codes::INVALID_PARAMETER,
        }
    }
}

// From implementations for automatic error conversion
impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::IoError(format!("IO operation failed: {}", err))
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::ConfigurationError(err.to_string())
    }
}

impl From<rsa::pkcs1::Error> for CryptoError {
    fn from(err: rsa::pkcs1::Error) -> Self {
        CryptoError::codec_error("PKCS#1", &err.to_string(), error_codes::KEY_ENCODING_FAILED)
    }
}

impl From<rsa::pkcs8::Error> for CryptoError {
    fn from(err: rsa::pkcs8::Error) -> Self {
        CryptoError::codec_error("PKCS#8", &err.to_string(), error_codes::KEY_ENCODING_FAILED)
    }
}

impl From<rsa::Error> for CryptoError {
    fn from(err: rsa::Error) -> Self {
        CryptoError::codec_error("RSA", &err.to_string(), error_codes::KEY_DECODING_FAILED)
    }
}

/// Result type alias for key provisioning operations
pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_generation() {
        let error = CryptoError::unsupported_algorithm(
            "dsa",
            2048,
            "family not supported",
            error_codes::UNSUPPORTED_ALGORITHM_FAMILY,
        );
        assert_eq!(error.error_code(), error_codes::UNSUPPORTED_ALGORITHM_FAMILY);
        assert_eq!(error.error_type(), "UnsupportedAlgorithm");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CryptoError::not_found("k", "private").is_transient());
        assert!(CryptoError::already_exists("k").is_transient());
        assert!(!CryptoError::not_exportable("k", "memory store").is_transient());
        assert!(!CryptoError::race_unresolved("k").is_transient());
        assert!(!CryptoError::creation_failed("k", "memory store", "boom").is_transient());
    }

    #[test]
    fn test_user_friendly_message() {
        let error = CryptoError::not_exportable("signing-key", "CNG key storage provider");
        let message = error.user_friendly_message();
        assert!(message.contains("signing-key"));
        assert!(message.contains("cannot be exported"));
    }

    #[test]
    fn test_technical_details() {
        let error = CryptoError::store_error(
            "open",
            "session closed",
            "PKCS#11 token",
            error_codes::STORE_OPEN_FAILED,
        );
        let details = error.technical_details();
        assert!(details.contains_key("error_code"));
        assert!(details.contains_key("operation"));
        assert_eq!(details.get("store").map(String::as_str), Some("PKCS#11 token"));
    }

    #[test]
    fn test_remediation_suggestions() {
        let error = CryptoError::unsupported_algorithm(
            "rsa",
            100,
            "too small",
            error_codes::UNSUPPORTED_KEY_SIZE,
        );
        let suggestion = error.suggested_remediation();
        assert!(suggestion.is_some());
        assert!(suggestion.unwrap_or_default().contains("1024"));
        assert!(CryptoError::not_found("k", "public").suggested_remediation().is_none());
    }
}
