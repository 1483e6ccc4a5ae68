/*!
 * Provisioner configuration
 *
 * Selects and parameterizes the key store the provisioner talks to. The
 * configuration is passed to the provisioner at construction; there is no
 * process-wide default provider.
 */

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::key_management::types::{DEFAULT_RSA_BITS, MAX_RSA_BITS, MIN_RSA_BITS};

/// Name of the software key storage provider shipped with Windows
pub const MS_SOFTWARE_KEY_STORAGE_PROVIDER: &str = "Microsoft Software Key Storage Provider";

/// Default location of the SoftHSM PKCS#11 module on Linux distributions
pub const DEFAULT_PKCS11_LIBRARY: &str = "/usr/lib/softhsm/libsofthsm2.so";

/// Key store backend and its connection parameters
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Windows CNG key storage provider (persistent key containers)
    Cng {
        #[serde(default = "default_cng_provider")]
        provider_name: String,
        /// Create machine-wide keys instead of per-user keys
        #[serde(default)]
        machine_key: bool,
    },

    /// PKCS#11 token (persistent key objects)
    Pkcs11 {
        #[serde(default = "default_pkcs11_library")]
        library_path: String,
        #[serde(default)]
        slot_id: Option<u64>,
        #[serde(default)]
        token_label: Option<String>,
        #[serde(default)]
        user_pin: Option<Zeroizing<String>>,
    },

    /// Apple Keychain (secure credential store)
    Keychain {
        #[serde(default)]
        access_group: Option<String>,
    },

    /// Process-local store; keys vanish with the process
    Memory,
}

fn default_cng_provider() -> String {
    MS_SOFTWARE_KEY_STORAGE_PROVIDER.to_string()
}

fn default_pkcs11_library() -> String {
    DEFAULT_PKCS11_LIBRARY.to_string()
}

impl ProviderConfig {
    /// The provider matching the host platform's native key store
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            ProviderConfig::Cng {
                provider_name: default_cng_provider(),
                machine_key: false,
            }
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            ProviderConfig::Keychain { access_group: None }
        } else {
            ProviderConfig::Pkcs11 {
                library_path: default_pkcs11_library(),
                slot_id: None,
                token_label: None,
                user_pin: None,
            }
        }
    }

    /// Short name used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Cng { .. } => "cng",
            ProviderConfig::Pkcs11 { .. } => "pkcs11",
            ProviderConfig::Keychain { .. } => "keychain",
            ProviderConfig::Memory => "memory",
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderConfig::Cng {
                provider_name,
                machine_key,
            } => f
                .debug_struct("Cng")
                .field("provider_name", provider_name)
                .field("machine_key", machine_key)
                .finish(),
            ProviderConfig::Pkcs11 {
                library_path,
                slot_id,
                token_label,
                user_pin,
            } => f
                .debug_struct("Pkcs11")
                .field("library_path", library_path)
                .field("slot_id", slot_id)
                .field("token_label", token_label)
                .field("user_pin", &user_pin.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            ProviderConfig::Keychain { access_group } => f
                .debug_struct("Keychain")
                .field("access_group", access_group)
                .finish(),
            ProviderConfig::Memory => write!(f, "Memory"),
        }
    }
}

/// Configuration handed to [`KeyProvisioner`](crate::key_management::KeyProvisioner)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Backend holding the keys
    #[serde(default = "ProviderConfig::platform_default")]
    pub provider: ProviderConfig,

    /// Whether newly created private keys may leave the store.
    ///
    /// Existing keys keep the policy they were created with.
    #[serde(default = "default_exportable")]
    pub exportable_private_keys: bool,

    /// RSA modulus size used by [`provision_rsa_key`](crate::key_management::KeyProvisioner::provision_rsa_key)
    #[serde(default = "default_key_bits")]
    pub default_key_bits: u32,
}

fn default_exportable() -> bool {
    true
}

fn default_key_bits() -> u32 {
    DEFAULT_RSA_BITS
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl ProvisionerConfig {
    /// Configuration for the host's native key store
    pub fn platform_default() -> Self {
        Self::with_provider(ProviderConfig::platform_default())
    }

    /// Configuration using the in-memory store
    pub fn memory() -> Self {
        Self::with_provider(ProviderConfig::Memory)
    }

    pub fn with_provider(provider: ProviderConfig) -> Self {
        Self {
            provider,
            exportable_private_keys: default_exportable(),
            default_key_bits: default_key_bits(),
        }
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> CryptoResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CryptoError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Check the configuration is usable on this host
    pub fn validate(&self) -> CryptoResult<()> {
        if self.default_key_bits < MIN_RSA_BITS
            || self.default_key_bits > MAX_RSA_BITS
            || self.default_key_bits % 8 != 0
        {
            return Err(CryptoError::ConfigurationError(format!(
                "default_key_bits must be a multiple of 8 between {} and {}, got {}",
                MIN_RSA_BITS, MAX_RSA_BITS, self.default_key_bits
            )));
        }

        match &self.provider {
            ProviderConfig::Cng { provider_name, .. } => {
                if !cfg!(windows) {
                    return Err(CryptoError::ConfigurationError(
                        "the CNG provider is only available on Windows".to_string(),
                    ));
                }
                if provider_name.trim().is_empty() {
                    return Err(CryptoError::ConfigurationError(
                        "provider_name must not be empty".to_string(),
                    ));
                }
            }
            ProviderConfig::Pkcs11 { library_path, .. } => {
                if library_path.trim().is_empty() {
                    return Err(CryptoError::ConfigurationError(
                        "library_path must not be empty".to_string(),
                    ));
                }
            }
            ProviderConfig::Keychain { .. } => {
                if !cfg!(any(target_os = "macos", target_os = "ios")) {
                    return Err(CryptoError::ConfigurationError(
                        "the Keychain provider is only available on Apple platforms".to_string(),
                    ));
                }
            }
            ProviderConfig::Memory => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_validates() {
        let config = ProvisionerConfig::memory();
        assert!(config.validate().is_ok());
        assert!(config.exportable_private_keys);
        assert_eq!(config.default_key_bits, 2048);
    }

    #[test]
    fn test_platform_default_matches_host() {
        let config = ProvisionerConfig::platform_default();
        if cfg!(windows) {
            assert_eq!(config.provider.kind(), "cng");
        } else if cfg!(target_os = "macos") {
            assert_eq!(config.provider.kind(), "keychain");
        } else {
            assert_eq!(config.provider.kind(), "pkcs11");
        }
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = ProvisionerConfig::from_json_str(
            r#"{ "provider": { "kind": "memory" }, "exportable_private_keys": false }"#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderConfig::Memory);
        assert!(!config.exportable_private_keys);
        assert_eq!(config.default_key_bits, 2048);
    }

    #[test]
    fn test_pkcs11_json_and_redacted_pin() {
        let config = ProvisionerConfig::from_json_str(
            r#"{
                "provider": {
                    "kind": "pkcs11",
                    "token_label": "oauth",
                    "user_pin": "1234"
                }
            }"#,
        )
        .unwrap();
        match &config.provider {
            ProviderConfig::Pkcs11 {
                library_path,
                token_label,
                ..
            } => {
                assert_eq!(library_path, DEFAULT_PKCS11_LIBRARY);
                assert_eq!(token_label.as_deref(), Some("oauth"));
            }
            other => panic!("unexpected provider {:?}", other),
        }
        let printed = format!("{:?}", config);
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains("1234"));
    }

    #[test]
    fn test_invalid_key_bits_rejected() {
        let result = ProvisionerConfig::from_json_str(
            r#"{ "provider": { "kind": "memory" }, "default_key_bits": 1000 }"#,
        );
        assert!(matches!(result, Err(CryptoError::ConfigurationError(_))));
    }

    #[test]
    fn test_malformed_json_is_configuration_error() {
        let result = ProvisionerConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(CryptoError::ConfigurationError(_))));
    }

    #[test]
    fn test_foreign_platform_provider_rejected() {
        let provider = if cfg!(windows) {
            ProviderConfig::Keychain { access_group: None }
        } else {
            ProviderConfig::Cng {
                provider_name: MS_SOFTWARE_KEY_STORAGE_PROVIDER.to_string(),
                machine_key: false,
            }
        };
        assert!(ProvisionerConfig::with_provider(provider).validate().is_err());
    }
}
