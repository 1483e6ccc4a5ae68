/*!
 * keyprov: asymmetric key provisioning over platform key stores
 *
 * Given a logical key name, finds or creates an RSA key pair inside the
 * secure key store the host provides and exports it as portable PKCS#1 DER:
 *
 * - Windows: a CNG key storage provider (persistent key containers)
 * - macOS / iOS: the Keychain (secure credential store)
 * - other hosts: a PKCS#11 token such as SoftHSM
 *
 * Creation is safe against other processes provisioning the same name at the
 * same time: every caller ends up with the same key.
 *
 * # Example
 *
 * ```no_run
 * use keyprov::prelude::*;
 *
 * fn main() -> Result<(), CryptoError> {
 *     let provisioner = KeyProvisioner::for_platform(ProvisionerConfig::platform_default())?;
 *     let signing = provisioner.provision_rsa_key("oauth-client-signing", KeyUsage::Signing)?;
 *     let signature = signing.sign(b"client assertion")?;
 *     assert!(signing.verify(b"client assertion", &signature));
 *     Ok(())
 * }
 * ```
 */

/// Common error types for key provisioning
pub mod error;

/// Key stores, codec and the provisioning orchestrator
pub mod key_management;

/// Zeroizing containers for private key bytes
pub mod secure_memory;

pub use error::{CryptoError, CryptoResult};
pub use key_management::{
    ExportedKeyMaterial, ImportedKey, KeyAlgorithmSpec, KeyCodec, KeyFamily, KeyFormat,
    KeyIdentifier, KeyProvisioner, KeyRequest, KeyStore, KeyUsage, MemoryKeyStore,
    PlatformKeyStore, ProviderConfig, ProvisionerConfig, Visibility,
};
pub use secure_memory::SecureBytes;

/// The types needed for everyday provisioning
pub mod prelude {
    pub use crate::error::{CryptoError, CryptoResult};
    pub use crate::key_management::{
        ExportedKeyMaterial, ImportedKey, KeyAlgorithmSpec, KeyCodec, KeyProvisioner,
        KeyRequest, KeyStore, KeyUsage, MemoryKeyStore, PlatformKeyStore, ProvisionerConfig,
        Visibility,
    };
    pub use crate::secure_memory::SecureBytes;
}
