/*!
 * Key Provisioning
 *
 * Finds or creates named asymmetric key pairs in the host's secure key store
 * and exports them as portable bytes.
 *
 * - [`store`]: the platform key stores behind one [`KeyStore`] trait
 * - [`codec`]: native blobs to PKCS#1 DER and back into usable RSA keys
 * - [`provisioner`]: get-or-create with race recovery
 */

pub mod codec;
pub mod config;
pub mod provisioner;
pub mod store;
pub mod types;


pub use codec::{ImportedKey, KeyCodec, NativeKeyBlob};
pub use config::{ProviderConfig, ProvisionerConfig};
pub use provisioner::{KeyProvisioner, KeyRequest};
pub use store::{open_platform_store, KeyStore, MemoryKeyStore, PlatformKeyStore};
pub use types::{
    ExportedKeyMaterial, KeyAlgorithmSpec, KeyFamily, KeyFormat, KeyIdentifier, KeyUsage,
    Visibility,
};
