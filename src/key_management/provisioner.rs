/*!
 * Key Provisioning Orchestrator
 *
 * Implements get-or-create over a [`KeyStore`]: look the key up, create it if
 * it is missing, and recover from the two races the stores expose (a key
 * deleted between `exists` and `open`, and a key created by someone else
 * between `exists` and `create`). The result is always portable key material
 * produced by the [`KeyCodec`].
 *
 * The provisioner holds no key state of its own. Every call goes to the
 * store, and handles are dropped before the call returns.
 */

use crate::error::{CryptoError, CryptoResult};
use crate::key_management::codec::{ImportedKey, KeyCodec};
use crate::key_management::config::ProvisionerConfig;
use crate::key_management::store::{open_platform_store, KeyStore, MemoryKeyStore, PlatformKeyStore};
use crate::key_management::types::{
    ExportedKeyMaterial, KeyAlgorithmSpec, KeyIdentifier, KeyUsage, Visibility,
};

/// One get-or-create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub name: String,
    pub algorithm: KeyAlgorithmSpec,
    pub usage: KeyUsage,
    pub visibility: Visibility,
    /// Delete any existing key under `name` before resolving
    pub overwrite: bool,
}

impl KeyRequest {
    /// Request for the private half of an RSA key, without overwrite
    pub fn new(name: impl Into<String>, algorithm: KeyAlgorithmSpec, usage: KeyUsage) -> Self {
        Self {
            name: name.into(),
            algorithm,
            usage,
            visibility: Visibility::Private,
            overwrite: false,
        }
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Get-or-create front end over a key store
pub struct KeyProvisioner<S: KeyStore> {
    store: S,
    config: ProvisionerConfig,
}

impl KeyProvisioner<PlatformKeyStore> {
    /// Provisioner over the host's native key store
    pub fn for_platform(config: ProvisionerConfig) -> CryptoResult<Self> {
        let store = open_platform_store(&config)?;
        log::info!(
            "Key provisioner ready on {} ({})",
            store.store_name(),
            config.provider.kind()
        );
        Ok(Self::new(store, config))
    }
}

impl KeyProvisioner<MemoryKeyStore> {
    /// Provisioner over a fresh in-memory store
    pub fn in_memory(config: ProvisionerConfig) -> CryptoResult<Self> {
        config.validate()?;
        let store = MemoryKeyStore::from_config(&config)?;
        Ok(Self::new(store, config))
    }
}

impl<S: KeyStore> KeyProvisioner<S> {
    pub fn new(store: S, config: ProvisionerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Return the key stored under `name`, creating it first if needed.
    ///
    /// With `overwrite` any existing key is deleted first, so the call always
    /// yields a freshly generated key. Without it, repeated calls yield the
    /// same key as long as nobody deletes it in between.
    ///
    /// Unsupported algorithms are rejected before the store is touched.
    pub fn get_or_create(
        &self,
        name: &str,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
        visibility: Visibility,
        overwrite: bool,
    ) -> CryptoResult<ExportedKeyMaterial> {
        algorithm.validate()?;
        let id = KeyIdentifier::new(name, visibility)?;

        if overwrite {
            log::info!("Overwriting key '{}'", name);
            match self.store.delete(&id) {
                Ok(()) | Err(CryptoError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let handle = self.resolve_handle(&id, algorithm, usage)?;
        let material = KeyCodec::export(&self.store, &handle, visibility)?;
        drop(handle);

        if material.visibility() == Visibility::Public {
            log::debug!(
                "Exported public key '{}' (sha256 {})",
                name,
                KeyCodec::fingerprint(material.as_bytes())
            );
        } else {
            log::debug!("Exported private key '{}' ({} bytes)", name, material.len());
        }

        Ok(material)
    }

    /// Run a [`KeyRequest`]
    pub fn provision(&self, request: &KeyRequest) -> CryptoResult<ExportedKeyMaterial> {
        self.get_or_create(
            &request.name,
            &request.algorithm,
            request.usage,
            request.visibility,
            request.overwrite,
        )
    }

    /// Get or create an RSA key of the configured size and import it.
    ///
    /// Needs a store that exports private keys; a sealed store fails with
    /// `NotExportable`.
    pub fn provision_rsa_key(&self, name: &str, usage: KeyUsage) -> CryptoResult<ImportedKey> {
        let algorithm = KeyAlgorithmSpec::rsa(self.config.default_key_bits);
        let material = self.get_or_create(name, &algorithm, usage, Visibility::Private, false)?;
        KeyCodec::import_material(&material)
    }

    /// Open the existing key, or create it and win or lose the race cleanly
    fn resolve_handle(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<S::Handle> {
        if self.store.exists(id)? {
            match self.store.open(id) {
                Ok(handle) => {
                    log::debug!("Opened existing key {}", id);
                    return Ok(handle);
                }
                // Deleted between exists and open
                Err(CryptoError::NotFound { .. }) => {
                    log::debug!("Key {} vanished before it could be opened", id);
                }
                Err(e) => return Err(e),
            }
        }

        match self.store.create(id, algorithm, usage) {
            Ok(handle) => {
                log::info!("Created {} key '{}' for {}", algorithm, id.name(), usage);
                Ok(handle)
            }
            Err(CryptoError::AlreadyExists { .. }) => {
                log::warn!(
                    "Key '{}' was created concurrently; opening the winner",
                    id.name()
                );
                match self.store.open(id) {
                    Ok(handle) => Ok(handle),
                    Err(CryptoError::NotFound { .. }) => Err(CryptoError::race_unresolved(id.name())),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}
