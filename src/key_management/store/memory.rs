//! Process-local key store.
//!
//! Keeps RSA key pairs in a shared map. Clones of a [`MemoryKeyStore`] see the
//! same keys, which makes it a stand-in for a native store shared between
//! several provisioners or threads. Usage restrictions and the export policy
//! are enforced the way a native store would.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rand::rngs::OsRng;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::key_management::codec::NativeKeyBlob;
use crate::key_management::config::{ProviderConfig, ProvisionerConfig};
use crate::key_management::store::{wrong_provider, KeyStore};
use crate::key_management::types::{
    KeyAlgorithmSpec, KeyFamily, KeyIdentifier, KeyUsage, Visibility,
};
use crate::secure_memory::SecureBytes;

const STORE_NAME: &str = "in-memory key store";

#[derive(Clone)]
struct StoredKey {
    key: Arc<RsaPrivateKey>,
    usage: KeyUsage,
    exportable: bool,
}

/// Handle to a key held by a [`MemoryKeyStore`]
#[derive(Clone)]
pub struct MemoryKeyHandle {
    name: String,
    visibility: Visibility,
    stored: StoredKey,
}

impl MemoryKeyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn usage(&self) -> KeyUsage {
        self.stored.usage
    }
}

impl std::fmt::Debug for MemoryKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyHandle")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("usage", &self.stored.usage)
            .finish()
    }
}

/// In-memory key store
#[derive(Clone)]
pub struct MemoryKeyStore {
    keys: Arc<RwLock<HashMap<String, StoredKey>>>,
    exportable: bool,
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyStore {
    /// Store whose private keys may be exported
    pub fn new() -> Self {
        Self::with_export_policy(true)
    }

    /// Store that refuses to export private keys it creates
    pub fn non_exportable() -> Self {
        Self::with_export_policy(false)
    }

    pub fn with_export_policy(exportable: bool) -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            exportable,
        }
    }

    pub fn from_config(config: &ProvisionerConfig) -> CryptoResult<Self> {
        match config.provider {
            ProviderConfig::Memory => Ok(Self::with_export_policy(config.exportable_private_keys)),
            _ => Err(wrong_provider("memory", config)),
        }
    }

    /// Number of stored key pairs.
    ///
    /// Counts through a poisoned lock; entries are only ever inserted or
    /// removed whole.
    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sign the SHA-256 digest of `message` inside the store.
    ///
    /// Refused unless the key was created for signing.
    pub fn sign(&self, handle: &MemoryKeyHandle, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.usable_private_key(handle, KeyUsage::Signing, "sign")?;
        let digest = Sha256::digest(message);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| store_failure("sign", &e.to_string(), error_codes::STORE_QUERY_FAILED))
    }

    /// OAEP (SHA-256) decrypt inside the store.
    ///
    /// Refused unless the key was created for decryption.
    pub fn decrypt(&self, handle: &MemoryKeyHandle, ciphertext: &[u8]) -> CryptoResult<SecureBytes> {
        let key = self.usable_private_key(handle, KeyUsage::Decryption, "decrypt")?;
        key.decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(SecureBytes::from)
            .map_err(|e| store_failure("decrypt", &e.to_string(), error_codes::STORE_QUERY_FAILED))
    }

    fn usable_private_key<'h>(
        &self,
        handle: &'h MemoryKeyHandle,
        usage: KeyUsage,
        operation: &str,
    ) -> CryptoResult<&'h RsaPrivateKey> {
        if handle.visibility != Visibility::Private {
            return Err(CryptoError::invalid_parameter(
                "handle",
                "a private key handle",
                "public key handle",
            ));
        }
        if handle.stored.usage != usage {
            return Err(store_failure(
                operation,
                &format!("key '{}' was created for {}", handle.name, handle.stored.usage),
                error_codes::STORE_QUERY_FAILED,
            ));
        }
        Ok(&handle.stored.key)
    }

    fn lookup(&self, name: &str) -> CryptoResult<Option<StoredKey>> {
        let keys = self.keys.read().map_err(|_| lock_poisoned("read"))?;
        Ok(keys.get(name).cloned())
    }
}

fn store_failure(operation: &str, cause: &str, error_code: u32) -> CryptoError {
    CryptoError::store_error(operation, cause, STORE_NAME, error_code)
}

fn lock_poisoned(operation: &str) -> CryptoError {
    store_failure(operation, "lock poisoned", error_codes::STORE_LOCK_POISONED)
}

impl KeyStore for MemoryKeyStore {
    type Handle = MemoryKeyHandle;

    fn store_name(&self) -> &str {
        STORE_NAME
    }

    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool> {
        Ok(self.lookup(id.name())?.is_some())
    }

    fn open(&self, id: &KeyIdentifier) -> CryptoResult<MemoryKeyHandle> {
        let stored = self
            .lookup(id.name())?
            .ok_or_else(|| CryptoError::not_found(id.name(), &id.visibility().to_string()))?;
        Ok(MemoryKeyHandle {
            name: id.name().to_string(),
            visibility: id.visibility(),
            stored,
        })
    }

    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<MemoryKeyHandle> {
        if algorithm.family != KeyFamily::Rsa {
            return Err(CryptoError::creation_failed(
                id.name(),
                STORE_NAME,
                &format!("{} keys are not supported", algorithm),
            ));
        }

        // Generated outside the lock; the slot is claimed only on insert.
        let key = RsaPrivateKey::new(&mut OsRng, algorithm.bits as usize)
            .map_err(|e| CryptoError::creation_failed(id.name(), STORE_NAME, &e.to_string()))?;
        let stored = StoredKey {
            key: Arc::new(key),
            usage,
            exportable: self.exportable,
        };

        let mut keys = self.keys.write().map_err(|_| lock_poisoned("create"))?;
        if keys.contains_key(id.name()) {
            return Err(CryptoError::already_exists(id.name()));
        }
        keys.insert(id.name().to_string(), stored.clone());
        log::debug!("Stored {} key pair '{}'", algorithm, id.name());

        Ok(MemoryKeyHandle {
            name: id.name().to_string(),
            visibility: id.visibility(),
            stored,
        })
    }

    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()> {
        let mut keys = self.keys.write().map_err(|_| lock_poisoned("delete"))?;
        keys.remove(id.name());
        Ok(())
    }

    fn read_material(
        &self,
        handle: &MemoryKeyHandle,
        visibility: Visibility,
    ) -> CryptoResult<NativeKeyBlob> {
        match visibility {
            Visibility::Public => Ok(NativeKeyBlob::RsaPublic(handle.stored.key.to_public_key())),
            Visibility::Private => {
                if handle.visibility == Visibility::Public || !handle.stored.exportable {
                    return Err(CryptoError::not_exportable(&handle.name, STORE_NAME));
                }
                Ok(NativeKeyBlob::RsaPrivate(handle.stored.key.as_ref().clone()))
            }
        }
    }
}
