/*!
 * CNG Key Store (Windows)
 *
 * Persists key pairs as named containers in a CNG key storage provider. One
 * container holds both halves, so there is a single object per name and the
 * provider itself rejects a second creator with `NTE_EXISTS`.
 */

use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{
    NTE_BAD_KEYSET, NTE_BAD_KEY_STATE, NTE_EXISTS, NTE_NOT_SUPPORTED, NTE_PERM,
};
use windows::Win32::Security::Cryptography::{
    NCryptCreatePersistedKey, NCryptDeleteKey, NCryptExportKey, NCryptFinalizeKey,
    NCryptFreeObject, NCryptGetProperty, NCryptOpenKey, NCryptOpenStorageProvider,
    NCryptSetProperty, BCRYPT_ECCPRIVATE_BLOB, BCRYPT_ECCPUBLIC_BLOB, BCRYPT_RSAFULLPRIVATE_BLOB,
    BCRYPT_RSAPUBLIC_BLOB, CERT_KEY_SPEC, NCRYPT_ALGORITHM_GROUP_PROPERTY,
    NCRYPT_ECDSA_P256_ALGORITHM, NCRYPT_EXPORT_POLICY_PROPERTY, NCRYPT_FLAGS, NCRYPT_HANDLE,
    NCRYPT_KEY_HANDLE, NCRYPT_KEY_USAGE_PROPERTY, NCRYPT_LENGTH_PROPERTY,
    NCRYPT_MACHINE_KEY_FLAG, NCRYPT_PROV_HANDLE, NCRYPT_RSA_ALGORITHM, NCRYPT_SILENT_FLAG,
};
use windows::Win32::Security::OBJECT_SECURITY_INFORMATION;

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::key_management::codec::NativeKeyBlob;
use crate::key_management::config::{ProviderConfig, ProvisionerConfig};
use crate::key_management::store::{wrong_provider, KeyStore};
use crate::key_management::types::{
    KeyAlgorithmSpec, KeyFamily, KeyIdentifier, KeyUsage, Visibility,
};
use crate::secure_memory::SecureBytes;

const STORE_NAME: &str = "CNG key storage provider";

// NCRYPT_KEY_USAGE_PROPERTY values
const ALLOW_DECRYPT: u32 = 0x1;
const ALLOW_SIGNING: u32 = 0x2;

// NCRYPT_EXPORT_POLICY_PROPERTY values
const ALLOW_EXPORT: u32 = 0x1;
const ALLOW_PLAINTEXT_EXPORT: u32 = 0x2;

const BCRYPT_ECCKEY_HEADER_LEN: usize = 8;

struct ProviderHandle(NCRYPT_PROV_HANDLE);

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = NCryptFreeObject(NCRYPT_HANDLE(self.0 .0));
        }
    }
}

struct KeyObject(NCRYPT_KEY_HANDLE);

impl KeyObject {
    fn as_object(&self) -> NCRYPT_HANDLE {
        NCRYPT_HANDLE(self.0 .0)
    }

    /// Give up ownership; used when a CNG call frees the handle itself
    fn into_raw(self) -> NCRYPT_KEY_HANDLE {
        let handle = self.0;
        std::mem::forget(self);
        handle
    }
}

impl Drop for KeyObject {
    fn drop(&mut self) {
        unsafe {
            let _ = NCryptFreeObject(self.as_object());
        }
    }
}

/// Handle to an open CNG key container
pub struct CngKeyHandle {
    key: KeyObject,
    name: String,
    visibility: Visibility,
    family: KeyFamily,
}

impl CngKeyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// Key store backed by a CNG key storage provider
pub struct CngKeyStore {
    provider: ProviderHandle,
    provider_name: String,
    key_flags: NCRYPT_FLAGS,
    exportable: bool,
}

fn store_failure(operation: &str, error: &windows::core::Error, error_code: u32) -> CryptoError {
    CryptoError::store_error(
        operation,
        &format!("{} (0x{:08x})", error.message(), error.code().0),
        STORE_NAME,
        error_code,
    )
}

impl CngKeyStore {
    /// Open the named key storage provider
    pub fn open_provider(
        provider_name: &str,
        machine_key: bool,
        exportable: bool,
    ) -> CryptoResult<Self> {
        let mut provider = NCRYPT_PROV_HANDLE::default();
        unsafe { NCryptOpenStorageProvider(&mut provider, &HSTRING::from(provider_name), 0) }
            .map_err(|e| store_failure("open_provider", &e, error_codes::STORE_OPEN_FAILED))?;

        log::info!("Opened CNG key storage provider: {}", provider_name);

        let key_flags = if machine_key {
            NCRYPT_SILENT_FLAG | NCRYPT_MACHINE_KEY_FLAG
        } else {
            NCRYPT_SILENT_FLAG
        };

        Ok(Self {
            provider: ProviderHandle(provider),
            provider_name: provider_name.to_string(),
            key_flags,
            exportable,
        })
    }

    pub fn from_config(config: &ProvisionerConfig) -> CryptoResult<Self> {
        match &config.provider {
            ProviderConfig::Cng {
                provider_name,
                machine_key,
            } => Self::open_provider(provider_name, *machine_key, config.exportable_private_keys),
            _ => Err(wrong_provider("cng", config)),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Open the container, `None` if the provider has no key by that name
    fn open_key(&self, name: &str) -> CryptoResult<Option<KeyObject>> {
        let mut key = NCRYPT_KEY_HANDLE::default();
        let result = unsafe {
            NCryptOpenKey(
                self.provider.0,
                &mut key,
                &HSTRING::from(name),
                CERT_KEY_SPEC(0),
                self.key_flags,
            )
        };
        match result {
            Ok(()) => Ok(Some(KeyObject(key))),
            Err(e) if e.code() == NTE_BAD_KEYSET => Ok(None),
            Err(e) => Err(store_failure("open", &e, error_codes::STORE_QUERY_FAILED)),
        }
    }

    fn set_u32_property(key: &KeyObject, property: PCWSTR, value: u32) -> windows::core::Result<()> {
        unsafe { NCryptSetProperty(key.as_object(), property, &value.to_le_bytes(), NCRYPT_FLAGS(0)) }
    }

    fn algorithm_group(key: &KeyObject) -> CryptoResult<KeyFamily> {
        let mut buffer = [0u8; 64];
        let mut written = 0u32;
        unsafe {
            NCryptGetProperty(
                key.as_object(),
                NCRYPT_ALGORITHM_GROUP_PROPERTY,
                Some(&mut buffer),
                &mut written,
                OBJECT_SECURITY_INFORMATION(0),
            )
        }
        .map_err(|e| store_failure("get_property", &e, error_codes::STORE_QUERY_FAILED))?;

        let units: Vec<u16> = buffer[..written as usize]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0)
            .collect();
        let group = String::from_utf16_lossy(&units);
        Ok(match group.as_str() {
            "RSA" => KeyFamily::Rsa,
            "ECDSA" | "ECDH" => KeyFamily::Ec,
            other => KeyFamily::Other(other.to_string()),
        })
    }

    fn export(key: &KeyObject, blob_type: PCWSTR) -> windows::core::Result<Vec<u8>> {
        let mut len = 0u32;
        unsafe {
            NCryptExportKey(
                key.0,
                NCRYPT_KEY_HANDLE::default(),
                blob_type,
                None,
                None,
                &mut len,
                NCRYPT_FLAGS(0),
            )?;
        }
        let mut buffer = vec![0u8; len as usize];
        unsafe {
            NCryptExportKey(
                key.0,
                NCRYPT_KEY_HANDLE::default(),
                blob_type,
                None,
                Some(&mut buffer),
                &mut len,
                NCRYPT_FLAGS(0),
            )?;
        }
        buffer.truncate(len as usize);
        Ok(buffer)
    }
}

/// `BCRYPT_ECCKEY_BLOB` to `04 || X || Y [|| d]`
fn ecc_blob_to_x963(blob: &[u8], with_private: bool) -> CryptoResult<Vec<u8>> {
    let malformed = || {
        CryptoError::codec_error(
            "BCRYPT_ECCKEY_BLOB",
            "blob length does not match header",
            error_codes::KEY_DECODING_FAILED,
        )
    };
    if blob.len() < BCRYPT_ECCKEY_HEADER_LEN {
        return Err(malformed());
    }
    let cb_key = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    let fields = if with_private { 3 } else { 2 };
    if blob.len() != BCRYPT_ECCKEY_HEADER_LEN + fields * cb_key {
        return Err(malformed());
    }
    let mut x963 = Vec::with_capacity(1 + fields * cb_key);
    x963.push(0x04);
    x963.extend_from_slice(&blob[BCRYPT_ECCKEY_HEADER_LEN..]);
    Ok(x963)
}

impl KeyStore for CngKeyStore {
    type Handle = CngKeyHandle;

    fn store_name(&self) -> &str {
        STORE_NAME
    }

    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool> {
        Ok(self.open_key(id.name())?.is_some())
    }

    fn open(&self, id: &KeyIdentifier) -> CryptoResult<CngKeyHandle> {
        let key = self
            .open_key(id.name())?
            .ok_or_else(|| CryptoError::not_found(id.name(), &id.visibility().to_string()))?;
        let family = Self::algorithm_group(&key)?;
        Ok(CngKeyHandle {
            key,
            name: id.name().to_string(),
            visibility: id.visibility(),
            family,
        })
    }

    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<CngKeyHandle> {
        let algorithm_id = match algorithm.family {
            KeyFamily::Rsa => NCRYPT_RSA_ALGORITHM,
            KeyFamily::Ec => NCRYPT_ECDSA_P256_ALGORITHM,
            KeyFamily::Other(ref family) => {
                return Err(CryptoError::creation_failed(
                    id.name(),
                    STORE_NAME,
                    &format!("unsupported key family '{}'", family),
                ))
            }
        };

        let creation_error = |e: windows::core::Error| {
            if e.code() == NTE_EXISTS {
                CryptoError::already_exists(id.name())
            } else {
                CryptoError::creation_failed(id.name(), STORE_NAME, &e.message().to_string())
            }
        };

        let mut raw = NCRYPT_KEY_HANDLE::default();
        unsafe {
            NCryptCreatePersistedKey(
                self.provider.0,
                &mut raw,
                algorithm_id,
                &HSTRING::from(id.name()),
                CERT_KEY_SPEC(0),
                self.key_flags,
            )
        }
        .map_err(creation_error)?;
        let key = KeyObject(raw);

        if algorithm.family == KeyFamily::Rsa {
            Self::set_u32_property(&key, NCRYPT_LENGTH_PROPERTY, algorithm.bits)
                .map_err(creation_error)?;
        }
        let usage_flags = match usage {
            KeyUsage::Signing => ALLOW_SIGNING,
            KeyUsage::Decryption => ALLOW_DECRYPT,
        };
        Self::set_u32_property(&key, NCRYPT_KEY_USAGE_PROPERTY, usage_flags)
            .map_err(creation_error)?;
        if self.exportable {
            Self::set_u32_property(
                &key,
                NCRYPT_EXPORT_POLICY_PROPERTY,
                ALLOW_EXPORT | ALLOW_PLAINTEXT_EXPORT,
            )
            .map_err(creation_error)?;
        }

        // The container is only persisted here; a concurrent creator that
        // finalized first makes this fail with NTE_EXISTS.
        unsafe { NCryptFinalizeKey(key.0, self.key_flags) }.map_err(creation_error)?;

        log::debug!("Persisted {} key container '{}'", algorithm, id.name());

        Ok(CngKeyHandle {
            key,
            name: id.name().to_string(),
            visibility: id.visibility(),
            family: algorithm.family.clone(),
        })
    }

    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()> {
        let Some(key) = self.open_key(id.name())? else {
            return Ok(());
        };
        match unsafe { NCryptDeleteKey(key.into_raw(), 0) } {
            Ok(()) => Ok(()),
            Err(e) if e.code() == NTE_BAD_KEYSET => Ok(()),
            Err(e) => Err(store_failure("delete", &e, error_codes::STORE_DELETE_FAILED)),
        }
    }

    fn read_material(
        &self,
        handle: &CngKeyHandle,
        visibility: Visibility,
    ) -> CryptoResult<NativeKeyBlob> {
        if visibility == Visibility::Private && handle.visibility == Visibility::Public {
            return Err(CryptoError::not_exportable(&handle.name, STORE_NAME));
        }

        let export_error = |e: windows::core::Error| {
            let code = e.code();
            if visibility == Visibility::Private
                && (code == NTE_NOT_SUPPORTED || code == NTE_PERM || code == NTE_BAD_KEY_STATE)
            {
                CryptoError::not_exportable(&handle.name, STORE_NAME)
            } else {
                store_failure("export", &e, error_codes::STORE_QUERY_FAILED)
            }
        };

        match (&handle.family, visibility) {
            (KeyFamily::Rsa, Visibility::Public) => Ok(NativeKeyBlob::CngRsaPublicBlob(
                Self::export(&handle.key, BCRYPT_RSAPUBLIC_BLOB).map_err(export_error)?,
            )),
            (KeyFamily::Rsa, Visibility::Private) => Ok(NativeKeyBlob::CngRsaFullPrivateBlob(
                SecureBytes::from(
                    Self::export(&handle.key, BCRYPT_RSAFULLPRIVATE_BLOB).map_err(export_error)?,
                ),
            )),
            (KeyFamily::Ec, Visibility::Public) => {
                let blob = Self::export(&handle.key, BCRYPT_ECCPUBLIC_BLOB).map_err(export_error)?;
                Ok(NativeKeyBlob::EcPublicPoint(ecc_blob_to_x963(&blob, false)?))
            }
            (KeyFamily::Ec, Visibility::Private) => {
                let blob = SecureBytes::from(
                    Self::export(&handle.key, BCRYPT_ECCPRIVATE_BLOB).map_err(export_error)?,
                );
                Ok(NativeKeyBlob::EcX963Private(SecureBytes::from(
                    ecc_blob_to_x963(blob.as_bytes(), true)?,
                )))
            }
            (KeyFamily::Other(group), _) => Err(CryptoError::codec_error(
                "CNG key blob",
                &format!("unsupported algorithm group '{}'", group),
                error_codes::KEY_ENCODING_FAILED,
            )),
        }
    }
}
