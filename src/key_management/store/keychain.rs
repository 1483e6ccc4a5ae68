/*!
 * Keychain Key Store (macOS / iOS)
 *
 * Persists key pairs as two permanent keychain items, public and private,
 * both carrying the key name as their application tag and label.
 *
 * The keychain does not make the tag unique. A creator looks again after
 * generating its pair and deletes it if any other pair carries the tag.
 * Readers that still meet duplicates settle on the pair whose public key has
 * the smallest SHA-256 fingerprint.
 */

use std::ptr;

use core_foundation::array::{CFArray, CFArrayRef};
use core_foundation::base::{CFType, CFTypeRef, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::data::CFData;
use core_foundation::dictionary::CFDictionary;
use core_foundation::error::CFError;
use core_foundation::number::CFNumber;
use core_foundation::string::{CFString, CFStringRef};
use core_foundation_sys::base::OSStatus;
use core_foundation_sys::error::CFErrorRef;
use security_framework::key::SecKey;
use security_framework_sys::base::{errSecDuplicateItem, errSecItemNotFound, errSecSuccess, SecKeyRef};
use security_framework_sys::item::{
    kSecAttrAccessGroup, kSecAttrApplicationTag, kSecAttrCanDecrypt, kSecAttrCanEncrypt,
    kSecAttrCanSign, kSecAttrCanVerify, kSecAttrIsExtractable, kSecAttrIsPermanent,
    kSecAttrKeyClass, kSecAttrKeyClassPrivate, kSecAttrKeyClassPublic, kSecAttrKeySizeInBits,
    kSecAttrKeyType, kSecAttrKeyTypeECSECPrimeRandom, kSecAttrKeyTypeRSA, kSecAttrLabel,
    kSecClass, kSecClassKey, kSecMatchLimit, kSecMatchLimitAll, kSecPrivateKeyAttrs,
    kSecPublicKeyAttrs, kSecReturnRef, kSecValueRef,
};
use security_framework_sys::key::SecKeyCreateRandomKey;
use security_framework_sys::keychain_item::{SecItemCopyMatching, SecItemDelete};

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::key_management::codec::NativeKeyBlob;
use crate::key_management::config::{ProviderConfig, ProvisionerConfig};
use crate::key_management::store::{
    public_fingerprint, select_canonical, settle_creation, wrong_provider, CreationOutcome,
    KeyStore,
};
use crate::key_management::types::{
    KeyAlgorithmSpec, KeyFamily, KeyIdentifier, KeyUsage, Visibility,
};
use crate::secure_memory::SecureBytes;

const STORE_NAME: &str = "Keychain";

/// Upper bound on delete passes for one tag
const MAX_DELETE_PASSES: usize = 64;

fn attr(constant: CFStringRef) -> CFString {
    unsafe { CFString::wrap_under_get_rule(constant) }
}

fn string_value(constant: CFStringRef) -> CFType {
    attr(constant).as_CFType()
}

fn bool_value(value: bool) -> CFType {
    if value {
        CFBoolean::true_value().as_CFType()
    } else {
        CFBoolean::false_value().as_CFType()
    }
}

fn dictionary(pairs: Vec<(CFString, CFType)>) -> CFDictionary<CFString, CFType> {
    CFDictionary::from_CFType_pairs(&pairs)
}

fn status_error(operation: &str, status: OSStatus) -> CryptoError {
    CryptoError::store_error(
        operation,
        &format!("OSStatus {}", status),
        STORE_NAME,
        error_codes::STORE_QUERY_FAILED,
    )
}

fn take_error(error: CFErrorRef) -> Option<CFError> {
    if error.is_null() {
        None
    } else {
        Some(unsafe { CFError::wrap_under_create_rule(error) })
    }
}

/// External representation: PKCS#1 DER for RSA, X9.63 bytes for EC
fn external_representation(key: &SecKey) -> Option<Vec<u8>> {
    key.external_representation().map(|data| data.bytes().to_vec())
}

fn public_key_of(key: &SecKey) -> CryptoResult<SecKey> {
    key.public_key().ok_or_else(|| {
        CryptoError::store_error(
            "copy_public_key",
            "key has no public half",
            STORE_NAME,
            error_codes::STORE_QUERY_FAILED,
        )
    })
}

fn public_blob(public: &SecKey) -> CryptoResult<NativeKeyBlob> {
    let bytes = external_representation(public).ok_or_else(|| {
        CryptoError::store_error(
            "export_public",
            "public key has no external representation",
            STORE_NAME,
            error_codes::STORE_QUERY_FAILED,
        )
    })?;
    Ok(classify_public(bytes))
}

fn classify_public(bytes: Vec<u8>) -> NativeKeyBlob {
    // RSA keys externalize as a DER SEQUENCE, EC keys as an uncompressed point
    if bytes.first() == Some(&0x04) {
        NativeKeyBlob::EcPublicPoint(bytes)
    } else {
        NativeKeyBlob::Pkcs1PublicDer(bytes)
    }
}

/// Handle to a keychain item
pub struct KeychainKeyHandle {
    key: SecKey,
    name: String,
    visibility: Visibility,
}

impl KeychainKeyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// Key store backed by the Apple Keychain
pub struct KeychainKeyStore {
    access_group: Option<String>,
    exportable: bool,
}

impl KeychainKeyStore {
    pub fn new(access_group: Option<String>, exportable: bool) -> Self {
        Self {
            access_group,
            exportable,
        }
    }

    pub fn from_config(config: &ProvisionerConfig) -> CryptoResult<Self> {
        match &config.provider {
            ProviderConfig::Keychain { access_group } => {
                Ok(Self::new(access_group.clone(), config.exportable_private_keys))
            }
            _ => Err(wrong_provider("keychain", config)),
        }
    }

    fn tag(name: &str) -> CFType {
        CFData::from_buffer(name.as_bytes()).as_CFType()
    }

    fn base_query(&self, name: &str) -> Vec<(CFString, CFType)> {
        let mut query = vec![
            (attr(unsafe { kSecClass }), string_value(unsafe { kSecClassKey })),
            (attr(unsafe { kSecAttrApplicationTag }), Self::tag(name)),
        ];
        if let Some(group) = &self.access_group {
            query.push((
                attr(unsafe { kSecAttrAccessGroup }),
                CFString::new(group).as_CFType(),
            ));
        }
        query
    }

    /// Every item of one key class carrying the tag
    fn find_all(&self, name: &str, key_class: CFStringRef) -> CryptoResult<Vec<SecKey>> {
        let mut query = self.base_query(name);
        query.push((attr(unsafe { kSecAttrKeyClass }), string_value(key_class)));
        query.push((attr(unsafe { kSecReturnRef }), bool_value(true)));
        query.push((
            attr(unsafe { kSecMatchLimit }),
            string_value(unsafe { kSecMatchLimitAll }),
        ));
        let query = dictionary(query);

        let mut result: CFTypeRef = ptr::null();
        let status = unsafe { SecItemCopyMatching(query.as_concrete_TypeRef(), &mut result) };
        match status {
            errSecSuccess => {}
            errSecItemNotFound => return Ok(Vec::new()),
            other => return Err(status_error("find", other)),
        }
        if result.is_null() {
            return Ok(Vec::new());
        }

        let items = unsafe { CFArray::<CFType>::wrap_under_create_rule(result as CFArrayRef) };
        Ok(items
            .iter()
            .filter(|item| item.type_of() == SecKey::type_id())
            .map(|item| unsafe { SecKey::wrap_under_get_rule(item.as_CFTypeRef() as SecKeyRef) })
            .collect())
    }

    /// Every private item carrying the tag, with its public fingerprint
    fn tagged_privates(&self, name: &str) -> CryptoResult<Vec<(SecKey, String)>> {
        let privates = self.find_all(name, unsafe { kSecAttrKeyClassPrivate })?;
        let mut candidates = Vec::with_capacity(privates.len());
        for private in privates {
            let public = public_key_of(&private)?;
            let fingerprint = public_fingerprint(public_blob(&public)?)?;
            candidates.push((private, fingerprint));
        }
        Ok(candidates)
    }

    /// The canonical private item for `name`, with its public fingerprint
    fn canonical_private(&self, name: &str) -> CryptoResult<Option<(SecKey, String)>> {
        let candidates = self.tagged_privates(name)?;
        if candidates.len() > 1 {
            log::warn!("{} keychain items share the tag '{}'", candidates.len(), name);
        }
        Ok(select_canonical(candidates))
    }

    fn delete_item(item: &SecKey) -> CryptoResult<()> {
        let query = dictionary(vec![(
            attr(unsafe { kSecValueRef }),
            item.as_CFType(),
        )]);
        match unsafe { SecItemDelete(query.as_concrete_TypeRef()) } {
            errSecSuccess | errSecItemNotFound => Ok(()),
            other => Err(status_error("delete", other)),
        }
    }

    /// Remove a pair this store just created and lost with
    fn discard_pair(&self, name: &str, private: &SecKey) -> CryptoResult<()> {
        let ours = external_representation(&public_key_of(private)?);
        Self::delete_item(private)?;
        for public in self.find_all(name, unsafe { kSecAttrKeyClassPublic })? {
            if ours.is_some() && external_representation(&public) == ours {
                Self::delete_item(&public)?;
            }
        }
        Ok(())
    }

    fn creation_attributes(
        &self,
        name: &str,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CFDictionary<CFString, CFType> {
        let signing = usage == KeyUsage::Signing;
        let decryption = usage == KeyUsage::Decryption;

        let private_attributes = dictionary(vec![
            (attr(unsafe { kSecAttrIsPermanent }), bool_value(true)),
            (attr(unsafe { kSecAttrApplicationTag }), Self::tag(name)),
            (attr(unsafe { kSecAttrLabel }), CFString::new(name).as_CFType()),
            (attr(unsafe { kSecAttrCanSign }), bool_value(signing)),
            (attr(unsafe { kSecAttrCanDecrypt }), bool_value(decryption)),
            (attr(unsafe { kSecAttrIsExtractable }), bool_value(self.exportable)),
        ]);
        let public_attributes = dictionary(vec![
            (attr(unsafe { kSecAttrIsPermanent }), bool_value(true)),
            (attr(unsafe { kSecAttrApplicationTag }), Self::tag(name)),
            (attr(unsafe { kSecAttrLabel }), CFString::new(name).as_CFType()),
            (attr(unsafe { kSecAttrCanVerify }), bool_value(signing)),
            (attr(unsafe { kSecAttrCanEncrypt }), bool_value(decryption)),
        ]);

        let key_type = match algorithm.family {
            KeyFamily::Ec => unsafe { kSecAttrKeyTypeECSECPrimeRandom },
            _ => unsafe { kSecAttrKeyTypeRSA },
        };

        let mut attributes = vec![
            (attr(unsafe { kSecAttrKeyType }), string_value(key_type)),
            (
                attr(unsafe { kSecAttrKeySizeInBits }),
                CFNumber::from(algorithm.bits as i32).as_CFType(),
            ),
            (attr(unsafe { kSecAttrIsPermanent }), bool_value(true)),
            (attr(unsafe { kSecPrivateKeyAttrs }), private_attributes.as_CFType()),
            (attr(unsafe { kSecPublicKeyAttrs }), public_attributes.as_CFType()),
        ];
        if let Some(group) = &self.access_group {
            attributes.push((
                attr(unsafe { kSecAttrAccessGroup }),
                CFString::new(group).as_CFType(),
            ));
        }
        dictionary(attributes)
    }
}

impl KeyStore for KeychainKeyStore {
    type Handle = KeychainKeyHandle;

    fn store_name(&self) -> &str {
        STORE_NAME
    }

    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool> {
        Ok(!self
            .find_all(id.name(), unsafe { kSecAttrKeyClassPrivate })?
            .is_empty())
    }

    fn open(&self, id: &KeyIdentifier) -> CryptoResult<KeychainKeyHandle> {
        let (private, _) = self
            .canonical_private(id.name())?
            .ok_or_else(|| CryptoError::not_found(id.name(), &id.visibility().to_string()))?;
        let key = match id.visibility() {
            Visibility::Private => private,
            Visibility::Public => public_key_of(&private)?,
        };
        Ok(KeychainKeyHandle {
            key,
            name: id.name().to_string(),
            visibility: id.visibility(),
        })
    }

    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<KeychainKeyHandle> {
        if let KeyFamily::Other(family) = &algorithm.family {
            return Err(CryptoError::creation_failed(
                id.name(),
                STORE_NAME,
                &format!("unsupported key family '{}'", family),
            ));
        }

        let attributes = self.creation_attributes(id.name(), algorithm, usage);
        let mut error: CFErrorRef = ptr::null_mut();
        let raw = unsafe { SecKeyCreateRandomKey(attributes.as_concrete_TypeRef(), &mut error) };
        if raw.is_null() {
            return Err(match take_error(error) {
                Some(e) if e.code() as OSStatus == errSecDuplicateItem => {
                    CryptoError::already_exists(id.name())
                }
                Some(e) => {
                    CryptoError::creation_failed(id.name(), STORE_NAME, &e.description().to_string())
                }
                None => CryptoError::creation_failed(id.name(), STORE_NAME, "no key returned"),
            });
        }
        let private = unsafe { SecKey::wrap_under_create_rule(raw) };
        log::debug!("Created {} keychain items '{}'", algorithm, id.name());

        let ours = public_fingerprint(public_blob(&public_key_of(&private)?)?)?;
        let found: Vec<String> = self
            .tagged_privates(id.name())?
            .into_iter()
            .map(|(_, fingerprint)| fingerprint)
            .collect();
        if settle_creation(&found, &ours) == CreationOutcome::Yield {
            log::info!(
                "Another pair is tagged '{}'; discarding the items just created",
                id.name()
            );
            self.discard_pair(id.name(), &private)?;
            return Err(CryptoError::already_exists(id.name()));
        }

        let key = match id.visibility() {
            Visibility::Private => private,
            Visibility::Public => public_key_of(&private)?,
        };
        Ok(KeychainKeyHandle {
            key,
            name: id.name().to_string(),
            visibility: id.visibility(),
        })
    }

    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()> {
        let query = dictionary(self.base_query(id.name()));
        for _ in 0..MAX_DELETE_PASSES {
            match unsafe { SecItemDelete(query.as_concrete_TypeRef()) } {
                errSecSuccess => continue,
                errSecItemNotFound => return Ok(()),
                other => return Err(status_error("delete", other)),
            }
        }
        Err(CryptoError::store_error(
            "delete",
            &format!("items tagged '{}' keep reappearing", id.name()),
            STORE_NAME,
            error_codes::STORE_DELETE_FAILED,
        ))
    }

    fn read_material(
        &self,
        handle: &KeychainKeyHandle,
        visibility: Visibility,
    ) -> CryptoResult<NativeKeyBlob> {
        match (visibility, handle.visibility) {
            (Visibility::Public, Visibility::Public) => public_blob(&handle.key),
            (Visibility::Public, Visibility::Private) => public_blob(&public_key_of(&handle.key)?),
            (Visibility::Private, Visibility::Public) => {
                Err(CryptoError::not_exportable(&handle.name, STORE_NAME))
            }
            (Visibility::Private, Visibility::Private) => {
                let bytes = external_representation(&handle.key).ok_or_else(|| {
                    log::debug!("Keychain refused export of '{}'", handle.name);
                    CryptoError::not_exportable(&handle.name, STORE_NAME)
                })?;
                let bytes = SecureBytes::from(bytes);
                if bytes.as_bytes().first() == Some(&0x04) {
                    Ok(NativeKeyBlob::EcX963Private(bytes))
                } else {
                    Ok(NativeKeyBlob::Pkcs1PrivateDer(bytes))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::codec::KeyCodec;

    #[test]
    fn test_classify_public() {
        assert!(matches!(
            classify_public(vec![0x04, 1, 2]),
            NativeKeyBlob::EcPublicPoint(_)
        ));
        assert!(matches!(
            classify_public(vec![0x30, 0x82]),
            NativeKeyBlob::Pkcs1PublicDer(_)
        ));
    }

    #[test]
    fn test_ephemeral_key_public_half() {
        let attributes = dictionary(vec![
            (attr(unsafe { kSecAttrKeyType }), string_value(unsafe { kSecAttrKeyTypeRSA })),
            (attr(unsafe { kSecAttrKeySizeInBits }), CFNumber::from(1024).as_CFType()),
            (attr(unsafe { kSecAttrIsPermanent }), bool_value(false)),
        ]);
        let mut error: CFErrorRef = ptr::null_mut();
        let raw = unsafe { SecKeyCreateRandomKey(attributes.as_concrete_TypeRef(), &mut error) };
        assert!(!raw.is_null(), "{:?}", take_error(error));
        let private = unsafe { SecKey::wrap_under_create_rule(raw) };

        let public = public_key_of(&private).unwrap();
        let blob = public_blob(&public).unwrap();
        assert!(matches!(blob, NativeKeyBlob::Pkcs1PublicDer(_)));

        let material = KeyCodec::encode_public(blob).unwrap();
        let private_der = external_representation(&private).unwrap();
        let imported = KeyCodec::import(&private_der).unwrap();
        assert_eq!(
            KeyCodec::import(material.as_bytes()).unwrap().public_key(),
            imported.public_key()
        );
    }

    // Touches the login keychain; run explicitly with --ignored
    #[test]
    #[ignore]
    fn test_keychain_round_trip() {
        let store = KeychainKeyStore::new(None, true);
        let id = KeyIdentifier::new("keyprov-keychain-round-trip", Visibility::Private).unwrap();
        store.delete(&id).unwrap();

        let handle = store
            .create(&id, &KeyAlgorithmSpec::rsa(2048), KeyUsage::Signing)
            .unwrap();
        let private = KeyCodec::export_private(&store, &handle).unwrap();
        let public = KeyCodec::export_public(
            &store,
            &store.open(&id.with_visibility(Visibility::Public)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            KeyCodec::import_material(&private).unwrap().public_key(),
            KeyCodec::import_material(&public).unwrap().public_key()
        );

        store.delete(&id).unwrap();
        assert!(!store.exists(&id).unwrap());
    }
}
