/*!
 * PKCS#11 Key Store
 *
 * Persists key pairs as token objects on a PKCS#11 module (SoftHSM, a
 * hardware HSM, a smart card). Each pair is two objects, public and private,
 * both labelled with the key name and sharing a random `CKA_ID` that binds
 * the halves together.
 *
 * Tokens do not enforce unique labels. A creator looks again after
 * generating its pair and destroys it if any other pair carries the label.
 * Readers that still meet duplicates treat the pair whose public key has the
 * smallest SHA-256 fingerprint as the key.
 */

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::{AuthPin, Ulong};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::key_management::codec::{NativeKeyBlob, RsaPrivateComponents};
use crate::key_management::config::{ProviderConfig, ProvisionerConfig};
use crate::key_management::store::{
    public_fingerprint, select_canonical, settle_creation, wrong_provider, CreationOutcome,
    KeyStore,
};
use crate::key_management::types::{
    KeyAlgorithmSpec, KeyFamily, KeyIdentifier, KeyUsage, Visibility,
};
use crate::secure_memory::SecureBytes;

const STORE_NAME: &str = "PKCS#11 token";

/// DER-encoded OID of NIST P-256 (1.2.840.10045.3.1.7)
const P256_OID: [u8; 10] = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

/// F4
const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

const PAIR_ID_LEN: usize = 16;

/// Handle to a key pair on the token
#[derive(Debug, Clone)]
pub struct Pkcs11KeyHandle {
    name: String,
    visibility: Visibility,
    key_type: KeyType,
    public: ObjectHandle,
    private: Option<ObjectHandle>,
}

impl Pkcs11KeyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// One public object on the token together with its private partner
struct StoredPair {
    key_type: KeyType,
    public: ObjectHandle,
    private: Option<ObjectHandle>,
}

/// Key store backed by a PKCS#11 token
pub struct Pkcs11KeyStore {
    // Keeps the module loaded for as long as the session lives
    _context: Pkcs11,
    session: Mutex<Session>,
    slot: Slot,
    exportable: bool,
}

fn store_failure(operation: &str, cause: impl std::fmt::Display, error_code: u32) -> CryptoError {
    CryptoError::store_error(operation, &cause.to_string(), STORE_NAME, error_code)
}

impl Pkcs11KeyStore {
    /// Load the module, pick a slot and open a read-write session.
    ///
    /// The slot is chosen by id, then by token label, then the first slot
    /// holding a token. A PIN, if given, logs the session in as user.
    pub fn connect(
        library_path: &str,
        slot_id: Option<u64>,
        token_label: Option<&str>,
        user_pin: Option<&Zeroizing<String>>,
        exportable: bool,
    ) -> CryptoResult<Self> {
        if !Path::new(library_path).exists() {
            return Err(store_failure(
                "connect",
                format!("PKCS#11 library not found: {}", library_path),
                error_codes::STORE_OPEN_FAILED,
            ));
        }

        log::info!("Initializing PKCS#11 library: {}", library_path);

        let context = Pkcs11::new(library_path).map_err(|e| {
            store_failure(
                "connect",
                format!("Failed to load PKCS#11 library: {}", e),
                error_codes::STORE_OPEN_FAILED,
            )
        })?;

        match context.initialize(CInitializeArgs::OsThreads) {
            Ok(()) | Err(Pkcs11Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(e) => {
                return Err(store_failure(
                    "connect",
                    format!("Failed to initialize PKCS#11 library: {}", e),
                    error_codes::STORE_OPEN_FAILED,
                ))
            }
        }

        let slots = context.get_slots_with_token().map_err(|e| {
            store_failure(
                "connect",
                format!("Failed to get slots: {}", e),
                error_codes::STORE_OPEN_FAILED,
            )
        })?;

        let slot = if let Some(slot_id) = slot_id {
            slots.into_iter().find(|s| s.id() == slot_id).ok_or_else(|| {
                store_failure(
                    "connect",
                    format!("Slot {} not found", slot_id),
                    error_codes::STORE_OPEN_FAILED,
                )
            })?
        } else if let Some(token_label) = token_label {
            slots
                .into_iter()
                .find(|slot| {
                    context
                        .get_token_info(*slot)
                        .map(|info| info.label().trim() == token_label.trim())
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    store_failure(
                        "connect",
                        format!("Token with label '{}' not found", token_label),
                        error_codes::STORE_OPEN_FAILED,
                    )
                })?
        } else {
            slots.into_iter().next().ok_or_else(|| {
                store_failure(
                    "connect",
                    "No slots with tokens found",
                    error_codes::STORE_OPEN_FAILED,
                )
            })?
        };

        log::info!("Using PKCS#11 slot: {}", slot.id());

        let session = context.open_rw_session(slot).map_err(|e| {
            store_failure(
                "connect",
                format!("Failed to open session: {}", e),
                error_codes::STORE_OPEN_FAILED,
            )
        })?;

        if let Some(pin) = user_pin {
            let auth_pin = AuthPin::new(pin.as_str().to_string());
            match session.login(UserType::User, Some(&auth_pin)) {
                Ok(()) | Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
                Err(e) => {
                    return Err(store_failure(
                        "login",
                        format!("Failed to login to token: {}", e),
                        error_codes::STORE_OPEN_FAILED,
                    ))
                }
            }
            log::info!("Logged in to PKCS#11 token");
        }

        Ok(Self {
            _context: context,
            session: Mutex::new(session),
            slot,
            exportable,
        })
    }

    pub fn from_config(config: &ProvisionerConfig) -> CryptoResult<Self> {
        match &config.provider {
            ProviderConfig::Pkcs11 {
                library_path,
                slot_id,
                token_label,
                user_pin,
            } => Self::connect(
                library_path,
                *slot_id,
                token_label.as_deref(),
                user_pin.as_ref(),
                config.exportable_private_keys,
            ),
            _ => Err(wrong_provider("pkcs11", config)),
        }
    }

    /// Numeric id of the slot this store talks to
    pub fn slot_id(&self) -> u64 {
        self.slot.id()
    }

    fn session(&self, operation: &str) -> CryptoResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| {
            store_failure(operation, "session lock poisoned", error_codes::STORE_LOCK_POISONED)
        })
    }

    fn find(
        session: &Session,
        class: ObjectClass,
        name: &str,
        pair_id: Option<&[u8]>,
    ) -> CryptoResult<Vec<ObjectHandle>> {
        let mut template = vec![
            Attribute::Token(true),
            Attribute::Class(class),
            Attribute::Label(name.as_bytes().to_vec()),
        ];
        if let Some(id) = pair_id {
            template.push(Attribute::Id(id.to_vec()));
        }
        session
            .find_objects(&template)
            .map_err(|e| store_failure("find_objects", e, error_codes::STORE_QUERY_FAILED))
    }

    fn attributes(
        session: &Session,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> CryptoResult<Vec<Attribute>> {
        session
            .get_attributes(object, types)
            .map_err(|e| store_failure("get_attributes", e, error_codes::STORE_QUERY_FAILED))
    }

    fn key_type(session: &Session, object: ObjectHandle) -> CryptoResult<KeyType> {
        Self::attributes(session, object, &[AttributeType::KeyType])?
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::KeyType(key_type) => Some(key_type),
                _ => None,
            })
            .ok_or_else(|| {
                store_failure("get_attributes", "object has no key type", error_codes::STORE_QUERY_FAILED)
            })
    }

    fn read_public(
        session: &Session,
        object: ObjectHandle,
        key_type: KeyType,
    ) -> CryptoResult<NativeKeyBlob> {
        if key_type == KeyType::EC {
            let point = Self::attributes(session, object, &[AttributeType::EcPoint])?
                .into_iter()
                .find_map(|attribute| match attribute {
                    Attribute::EcPoint(point) => Some(point),
                    _ => None,
                })
                .ok_or_else(|| {
                    store_failure("read_public", "missing EC point", error_codes::STORE_QUERY_FAILED)
                })?;
            return Ok(NativeKeyBlob::EcPublicPoint(unwrap_ec_point(point)));
        }

        let mut modulus = None;
        let mut public_exponent = None;
        for attribute in Self::attributes(
            session,
            object,
            &[AttributeType::Modulus, AttributeType::PublicExponent],
        )? {
            match attribute {
                Attribute::Modulus(value) => modulus = Some(value),
                Attribute::PublicExponent(value) => public_exponent = Some(value),
                _ => {}
            }
        }
        match (modulus, public_exponent) {
            (Some(modulus), Some(public_exponent)) => Ok(NativeKeyBlob::RsaComponents {
                modulus,
                public_exponent,
                private: None,
            }),
            _ => Err(store_failure(
                "read_public",
                "missing RSA public components",
                error_codes::STORE_QUERY_FAILED,
            )),
        }
    }

    /// Every public object labelled `name` with its key type and fingerprint
    fn labelled_publics(
        session: &Session,
        name: &str,
    ) -> CryptoResult<Vec<((ObjectHandle, KeyType), String)>> {
        let publics = Self::find(session, ObjectClass::PUBLIC_KEY, name, None)?;
        let mut candidates = Vec::with_capacity(publics.len());
        for public in publics {
            let key_type = Self::key_type(session, public)?;
            let fingerprint = public_fingerprint(Self::read_public(session, public, key_type)?)?;
            candidates.push(((public, key_type), fingerprint));
        }
        Ok(candidates)
    }

    /// All pairs labelled `name`, reduced to the canonical one
    fn canonical_pair(session: &Session, name: &str) -> CryptoResult<Option<StoredPair>> {
        let candidates = Self::labelled_publics(session, name)?;
        if candidates.len() > 1 {
            log::warn!(
                "{} key pairs share the label '{}' on the token",
                candidates.len(),
                name
            );
        }

        let Some(((public, key_type), _)) = select_canonical(candidates) else {
            return Ok(None);
        };

        let pair_id = Self::attributes(session, public, &[AttributeType::Id])?
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::Id(id) => Some(id),
                _ => None,
            });
        let private = match pair_id {
            Some(id) => Self::find(session, ObjectClass::PRIVATE_KEY, name, Some(&id))?
                .into_iter()
                .next(),
            None => None,
        };

        Ok(Some(StoredPair {
            key_type,
            public,
            private,
        }))
    }

    fn key_pair_templates(
        &self,
        name: &str,
        pair_id: &[u8],
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> (Mechanism<'static>, Vec<Attribute>, Vec<Attribute>) {
        let signing = usage == KeyUsage::Signing;
        let decryption = usage == KeyUsage::Decryption;

        let mut public_template = vec![
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(signing),
            Attribute::Label(name.as_bytes().to_vec()),
            Attribute::Id(pair_id.to_vec()),
        ];
        let mut private_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(!self.exportable),
            Attribute::Extractable(self.exportable),
            Attribute::Sign(signing),
            Attribute::Label(name.as_bytes().to_vec()),
            Attribute::Id(pair_id.to_vec()),
        ];

        let mechanism = if algorithm.family == KeyFamily::Ec {
            public_template.push(Attribute::EcParams(P256_OID.to_vec()));
            Mechanism::EccKeyPairGen
        } else {
            public_template.push(Attribute::Encrypt(decryption));
            public_template.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));
            public_template.push(Attribute::ModulusBits(Ulong::from(algorithm.bits as u64)));
            private_template.push(Attribute::Decrypt(decryption));
            Mechanism::RsaPkcsKeyPairGen
        };

        (mechanism, public_template, private_template)
    }

    fn destroy(session: &Session, object: ObjectHandle) -> CryptoResult<()> {
        match session.destroy_object(object) {
            Ok(()) | Err(Pkcs11Error::Pkcs11(RvError::ObjectHandleInvalid, _)) => Ok(()),
            Err(e) => Err(store_failure("destroy_object", e, error_codes::STORE_DELETE_FAILED)),
        }
    }
}

/// Strip the DER OCTET STRING some modules wrap around `CKA_EC_POINT`
fn unwrap_ec_point(point: Vec<u8>) -> Vec<u8> {
    match point.as_slice() {
        [0x04, len, rest @ ..] if *len as usize == rest.len() && rest.first() == Some(&0x04) => {
            rest.to_vec()
        }
        _ => point,
    }
}

impl KeyStore for Pkcs11KeyStore {
    type Handle = Pkcs11KeyHandle;

    fn store_name(&self) -> &str {
        STORE_NAME
    }

    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool> {
        let session = self.session("exists")?;
        Ok(!Self::find(&session, ObjectClass::PUBLIC_KEY, id.name(), None)?.is_empty())
    }

    fn open(&self, id: &KeyIdentifier) -> CryptoResult<Pkcs11KeyHandle> {
        let session = self.session("open")?;
        let not_found = || CryptoError::not_found(id.name(), &id.visibility().to_string());

        let pair = Self::canonical_pair(&session, id.name())?.ok_or_else(not_found)?;
        if id.visibility() == Visibility::Private && pair.private.is_none() {
            return Err(not_found());
        }

        Ok(Pkcs11KeyHandle {
            name: id.name().to_string(),
            visibility: id.visibility(),
            key_type: pair.key_type,
            public: pair.public,
            private: pair.private,
        })
    }

    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<Pkcs11KeyHandle> {
        if let KeyFamily::Other(family) = &algorithm.family {
            return Err(CryptoError::creation_failed(
                id.name(),
                STORE_NAME,
                &format!("unsupported key family '{}'", family),
            ));
        }

        let mut pair_id = [0u8; PAIR_ID_LEN];
        OsRng.fill_bytes(&mut pair_id);
        let (mechanism, public_template, private_template) =
            self.key_pair_templates(id.name(), &pair_id, algorithm, usage);

        let session = self.session("create")?;
        let (public, private) = session
            .generate_key_pair(&mechanism, &public_template, &private_template)
            .map_err(|e| CryptoError::creation_failed(id.name(), STORE_NAME, &e.to_string()))?;

        log::debug!("Generated {} key pair '{}' on the token", algorithm, id.name());

        let key_type = if algorithm.family == KeyFamily::Ec {
            KeyType::EC
        } else {
            KeyType::RSA
        };

        let ours = public_fingerprint(Self::read_public(&session, public, key_type)?)?;
        let found: Vec<String> = Self::labelled_publics(&session, id.name())?
            .into_iter()
            .map(|(_, fingerprint)| fingerprint)
            .collect();
        if settle_creation(&found, &ours) == CreationOutcome::Yield {
            log::info!(
                "Another pair is labelled '{}'; discarding the one just generated",
                id.name()
            );
            Self::destroy(&session, private)?;
            Self::destroy(&session, public)?;
            return Err(CryptoError::already_exists(id.name()));
        }

        Ok(Pkcs11KeyHandle {
            name: id.name().to_string(),
            visibility: id.visibility(),
            key_type,
            public,
            private: Some(private),
        })
    }

    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()> {
        let session = self.session("delete")?;
        let template = [
            Attribute::Token(true),
            Attribute::Label(id.name().as_bytes().to_vec()),
        ];
        let objects = session
            .find_objects(&template)
            .map_err(|e| store_failure("find_objects", e, error_codes::STORE_QUERY_FAILED))?;

        for object in objects {
            Self::destroy(&session, object)?;
        }
        Ok(())
    }

    fn read_material(
        &self,
        handle: &Pkcs11KeyHandle,
        visibility: Visibility,
    ) -> CryptoResult<NativeKeyBlob> {
        let session = self.session("read_material")?;

        if visibility == Visibility::Public {
            return Self::read_public(&session, handle.public, handle.key_type);
        }

        let private = match (handle.visibility, handle.private) {
            (Visibility::Private, Some(private)) => private,
            _ => return Err(CryptoError::not_exportable(&handle.name, STORE_NAME)),
        };

        let mut sensitive = true;
        let mut extractable = false;
        for attribute in Self::attributes(
            &session,
            private,
            &[AttributeType::Sensitive, AttributeType::Extractable],
        )? {
            match attribute {
                Attribute::Sensitive(value) => sensitive = value,
                Attribute::Extractable(value) => extractable = value,
                _ => {}
            }
        }
        if sensitive || !extractable {
            return Err(CryptoError::not_exportable(&handle.name, STORE_NAME));
        }

        if handle.key_type == KeyType::EC {
            let NativeKeyBlob::EcPublicPoint(point) =
                Self::read_public(&session, handle.public, handle.key_type)?
            else {
                return Err(store_failure(
                    "read_material",
                    "unexpected public key form",
                    error_codes::STORE_QUERY_FAILED,
                ));
            };
            let scalar = Self::attributes(&session, private, &[AttributeType::Value])?
                .into_iter()
                .find_map(|attribute| match attribute {
                    Attribute::Value(value) => Some(Zeroizing::new(value)),
                    _ => None,
                })
                .ok_or_else(|| {
                    store_failure("read_material", "missing EC scalar", error_codes::STORE_QUERY_FAILED)
                })?;
            let mut x963 = point;
            x963.extend_from_slice(&scalar);
            return Ok(NativeKeyBlob::EcX963Private(SecureBytes::from(x963)));
        }

        let mut modulus = None;
        let mut public_exponent = None;
        let mut private_exponent = None;
        let mut prime1 = None;
        let mut prime2 = None;
        for attribute in Self::attributes(
            &session,
            private,
            &[
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::PrivateExponent,
                AttributeType::Prime1,
                AttributeType::Prime2,
            ],
        )? {
            match attribute {
                Attribute::Modulus(value) => modulus = Some(value),
                Attribute::PublicExponent(value) => public_exponent = Some(value),
                Attribute::PrivateExponent(value) => private_exponent = Some(SecureBytes::from(value)),
                Attribute::Prime1(value) => prime1 = Some(SecureBytes::from(value)),
                Attribute::Prime2(value) => prime2 = Some(SecureBytes::from(value)),
                _ => {}
            }
        }

        match (modulus, public_exponent, private_exponent, prime1, prime2) {
            (Some(modulus), Some(public_exponent), Some(private_exponent), Some(prime1), Some(prime2)) => {
                Ok(NativeKeyBlob::RsaComponents {
                    modulus,
                    public_exponent,
                    private: Some(RsaPrivateComponents {
                        private_exponent,
                        prime1,
                        prime2,
                    }),
                })
            }
            _ => Err(CryptoError::not_exportable(&handle.name, STORE_NAME)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::codec::KeyCodec;
    use crate::key_management::config::DEFAULT_PKCS11_LIBRARY;

    // Token prepared with:
    //   softhsm2-util --init-token --free --label keyprov --pin 1234 --so-pin 0000
    fn test_store(exportable: bool) -> Option<Pkcs11KeyStore> {
        let library = std::env::var("KEYPROV_PKCS11_MODULE")
            .unwrap_or_else(|_| DEFAULT_PKCS11_LIBRARY.to_string());
        if !Path::new(&library).exists() {
            println!("Skipping PKCS#11 test: module not found at {}", library);
            return None;
        }
        let pin = Zeroizing::new(
            std::env::var("KEYPROV_PKCS11_PIN").unwrap_or_else(|_| "1234".to_string()),
        );
        match Pkcs11KeyStore::connect(&library, None, Some("keyprov"), Some(&pin), exportable) {
            Ok(store) => Some(store),
            Err(e) => {
                println!("PKCS#11 token unavailable (expected without a 'keyprov' token): {}", e);
                None
            }
        }
    }

    #[test]
    fn test_unwrap_ec_point() {
        let mut raw = vec![0x04u8];
        raw.extend_from_slice(&[9u8; 64]);
        let mut wrapped = vec![0x04u8, 65];
        wrapped.extend_from_slice(&raw);

        assert_eq!(unwrap_ec_point(wrapped), raw);
        assert_eq!(unwrap_ec_point(raw.clone()), raw);
    }

    #[test]
    fn test_connect_missing_library() {
        let result = Pkcs11KeyStore::connect("/nonexistent/libpkcs11.so", None, None, None, true);
        assert!(matches!(result, Err(CryptoError::StoreError { .. })));
    }

    #[test]
    fn test_token_round_trip() {
        let Some(store) = test_store(true) else {
            return;
        };
        let id = KeyIdentifier::new("keyprov-pkcs11-round-trip", Visibility::Private).unwrap();
        store.delete(&id).unwrap();

        let handle = store
            .create(&id, &KeyAlgorithmSpec::rsa(2048), KeyUsage::Signing)
            .unwrap();
        assert!(store.exists(&id).unwrap());

        let created = KeyCodec::export_private(&store, &handle).unwrap();
        let reopened = store.open(&id).unwrap();
        let public = KeyCodec::export_public(&store, &reopened).unwrap();

        let signer = KeyCodec::import_material(&created).unwrap();
        let verifier = KeyCodec::import_material(&public).unwrap();
        let signature = signer.sign(b"token").unwrap();
        assert!(verifier.verify(b"token", &signature));

        store.delete(&id).unwrap();
        assert!(!store.exists(&id).unwrap());
    }

    #[test]
    fn test_token_non_exportable() {
        let Some(store) = test_store(false) else {
            return;
        };
        let id = KeyIdentifier::new("keyprov-pkcs11-sealed", Visibility::Private).unwrap();
        store.delete(&id).unwrap();

        let handle = store
            .create(&id, &KeyAlgorithmSpec::rsa(2048), KeyUsage::Decryption)
            .unwrap();
        assert!(KeyCodec::export_public(&store, &handle).is_ok());
        assert!(matches!(
            KeyCodec::export_private(&store, &handle),
            Err(CryptoError::NotExportable { .. })
        ));

        store.delete(&id).unwrap();
    }
}
