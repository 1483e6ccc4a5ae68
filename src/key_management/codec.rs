/*!
 * Key Codec
 *
 * Translates the representation a native key store hands out into portable
 * external representations, and portable bytes back into usable RSA keys.
 *
 * RSA material is always exported as PKCS#1 DER (`RSAPublicKey` or
 * `RSAPrivateKey`) whatever the store, so keys exported on one platform can
 * be imported on any other.
 */

use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::key_management::store::KeyStore;
use crate::key_management::types::{ExportedKeyMaterial, KeyFormat, Visibility};
use crate::secure_memory::SecureBytes;

/// `BCRYPT_RSAPUBLIC_MAGIC` ("RSA1")
pub const CNG_RSA_PUBLIC_MAGIC: u32 = 0x3141_5352;

/// `BCRYPT_RSAPRIVATE_MAGIC` ("RSA2")
pub const CNG_RSA_PRIVATE_MAGIC: u32 = 0x3241_5352;

/// `BCRYPT_RSAFULLPRIVATE_MAGIC` ("RSA3")
pub const CNG_RSA_FULL_PRIVATE_MAGIC: u32 = 0x3341_5352;

const CNG_RSA_HEADER_LEN: usize = 24;

/// Length of an uncompressed P-256 point `04 || X || Y`
const P256_POINT_LEN: usize = 65;

/// Length of a P-256 X9.63 private key `04 || X || Y || K`
const P256_X963_PRIVATE_LEN: usize = 97;

/// Private RSA components read out of a store that exposes them individually
#[derive(Clone)]
pub struct RsaPrivateComponents {
    pub private_exponent: SecureBytes,
    pub prime1: SecureBytes,
    pub prime2: SecureBytes,
}

/// Key material in the form a native store hands it out
pub enum NativeKeyBlob {
    /// PKCS#1 `RSAPublicKey` DER (Keychain external representation)
    Pkcs1PublicDer(Vec<u8>),

    /// PKCS#1 `RSAPrivateKey` DER (Keychain external representation)
    Pkcs1PrivateDer(SecureBytes),

    /// `BCRYPT_RSAPUBLIC_BLOB`
    CngRsaPublicBlob(Vec<u8>),

    /// `BCRYPT_RSAFULLPRIVATE_BLOB`
    CngRsaFullPrivateBlob(SecureBytes),

    /// Big-endian RSA attributes (PKCS#11 `CKA_MODULUS` and friends)
    RsaComponents {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        private: Option<RsaPrivateComponents>,
    },

    /// An in-process private key
    RsaPrivate(RsaPrivateKey),

    /// An in-process public key
    RsaPublic(RsaPublicKey),

    /// Uncompressed SEC1 point
    EcPublicPoint(Vec<u8>),

    /// X9.63 private key `04 || X || Y || K`
    EcX963Private(SecureBytes),
}

struct CngRsaBlob {
    modulus: BigUint,
    public_exponent: BigUint,
    private: Option<(BigUint, BigUint, BigUint)>,
}

fn cng_error(cause: &str) -> CryptoError {
    CryptoError::codec_error("CNG RSA blob", cause, error_codes::KEY_DECODING_FAILED)
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Parse a `BCRYPT_RSAKEY_BLOB` header and the big-endian fields behind it.
fn parse_cng_rsa_blob(bytes: &[u8]) -> CryptoResult<CngRsaBlob> {
    if bytes.len() < CNG_RSA_HEADER_LEN {
        return Err(cng_error("blob shorter than header"));
    }

    let magic = read_u32_le(bytes, 0);
    let cb_public_exp = read_u32_le(bytes, 8) as usize;
    let cb_modulus = read_u32_le(bytes, 12) as usize;
    let cb_prime1 = read_u32_le(bytes, 16) as usize;
    let cb_prime2 = read_u32_le(bytes, 20) as usize;

    if cb_public_exp == 0 || cb_modulus == 0 {
        return Err(cng_error("empty modulus or exponent"));
    }

    let mut fields: Vec<usize> = vec![cb_public_exp, cb_modulus];
    match magic {
        CNG_RSA_PUBLIC_MAGIC => {}
        CNG_RSA_PRIVATE_MAGIC => fields.extend([cb_prime1, cb_prime2]),
        CNG_RSA_FULL_PRIVATE_MAGIC => fields.extend([
            cb_prime1, cb_prime2, cb_prime1, cb_prime2, cb_prime1, cb_modulus,
        ]),
        other => return Err(cng_error(&format!("unknown magic 0x{:08x}", other))),
    }

    let body_len = fields
        .iter()
        .try_fold(0usize, |acc, len| acc.checked_add(*len))
        .ok_or_else(|| cng_error("field lengths overflow"))?;
    if bytes.len() - CNG_RSA_HEADER_LEN != body_len {
        return Err(cng_error(&format!(
            "expected {} body bytes, found {}",
            body_len,
            bytes.len() - CNG_RSA_HEADER_LEN
        )));
    }

    let mut offset = CNG_RSA_HEADER_LEN;
    let mut values = Vec::with_capacity(fields.len());
    for len in fields {
        values.push(BigUint::from_bytes_be(&bytes[offset..offset + len]));
        offset += len;
    }

    let mut values = values.into_iter();
    let public_exponent = values.next().ok_or_else(|| cng_error("missing exponent"))?;
    let modulus = values.next().ok_or_else(|| cng_error("missing modulus"))?;
    let private = match magic {
        CNG_RSA_PUBLIC_MAGIC => None,
        _ => {
            let prime1 = values.next().ok_or_else(|| cng_error("missing prime1"))?;
            let prime2 = values.next().ok_or_else(|| cng_error("missing prime2"))?;
            // RSAPRIVATE blobs carry no private exponent; recover it from the primes.
            let private_exponent = match values.last() {
                Some(d) if magic == CNG_RSA_FULL_PRIVATE_MAGIC => d,
                _ => {
                    let key = RsaPrivateKey::from_p_q(
                        prime1.clone(),
                        prime2.clone(),
                        public_exponent.clone(),
                    )?;
                    key.d().clone()
                }
            };
            Some((private_exponent, prime1, prime2))
        }
    };

    Ok(CngRsaBlob {
        modulus,
        public_exponent,
        private,
    })
}

/// Serialize an RSA key into a `BCRYPT_RSAFULLPRIVATE_BLOB`.
///
/// Used to feed CNG-shaped material through the codec in tests and tooling.
pub fn cng_full_private_blob(key: &RsaPrivateKey) -> CryptoResult<SecureBytes> {
    let primes = key.primes();
    if primes.len() != 2 {
        return Err(CryptoError::codec_error(
            "CNG RSA blob",
            "multi-prime keys cannot be represented",
            error_codes::KEY_ENCODING_FAILED,
        ));
    }
    let modulus_len = key.size();
    let prime_len = (modulus_len + 1) / 2;
    let exponent = key.e().to_bytes_be();

    let dp = key
        .dp()
        .cloned()
        .ok_or_else(|| cng_error("missing CRT exponent"))?;
    let dq = key
        .dq()
        .cloned()
        .ok_or_else(|| cng_error("missing CRT exponent"))?;
    let qinv = key
        .crt_coefficient()
        .ok_or_else(|| cng_error("missing CRT coefficient"))?;

    let mut blob = Vec::with_capacity(CNG_RSA_HEADER_LEN + exponent.len() + 6 * modulus_len);
    blob.extend_from_slice(&CNG_RSA_FULL_PRIVATE_MAGIC.to_le_bytes());
    blob.extend_from_slice(&((modulus_len * 8) as u32).to_le_bytes());
    blob.extend_from_slice(&(exponent.len() as u32).to_le_bytes());
    blob.extend_from_slice(&(modulus_len as u32).to_le_bytes());
    blob.extend_from_slice(&(prime_len as u32).to_le_bytes());
    blob.extend_from_slice(&(prime_len as u32).to_le_bytes());
    blob.extend_from_slice(&exponent);
    for (value, len) in [
        (key.n(), modulus_len),
        (&primes[0], prime_len),
        (&primes[1], prime_len),
        (&dp, prime_len),
        (&dq, prime_len),
        (&qinv, prime_len),
        (key.d(), modulus_len),
    ] {
        let raw = value.to_bytes_be();
        if raw.len() > len {
            return Err(cng_error("component longer than its field"));
        }
        blob.extend(std::iter::repeat(0u8).take(len - raw.len()));
        blob.extend_from_slice(&raw);
    }
    Ok(SecureBytes::from(blob))
}

fn rsa_private_from_parts(
    modulus: BigUint,
    public_exponent: BigUint,
    private_exponent: BigUint,
    prime1: BigUint,
    prime2: BigUint,
) -> CryptoResult<RsaPrivateKey> {
    let key = RsaPrivateKey::from_components(
        modulus,
        public_exponent,
        private_exponent,
        vec![prime1, prime2],
    )?;
    key.validate()?;
    Ok(key)
}

fn encode_rsa_public(key: &RsaPublicKey) -> CryptoResult<ExportedKeyMaterial> {
    let der = key.to_pkcs1_der()?;
    Ok(ExportedKeyMaterial::public(
        der.as_bytes().to_vec(),
        KeyFormat::Pkcs1PublicDer,
    ))
}

fn encode_rsa_private(key: &RsaPrivateKey) -> CryptoResult<ExportedKeyMaterial> {
    let der = key.to_pkcs1_der()?;
    Ok(ExportedKeyMaterial::private(
        SecureBytes::new(der.as_bytes()),
        KeyFormat::Pkcs1PrivateDer,
    ))
}

fn check_ec_point(point: &[u8]) -> CryptoResult<()> {
    if point.len() != P256_POINT_LEN || point[0] != 0x04 {
        return Err(CryptoError::codec_error(
            "SEC1 point",
            &format!("expected {} byte uncompressed point", P256_POINT_LEN),
            error_codes::KEY_DECODING_FAILED,
        ));
    }
    Ok(())
}

fn check_ec_private(bytes: &[u8]) -> CryptoResult<()> {
    if bytes.len() != P256_X963_PRIVATE_LEN || bytes[0] != 0x04 {
        return Err(CryptoError::codec_error(
            "X9.63 private key",
            &format!("expected {} bytes", P256_X963_PRIVATE_LEN),
            error_codes::KEY_DECODING_FAILED,
        ));
    }
    Ok(())
}

/// A key reconstructed from portable bytes, ready for RSA primitives
#[derive(Clone)]
pub enum ImportedKey {
    Public(RsaPublicKey),
    Private(RsaPrivateKey),
}

impl std::fmt::Debug for ImportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_private() { "Private" } else { "Public" };
        write!(f, "ImportedKey::{}(RSA-{})", kind, self.bits())
    }
}

impl ImportedKey {
    pub fn is_private(&self) -> bool {
        matches!(self, ImportedKey::Private(_))
    }

    /// The public half of this key
    pub fn public_key(&self) -> RsaPublicKey {
        match self {
            ImportedKey::Public(key) => key.clone(),
            ImportedKey::Private(key) => key.to_public_key(),
        }
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.public_key().n().bits()
    }

    /// RSASSA-PKCS1-v1_5 signature over the SHA-256 digest of `message`
    pub fn sign(&self, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let ImportedKey::Private(key) = self else {
            return Err(CryptoError::invalid_parameter(
                "key",
                "a private key",
                "public key",
            ));
        };
        let digest = Sha256::digest(message);
        Ok(key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
    }

    /// Check an RSASSA-PKCS1-v1_5 SHA-256 signature
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(message);
        self.public_key()
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }

    /// RSAES-OAEP (SHA-256) encryption
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(self
            .public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)?)
    }

    /// RSAES-OAEP (SHA-256) decryption
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<SecureBytes> {
        let ImportedKey::Private(key) = self else {
            return Err(CryptoError::invalid_parameter(
                "key",
                "a private key",
                "public key",
            ));
        };
        Ok(SecureBytes::from(
            key.decrypt(Oaep::new::<Sha256>(), ciphertext)?,
        ))
    }
}

/// Converts between native store representations and portable bytes
pub struct KeyCodec;

impl KeyCodec {
    /// Export the public half of the key behind `handle`.
    ///
    /// Works for private handles too; the public half is derived.
    pub fn export_public<S: KeyStore + ?Sized>(
        store: &S,
        handle: &S::Handle,
    ) -> CryptoResult<ExportedKeyMaterial> {
        let blob = store.read_material(handle, Visibility::Public)?;
        Self::encode_public(blob)
    }

    /// Export the private half of the key behind `handle`.
    ///
    /// Fails with `NotExportable` when the store keeps private keys inside;
    /// that outcome is permanent for the key.
    pub fn export_private<S: KeyStore + ?Sized>(
        store: &S,
        handle: &S::Handle,
    ) -> CryptoResult<ExportedKeyMaterial> {
        let blob = store.read_material(handle, Visibility::Private)?;
        Self::encode_private(blob)
    }

    /// Export the half selected by `visibility`
    pub fn export<S: KeyStore + ?Sized>(
        store: &S,
        handle: &S::Handle,
        visibility: Visibility,
    ) -> CryptoResult<ExportedKeyMaterial> {
        match visibility {
            Visibility::Public => Self::export_public(store, handle),
            Visibility::Private => Self::export_private(store, handle),
        }
    }

    /// Encode the public half of any native blob
    pub fn encode_public(blob: NativeKeyBlob) -> CryptoResult<ExportedKeyMaterial> {
        match blob {
            NativeKeyBlob::Pkcs1PublicDer(der) => {
                let key = RsaPublicKey::from_pkcs1_der(&der)?;
                encode_rsa_public(&key)
            }
            NativeKeyBlob::Pkcs1PrivateDer(der) => {
                let key = RsaPrivateKey::from_pkcs1_der(der.as_bytes())?;
                encode_rsa_public(&key.to_public_key())
            }
            NativeKeyBlob::CngRsaPublicBlob(bytes) => {
                let parsed = parse_cng_rsa_blob(&bytes)?;
                encode_rsa_public(&RsaPublicKey::new(parsed.modulus, parsed.public_exponent)?)
            }
            NativeKeyBlob::CngRsaFullPrivateBlob(bytes) => {
                let parsed = parse_cng_rsa_blob(bytes.as_bytes())?;
                encode_rsa_public(&RsaPublicKey::new(parsed.modulus, parsed.public_exponent)?)
            }
            NativeKeyBlob::RsaComponents {
                modulus,
                public_exponent,
                ..
            } => encode_rsa_public(&RsaPublicKey::new(
                BigUint::from_bytes_be(&modulus),
                BigUint::from_bytes_be(&public_exponent),
            )?),
            NativeKeyBlob::RsaPrivate(key) => encode_rsa_public(&key.to_public_key()),
            NativeKeyBlob::RsaPublic(key) => encode_rsa_public(&key),
            NativeKeyBlob::EcPublicPoint(point) => {
                check_ec_point(&point)?;
                Ok(ExportedKeyMaterial::public(point, KeyFormat::Sec1PublicPoint))
            }
            NativeKeyBlob::EcX963Private(bytes) => {
                check_ec_private(bytes.as_bytes())?;
                Ok(ExportedKeyMaterial::public(
                    bytes.as_bytes()[..P256_POINT_LEN].to_vec(),
                    KeyFormat::Sec1PublicPoint,
                ))
            }
        }
    }

    /// Encode the private half of a native blob.
    ///
    /// Public-only blobs are rejected with a codec error; stores report
    /// `NotExportable` before handing one out for a private export.
    pub fn encode_private(blob: NativeKeyBlob) -> CryptoResult<ExportedKeyMaterial> {
        match blob {
            NativeKeyBlob::Pkcs1PrivateDer(der) => {
                let key = RsaPrivateKey::from_pkcs1_der(der.as_bytes())?;
                encode_rsa_private(&key)
            }
            NativeKeyBlob::CngRsaFullPrivateBlob(bytes) => {
                let parsed = parse_cng_rsa_blob(bytes.as_bytes())?;
                let (d, p, q) = parsed
                    .private
                    .ok_or_else(|| cng_error("public blob carries no private key"))?;
                let key = rsa_private_from_parts(parsed.modulus, parsed.public_exponent, d, p, q)?;
                encode_rsa_private(&key)
            }
            NativeKeyBlob::RsaComponents {
                modulus,
                public_exponent,
                private: Some(private),
            } => {
                let key = rsa_private_from_parts(
                    BigUint::from_bytes_be(&modulus),
                    BigUint::from_bytes_be(&public_exponent),
                    BigUint::from_bytes_be(private.private_exponent.as_bytes()),
                    BigUint::from_bytes_be(private.prime1.as_bytes()),
                    BigUint::from_bytes_be(private.prime2.as_bytes()),
                )?;
                encode_rsa_private(&key)
            }
            NativeKeyBlob::RsaPrivate(key) => encode_rsa_private(&key),
            NativeKeyBlob::EcX963Private(bytes) => {
                check_ec_private(bytes.as_bytes())?;
                Ok(ExportedKeyMaterial::private(bytes, KeyFormat::X963Private))
            }
            NativeKeyBlob::Pkcs1PublicDer(_)
            | NativeKeyBlob::CngRsaPublicBlob(_)
            | NativeKeyBlob::RsaComponents { private: None, .. }
            | NativeKeyBlob::RsaPublic(_)
            | NativeKeyBlob::EcPublicPoint(_) => Err(CryptoError::codec_error(
                "private key",
                "blob only carries a public key",
                error_codes::KEY_ENCODING_FAILED,
            )),
        }
    }

    /// Reconstruct a usable RSA key from portable bytes.
    ///
    /// Accepts PKCS#1 and PKCS#8 private keys, PKCS#1 public keys and SPKI.
    pub fn import(bytes: &[u8]) -> CryptoResult<ImportedKey> {
        if let Ok(key) = RsaPrivateKey::from_pkcs1_der(bytes) {
            return Ok(ImportedKey::Private(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(bytes) {
            return Ok(ImportedKey::Private(key));
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_der(bytes) {
            return Ok(ImportedKey::Public(key));
        }
        if let Ok(key) = RsaPublicKey::from_public_key_der(bytes) {
            return Ok(ImportedKey::Public(key));
        }
        Err(CryptoError::codec_error(
            "PKCS#1/PKCS#8/SPKI DER",
            "bytes are not a recognized RSA key encoding",
            error_codes::KEY_DECODING_FAILED,
        ))
    }

    /// Import exported material, checking it is RSA
    pub fn import_material(material: &ExportedKeyMaterial) -> CryptoResult<ImportedKey> {
        match material.format() {
            KeyFormat::Pkcs1PublicDer | KeyFormat::Pkcs1PrivateDer => {
                Self::import(material.as_bytes())
            }
            KeyFormat::Sec1PublicPoint | KeyFormat::X963Private => Err(CryptoError::codec_error(
                "RSA key",
                "EC material cannot be imported",
                error_codes::KEY_DECODING_FAILED,
            )),
        }
    }

    /// SHA-256 fingerprint of encoded key bytes, hex encoded
    pub fn fingerprint(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::store::test_keys;

    #[test]
    fn test_public_derived_from_private_blob() {
        let key = test_keys::rsa_1024(0);
        let from_private = KeyCodec::encode_public(NativeKeyBlob::RsaPrivate(key.clone())).unwrap();
        let from_public =
            KeyCodec::encode_public(NativeKeyBlob::RsaPublic(key.to_public_key())).unwrap();
        assert_eq!(from_private.as_bytes(), from_public.as_bytes());
        assert_eq!(from_private.visibility(), Visibility::Public);
        assert_eq!(from_private.format(), KeyFormat::Pkcs1PublicDer);
    }

    #[test]
    fn test_cng_full_private_blob_matches_pkcs1() {
        let key = test_keys::rsa_1024(1);
        let blob = cng_full_private_blob(&key).unwrap();

        let via_cng = KeyCodec::encode_private(NativeKeyBlob::CngRsaFullPrivateBlob(blob.clone()))
            .unwrap();
        let direct = KeyCodec::encode_private(NativeKeyBlob::RsaPrivate(key.clone())).unwrap();
        assert_eq!(via_cng.as_bytes(), direct.as_bytes());

        let public = KeyCodec::encode_public(NativeKeyBlob::CngRsaFullPrivateBlob(blob)).unwrap();
        let imported = KeyCodec::import(public.as_bytes()).unwrap();
        assert_eq!(imported.public_key(), key.to_public_key());
    }

    #[test]
    fn test_cng_public_blob_from_header() {
        let key = test_keys::rsa_1024(2);
        let full = cng_full_private_blob(&key).unwrap();
        let bytes = full.as_bytes();
        let cb_exp = read_u32_le(bytes, 8) as usize;
        let cb_mod = read_u32_le(bytes, 12) as usize;

        let mut public = Vec::new();
        public.extend_from_slice(&CNG_RSA_PUBLIC_MAGIC.to_le_bytes());
        public.extend_from_slice(&bytes[4..16]);
        public.extend_from_slice(&[0u8; 8]);
        public.extend_from_slice(&bytes[CNG_RSA_HEADER_LEN..CNG_RSA_HEADER_LEN + cb_exp + cb_mod]);

        let material = KeyCodec::encode_public(NativeKeyBlob::CngRsaPublicBlob(public.clone()))
            .unwrap();
        let expected = KeyCodec::encode_public(NativeKeyBlob::RsaPrivate(key)).unwrap();
        assert_eq!(material.as_bytes(), expected.as_bytes());

        let err = KeyCodec::encode_private(NativeKeyBlob::CngRsaPublicBlob(public)).unwrap_err();
        assert!(matches!(err, CryptoError::CodecError { .. }));
    }

    #[test]
    fn test_truncated_cng_blob_rejected() {
        let key = test_keys::rsa_1024(3);
        let blob = cng_full_private_blob(&key).unwrap();
        let truncated = SecureBytes::new(&blob.as_bytes()[..blob.len() - 1]);
        assert!(KeyCodec::encode_private(NativeKeyBlob::CngRsaFullPrivateBlob(truncated)).is_err());
        assert!(KeyCodec::encode_public(NativeKeyBlob::CngRsaPublicBlob(vec![0u8; 10])).is_err());
    }

    #[test]
    fn test_rsa_components_round_trip() {
        let key = test_keys::rsa_1024(4);
        let primes = key.primes();
        let blob = NativeKeyBlob::RsaComponents {
            modulus: key.n().to_bytes_be(),
            public_exponent: key.e().to_bytes_be(),
            private: Some(RsaPrivateComponents {
                private_exponent: SecureBytes::from(key.d().to_bytes_be()),
                prime1: SecureBytes::from(primes[0].to_bytes_be()),
                prime2: SecureBytes::from(primes[1].to_bytes_be()),
            }),
        };
        let material = KeyCodec::encode_private(blob).unwrap();
        let imported = KeyCodec::import_material(&material).unwrap();
        assert!(imported.is_private());
        assert_eq!(imported.public_key(), key.to_public_key());
    }

    #[test]
    fn test_import_accepts_spki_and_pkcs8() {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

        let key = test_keys::rsa_1024(5);
        let spki = key.to_public_key().to_public_key_der().unwrap();
        let pkcs8 = key.to_pkcs8_der().unwrap();

        assert!(!KeyCodec::import(spki.as_bytes()).unwrap().is_private());
        assert!(KeyCodec::import(pkcs8.as_bytes()).unwrap().is_private());
        assert!(KeyCodec::import(b"not a key").is_err());
    }

    #[test]
    fn test_sign_verify_and_oaep() {
        let key = test_keys::rsa_1024(6);
        let private = KeyCodec::encode_private(NativeKeyBlob::RsaPrivate(key.clone())).unwrap();
        let public = KeyCodec::encode_public(NativeKeyBlob::RsaPrivate(key)).unwrap();

        let signer = KeyCodec::import_material(&private).unwrap();
        let verifier = KeyCodec::import_material(&public).unwrap();

        let signature = signer.sign(b"state token").unwrap();
        assert!(verifier.verify(b"state token", &signature));
        assert!(!verifier.verify(b"other token", &signature));
        assert!(verifier.sign(b"state token").is_err());

        let ciphertext = verifier.encrypt(b"session").unwrap();
        assert_eq!(signer.decrypt(&ciphertext).unwrap().as_bytes(), b"session");
    }

    #[test]
    fn test_ec_material_passthrough() {
        let mut private = vec![0x04u8];
        private.extend_from_slice(&[7u8; 96]);
        let public = KeyCodec::encode_public(NativeKeyBlob::EcX963Private(SecureBytes::from(
            private.clone(),
        )))
        .unwrap();
        assert_eq!(public.format(), KeyFormat::Sec1PublicPoint);
        assert_eq!(public.as_bytes(), &private[..65]);
        assert!(KeyCodec::import_material(&public).is_err());

        assert!(KeyCodec::encode_public(NativeKeyBlob::EcPublicPoint(vec![0x02; 33])).is_err());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let fp = KeyCodec::fingerprint(b"abc");
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
