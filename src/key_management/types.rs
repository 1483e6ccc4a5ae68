/*!
 * Key provisioning data model
 *
 * Identifiers, algorithm parameters and the exported key material that
 * crosses the provisioning boundary.
 */

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{error_codes, CryptoError, CryptoResult};
use crate::secure_memory::SecureBytes;

/// Smallest RSA modulus the provisioner will ask a store to generate.
pub const MIN_RSA_BITS: u32 = 1024;

/// Largest RSA modulus the provisioner will ask a store to generate.
pub const MAX_RSA_BITS: u32 = 16384;

/// Key size used when the caller does not choose one.
pub const DEFAULT_RSA_BITS: u32 = 2048;

/// Which half of a key pair an identifier refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// The public half, always derivable from the private half
    Public,

    /// The private half
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// The operation a key is allowed to perform, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    /// Sign-only key; the store refuses decryption with it
    Signing,

    /// Decrypt-only key; the store refuses signing with it
    Decryption,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyUsage::Signing => write!(f, "signing"),
            KeyUsage::Decryption => write!(f, "decryption"),
        }
    }
}

/// Stable `(name, visibility)` pair locating a key across calls and processes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyIdentifier {
    name: String,
    visibility: Visibility,
}

impl KeyIdentifier {
    /// Create an identifier. The name is the application tag stored with the
    /// key and must not be empty.
    pub fn new(name: impl Into<String>, visibility: Visibility) -> CryptoResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CryptoError::invalid_parameter(
                "name",
                "a non-empty key name",
                "empty string",
            ));
        }
        Ok(Self { name, visibility })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// The same name with the other half of the pair selected
    pub fn with_visibility(&self, visibility: Visibility) -> Self {
        Self {
            name: self.name.clone(),
            visibility,
        }
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.visibility)
    }
}

/// Asymmetric key family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    /// RSA, fully supported
    Rsa,

    /// Elliptic curve (NIST P-256), recognized by the stores that can
    /// generate it but not importable
    Ec,

    /// Any other family name; always rejected before reaching a store
    Other(String),
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFamily::Rsa => write!(f, "rsa"),
            KeyFamily::Ec => write!(f, "ec"),
            KeyFamily::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for KeyFamily {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "rsa" => KeyFamily::Rsa,
            "ec" | "ecdsa" => KeyFamily::Ec,
            other => KeyFamily::Other(other.to_string()),
        })
    }
}

/// Family and size of the key to generate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyAlgorithmSpec {
    pub family: KeyFamily,
    pub bits: u32,
}

impl KeyAlgorithmSpec {
    pub fn new(family: KeyFamily, bits: u32) -> Self {
        Self { family, bits }
    }

    /// RSA with the given modulus size
    pub fn rsa(bits: u32) -> Self {
        Self::new(KeyFamily::Rsa, bits)
    }

    /// EC on NIST P-256
    pub fn ec_p256() -> Self {
        Self::new(KeyFamily::Ec, 256)
    }

    /// Parse the algorithm by name, e.g. `("rsa", 2048)`.
    pub fn from_name(name: &str, bits: u32) -> Self {
        let family = match name.parse::<KeyFamily>() {
            Ok(family) => family,
            Err(never) => match never {},
        };
        Self::new(family, bits)
    }

    /// Check the algorithm can be handed to a key store.
    ///
    /// RSA sizes must lie in `MIN_RSA_BITS..=MAX_RSA_BITS` and be a whole
    /// number of bytes. EC is only accepted on P-256.
    pub fn validate(&self) -> CryptoResult<()> {
        match &self.family {
            KeyFamily::Rsa => {
                if self.bits < MIN_RSA_BITS || self.bits > MAX_RSA_BITS || self.bits % 8 != 0 {
                    return Err(CryptoError::unsupported_algorithm(
                        "rsa",
                        self.bits,
                        "key size out of range",
                        error_codes::UNSUPPORTED_KEY_SIZE,
                    ));
                }
                Ok(())
            }
            KeyFamily::Ec => {
                if self.bits != 256 {
                    return Err(CryptoError::unsupported_algorithm(
                        "ec",
                        self.bits,
                        "only P-256 is recognized",
                        error_codes::UNSUPPORTED_KEY_SIZE,
                    ));
                }
                Ok(())
            }
            KeyFamily::Other(name) => Err(CryptoError::unsupported_algorithm(
                name,
                self.bits,
                "family not supported",
                error_codes::UNSUPPORTED_ALGORITHM_FAMILY,
            )),
        }
    }
}

impl Default for KeyAlgorithmSpec {
    fn default() -> Self {
        Self::rsa(DEFAULT_RSA_BITS)
    }
}

impl fmt::Display for KeyAlgorithmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.family.to_string().to_uppercase(), self.bits)
    }
}

/// External representation of exported key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFormat {
    /// DER `RSAPublicKey` (RFC 8017 A.1.1)
    Pkcs1PublicDer,

    /// DER `RSAPrivateKey` (RFC 8017 A.1.2)
    Pkcs1PrivateDer,

    /// Uncompressed SEC1 / X9.63 point `04 || X || Y`
    Sec1PublicPoint,

    /// X9.63 private key `04 || X || Y || K`
    X963Private,
}

#[derive(Clone, PartialEq, Eq)]
enum MaterialBytes {
    Public(Vec<u8>),
    Private(SecureBytes),
}

/// Portable key bytes handed to the caller.
///
/// Produced per call and never cached by the provisioner. Private material is
/// zeroized when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedKeyMaterial {
    bytes: MaterialBytes,
    format: KeyFormat,
}

impl ExportedKeyMaterial {
    pub(crate) fn public(bytes: Vec<u8>, format: KeyFormat) -> Self {
        Self {
            bytes: MaterialBytes::Public(bytes),
            format,
        }
    }

    pub(crate) fn private(bytes: SecureBytes, format: KeyFormat) -> Self {
        Self {
            bytes: MaterialBytes::Private(bytes),
            format,
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self.bytes {
            MaterialBytes::Public(_) => Visibility::Public,
            MaterialBytes::Private(_) => Visibility::Private,
        }
    }

    pub fn format(&self) -> KeyFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            MaterialBytes::Public(bytes) => bytes,
            MaterialBytes::Private(bytes) => bytes.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Debug for ExportedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ExportedKeyMaterial");
        s.field("visibility", &self.visibility())
            .field("format", &self.format);
        match &self.bytes {
            MaterialBytes::Public(bytes) => s.field("bytes", &hex::encode(bytes)),
            MaterialBytes::Private(bytes) => s.field("bytes", bytes),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rejects_empty_name() {
        let result = KeyIdentifier::new("", Visibility::Private);
        assert!(matches!(result, Err(CryptoError::InvalidParameter { .. })));
    }

    #[test]
    fn test_identifier_display() {
        let id = KeyIdentifier::new("oauth-signing", Visibility::Public).unwrap();
        assert_eq!(id.to_string(), "oauth-signing (public)");
        assert_eq!(id.with_visibility(Visibility::Private).visibility(), Visibility::Private);
    }

    #[test]
    fn test_family_from_name() {
        assert_eq!(KeyAlgorithmSpec::from_name("RSA", 2048).family, KeyFamily::Rsa);
        assert_eq!(KeyAlgorithmSpec::from_name("ec", 256).family, KeyFamily::Ec);
        assert_eq!(
            KeyAlgorithmSpec::from_name("dsa", 2048).family,
            KeyFamily::Other("dsa".to_string())
        );
    }

    #[test]
    fn test_validate_rsa_sizes() {
        assert!(KeyAlgorithmSpec::rsa(2048).validate().is_ok());
        assert!(KeyAlgorithmSpec::rsa(1024).validate().is_ok());
        assert!(KeyAlgorithmSpec::rsa(512).validate().is_err());
        assert!(KeyAlgorithmSpec::rsa(2047).validate().is_err());
        assert!(KeyAlgorithmSpec::rsa(32768).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_other_families() {
        let err = KeyAlgorithmSpec::from_name("dsa", 2048).validate().unwrap_err();
        assert_eq!(err.error_code(), error_codes::UNSUPPORTED_ALGORITHM_FAMILY);
        assert!(KeyAlgorithmSpec::ec_p256().validate().is_ok());
        assert!(KeyAlgorithmSpec::new(KeyFamily::Ec, 384).validate().is_err());
    }

    #[test]
    fn test_private_material_debug_is_redacted() {
        let material = ExportedKeyMaterial::private(
            SecureBytes::new(&[0xde, 0xad]),
            KeyFormat::Pkcs1PrivateDer,
        );
        assert!(!format!("{:?}", material).contains("dead"));
        let public = ExportedKeyMaterial::public(vec![0xde, 0xad], KeyFormat::Pkcs1PublicDer);
        assert!(format!("{:?}", public).contains("dead"));
        assert_eq!(public.visibility(), Visibility::Public);
    }
}
