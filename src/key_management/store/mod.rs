/*!
 * Platform Key Stores
 *
 * A key store persists asymmetric key pairs under a caller-chosen name and
 * hands out opaque handles to them. Exactly one native store is compiled in
 * for each host:
 *
 * - Windows: CNG key storage provider, one persistent container per name
 * - macOS / iOS: Keychain, one item per half tagged with the name
 * - everything else: a PKCS#11 token, one object per half labelled with the name
 *
 * The in-memory store is available everywhere and backs the tests.
 *
 * Stores that cannot make names unique (PKCS#11, Keychain) check right after
 * inserting a pair: a creator that finds any other pair under the name
 * deletes its own and reports `AlreadyExists`.
 */

use std::sync::Arc;

use crate::error::{CryptoError, CryptoResult};
use crate::key_management::codec::{KeyCodec, NativeKeyBlob};
use crate::key_management::config::ProvisionerConfig;
use crate::key_management::types::{KeyAlgorithmSpec, KeyIdentifier, KeyUsage, Visibility};

pub mod memory;
pub mod pkcs11;

#[cfg(windows)]
pub mod cng;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub mod keychain;

pub use memory::{MemoryKeyHandle, MemoryKeyStore};
pub use pkcs11::{Pkcs11KeyHandle, Pkcs11KeyStore};

#[cfg(windows)]
pub use cng::{CngKeyHandle, CngKeyStore};

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use keychain::{KeychainKeyHandle, KeychainKeyStore};

/// The native key store for the host platform
#[cfg(windows)]
pub type PlatformKeyStore = CngKeyStore;

/// The native key store for the host platform
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub type PlatformKeyStore = KeychainKeyStore;

/// The native key store for the host platform
#[cfg(not(any(windows, target_os = "macos", target_os = "ios")))]
pub type PlatformKeyStore = Pkcs11KeyStore;

/// Uniform capability set over a native key store.
///
/// Stores are not atomic across calls. `exists` followed by `open` may see
/// the key vanish, and `create` may lose to a concurrent creator; those two
/// outcomes surface as `NotFound` and `AlreadyExists` and nothing else does.
pub trait KeyStore: Send + Sync {
    /// Opaque reference to one stored key. Dropping it releases any native
    /// resources; it is never cached across provisioning calls.
    type Handle;

    /// Human-readable store name used in errors and logs
    fn store_name(&self) -> &str;

    /// Whether a key is stored under the identifier's name
    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool>;

    /// Obtain a handle to an existing key.
    ///
    /// Fails with `NotFound` if the key is absent, including when it was
    /// deleted after a successful `exists`.
    fn open(&self, id: &KeyIdentifier) -> CryptoResult<Self::Handle>;

    /// Generate and persist a new key pair under the identifier's name.
    ///
    /// Fails with `AlreadyExists` if another creator got there first, and
    /// with `CreationFailed` for any other refusal.
    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<Self::Handle>;

    /// Remove every stored half under the identifier's name.
    ///
    /// Deleting an absent key succeeds.
    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()>;

    /// Read the native representation of one half of the key behind `handle`.
    ///
    /// Asking a store that keeps private keys inside for the private half
    /// fails with `NotExportable`.
    fn read_material(&self, handle: &Self::Handle, visibility: Visibility)
        -> CryptoResult<NativeKeyBlob>;
}

impl<S: KeyStore + ?Sized> KeyStore for Arc<S> {
    type Handle = S::Handle;

    fn store_name(&self) -> &str {
        (**self).store_name()
    }

    fn exists(&self, id: &KeyIdentifier) -> CryptoResult<bool> {
        (**self).exists(id)
    }

    fn open(&self, id: &KeyIdentifier) -> CryptoResult<Self::Handle> {
        (**self).open(id)
    }

    fn create(
        &self,
        id: &KeyIdentifier,
        algorithm: &KeyAlgorithmSpec,
        usage: KeyUsage,
    ) -> CryptoResult<Self::Handle> {
        (**self).create(id, algorithm, usage)
    }

    fn delete(&self, id: &KeyIdentifier) -> CryptoResult<()> {
        (**self).delete(id)
    }

    fn read_material(
        &self,
        handle: &Self::Handle,
        visibility: Visibility,
    ) -> CryptoResult<NativeKeyBlob> {
        (**self).read_material(handle, visibility)
    }
}

/// Open the native store for this host from `config`.
///
/// Fails with a configuration error when `config` names a provider other
/// than the host's native one.
pub fn open_platform_store(config: &ProvisionerConfig) -> CryptoResult<PlatformKeyStore> {
    config.validate()?;
    PlatformKeyStore::from_config(config)
}

/// Fingerprint of the public half of a native blob
pub(crate) fn public_fingerprint(blob: NativeKeyBlob) -> CryptoResult<String> {
    let public = KeyCodec::encode_public(blob)?;
    Ok(KeyCodec::fingerprint(public.as_bytes()))
}

/// Pick the canonical entry among duplicates sharing one name.
///
/// Stores that cannot enforce unique names may end up with several key pairs
/// under one tag after a creation race. Every reader agrees on the pair with
/// the smallest public-key fingerprint.
pub(crate) fn select_canonical<T>(candidates: Vec<(T, String)>) -> Option<(T, String)> {
    candidates
        .into_iter()
        .min_by(|(_, left), (_, right)| left.cmp(right))
}

/// What a creator does with the pair it has just stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreationOutcome {
    /// Ours is the only pair under the name
    Keep,
    /// Some other pair shares the name, or ours is gone; discard ours
    Yield,
}

/// Decide whether a freshly stored pair stands.
///
/// `found` holds the public fingerprints of every pair under the name as
/// seen after our insert. Any pair other than ours wins regardless of its
/// fingerprint: a creator keeps its pair only if it is alone. Two creators
/// that see each other both yield.
pub(crate) fn settle_creation(found: &[String], ours: &str) -> CreationOutcome {
    let present = found.iter().any(|fingerprint| fingerprint == ours);
    let contested = found.iter().any(|fingerprint| fingerprint != ours);
    if present && !contested {
        CreationOutcome::Keep
    } else {
        CreationOutcome::Yield
    }
}

pub(crate) fn wrong_provider(expected: &str, config: &ProvisionerConfig) -> CryptoError {
    CryptoError::ConfigurationError(format!(
        "expected a {} provider, configuration names '{}'",
        expected,
        config.provider.kind()
    ))
}

#[cfg(test)]
pub(crate) mod test_keys {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rsa::RsaPrivateKey;

    /// Deterministic 1024-bit key for codec and store tests
    pub fn rsa_1024(seed: u64) -> RsaPrivateKey {
        let mut rng = StdRng::seed_from_u64(seed);
        RsaPrivateKey::new(&mut rng, 1024).expect("key generation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_canonical_prefers_smallest_fingerprint() {
        let chosen = select_canonical(vec![
            (1, "ff00".to_string()),
            (2, "0a11".to_string()),
            (3, "b000".to_string()),
        ]);
        assert_eq!(chosen.map(|(item, _)| item), Some(2));
        assert!(select_canonical::<u8>(Vec::new()).is_none());
    }

    #[test]
    fn test_public_fingerprint_ignores_private_half() {
        let key = test_keys::rsa_1024(10);
        let from_private = public_fingerprint(NativeKeyBlob::RsaPrivate(key.clone())).unwrap();
        let from_public = public_fingerprint(NativeKeyBlob::RsaPublic(key.to_public_key())).unwrap();
        assert_eq!(from_private, from_public);
    }

    #[test]
    fn test_settle_creation_keeps_a_lone_pair() {
        let ours = "0b1c".to_string();
        assert_eq!(
            settle_creation(&[ours.clone()], &ours),
            CreationOutcome::Keep
        );
    }

    #[test]
    fn test_settle_creation_yields_to_an_earlier_pair() {
        // The earlier pair wins even with a larger fingerprint
        let earlier = "ffee".to_string();
        let ours = "0001".to_string();
        assert_eq!(
            settle_creation(&[earlier, ours.clone()], &ours),
            CreationOutcome::Yield
        );
    }

    #[test]
    fn test_settle_creation_yields_when_seen_as_duplicate() {
        let ours = "aa00".to_string();
        assert_eq!(
            settle_creation(&[ours.clone(), "aa01".to_string()], &ours),
            CreationOutcome::Yield
        );
        // Our pair was removed before we looked again
        assert_eq!(
            settle_creation(&["aa01".to_string()], &ours),
            CreationOutcome::Yield
        );
        assert_eq!(settle_creation(&[], &ours), CreationOutcome::Yield);
    }

    #[test]
    fn test_interleaved_creators_never_both_keep() {
        let first = "ff00".to_string();
        let second = "00ff".to_string();

        // First creator checks before the second pair lands
        let first_outcome = settle_creation(&[first.clone()], &first);
        // Second creator then sees both, smaller fingerprint or not
        let second_outcome = settle_creation(&[first.clone(), second.clone()], &second);
        assert_eq!(first_outcome, CreationOutcome::Keep);
        assert_eq!(second_outcome, CreationOutcome::Yield);

        // With the loser gone, readers settle on the survivor
        let readers = select_canonical(vec![("first", first.clone())]);
        assert_eq!(readers.map(|(item, _)| item), Some("first"));

        // Both checks after both inserts: both back off
        let both = [first.clone(), second.clone()];
        assert_eq!(settle_creation(&both, &first), CreationOutcome::Yield);
        assert_eq!(settle_creation(&both, &second), CreationOutcome::Yield);
    }

    #[test]
    fn test_shared_store_through_arc() {
        let store = Arc::new(MemoryKeyStore::new());
        let id = KeyIdentifier::new("shared", Visibility::Private).unwrap();
        let handle = store
            .create(&id, &KeyAlgorithmSpec::rsa(1024), KeyUsage::Signing)
            .unwrap();
        let other = Arc::clone(&store);
        assert!(other.exists(&id).unwrap());
        assert!(other.read_material(&handle, Visibility::Public).is_ok());
    }
}
