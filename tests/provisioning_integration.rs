// Integration tests for key provisioning through the public API

use std::io::Write;

use keyprov::prelude::*;
use keyprov::{KeyFormat, KeyIdentifier, ProviderConfig};
use proptest::prelude::*;
use tempfile::NamedTempFile;

fn provisioner() -> KeyProvisioner<MemoryKeyStore> {
    let mut config = ProvisionerConfig::memory();
    config.default_key_bits = 1024;
    KeyProvisioner::in_memory(config).unwrap()
}

#[test]
fn test_config_file_drives_provisioner() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "provider": {{ "kind": "memory" }},
            "exportable_private_keys": false,
            "default_key_bits": 1024
        }}"#
    )
    .unwrap();

    let config = ProvisionerConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.provider, ProviderConfig::Memory);

    let provisioner = KeyProvisioner::in_memory(config).unwrap();
    let err = provisioner
        .provision_rsa_key("sealed-client", KeyUsage::Signing)
        .unwrap_err();
    assert!(matches!(err, CryptoError::NotExportable { .. }));
    assert!(err.suggested_remediation().is_some());
}

#[test]
fn test_missing_config_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ProvisionerConfig::from_json_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(CryptoError::IoError(_))));
}

#[test]
fn test_signing_and_encryption_keys() {
    let provisioner = provisioner();

    let signing = provisioner
        .provision_rsa_key("client-signing", KeyUsage::Signing)
        .unwrap();
    let encryption = provisioner
        .provision_rsa_key("client-encryption", KeyUsage::Decryption)
        .unwrap();
    assert_ne!(signing.public_key(), encryption.public_key());

    let published = provisioner
        .provision(
            &KeyRequest::new("client-encryption", KeyAlgorithmSpec::rsa(1024), KeyUsage::Decryption)
                .visibility(Visibility::Public),
        )
        .unwrap();
    assert_eq!(published.format(), KeyFormat::Pkcs1PublicDer);

    let peer = KeyCodec::import_material(&published).unwrap();
    let ciphertext = peer.encrypt(b"id_token").unwrap();
    assert_eq!(encryption.decrypt(&ciphertext).unwrap().as_bytes(), b"id_token");
}

#[test]
fn test_store_enforces_usage_for_sealed_keys() {
    let store = MemoryKeyStore::non_exportable();
    let provisioner = KeyProvisioner::new(store.clone(), ProvisionerConfig::memory());

    let public = provisioner
        .get_or_create(
            "sealed-signing",
            &KeyAlgorithmSpec::rsa(1024),
            KeyUsage::Signing,
            Visibility::Public,
            false,
        )
        .unwrap();

    let id = KeyIdentifier::new("sealed-signing", Visibility::Private).unwrap();
    let handle = store.open(&id).unwrap();
    let signature = store.sign(&handle, b"request object").unwrap();
    assert!(store.decrypt(&handle, &signature).is_err());

    let verifier = KeyCodec::import_material(&public).unwrap();
    assert!(verifier.verify(b"request object", &signature));
}

#[test]
fn test_error_codes_are_stable() {
    let provisioner = provisioner();
    let err = provisioner
        .get_or_create(
            "ed25519-key",
            &KeyAlgorithmSpec::from_name("ed25519", 256),
            KeyUsage::Signing,
            Visibility::Private,
            false,
        )
        .unwrap_err();
    assert_eq!(err.error_code(), keyprov::error::error_codes::UNSUPPORTED_ALGORITHM_FAMILY);
    assert_eq!(err.error_type(), "UnsupportedAlgorithm");
    assert!(provisioner.store().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_get_or_create_is_idempotent(name in "[a-z][a-z0-9._-]{0,24}") {
        let provisioner = provisioner();
        let algorithm = KeyAlgorithmSpec::rsa(1024);

        let first = provisioner
            .get_or_create(&name, &algorithm, KeyUsage::Signing, Visibility::Public, false)
            .unwrap();
        let second = provisioner
            .get_or_create(&name, &algorithm, KeyUsage::Signing, Visibility::Public, false)
            .unwrap();

        prop_assert_eq!(first.as_bytes(), second.as_bytes());
        prop_assert_eq!(provisioner.store().len(), 1);
    }
}
