#![no_main]

use arbitrary::Arbitrary;
use keyprov::key_management::codec::{NativeKeyBlob, RsaPrivateComponents};
use keyprov::{KeyCodec, SecureBytes};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum BlobInput {
    CngPublic(Vec<u8>),
    CngFullPrivate(Vec<u8>),
    Components {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        private_exponent: Vec<u8>,
        prime1: Vec<u8>,
        prime2: Vec<u8>,
    },
    EcPoint(Vec<u8>),
    EcPrivate(Vec<u8>),
}

fn to_blob(input: BlobInput) -> NativeKeyBlob {
    match input {
        BlobInput::CngPublic(bytes) => NativeKeyBlob::CngRsaPublicBlob(bytes),
        BlobInput::CngFullPrivate(bytes) => NativeKeyBlob::CngRsaFullPrivateBlob(SecureBytes::from(bytes)),
        BlobInput::Components {
            modulus,
            public_exponent,
            private_exponent,
            prime1,
            prime2,
        } => NativeKeyBlob::RsaComponents {
            modulus,
            public_exponent,
            private: Some(RsaPrivateComponents {
                private_exponent: SecureBytes::from(private_exponent),
                prime1: SecureBytes::from(prime1),
                prime2: SecureBytes::from(prime2),
            }),
        },
        BlobInput::EcPoint(bytes) => NativeKeyBlob::EcPublicPoint(bytes),
        BlobInput::EcPrivate(bytes) => NativeKeyBlob::EcX963Private(SecureBytes::from(bytes)),
    }
}

fuzz_target!(|input: (BlobInput, bool)| {
    let (blob, private) = input;
    let blob = to_blob(blob);
    let _ = if private {
        KeyCodec::encode_private(blob)
    } else {
        KeyCodec::encode_public(blob)
    };
});
