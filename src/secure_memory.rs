//! Secure Memory Handling for Exported Key Material
//!
//! Private key material leaves the native key store only as encoded bytes.
//! Those bytes are kept in [`SecureBytes`], which zeroes its buffer when
//! dropped and never prints its contents, so a private key does not linger in
//! process memory after the caller is done with it.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A container for sensitive byte data such as encoded private keys.
///
/// # Security Properties
///
/// 1. Automatically zeroes memory when dropped
/// 2. `Debug` output is redacted
/// 3. Clones are independent and zeroize on their own drop
///
/// # Example
///
/// ```
/// use keyprov::secure_memory::SecureBytes;
///
/// let key = SecureBytes::new(&[0x30, 0x82, 0x04, 0xa4]);
/// assert_eq!(key.len(), 4);
/// // When `key` goes out of scope, the buffer is zeroed
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SecureBytes {
    bytes: Vec<u8>,
}

impl SecureBytes {
    /// Create a new SecureBytes holding a copy of `data`
    pub fn new(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
        }
    }

    /// Get a reference to the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the container and return the contained bytes
    ///
    /// After calling this method it becomes the caller's responsibility to
    /// zeroize the returned vector.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Get the current length of the buffer in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes([REDACTED; {} bytes])", self.bytes.len())
    }
}
