//! ALFA Session Guard - Symmetric Key Types
//!
//! Working keys for envelope sealing, request signing and at-rest storage.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};

use super::hkdf::derive_key;
use crate::error::{GuardError, GuardResult};

/// Key length for AES-256 and HMAC-SHA256 keys
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// HMAC-SHA256 output length
pub const MAC_LEN: usize = 32;

/// PBKDF2 salt length
pub const SALT_LEN: usize = 16;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Envelope encryption key
    pub const ENVELOPE_ENC: &[u8] = b"ALFA:GUARD:ENVELOPE:ENC:v1";

    /// Envelope authentication key
    pub const ENVELOPE_MAC: &[u8] = b"ALFA:GUARD:ENVELOPE:MAC:v1";

    /// At-rest sealing of tokens and sessions
    pub const STORAGE: &[u8] = b"ALFA:GUARD:STORAGE:v1";

    /// Public-key encryption content key
    pub const ECIES: &[u8] = b"ALFA:GUARD:ECIES:v1";
}

/// 256-bit secret key, zeroized on drop and redacted in Debug
pub struct SymmetricKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl SymmetricKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> GuardResult<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| GuardError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::new(array))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key from the OS RNG
    pub fn generate() -> Self {
        Self::new(random_bytes::<KEY_LEN>())
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Key pair used to seal and authenticate one envelope exchange
#[derive(Clone, Debug)]
pub struct EnvelopeKey {
    enc: SymmetricKey,
    mac: SymmetricKey,
}

impl EnvelopeKey {
    pub fn new(enc: SymmetricKey, mac: SymmetricKey) -> Self {
        Self { enc, mac }
    }

    /// Split one working key into independent encryption and MAC keys
    pub fn from_working_key(working: &SymmetricKey) -> GuardResult<Self> {
        Ok(Self {
            enc: derive_key(working.expose(), b"enc", contexts::ENVELOPE_ENC)?,
            mac: derive_key(working.expose(), b"mac", contexts::ENVELOPE_MAC)?,
        })
    }

    pub fn generate() -> Self {
        Self::new(SymmetricKey::generate(), SymmetricKey::generate())
    }

    pub fn enc_key(&self) -> &SymmetricKey {
        &self.enc
    }

    pub fn mac_key(&self) -> &SymmetricKey {
        &self.mac
    }
}

/// Fill a fixed-size array from the OS RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
