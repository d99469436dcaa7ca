//! ALFA Session Guard - Cryptographic Core
//!
//! AES-256-GCM, HMAC-SHA256, PBKDF2 and HKDF for envelopes and at-rest data,
//! Ed25519 and X25519 for public-key operations.

pub mod aead;
pub mod asymmetric;
pub mod hkdf;
pub mod kdf;
pub mod keyring;
pub mod keys;

pub use aead::*;
pub use asymmetric::{
    decrypt_with_secret, encrypt_to_public_key, sign_digest, verify_digest, PUBLIC_KEY_LEN,
    SIGNATURE_LEN,
};
pub use hkdf::*;
pub use kdf::{stretch_secret, stretch_secret_blocking, KdfParams};
pub use keyring::{KeyMaterial, PublicKeys, KEYRING_STORAGE_KEY};
pub use keys::*;
