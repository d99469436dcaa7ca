//! ALFA Session Guard - Public-key operations
//!
//! Signatures: SHA-256 digest signed with Ed25519.
//! Encryption: X25519 ECIES (ephemeral DH, HKDF, AES-256-GCM). Every
//! encryption uses a fresh ephemeral key so equal plaintexts never produce
//! equal ciphertexts.
//!
//! ```text
//! [EPHEMERAL PUBLIC 32B][NONCE 12B][CIPHERTEXT variable][TAG 16B]
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use super::aead::{open_with_prefixed_nonce, seal_with_random_nonce};
use super::hkdf::derive_key;
use super::keys::{contexts, random_bytes, NONCE_LEN, TAG_LEN};
use crate::error::{GuardError, GuardResult};

/// Length of Ed25519 and X25519 public keys
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::from_bytes(&random_bytes::<32>())
}

pub fn generate_exchange_secret() -> StaticSecret {
    StaticSecret::from(random_bytes::<32>())
}

// ═══════════════════════════════════════════════════════════════════════════
// SIGNATURES
// ═══════════════════════════════════════════════════════════════════════════

/// Hash the message with SHA-256 and sign the digest
pub fn sign_digest(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    let digest = Sha256::digest(message);
    key.sign(&digest).to_bytes()
}

/// Verify a signature produced by [`sign_digest`]. Malformed keys or
/// signatures verify as false.
pub fn verify_digest(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    let digest = Sha256::digest(message);
    verifying_key.verify_strict(&digest, &signature).is_ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// ENCRYPTION
// ═══════════════════════════════════════════════════════════════════════════

fn content_key(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> GuardResult<super::keys::SymmetricKey> {
    let mut salt = Vec::with_capacity(2 * PUBLIC_KEY_LEN);
    salt.extend_from_slice(ephemeral.as_bytes());
    salt.extend_from_slice(recipient.as_bytes());
    derive_key(shared, &salt, contexts::ECIES)
}

/// Encrypt to an X25519 public key
pub fn encrypt_to_public_key(recipient_public: &[u8], plaintext: &[u8]) -> GuardResult<Vec<u8>> {
    let recipient_bytes = <[u8; PUBLIC_KEY_LEN]>::try_from(recipient_public).map_err(|_| {
        GuardError::InvalidKeyLength {
            expected: PUBLIC_KEY_LEN,
            actual: recipient_public.len(),
        }
    })?;
    let recipient = PublicKey::from(recipient_bytes);

    let ephemeral_secret = generate_exchange_secret();
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(GuardError::Crypto("non-contributory public key".into()));
    }

    let key = content_key(shared.as_bytes(), &ephemeral_public, &recipient)?;
    let sealed = seal_with_random_nonce(&key, plaintext, ephemeral_public.as_bytes())?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt_to_public_key`]
pub fn decrypt_with_secret(secret: &StaticSecret, blob: &[u8]) -> GuardResult<Vec<u8>> {
    if blob.len() < PUBLIC_KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(GuardError::rejected("public-key ciphertext too short"));
    }

    let (ephemeral_bytes, sealed) = blob.split_at(PUBLIC_KEY_LEN);
    let ephemeral_array = <[u8; PUBLIC_KEY_LEN]>::try_from(ephemeral_bytes)
        .map_err(|_| GuardError::rejected("invalid ephemeral key"))?;
    let ephemeral_public = PublicKey::from(ephemeral_array);
    let own_public = PublicKey::from(secret);

    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(GuardError::rejected("non-contributory ephemeral key"));
    }

    let key = content_key(shared.as_bytes(), &ephemeral_public, &own_public)?;
    open_with_prefixed_nonce(&key, sealed, ephemeral_public.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = generate_signing_key();
        let public = key.verifying_key().to_bytes();

        let sig = sign_digest(&key, b"album:42");
        assert!(verify_digest(&public, b"album:42", &sig));
        assert!(!verify_digest(&public, b"album:43", &sig));
    }

    #[test]
    fn test_verify_rejects_malformed_input() {
        let key = generate_signing_key();
        let sig = sign_digest(&key, b"msg");
        assert!(!verify_digest(&[0u8; 5], b"msg", &sig));
        assert!(!verify_digest(&key.verifying_key().to_bytes(), b"msg", &sig[..10]));
    }

    #[test]
    fn test_public_key_encryption() {
        let secret = generate_exchange_secret();
        let public = PublicKey::from(&secret);

        let c1 = encrypt_to_public_key(public.as_bytes(), b"upload-token").unwrap();
        let c2 = encrypt_to_public_key(public.as_bytes(), b"upload-token").unwrap();
        assert_ne!(c1, c2);

        assert_eq!(decrypt_with_secret(&secret, &c1).unwrap(), b"upload-token");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let secret = generate_exchange_secret();
        let other = generate_exchange_secret();
        let blob = encrypt_to_public_key(PublicKey::from(&secret).as_bytes(), b"x").unwrap();

        assert!(decrypt_with_secret(&other, &blob).is_err());
    }
}
