//! ALFA Session Guard - AEAD Encryption and MACs
//!
//! AES-256-GCM for envelope bodies and at-rest blobs, HMAC-SHA256 for the
//! envelope signature and request signing.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::keys::{random_bytes, SymmetricKey, MAC_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{GuardError, GuardResult};

type HmacSha256 = Hmac<Sha256>;

// ═══════════════════════════════════════════════════════════════════════════
// AES-256-GCM
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypt with AES-256-GCM under a caller-supplied nonce. Output is ciphertext || tag.
pub fn encrypt_aes_gcm(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> GuardResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| GuardError::Crypto(e.to_string()))?;

    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| GuardError::Crypto(format!("AES-GCM encryption failed: {}", e)))
}

/// Decrypt AES-256-GCM ciphertext || tag. Authentication failure is reported
/// as an envelope rejection.
pub fn decrypt_aes_gcm(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> GuardResult<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(GuardError::rejected("ciphertext shorter than tag"));
    }

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| GuardError::Crypto(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| GuardError::rejected("AEAD authentication failed"))
}

/// Seal with a fresh random nonce, returning nonce || ciphertext || tag
pub fn seal_with_random_nonce(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> GuardResult<Vec<u8>> {
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = encrypt_aes_gcm(key, &nonce, plaintext, aad)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open the output of [`seal_with_random_nonce`]
pub fn open_with_prefixed_nonce(key: &SymmetricKey, blob: &[u8], aad: &[u8]) -> GuardResult<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(GuardError::rejected("sealed blob too short"));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| GuardError::rejected("invalid nonce length"))?;
    decrypt_aes_gcm(key, &nonce, ciphertext, aad)
}

// ═══════════════════════════════════════════════════════════════════════════
// HMAC-SHA256
// ═══════════════════════════════════════════════════════════════════════════

fn keyed_mac(key: &SymmetricKey, parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.expose())
        .expect("HMAC key length is always valid");
    for part in parts {
        mac.update(part);
    }
    mac
}

/// Compute HMAC-SHA256 over the concatenation of `parts`
pub fn compute_hmac(key: &SymmetricKey, parts: &[&[u8]]) -> [u8; MAC_LEN] {
    keyed_mac(key, parts).finalize().into_bytes().into()
}

/// Verify HMAC-SHA256 in constant time
pub fn verify_hmac(key: &SymmetricKey, parts: &[&[u8]], expected: &[u8]) -> bool {
    keyed_mac(key, parts).verify_slice(expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_roundtrip_with_aad() {
        let key = SymmetricKey::generate();
        let nonce = random_bytes::<NONCE_LEN>();
        let plaintext = b"GET /photos?page=2";

        let ct = encrypt_aes_gcm(&key, &nonce, plaintext, b"device-a").unwrap();
        assert_eq!(ct.len(), plaintext.len() + TAG_LEN);

        let pt = decrypt_aes_gcm(&key, &nonce, &ct, b"device-a").unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = SymmetricKey::generate();
        let blob = seal_with_random_nonce(&key, b"refresh-token", b"device-a").unwrap();

        assert!(open_with_prefixed_nonce(&key, &blob, b"device-a").is_ok());
        assert!(matches!(
            open_with_prefixed_nonce(&key, &blob, b"device-b"),
            Err(GuardError::EnvelopeRejected { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SymmetricKey::generate();
        let key2 = SymmetricKey::generate();
        let blob = seal_with_random_nonce(&key1, b"Secret data", b"").unwrap();

        assert!(open_with_prefixed_nonce(&key2, &blob, b"").is_err());
    }

    #[test]
    fn test_hmac() {
        let key = SymmetricKey::generate();
        let mac = compute_hmac(&key, &[b"photo".as_slice(), b"-feed".as_slice()]);

        assert!(verify_hmac(&key, &[b"photo-feed".as_slice()], &mac));
        assert!(!verify_hmac(&key, &[b"photo-fees".as_slice()], &mac));
        assert!(!verify_hmac(&key, &[b"photo-feed".as_slice()], &mac[..16]));
    }
}
