//! ALFA Session Guard - HKDF Key Derivation

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{SymmetricKey, KEY_LEN};
use crate::error::{GuardError, GuardResult};

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> GuardResult<SymmetricKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);

    hk.expand(info, &mut okm[..])
        .map_err(|e| GuardError::KeyDerivation(e.to_string()))?;

    Ok(SymmetricKey::new(*okm))
}

/// Derive a subkey from a parent key with context
pub fn derive_subkey(parent: &SymmetricKey, context: &[u8], info: &[u8]) -> GuardResult<SymmetricKey> {
    derive_key(parent.expose(), context, info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_separate_keys() {
        let parent = SymmetricKey::generate();
        let k1 = derive_subkey(&parent, b"storage", b"ALFA:A").unwrap();
        let k2 = derive_subkey(&parent, b"storage", b"ALFA:B").unwrap();
        assert_ne!(k1.expose(), k2.expose());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_key(b"ikm", b"salt", b"ALFA:A").unwrap();
        let b = derive_key(b"ikm", b"salt", b"ALFA:A").unwrap();
        assert_eq!(a.expose(), b.expose());
        assert_ne!(a.expose(), &[0u8; KEY_LEN]);
    }
}
