//! ALFA Session Guard - PBKDF2 key stretching
//!
//! Stretches a password or server-issued secret into the working envelope key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{random_bytes, SymmetricKey, KEY_LEN, SALT_LEN};
use crate::config::MIN_PBKDF2_ITERATIONS;
use crate::error::{GuardError, GuardResult};

/// Fixed local secret mixed into every stretched key
const LOCAL_PEPPER: &[u8] = b"ALFA_SESSION_GUARD_v1_PEPPER";

/// Persisted KDF parameters. Holds no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    /// Salt (base64)
    pub salt: String,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn with_random_salt(iterations: u32) -> Self {
        Self {
            algorithm: "pbkdf2-hmac-sha256".into(),
            iterations,
            salt: STANDARD.encode(random_bytes::<SALT_LEN>()),
        }
    }

    pub fn salt_bytes(&self) -> GuardResult<Vec<u8>> {
        let salt = STANDARD.decode(&self.salt)?;
        if salt.len() < SALT_LEN {
            return Err(GuardError::KeyDerivation("salt too short".into()));
        }
        Ok(salt)
    }
}

/// PBKDF2-HMAC-SHA256 over secret || pepper. CPU-bound, see [`stretch_secret_blocking`].
pub fn stretch_secret(secret: &[u8], params: &KdfParams) -> GuardResult<SymmetricKey> {
    if params.iterations < MIN_PBKDF2_ITERATIONS {
        return Err(GuardError::KeyDerivation(format!(
            "{} iterations is below the {} minimum",
            params.iterations, MIN_PBKDF2_ITERATIONS
        )));
    }
    if secret.is_empty() {
        return Err(GuardError::KeyDerivation("empty secret".into()));
    }

    let salt = params.salt_bytes()?;

    let mut input = Zeroizing::new(Vec::with_capacity(secret.len() + LOCAL_PEPPER.len()));
    input.extend_from_slice(secret);
    input.extend_from_slice(LOCAL_PEPPER);

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(&input, &salt, params.iterations, &mut output[..]);

    Ok(SymmetricKey::new(*output))
}

/// Run [`stretch_secret`] on the blocking pool so it never stalls the runtime
pub async fn stretch_secret_blocking(
    secret: Zeroizing<Vec<u8>>,
    params: KdfParams,
) -> GuardResult<SymmetricKey> {
    tokio::task::spawn_blocking(move || stretch_secret(&secret, &params))
        .await
        .map_err(|e| GuardError::KeyDerivation(format!("worker failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stretch_deterministic_per_salt() {
        let params = KdfParams::with_random_salt(MIN_PBKDF2_ITERATIONS);
        let k1 = stretch_secret(b"server-issued-secret", &params).unwrap();
        let k2 = stretch_secret(b"server-issued-secret", &params).unwrap();
        assert_eq!(k1.expose(), k2.expose());

        let other = KdfParams::with_random_salt(MIN_PBKDF2_ITERATIONS);
        let k3 = stretch_secret(b"server-issued-secret", &other).unwrap();
        assert_ne!(k1.expose(), k3.expose());
    }

    #[test]
    fn test_weak_iterations_rejected() {
        let params = KdfParams::with_random_salt(10_000);
        assert!(matches!(
            stretch_secret(b"secret", &params),
            Err(GuardError::KeyDerivation(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_offload() {
        let params = KdfParams::with_random_salt(MIN_PBKDF2_ITERATIONS);
        let key = stretch_secret_blocking(Zeroizing::new(b"pw".to_vec()), params.clone())
            .await
            .unwrap();
        assert_eq!(key.expose(), stretch_secret(b"pw", &params).unwrap().expose());
    }
}
