//! ALFA Session Guard - Envelope Codec
//!
//! Every request and response body travels as a sealed envelope:
//!
//! ```text
//! {"data": b64(ciphertext||tag), "nonce": b64(12B), "signature": hex(HMAC), "timestamp": ms}
//! ```
//!
//! The HMAC covers `b64(data) "." b64(nonce) "." timestamp` and is checked
//! before anything is decrypted. Opening then checks clock skew, then the
//! nonce against the registry, and only then runs AES-256-GCM.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::clock::{duration_ms, Clock, SharedClock};
use crate::config::EnvelopeConfig;
use crate::crypto::keyring::decode_public_key;
use crate::crypto::{
    compute_hmac, decrypt_aes_gcm, decrypt_with_secret, encrypt_aes_gcm, encrypt_to_public_key,
    open_with_prefixed_nonce, seal_with_random_nonce, sign_digest, stretch_secret_blocking,
    verify_digest, verify_hmac, EnvelopeKey, KdfParams, KeyMaterial, PublicKeys, MAC_LEN,
    NONCE_LEN, SIGNATURE_LEN,
};
use crate::error::{GuardError, GuardResult};
use crate::nonce::NonceRegistry;
use crate::storage::SecureStorage;

/// Storage slot of the PBKDF2 parameters (salt, iterations)
pub const KDF_STORAGE_KEY: &str = "alfa.guard.kdf.v1";

const SEPARATOR: &[u8] = b".";

/// One sealed exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    /// AES-256-GCM ciphertext || tag
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    /// HMAC-SHA256 over the signed fields
    pub signature: [u8; MAC_LEN],
    /// Sender clock, epoch milliseconds
    pub timestamp: i64,
}

/// JSON shape on the wire. Fields are optional here so a missing one is
/// reported as a rejection rather than a parse error.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    data: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
    timestamp: Option<i64>,
}

impl SealedEnvelope {
    fn signed_parts(ciphertext: &[u8], nonce: &[u8], timestamp: i64) -> (String, String, String) {
        (
            STANDARD.encode(ciphertext),
            STANDARD.encode(nonce),
            timestamp.to_string(),
        )
    }

    pub fn to_wire_json(&self) -> GuardResult<String> {
        let wire = WireEnvelope {
            data: Some(STANDARD.encode(&self.ciphertext)),
            nonce: Some(STANDARD.encode(self.nonce)),
            signature: Some(hex::encode(self.signature)),
            timestamp: Some(self.timestamp),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn from_wire_json(bytes: &[u8]) -> GuardResult<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|_| GuardError::rejected("malformed envelope"))?;

        let data = wire.data.ok_or_else(|| GuardError::rejected("missing data"))?;
        let nonce = wire.nonce.ok_or_else(|| GuardError::rejected("missing nonce"))?;
        let signature = wire
            .signature
            .ok_or_else(|| GuardError::rejected("missing signature"))?;
        let timestamp = wire
            .timestamp
            .ok_or_else(|| GuardError::rejected("missing timestamp"))?;

        let ciphertext = STANDARD
            .decode(data)
            .map_err(|_| GuardError::rejected("data is not base64"))?;
        let nonce: [u8; NONCE_LEN] = STANDARD
            .decode(nonce)
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| GuardError::rejected("invalid nonce"))?;
        let signature: [u8; MAC_LEN] = hex::decode(signature)
            .ok()
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| GuardError::rejected("invalid signature encoding"))?;

        Ok(Self {
            ciphertext,
            nonce,
            signature,
            timestamp,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CODEC
// ═══════════════════════════════════════════════════════════════════════════════

/// Seals and opens envelopes and owns the key material
pub struct EnvelopeCodec {
    keys: RwLock<Arc<KeyMaterial>>,
    nonces: Arc<NonceRegistry>,
    storage: Arc<dyn SecureStorage>,
    clock: SharedClock,
    max_skew: Duration,
    pbkdf2_iterations: u32,
    rotation: tokio::sync::Mutex<()>,
}

impl EnvelopeCodec {
    pub fn new(
        keys: KeyMaterial,
        nonces: Arc<NonceRegistry>,
        storage: Arc<dyn SecureStorage>,
        clock: SharedClock,
        config: &EnvelopeConfig,
    ) -> Self {
        Self {
            keys: RwLock::new(Arc::new(keys)),
            nonces,
            storage,
            clock,
            max_skew: Duration::from_secs(config.max_clock_skew_secs),
            pbkdf2_iterations: config.pbkdf2_iterations,
            rotation: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the persisted key bundle, generating one on first run
    pub async fn load_or_create(
        nonces: Arc<NonceRegistry>,
        storage: Arc<dyn SecureStorage>,
        clock: SharedClock,
        config: &EnvelopeConfig,
    ) -> GuardResult<Self> {
        let keys = KeyMaterial::load_or_create(storage.as_ref(), clock.now()).await?;
        Ok(Self::new(keys, nonces, storage, clock, config))
    }

    /// Snapshot of the current keys
    pub fn keys(&self) -> Arc<KeyMaterial> {
        Arc::clone(&self.keys.read())
    }

    pub fn nonces(&self) -> &Arc<NonceRegistry> {
        &self.nonces
    }

    pub fn generation(&self) -> u64 {
        self.keys.read().generation()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SEAL / OPEN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Seal with the current envelope key
    pub fn seal(&self, plaintext: &[u8]) -> GuardResult<SealedEnvelope> {
        let keys = self.keys();
        self.seal_with(keys.envelope_key(), plaintext)
    }

    pub fn seal_with(&self, key: &EnvelopeKey, plaintext: &[u8]) -> GuardResult<SealedEnvelope> {
        let nonce = self.nonces.issue_aead();
        let timestamp = self.clock.now_ms();

        let ciphertext =
            encrypt_aes_gcm(key.enc_key(), &nonce, plaintext, &timestamp.to_be_bytes())?;

        let (data_b64, nonce_b64, ts) = SealedEnvelope::signed_parts(&ciphertext, &nonce, timestamp);
        let signature = compute_hmac(
            key.mac_key(),
            &[
                data_b64.as_bytes(),
                SEPARATOR,
                nonce_b64.as_bytes(),
                SEPARATOR,
                ts.as_bytes(),
            ],
        );

        Ok(SealedEnvelope {
            ciphertext,
            nonce,
            signature,
            timestamp,
        })
    }

    /// Open with the current envelope key
    pub fn open(&self, envelope: &SealedEnvelope) -> GuardResult<Vec<u8>> {
        let keys = self.keys();
        self.open_with(keys.envelope_key(), envelope)
    }

    pub fn open_with(&self, key: &EnvelopeKey, envelope: &SealedEnvelope) -> GuardResult<Vec<u8>> {
        self.verify_and_decrypt(key, envelope).map_err(|e| {
            if let GuardError::EnvelopeRejected { reason } = &e {
                tracing::warn!(target: "security", reason = %reason, "envelope rejected");
            }
            e
        })
    }

    fn verify_and_decrypt(&self, key: &EnvelopeKey, envelope: &SealedEnvelope) -> GuardResult<Vec<u8>> {
        let (data_b64, nonce_b64, ts) =
            SealedEnvelope::signed_parts(&envelope.ciphertext, &envelope.nonce, envelope.timestamp);
        let authentic = verify_hmac(
            key.mac_key(),
            &[
                data_b64.as_bytes(),
                SEPARATOR,
                nonce_b64.as_bytes(),
                SEPARATOR,
                ts.as_bytes(),
            ],
            &envelope.signature,
        );
        if !authentic {
            return Err(GuardError::rejected("signature mismatch"));
        }

        let skew = self.clock.now_ms().abs_diff(envelope.timestamp);
        if skew > duration_ms(self.max_skew).unsigned_abs() {
            return Err(GuardError::rejected("timestamp outside allowed skew"));
        }

        if !self.nonces.accept(&envelope.nonce) {
            return Err(GuardError::rejected("nonce replayed or expired"));
        }

        decrypt_aes_gcm(
            key.enc_key(),
            &envelope.nonce,
            &envelope.ciphertext,
            &envelope.timestamp.to_be_bytes(),
        )
    }

    /// Serialize `value` as JSON and seal it into wire form
    pub fn seal_json<T: Serialize>(&self, value: &T) -> GuardResult<String> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        self.seal(&plaintext)?.to_wire_json()
    }

    /// Open a wire envelope and deserialize the JSON payload
    pub fn open_json<T: DeserializeOwned>(&self, wire: &[u8]) -> GuardResult<T> {
        let envelope = SealedEnvelope::from_wire_json(wire).map_err(|e| {
            tracing::warn!(target: "security", error = %e, "envelope rejected");
            e
        })?;
        let plaintext = Zeroizing::new(self.open(&envelope)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // AT REST
    // ═══════════════════════════════════════════════════════════════════════════

    /// Seal a blob for secure storage, bound to `aad`
    pub fn seal_at_rest(&self, plaintext: &[u8], aad: &[u8]) -> GuardResult<Vec<u8>> {
        seal_with_random_nonce(self.keys().storage_key(), plaintext, aad)
    }

    pub fn open_at_rest(&self, blob: &[u8], aad: &[u8]) -> GuardResult<Vec<u8>> {
        open_with_prefixed_nonce(self.keys().storage_key(), blob, aad)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REQUEST SIGNING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Hex HMAC over `METHOD \n path \n timestamp \n sha256hex(body)`
    pub fn sign_request(&self, method: &str, path: &str, timestamp: i64, body: &[u8]) -> String {
        let body_hash = hex::encode(Sha256::digest(body));
        let canonical = format!("{}\n{}\n{}\n{}", method, path, timestamp, body_hash);
        let keys = self.keys();
        hex::encode(compute_hmac(
            keys.envelope_key().mac_key(),
            &[canonical.as_bytes()],
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // KEY DERIVATION
    // ═══════════════════════════════════════════════════════════════════════════

    async fn kdf_params(&self) -> GuardResult<KdfParams> {
        if let Some(data) = self.storage.get(KDF_STORAGE_KEY).await? {
            let params: KdfParams = serde_json::from_slice(&data)?;
            if params.iterations >= self.pbkdf2_iterations {
                return Ok(params);
            }
            tracing::info!(
                stored = params.iterations,
                required = self.pbkdf2_iterations,
                "upgrading KDF parameters"
            );
        }

        let params = KdfParams::with_random_salt(self.pbkdf2_iterations);
        self.storage
            .put(KDF_STORAGE_KEY, &serde_json::to_vec(&params)?)
            .await?;
        Ok(params)
    }

    /// Stretch a shared secret into the envelope keys. Runs PBKDF2 on the
    /// blocking pool. The salt is created once and persisted.
    pub async fn derive_working_key(&self, secret: Zeroizing<Vec<u8>>) -> GuardResult<()> {
        let params = self.kdf_params().await?;
        let working = stretch_secret_blocking(secret, params).await?;

        let _guard = self.rotation.lock().await;
        let updated = self.keys().with_working_key(&working)?;
        *self.keys.write() = Arc::new(updated);
        tracing::info!("envelope keys derived from working secret");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PUBLIC-KEY OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn public_keys(&self) -> PublicKeys {
        self.keys().public_keys()
    }

    /// Encrypt for the holder of a hex X25519 public key
    pub fn encrypt_with_public_key(&self, recipient_hex: &str, plaintext: &[u8]) -> GuardResult<Vec<u8>> {
        let recipient = decode_public_key(recipient_hex)?;
        encrypt_to_public_key(&recipient, plaintext)
    }

    /// Decrypt a blob encrypted to this device's public key
    pub fn decrypt_with_private_key(&self, blob: &[u8]) -> GuardResult<Vec<u8>> {
        decrypt_with_secret(self.keys().exchange_secret(), blob)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        sign_digest(self.keys().signing_key(), message)
    }

    /// Verify against a hex Ed25519 verifying key
    pub fn verify(&self, signer_hex: &str, message: &[u8], signature: &[u8]) -> bool {
        match decode_public_key(signer_hex) {
            Ok(public) => verify_digest(&public, message, signature),
            Err(_) => false,
        }
    }

    /// Replace every key at once. The new bundle is persisted before it is
    /// swapped in, so a failed write leaves the old keys active.
    pub async fn rotate_keys(&self) -> GuardResult<PublicKeys> {
        let _guard = self.rotation.lock().await;

        let next_generation = self.generation() + 1;
        let fresh = KeyMaterial::generate(next_generation, self.clock.now())?;
        if let Err(e) = fresh.persist(self.storage.as_ref()).await {
            tracing::error!(error = %e, "key rotation aborted, keeping current keys");
            return Err(e);
        }

        let public = fresh.public_keys();
        *self.keys.write() = Arc::new(fresh);
        tracing::info!(generation = next_generation, "key rotation complete");
        Ok(public)
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("generation", &self.generation())
            .field("max_skew", &self.max_skew)
            .finish()
    }
}
