//! ALFA Session Guard - Key Material Bundle
//!
//! The AEAD key, MAC key, signing keypair and encryption keypair live and
//! rotate together. They are persisted as one JSON bundle in secure storage
//! under [`KEYRING_STORAGE_KEY`]; a bundle is either fully written or not at all.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::asymmetric::{generate_exchange_secret, generate_signing_key, PUBLIC_KEY_LEN};
use super::hkdf::derive_key;
use super::keys::{contexts, EnvelopeKey, SymmetricKey, KEY_LEN};
use crate::error::{GuardError, GuardResult};
use crate::storage::SecureStorage;

/// Storage slot of the persisted key bundle
pub const KEYRING_STORAGE_KEY: &str = "alfa.guard.keyring.v1";

const BUNDLE_VERSION: u32 = 1;

/// Public halves of the asymmetric keys, safe to share with the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    /// Ed25519 verifying key (hex)
    pub signing: String,
    /// X25519 public key (hex)
    pub encryption: String,
    pub generation: u64,
}

/// Live key material owned by the envelope codec
pub struct KeyMaterial {
    envelope: EnvelopeKey,
    storage: SymmetricKey,
    signing: SigningKey,
    exchange: StaticSecret,
    generation: u64,
    created_at: DateTime<Utc>,
}

impl KeyMaterial {
    /// Fresh random keys for `generation`
    pub fn generate(generation: u64, created_at: DateTime<Utc>) -> GuardResult<Self> {
        Self::assemble(
            EnvelopeKey::generate(),
            generate_signing_key(),
            generate_exchange_secret(),
            generation,
            created_at,
        )
    }

    fn assemble(
        envelope: EnvelopeKey,
        signing: SigningKey,
        exchange: StaticSecret,
        generation: u64,
        created_at: DateTime<Utc>,
    ) -> GuardResult<Self> {
        let exchange_bytes = Zeroizing::new(exchange.to_bytes());
        let storage = derive_key(exchange_bytes.as_slice(), contexts::STORAGE, b"at-rest")?;
        Ok(Self {
            envelope,
            storage,
            signing,
            exchange,
            generation,
            created_at,
        })
    }

    /// Replace the envelope keys with ones stretched from a shared secret.
    /// Asymmetric keys and the at-rest key are kept.
    pub fn with_working_key(&self, working: &SymmetricKey) -> GuardResult<Self> {
        Self::assemble(
            EnvelopeKey::from_working_key(working)?,
            self.signing.clone(),
            self.exchange.clone(),
            self.generation,
            self.created_at,
        )
    }

    pub fn envelope_key(&self) -> &EnvelopeKey {
        &self.envelope
    }

    /// Key for sealing tokens and sessions at rest
    pub fn storage_key(&self) -> &SymmetricKey {
        &self.storage
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            signing: hex::encode(self.signing.verifying_key().to_bytes()),
            encryption: hex::encode(PublicKey::from(&self.exchange).as_bytes()),
            generation: self.generation,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PERSISTENCE
    // ═══════════════════════════════════════════════════════════════════════

    fn to_bundle(&self) -> KeyBundle {
        KeyBundle {
            version: BUNDLE_VERSION,
            generation: self.generation,
            created_at: self.created_at,
            aead_key: STANDARD.encode(self.envelope.enc_key().expose()),
            mac_key: STANDARD.encode(self.envelope.mac_key().expose()),
            signing_key: STANDARD.encode(self.signing.to_bytes()),
            exchange_key: STANDARD.encode(self.exchange.to_bytes()),
        }
    }

    fn from_bundle(bundle: &KeyBundle) -> GuardResult<Self> {
        if bundle.version != BUNDLE_VERSION {
            return Err(GuardError::Crypto(format!(
                "unsupported key bundle version {}",
                bundle.version
            )));
        }

        let aead = decode_key(&bundle.aead_key)?;
        let mac = decode_key(&bundle.mac_key)?;
        let signing = decode_key(&bundle.signing_key)?;
        let exchange = decode_key(&bundle.exchange_key)?;

        Self::assemble(
            EnvelopeKey::new(SymmetricKey::new(*aead), SymmetricKey::new(*mac)),
            SigningKey::from_bytes(&signing),
            StaticSecret::from(*exchange),
            bundle.generation,
            bundle.created_at,
        )
    }

    /// Write the bundle to secure storage
    pub async fn persist(&self, storage: &dyn SecureStorage) -> GuardResult<()> {
        let bundle = self.to_bundle();
        let json = Zeroizing::new(serde_json::to_vec(&bundle)?);
        storage.put(KEYRING_STORAGE_KEY, &json).await
    }

    /// Read the persisted bundle, if any
    pub async fn load(storage: &dyn SecureStorage) -> GuardResult<Option<Self>> {
        let Some(data) = storage.get(KEYRING_STORAGE_KEY).await? else {
            return Ok(None);
        };
        let data = Zeroizing::new(data);
        let bundle: KeyBundle = serde_json::from_slice(&data)?;
        Self::from_bundle(&bundle).map(Some)
    }

    /// Load the persisted bundle or generate and persist generation 1
    pub async fn load_or_create(
        storage: &dyn SecureStorage,
        now: DateTime<Utc>,
    ) -> GuardResult<Self> {
        if let Some(existing) = Self::load(storage).await? {
            tracing::debug!(generation = existing.generation, "loaded key bundle");
            return Ok(existing);
        }

        let material = Self::generate(1, now)?;
        material.persist(storage).await?;
        tracing::info!("generated new key bundle");
        Ok(material)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("generation", &self.generation)
            .field("created_at", &self.created_at)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn decode_key(encoded: &str) -> GuardResult<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(STANDARD.decode(encoded)?);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    if bytes.len() != KEY_LEN {
        return Err(GuardError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        });
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Serialized form of [`KeyMaterial`]
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyBundle {
    version: u32,
    generation: u64,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    aead_key: String,
    mac_key: String,
    signing_key: String,
    exchange_key: String,
}

/// Decode a hex public key of the expected length
pub fn decode_public_key(hex_key: &str) -> GuardResult<[u8; PUBLIC_KEY_LEN]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| GuardError::Serialization(format!("hex: {}", e)))?;
    <[u8; PUBLIC_KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| GuardError::InvalidKeyLength {
        expected: PUBLIC_KEY_LEN,
        actual: bytes.len(),
    })
}
