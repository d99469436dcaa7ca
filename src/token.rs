//! ALFA Session Guard - Token Store
//!
//! Holds the bearer token pair bound to this device. Reads go through a
//! `parking_lot::RwLock`; every write (save, rotate, clear) is serialised by
//! an async mutex so a rotation is one transaction.
//!
//! At rest the record is wrapped with a fresh nonce, the sealing time and the
//! device id, then sealed with the storage key using the device id as
//! associated data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::clock::{duration_ms, Clock, SharedClock};
use crate::config::TokenConfig;
use crate::crypto::random_bytes;
use crate::envelope::EnvelopeCodec;
use crate::environment::DeviceIdentity;
use crate::error::{GuardError, GuardResult};
use crate::storage::SecureStorage;

/// Storage slot of the sealed token bundle
pub const TOKEN_STORAGE_KEY: &str = "alfa.guard.tokens.v1";

/// Token response from the login or refresh endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>, expires_in: Option<u64>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_in,
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch ms
    pub expires_at: i64,
    pub device_binding_id: Option<String>,
    pub issued_at: i64,
    #[zeroize(skip)]
    pub subject_claims: Option<serde_json::Value>,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("tokens", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("device_binding_id", &self.device_binding_id)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Sealed at-rest wrapper
#[derive(Serialize, Deserialize)]
struct AtRestBundle {
    record: TokenRecord,
    /// Random per-write value so equal records never seal alike
    nonce: String,
    sealed_at: i64,
    device_id: String,
}

/// Payload of a JWT access token, if it is one
pub fn decode_jwt_claims(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

pub struct TokenStore {
    current: RwLock<Option<TokenRecord>>,
    write: tokio::sync::Mutex<()>,
    codec: Arc<EnvelopeCodec>,
    storage: Arc<dyn SecureStorage>,
    device: Arc<dyn DeviceIdentity>,
    clock: SharedClock,
    config: TokenConfig,
}

impl TokenStore {
    pub fn new(
        codec: Arc<EnvelopeCodec>,
        storage: Arc<dyn SecureStorage>,
        device: Arc<dyn DeviceIdentity>,
        clock: SharedClock,
        config: &TokenConfig,
    ) -> Self {
        Self {
            current: RwLock::new(None),
            write: tokio::sync::Mutex::new(()),
            codec,
            storage,
            device,
            clock,
            config: config.clone(),
        }
    }

    fn build_record(
        &self,
        grant: &TokenGrant,
        binding: Option<String>,
        previous_refresh: Option<String>,
    ) -> TokenRecord {
        let now = self.clock.now_ms();
        let claims = decode_jwt_claims(&grant.access_token);

        let expires_at = match grant.expires_in {
            Some(secs) => {
                let secs = secs.min(self.config.max_lifetime_secs);
                now.saturating_add(duration_ms(Duration::from_secs(secs)))
            }
            None => claims
                .as_ref()
                .and_then(|c| c.get("exp"))
                .and_then(|exp| exp.as_i64())
                .map(|exp| exp.saturating_mul(1000))
                .unwrap_or_else(|| {
                    now.saturating_add(duration_ms(Duration::from_secs(
                        self.config.default_lifetime_secs,
                    )))
                }),
        };

        TokenRecord {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone().or(previous_refresh),
            expires_at,
            device_binding_id: binding,
            issued_at: now,
            subject_claims: claims,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // AT REST
    // ═══════════════════════════════════════════════════════════════════════════

    fn seal_record(&self, record: &TokenRecord) -> GuardResult<Vec<u8>> {
        let device_id = self.device.current_device_id();
        let bundle = AtRestBundle {
            record: record.clone(),
            nonce: hex::encode(random_bytes::<16>()),
            sealed_at: self.clock.now_ms(),
            device_id: device_id.clone(),
        };
        let json = Zeroizing::new(serde_json::to_vec(&bundle)?);
        self.codec.seal_at_rest(&json, device_id.as_bytes())
    }

    fn unseal_record(&self, blob: &[u8]) -> GuardResult<TokenRecord> {
        let device_id = self.device.current_device_id();
        let json = Zeroizing::new(self.codec.open_at_rest(blob, device_id.as_bytes())?);
        let bundle: AtRestBundle = serde_json::from_slice(&json)?;

        if bundle.device_id != device_id {
            return Err(GuardError::rejected("token bundle sealed on another device"));
        }
        let age = self.clock.now_ms().saturating_sub(bundle.sealed_at);
        if age > duration_ms(Duration::from_secs(self.config.max_at_rest_age_secs)) {
            return Err(GuardError::rejected("token bundle too old"));
        }
        Ok(bundle.record)
    }

    async fn write_record(&self, record: Option<&TokenRecord>) -> GuardResult<()> {
        match record {
            Some(record) => {
                let blob = self.seal_record(record)?;
                self.storage.put(TOKEN_STORAGE_KEY, &blob).await
            }
            None => self.storage.delete(TOKEN_STORAGE_KEY).await,
        }
    }

    async fn read_back(&self) -> GuardResult<Option<TokenRecord>> {
        match self.storage.get(TOKEN_STORAGE_KEY).await? {
            Some(blob) => self.unseal_record(&blob).map(Some),
            None => Ok(None),
        }
    }

    /// Load persisted tokens into memory. Returns false, and deletes the
    /// stored blob, when it is missing, stale, foreign or tampered with.
    pub async fn load(&self) -> GuardResult<bool> {
        let _tx = self.write.lock().await;
        let Some(blob) = self.storage.get(TOKEN_STORAGE_KEY).await? else {
            return Ok(false);
        };

        match self.unseal_record(&blob) {
            Ok(record) => {
                *self.current.write() = Some(record);
                tracing::debug!("tokens restored from secure storage");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(target: "security", error = %e, "discarding stored tokens");
                self.storage.delete(TOKEN_STORAGE_KEY).await?;
                Ok(false)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Store a fresh grant, bound to `device_binding` or the current device
    pub async fn save(&self, grant: &TokenGrant, device_binding: Option<String>) -> GuardResult<()> {
        let _tx = self.write.lock().await;
        let binding = device_binding.unwrap_or_else(|| self.device.current_device_id());
        let record = self.build_record(grant, Some(binding), None);

        self.write_record(Some(&record)).await?;
        *self.current.write() = Some(record);
        tracing::info!("tokens saved");
        Ok(())
    }

    /// Current record if it is bound to this device. A mismatch destroys it.
    async fn bound_record(&self) -> Option<TokenRecord> {
        let record = self.current.read().clone()?;
        let device_id = self.device.current_device_id();

        match &record.device_binding_id {
            Some(bound) if *bound != device_id => {
                tracing::warn!(target: "security", "device binding mismatch, clearing tokens");
                if let Err(e) = self.clear().await {
                    tracing::error!(error = %e, "failed to clear tokens after device mismatch");
                }
                None
            }
            _ => Some(record),
        }
    }

    pub async fn get_access(&self) -> Option<String> {
        self.bound_record().await.map(|r| r.access_token.clone())
    }

    pub async fn get_refresh(&self) -> Option<String> {
        self.bound_record().await.and_then(|r| r.refresh_token.clone())
    }

    /// True when no token is held or expiry is within the refresh buffer
    pub fn is_expired(&self) -> bool {
        let buffer = duration_ms(Duration::from_secs(self.config.refresh_buffer_secs));
        match self.current.read().as_ref() {
            Some(record) => self.clock.now_ms() >= record.expires_at.saturating_sub(buffer),
            None => true,
        }
    }

    pub fn has_tokens(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.current.read().as_ref().map(|r| r.expires_at)
    }

    pub fn device_binding(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .and_then(|r| r.device_binding_id.clone())
    }

    pub fn subject_claims(&self) -> Option<serde_json::Value> {
        self.current
            .read()
            .as_ref()
            .and_then(|r| r.subject_claims.clone())
    }

    /// Replace the token pair. The old pair stays active until the new one
    /// is persisted and reads back equal; otherwise the old pair is restored
    /// in memory and storage and false is returned.
    pub async fn rotate(&self, grant: &TokenGrant) -> bool {
        let _tx = self.write.lock().await;
        let previous = self.current.read().clone();

        let binding = previous
            .as_ref()
            .and_then(|r| r.device_binding_id.clone())
            .or_else(|| Some(self.device.current_device_id()));
        let previous_refresh = previous.as_ref().and_then(|r| r.refresh_token.clone());
        let next = self.build_record(grant, binding, previous_refresh);

        let committed = match self.write_record(Some(&next)).await {
            Ok(()) => matches!(self.read_back().await, Ok(Some(stored)) if stored == next),
            Err(e) => {
                tracing::warn!(error = %e, "token rotation write failed");
                false
            }
        };

        if committed {
            *self.current.write() = Some(next);
            tracing::info!("tokens rotated");
            return true;
        }

        tracing::warn!("token rotation rolled back");
        if let Err(e) = self.write_record(previous.as_ref()).await {
            tracing::error!(error = %e, "failed to restore previous tokens in storage");
        }
        *self.current.write() = previous;
        false
    }

    /// Destroy tokens in memory and storage
    pub async fn clear(&self) -> GuardResult<()> {
        let _tx = self.write.lock().await;
        *self.current.write() = None;
        self.storage.delete(TOKEN_STORAGE_KEY).await?;
        tracing::info!("tokens cleared");
        Ok(())
    }

    /// Re-seal the current record under the current storage key
    pub async fn reseal(&self) -> GuardResult<()> {
        let _tx = self.write.lock().await;
        let current = self.current.read().clone();
        if let Some(record) = current {
            self.write_record(Some(&record)).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_tokens", &self.has_tokens())
            .finish()
    }
}
