//! ALFA Session Guard - Configuration
//!
//! All tunables live here with the production defaults. Every section is
//! `#[serde(default)]` so a partial JSON file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};

/// Lowest PBKDF2 iteration count accepted by [`GuardConfig::validate`]
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

// ═══════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Nonce registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// How long an issued nonce stays valid
    pub validity_secs: u64,
    /// Interval of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            validity_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// Envelope encryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Seal request bodies and expect sealed responses
    pub enabled: bool,
    /// Accepted distance between envelope timestamp and local clock
    pub max_clock_skew_secs: u64,
    /// PBKDF2-HMAC-SHA256 rounds for the working key
    pub pbkdf2_iterations: u32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_clock_skew_secs: 300,
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
        }
    }
}

/// Per-endpoint rate limit override
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointLimit {
    /// Path prefix the override applies to
    pub endpoint: String,
    /// Restrict the override to one HTTP method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Sliding-window rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_max_requests: u32,
    pub default_window_secs: u64,
    /// Overrides, first match wins
    pub endpoints: Vec<EndpointLimit>,
    /// Interval of prune + persist
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_requests: 100,
            default_window_secs: 60,
            endpoints: vec![
                EndpointLimit {
                    endpoint: "/auth/login".into(),
                    method: None,
                    max_requests: 5,
                    window_secs: 300,
                },
                EndpointLimit {
                    endpoint: "/auth/refresh".into(),
                    method: None,
                    max_requests: 10,
                    window_secs: 60,
                },
            ],
            sweep_interval_secs: 300,
        }
    }
}

/// Failed-login lockout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Failures within the window that trigger a lockout
    pub max_failures: u32,
    /// Lockout window and duration
    pub lockout_secs: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            lockout_secs: 900,
        }
    }
}

/// Token lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Treat tokens as expired this long before real expiry
    pub refresh_buffer_secs: u64,
    /// Lifetime assumed when neither `expires_in` nor a JWT `exp` is present
    pub default_lifetime_secs: u64,
    /// Reject sealed token blobs older than this
    pub max_at_rest_age_secs: u64,
    /// Upper bound on a server-supplied `expires_in`
    pub max_lifetime_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: 300,
            default_lifetime_secs: 3600,
            max_at_rest_age_secs: 30 * 24 * 3600,
            max_lifetime_secs: 30 * 24 * 3600,
        }
    }
}

/// Session lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle lifetime of a session
    pub duration_secs: u64,
    /// Emit `ExpiringSoon` this long before expiry
    pub warning_before_secs: u64,
    /// Absolute cap from session start, activity cannot extend past it
    pub max_lifetime_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: 900,
            warning_before_secs: 120,
            max_lifetime_secs: 12 * 3600,
        }
    }
}

/// Outbound request policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Network step timeout
    pub timeout_secs: u64,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    /// Path prefixes the client must never call
    pub restricted_paths: Vec<String>,
    /// Parameter keys rejected anywhere in params or body (case-insensitive)
    pub denied_param_keys: Vec<String>,
    /// Nesting limit for params and JSON bodies
    pub max_param_depth: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            login_path: "/auth/login".into(),
            refresh_path: "/auth/refresh".into(),
            logout_path: "/auth/logout".into(),
            restricted_paths: vec![
                "/admin".into(),
                "/internal".into(),
                "/debug".into(),
                "/.well-known/secrets".into(),
            ],
            denied_param_keys: vec![
                "is_admin".into(),
                "isAdmin".into(),
                "admin".into(),
                "role".into(),
                "roles".into(),
                "permissions".into(),
                "privilege".into(),
                "is_superuser".into(),
                "__proto__".into(),
                "constructor".into(),
                "prototype".into(),
            ],
            max_param_depth: 8,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GUARD CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Complete guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub nonce: NonceConfig,
    pub envelope: EnvelopeConfig,
    pub rate_limit: RateLimitConfig,
    pub lockout: LockoutConfig,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub request: RequestConfig,
}

impl GuardConfig {
    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> GuardResult<Self> {
        let data = std::fs::read(path.as_ref())
            .map_err(|e| GuardError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> GuardResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would weaken or break the guard
    pub fn validate(&self) -> GuardResult<()> {
        if self.envelope.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(GuardError::Config(format!(
                "pbkdf2_iterations must be at least {}",
                MIN_PBKDF2_ITERATIONS
            )));
        }
        if self.nonce.validity_secs == 0 || self.envelope.max_clock_skew_secs == 0 {
            return Err(GuardError::Config("nonce and skew windows must be non-zero".into()));
        }
        if self.rate_limit.default_window_secs == 0
            || self.rate_limit.endpoints.iter().any(|e| e.window_secs == 0)
        {
            return Err(GuardError::Config("rate limit windows must be non-zero".into()));
        }
        if self.lockout.max_failures == 0 {
            return Err(GuardError::Config("lockout max_failures must be non-zero".into()));
        }
        if self.session.warning_before_secs >= self.session.duration_secs {
            return Err(GuardError::Config(
                "session warning must fire before expiry".into(),
            ));
        }
        if self.session.max_lifetime_secs < self.session.duration_secs {
            return Err(GuardError::Config(
                "session max_lifetime must cover one idle duration".into(),
            ));
        }
        if self.token.max_lifetime_secs < self.token.default_lifetime_secs {
            return Err(GuardError::Config(
                "token max_lifetime must cover the default lifetime".into(),
            ));
        }
        if self.request.timeout_secs == 0 {
            return Err(GuardError::Config("request timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub fn nonce_validity(&self) -> Duration {
        Duration::from_secs(self.nonce.validity_secs)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.envelope.max_clock_skew_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request.timeout_secs)
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session.duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lockout.max_failures, 5);
        assert_eq!(config.session.warning_before_secs, 120);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = GuardConfig::from_json(r#"{"session": {"duration_secs": 1800}}"#).unwrap();
        assert_eq!(config.session.duration_secs, 1800);
        assert_eq!(config.session.warning_before_secs, 120);
        assert_eq!(config.rate_limit.default_max_requests, 100);
    }

    #[test]
    fn test_weak_pbkdf2_rejected() {
        let result = GuardConfig::from_json(r#"{"envelope": {"pbkdf2_iterations": 1000}}"#);
        assert!(matches!(result, Err(GuardError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        std::fs::write(&path, r#"{"request": {"timeout_secs": 10}}"#).unwrap();

        let config = GuardConfig::load(&path).unwrap();
        assert_eq!(config.request.timeout_secs, 10);
    }
}
