//! # ALFA Session Guard
//!
//! Client-side request security and session control for the ALFA mobile client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ALFA SESSION GUARD                     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │  VALIDATOR  │  │ RATE LIMIT  │  │  SESSION         │  │
//! │  │  path/params│  │ + LOCKOUT   │  │  timers + events │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴────────────────┴───────────────────┴─────────┐  │
//! │  │                   REQUEST GUARD                      │  │
//! │  │    validate → limit → token → seal → send → open     │  │
//! │  └──────┬────────────────┬───────────────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴──────┐  ┌──────┴──────┐  ┌─────────┴────────┐  │
//! │  │  ENVELOPE   │  │ TOKEN STORE │  │  SINGLE-FLIGHT   │  │
//! │  │ AES-GCM+HMAC│  │ device-bound│  │  REFRESH         │  │
//! │  └──────┬──────┘  └─────────────┘  └──────────────────┘  │
//! │  ┌──────┴──────┐                                          │
//! │  │   NONCES    │                                          │
//! │  └─────────────┘                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Bodies sealed with AES-256-GCM, authenticated with HMAC-SHA256 before decryption
//! - Every nonce is accepted at most once inside its validity window
//! - Tokens and sessions sealed at rest, bound to the device id
//! - Security failures clear tokens and end the session
//! - Key material zeroized on drop, never logged

pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod guard;
pub mod lockout;
pub mod nonce;
pub mod rate_limit;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod token;
pub mod transport;
pub mod validation;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GuardConfig;
pub use envelope::{EnvelopeCodec, SealedEnvelope};
pub use environment::{DeviceIdentity, EnvironmentSignal};
pub use error::{GuardError, GuardResult};
pub use guard::{ApiCall, ApiResponse, GuardServices, RequestGuard};
pub use nonce::NonceRegistry;
pub use rate_limit::{RateKey, RateLimiter};
pub use refresh::{RefreshCoordinator, Refresher};
pub use session::{Session, SessionController, SessionEvent, SessionState};
pub use storage::{FileStorage, MemoryStorage, SecureStorage};
pub use token::{TokenGrant, TokenStore};
pub use transport::{HttpRequest, HttpResponse, Method, Transport, TransportError};

/// ALFA Session Guard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Envelope format signature
pub const SIGNATURE: &str = "ALFA_SESSION_GUARD_v1";
