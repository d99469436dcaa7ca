//! ALFA Session Guard - Platform Signals
//!
//! Root/jailbreak/debugger detection and device fingerprinting are platform
//! code. The guard only consumes their answers.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

/// Reports whether the runtime environment is compromised
#[async_trait]
pub trait EnvironmentSignal: Send + Sync {
    async fn is_compromised_environment(&self) -> bool;
}

/// Stable identifier of the current device
pub trait DeviceIdentity: Send + Sync {
    fn current_device_id(&self) -> String;
}

/// Signal that never reports compromise (desktop, CLI)
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedEnvironment;

#[async_trait]
impl EnvironmentSignal for TrustedEnvironment {
    async fn is_compromised_environment(&self) -> bool {
        false
    }
}

/// Signal backed by a flag the platform layer flips
#[derive(Debug, Default)]
pub struct FlagEnvironment {
    compromised: AtomicBool,
}

impl FlagEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_compromised(&self, compromised: bool) {
        self.compromised.store(compromised, Ordering::SeqCst);
    }
}

#[async_trait]
impl EnvironmentSignal for FlagEnvironment {
    async fn is_compromised_environment(&self) -> bool {
        self.compromised.load(Ordering::SeqCst)
    }
}

/// Device id fixed at construction, replaceable for tests
#[derive(Debug)]
pub struct StaticDeviceIdentity {
    id: RwLock<String>,
}

impl StaticDeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RwLock::new(id.into()),
        }
    }

    pub fn set(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }
}

impl DeviceIdentity for StaticDeviceIdentity {
    fn current_device_id(&self) -> String {
        self.id.read().clone()
    }
}
