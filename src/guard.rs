//! ALFA Session Guard - Request Guard
//!
//! Every outbound call passes through one pipeline:
//!
//! ```text
//! Validating → RateCheck → TokenFresh | TokenRefresh → Sealing → Sent
//!     → Accepted
//!     → Unauthorized → RefreshAndRetry (once) → Accepted | Rejected
//!     → Rejected
//! ```
//!
//! Security failures fail closed: tokens are destroyed and the session ends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::Instrument;

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::GuardConfig;
use crate::crypto::PublicKeys;
use crate::envelope::EnvelopeCodec;
use crate::environment::{DeviceIdentity, EnvironmentSignal, TrustedEnvironment};
use crate::error::{GuardError, GuardResult};
use crate::nonce::NonceRegistry;
use crate::rate_limit::{RateKey, RateLimiter};
use crate::refresh::{HttpRefresher, RefreshCoordinator, Refresher};
use crate::scheduler::ScheduledTask;
use crate::session::{EndReason, Session, SessionController};
use crate::storage::SecureStorage;
use crate::token::{TokenGrant, TokenStore};
use crate::transport::{headers, HttpRequest, HttpResponse, Method, Transport};
use crate::validation::RequestValidator;

/// Rate-limit identity of calls made without a session
const ANONYMOUS: &str = "anonymous";

// ═══════════════════════════════════════════════════════════════════════════════
// CALLS
// ═══════════════════════════════════════════════════════════════════════════════

/// One API call as the application describes it
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: Method,
    pub path: String,
    /// Query parameters, a flat JSON object
    pub params: Option<Value>,
    pub body: Option<Value>,
    /// Attach the bearer token and require a live session
    pub authenticated: bool,
}

impl ApiCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: None,
            body: None,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send without a bearer token
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    fn target(&self) -> String {
        match self.params.as_ref().map(encode_query) {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Opened response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub request_id: String,
    pub headers: BTreeMap<String, String>,
    /// Decrypted JSON payload, `Null` for an empty body
    pub body: Value,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> GuardResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Pipeline stage, traced on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    RateCheck,
    TokenFresh,
    TokenRefresh,
    Sealing,
    Sent,
    Accepted,
    RefreshAndRetry,
    Rejected,
}

fn enter(stage: Stage) {
    tracing::debug!(?stage, "request stage");
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Encode a flat JSON object as a query string. Nested values are sent as
/// their JSON text.
fn encode_query(params: &Value) -> String {
    let Some(map) = params.as_object() else {
        return String::new();
    };
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            format!("{}={}", percent_encode(key), percent_encode(&value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICES
// ═══════════════════════════════════════════════════════════════════════════════

/// Platform collaborators injected into the guard
pub struct GuardServices {
    pub storage: Arc<dyn SecureStorage>,
    pub transport: Arc<dyn Transport>,
    pub device: Arc<dyn DeviceIdentity>,
    pub environment: Arc<dyn EnvironmentSignal>,
    pub clock: SharedClock,
    /// Defaults to [`HttpRefresher`] on the configured refresh path
    pub refresher: Option<Arc<dyn Refresher>>,
}

impl GuardServices {
    pub fn new(
        storage: Arc<dyn SecureStorage>,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceIdentity>,
    ) -> Self {
        Self {
            storage,
            transport,
            device,
            environment: Arc::new(TrustedEnvironment),
            clock: Arc::new(SystemClock),
            refresher: None,
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentSignal>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST GUARD
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RequestGuard {
    config: GuardConfig,
    codec: Arc<EnvelopeCodec>,
    nonces: Arc<NonceRegistry>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<TokenStore>,
    refresh: Arc<RefreshCoordinator>,
    session: SessionController,
    validator: RequestValidator,
    storage: Arc<dyn SecureStorage>,
    transport: Arc<dyn Transport>,
    environment: Arc<dyn EnvironmentSignal>,
    device: Arc<dyn DeviceIdentity>,
    clock: SharedClock,
    tasks: Vec<ScheduledTask>,
}

impl RequestGuard {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Build the guard, restoring keys, tokens, rate state and session from
    /// storage, and start the background sweeps.
    pub async fn open(config: GuardConfig, services: GuardServices) -> GuardResult<Self> {
        config.validate()?;
        let GuardServices {
            storage,
            transport,
            device,
            environment,
            clock,
            refresher,
        } = services;

        let nonces = Arc::new(NonceRegistry::new(config.nonce_validity(), clock.clone()));
        let codec = Arc::new(
            EnvelopeCodec::load_or_create(
                nonces.clone(),
                storage.clone(),
                clock.clone(),
                &config.envelope,
            )
            .await?,
        );

        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            &config.lockout,
            clock.clone(),
        ));
        limiter.rehydrate(storage.as_ref()).await?;

        let tokens = Arc::new(TokenStore::new(
            codec.clone(),
            storage.clone(),
            device.clone(),
            clock.clone(),
            &config.token,
        ));
        tokens.load().await?;

        let refresher = refresher.unwrap_or_else(|| {
            Arc::new(HttpRefresher::new(
                transport.clone(),
                config.request.refresh_path.clone(),
                config.request_timeout(),
            )) as Arc<dyn Refresher>
        });
        let refresh = Arc::new(RefreshCoordinator::new(tokens.clone(), refresher));

        let session = SessionController::new(
            codec.clone(),
            storage.clone(),
            device.clone(),
            tokens.clone(),
            clock.clone(),
            &config.session,
        );
        session.restore().await?;

        let tasks = vec![
            nonces.start_sweeper(Duration::from_secs(config.nonce.sweep_interval_secs.max(1))),
            limiter.start_sweeper(storage.clone()),
        ];

        tracing::info!(generation = codec.generation(), "request guard ready");
        Ok(Self {
            validator: RequestValidator::new(&config.request),
            config,
            codec,
            nonces,
            limiter,
            tokens,
            refresh,
            session,
            storage,
            transport,
            environment,
            device,
            clock,
            tasks,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<EnvelopeCodec> {
        &self.codec
    }

    pub fn nonces(&self) -> &Arc<NonceRegistry> {
        &self.nonces
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    /// Hex SHA-256 over the device id and the signing public key
    pub fn device_fingerprint(&self) -> String {
        let keys = self.codec.public_keys();
        let mut hasher = Sha256::new();
        hasher.update(self.device.current_device_id().as_bytes());
        hasher.update(keys.signing.as_bytes());
        hex::encode(hasher.finalize())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EXECUTE
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one call through the full pipeline
    pub async fn execute(&self, call: ApiCall) -> GuardResult<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::debug_span!(
            "guarded_request",
            request_id = %request_id,
            method = %call.method,
            path = %call.path,
        );

        let result = self.run(&call, &request_id).instrument(span).await;
        if let Err(e) = &result {
            enter(Stage::Rejected);
            let anonymous_401 = !call.authenticated && *e == GuardError::Unauthorized;
            if e.requires_lockdown() && !anonymous_401 {
                self.lockdown(e).await;
            }
        }
        result
    }

    async fn run(&self, call: &ApiCall, request_id: &str) -> GuardResult<ApiResponse> {
        enter(Stage::Validating);
        self.validator
            .validate(&call.path, call.params.as_ref(), call.body.as_ref())?;

        enter(Stage::RateCheck);
        let identity = self
            .session
            .current()
            .map(|s| s.user_id)
            .unwrap_or_else(|| ANONYMOUS.to_string());
        self.limiter
            .check(&RateKey::new(&call.path, call.method.as_str(), &identity))?;

        self.ensure_trusted_environment().await?;

        let mut token = None;
        if call.authenticated {
            token = Some(self.fresh_token().await?);
        }

        let response = self.send(call, token.as_deref(), request_id).await?;
        let response = match (response.status, token) {
            (401, Some(stale)) => {
                enter(Stage::RefreshAndRetry);
                tracing::info!("401 received, refreshing once and retrying");
                let renewed = self.refresh.refresh_if_stale(&stale).await?;
                let retried = self.send(call, Some(&renewed), request_id).await?;
                if retried.status == 401 {
                    tracing::warn!(target: "security", "second 401 after refresh");
                    return Err(GuardError::Unauthorized);
                }
                retried
            }
            (_, _) => response,
        };

        response.error_for_status()?;
        let body = self.open_body(&response)?;
        enter(Stage::Accepted);

        if call.authenticated {
            if let Err(e) = self.session.touch().await {
                tracing::debug!(error = %e, "session activity not recorded");
            }
        }

        Ok(ApiResponse {
            status: response.status,
            request_id: request_id.to_string(),
            headers: response.headers,
            body,
        })
    }

    async fn ensure_trusted_environment(&self) -> GuardResult<()> {
        if self.environment.is_compromised_environment().await {
            tracing::warn!(target: "security", "compromised environment detected");
            return Err(GuardError::EnvironmentCompromised);
        }
        Ok(())
    }

    /// Bearer token for an authenticated call, refreshed first when stale
    async fn fresh_token(&self) -> GuardResult<String> {
        if !self.session.is_valid().await {
            return Err(GuardError::SessionExpired);
        }
        let token = self
            .tokens
            .get_access()
            .await
            .ok_or(GuardError::Unauthorized)?;

        if self.tokens.is_expired() {
            enter(Stage::TokenRefresh);
            return self.refresh.refresh_if_stale(&token).await;
        }
        enter(Stage::TokenFresh);
        Ok(token)
    }

    /// Seal, sign and send once. Only the network step is bounded by the
    /// request timeout.
    async fn send(
        &self,
        call: &ApiCall,
        token: Option<&str>,
        request_id: &str,
    ) -> GuardResult<HttpResponse> {
        enter(Stage::Sealing);
        let target = call.target();
        let timestamp = self.clock.now_ms();

        let mut request = HttpRequest::new(call.method, target.clone())
            .with_header(headers::REQUEST_ID, request_id)
            .with_header(headers::TIMESTAMP, timestamp.to_string());

        let mut body = Vec::new();
        if let (Some(value), true) = (call.body.as_ref(), call.method.has_body()) {
            body = if self.config.envelope.enabled {
                request = request.with_header(headers::ENCRYPTED_CONTENT, "true");
                self.codec.seal_json(value)?.into_bytes()
            } else {
                serde_json::to_vec(value)?
            };
            request = request.with_header(headers::CONTENT_TYPE, "application/json");
        }

        let signature = self
            .codec
            .sign_request(call.method.as_str(), &target, timestamp, &body);
        request = request.with_header(headers::REQUEST_SIGNATURE, signature);
        if let Some(token) = token {
            request = request.with_header(headers::AUTHORIZATION, format!("Bearer {}", token));
        }
        if !body.is_empty() {
            request = request.with_body(body);
        }

        enter(Stage::Sent);
        match tokio::time::timeout(self.config.request_timeout(), self.transport.send(request)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(timeout = ?self.config.request_timeout(), "request timed out");
                Err(GuardError::TransportFailure("request timed out".into()))
            }
        }
    }

    fn open_body(&self, response: &HttpResponse) -> GuardResult<Value> {
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        let sealed = response
            .header(headers::ENCRYPTED_CONTENT)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if sealed {
            self.codec.open_json(&response.body)
        } else if self.config.envelope.enabled {
            tracing::warn!(target: "security", "unsealed response body");
            Err(GuardError::rejected("response not sealed"))
        } else {
            Ok(serde_json::from_slice(&response.body)?)
        }
    }

    /// Destroy tokens and end the session after a security failure
    async fn lockdown(&self, cause: &GuardError) {
        tracing::warn!(target: "security", error = %cause, "failing closed");
        if let Err(e) = self.tokens.clear().await {
            tracing::error!(error = %e, "failed to clear tokens during lockdown");
        }
        self.session
            .end(EndReason::Lockdown(cause.to_string()))
            .await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AUTHENTICATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Authenticate `identity`, store the granted tokens and start a session
    pub async fn login(&self, identity: &str, credentials: Value) -> GuardResult<Session> {
        let path = self.config.request.login_path.clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        let call = ApiCall::post(path.clone(), credentials).anonymous();

        self.validator.validate(&path, None, call.body.as_ref())?;
        self.limiter.lockout().check(identity)?;
        self.limiter
            .check(&RateKey::new(&path, Method::Post.as_str(), identity))?;
        self.ensure_trusted_environment().await?;

        let response = self.send(&call, None, &request_id).await?;
        if matches!(response.status, 401 | 403) {
            self.limiter.lockout().record_attempt(identity, false);
            tracing::warn!(target: "security", "login rejected");
            if let Some(remaining) = self.limiter.lockout().is_locked(identity) {
                return Err(GuardError::LockedOut { remaining });
            }
            return Err(GuardError::Unauthorized);
        }
        response.error_for_status()?;

        let grant: TokenGrant = serde_json::from_value(self.open_body(&response)?)?;
        self.limiter.lockout().record_attempt(identity, true);
        self.tokens.save(&grant, None).await?;

        let session = self
            .session
            .start(identity, &self.device_fingerprint(), None)
            .await?;
        tracing::info!(session_id = %session.session_id, "login succeeded");
        Ok(session)
    }

    /// Notify the server when possible, then destroy tokens and end the session
    pub async fn logout(&self) -> GuardResult<()> {
        if let Some(token) = self.tokens.get_access().await {
            let call = ApiCall::new(Method::Post, self.config.request.logout_path.clone());
            let request_id = uuid::Uuid::new_v4().to_string();
            match self.send(&call, Some(&token), &request_id).await {
                Ok(response) if !response.is_success() => {
                    tracing::debug!(status = response.status, "logout not acknowledged");
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "logout notification failed"),
            }
        }

        self.tokens.clear().await?;
        self.session.end(EndReason::Logout).await;
        Ok(())
    }

    /// Replace every key and re-seal the persisted tokens and session
    pub async fn rotate_keys(&self) -> GuardResult<PublicKeys> {
        let public = self.codec.rotate_keys().await?;
        self.tokens.reseal().await?;
        self.session.reseal().await?;
        Ok(public)
    }

    /// Stop background sweeps and persist rate-limit state. The session
    /// stays persisted for the next start.
    pub async fn shutdown(mut self) -> GuardResult<()> {
        for task in self.tasks.drain(..) {
            task.cancel();
        }
        self.limiter.persist(self.storage.as_ref()).await
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("codec", &self.codec)
            .field("tokens", &self.tokens)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::environment::{FlagEnvironment, StaticDeviceIdentity};
    use crate::session::SessionState;
    use crate::storage::MemoryStorage;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;

    /// In-process server sharing the client's codec
    #[derive(Default)]
    struct MockServer {
        codec: OnceLock<Arc<EnvelopeCodec>>,
        valid_tokens: Mutex<HashSet<String>>,
        requests: Mutex<Vec<HttpRequest>>,
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        always_401: AtomicBool,
        delay: Mutex<Option<Duration>>,
    }

    impl MockServer {
        fn codec(&self) -> &Arc<EnvelopeCodec> {
            self.codec.get().expect("codec attached")
        }

        fn sealed(&self, status: u16, value: Value) -> HttpResponse {
            HttpResponse::new(status, self.codec().seal_json(&value).unwrap())
                .with_header(headers::ENCRYPTED_CONTENT, "true")
        }

        fn revoke_all(&self) {
            self.valid_tokens.lock().clear();
        }

        fn last_request(&self) -> HttpRequest {
            self.requests.lock().last().cloned().unwrap()
        }

        fn opened_body(&self, request: &HttpRequest) -> Value {
            match &request.body {
                Some(body) => self.codec().open_json(body).unwrap(),
                None => Value::Null,
            }
        }
    }

    #[async_trait]
    impl Transport for MockServer {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().push(request.clone());
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            // The refresh call is plain JSON and carries no request signature
            if request.path != "/auth/refresh" {
                let timestamp: i64 = request.header(headers::TIMESTAMP).unwrap().parse().unwrap();
                let expected = self.codec().sign_request(
                    request.method.as_str(),
                    &request.path,
                    timestamp,
                    request.body.as_deref().unwrap_or_default(),
                );
                if request.header(headers::REQUEST_SIGNATURE) != Some(expected.as_str()) {
                    return Ok(HttpResponse::new(400, "bad signature"));
                }
            }

            match request.path.as_str() {
                "/auth/login" => {
                    self.logins.fetch_add(1, Ordering::SeqCst);
                    let credentials = self.opened_body(&request);
                    if credentials["password"] != "correct" {
                        return Ok(HttpResponse::new(401, Vec::new()));
                    }
                    self.valid_tokens.lock().insert("at-1".into());
                    Ok(self.sealed(
                        200,
                        json!({"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 3600}),
                    ))
                }
                "/auth/refresh" => {
                    let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let access = format!("at-r{}", n);
                    self.valid_tokens.lock().insert(access.clone());
                    let grant = json!({"access_token": access, "expires_in": 3600});
                    Ok(HttpResponse::new(200, grant.to_string()))
                }
                "/auth/logout" => Ok(HttpResponse::new(204, Vec::new())),
                "/api/busy" => Ok(HttpResponse::new(429, Vec::new()).with_header("Retry-After", "7")),
                path if path.starts_with("/public") => Ok(self.sealed(200, json!({"public": true}))),
                path => {
                    let bearer = request
                        .header(headers::AUTHORIZATION)
                        .and_then(|h| h.strip_prefix("Bearer "))
                        .map(str::to_string);
                    let authorized = bearer
                        .map(|t| self.valid_tokens.lock().contains(&t))
                        .unwrap_or(false);
                    if !authorized || self.always_401.load(Ordering::SeqCst) {
                        return Ok(HttpResponse::new(401, Vec::new()));
                    }
                    let echo = self.opened_body(&request);
                    Ok(self.sealed(200, json!({"path": path, "echo": echo})))
                }
            }
        }
    }

    struct Harness {
        server: Arc<MockServer>,
        storage: Arc<MemoryStorage>,
        environment: Arc<FlagEnvironment>,
        guard: Arc<RequestGuard>,
    }

    async fn harness_with(config: GuardConfig, clock: SharedClock) -> Harness {
        let server = Arc::new(MockServer::default());
        let storage = Arc::new(MemoryStorage::new());
        let environment = Arc::new(FlagEnvironment::new());
        let services = GuardServices::new(
            storage.clone(),
            server.clone(),
            Arc::new(StaticDeviceIdentity::new("device-a")),
        )
        .with_environment(environment.clone())
        .with_clock(clock);

        let guard = RequestGuard::open(config, services).await.unwrap();
        assert!(server.codec.set(guard.codec().clone()).is_ok());
        Harness {
            server,
            storage,
            environment,
            guard: Arc::new(guard),
        }
    }

    async fn harness() -> Harness {
        harness_with(GuardConfig::default(), Arc::new(ManualClock::starting_now())).await
    }

    async fn logged_in() -> Harness {
        let h = harness().await;
        h.guard
            .login("ana", json!({"username": "ana", "password": "correct"}))
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn test_login_then_sealed_round_trip() {
        let h = logged_in().await;
        assert_eq!(h.guard.session().state(), SessionState::Active);

        let response = h
            .guard
            .execute(ApiCall::post("/api/notes", json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.body["echo"]["text"], "hi");
        assert_eq!(response.body["path"], "/api/notes");

        let sent = h.server.last_request();
        assert_eq!(sent.header(headers::AUTHORIZATION), Some("Bearer at-1"));
        assert_eq!(sent.header(headers::ENCRYPTED_CONTENT), Some("true"));
        assert_eq!(sent.header(headers::REQUEST_SIGNATURE).unwrap().len(), 64);
        assert!(uuid::Uuid::parse_str(sent.header(headers::REQUEST_ID).unwrap()).is_ok());
        assert_eq!(response.request_id, sent.header(headers::REQUEST_ID).unwrap());
    }

    #[tokio::test]
    async fn test_validation_rejects_before_network() {
        let h = logged_in().await;
        let before = h.server.requests.lock().len();

        let traversal = h.guard.execute(ApiCall::get("/api/../admin")).await;
        assert!(matches!(traversal, Err(GuardError::ValidationRejected(_))));

        let escalation = h
            .guard
            .execute(ApiCall::get("/api/users").with_params(json!({"Role": "admin"})))
            .await;
        assert!(matches!(escalation, Err(GuardError::ValidationRejected(_))));

        assert_eq!(h.server.requests.lock().len(), before);
        assert!(h.guard.tokens().has_tokens());
    }

    #[tokio::test]
    async fn test_query_params_are_encoded() {
        let h = logged_in().await;
        h.guard
            .execute(ApiCall::get("/api/search").with_params(json!({"q": "a b&c"})))
            .await
            .unwrap();
        assert_eq!(h.server.last_request().path, "/api/search?q=a%20b%26c");
    }

    #[tokio::test]
    async fn test_401_refreshes_once_then_retries() {
        let h = logged_in().await;
        h.server.revoke_all();

        let response = h.guard.execute(ApiCall::get("/api/profile")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(h.server.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.server.last_request().header(headers::AUTHORIZATION),
            Some("Bearer at-r1")
        );
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let h = logged_in().await;
        h.server.revoke_all();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let guard = Arc::clone(&h.guard);
                tokio::spawn(async move { guard.execute(ApiCall::get("/api/feed")).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(h.server.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_401_fails_closed() {
        let h = logged_in().await;
        h.server.always_401.store(true, Ordering::SeqCst);

        let result = h.guard.execute(ApiCall::get("/api/profile")).await;
        assert_eq!(result, Err(GuardError::Unauthorized));
        assert!(!h.guard.tokens().has_tokens());
        assert_eq!(h.guard.session().state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_stale_token_refreshed_before_send() {
        let mut config = GuardConfig::default();
        config.session.duration_secs = 7200;
        let clock = Arc::new(ManualClock::starting_now());
        let h = harness_with(config, clock.clone()).await;
        h.guard
            .login("ana", json!({"password": "correct"}))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3400));
        h.guard.execute(ApiCall::get("/api/profile")).await.unwrap();

        assert_eq!(h.server.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.server.last_request().header(headers::AUTHORIZATION),
            Some("Bearer at-r1")
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_stale_token_share_one_refresh() {
        let mut config = GuardConfig::default();
        config.session.duration_secs = 7200;
        let clock = Arc::new(ManualClock::starting_now());
        let h = harness_with(config, clock.clone()).await;
        h.guard
            .login("ana", json!({"password": "correct"}))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3400));
        assert!(h.guard.tokens().is_expired());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let guard = Arc::clone(&h.guard);
                tokio::spawn(async move { guard.execute(ApiCall::get("/api/feed")).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }

        assert_eq!(h.server.refreshes.load(Ordering::SeqCst), 1);
        let feed_calls: Vec<_> = h
            .server
            .requests
            .lock()
            .iter()
            .filter(|r| r.path == "/api/feed")
            .cloned()
            .collect();
        assert_eq!(feed_calls.len(), 10);
        assert!(feed_calls
            .iter()
            .all(|r| r.header(headers::AUTHORIZATION) == Some("Bearer at-r1")));
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures() {
        let h = harness().await;
        for attempt in 1..=5 {
            let result = h.guard.login("ana", json!({"password": "wrong"})).await;
            if attempt < 5 {
                assert_eq!(result, Err(GuardError::Unauthorized));
            } else {
                assert!(matches!(result, Err(GuardError::LockedOut { .. })));
            }
        }

        let locked = h.guard.login("ana", json!({"password": "correct"})).await;
        assert!(matches!(locked, Err(GuardError::LockedOut { .. })));
        assert_eq!(h.server.logins.load(Ordering::SeqCst), 5);
        assert!(!h.guard.tokens().has_tokens());
    }

    #[tokio::test]
    async fn test_compromised_environment_fails_closed() {
        let h = logged_in().await;
        h.environment.set_compromised(true);

        let result = h.guard.execute(ApiCall::get("/api/profile")).await;
        assert_eq!(result, Err(GuardError::EnvironmentCompromised));
        assert!(!h.guard.tokens().has_tokens());
        assert_eq!(h.guard.session().state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited() {
        let h = logged_in().await;
        let result = h.guard.execute(ApiCall::get("/api/busy")).await;
        assert_eq!(
            result,
            Err(GuardError::RateLimited {
                retry_after: Duration::from_secs(7)
            })
        );
        assert!(h.guard.tokens().has_tokens());
    }

    #[tokio::test]
    async fn test_local_rate_limit() {
        let mut config = GuardConfig::default();
        config.rate_limit.default_max_requests = 2;
        let h = harness_with(config, Arc::new(ManualClock::starting_now())).await;

        for _ in 0..2 {
            h.guard
                .execute(ApiCall::get("/public/ping").anonymous())
                .await
                .unwrap();
        }
        let third = h.guard.execute(ApiCall::get("/public/ping").anonymous()).await;
        assert!(matches!(third, Err(GuardError::RateLimited { .. })));
        assert_eq!(h.server.requests.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_step_times_out() {
        let h = harness().await;
        *h.server.delay.lock() = Some(Duration::from_secs(60));

        let result = h.guard.execute(ApiCall::get("/public/slow").anonymous()).await;
        assert!(matches!(result, Err(GuardError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let h = logged_in().await;
        h.guard.logout().await.unwrap();

        assert!(!h.guard.tokens().has_tokens());
        assert_eq!(h.guard.session().state(), SessionState::Ended);
        assert_eq!(h.server.last_request().path, "/auth/logout");
        assert_eq!(
            h.guard.execute(ApiCall::get("/api/profile")).await,
            Err(GuardError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_rotate_keys_keeps_persisted_state_readable() {
        let h = logged_in().await;
        let before = h.guard.codec().public_keys();

        let after = h.guard.rotate_keys().await.unwrap();
        assert_ne!(before.signing, after.signing);
        assert!(h.guard.tokens().load().await.unwrap());
        assert!(h.storage.contains(crate::session::SESSION_STORAGE_KEY));

        let response = h.guard.execute(ApiCall::get("/api/profile")).await.unwrap();
        assert_eq!(response.status, 200);
    }
}
