//! ALFA Session Guard - CLI
//!
//! Local tooling around the guard: config dump, key stretching, envelope
//! round-trips and an in-process demo of the refresh path.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use alfa_session_guard::config::MIN_PBKDF2_ITERATIONS;
use alfa_session_guard::crypto::{stretch_secret_blocking, KdfParams};
use alfa_session_guard::environment::StaticDeviceIdentity;
use alfa_session_guard::transport::headers;
use alfa_session_guard::{
    ApiCall, EnvelopeCodec, FileStorage, GuardConfig, GuardServices, HttpRequest, HttpResponse,
    MemoryStorage, NonceRegistry, RequestGuard, SystemClock, Transport, TransportError,
};

#[derive(Parser)]
#[command(name = "alfa-guard")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_session_guard::VERSION)]
#[command(about = "ALFA Session Guard - request envelopes, replay protection and session control")]
struct Cli {
    /// Directory holding the key bundle and other sealed state
    #[arg(short, long, default_value = "./guard-state")]
    state: PathBuf,

    /// JSON config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Stretch a passphrase into a working key and print its parameters
    Keygen {
        /// Passphrase (read from stdin when omitted)
        #[arg(short, long)]
        passphrase: Option<String>,

        #[arg(short, long, default_value_t = MIN_PBKDF2_ITERATIONS)]
        iterations: u32,
    },

    /// Seal a JSON payload into a wire envelope
    Seal {
        /// JSON payload (read from stdin when omitted)
        payload: Option<String>,
    },

    /// Open a wire envelope sealed with the same state directory
    Open {
        /// Wire envelope JSON (read from stdin when omitted)
        envelope: Option<String>,
    },

    /// Run an in-process server and show single-flight refresh
    Demo {
        /// Concurrent requests racing the same expired token
        #[arg(short, long, default_value_t = 10)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn arg_or_stdin(arg: Option<String>) -> anyhow::Result<String> {
    match arg {
        Some(value) => Ok(value),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading stdin")?;
            Ok(input.trim().to_string())
        }
    }
}

async fn local_codec(state: &Path, config: &GuardConfig) -> anyhow::Result<EnvelopeCodec> {
    let clock = Arc::new(SystemClock);
    let nonces = Arc::new(NonceRegistry::new(config.nonce_validity(), clock.clone()));
    let storage = Arc::new(FileStorage::new(state));
    Ok(EnvelopeCodec::load_or_create(nonces, storage, clock, &config.envelope).await?)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => GuardConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => GuardConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Keygen {
            passphrase,
            iterations,
        } => {
            let secret = Zeroizing::new(arg_or_stdin(passphrase)?.into_bytes());
            if secret.is_empty() {
                bail!("passphrase must not be empty");
            }
            let params = KdfParams::with_random_salt(iterations);
            let key = stretch_secret_blocking(secret, params.clone()).await?;
            let fingerprint = hex::encode(&Sha256::digest(key.expose())[..8]);

            println!("algorithm:   {}", params.algorithm);
            println!("iterations:  {}", params.iterations);
            println!("salt:        {}", params.salt);
            println!("fingerprint: {}", fingerprint);
        }

        Commands::Seal { payload } => {
            let payload: Value =
                serde_json::from_str(&arg_or_stdin(payload)?).context("payload must be JSON")?;
            let codec = local_codec(&cli.state, &config).await?;
            println!("{}", codec.seal_json(&payload)?);
        }

        Commands::Open { envelope } => {
            let wire = arg_or_stdin(envelope)?;
            let codec = local_codec(&cli.state, &config).await?;
            let payload: Value = codec.open_json(wire.as_bytes())?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Commands::Demo { concurrency } => demo(config, concurrency).await?,
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEMO
// ═══════════════════════════════════════════════════════════════════════════════

/// Server side of the demo. Shares the client's codec, so it opens what the
/// client seals and seals what the client opens.
#[derive(Default)]
struct DemoServer {
    codec: OnceLock<Arc<EnvelopeCodec>>,
    current_token: Mutex<String>,
    refreshes: AtomicUsize,
}

impl DemoServer {
    fn sealed(&self, value: Value) -> Result<HttpResponse, TransportError> {
        let codec = self
            .codec
            .get()
            .ok_or_else(|| TransportError::Other("server not attached".into()))?;
        let wire = codec
            .seal_json(&value)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(HttpResponse::new(200, wire).with_header(headers::ENCRYPTED_CONTENT, "true"))
    }
}

#[async_trait]
impl Transport for DemoServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        match request.path.as_str() {
            "/auth/login" => {
                *self.current_token.lock() = "demo-access-0".into();
                self.sealed(json!({
                    "access_token": "demo-access-0",
                    "refresh_token": "demo-refresh",
                    "expires_in": 3600,
                }))
            }
            "/auth/refresh" => {
                let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
                let token = format!("demo-access-{}", n);
                *self.current_token.lock() = token.clone();
                let grant = json!({"access_token": token, "expires_in": 3600});
                Ok(HttpResponse::new(200, grant.to_string()))
            }
            _ => {
                let expected = format!("Bearer {}", self.current_token.lock());
                if request.header(headers::AUTHORIZATION) != Some(expected.as_str()) {
                    return Ok(HttpResponse::new(401, Vec::new()));
                }
                self.sealed(json!({"ok": true, "path": request.path}))
            }
        }
    }
}

async fn demo(config: GuardConfig, concurrency: usize) -> anyhow::Result<()> {
    let server = Arc::new(DemoServer::default());
    let services = GuardServices::new(
        Arc::new(MemoryStorage::new()),
        server.clone(),
        Arc::new(StaticDeviceIdentity::new("demo-device")),
    );
    let guard = Arc::new(RequestGuard::open(config, services).await?);
    if server.codec.set(guard.codec().clone()).is_err() {
        bail!("demo server already attached");
    }

    let session = guard
        .login("demo-user", json!({"username": "demo-user", "password": "demo"}))
        .await?;
    println!("session {} started", session.session_id);

    // Server-side revocation: every in-flight token is now stale
    *server.current_token.lock() = "revoked".into();

    let calls: Vec<_> = (0..concurrency)
        .map(|i| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.execute(ApiCall::get(format!("/api/item/{}", i))).await })
        })
        .collect();

    let mut succeeded = 0;
    for call in calls {
        match call.await? {
            Ok(_) => succeeded += 1,
            Err(e) => println!("request failed: {}", e),
        }
    }

    println!("{}/{} requests succeeded", succeeded, concurrency);
    println!(
        "{} refresh call(s) reached the server",
        server.refreshes.load(Ordering::SeqCst)
    );

    guard.logout().await?;
    println!("logged out");
    Ok(())
}
