use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{EdgeError, EdgeResult, ProtocolProxy, Registration};
use crate::config::env_string;

const SECRET_HEADER: &str = "X-Zpack-Secret";
const DEDUP_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct VelocityConfig {
    pub base_url: String,
    /// Shared secret; hashed before it goes on the wire.
    pub secret: String,
}

impl VelocityConfig {
    pub fn from_env() -> Result<Self, EdgeError> {
        Ok(Self {
            base_url: env_string("VELOCITY_URL")
                .unwrap_or_else(|| "http://10.70.0.241:8081".to_string())
                .trim_end_matches('/')
                .to_string(),
            secret: env_string("ZPACK_SECRET")
                .ok_or_else(|| EdgeError::Config("ZPACK_SECRET is required".to_string()))?,
        })
    }
}

pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    server_name: &'a str,
    address: &'a str,
    port: u16,
}

#[derive(Serialize)]
struct UnregisterBody<'a> {
    server_name: &'a str,
}

/// Remembers recent registrations so a retried publish does not hit the
/// proxy twice with the same backend.
#[derive(Default)]
struct RecentRegistrations {
    seen: Mutex<HashMap<String, Instant>>,
}

impl RecentRegistrations {
    fn key(name: &str, address: &str, port: u16) -> String {
        format!("{name}|{address}|{port}")
    }

    fn is_recent(&self, key: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, at| now.duration_since(*at) < DEDUP_WINDOW);
        seen.contains_key(key)
    }

    fn remember(&self, key: String, now: Instant) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(key, now);
    }

    fn forget_name(&self, name: &str) {
        let prefix = format!("{name}|");
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|k, _| !k.starts_with(&prefix));
    }
}

/// Client for the Minecraft proxy's zpack registration plugin.
pub struct VelocityProxy {
    http: reqwest::Client,
    base_url: String,
    secret_hash: String,
    recent: RecentRegistrations,
}

impl VelocityProxy {
    pub fn new(cfg: VelocityConfig) -> Result<Self, EdgeError> {
        let http = reqwest::Client::builder()
            .user_agent("zlh-control")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| EdgeError::Transport {
                op: "velocity client",
                source,
            })?;
        Ok(Self {
            http,
            base_url: cfg.base_url,
            secret_hash: secret_digest(&cfg.secret),
            recent: RecentRegistrations::default(),
        })
    }

    async fn post<T: Serialize>(&self, op: &'static str, path: &str, body: &T) -> EdgeResult<u16> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header(SECRET_HEADER, &self.secret_hash)
            .json(body)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { op, source })?;
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(status);
        }
        Err(EdgeError::Api {
            op,
            status,
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ProtocolProxy for VelocityProxy {
    async fn register(&self, name: &str, address: &str, port: u16) -> EdgeResult<Registration> {
        let key = RecentRegistrations::key(name, address, port);
        if self.recent.is_recent(&key, Instant::now()) {
            tracing::debug!(server = name, "duplicate proxy registration skipped");
            return Ok(Registration::DuplicateSkipped);
        }
        self.post(
            "velocity register",
            "/zpack/register",
            &RegisterBody {
                server_name: name,
                address,
                port,
            },
        )
        .await?;
        self.recent.remember(key, Instant::now());
        tracing::info!(server = name, address, port, "registered with proxy");
        Ok(Registration::Registered)
    }

    async fn unregister(&self, name: &str) -> EdgeResult<()> {
        self.recent.forget_name(name);
        match self
            .post("velocity unregister", "/zpack/unregister", &UnregisterBody { server_name: name })
            .await
        {
            Ok(_) => Ok(()),
            Err(EdgeError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
