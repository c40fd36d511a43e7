//! Credential cache keyed by (gateway, protocol).
//!
//! Each entry is stored as one small JSON record. Backends only move opaque
//! record strings around; expiry and (de)serialization live in
//! [`CredentialCache`] so every backend behaves the same.

pub mod file;
pub mod secret_tool;
pub mod worker;

use crate::config::{CacheBackendKind, Protocol, ServiceSettings, DEFAULT_CACHE_HOURS};
use crate::error::VpnSsoError;
use crate::secret::{Credential, SecretString};
use crate::session_env::EnvironmentSource;
use crate::utils::unix_now;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroizing;

pub use file::FileBackend;
pub use secret_tool::SecretToolBackend;
pub use worker::{CacheOp, CacheReply, CacheWorker};

/// Storage for serialized records.
pub trait CacheBackend: Send {
    fn name(&self) -> &'static str;
    fn load(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<Option<Zeroizing<String>>>;
    fn save(&self, gateway: &str, protocol: Protocol, record: &str) -> anyhow::Result<()>;
    fn remove(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<()>;
    fn remove_all(&self) -> anyhow::Result<()>;
}

/// A credential as read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCredential {
    pub gateway: String,
    pub protocol: Protocol,
    pub credential: Credential,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CachedCredential {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize)]
struct RecordOut<'a> {
    gateway: &'a str,
    protocol: Protocol,
    created_at: i64,
    expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usergroup: Option<&'a str>,
}

#[derive(Deserialize)]
struct RecordIn {
    gateway: String,
    protocol: Protocol,
    created_at: i64,
    expires_at: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    cookie: Option<String>,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    usergroup: Option<String>,
}

/// Front end over a [`CacheBackend`].
pub struct CredentialCache {
    backend: Box<dyn CacheBackend>,
    clock: fn() -> i64,
}

impl CredentialCache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            clock: unix_now,
        }
    }

    /// Replaces the wall clock, for expiry tests.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Picks the backend named in `settings`.
    ///
    /// `auto` prefers the desktop secret store when `secret-tool` is
    /// installed and a session bus can be found, and falls back to files.
    pub fn from_settings(
        settings: &ServiceSettings,
        environment: Arc<dyn EnvironmentSource>,
    ) -> Result<Self, VpnSsoError> {
        let file_backend = || -> Result<Box<dyn CacheBackend>, VpnSsoError> {
            let dir = match &settings.cache_dir {
                Some(dir) => dir.clone(),
                None => file::default_cache_dir().map_err(cache_io)?,
            };
            Ok(Box::new(FileBackend::new(dir)))
        };

        let backend: Box<dyn CacheBackend> = match settings.cache_backend {
            CacheBackendKind::File => file_backend()?,
            CacheBackendKind::SecretTool => Box::new(SecretToolBackend::new(environment)),
            CacheBackendKind::Auto => match SecretToolBackend::detect(environment) {
                Some(backend) => Box::new(backend),
                None => file_backend()?,
            },
        };
        log::info!("Credential cache backend: {}", backend.name());
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Persists `credential` for `ttl_hours` (non-positive means 8 hours).
    pub fn store(
        &self,
        gateway: &str,
        protocol: Protocol,
        credential: &Credential,
        ttl_hours: i64,
    ) -> Result<CachedCredential, VpnSsoError> {
        let ttl_hours = if ttl_hours > 0 {
            ttl_hours
        } else {
            DEFAULT_CACHE_HOURS
        };
        let created_at = (self.clock)();
        let expires_at = created_at + ttl_hours * 3600;

        let record = RecordOut {
            gateway,
            protocol,
            created_at,
            expires_at,
            username: credential.username.as_deref(),
            cookie: (!credential.token.is_empty()).then(|| credential.token.expose()),
            fingerprint: credential.fingerprint.as_deref(),
            usergroup: credential.usergroup.as_deref(),
        };
        let json = Zeroizing::new(serde_json::to_string(&record).map_err(cache_io)?);

        self.backend
            .save(gateway, protocol, &json)
            .map_err(cache_io)?;
        log::info!(
            "Cached credentials for {} ({}) for {} hours",
            gateway,
            protocol,
            ttl_hours
        );

        Ok(CachedCredential {
            gateway: gateway.to_string(),
            protocol,
            credential: credential.clone(),
            created_at,
            expires_at,
        })
    }

    /// Returns the live entry for the key. Expired or unreadable entries are
    /// removed and reported as absent.
    pub fn lookup(
        &self,
        gateway: &str,
        protocol: Protocol,
    ) -> Result<Option<CachedCredential>, VpnSsoError> {
        let Some(json) = self.backend.load(gateway, protocol).map_err(cache_io)? else {
            log::debug!("No cached credentials for {} ({})", gateway, protocol);
            return Ok(None);
        };

        let record: RecordIn = match serde_json::from_str(&json) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Discarding unreadable cache entry for {}: {}", gateway, e);
                self.discard(gateway, protocol);
                return Ok(None);
            }
        };

        let cached = CachedCredential {
            gateway: record.gateway,
            protocol: record.protocol,
            credential: Credential {
                token: record.cookie.map(SecretString::new).unwrap_or_default(),
                fingerprint: record.fingerprint,
                usergroup: record.usergroup,
                username: record.username,
            },
            created_at: record.created_at,
            expires_at: record.expires_at,
        };

        let now = (self.clock)();
        if cached.is_expired(now) {
            log::info!("Cached credentials for {} expired, removing", gateway);
            self.discard(gateway, protocol);
            return Ok(None);
        }
        if cached.credential.token.is_empty() {
            log::warn!("Cache entry for {} holds no token, removing", gateway);
            self.discard(gateway, protocol);
            return Ok(None);
        }

        log::info!(
            "Found cached credentials for {} (expire in {} s)",
            gateway,
            cached.expires_at - now
        );
        Ok(Some(cached))
    }

    pub fn clear(&self, gateway: &str, protocol: Protocol) -> Result<(), VpnSsoError> {
        self.backend.remove(gateway, protocol).map_err(cache_io)?;
        log::info!("Cleared cached credentials for {} ({})", gateway, protocol);
        Ok(())
    }

    pub fn clear_all(&self) -> Result<(), VpnSsoError> {
        self.backend.remove_all().map_err(cache_io)?;
        log::info!("Cleared all cached credentials");
        Ok(())
    }

    fn discard(&self, gateway: &str, protocol: Protocol) {
        if let Err(e) = self.backend.remove(gateway, protocol) {
            log::warn!("Failed to remove cache entry for {}: {:#}", gateway, e);
        }
    }
}

fn cache_io(e: impl std::fmt::Display) -> VpnSsoError {
    VpnSsoError::CacheIo(format!("{:#}", e))
}
