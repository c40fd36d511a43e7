//! Connection and service configuration.
//!
//! [`ConnectionConfig`] describes one VPN profile and is immutable for the
//! lifetime of a connection attempt. [`ServiceSettings`] holds process-wide
//! knobs (tool locations, timeouts, cache backend) and is loaded once.

use crate::error::VpnSsoError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Keys used by the host daemon's per-connection data dictionary.
pub const KEY_GATEWAY: &str = "gateway";
pub const KEY_PROTOCOL: &str = "protocol";
pub const KEY_USERNAME: &str = "username";
pub const KEY_USERGROUP: &str = "usergroup";
pub const KEY_EXTRA_ARGS: &str = "extra-args";
pub const KEY_CACHE_HOURS: &str = "cache-hours";
pub const KEY_EXTERNAL_BROWSER: &str = "external-browser";

pub const DEFAULT_CACHE_HOURS: i64 = 8;

/// The two tunnel protocols this service can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Palo Alto GlobalProtect (`gp-saml-gui` + `openconnect --protocol=gp`)
    #[serde(alias = "gp")]
    GlobalProtect,
    /// Cisco AnyConnect (`openconnect-sso` + `openconnect --protocol=anyconnect`)
    #[serde(alias = "ac")]
    AnyConnect,
}

impl Protocol {
    /// Name used in configuration and as part of the cache key.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::GlobalProtect => "globalprotect",
            Protocol::AnyConnect => "anyconnect",
        }
    }

    /// Value of the tunnel binary's `--protocol=` flag.
    pub fn tunnel_flag(self) -> &'static str {
        match self {
            Protocol::GlobalProtect => "gp",
            Protocol::AnyConnect => "anyconnect",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = VpnSsoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "globalprotect" | "gp" => Ok(Protocol::GlobalProtect),
            "anyconnect" | "ac" => Ok(Protocol::AnyConnect),
            "" => Err(VpnSsoError::Config("protocol not specified".into())),
            other => Err(VpnSsoError::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

fn default_cache_hours() -> i64 {
    DEFAULT_CACHE_HOURS
}

/// One VPN profile, as handed over by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    pub gateway: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub usergroup: Option<String>,
    #[serde(default)]
    pub extra_args: Option<String>,
    #[serde(default = "default_cache_hours")]
    pub cache_hours: i64,
    #[serde(default)]
    pub external_browser: bool,
}

impl ConnectionConfig {
    pub fn new(gateway: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            gateway: gateway.into(),
            protocol,
            username: None,
            usergroup: None,
            extra_args: None,
            cache_hours: DEFAULT_CACHE_HOURS,
            external_browser: false,
        }
    }

    /// Builds a profile from the host daemon's string dictionary.
    ///
    /// Empty strings are treated as unset. A missing or unparsable
    /// `cache-hours` falls back to the default.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, VpnSsoError> {
        let get = |key: &str| {
            data.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let gateway =
            get(KEY_GATEWAY).ok_or_else(|| VpnSsoError::Config("gateway not specified".into()))?;
        let protocol = get(KEY_PROTOCOL).unwrap_or_default().parse::<Protocol>()?;

        let cache_hours = get(KEY_CACHE_HOURS)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_CACHE_HOURS);

        let external_browser = get(KEY_EXTERNAL_BROWSER)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"))
            .unwrap_or(false);

        Ok(Self {
            gateway,
            protocol,
            username: get(KEY_USERNAME),
            usergroup: get(KEY_USERGROUP),
            extra_args: get(KEY_EXTRA_ARGS),
            cache_hours,
            external_browser,
        })
    }

    /// Checks what must hold before anything is spawned.
    pub fn validate(&self) -> Result<(), VpnSsoError> {
        if self.gateway.trim().is_empty() {
            return Err(VpnSsoError::Config("gateway not specified".into()));
        }
        Ok(())
    }

    /// Extra tunnel arguments split on whitespace.
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Cache lifetime with non-positive values mapped to the default.
    pub fn effective_cache_hours(&self) -> i64 {
        if self.cache_hours > 0 {
            self.cache_hours
        } else {
            DEFAULT_CACHE_HOURS
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Which credential store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackendKind {
    /// Secret store when `secret-tool` and a session bus are available, file otherwise.
    Auto,
    SecretTool,
    File,
}

/// Process-wide settings. Every field has a default, so an empty JSON object
/// (or no settings file at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceSettings {
    pub gp_sso_helper: PathBuf,
    pub ac_sso_helper: PathBuf,
    /// Name or path of the tunnel binary.
    pub tunnel_binary: String,
    /// Prepended to `PATH` for the SSO helpers.
    pub tools_dir: PathBuf,
    pub sso_timeout_secs: u64,
    pub disconnect_grace_ms: u64,
    /// How long to wait for the exit after a forced kill before giving up on the process.
    pub kill_wait_ms: u64,
    pub device_poll_interval_ms: u64,
    pub device_poll_attempts: u32,
    pub net_device_dir: PathBuf,
    pub cache_backend: CacheBackendKind,
    /// Directory of the file backend; `None` picks a per-user or system default.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            gp_sso_helper: PathBuf::from("/opt/gnome-vpn-sso/bin/gp-saml-gui"),
            ac_sso_helper: PathBuf::from("/opt/gnome-vpn-sso/bin/openconnect-sso"),
            tunnel_binary: "openconnect".to_string(),
            tools_dir: PathBuf::from("/opt/gnome-vpn-sso/bin"),
            sso_timeout_secs: 300,
            disconnect_grace_ms: 5_000,
            kill_wait_ms: 2_000,
            device_poll_interval_ms: 100,
            device_poll_attempts: 50,
            net_device_dir: PathBuf::from("/sys/class/net"),
            cache_backend: CacheBackendKind::Auto,
            cache_dir: None,
        }
    }
}

impl ServiceSettings {
    pub fn sso_helper(&self, protocol: Protocol) -> &Path {
        match protocol {
            Protocol::GlobalProtect => &self.gp_sso_helper,
            Protocol::AnyConnect => &self.ac_sso_helper,
        }
    }

    pub fn sso_timeout(&self) -> Duration {
        Duration::from_secs(self.sso_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }

    /// Reads settings from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn from_data_reads_all_keys() {
        let cfg = ConnectionConfig::from_data(&data(&[
            ("gateway", "vpn.example.com"),
            ("protocol", "anyconnect"),
            ("username", "alice"),
            ("usergroup", "staff"),
            ("extra-args", "--no-dtls  --mtu=1300"),
            ("cache-hours", "12"),
            ("external-browser", "yes"),
        ]))
        .unwrap();

        assert_eq!(cfg.gateway, "vpn.example.com");
        assert_eq!(cfg.protocol, Protocol::AnyConnect);
        assert_eq!(cfg.username.as_deref(), Some("alice"));
        assert_eq!(cfg.usergroup.as_deref(), Some("staff"));
        assert_eq!(cfg.extra_args(), vec!["--no-dtls", "--mtu=1300"]);
        assert_eq!(cfg.cache_hours, 12);
        assert!(cfg.external_browser);
    }

    #[test]
    fn from_data_requires_gateway_and_protocol() {
        let err = ConnectionConfig::from_data(&data(&[("protocol", "gp")])).unwrap_err();
        assert!(matches!(err, VpnSsoError::Config(_)));

        let err = ConnectionConfig::from_data(&data(&[("gateway", "vpn.example.com")]))
            .unwrap_err();
        assert!(matches!(err, VpnSsoError::Config(_)));

        let err = ConnectionConfig::from_data(&data(&[
            ("gateway", "vpn.example.com"),
            ("protocol", "wireguard"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("wireguard"));
    }

    #[test]
    fn bad_cache_hours_fall_back_to_default() {
        let cfg = ConnectionConfig::from_data(&data(&[
            ("gateway", "gw"),
            ("protocol", "GlobalProtect"),
            ("cache-hours", "soon"),
        ]))
        .unwrap();
        assert_eq!(cfg.cache_hours, DEFAULT_CACHE_HOURS);

        let mut cfg = ConnectionConfig::new("gw", Protocol::GlobalProtect);
        cfg.cache_hours = -3;
        assert_eq!(cfg.effective_cache_hours(), DEFAULT_CACHE_HOURS);
    }

    #[test]
    fn json_profile_uses_defaults() {
        let cfg: ConnectionConfig =
            serde_json::from_str(r#"{"gateway":"vpn.example.com","protocol":"gp"}"#).unwrap();
        assert_eq!(cfg.protocol, Protocol::GlobalProtect);
        assert_eq!(cfg.cache_hours, DEFAULT_CACHE_HOURS);
        assert!(!cfg.external_browser);
        assert!(cfg.username.is_none());
    }

    #[test]
    fn empty_settings_object_is_valid() {
        let settings: ServiceSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ServiceSettings::default());
        assert_eq!(settings.sso_timeout(), Duration::from_secs(300));
        assert_eq!(settings.disconnect_grace(), Duration::from_secs(5));
    }

    #[test]
    fn whitespace_gateway_fails_validation() {
        let cfg = ConnectionConfig::new("   ", Protocol::AnyConnect);
        assert!(matches!(cfg.validate(), Err(VpnSsoError::Config(_))));
    }
}
