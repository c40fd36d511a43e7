use clap::{Parser, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;
use vpn_sso::config::CacheBackendKind;
use vpn_sso::Protocol;

#[derive(Parser, Debug)]
#[command(name = "vpn-sso-service", version, about = "Bring up an SSO-authenticated OpenConnect tunnel")]
pub struct Args {
    /// Connection settings as a JSON file (gateway, protocol, username, ...)
    #[arg(short, long, conflicts_with = "gateway")]
    pub config: Option<PathBuf>,

    /// VPN gateway host name
    #[arg(short, long)]
    pub gateway: Option<String>,

    /// VPN protocol: globalprotect (gp) or anyconnect (ac)
    #[arg(short, long, default_value = "globalprotect", value_parser = parse_protocol)]
    pub protocol: Protocol,

    /// User name passed to the tunnel binary
    #[arg(short, long)]
    pub user: Option<String>,

    /// GlobalProtect usergroup for fresh SSO tokens
    #[arg(long)]
    pub usergroup: Option<String>,

    /// Extra arguments for the tunnel binary, separated by spaces
    #[arg(long, allow_hyphen_values = true)]
    pub extra_args: Option<String>,

    /// How long a session token is reused, in hours (non-positive means 8)
    #[arg(long, default_value_t = vpn_sso::config::DEFAULT_CACHE_HOURS)]
    pub cache_hours: i64,

    /// Open the login page in the system browser instead of the helper's own window
    #[arg(long)]
    pub external_browser: bool,

    /// Service settings file (helper paths, timeouts, cache backend)
    #[arg(short, long, default_value = "/etc/vpn-sso/settings.json")]
    pub settings: PathBuf,

    /// Override the credential cache backend from the settings file
    #[arg(long, value_enum)]
    pub cache_backend: Option<CacheBackendArg>,

    /// Reconnect whenever the tunnel goes down, until interrupted
    #[arg(long)]
    pub persist: bool,

    /// Forget cached credentials (for the given gateway, or all) and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Only run the SSO helper and report whether a token was obtained
    #[arg(long)]
    pub authenticate_only: bool,

    /// Print every service event as a JSON line on stdout
    #[arg(long)]
    pub json: bool,

    /// Log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub level: LogLevel,
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    s.parse::<Protocol>().map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackendArg {
    Auto,
    SecretTool,
    File,
}

impl From<CacheBackendArg> for CacheBackendKind {
    fn from(kind: CacheBackendArg) -> Self {
        match kind {
            CacheBackendArg::Auto => CacheBackendKind::Auto,
            CacheBackendArg::SecretTool => CacheBackendKind::SecretTool,
            CacheBackendArg::File => CacheBackendKind::File,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_are_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn protocol_aliases() {
        let args = Args::parse_from(["vpn-sso-service", "-g", "vpn.example.com", "-p", "AC"]);
        assert_eq!(args.protocol, Protocol::AnyConnect);
        assert_eq!(args.cache_hours, 8);
        assert!(Args::try_parse_from(["vpn-sso-service", "-p", "ipsec"]).is_err());
    }

    #[test]
    fn config_file_excludes_gateway() {
        assert!(Args::try_parse_from([
            "vpn-sso-service",
            "--config",
            "/tmp/c.json",
            "--gateway",
            "gw"
        ])
        .is_err());
    }
}
