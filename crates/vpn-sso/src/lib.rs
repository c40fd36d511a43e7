//! # VPN SSO connection orchestrator
//!
//! Brings up an OpenConnect tunnel authenticated through a browser based
//! SSO helper. A connect request first looks for a cached session token;
//! without one the SSO helper is started in the user's desktop session, and
//! its token is handed to the tunnel binary, whose output is parsed for the
//! tunnel configuration.

pub mod cache;
pub mod config;
pub mod error;
pub mod launcher;
pub mod logger;
pub mod process;
pub mod secret;
pub mod session;
pub mod session_env;
pub mod sso;
pub mod tunnel;
pub mod utils;

// Re-export commonly used items
pub use cache::CredentialCache;
pub use config::{ConnectionConfig, Protocol, ServiceSettings};
pub use error::{ErrorCategory, VpnSsoError};
pub use logger::init_logger;
pub use secret::{Credential, SecretString};
pub use session::{ConnectionState, ServiceEvent, VpnService, VpnServiceBuilder};
pub use session_env::{EnvironmentSource, SessionEnvironment, SessionResolver};
pub use tunnel::TunnelConfig;
pub use utils::CancellationToken;
