use thiserror::Error;

/// High-level error category for reporting to the host daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or missing connection settings - nothing was spawned
    Configuration,
    /// SSO phase - helper failed, was cancelled, or produced no token
    Authentication,
    /// Tunnel phase - the tunnel binary could not be kept up
    Connection,
    /// Local system problems - spawning, secret store, busy service
    System,
}

/// Errors produced by the connection orchestrator.
///
/// Payloads are plain strings so the error can be cloned into
/// [`ServiceEvent`](crate::session::ServiceEvent)s.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VpnSsoError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The tunnel binary refused a cached token. Recovered internally by a
    /// fresh SSO run; only surfaces when logged.
    #[error("cached credentials rejected (tunnel exit code {0})")]
    CredentialRejected(i32),

    #[error("tunnel failed: {0}")]
    Tunnel(String),

    #[error("credential cache unavailable: {0}")]
    CacheIo(String),

    /// The orchestrator itself stopped working, e.g. its run loop is gone.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VpnSsoError {
    pub fn spawn(program: impl Into<String>, err: &std::io::Error) -> Self {
        VpnSsoError::Spawn {
            program: program.into(),
            reason: err.to_string(),
        }
    }

    /// Returns the high-level category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            VpnSsoError::Config(_) => ErrorCategory::Configuration,
            VpnSsoError::Authentication(_) => ErrorCategory::Authentication,
            VpnSsoError::CredentialRejected(_) | VpnSsoError::Tunnel(_) => {
                ErrorCategory::Connection
            }
            VpnSsoError::Busy
            | VpnSsoError::Spawn { .. }
            | VpnSsoError::CacheIo(_)
            | VpnSsoError::Internal(_) => ErrorCategory::System,
        }
    }

    /// Returns the user-facing error message
    pub fn user_message(&self) -> String {
        match self {
            VpnSsoError::Config(msg) => {
                format!("The VPN connection is not configured correctly.\n\n{}", msg)
            }
            VpnSsoError::Busy => {
                "A VPN connection is already being established. Disconnect first.".to_string()
            }
            VpnSsoError::Spawn { program, reason } => format!(
                "Could not start {}.\n\n{}\n\nCheck that it is installed.",
                program, reason
            ),
            VpnSsoError::Authentication(reason) => {
                format!("Single sign-on did not complete.\n\n{}", reason)
            }
            VpnSsoError::CredentialRejected(_) => {
                "The saved session was rejected by the gateway.".to_string()
            }
            VpnSsoError::Tunnel(reason) => format!("The VPN tunnel failed.\n\n{}", reason),
            VpnSsoError::CacheIo(reason) => {
                format!("The credential store is not available.\n\n{}", reason)
            }
            VpnSsoError::Internal(reason) => {
                format!("The VPN service stopped unexpectedly.\n\n{}", reason)
            }
        }
    }
}

pub type Result<T, E = VpnSsoError> = std::result::Result<T, E>;
