//! SSO helper launching and result extraction.
//!
//! The helper opens a browser, lets the user log in, prints the resulting
//! session token on stdout and exits. [`SsoProcess`] is the non-blocking
//! form driven by the connection loop; [`authenticate`] wraps it for callers
//! that simply want to wait.

use crate::config::{ConnectionConfig, Protocol, ServiceSettings};
use crate::error::VpnSsoError;
use crate::launcher::{LaunchSpec, Launcher};
use crate::process::{ExitOutcome, ProcessEvent, ProcessHandle, ProcessKind, ProcessTag, Stream};
use crate::secret::{Credential, SecretString};
use crate::session_env::{EnvironmentSource, SessionEnvironment};
use crate::utils::CancellationToken;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Usergroup openconnect expects for a GlobalProtect prelogin cookie.
pub const GP_PRELOGIN_USERGROUP: &str = "portal:prelogin-cookie";

/// Bare lines shorter than this are never taken for a token.
const MIN_BARE_TOKEN_LEN: usize = 21;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Builds the helper command line and environment.
pub fn helper_spec(
    settings: &ServiceSettings,
    config: &ConnectionConfig,
    session: Option<&SessionEnvironment>,
) -> LaunchSpec {
    let mut spec = LaunchSpec::new(settings.sso_helper(config.protocol));

    spec = match config.protocol {
        Protocol::GlobalProtect => {
            spec = spec.args(["--portal", config.gateway.as_str()]);
            if let Some(user) = &config.username {
                spec = spec.args(["--user", user.as_str()]);
            }
            if config.external_browser {
                spec = spec.arg("--external");
            }
            spec.args(["--", "--protocol=gp"])
        }
        // No --user: the helper would then ask for a password on a TTY we do not have.
        Protocol::AnyConnect => {
            spec = spec.args(["--server", config.gateway.as_str(), "--authenticate"]);
            if config.external_browser {
                spec.arg("--external-browser")
            } else {
                spec.args(["--browser-display-mode", "shown"])
            }
        }
    };

    let inherited_path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    let path = format!("{}:{}", settings.tools_dir.display(), inherited_path);

    match session {
        Some(session) => {
            spec.env_clear = true;
            spec.env.extend(session.vars());
            spec.run_as = session.run_as();
            if let Some(run_as) = &spec.run_as {
                log::info!("SSO helper will run as uid {} gid {}", run_as.uid, run_as.gid);
            }
        }
        None => log::warn!("No desktop session found, the SSO window may not appear"),
    }
    spec.env("PATH", path)
        .env("QT_QPA_PLATFORM", "xcb")
        .env("GDK_BACKEND", "x11")
}

/// Extracts the credential from the helper's complete stdout.
///
/// Understands `COOKIE=` (optionally shell-quoted), `prelogin-cookie=`,
/// `FINGERPRINT=`, `USER=`/`user=` and `HOST=`. Without any prefixed token
/// the last long bare line is used.
pub fn parse_helper_output(output: &str) -> Option<Credential> {
    let mut cookie: Option<Zeroizing<String>> = None;
    let mut prelogin: Option<Zeroizing<String>> = None;
    let mut bare: Option<&str> = None;
    let mut credential = Credential::default();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(value) = line.strip_prefix("COOKIE=") {
            cookie = Some(Zeroizing::new(unquote(value).to_string()));
        } else if let Some(value) = line.strip_prefix("prelogin-cookie=") {
            prelogin = Some(Zeroizing::new(value.to_string()));
        } else if let Some(value) = line.strip_prefix("FINGERPRINT=") {
            credential.fingerprint = Some(value.to_string()).filter(|v| !v.is_empty());
        } else if let Some(value) = line
            .strip_prefix("USER=")
            .or_else(|| line.strip_prefix("user="))
        {
            credential.username = Some(unquote(value).to_string()).filter(|v| !v.is_empty());
        } else if let Some(value) = line.strip_prefix("HOST=") {
            log::info!("SSO helper reports host {}", value);
        } else if !is_assignment(line)
            && line.len() >= MIN_BARE_TOKEN_LEN
            && !line.starts_with("ERROR")
            && !line.starts_with("WARNING")
        {
            bare = Some(line);
        }
    }

    let token = cookie
        .or(prelogin)
        .map(|t| t.to_string())
        .or_else(|| bare.map(str::to_string))
        .filter(|t| !t.is_empty())?;
    credential.token = SecretString::new(token);
    Some(credential)
}

/// `true` for `KEY=value` lines such as `OS=linux-64`, which are not tokens.
fn is_assignment(line: &str) -> bool {
    line.split_once('=').is_some_and(|(key, _)| {
        !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    })
}

/// Strips one pair of surrounding single quotes.
fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}

/// A running SSO helper, driven by whoever receives its events.
#[derive(Debug)]
pub struct SsoProcess {
    handle: ProcessHandle,
    protocol: Protocol,
    usergroup: Option<String>,
    output: Zeroizing<String>,
    deadline: Instant,
    cancelled: bool,
}

impl SsoProcess {
    /// Resolves the desktop session and starts the helper.
    pub fn start<T>(
        launcher: &dyn Launcher,
        environment: &dyn EnvironmentSource,
        settings: &ServiceSettings,
        config: &ConnectionConfig,
        attempt: u64,
        events: Sender<T>,
    ) -> Result<Self, VpnSsoError>
    where
        T: From<ProcessEvent> + Send + 'static,
    {
        let session = environment.resolve();
        let spec = helper_spec(settings, config, session.as_ref());
        log::info!(
            "Starting SSO authentication for {} via {}",
            config.gateway,
            spec.program_name()
        );

        let tag = ProcessTag {
            attempt,
            kind: ProcessKind::Sso,
        };
        let handle = ProcessHandle::spawn(launcher, &spec, tag, events)?;

        Ok(Self {
            handle,
            protocol: config.protocol,
            usergroup: config.usergroup.clone(),
            output: Zeroizing::new(String::new()),
            deadline: Instant::now() + settings.sso_timeout(),
            cancelled: false,
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn on_line(&mut self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => {
                self.output.push_str(line);
                self.output.push('\n');
            }
            Stream::Stderr => log::debug!("[sso] {}", line),
        }
    }

    /// Kills the helper. Its exit will then be reported as a failure.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.handle.kill();
        }
    }

    /// Turns the helper's exit into a credential.
    pub fn finish(mut self, outcome: ExitOutcome) -> Result<Credential, VpnSsoError> {
        if self.cancelled {
            return Err(VpnSsoError::Authentication("authentication was cancelled".into()));
        }
        if !outcome.is_success() {
            return Err(VpnSsoError::Authentication(format!(
                "SSO helper ended with {}",
                outcome
            )));
        }

        let mut credential = parse_helper_output(&self.output).ok_or_else(|| {
            VpnSsoError::Authentication("SSO helper produced no session token".into())
        })?;
        self.output.clear();

        if self.protocol == Protocol::GlobalProtect {
            credential.usergroup = Some(
                self.usergroup
                    .take()
                    .unwrap_or_else(|| GP_PRELOGIN_USERGROUP.to_string()),
            );
        } else {
            credential.usergroup = self.usergroup.take();
        }
        log::info!(
            "SSO authentication succeeded (token of {} bytes{})",
            credential.token.len(),
            if credential.fingerprint.is_some() {
                ", with server fingerprint"
            } else {
                ""
            }
        );
        Ok(credential)
    }
}

/// Runs the SSO helper to completion on the calling thread.
///
/// Returns once the helper exits, `cancel` is triggered or the configured
/// timeout passes. The helper is killed in the latter two cases; after a
/// cancel its exit is awaited for at most the kill wait.
pub fn authenticate(
    launcher: &dyn Launcher,
    environment: &dyn EnvironmentSource,
    settings: &ServiceSettings,
    config: &ConnectionConfig,
    cancel: &CancellationToken,
) -> Result<Credential, VpnSsoError> {
    config.validate()?;
    let (tx, rx) = unbounded::<ProcessEvent>();
    let mut sso = SsoProcess::start(launcher, environment, settings, config, 0, tx)?;
    let poll = Duration::from_millis(100);
    let mut kill_deadline = None;

    loop {
        let now = Instant::now();
        if cancel.is_cancelled() && kill_deadline.is_none() {
            sso.cancel();
            kill_deadline = Some(now + settings.kill_wait());
        }
        if let Some(until) = kill_deadline {
            if now >= until {
                log::warn!("SSO helper did not exit after being killed, giving up on it");
                return Err(VpnSsoError::Authentication("authentication was cancelled".into()));
            }
        } else if now >= sso.deadline() {
            log::warn!("SSO helper timed out after {:?}", settings.sso_timeout());
            sso.cancel();
            return Err(VpnSsoError::Authentication(format!(
                "timed out after {} seconds",
                settings.sso_timeout_secs
            )));
        }

        match rx.recv_timeout(poll) {
            Ok(ProcessEvent::Line { stream, line, .. }) => sso.on_line(stream, &line),
            Ok(ProcessEvent::Exited { outcome, .. }) => return sso.finish(outcome),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(VpnSsoError::Authentication("lost track of the SSO helper".into()))
            }
        }
    }
}
