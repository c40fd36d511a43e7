//! Tunnel binary management.
//!
//! The binary gets the session token on stdin, then its output is parsed
//! line by line. Once it prints the "Configured as" marker the tunnel device
//! is polled for (it may show up a little later) before the configuration is
//! handed out.

pub mod parser;

use crate::config::{ConnectionConfig, Protocol, ServiceSettings};
use crate::error::VpnSsoError;
use crate::launcher::{LaunchSpec, Launcher};
use crate::process::{ProcessEvent, ProcessHandle, ProcessKind, ProcessTag, Stream};
use crate::secret::{Credential, SecretString};
use crate::utils::{is_net_device_present, locate_executable};
use crossbeam_channel::Sender;
use nix::sys::signal::Signal;
use parser::{Notice, OutputParser};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Instant;

pub const DEFAULT_DEVICE: &str = "tun0";

/// Usergroup that goes with a renewed GlobalProtect cookie.
pub const GP_RENEWED_USERGROUP: &str = "portal:portal-userauthcookie";

/// Network parameters reported once the tunnel is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    pub device: String,
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub routes: Vec<String>,
}

/// Builds the tunnel binary's command line.
pub fn tunnel_spec(
    settings: &ServiceSettings,
    config: &ConnectionConfig,
    credential: &Credential,
) -> LaunchSpec {
    let program = locate_executable(&settings.tunnel_binary)
        .unwrap_or_else(|| PathBuf::from(&settings.tunnel_binary));
    let mut spec = LaunchSpec::new(program).arg(format!("--protocol={}", config.protocol.tunnel_flag()));
    spec.stdin = true;

    match config.protocol {
        Protocol::GlobalProtect => {
            spec = spec.args(["--useragent=PAN GlobalProtect", "--os=linux-64"]);
            if let Some(user) = &config.username {
                spec = spec.arg(format!("--user={}", user));
            }
            let usergroup = credential
                .usergroup
                .as_deref()
                .filter(|g| !g.is_empty())
                .unwrap_or(crate::sso::GP_PRELOGIN_USERGROUP);
            spec = spec
                .arg(format!("--usergroup={}", usergroup))
                .arg("--passwd-on-stdin");
        }
        Protocol::AnyConnect => {
            if let Some(user) = &config.username {
                spec = spec.arg(format!("--user={}", user));
            }
            if let Some(fp) = &credential.fingerprint {
                spec = spec.arg(format!("--servercert={}", fp));
            }
            spec = spec.arg("--cookie-on-stdin");
        }
    }

    spec.args(config.extra_args())
        .arg("--non-inter")
        .arg(config.gateway.as_str())
}

/// What the owner of a [`TunnelProcess`] has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelNotice {
    /// The live credential changed and should be cached again.
    Renewed(Credential),
    /// The "Configured as" marker was seen; device polling has started.
    Configured,
}

#[derive(Debug)]
struct DevicePoll {
    next: Instant,
    attempts: u32,
}

/// A running tunnel binary.
#[derive(Debug)]
pub struct TunnelProcess {
    handle: ProcessHandle,
    parser: OutputParser,
    credential: Credential,
    protocol: Protocol,
    poll: Option<DevicePoll>,
    reported: bool,
}

impl TunnelProcess {
    /// Starts the tunnel binary and feeds it the token.
    pub fn start<T>(
        launcher: &dyn Launcher,
        settings: &ServiceSettings,
        config: &ConnectionConfig,
        credential: Credential,
        attempt: u64,
        events: Sender<T>,
    ) -> Result<Self, VpnSsoError>
    where
        T: From<ProcessEvent> + Send + 'static,
    {
        let spec = tunnel_spec(settings, config, &credential);
        log::info!(
            "Starting {} for {} ({})",
            spec.program_name(),
            config.gateway,
            config.protocol
        );
        log::debug!("Tunnel arguments: {:?}", spec.args_lossy());

        let tag = ProcessTag {
            attempt,
            kind: ProcessKind::Tunnel,
        };
        let mut handle = ProcessHandle::spawn(launcher, &spec, tag, events)?;
        if let Err(e) = handle.write_stdin_and_close(credential.token.expose()) {
            // The exit status will tell what went wrong.
            log::warn!("Could not pass the session token to {}: {}", handle.program(), e);
        }

        Ok(Self {
            handle,
            parser: OutputParser::new(config.protocol),
            credential,
            protocol: config.protocol,
            poll: None,
            reported: false,
        })
    }

    pub fn on_line(&mut self, stream: Stream, line: &str) -> Vec<TunnelNotice> {
        let is_renewal = line.contains("portal-userauthcookie=");
        if !is_renewal {
            match stream {
                Stream::Stdout => log::debug!("[tunnel] {}", line),
                Stream::Stderr => log::debug!("[tunnel:err] {}", line),
            }
        }

        let mut notices = Vec::new();
        for notice in self.parser.feed(line) {
            match notice {
                Notice::Renewal(token) => {
                    if self.protocol != Protocol::GlobalProtect
                        || token == self.credential.token.expose()
                    {
                        continue;
                    }
                    log::info!("Captured renewed session cookie ({} bytes)", token.len());
                    self.credential.token = SecretString::new(token);
                    self.credential.usergroup = Some(GP_RENEWED_USERGROUP.to_string());
                    notices.push(TunnelNotice::Renewed(self.credential.clone()));
                }
                Notice::TunnelUp => {
                    log::info!("Tunnel configured, waiting for the tunnel device");
                    self.poll = Some(DevicePoll {
                        next: Instant::now(),
                        attempts: 0,
                    });
                    notices.push(TunnelNotice::Configured);
                }
            }
        }
        notices
    }

    /// When the device should next be checked, if polling.
    pub fn poll_deadline(&self) -> Option<Instant> {
        self.poll.as_ref().map(|p| p.next)
    }

    /// Checks for the tunnel device. Returns the configuration once it exists
    /// or once the attempt cap is reached.
    pub fn poll_device(&mut self, settings: &ServiceSettings) -> Option<TunnelConfig> {
        let poll = self.poll.as_mut()?;
        let config = self.parser.config();

        if is_net_device_present(&settings.net_device_dir, &config.device) {
            log::info!(
                "Tunnel device {} is up after {} checks",
                config.device,
                poll.attempts
            );
        } else if poll.attempts + 1 >= settings.device_poll_attempts {
            log::warn!(
                "Tunnel device {} did not appear after {} checks, reporting anyway",
                config.device,
                settings.device_poll_attempts
            );
        } else {
            poll.attempts += 1;
            poll.next = Instant::now() + settings.device_poll_interval();
            log::debug!(
                "Waiting for tunnel device {} (attempt {})",
                config.device,
                poll.attempts
            );
            return None;
        }

        self.poll = None;
        self.reported = true;
        Some(config)
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Disconnects without logging the session off, so the cookie stays valid.
    pub fn hangup(&mut self) -> bool {
        self.poll = None;
        self.handle.signal(Signal::SIGHUP)
    }

    pub fn kill(&mut self) -> bool {
        self.poll = None;
        self.handle.kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_net_dir(dir: &std::path::Path) -> ServiceSettings {
        ServiceSettings {
            tunnel_binary: "/bin/sh".into(),
            net_device_dir: dir.to_path_buf(),
            device_poll_attempts: 3,
            ..ServiceSettings::default()
        }
    }

    #[test]
    fn gp_arguments_with_usergroup() {
        let mut cfg = ConnectionConfig::new("vpn.example.com", Protocol::GlobalProtect);
        cfg.username = Some("alice".into());
        cfg.extra_args = Some("--no-dtls  -v".into());
        let mut cred = Credential::new("cookie");
        cred.usergroup = Some(GP_RENEWED_USERGROUP.into());

        let spec = tunnel_spec(&ServiceSettings::default(), &cfg, &cred);
        assert_eq!(
            spec.args_lossy(),
            vec![
                "--protocol=gp",
                "--useragent=PAN GlobalProtect",
                "--os=linux-64",
                "--user=alice",
                "--usergroup=portal:portal-userauthcookie",
                "--passwd-on-stdin",
                "--no-dtls",
                "-v",
                "--non-inter",
                "vpn.example.com",
            ]
        );
        assert!(spec.stdin);
    }

    #[test]
    fn gp_defaults_to_prelogin_usergroup() {
        let cfg = ConnectionConfig::new("gw", Protocol::GlobalProtect);
        let spec = tunnel_spec(&ServiceSettings::default(), &cfg, &Credential::new("c"));
        assert!(spec
            .args_lossy()
            .contains(&"--usergroup=portal:prelogin-cookie".to_string()));
    }

    #[test]
    fn ac_arguments_with_fingerprint() {
        let cfg = ConnectionConfig::new("vpn.example.com", Protocol::AnyConnect);
        let mut cred = Credential::new("cookie");
        cred.fingerprint = Some("pin-sha256:abc".into());
        let spec = tunnel_spec(&ServiceSettings::default(), &cfg, &cred);
        assert_eq!(
            spec.args_lossy(),
            vec![
                "--protocol=anyconnect",
                "--servercert=pin-sha256:abc",
                "--cookie-on-stdin",
                "--non-inter",
                "vpn.example.com",
            ]
        );
    }

    fn start_idle_tunnel(settings: &ServiceSettings, protocol: Protocol) -> TunnelProcess {
        let (tx, _rx) = crossbeam_channel::unbounded::<ProcessEvent>();
        let cfg = ConnectionConfig::new("gw", protocol);
        let launcher = ScriptLauncher("read tok; exec sleep 30");
        TunnelProcess::start(&launcher, settings, &cfg, Credential::new("initial"), 1, tx).unwrap()
    }

    /// Ignores the real command line and runs a shell snippet instead.
    struct ScriptLauncher(&'static str);

    impl Launcher for ScriptLauncher {
        fn launch(&self, spec: &LaunchSpec) -> std::io::Result<std::process::Child> {
            let mut real = LaunchSpec::new("/bin/sh").args(["-c", self.0]);
            real.stdin = spec.stdin;
            crate::launcher::SystemLauncher.launch(&real)
        }
    }

    #[test]
    fn renewal_updates_live_credential() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_net_dir(dir.path());
        let mut tunnel = start_idle_tunnel(&settings, Protocol::GlobalProtect);

        let notices = tunnel.on_line(
            Stream::Stderr,
            "GlobalProtect login returned portal-userauthcookie=LongLived42",
        );
        match notices.as_slice() {
            [TunnelNotice::Renewed(cred)] => {
                assert_eq!(cred.token.expose(), "LongLived42");
                assert_eq!(cred.usergroup.as_deref(), Some(GP_RENEWED_USERGROUP));
            }
            other => panic!("unexpected notices {:?}", other),
        }
        // Same cookie again is not a renewal.
        assert!(tunnel
            .on_line(Stream::Stderr, "portal-userauthcookie=LongLived42")
            .is_empty());
        tunnel.kill();
    }

    #[test]
    fn device_poll_waits_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_net_dir(dir.path());
        let mut tunnel = start_idle_tunnel(&settings, Protocol::AnyConnect);

        assert!(tunnel.poll_deadline().is_none());
        assert_eq!(
            tunnel.on_line(Stream::Stdout, "Configured as 10.10.5.4"),
            vec![TunnelNotice::Configured]
        );
        assert!(tunnel.poll_deadline().is_some());

        assert!(tunnel.poll_device(&settings).is_none());
        assert!(tunnel.poll_device(&settings).is_none());
        let cfg = tunnel.poll_device(&settings).expect("reported at the cap");
        assert_eq!(cfg.device, "tun0");
        assert_eq!(cfg.address, Some(Ipv4Addr::new(10, 10, 5, 4)));
        assert!(tunnel.is_reported());
        assert!(tunnel.poll_deadline().is_none());
        tunnel.kill();
    }

    #[test]
    fn device_poll_reports_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tun7")).unwrap();
        let settings = settings_with_net_dir(dir.path());
        let mut tunnel = start_idle_tunnel(&settings, Protocol::AnyConnect);

        tunnel.on_line(Stream::Stdout, "Connected tun7 as 10.0.0.2");
        tunnel.on_line(Stream::Stdout, "Configured as 10.0.0.2");
        let cfg = tunnel.poll_device(&settings).unwrap();
        assert_eq!(cfg.device, "tun7");
        tunnel.kill();
    }
}
