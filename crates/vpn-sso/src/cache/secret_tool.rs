//! Desktop secret store through the `secret-tool` command.
//!
//! The session bus only accepts connections from its own user, so a
//! privileged service runs the tool through `runuser` as the desktop user
//! found by the session resolver.

use super::CacheBackend;
use crate::config::Protocol;
use crate::session_env::{EnvironmentSource, SessionEnvironment};
use crate::utils::locate_executable;
use anyhow::{anyhow, bail, Context};
use once_cell::sync::OnceCell;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

pub const SCHEMA: &str = "org.freedesktop.NetworkManager.vpn-sso";
const RUNUSER: &str = "/usr/sbin/runuser";

pub struct SecretToolBackend {
    program: PathBuf,
    leading_args: Vec<OsString>,
    environment: Arc<dyn EnvironmentSource>,
    target: OnceCell<Option<SessionEnvironment>>,
    privileged: bool,
}

impl SecretToolBackend {
    pub fn new(environment: Arc<dyn EnvironmentSource>) -> Self {
        Self {
            program: locate_executable("secret-tool")
                .unwrap_or_else(|| PathBuf::from("/usr/bin/secret-tool")),
            leading_args: Vec::new(),
            environment,
            target: OnceCell::new(),
            privileged: nix::unistd::geteuid().is_root(),
        }
    }

    /// Returns a backend only if `secret-tool` is installed and the target
    /// session has a bus to talk to.
    pub fn detect(environment: Arc<dyn EnvironmentSource>) -> Option<Self> {
        let program = locate_executable("secret-tool")?;
        let backend = Self {
            program,
            ..Self::new(environment)
        };
        match backend.target_env() {
            Some(env) if env.dbus_session_bus_address.is_some() => Some(backend),
            _ => {
                log::debug!("secret-tool found but no session bus, not using it");
                None
            }
        }
    }

    /// Runs `program leading_args... <secret-tool args>` instead of the
    /// real tool.
    pub fn with_command(mut self, program: impl Into<PathBuf>, leading_args: &[&str]) -> Self {
        self.program = program.into();
        self.leading_args = leading_args.iter().map(OsString::from).collect();
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    fn target_env(&self) -> Option<&SessionEnvironment> {
        self.target
            .get_or_init(|| self.environment.resolve())
            .as_ref()
    }

    fn build_command(&self, args: &[&str]) -> anyhow::Result<Command> {
        let env = self.target_env();

        let mut cmd = if self.privileged {
            let user = env
                .and_then(|e| e.username.as_deref())
                .ok_or_else(|| anyhow!("could not determine target user for keyring access"))?;
            let mut cmd = Command::new(RUNUSER);
            cmd.args(["-u", user, "--"]).arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.args(&self.leading_args).args(args);

        if let Some(env) = env {
            if let Some(bus) = &env.dbus_session_bus_address {
                cmd.env("DBUS_SESSION_BUS_ADDRESS", bus);
            }
            if let Some(dir) = &env.xdg_runtime_dir {
                cmd.env("XDG_RUNTIME_DIR", dir);
            }
        }
        Ok(cmd)
    }

    /// Runs the tool. `Ok(None)` means exit status 1, which `lookup` uses for
    /// "no such item".
    fn run(&self, args: &[&str], input: Option<&str>) -> anyhow::Result<Option<Zeroizing<String>>> {
        let mut cmd = self.build_command(args)?;
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        log::debug!("Running secret-tool {}", args.first().unwrap_or(&""));
        let mut child = cmd.spawn().context("failed to spawn secret-tool")?;
        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(data.as_bytes())
                .context("failed to pass secret to secret-tool")?;
        }
        let output = child
            .wait_with_output()
            .context("secret-tool communication failed")?;

        let stdout = match String::from_utf8(output.stdout) {
            Ok(s) => Zeroizing::new(s),
            Err(e) => {
                e.into_bytes().zeroize();
                bail!("secret-tool returned non UTF-8 output");
            }
        };

        match output.status.code() {
            Some(0) => Ok(Some(stdout)),
            Some(1) => Ok(None),
            _ => bail!(
                "secret-tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

impl CacheBackend for SecretToolBackend {
    fn name(&self) -> &'static str {
        "secret-tool"
    }

    fn load(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<Option<Zeroizing<String>>> {
        let found = self.run(
            &["lookup", "xdg:schema", SCHEMA, "gateway", gateway, "protocol", protocol.as_str()],
            None,
        )?;
        Ok(found.filter(|s| !s.trim().is_empty()).map(|s| {
            let trimmed = Zeroizing::new(s.trim().to_string());
            drop(s);
            trimmed
        }))
    }

    fn save(&self, gateway: &str, protocol: Protocol, record: &str) -> anyhow::Result<()> {
        let label = format!("--label=VPN SSO: {} ({})", gateway, protocol);
        self.run(
            &[
                "store",
                &label,
                "xdg:schema",
                SCHEMA,
                "gateway",
                gateway,
                "protocol",
                protocol.as_str(),
            ],
            Some(record),
        )?
        .ok_or_else(|| anyhow!("secret-tool store failed"))?;
        Ok(())
    }

    fn remove(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<()> {
        self.run(
            &["clear", "xdg:schema", SCHEMA, "gateway", gateway, "protocol", protocol.as_str()],
            None,
        )?;
        Ok(())
    }

    fn remove_all(&self) -> anyhow::Result<()> {
        self.run(&["clear", "xdg:schema", SCHEMA], None)?;
        Ok(())
    }
}
