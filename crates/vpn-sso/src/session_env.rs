//! Finds the interactive user's desktop session.
//!
//! When the service runs as an ordinary user it simply reuses its own
//! environment. When it runs as root (the usual case under a network daemon)
//! it has to locate a graphical login, then borrow the display, bus and
//! runtime directory from a long-lived process of that user so the SSO
//! helper's browser window can render.

use crate::launcher::RunAs;
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Lowest uid considered a real interactive user.
pub const MIN_USER_UID: u32 = 1000;

/// Executables that indicate a running graphical session.
const DISPLAY_SERVER_PROCS: [&str; 5] = ["Xorg", "Xwayland", "gnome-shell", "gnome-session", "kwin"];

/// Long-lived desktop processes whose environment carries the session variables.
const DESKTOP_PROCS: [&str; 5] = [
    "gnome-session-binary",
    "gnome-session",
    "gnome-shell",
    "plasma-shell",
    "xfce4-session",
];

/// The kernel truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

/// Display and session variables of the interactive user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnvironment {
    pub uid: u32,
    pub gid: u32,
    pub username: Option<String>,
    pub home: Option<PathBuf>,
    pub display: Option<String>,
    pub wayland_display: Option<String>,
    pub xauthority: Option<String>,
    pub dbus_session_bus_address: Option<String>,
    pub xdg_runtime_dir: Option<PathBuf>,
    /// Set when this environment was recovered by a privileged process on
    /// behalf of another user.
    pub privileged: bool,
}

impl SessionEnvironment {
    /// Identity to switch to before running GUI helpers, if any.
    ///
    /// Only a privileged resolver acting for a regular user (uid >= 1000)
    /// asks for a switch.
    pub fn run_as(&self) -> Option<RunAs> {
        (self.privileged && self.uid >= MIN_USER_UID).then(|| RunAs {
            uid: self.uid,
            gid: self.gid,
            home: self.home.clone(),
        })
    }

    pub fn has_display(&self) -> bool {
        self.display.is_some() || self.wayland_display.is_some()
    }

    /// The variables to export to a GUI helper, skipping unset ones.
    pub fn vars(&self) -> Vec<(String, String)> {
        let path_str = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());
        [
            ("DISPLAY", self.display.clone()),
            ("WAYLAND_DISPLAY", self.wayland_display.clone()),
            ("XDG_RUNTIME_DIR", path_str(&self.xdg_runtime_dir)),
            ("XAUTHORITY", self.xauthority.clone()),
            ("DBUS_SESSION_BUS_ADDRESS", self.dbus_session_bus_address.clone()),
            ("HOME", path_str(&self.home)),
            ("USER", self.username.clone()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect()
    }
}

/// Anything that can produce the interactive session environment.
pub trait EnvironmentSource: Send + Sync {
    fn resolve(&self) -> Option<SessionEnvironment>;
}

/// A fixed environment, handy when the caller already knows the session.
impl EnvironmentSource for SessionEnvironment {
    fn resolve(&self) -> Option<SessionEnvironment> {
        Some(self.clone())
    }
}

/// Resolves the session by probing the running system.
#[derive(Debug, Clone)]
pub struct SessionResolver {
    pub proc_root: PathBuf,
    pub run_user_root: PathBuf,
    pub x11_socket_dir: PathBuf,
    pub use_loginctl: bool,
    /// Overrides the effective-uid check.
    pub privileged: Option<bool>,
    /// Uid of the user who invoked us through sudo.
    pub sudo_uid: Option<u32>,
}

impl Default for SessionResolver {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            run_user_root: PathBuf::from("/run/user"),
            x11_socket_dir: PathBuf::from("/tmp/.X11-unix"),
            use_loginctl: true,
            privileged: None,
            sudo_uid: std::env::var("SUDO_UID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }
}

impl EnvironmentSource for SessionResolver {
    fn resolve(&self) -> Option<SessionEnvironment> {
        if !self.is_privileged() {
            log::debug!("Using current process environment (not privileged)");
            return Some(current_environment());
        }

        let (uid, session_id) = match self.find_graphical_uid() {
            Some(found) => found,
            None => {
                log::warn!("Could not find a graphical session");
                return None;
            }
        };
        if uid < MIN_USER_UID {
            log::warn!("Refusing session of system user uid {}", uid);
            return None;
        }

        let env = self.environment_for(uid, session_id.as_deref());
        log::debug!(
            "Session environment for uid {}: DISPLAY={:?} WAYLAND_DISPLAY={:?} XDG_RUNTIME_DIR={:?} XAUTHORITY={:?} DBUS={:?}",
            uid,
            env.display,
            env.wayland_display,
            env.xdg_runtime_dir,
            env.xauthority,
            env.dbus_session_bus_address
        );
        Some(env)
    }
}

impl SessionResolver {
    fn is_privileged(&self) -> bool {
        self.privileged
            .unwrap_or_else(|| nix::unistd::geteuid().is_root())
    }

    /// Walks the fallback chain: session manager, display-server processes,
    /// `SUDO_UID`, then `/run/user`.
    fn find_graphical_uid(&self) -> Option<(u32, Option<String>)> {
        if self.use_loginctl {
            match loginctl_graphical_session() {
                Ok(Some((uid, session))) => {
                    log::debug!("Found graphical session {} for uid {}", session, uid);
                    return Some((uid, Some(session)));
                }
                Ok(None) => log::debug!("loginctl lists no graphical session"),
                Err(e) => log::debug!("loginctl unavailable: {:#}", e),
            }
        }

        if let Some(uid) = self.scan_display_servers() {
            log::debug!("Found uid {} from the process list", uid);
            return Some((uid, None));
        }

        match self.sudo_uid {
            Some(uid) if uid >= MIN_USER_UID => {
                log::debug!("Using SUDO_UID {}", uid);
                return Some((uid, None));
            }
            Some(uid) => log::debug!("Ignoring SUDO_UID {} of a system user", uid),
            None => {}
        }

        self.scan_runtime_dirs().map(|uid| {
            log::debug!("Found runtime directory for uid {}", uid);
            (uid, None)
        })
    }

    fn scan_display_servers(&self) -> Option<u32> {
        list_processes(&self.proc_root)
            .into_iter()
            .filter(|p| p.uid >= MIN_USER_UID)
            .find(|p| DISPLAY_SERVER_PROCS.iter().any(|name| p.comm.contains(name)))
            .map(|p| p.uid)
    }

    fn scan_runtime_dirs(&self) -> Option<u32> {
        let mut uids: Vec<u32> = std::fs::read_dir(&self.run_user_root)
            .ok()?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|uid| *uid >= MIN_USER_UID)
            .collect();
        uids.sort_unstable();
        uids.first().copied()
    }

    fn find_process(&self, uid: u32, names: &[&str]) -> Option<u32> {
        let procs = list_processes(&self.proc_root);
        names.iter().find_map(|name| {
            let comm: String = name.chars().take(COMM_LEN).collect();
            procs
                .iter()
                .find(|p| p.uid == uid && p.comm == comm)
                .map(|p| p.pid)
        })
    }

    /// Recovers the session variables of `uid`.
    fn environment_for(&self, uid: u32, session_id: Option<&str>) -> SessionEnvironment {
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten();
        if user.is_none() {
            log::warn!("No passwd entry for uid {}", uid);
        }

        let mut env = SessionEnvironment {
            uid,
            gid: user.as_ref().map(|u| u.gid.as_raw()).unwrap_or(uid),
            username: user.as_ref().map(|u| u.name.clone()),
            home: user.as_ref().map(|u| u.dir.clone()),
            xdg_runtime_dir: Some(self.run_user_root.join(uid.to_string())),
            privileged: true,
            ..Default::default()
        };

        let leader = session_id
            .filter(|_| self.use_loginctl)
            .and_then(|id| loginctl_session_leader(id).ok().flatten())
            .or_else(|| self.find_process(uid, &DESKTOP_PROCS));

        if let Some(vars) = leader.and_then(|pid| read_environ(&self.proc_root, pid)) {
            let get = |k: &str| vars.get(k).filter(|v| !v.is_empty()).cloned();
            env.display = get("DISPLAY");
            env.wayland_display = get("WAYLAND_DISPLAY");
            env.dbus_session_bus_address = get("DBUS_SESSION_BUS_ADDRESS");
            env.xauthority = get("XAUTHORITY");
            if !env.xdg_runtime_dir.as_deref().is_some_and(Path::is_dir) {
                if let Some(dir) = get("XDG_RUNTIME_DIR") {
                    env.xdg_runtime_dir = Some(PathBuf::from(dir));
                }
            }
        }

        self.apply_fallbacks(&mut env);
        env
    }

    fn apply_fallbacks(&self, env: &mut SessionEnvironment) {
        if !env.has_display() {
            env.display = ["0", "1"]
                .iter()
                .find(|n| self.x11_socket_dir.join(format!("X{}", n)).exists())
                .map(|n| format!(":{}", n));
        }

        if env.xauthority.is_none() {
            env.xauthority = self
                .find_process(env.uid, &["Xwayland"])
                .and_then(|pid| read_environ(&self.proc_root, pid))
                .and_then(|vars| vars.get("XAUTHORITY").cloned());
        }

        if env.xauthority.is_none() {
            env.xauthority = env
                .xdg_runtime_dir
                .as_deref()
                .and_then(find_mutter_xauth)
                .map(|p| p.to_string_lossy().into_owned());
        }

        if env.xauthority.is_none() {
            env.xauthority = env
                .home
                .as_ref()
                .map(|h| h.join(".Xauthority"))
                .filter(|p| p.exists())
                .map(|p| p.to_string_lossy().into_owned());
        }

        if env.dbus_session_bus_address.is_none() {
            env.dbus_session_bus_address = env
                .xdg_runtime_dir
                .as_ref()
                .map(|dir| dir.join("bus"))
                .filter(|bus| bus.exists())
                .map(|bus| format!("unix:path={}", bus.display()));
        }
    }
}

/// The environment of the current process.
pub fn current_environment() -> SessionEnvironment {
    let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid).ok().flatten();

    SessionEnvironment {
        uid: uid.as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        username: var("USER").or_else(|| user.as_ref().map(|u| u.name.clone())),
        home: var("HOME")
            .map(PathBuf::from)
            .or_else(|| user.map(|u| u.dir)),
        display: var("DISPLAY"),
        wayland_display: var("WAYLAND_DISPLAY"),
        xauthority: var("XAUTHORITY"),
        dbus_session_bus_address: var("DBUS_SESSION_BUS_ADDRESS"),
        xdg_runtime_dir: var("XDG_RUNTIME_DIR").map(PathBuf::from),
        privileged: false,
    }
}

#[derive(Debug)]
struct ProcInfo {
    pid: u32,
    uid: u32,
    comm: String,
}

fn list_processes(proc_root: &Path) -> Vec<ProcInfo> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut procs: Vec<ProcInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let dir = entry.path();
            let comm = std::fs::read_to_string(dir.join("comm")).ok()?;
            let status = std::fs::read_to_string(dir.join("status")).ok()?;
            let uid = status
                .lines()
                .find_map(|l| l.strip_prefix("Uid:"))?
                .split_whitespace()
                .next()?
                .parse()
                .ok()?;
            Some(ProcInfo {
                pid,
                uid,
                comm: comm.trim_end().to_string(),
            })
        })
        .collect();
    procs.sort_by_key(|p| p.pid);
    procs
}

/// Reads the NUL-separated environment block of `pid`.
fn read_environ(proc_root: &Path, pid: u32) -> Option<HashMap<String, String>> {
    let path = proc_root.join(pid.to_string()).join("environ");
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("Failed to read {:?}: {}", path, e);
            return None;
        }
    };
    Some(
        raw.split(|b| *b == 0)
            .filter_map(|entry| {
                let entry = String::from_utf8_lossy(entry);
                let (k, v) = entry.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect(),
    )
}

fn find_mutter_xauth(runtime_dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(runtime_dir)
        .ok()?
        .flatten()
        .find(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(".mutter-Xwaylandauth."))
        })
        .map(|e| e.path())
}

fn loginctl(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("loginctl")
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .context("failed to run loginctl")?;
    if !output.status.success() {
        anyhow::bail!("loginctl {} exited with {}", args.join(" "), output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns the uid and id of the first x11 or wayland session of a regular
/// user. Greeter sessions belong to system users and are skipped.
fn loginctl_graphical_session() -> anyhow::Result<Option<(u32, String)>> {
    let listing = loginctl(&["list-sessions", "--no-legend"])?;
    for (session, uid) in parse_user_sessions(&listing) {
        let kind = loginctl(&["show-session", &session, "-p", "Type", "--value"])
            .unwrap_or_default();
        if matches!(kind.trim(), "x11" | "wayland") {
            return Ok(Some((uid, session)));
        }
    }
    Ok(None)
}

fn loginctl_session_leader(session: &str) -> anyhow::Result<Option<u32>> {
    let out = loginctl(&["show-session", session, "-p", "Leader", "--value"])?;
    Ok(out.trim().parse().ok().filter(|pid| *pid > 0))
}

/// Parses `SESSION UID USER [SEAT] [TTY]` rows, dropping system users.
fn parse_user_sessions(listing: &str) -> Vec<(String, u32)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let session = parts.next()?;
            let uid = parts.next()?.parse().ok()?;
            parts.next()?;
            Some((session.to_string(), uid))
        })
        .filter(|(_, uid)| *uid >= MIN_USER_UID)
        .collect()
}
