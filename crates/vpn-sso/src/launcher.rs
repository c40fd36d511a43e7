//! Subprocess launching with an explicit identity switch.
//!
//! Running a helper "as the desktop user" is part of the [`LaunchSpec`]
//! rather than a side effect hidden in a pre-exec hook, so the whole
//! orchestration can be exercised against a fake [`Launcher`].

use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Identity a child process should run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
    /// Working directory for the child; ignored if it does not exist.
    pub home: Option<PathBuf>,
}

/// Everything needed to start one external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting ours.
    pub env_clear: bool,
    pub run_as: Option<RunAs>,
    /// Open a pipe to the child's stdin.
    pub stdin: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            env_clear: false,
            run_as: None,
            stdin: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment entry, the last one winning.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Arguments as lossy UTF-8, mostly for logs and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }
}

/// Starts processes. Implementations must pipe stdout and stderr, and should
/// put the child in a new process group so signals reach its descendants.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child>;
}

/// Launches real processes with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .process_group(0);

        if spec.env_clear {
            cmd.env_clear();
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k, v)));

        if let Some(run_as) = &spec.run_as {
            log::debug!(
                "Running {} as uid {} gid {}",
                spec.program_name(),
                run_as.uid,
                run_as.gid
            );
            // std sets the group first and clears supplementary groups when we are root.
            cmd.gid(run_as.gid).uid(run_as.uid);
            if let Some(home) = run_as.home.as_ref().filter(|h| h.is_dir()) {
                cmd.current_dir(home);
            }
        }

        cmd.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn builder_keeps_order_and_last_env_wins() {
        let spec = LaunchSpec::new("/usr/bin/tool")
            .arg("--one")
            .args(["--two", "three"])
            .env("A", "1")
            .env("A", "2");
        assert_eq!(spec.args_lossy(), vec!["--one", "--two", "three"]);
        assert_eq!(spec.env_value("A"), Some("2"));
        assert_eq!(spec.program_name(), "tool");
    }

    #[test]
    fn system_launcher_applies_clean_environment() {
        let mut spec = LaunchSpec::new("/bin/sh")
            .args(["-c", "echo \"$ONLY_THIS:${HOME:-unset}\""])
            .env("ONLY_THIS", "yes");
        spec.env_clear = true;

        let mut child = SystemLauncher.launch(&spec).unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        assert!(child.wait().unwrap().success());
        assert_eq!(out.trim(), "yes:unset");
    }

    #[test]
    fn child_leads_its_own_process_group() {
        let spec = LaunchSpec::new("/bin/sh").args(["-c", "cut -d' ' -f5 /proc/$$/stat"]);
        let mut child = SystemLauncher.launch(&spec).unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        assert!(child.wait().unwrap().success());
        assert_eq!(out.trim(), child.id().to_string());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let spec = LaunchSpec::new("/nonexistent/helper-binary");
        assert!(SystemLauncher.launch(&spec).is_err());
    }
}
