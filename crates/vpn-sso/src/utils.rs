use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use which::which;

/// Shared flag used to abort a blocking operation from another thread.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Directories searched when a system tool is not on `PATH`. A privileged
/// service often runs with a reduced `PATH` that misses the sbin directories.
const SYSTEM_FALLBACK_DIRS: [&str; 5] = [
    "/sbin",
    "/usr/sbin",
    "/usr/local/sbin",
    "/usr/bin",
    "/usr/local/bin",
];

/// Locates an executable.
///
/// Resolution order:
/// 1. `name` as a literal file path.
/// 2. `name` looked up via `PATH`.
/// 3. The usual system directories.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which(name) {
        return Some(found);
    }

    let base = candidate.file_name()?;
    SYSTEM_FALLBACK_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(base))
        .find(|p| p.is_file())
}

/// Returns `true` if `device` is listed under `net_dir` (normally
/// `/sys/class/net`) and is not administratively down.
pub fn is_net_device_present(net_dir: &Path, device: &str) -> bool {
    let dev_path = net_dir.join(device);
    if !dev_path.exists() {
        return false;
    }
    std::fs::read_to_string(dev_path.join("operstate"))
        .map(|s| s.trim() != "down")
        .unwrap_or(true)
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn locate_finds_sh_by_name_and_path() {
        let by_name = locate_executable("sh").expect("sh on PATH");
        assert!(by_name.is_file());
        assert_eq!(locate_executable("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert!(locate_executable("definitely-not-a-real-tool-4711").is_none());
    }

    #[test]
    fn device_presence_reads_operstate() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_net_device_present(dir.path(), "tun0"));

        std::fs::create_dir(dir.path().join("tun0")).unwrap();
        assert!(is_net_device_present(dir.path(), "tun0"));

        std::fs::write(dir.path().join("tun0/operstate"), "down\n").unwrap();
        assert!(!is_net_device_present(dir.path(), "tun0"));

        std::fs::write(dir.path().join("tun0/operstate"), "unknown\n").unwrap();
        assert!(is_net_device_present(dir.path(), "tun0"));
    }
}
