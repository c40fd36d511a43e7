//! One owner-only JSON file per cache entry.

use super::CacheBackend;
use crate::config::Protocol;
use anyhow::Context;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use zeroize::Zeroizing;

const USER_CACHE_SUBPATH: &str = ".local/share/vpn-sso/cache";

const SYSTEM_CACHE_DIR: &str = "/var/lib/vpn-sso/cache";

/// Default cache directory:
///
/// - **root:** `/var/lib/vpn-sso/cache`
/// - **otherwise:** `~/.local/share/vpn-sso/cache`
pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
    if nix::unistd::geteuid().is_root() {
        return Ok(PathBuf::from(SYSTEM_CACHE_DIR));
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(USER_CACHE_SUBPATH))
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, gateway: &str, protocol: Protocol) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", encode_name(gateway), protocol.as_str()))
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .with_context(|| format!("cannot create {:?}", self.dir))?;
        // An existing directory keeps its mode; tighten it.
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("cannot restrict {:?}", self.dir))?;
        Ok(())
    }
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<Option<Zeroizing<String>>> {
        let path = self.entry_path(gateway, protocol);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(Zeroizing::new(content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("cannot read {:?}", path)),
        }
    }

    fn save(&self, gateway: &str, protocol: Protocol, record: &str) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let path = self.entry_path(gateway, protocol);
        let tmp = path.with_extension("json.tmp");

        let _ = fs::remove_file(&tmp);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .with_context(|| format!("cannot create {:?}", tmp))?;
        let written = file
            .write_all(record.as_bytes())
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("cannot write {:?}", tmp));
        }

        fs::rename(&tmp, &path).with_context(|| format!("cannot replace {:?}", path))?;
        Ok(())
    }

    fn remove(&self, gateway: &str, protocol: Protocol) -> anyhow::Result<()> {
        let path = self.entry_path(gateway, protocol);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove {:?}", path)),
        }
    }

    fn remove_all(&self) -> anyhow::Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("cannot list {:?}", self.dir)),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).with_context(|| format!("cannot remove {:?}", path))?;
            }
        }
        Ok(())
    }
}

/// Makes a gateway name safe as a file name. Anything outside
/// `[A-Za-z0-9.-]` is percent-encoded, so distinct gateways never collide.
fn encode_name(gateway: &str) -> String {
    let mut out = String::with_capacity(gateway.len());
    for b in gateway.bytes() {
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CredentialCache;
    use crate::secret::Credential;

    #[test]
    fn names_are_encoded() {
        assert_eq!(encode_name("vpn.example.com"), "vpn.example.com");
        assert_eq!(encode_name("vpn.example.com:8443"), "vpn.example.com%3A8443");
        assert_eq!(encode_name("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_ne!(encode_name("a_b"), encode_name("a%5Fb"));
    }

    #[test]
    fn entries_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let backend = FileBackend::new(&cache_dir);
        backend
            .save("vpn.example.com", Protocol::AnyConnect, "{}")
            .unwrap();

        let file = cache_dir.join("vpn.example.com_anyconnect.json");
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = fs::metadata(&cache_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert!(!cache_dir.join("vpn.example.com_anyconnect.json.tmp").exists());
    }

    #[test]
    fn cache_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(Box::new(FileBackend::new(dir.path())));

        let mut cred = Credential::new("cookie-value");
        cred.username = Some("alice".into());
        cache
            .store("gw.example.org", Protocol::GlobalProtect, &cred, 4)
            .unwrap();

        let found = cache
            .lookup("gw.example.org", Protocol::GlobalProtect)
            .unwrap()
            .unwrap();
        assert_eq!(found.credential.token.expose(), "cookie-value");
        assert_eq!(found.credential.username.as_deref(), Some("alice"));
        assert!(found.credential.fingerprint.is_none());

        assert!(cache
            .lookup("gw.example.org", Protocol::AnyConnect)
            .unwrap()
            .is_none());

        cache.clear_all().unwrap();
        assert!(cache
            .lookup("gw.example.org", Protocol::GlobalProtect)
            .unwrap()
            .is_none());
    }

    #[test]
    fn removing_missing_entries_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("never-created"));
        backend.remove("gw", Protocol::AnyConnect).unwrap();
        backend.remove_all().unwrap();
        assert!(backend.load("gw", Protocol::AnyConnect).unwrap().is_none());
    }
}
