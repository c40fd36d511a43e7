//! Holder for session tokens.

use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// An opaque session token. The backing memory is overwritten with zeros when
/// the value is dropped or explicitly [`wipe`](SecretString::wipe)d, and the
/// token never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Zeroes the token in place, leaving an empty string.
    pub fn wipe(&mut self) {
        self.0.zeroize();
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("SecretString(<empty>)")
        } else {
            write!(f, "SecretString(<{} bytes>)", self.len())
        }
    }
}

/// What a successful SSO run (or a cache hit) hands to the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub token: SecretString,
    /// Server certificate pin, AnyConnect only.
    pub fingerprint: Option<String>,
    pub usergroup: Option<String>,
    pub username: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token),
            ..Default::default()
        }
    }

    pub fn wipe(&mut self) {
        self.token.wipe();
    }
}
