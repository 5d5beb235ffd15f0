//! Static username/password check.
//!
//! One credential pair, fixed at startup, compared byte for byte. This is a
//! placeholder for a real authenticator: no hashing, no lockout.

use std::fmt;
use std::net::SocketAddr;

/// Outcome of a password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// The configured credential pair.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check one authentication attempt. Every attempt is logged with the
    /// peer it came from; the offered password never is.
    pub fn validate(&self, user: &str, password: &str, peer: Option<SocketAddr>) -> Verdict {
        let peer = PeerLabel(peer);
        if self.matches(user, password) {
            log::info!("User {} authenticated successfully from {}", user, peer);
            Verdict::Accept
        } else {
            log::warn!("Failed authentication attempt for user {} from {}", user, peer);
            Verdict::Reject
        }
    }

    fn matches(&self, user: &str, password: &str) -> bool {
        user.as_bytes() == self.username.as_bytes()
            && password.as_bytes() == self.password.as_bytes()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

struct PeerLabel(Option<SocketAddr>);

impl fmt::Display for PeerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("unknown peer"),
        }
    }
}
