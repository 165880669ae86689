//! Naming model shared by every participant.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A named endpoint, optionally namespaced (`sws` or `team/sws`).
///
/// Two forwards are equal iff their canonical string forms are equal. The
/// control server may rewrite a forward during validation (e.g. prefix it
/// with a tenant namespace); clients always operate on the name they
/// configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Forward(String);

impl Forward {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Forward {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The side of a forward a client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Provides the service behind the forward.
    Destination,
    /// Consumes the service behind the forward.
    Source,
}

impl Role {
    /// The role this role peers with.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Role::Destination => Role::Source,
            Role::Source => Role::Destination,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Destination => f.write_str("destination"),
            Role::Source => f.write_str("source"),
        }
    }
}

/// A host/port pair identifying a relay within the control plane.
///
/// The host stays a string: relays advertise public names that may not
/// resolve from where the control server runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which routes a forward is willing to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteOption {
    /// Only peer-to-peer QUIC connections.
    Direct,
    /// Only connections through a relay.
    Relay,
    /// Direct where possible, relay as fallback.
    #[default]
    Any,
}

impl RouteOption {
    #[must_use]
    pub fn allow_direct(self) -> bool {
        matches!(self, RouteOption::Direct | RouteOption::Any)
    }

    #[must_use]
    pub fn allow_relay(self) -> bool {
        matches!(self, RouteOption::Relay | RouteOption::Any)
    }
}

/// Generate a `<prefix>-<suffix>` name with a random lowercase suffix.
///
/// Used for control server ids and relay virtual server names; the suffix is
/// long enough that collisions within a deployment are not a concern.
pub fn gen_server_name(prefix: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_equality() {
        assert_eq!(Forward::new("sws"), Forward::from("sws"));
        assert_ne!(Forward::new("sws"), Forward::new("team/sws"));
    }

    #[test]
    fn test_forward_serde_transparent() {
        let fwd = Forward::new("team/sws");
        let json = serde_json::to_string(&fwd).unwrap();
        assert_eq!(json, "\"team/sws\"");
        let back: Forward = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fwd);
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::Destination.opposite(), Role::Source);
        assert_eq!(Role::Source.opposite(), Role::Destination);
    }

    #[test]
    fn test_hostport_display() {
        let hp = HostPort::new("relay.example.com", 19191);
        assert_eq!(hp.to_string(), "relay.example.com:19191");
    }

    #[test]
    fn test_route_option_policy() {
        assert!(RouteOption::Any.allow_direct());
        assert!(RouteOption::Any.allow_relay());
        assert!(RouteOption::Direct.allow_direct());
        assert!(!RouteOption::Direct.allow_relay());
        assert!(!RouteOption::Relay.allow_direct());
        assert!(RouteOption::Relay.allow_relay());
    }

    #[test]
    fn test_gen_server_name() {
        let name = gen_server_name("connet-relay");
        assert!(name.starts_with("connet-relay-"));
        assert_eq!(name.len(), "connet-relay-".len() + 12);
        assert_ne!(name, gen_server_name("connet-relay"));
    }
}
