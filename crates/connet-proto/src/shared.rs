//! Wire types shared across stream roles.

use std::net::SocketAddr;

use connet_core::{Forward, HostPort, Role};
use serde::{Deserialize, Serialize};

/// Whether a change sets or clears a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Put,
    Del,
}

/// How a peer can be reached directly: candidate addresses plus the per-peer
/// certificate pair. Certificates travel as DER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectRoute {
    pub addresses: Vec<SocketAddr>,
    pub server_certificate: Vec<u8>,
    pub client_certificate: Vec<u8>,
}

/// A relay a peer can be reached through, with the virtual server
/// certificate the relay terminates that forward with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRoute {
    pub hostport: HostPort,
    pub server_certificate: Vec<u8>,
}

/// What a client advertises about itself, per forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Direct reachability; `None` when the route policy forbids direct.
    pub direct: Option<DirectRoute>,
    /// Relays this client elected, in preference order.
    pub relays: Vec<HostPort>,
}

impl PeerDescriptor {
    /// The fingerprint source of this descriptor's identity: the client
    /// certificate when a direct route is advertised.
    #[must_use]
    pub fn client_certificate(&self) -> Option<&[u8]> {
        self.direct.as_ref().map(|d| d.client_certificate.as_slice())
    }
}

/// A peer as broadcast by the control server: the advertised descriptor
/// tagged with a stable server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPeer {
    pub id: String,
    pub peer: PeerDescriptor,
}

/// Identifies one side of one forward on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRole {
    pub forward: Forward,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_descriptor_roundtrip() {
        let desc = PeerDescriptor {
            direct: Some(DirectRoute {
                addresses: vec!["127.0.0.1:19192".parse().unwrap(), "[::1]:19192".parse().unwrap()],
                server_certificate: vec![1, 2, 3],
                client_certificate: vec![4, 5, 6],
            }),
            relays: vec![HostPort::new("relay.example.com", 19191)],
        };

        let bytes = bincode::serialize(&desc).unwrap();
        let back: PeerDescriptor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, desc);
        assert_eq!(back.client_certificate(), Some(&[4u8, 5, 6][..]));
    }

    #[test]
    fn test_empty_descriptor_has_no_identity() {
        let desc = PeerDescriptor::default();
        assert_eq!(desc.client_certificate(), None);
    }
}
