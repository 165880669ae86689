//! Client ↔ control messages (ALPN `connet`).

use std::net::SocketAddr;

use connet_core::Forward;
use serde::{Deserialize, Serialize};

use crate::shared::{PeerDescriptor, RelayRoute, ServerPeer};
use crate::Error;

/// First message on the first stream of a client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticate {
    pub token: String,
    /// Token from a previous session, to resume advertised state.
    pub reconnect_token: Option<Vec<u8>>,
}

/// Reply to [`Authenticate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResp {
    pub error: Option<Error>,
    /// The server's view of the client's external address.
    pub public_addr: Option<SocketAddr>,
    pub reconnect_token: Option<Vec<u8>>,
}

/// Requests a client writes on its per-forward streams. Each stream carries
/// exactly one variant, repeated as the client's state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Advertise (or re-advertise) a destination for `to`.
    Destination { to: Forward, peer: PeerDescriptor },
    /// Advertise (or re-advertise) a source for `to`.
    Source { to: Forward, peer: PeerDescriptor },
    /// Subscribe to relays serving `to`, announcing the client certificate a
    /// destination will dial relays with.
    DestinationRelay { to: Forward, certificate: Vec<u8> },
    /// Subscribe to relays serving `to`, announcing the client certificate a
    /// source will dial relays with.
    SourceRelay { to: Forward, certificate: Vec<u8> },
}

/// Responses the control server writes on per-forward streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Sources currently advertising the stream's forward (to destinations).
    Destination { sources: Vec<ServerPeer> },
    /// Destinations currently advertising the stream's forward (to sources).
    Source { destinations: Vec<ServerPeer> },
    /// Relays currently serving the stream's forward.
    Relays { relays: Vec<RelayRoute> },
    Error(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn test_request_roundtrip() {
        let req = Request::Destination {
            to: Forward::new("sws"),
            peer: PeerDescriptor::default(),
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: Request = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(back, Request::Destination { to, .. } if to.as_str() == "sws"));
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = Response::Error(Error::new(ErrorCode::SourceValidationFailed, "bad forward"));
        let bytes = bincode::serialize(&resp).unwrap();
        let back: Response = bincode::deserialize(&bytes).unwrap();
        match back {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::SourceValidationFailed),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
