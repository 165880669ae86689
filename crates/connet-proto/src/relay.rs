//! Relay ↔ control messages (ALPN `connet-relays`).

use connet_cert::CertificateKey;
use connet_core::{Forward, HostPort, Role};
use serde::{Deserialize, Serialize};

use crate::shared::ChangeType;
use crate::Error;

/// First message on the first stream of a relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateReq {
    pub token: String,
    /// The public address clients will dial this relay at.
    pub addr: HostPort,
}

/// Reply to [`AuthenticateReq`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResp {
    pub error: Option<Error>,
    /// Stable id of the control server; a relay keys its durable state by
    /// this, so state survives reconnects but not a different control server.
    pub control_id: Option<String>,
}

/// Relay → control on the clients stream: resume authorized-client changes
/// from this watermark (`OFFSET_OLDEST` requests a snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsReq {
    pub offset: i64,
}

/// One authorized-client change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientChange {
    pub forward: Forward,
    pub role: Role,
    pub certificate_key: CertificateKey,
    pub change: ChangeType,
    /// The client certificate DER; present on `Put`.
    pub certificate: Option<Vec<u8>>,
}

/// Control → relay on the clients stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsResp {
    pub changes: Vec<ClientChange>,
    /// Watermark to persist and resume from.
    pub offset: i64,
}

/// Control → relay on the servers stream: send served-forward changes from
/// this watermark (the control server's durable view of what it already
/// ingested from this relay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersReq {
    pub offset: i64,
}

/// One served-forward change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChange {
    pub forward: Forward,
    pub change: ChangeType,
    /// The virtual server certificate DER; present on `Put`.
    pub server_certificate: Option<Vec<u8>>,
}

/// Relay → control on the servers stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersResp {
    pub changes: Vec<ServerChange>,
    /// Watermark the control server records after applying the batch.
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_resp_roundtrip() {
        let resp = ClientsResp {
            changes: vec![ClientChange {
                forward: Forward::new("sws"),
                role: Role::Destination,
                certificate_key: CertificateKey::of(b"cert"),
                change: ChangeType::Put,
                certificate: Some(vec![1, 2, 3]),
            }],
            offset: 42,
        };
        let bytes = bincode::serialize(&resp).unwrap();
        let back: ClientsResp = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.offset, 42);
        assert_eq!(back.changes.len(), 1);
        assert_eq!(back.changes[0].certificate_key, CertificateKey::of(b"cert"));
    }

    #[test]
    fn test_servers_resp_del_has_no_certificate() {
        let resp = ServersResp {
            changes: vec![ServerChange {
                forward: Forward::new("sws"),
                change: ChangeType::Del,
                server_certificate: None,
            }],
            offset: 7,
        };
        let bytes = bincode::serialize(&resp).unwrap();
        let back: ServersResp = bincode::deserialize(&bytes).unwrap();
        assert!(matches!(back.changes[0].change, ChangeType::Del));
        assert!(back.changes[0].server_certificate.is_none());
    }
}
