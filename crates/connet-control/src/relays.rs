//! Relay side of the control server: the `relay-clients`, `relay-servers`
//! and `relay-server-offsets` logs, the forwards index, and the per-relay
//! session with its two change streams.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use connet_cert::CertificateKey;
use connet_core::{Forward, HostPort, Role};
use connet_log::{KvLog, Message, OFFSET_OLDEST};
use connet_proto::relay::{
    AuthenticateReq, AuthenticateResp, ClientChange, ClientsReq, ClientsResp, ServerChange,
    ServersReq, ServersResp,
};
use connet_proto::shared::ChangeType;
use connet_proto::{read_message, write_message, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{RelayAuthentication, RelayAuthenticator};
use crate::ControlError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct RelayClientKey {
    pub forward: Forward,
    pub role: Role,
    pub key: CertificateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelayClientValue {
    pub certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct RelayServerKey {
    pub forward: Forward,
    pub hostport: HostPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelayServerValue {
    pub certificate: Vec<u8>,
}

/// `forward -> relay hostport -> virtual server certificate DER`, plus the
/// log watermark the map reflects.
struct ForwardsCache {
    cache: HashMap<Forward, HashMap<HostPort, Vec<u8>>>,
    offset: i64,
}

pub(crate) struct RelaysServer {
    id: String,
    auth: Arc<dyn RelayAuthenticator>,

    pub(crate) relay_clients: KvLog<RelayClientKey, RelayClientValue>,
    pub(crate) relay_servers: KvLog<RelayServerKey, RelayServerValue>,
    relay_server_offsets: KvLog<HostPort, i64>,

    forwards: RwLock<ForwardsCache>,
}

impl RelaysServer {
    pub(crate) fn new(
        id: String,
        auth: Arc<dyn RelayAuthenticator>,
        dir: &Path,
    ) -> Result<Self, ControlError> {
        let relay_clients = KvLog::open(dir.join("relay-clients"))?;
        let relay_servers: KvLog<RelayServerKey, RelayServerValue> =
            KvLog::open(dir.join("relay-servers"))?;
        let relay_server_offsets = KvLog::open(dir.join("relay-server-offsets"))?;

        let (msgs, offset) = relay_servers.snapshot()?;
        let mut cache: HashMap<Forward, HashMap<HostPort, Vec<u8>>> = HashMap::new();
        for msg in msgs {
            if let Some(value) = msg.value {
                cache
                    .entry(msg.key.forward)
                    .or_default()
                    .insert(msg.key.hostport, value.certificate);
            }
        }

        Ok(Self {
            id,
            auth,
            relay_clients,
            relay_servers,
            relay_server_offsets,
            forwards: RwLock::new(ForwardsCache { cache, offset }),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// The relays currently serving `forward`, and the watermark the answer
    /// reflects; consuming `relay-servers` from that watermark observes every
    /// later change exactly once.
    pub(crate) fn get_forward(&self, forward: &Forward) -> (HashMap<HostPort, Vec<u8>>, i64) {
        let forwards = self.forwards.read().unwrap();
        (
            forwards.cache.get(forward).cloned().unwrap_or_default(),
            forwards.offset,
        )
    }

    /// Keep the forwards index in sync with the `relay-servers` log. The
    /// watermark advances only after the corresponding map mutation.
    pub(crate) async fn run_forwards_index(&self) -> Result<(), ControlError> {
        loop {
            let offset = self.forwards.read().unwrap().offset;
            let (msgs, next) = self.relay_servers.consume(offset).await?;

            let mut forwards = self.forwards.write().unwrap();
            for msg in msgs {
                apply_forward_change(&mut forwards.cache, &msg);
                forwards.offset = msg.offset + 1;
            }
            forwards.offset = next;
        }
    }

    /// Mirror a client certificate into `relay-clients` for as long as the
    /// returned guard lives; relays trust exactly the mirrored set.
    pub(crate) fn mirror_client(
        &self,
        forward: Forward,
        role: Role,
        certificate: Vec<u8>,
    ) -> Result<MirrorGuard, ControlError> {
        let key = RelayClientKey {
            forward,
            role,
            key: CertificateKey::of(&certificate),
        };
        self.relay_clients
            .put(key.clone(), RelayClientValue { certificate })?;
        Ok(MirrorGuard {
            relay_clients: self.relay_clients.clone(),
            key,
        })
    }

    fn relay_server_offset(&self, hostport: &HostPort) -> Result<i64, ControlError> {
        Ok(self
            .relay_server_offsets
            .get_or_default(hostport, OFFSET_OLDEST)?)
    }

    pub(crate) async fn handle(self: Arc<Self>, conn: quinn::Connection) {
        if let Err(err) = self.run_conn(&conn).await {
            warn!(err = %err, remote = %conn.remote_address(), "relay connection ended");
            if let ControlError::Protocol(perr) = &err {
                conn.close(u32::from(perr.code.as_u16()).into(), perr.message.as_bytes());
                return;
            }
        }
        conn.close(0u32.into(), b"done");
    }

    async fn run_conn(&self, conn: &quinn::Connection) -> Result<(), ControlError> {
        debug!("waiting for relay authentication");
        let (mut send, mut recv) = conn.accept_bi().await?;
        let req: AuthenticateReq = read_message(&mut recv).await?;

        let auth = match self.auth.authenticate(&req.token) {
            Ok(auth) => auth,
            Err(err) => {
                write_message(
                    &mut send,
                    &AuthenticateResp {
                        error: Some(err.clone()),
                        control_id: None,
                    },
                )
                .await?;
                conn.close(
                    u32::from(ErrorCode::AuthenticationFailed.as_u16()).into(),
                    b"authentication failed",
                );
                return Err(ControlError::Protocol(err));
            }
        };

        write_message(
            &mut send,
            &AuthenticateResp {
                error: None,
                control_id: Some(self.id.clone()),
            },
        )
        .await?;
        let hostport = req.addr;
        debug!(relay = %hostport, "relay authentication completed");

        tokio::try_join!(
            self.run_relay_clients(conn, auth.as_ref()),
            self.run_relay_servers(conn, &hostport),
        )?;
        Ok(())
    }

    /// Serve the clients stream: the relay asks for changes from its durable
    /// watermark and gets back authorized-client records it is allowed to
    /// see. A watermark of `OFFSET_OLDEST` gets a key-compacted snapshot.
    async fn run_relay_clients(
        &self,
        conn: &quinn::Connection,
        auth: &dyn RelayAuthentication,
    ) -> Result<(), ControlError> {
        let (mut send, mut recv) = conn.accept_bi().await?;

        loop {
            let req: ClientsReq = read_message(&mut recv).await?;

            // an offset past the end of the log means the relay's view is
            // from a log we no longer have; converge it from a snapshot
            let (msgs, next) = if req.offset == OFFSET_OLDEST
                || req.offset > self.relay_clients.next_offset()
            {
                let snapshot = self.relay_clients.snapshot()?;
                debug!(offset = snapshot.1, changes = snapshot.0.len(), "sending initial relay changes");
                snapshot
            } else {
                let batch = self.relay_clients.consume(req.offset).await?;
                debug!(offset = batch.1, changes = batch.0.len(), "sending delta relay changes");
                batch
            };

            let changes = client_changes(msgs, auth);

            write_message(
                &mut send,
                &ClientsResp {
                    changes,
                    offset: next,
                },
            )
            .await?;
        }
    }

    /// Drive the servers stream: present the durable watermark for this
    /// relay, ingest its served-forward changes into `relay-servers`, then
    /// persist the new watermark, so a crash on either side resumes without
    /// re-applying or losing a batch.
    async fn run_relay_servers(
        &self,
        conn: &quinn::Connection,
        hostport: &HostPort,
    ) -> Result<(), ControlError> {
        let (mut send, mut recv) = conn.open_bi().await?;

        loop {
            let offset = self.relay_server_offset(hostport)?;
            write_message(&mut send, &ServersReq { offset }).await?;

            let resp: ServersResp = read_message(&mut recv).await?;
            for change in resp.changes {
                let key = RelayServerKey {
                    forward: change.forward,
                    hostport: hostport.clone(),
                };
                match (change.change, change.server_certificate) {
                    (ChangeType::Put, Some(certificate)) => {
                        self.relay_servers
                            .put(key, RelayServerValue { certificate })?;
                    }
                    (ChangeType::Del, _) => {
                        self.relay_servers.del(key)?;
                    }
                    (ChangeType::Put, None) => {
                        return Err(ControlError::Protocol(connet_proto::Error::new(
                            ErrorCode::RelayInvalidCertificate,
                            "put change without certificate",
                        )));
                    }
                }
            }

            self.relay_server_offsets.put(hostport.clone(), resp.offset)?;
        }
    }
}

/// Keeps a `relay-clients` record alive; withdrawn on drop.
pub(crate) struct MirrorGuard {
    relay_clients: KvLog<RelayClientKey, RelayClientValue>,
    key: RelayClientKey,
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        if let Err(err) = self.relay_clients.del(self.key.clone()) {
            warn!(err = %err, "failed to withdraw relay client record");
        }
    }
}

/// Turn log messages into wire changes a relay is allowed to see.
fn client_changes(
    msgs: Vec<Message<RelayClientKey, RelayClientValue>>,
    auth: &dyn RelayAuthentication,
) -> Vec<ClientChange> {
    msgs.into_iter()
        .filter(|msg| auth.allow(&msg.key.forward))
        .map(|msg| ClientChange {
            forward: msg.key.forward,
            role: msg.key.role,
            certificate_key: msg.key.key,
            change: if msg.value.is_some() {
                ChangeType::Put
            } else {
                ChangeType::Del
            },
            certificate: msg.value.map(|v| v.certificate),
        })
        .collect()
}

fn apply_forward_change(
    cache: &mut HashMap<Forward, HashMap<HostPort, Vec<u8>>>,
    msg: &Message<RelayServerKey, RelayServerValue>,
) {
    match &msg.value {
        Some(value) => {
            cache
                .entry(msg.key.forward.clone())
                .or_default()
                .insert(msg.key.hostport.clone(), value.certificate.clone());
        }
        None => {
            if let Some(servers) = cache.get_mut(&msg.key.forward) {
                servers.remove(&msg.key.hostport);
                if servers.is_empty() {
                    cache.remove(&msg.key.forward);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticRelayAuthenticator;

    fn server(dir: &Path) -> RelaysServer {
        RelaysServer::new(
            "connet-test".into(),
            Arc::new(StaticRelayAuthenticator::new(["tok"])),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_forwards_cache_restored_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = server(dir.path());
            s.relay_servers
                .put(
                    RelayServerKey {
                        forward: Forward::new("sws"),
                        hostport: HostPort::new("relay", 19191),
                    },
                    RelayServerValue {
                        certificate: vec![1, 2],
                    },
                )
                .unwrap();
        }

        let s = server(dir.path());
        let (servers, offset) = s.get_forward(&Forward::new("sws"));
        assert_eq!(offset, 1);
        assert_eq!(
            servers.get(&HostPort::new("relay", 19191)),
            Some(&vec![1u8, 2])
        );
    }

    #[tokio::test]
    async fn test_forwards_index_follows_log() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(server(dir.path()));

        let idx = s.clone();
        tokio::spawn(async move { idx.run_forwards_index().await });

        let key = RelayServerKey {
            forward: Forward::new("sws"),
            hostport: HostPort::new("relay", 19191),
        };
        s.relay_servers
            .put(key.clone(), RelayServerValue { certificate: vec![7] })
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (servers, _) = s.get_forward(&Forward::new("sws"));
        assert_eq!(servers.len(), 1);

        s.relay_servers.del(key).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (servers, _) = s.get_forward(&Forward::new("sws"));
        assert!(servers.is_empty());
    }

    #[test]
    fn test_client_changes_filtered_by_authorization() {
        struct OnlyTeam;
        impl RelayAuthentication for OnlyTeam {
            fn allow(&self, forward: &Forward) -> bool {
                forward.as_str().starts_with("team/")
            }
        }

        let msgs = vec![
            Message {
                offset: 0,
                key: RelayClientKey {
                    forward: Forward::new("sws"),
                    role: Role::Destination,
                    key: connet_cert::CertificateKey::of(b"a"),
                },
                value: Some(RelayClientValue {
                    certificate: vec![1],
                }),
            },
            Message {
                offset: 1,
                key: RelayClientKey {
                    forward: Forward::new("team/sws"),
                    role: Role::Source,
                    key: connet_cert::CertificateKey::of(b"b"),
                },
                value: None,
            },
        ];

        let changes = client_changes(msgs, &OnlyTeam);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].forward, Forward::new("team/sws"));
        assert!(matches!(changes[0].change, ChangeType::Del));
        assert!(changes[0].certificate.is_none());
    }

    #[test]
    fn test_mirror_guard_withdraws_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(dir.path());

        {
            let _guard = s
                .mirror_client(Forward::new("sws"), Role::Destination, vec![1, 2, 3])
                .unwrap();
            let key = RelayClientKey {
                forward: Forward::new("sws"),
                role: Role::Destination,
                key: connet_cert::CertificateKey::of(&[1, 2, 3]),
            };
            assert!(s.relay_clients.get(&key).is_ok());
        }

        let key = RelayClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: connet_cert::CertificateKey::of(&[1, 2, 3]),
        };
        assert!(s.relay_clients.get(&key).is_err());
    }

    #[test]
    fn test_relay_server_offset_defaults_to_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(dir.path());
        let hp = HostPort::new("relay", 19191);
        assert_eq!(s.relay_server_offset(&hp).unwrap(), OFFSET_OLDEST);

        s.relay_server_offsets.put(hp.clone(), 42).unwrap();
        assert_eq!(s.relay_server_offset(&hp).unwrap(), 42);
    }
}
