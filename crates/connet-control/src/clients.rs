//! Client side of the control server: the `clients` log, the
//! clients-by-forward index, and the per-forward client streams.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use connet_cert::CertificateKey;
use connet_core::{Forward, Role};
use connet_log::{KvLog, Message};
use connet_proto::client::{Authenticate, AuthenticateResp, Request, Response};
use connet_proto::shared::{PeerDescriptor, RelayRoute, ServerPeer};
use connet_proto::{read_message, write_message, Error, ErrorCode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{ClientAuthentication, ClientAuthenticator};
use crate::relays::RelaysServer;
use crate::ControlError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct ClientKey {
    pub forward: Forward,
    pub role: Role,
    pub key: CertificateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClientValue {
    pub peer: PeerDescriptor,
}

struct ClientsCache {
    cache: HashMap<(Forward, Role), Vec<ServerPeer>>,
    offset: i64,
}

pub(crate) struct ClientsServer {
    auth: Arc<dyn ClientAuthenticator>,
    relays: Arc<RelaysServer>,

    clients: KvLog<ClientKey, ClientValue>,
    cache: RwLock<ClientsCache>,
    tokens: Mutex<HashSet<Vec<u8>>>,
}

impl ClientsServer {
    pub(crate) fn new(
        auth: Arc<dyn ClientAuthenticator>,
        relays: Arc<RelaysServer>,
        dir: &Path,
    ) -> Result<Self, ControlError> {
        let clients: KvLog<ClientKey, ClientValue> = KvLog::open(dir.join("clients"))?;

        let (msgs, offset) = clients.snapshot()?;
        let mut cache: HashMap<(Forward, Role), Vec<ServerPeer>> = HashMap::new();
        for msg in msgs {
            if let Some(value) = msg.value {
                cache
                    .entry((msg.key.forward.clone(), msg.key.role))
                    .or_default()
                    .push(ServerPeer {
                        id: msg.key.key.short_id(),
                        peer: value.peer,
                    });
            }
        }

        Ok(Self {
            auth,
            relays,
            clients,
            cache: RwLock::new(ClientsCache { cache, offset }),
            tokens: Mutex::new(HashSet::new()),
        })
    }

    /// Keep the clients-by-forward index in sync with the `clients` log.
    pub(crate) async fn run_clients_index(&self) -> Result<(), ControlError> {
        loop {
            let offset = self.cache.read().unwrap().offset;
            let (msgs, next) = self.clients.consume(offset).await?;

            let mut cache = self.cache.write().unwrap();
            for msg in &msgs {
                let entry = cache
                    .cache
                    .entry((msg.key.forward.clone(), msg.key.role))
                    .or_default();
                apply_peer_change(entry, msg);
                if entry.is_empty() {
                    cache.cache.remove(&(msg.key.forward.clone(), msg.key.role));
                }
                cache.offset = msg.offset + 1;
            }
            cache.offset = next;
        }
    }

    fn clients_snapshot(&self, forward: &Forward, role: Role) -> (Vec<ServerPeer>, i64) {
        let cache = self.cache.read().unwrap();
        (
            cache
                .cache
                .get(&(forward.clone(), role))
                .cloned()
                .unwrap_or_default(),
            cache.offset,
        )
    }

    fn issue_token(&self) -> Vec<u8> {
        let mut token = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        self.tokens.lock().unwrap().insert(token.clone());
        token
    }

    pub(crate) async fn handle(self: Arc<Self>, conn: quinn::Connection) {
        if let Err(err) = self.run_conn(&conn).await {
            warn!(err = %err, remote = %conn.remote_address(), "client connection ended");
            if let ControlError::Protocol(perr) = &err {
                conn.close(u32::from(perr.code.as_u16()).into(), perr.message.as_bytes());
                return;
            }
        }
        conn.close(0u32.into(), b"done");
    }

    async fn run_conn(self: &Arc<Self>, conn: &quinn::Connection) -> Result<(), ControlError> {
        debug!("waiting for client authentication");
        let (mut send, mut recv) = conn.accept_bi().await?;
        let req: Authenticate = read_message(&mut recv).await?;

        let auth = match self.auth.authenticate(&req.token) {
            Ok(auth) => auth,
            Err(err) => {
                write_message(
                    &mut send,
                    &AuthenticateResp {
                        error: Some(err.clone()),
                        public_addr: None,
                        reconnect_token: None,
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

        // an unknown or absent reconnect token means a fresh session; the
        // session state itself converges from what the client re-publishes
        let resumed = req
            .reconnect_token
            .map(|token| self.tokens.lock().unwrap().contains(&token))
            .unwrap_or(false);
        let token = self.issue_token();

        write_message(
            &mut send,
            &AuthenticateResp {
                error: None,
                public_addr: Some(conn.remote_address()),
                reconnect_token: Some(token),
            },
        )
        .await?;
        debug!(remote = %conn.remote_address(), resumed, "client authentication completed");

        loop {
            let (send, recv) = conn.accept_bi().await?;
            let server = self.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                if let Err(err) = server.run_stream(auth, send, recv).await {
                    debug!(err = %err, "client stream ended");
                }
            });
        }
    }

    async fn run_stream(
        &self,
        auth: Arc<dyn ClientAuthentication>,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<(), ControlError> {
        let req: Request = read_message(&mut recv).await?;
        let result = match req {
            Request::Destination { to, peer } => {
                self.run_announce(auth, Role::Destination, to, peer, &mut send, &mut recv)
                    .await
            }
            Request::Source { to, peer } => {
                self.run_announce(auth, Role::Source, to, peer, &mut send, &mut recv)
                    .await
            }
            Request::DestinationRelay { to, certificate } => {
                self.run_relay_listen(auth, Role::Destination, to, certificate, &mut send, &mut recv)
                    .await
            }
            Request::SourceRelay { to, certificate } => {
                self.run_relay_listen(auth, Role::Source, to, certificate, &mut send, &mut recv)
                    .await
            }
        };

        if let Err(ControlError::Protocol(err)) = &result {
            let _ = write_message(&mut send, &Response::Error(err.clone())).await;
        }
        result
    }

    /// Run a destination/source stream: maintain this client's record in the
    /// `clients` log from what it publishes, and push the matching peer list
    /// (opposite role, self excluded) whenever it changes.
    async fn run_announce(
        &self,
        auth: Arc<dyn ClientAuthentication>,
        role: Role,
        to: Forward,
        first: PeerDescriptor,
        send: &mut quinn::SendStream,
        recv: &mut quinn::RecvStream,
    ) -> Result<(), ControlError> {
        let validation_failed = match role {
            Role::Destination => ErrorCode::DestinationValidationFailed,
            Role::Source => ErrorCode::SourceValidationFailed,
        };
        let forward = auth
            .validate(&to, role)
            .map_err(|err| Error::new(validation_failed, err.message))?;

        let self_id = Arc::new(Mutex::new(None::<String>));
        let mut announce = Announce {
            server: self,
            forward: forward.clone(),
            role,
            current: None,
            self_id: self_id.clone(),
        };
        announce.publish(first)?;

        let reader = async {
            loop {
                let req: Request = read_message(recv).await?;
                let peer = match (role, req) {
                    (Role::Destination, Request::Destination { to, peer }) if to == forward => peer,
                    (Role::Source, Request::Source { to, peer }) if to == forward => peer,
                    _ => {
                        return Err(ControlError::Protocol(Error::new(
                            ErrorCode::RequestUnknown,
                            "unexpected request on announce stream",
                        )))
                    }
                };
                announce.publish(peer)?;
            }
        };

        let writer = async {
            let watch = role.opposite();
            let (mut peers, mut offset) = self.clients_snapshot(&forward, watch);

            let visible = exclude_self(&peers, &self_id);
            if !visible.is_empty() {
                write_message(send, &peer_response(role, visible)).await?;
            }

            loop {
                let (msgs, next) = self.clients.consume(offset).await?;
                let mut changed = false;
                for msg in &msgs {
                    if msg.key.forward == forward && msg.key.role == watch {
                        changed |= apply_peer_change(&mut peers, msg);
                    }
                }
                offset = next;

                if changed {
                    write_message(send, &peer_response(role, exclude_self(&peers, &self_id)))
                        .await?;
                }
            }
        };

        tokio::select! {
            res = reader => res,
            res = writer => res,
        }
    }

    /// Run a relay stream: mirror the client certificate into
    /// `relay-clients` while the stream lives, and push the set of relays
    /// serving the forward whenever it changes.
    async fn run_relay_listen(
        &self,
        auth: Arc<dyn ClientAuthentication>,
        role: Role,
        to: Forward,
        certificate: Vec<u8>,
        send: &mut quinn::SendStream,
        recv: &mut quinn::RecvStream,
    ) -> Result<(), ControlError> {
        let validation_failed = match role {
            Role::Destination => ErrorCode::RelayDestinationValidationFailed,
            Role::Source => ErrorCode::RelaySourceValidationFailed,
        };
        let forward = auth
            .validate(&to, role)
            .map_err(|err| Error::new(validation_failed, err.message))?;

        let _mirror = self
            .relays
            .mirror_client(forward.clone(), role, certificate)?;

        let reader = async {
            let _: Request = read_message(recv).await?;
            Err::<(), _>(ControlError::Protocol(Error::new(
                ErrorCode::RequestUnknown,
                "unexpected request on relay stream",
            )))
        };

        let writer = async {
            let (mut servers, mut offset) = self.relays.get_forward(&forward);
            if !servers.is_empty() {
                write_message(send, &relays_response(&servers)).await?;
            }

            loop {
                let (msgs, next) = self.relays.relay_servers.consume(offset).await?;
                let mut changed = false;
                for msg in msgs {
                    if msg.key.forward != forward {
                        continue;
                    }
                    match msg.value {
                        Some(value) => {
                            servers.insert(msg.key.hostport, value.certificate);
                        }
                        None => {
                            servers.remove(&msg.key.hostport);
                        }
                    }
                    changed = true;
                }
                offset = next;

                if changed {
                    write_message(send, &relays_response(&servers)).await?;
                }
            }
        };

        tokio::select! {
            res = reader => res,
            res = writer => res,
        }
    }
}

fn peer_response(role: Role, peers: Vec<ServerPeer>) -> Response {
    match role {
        Role::Destination => Response::Destination { sources: peers },
        Role::Source => Response::Source {
            destinations: peers,
        },
    }
}

fn relays_response(servers: &HashMap<connet_core::HostPort, Vec<u8>>) -> Response {
    Response::Relays {
        relays: servers
            .iter()
            .map(|(hostport, certificate)| RelayRoute {
                hostport: hostport.clone(),
                server_certificate: certificate.clone(),
            })
            .collect(),
    }
}

fn exclude_self(peers: &[ServerPeer], self_id: &Mutex<Option<String>>) -> Vec<ServerPeer> {
    let own = self_id.lock().unwrap().clone();
    peers
        .iter()
        .filter(|peer| Some(&peer.id) != own.as_ref())
        .cloned()
        .collect()
}

fn apply_peer_change(peers: &mut Vec<ServerPeer>, msg: &Message<ClientKey, ClientValue>) -> bool {
    let id = msg.key.key.short_id();
    match &msg.value {
        Some(value) => {
            let next = ServerPeer {
                id: id.clone(),
                peer: value.peer.clone(),
            };
            if let Some(existing) = peers.iter_mut().find(|peer| peer.id == id) {
                if *existing == next {
                    false
                } else {
                    *existing = next;
                    true
                }
            } else {
                peers.push(next);
                true
            }
        }
        None => {
            let before = peers.len();
            peers.retain(|peer| peer.id != id);
            before != peers.len()
        }
    }
}

/// A client's live record in the `clients` log; withdrawn on drop.
struct Announce<'a> {
    server: &'a ClientsServer,
    forward: Forward,
    role: Role,
    current: Option<(CertificateKey, ClientValue)>,
    self_id: Arc<Mutex<Option<String>>>,
}

impl Announce<'_> {
    fn publish(&mut self, peer: PeerDescriptor) -> Result<(), ControlError> {
        let invalid = match self.role {
            Role::Destination => ErrorCode::DestinationInvalidCertificate,
            Role::Source => ErrorCode::SourceInvalidCertificate,
        };
        let cert = peer
            .client_certificate()
            .ok_or_else(|| Error::new(invalid, "peer descriptor missing client certificate"))?;
        let key = CertificateKey::of(cert);
        let value = ClientValue { peer };

        match &self.current {
            // unchanged re-publish (e.g. after a reconnect): no new records
            Some((current, existing)) if *current == key && *existing == value => return Ok(()),
            // identity rotation: tombstone the old key before the new one
            // becomes observable
            Some((current, _)) if *current != key => {
                self.server.clients.del(ClientKey {
                    forward: self.forward.clone(),
                    role: self.role,
                    key: *current,
                })?;
            }
            _ => {}
        }

        // at most one role per (forward, certificate-key)
        let other = ClientKey {
            forward: self.forward.clone(),
            role: self.role.opposite(),
            key,
        };
        if self.server.clients.get(&other).is_ok() {
            self.server.clients.del(other)?;
        }

        self.server.clients.put(
            ClientKey {
                forward: self.forward.clone(),
                role: self.role,
                key,
            },
            value.clone(),
        )?;
        self.current = Some((key, value));
        *self.self_id.lock().unwrap() = Some(key.short_id());
        Ok(())
    }
}

impl Drop for Announce<'_> {
    fn drop(&mut self) {
        if let Some((key, _)) = self.current.take() {
            let key = ClientKey {
                forward: self.forward.clone(),
                role: self.role,
                key,
            };
            if let Err(err) = self.server.clients.del(key) {
                warn!(err = %err, "failed to withdraw client record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticClientAuthenticator, StaticRelayAuthenticator};
    use connet_proto::shared::DirectRoute;

    fn servers(dir: &Path) -> (Arc<ClientsServer>, Arc<RelaysServer>) {
        let relays = Arc::new(
            RelaysServer::new(
                "connet-test".into(),
                Arc::new(StaticRelayAuthenticator::new(["tok"])),
                dir,
            )
            .unwrap(),
        );
        let clients = Arc::new(
            ClientsServer::new(
                Arc::new(StaticClientAuthenticator::new(["tok"])),
                relays.clone(),
                dir,
            )
            .unwrap(),
        );
        (clients, relays)
    }

    fn descriptor(client_cert: &[u8]) -> PeerDescriptor {
        PeerDescriptor {
            direct: Some(DirectRoute {
                addresses: vec!["127.0.0.1:19192".parse().unwrap()],
                server_certificate: vec![9, 9],
                client_certificate: client_cert.to_vec(),
            }),
            relays: vec![],
        }
    }

    fn announce<'a>(server: &'a ClientsServer, forward: &str, role: Role) -> Announce<'a> {
        Announce {
            server,
            forward: Forward::new(forward),
            role,
            current: None,
            self_id: Arc::new(Mutex::new(None)),
        }
    }

    #[test]
    fn test_publish_skips_unchanged_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (clients, _) = servers(dir.path());

        let mut ann = announce(&clients, "sws", Role::Destination);
        ann.publish(descriptor(b"cert-a")).unwrap();
        let after_first = clients.clients.next_offset();

        ann.publish(descriptor(b"cert-a")).unwrap();
        assert_eq!(clients.clients.next_offset(), after_first);
        std::mem::forget(ann);
    }

    #[test]
    fn test_rotation_tombstones_old_key_first() {
        let dir = tempfile::tempdir().unwrap();
        let (clients, _) = servers(dir.path());

        let mut ann = announce(&clients, "sws", Role::Destination);
        ann.publish(descriptor(b"cert-a")).unwrap();
        ann.publish(descriptor(b"cert-b")).unwrap();
        std::mem::forget(ann);

        let old = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: CertificateKey::of(b"cert-a"),
        };
        let new = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: CertificateKey::of(b"cert-b"),
        };
        assert!(clients.clients.get(&old).is_err());
        assert!(clients.clients.get(&new).is_ok());

        // the tombstone for the old key must precede the put of the new key
        let (snapshot, _) = clients.clients.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, new);
    }

    #[test]
    fn test_role_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let (clients, _) = servers(dir.path());

        let mut dst = announce(&clients, "sws", Role::Destination);
        dst.publish(descriptor(b"cert-a")).unwrap();
        std::mem::forget(dst);

        let mut src = announce(&clients, "sws", Role::Source);
        src.publish(descriptor(b"cert-a")).unwrap();
        std::mem::forget(src);

        let as_dst = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: CertificateKey::of(b"cert-a"),
        };
        let as_src = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Source,
            key: CertificateKey::of(b"cert-a"),
        };
        assert!(clients.clients.get(&as_dst).is_err());
        assert!(clients.clients.get(&as_src).is_ok());
    }

    #[test]
    fn test_drop_withdraws_record() {
        let dir = tempfile::tempdir().unwrap();
        let (clients, _) = servers(dir.path());

        {
            let mut ann = announce(&clients, "sws", Role::Destination);
            ann.publish(descriptor(b"cert-a")).unwrap();
        }

        let key = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: CertificateKey::of(b"cert-a"),
        };
        assert!(clients.clients.get(&key).is_err());
    }

    #[test]
    fn test_apply_peer_change_upserts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (clients, _) = servers(dir.path());
        let _ = clients;

        let key = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Source,
            key: CertificateKey::of(b"cert-a"),
        };
        let mut peers = Vec::new();

        let put = Message {
            offset: 0,
            key: key.clone(),
            value: Some(ClientValue {
                peer: descriptor(b"cert-a"),
            }),
        };
        assert!(apply_peer_change(&mut peers, &put));
        assert!(!apply_peer_change(&mut peers, &put)); // idempotent
        assert_eq!(peers.len(), 1);

        let del = Message {
            offset: 1,
            key,
            value: None,
        };
        assert!(apply_peer_change(&mut peers, &del));
        assert!(peers.is_empty());
    }
}
