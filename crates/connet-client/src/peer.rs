//! Per-forward peer model: what we advertise, who the remote peers are, and
//! which QUIC connections to them are currently usable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use connet_cert::{dns_names, Cert, CertOpts, CertificateKey};
use connet_core::notify::Watch;
use connet_core::{Forward, HostPort, RouteOption};
use connet_proto::shared::{DirectRoute, PeerDescriptor, RelayRoute, ServerPeer};
use connet_proto::ALPN_DIRECT;
use quinn::Connection;
use rustls::crypto::CryptoProvider;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::direct::DirectServer;
use crate::tls::pinned_client_config;
use crate::ClientError;

/// How often offline peers are re-attempted without a peers change.
const REDIAL_INTERVAL: Duration = Duration::from_secs(30);

type Accepted = mpsc::UnboundedReceiver<(CertificateKey, Connection)>;

/// One forward's peer state. The maintenance task keeps `active` in step
/// with the latest peer list; inbound connections accepted by the direct
/// endpoint land here too.
pub(crate) struct Peer {
    forward: Forward,
    route: RouteOption,
    endpoint: quinn::Endpoint,
    provider: Arc<CryptoProvider>,
    pub(crate) server_cert: Cert,
    pub(crate) client_cert: Cert,
    direct: Arc<DirectServer>,

    self_desc: Watch<PeerDescriptor>,
    peers: Watch<Vec<ServerPeer>>,
    relays: Watch<Vec<RelayRoute>>,

    active: RwLock<HashMap<String, Connection>>,
    pending: Mutex<HashSet<String>>,
    accepted: Mutex<Option<Accepted>>,
    conn_events: mpsc::UnboundedSender<Connection>,
}

impl Peer {
    /// Mint the per-forward certificate pair, register the forward's
    /// virtual server on the direct endpoint, and seed the self descriptor.
    ///
    /// The returned receiver yields every connection that becomes active
    /// (dialed or accepted); destinations serve streams on them.
    pub(crate) fn new(
        forward: Forward,
        route: RouteOption,
        issuer: &Cert,
        direct: Arc<DirectServer>,
        endpoint: quinn::Endpoint,
        provider: Arc<CryptoProvider>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Connection>), ClientError> {
        let server_cert = issuer.new_server(CertOpts::domains(["connet-direct"]))?;
        let client_cert = issuer.new_client(CertOpts::default())?;
        let accepted = direct.add_server(&server_cert)?;

        let self_desc = Watch::new();
        self_desc.set(PeerDescriptor {
            direct: Some(DirectRoute {
                addresses: Vec::new(),
                server_certificate: server_cert.der().to_vec(),
                client_certificate: client_cert.der().to_vec(),
            }),
            relays: Vec::new(),
        });

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            forward,
            route,
            endpoint,
            provider,
            server_cert,
            client_cert,
            direct,
            self_desc,
            peers: Watch::new(),
            relays: Watch::new(),
            active: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            accepted: Mutex::new(Some(accepted)),
            conn_events: conn_tx,
        });
        Ok((peer, conn_rx))
    }

    /// This client's advertised descriptor for the forward.
    pub(crate) fn self_descriptor(&self) -> &Watch<PeerDescriptor> {
        &self.self_desc
    }

    /// Update the direct-route candidate addresses (no-op when the route
    /// policy forbids direct).
    pub(crate) fn set_direct_addrs(&self, addrs: &[SocketAddr]) {
        if !self.route.allow_direct() {
            return;
        }
        let addrs = addrs.to_vec();
        self.self_desc.update(PeerDescriptor::default, move |desc| {
            if let Some(direct) = &mut desc.direct {
                direct.addresses = addrs;
            }
        });
    }

    /// Update the relays serving this forward, electing them into the self
    /// descriptor when the route policy allows relaying.
    pub(crate) fn set_relays(&self, relays: Vec<RelayRoute>) {
        self.relays.set(relays.clone());
        if !self.route.allow_relay() {
            return;
        }
        let hostports: Vec<HostPort> = relays.into_iter().map(|r| r.hostport).collect();
        self.self_desc.update(PeerDescriptor::default, move |desc| {
            desc.relays = hostports;
        });
    }

    /// Replace the latest remote peer list.
    pub(crate) fn set_peers(&self, peers: Vec<ServerPeer>) {
        self.peers.set(peers);
    }

    /// Currently usable connections to remote peers.
    pub(crate) fn get_active(&self) -> Vec<Connection> {
        self.active.read().unwrap().values().cloned().collect()
    }

    /// Run the inbound feed and the maintenance task.
    pub(crate) async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        let accepted = self
            .accepted
            .lock()
            .unwrap()
            .take()
            .expect("peer run started twice");

        tokio::try_join!(self.run_inbound(accepted), self.run_maintenance())?;
        Ok(())
    }

    async fn run_inbound(&self, mut accepted: Accepted) -> Result<(), ClientError> {
        while let Some((key, conn)) = accepted.recv().await {
            self.add_active(key.short_id(), conn);
        }
        Ok(())
    }

    async fn run_maintenance(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut rx = self.peers.subscribe();
        let mut redial = tokio::time::interval(REDIAL_INTERVAL);
        redial.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let peers = rx.borrow_and_update().clone().unwrap_or_default();
            self.reconcile(peers);

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = redial.tick() => {}
            }
        }
    }

    fn reconcile(self: &Arc<Self>, peers: Vec<ServerPeer>) {
        let expected: HashSet<&str> = peers.iter().map(|p| p.id.as_str()).collect();

        self.active
            .write()
            .unwrap()
            .retain(|id, conn| expected.contains(id.as_str()) && conn.close_reason().is_none());

        // inbound trust follows the peer list: exactly the advertised
        // client certificates may dial us for this forward
        let mut allowed = HashMap::new();
        for peer in &peers {
            if let Some(direct) = &peer.peer.direct {
                allowed.insert(
                    CertificateKey::of(&direct.client_certificate),
                    direct.client_certificate.clone(),
                );
            }
        }
        self.direct
            .set_allowed(&self.server_cert.certificate_key(), allowed);

        for peer in peers {
            let connected = self.active.read().unwrap().contains_key(&peer.id);
            if connected || !self.pending.lock().unwrap().insert(peer.id.clone()) {
                continue;
            }

            let this = self.clone();
            tokio::spawn(async move {
                match this.dial_peer(&peer).await {
                    Ok(conn) => this.add_active(peer.id.clone(), conn),
                    Err(err) => {
                        debug!(forward = %this.forward, peer = %peer.id, err = %err, "peer offline this cycle");
                    }
                }
                this.pending.lock().unwrap().remove(&peer.id);
            });
        }
    }

    fn add_active(&self, id: String, conn: Connection) {
        debug!(forward = %self.forward, peer = %id, remote = %conn.remote_address(), "peer connection active");
        let replaced = self.active.write().unwrap().insert(id, conn.clone());
        if let Some(replaced) = replaced {
            replaced.close(0u32.into(), b"replaced");
        }
        let _ = self.conn_events.send(conn);
    }

    /// Try the peer's direct addresses first (in parallel, first success
    /// wins), then its first advertised relay.
    async fn dial_peer(&self, peer: &ServerPeer) -> Result<Connection, ClientError> {
        if self.route.allow_direct() {
            if let Some(direct) = &peer.peer.direct {
                if !direct.addresses.is_empty() {
                    match self.dial_direct(direct).await {
                        Ok(conn) => return Ok(conn),
                        Err(err) => {
                            debug!(forward = %self.forward, err = %err, "direct dial failed");
                        }
                    }
                }
            }
        }

        if self.route.allow_relay() {
            if let Some(hostport) = peer.peer.relays.first() {
                return self.dial_relay(hostport).await;
            }
        }

        Err(ClientError::NoRoute)
    }

    async fn dial_direct(&self, direct: &DirectRoute) -> Result<Connection, ClientError> {
        // the SNI carries the expected certificate's short id so the peer
        // can resolve which forward's certificate to present; trust comes
        // from pinning the advertised leaf
        let sni = CertificateKey::of(&direct.server_certificate).short_id();
        let config = pinned_client_config(
            &self.provider,
            direct.server_certificate.clone(),
            &self.client_cert,
            ALPN_DIRECT,
        )?;

        let mut dials: JoinSet<Result<Connection, ClientError>> = JoinSet::new();
        for addr in direct.addresses.clone() {
            let endpoint = self.endpoint.clone();
            let config = config.clone();
            let sni = sni.clone();
            dials.spawn(async move { Ok(endpoint.connect_with(config, addr, &sni)?.await?) });
        }

        while let Some(result) = dials.join_next().await {
            if let Ok(Ok(conn)) = result {
                return Ok(conn);
            }
        }
        Err(ClientError::NoRoute)
    }

    async fn dial_relay(&self, hostport: &HostPort) -> Result<Connection, ClientError> {
        let relays = self.relays.get().unwrap_or_default();
        let relay = relays
            .iter()
            .find(|r| r.hostport == *hostport)
            .ok_or(ClientError::NoRoute)?;

        let names = dns_names(&relay.server_certificate)?;
        let sni = names.first().ok_or(ClientError::NoRoute)?;
        let config = pinned_client_config(
            &self.provider,
            relay.server_certificate.clone(),
            &self.client_cert,
            ALPN_DIRECT,
        )?;

        let addr = tokio::net::lookup_host((relay.hostport.host.as_str(), relay.hostport.port))
            .await?
            .next()
            .ok_or(ClientError::NoRoute)?;

        debug!(forward = %self.forward, relay = %relay.hostport, "dialing relay");
        Ok(self.endpoint.connect_with(config, addr, sni)?.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(route: RouteOption) -> (Arc<Peer>, mpsc::UnboundedReceiver<Connection>) {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let root = Cert::new_root().unwrap();
        let direct = Arc::new(DirectServer::new(provider.clone()));
        let endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        Peer::new(
            Forward::new("sws"),
            route,
            &root,
            direct,
            endpoint,
            provider,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_descriptor_carries_certificates_from_start() {
        let (peer, _conns) = peer(RouteOption::Any);
        let desc = peer.self_descriptor().get().unwrap();
        let direct = desc.direct.unwrap();
        assert!(direct.addresses.is_empty());
        assert_eq!(direct.server_certificate, peer.server_cert.der().to_vec());
        assert_eq!(direct.client_certificate, peer.client_cert.der().to_vec());
    }

    #[tokio::test]
    async fn test_set_direct_addrs_ignored_on_relay_route() {
        let (relay_only, _conns) = peer(RouteOption::Relay);
        relay_only.set_direct_addrs(&["127.0.0.1:1000".parse().unwrap()]);
        let desc = relay_only.self_descriptor().get().unwrap();
        assert!(desc.direct.unwrap().addresses.is_empty());
    }

    #[tokio::test]
    async fn test_set_direct_addrs_applied_on_any_route() {
        let (any, _conns) = peer(RouteOption::Any);
        any.set_direct_addrs(&["127.0.0.1:1000".parse().unwrap()]);
        let desc = any.self_descriptor().get().unwrap();
        assert_eq!(desc.direct.unwrap().addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_set_relays_elects_hostports() {
        let (peer, _conns) = peer(RouteOption::Any);
        peer.set_relays(vec![RelayRoute {
            hostport: HostPort::new("relay.example.com", 19191),
            server_certificate: vec![1, 2, 3],
        }]);

        let desc = peer.self_descriptor().get().unwrap();
        assert_eq!(desc.relays, vec![HostPort::new("relay.example.com", 19191)]);
    }

    #[tokio::test]
    async fn test_direct_only_route_never_elects_relays() {
        let (peer, _conns) = peer(RouteOption::Direct);
        peer.set_relays(vec![RelayRoute {
            hostport: HostPort::new("relay.example.com", 19191),
            server_certificate: vec![1],
        }]);
        // direct-only forwards never elect relays
        let desc = peer.self_descriptor().get().unwrap();
        assert!(desc.relays.is_empty());
    }
}
