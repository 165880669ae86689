//! The relay's session with the control server.
//!
//! One QUIC connection (ALPN `connet-relays`), four concurrent tasks per
//! session: pull authorized clients down, fold them into virtual servers,
//! materialize the servers for SNI dispatch, and publish served forwards
//! back up. All four converge from durable logs, so a reconnect resumes
//! where the last session stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use connet_cert::{Cert, CertOpts, CertificateKey};
use connet_core::model::gen_server_name;
use connet_core::net::{next_backoff, KEEP_ALIVE_PERIOD, MIN_BACKOFF};
use connet_core::{Forward, HostPort, Role};
use connet_log::{KvLog, OFFSET_OLDEST};
use connet_proto::relay::{
    AuthenticateReq, AuthenticateResp, ClientsReq, ClientsResp, ServerChange, ServersReq,
    ServersResp,
};
use connet_proto::shared::ChangeType;
use connet_proto::{read_message, write_message, Error, ErrorCode, ALPN_RELAYS};
use quinn::crypto::rustls::QuicClientConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use tracing::{debug, info, warn};

use crate::server::Rendezvous;
use crate::store::{
    ClientKey, ClientValue, ConfigKey, ConfigValue, ServerClient, ServerKey, ServerValue, Stores,
    CONFIG_CLIENTS_STREAM_OFFSET,
};
use crate::RelayError;

/// One forward this relay terminates TLS for, materialized for the data
/// plane. Immutable; updates replace the whole value, so no reader ever
/// sees a torn client set.
pub(crate) struct VirtualServer {
    pub forward: Forward,
    pub name: String,
    pub certified: Arc<CertifiedKey>,
    /// Allowed client leaf certificates, by fingerprint.
    pub clients: HashMap<CertificateKey, (Role, Vec<u8>)>,
}

impl VirtualServer {
    fn from_value(
        forward: Forward,
        value: &ServerValue,
        provider: &CryptoProvider,
    ) -> Result<Self, RelayError> {
        let certified = CertifiedKey::from_der(
            vec![CertificateDer::from(value.certificate.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(value.key.clone())),
            provider,
        )
        .map_err(|err| RelayError::Tls(rustls::Error::General(err.to_string())))?;

        let mut clients = HashMap::new();
        for client in &value.clients {
            clients.insert(
                CertificateKey::of(&client.certificate),
                (client.role, client.certificate.clone()),
            );
        }

        Ok(Self {
            forward,
            name: value.name.clone(),
            certified: Arc::new(certified),
            clients,
        })
    }
}

/// State for one control server, keyed by its stable id.
pub(crate) struct ControlState {
    id: String,
    config: KvLog<ConfigKey, ConfigValue>,
    clients: KvLog<ClientKey, ClientValue>,
    servers: KvLog<ServerKey, ServerValue>,

    by_name: RwLock<HashMap<String, Arc<VirtualServer>>>,
    name_by_forward: RwLock<HashMap<Forward, String>>,
    pub(crate) rendezvous: Mutex<HashMap<Forward, Rendezvous>>,
}

impl ControlState {
    fn new(stores: &Stores, id: String, provider: &CryptoProvider) -> Result<Self, RelayError> {
        let config = stores.config(&id)?;
        let clients = stores.clients(&id)?;
        let servers = stores.servers(&id)?;

        let (msgs, _) = servers.snapshot()?;
        let mut by_name = HashMap::new();
        let mut name_by_forward = HashMap::new();
        for msg in msgs {
            if let Some(value) = msg.value {
                let server = Arc::new(VirtualServer::from_value(
                    msg.key.forward.clone(),
                    &value,
                    provider,
                )?);
                name_by_forward.insert(msg.key.forward, value.name.clone());
                by_name.insert(value.name, server);
            }
        }

        Ok(Self {
            id,
            config,
            clients,
            servers,
            by_name: RwLock::new(by_name),
            name_by_forward: RwLock::new(name_by_forward),
            rendezvous: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn get_server(&self, name: &str) -> Option<Arc<VirtualServer>> {
        self.by_name.read().unwrap().get(name).cloned()
    }

    /// Whether any virtual server currently trusts this exact leaf.
    pub(crate) fn allows_client(&self, der: &[u8]) -> bool {
        let key = CertificateKey::of(der);
        self.by_name
            .read()
            .unwrap()
            .values()
            .any(|srv| matches!(srv.clients.get(&key), Some((_, cert)) if cert == der))
    }

    fn clients_stream_offset(&self) -> Result<i64, RelayError> {
        let value = self.config.get_or_default(
            &ConfigKey(CONFIG_CLIENTS_STREAM_OFFSET.into()),
            ConfigValue::default(),
        )?;
        Ok(value.int64.unwrap_or(OFFSET_OLDEST))
    }

    fn set_clients_stream_offset(&self, offset: i64) -> Result<(), RelayError> {
        self.config.put(
            ConfigKey(CONFIG_CLIENTS_STREAM_OFFSET.into()),
            ConfigValue {
                int64: Some(offset),
            },
        )?;
        Ok(())
    }

    /// Pull authorized-client changes from the control server, apply them to
    /// the `clients` log, and advance the durable watermark.
    async fn run_clients_stream(&self, conn: &quinn::Connection) -> Result<(), RelayError> {
        let (mut send, mut recv) = conn.open_bi().await?;

        loop {
            let offset = self.clients_stream_offset()?;
            write_message(&mut send, &ClientsReq { offset }).await?;

            let resp: ClientsResp = read_message(&mut recv).await?;

            // a response offset below the request means the control server
            // answered from a fresh log with a snapshot; entries it no
            // longer names are gone
            if resp.offset < offset && offset != OFFSET_OLDEST {
                let named: std::collections::HashSet<ClientKey> = resp
                    .changes
                    .iter()
                    .map(|change| ClientKey {
                        forward: change.forward.clone(),
                        role: change.role,
                        key: change.certificate_key,
                    })
                    .collect();
                let (existing, _) = self.clients.snapshot()?;
                for msg in existing {
                    if !named.contains(&msg.key) {
                        self.clients.del(msg.key)?;
                    }
                }
            }

            for change in resp.changes {
                let key = ClientKey {
                    forward: change.forward,
                    role: change.role,
                    key: change.certificate_key,
                };
                match (change.change, change.certificate) {
                    (ChangeType::Put, Some(certificate)) => {
                        self.clients.put(key, ClientValue { certificate })?;
                    }
                    (ChangeType::Del, _) => {
                        self.clients.del(key)?;
                    }
                    (ChangeType::Put, None) => {
                        return Err(RelayError::Protocol(Error::new(
                            ErrorCode::RelayInvalidCertificate,
                            "put change without certificate",
                        )));
                    }
                }
            }

            self.set_clients_stream_offset(resp.offset)?;
        }
    }

    /// Fold the `clients` log into the `servers` log: a forward's first
    /// client mints a virtual server (name and certificate), its last
    /// removal deletes it.
    async fn run_clients_log(&self, root: &Cert) -> Result<(), RelayError> {
        let mut offset = OFFSET_OLDEST;
        loop {
            let (msgs, next) = self.clients.consume(offset).await?;

            for msg in msgs {
                let srv_key = ServerKey {
                    forward: msg.key.forward.clone(),
                };
                let (mut value, existed) = match self.servers.get(&srv_key) {
                    Ok(value) => (value, true),
                    Err(connet_log::LogError::NotFound) => {
                        let name = gen_server_name("connet-relay");
                        let cert = root.new_server(CertOpts::domains([name.as_str()]))?;
                        let value = ServerValue {
                            name,
                            certificate: cert.der().to_vec(),
                            key: cert.private_key_pkcs8(),
                            clients: Vec::new(),
                        };
                        (value, false)
                    }
                    Err(err) => return Err(err.into()),
                };

                let before = value.clients.clone();
                let position = value.client_position(msg.key.role, &msg.key.key);
                match (msg.value, position) {
                    (Some(client), None) => value.clients.push(ServerClient {
                        role: msg.key.role,
                        certificate: client.certificate,
                    }),
                    (Some(client), Some(at)) => {
                        value.clients[at] = ServerClient {
                            role: msg.key.role,
                            certificate: client.certificate,
                        };
                    }
                    (None, Some(at)) => {
                        value.clients.remove(at);
                    }
                    (None, None) => {}
                }

                if value.clients.is_empty() {
                    if existed {
                        self.servers.del(srv_key)?;
                    }
                } else if value.clients != before {
                    self.servers.put(srv_key, value)?;
                }
            }

            offset = next;
        }
    }

    /// Materialize the `servers` log into the by-name map the data plane
    /// resolves SNI against.
    async fn run_servers_log(&self, provider: &CryptoProvider) -> Result<(), RelayError> {
        let mut offset = OFFSET_OLDEST;
        loop {
            let (msgs, next) = self.servers.consume(offset).await?;

            for msg in msgs {
                match msg.value {
                    Some(value) => {
                        let server = Arc::new(VirtualServer::from_value(
                            msg.key.forward.clone(),
                            &value,
                            provider,
                        )?);
                        self.name_by_forward
                            .write()
                            .unwrap()
                            .insert(msg.key.forward, value.name.clone());
                        self.by_name.write().unwrap().insert(value.name, server);
                    }
                    None => {
                        let name = self.name_by_forward.write().unwrap().remove(&msg.key.forward);
                        if let Some(name) = name {
                            self.by_name.write().unwrap().remove(&name);
                        }
                    }
                }
            }

            offset = next;
        }
    }

    /// Serve the control server's view of what this relay serves: it asks
    /// from its durable watermark, we answer with snapshot or deltas.
    async fn run_servers_stream(&self, conn: &quinn::Connection) -> Result<(), RelayError> {
        let (mut send, mut recv) = conn.accept_bi().await?;

        loop {
            let req: ServersReq = read_message(&mut recv).await?;

            // an offset past the end of the log means the consumer's view
            // is from a log we no longer have; converge from a snapshot
            let (msgs, next) = if req.offset == OFFSET_OLDEST || req.offset > self.servers.next_offset()
            {
                let snapshot = self.servers.snapshot()?;
                debug!(offset = snapshot.1, changes = snapshot.0.len(), "sending initial server changes");
                snapshot
            } else {
                let batch = self.servers.consume(req.offset).await?;
                debug!(offset = batch.1, changes = batch.0.len(), "sending delta server changes");
                batch
            };

            let changes = msgs
                .into_iter()
                .map(|msg| ServerChange {
                    forward: msg.key.forward,
                    change: if msg.value.is_some() {
                        ChangeType::Put
                    } else {
                        ChangeType::Del
                    },
                    server_certificate: msg.value.map(|v| v.certificate),
                })
                .collect();

            write_message(
                &mut send,
                &ServersResp {
                    changes,
                    offset: next,
                },
            )
            .await?;
        }
    }
}

/// The currently active control state, swapped when the relay moves to a
/// different control server. TLS callbacks read through this.
#[derive(Default)]
pub(crate) struct ActiveState {
    current: RwLock<Option<Arc<ControlState>>>,
}

impl ActiveState {
    pub(crate) fn get(&self) -> Option<Arc<ControlState>> {
        self.current.read().unwrap().clone()
    }

    fn set(&self, state: Arc<ControlState>) {
        *self.current.write().unwrap() = Some(state);
    }
}

pub(crate) struct ControlClient {
    pub hostport: HostPort,
    pub root: Cert,
    pub stores: Stores,
    pub control_addr: SocketAddr,
    pub control_host: String,
    pub control_cas: Option<Vec<CertificateDer<'static>>>,
    pub token: String,
    pub state: Arc<ActiveState>,
    pub provider: Arc<CryptoProvider>,
}

impl ControlClient {
    /// Dial, authenticate, and run sessions forever, reconnecting with
    /// bounded exponential backoff. The first dial's failure is fatal so a
    /// misconfigured relay fails fast.
    pub(crate) async fn run(&self, endpoint: quinn::Endpoint) -> Result<(), RelayError> {
        let (mut conn, mut server_id) = self.connect(&endpoint).await?;

        loop {
            if let Err(err) = self.run_connection(&conn, &server_id).await {
                warn!(err = %err, "control session ended");
            }
            (conn, server_id) = self.reconnect(&endpoint).await?;
        }
    }

    async fn connect(
        &self,
        endpoint: &quinn::Endpoint,
    ) -> Result<(quinn::Connection, String), RelayError> {
        debug!(addr = %self.control_addr, "dialing control server");
        let conn = endpoint
            .connect_with(
                self.client_config()?,
                self.control_addr,
                &self.control_host,
            )?
            .await?;

        let (mut send, mut recv) = conn.open_bi().await?;
        write_message(
            &mut send,
            &AuthenticateReq {
                token: self.token.clone(),
                addr: self.hostport.clone(),
            },
        )
        .await?;

        let resp: AuthenticateResp = read_message(&mut recv).await?;
        if let Some(err) = resp.error {
            return Err(RelayError::Protocol(err));
        }
        let server_id = resp.control_id.ok_or_else(|| {
            RelayError::Protocol(Error::new(ErrorCode::Unknown, "missing control id"))
        })?;

        info!(control = %self.control_addr, server_id, "connected to control server");
        Ok((conn, server_id))
    }

    async fn reconnect(
        &self,
        endpoint: &quinn::Endpoint,
    ) -> Result<(quinn::Connection, String), RelayError> {
        let mut delay = MIN_BACKOFF;
        loop {
            debug!(?delay, "backoff wait");
            tokio::time::sleep(delay).await;

            match self.connect(endpoint).await {
                Ok(connected) => return Ok(connected),
                Err(err) => debug!(err = %err, "reconnect failed, retrying"),
            }
            delay = next_backoff(delay);
        }
    }

    async fn run_connection(
        &self,
        conn: &quinn::Connection,
        server_id: &str,
    ) -> Result<(), RelayError> {
        let state = self.state_for(server_id)?;

        let result = tokio::try_join!(
            state.run_clients_stream(conn),
            state.run_clients_log(&self.root),
            state.run_servers_log(&self.provider),
            state.run_servers_stream(conn),
        );
        conn.close(0u32.into(), b"done");
        result.map(|_| ())
    }

    fn state_for(&self, server_id: &str) -> Result<Arc<ControlState>, RelayError> {
        if let Some(state) = self.state.get() {
            if state.id == server_id {
                info!(server_id, "same control server, resuming");
                return Ok(state);
            }
            info!(previous = %state.id, server_id, "new control server, replacing state");
        } else {
            info!(server_id, "loading control server state");
        }

        let state = Arc::new(ControlState::new(
            &self.stores,
            server_id.to_string(),
            &self.provider,
        )?);
        self.state.set(state.clone());
        Ok(state)
    }

    fn client_config(&self) -> Result<quinn::ClientConfig, RelayError> {
        let mut roots = RootCertStore::empty();
        match &self.control_cas {
            Some(cas) => {
                for ca in cas {
                    roots
                        .add(ca.clone())
                        .map_err(|err| RelayError::Tls(rustls::Error::General(err.to_string())))?;
                }
            }
            None => {
                for cert in rustls_native_certs::load_native_certs().certs {
                    let _ = roots.add(cert);
                }
            }
        }

        let mut tls = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3 is supported by the ring provider")
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![ALPN_RELAYS.to_vec()];

        let crypto = QuicClientConfig::try_from(tls)
            .map_err(|err| RelayError::Tls(rustls::Error::General(err.to_string())))?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE_PERIOD));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(dir: &std::path::Path) -> ControlState {
        let provider = rustls::crypto::ring::default_provider();
        ControlState::new(&Stores::new(dir), "connet-test".into(), &provider).unwrap()
    }

    fn server_value(root: &Cert, name: &str, clients: Vec<ServerClient>) -> ServerValue {
        let cert = root.new_server(CertOpts::domains([name])).unwrap();
        ServerValue {
            name: name.into(),
            certificate: cert.der().to_vec(),
            key: cert.private_key_pkcs8(),
            clients,
        }
    }

    #[test]
    fn test_virtual_server_from_value() {
        let provider = rustls::crypto::ring::default_provider();
        let root = Cert::new_root().unwrap();
        let client = root.new_client(Default::default()).unwrap();

        let value = server_value(
            &root,
            "connet-relay-test",
            vec![ServerClient {
                role: Role::Destination,
                certificate: client.der().to_vec(),
            }],
        );

        let server = VirtualServer::from_value(Forward::new("sws"), &value, &provider).unwrap();
        assert_eq!(server.name, "connet-relay-test");
        let (role, der) = server.clients.get(&client.certificate_key()).unwrap();
        assert_eq!(*role, Role::Destination);
        assert_eq!(der, &client.der().to_vec());
    }

    #[test]
    fn test_state_restores_servers_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let root = Cert::new_root().unwrap();
        let client = root.new_client(Default::default()).unwrap();

        {
            let state = state(dir.path());
            state
                .servers
                .put(
                    ServerKey {
                        forward: Forward::new("sws"),
                    },
                    server_value(
                        &root,
                        "connet-relay-sws",
                        vec![ServerClient {
                            role: Role::Source,
                            certificate: client.der().to_vec(),
                        }],
                    ),
                )
                .unwrap();
        }

        let state = state(dir.path());
        let server = state.get_server("connet-relay-sws").unwrap();
        assert_eq!(server.name, "connet-relay-sws");
        assert!(state.allows_client(&client.der()));
        assert!(!state.allows_client(&root.der()));
    }

    #[tokio::test]
    async fn test_clients_log_folds_into_servers() {
        let dir = tempfile::tempdir().unwrap();
        let root = Cert::new_root().unwrap();
        let client = root.new_client(Default::default()).unwrap();
        let state = Arc::new(state(dir.path()));

        let fold = state.clone();
        let fold_root = root.clone();
        tokio::spawn(async move { fold.run_clients_log(&fold_root).await });

        let key = ClientKey {
            forward: Forward::new("sws"),
            role: Role::Destination,
            key: client.certificate_key(),
        };
        state
            .clients
            .put(
                key.clone(),
                ClientValue {
                    certificate: client.der().to_vec(),
                },
            )
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let srv_key = ServerKey {
            forward: Forward::new("sws"),
        };
        let value = state.servers.get(&srv_key).unwrap();
        assert!(value.name.starts_with("connet-relay-"));
        assert_eq!(value.clients.len(), 1);

        // last client removed deletes the virtual server
        state.clients.del(key).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(state.servers.get(&srv_key).is_err());
    }
}
