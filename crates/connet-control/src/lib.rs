//! The control server: authenticates clients and relays, stores the
//! membership of every named forward in durable logs, and brokers peer
//! discovery between them.
//!
//! One QUIC listener serves two ALPNs: `connet` for clients and
//! `connet-relays` for relays. Each connection authenticates on its first
//! stream; afterwards clients run one full-duplex stream per forward and
//! relays run a pair of change streams. All durable state lives in five
//! keyed logs under the state directory: `config`, `clients`,
//! `relay-clients`, `relay-servers` and `relay-server-offsets`.

pub mod auth;
mod clients;
mod relays;

pub use auth::{
    ClientAuthentication, ClientAuthenticator, RelayAuthentication, RelayAuthenticator,
    StaticClientAuthenticator, StaticRelayAuthenticator,
};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use connet_core::model::gen_server_name;
use connet_log::{KvLog, LogError};
use connet_proto::{WireError, ALPN_CLIENT, ALPN_RELAYS};
use quinn::crypto::rustls::{HandshakeData, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use clients::ClientsServer;
use relays::RelaysServer;

/// Control server errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("log: {0}")]
    Log(#[from] LogError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// A typed protocol error to surface to the remote before closing.
    #[error(transparent)]
    Protocol(#[from] connet_proto::Error),
}

/// Control server configuration, a plain validated record.
pub struct Config {
    /// UDP address to listen on.
    pub addr: SocketAddr,
    /// TLS certificate chain presented to clients and relays.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key for `cert_chain`.
    pub key: PrivateKeyDer<'static>,
    pub client_auth: Arc<dyn ClientAuthenticator>,
    pub relay_auth: Arc<dyn RelayAuthenticator>,
    /// State directory; one keyed log per subdirectory.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
struct ConfigKey(String);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigValue {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    int64: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    string: Option<String>,
}

const CONFIG_SERVER_ID: &str = "server-id";

/// The control server. Create with [`Server::new`] (which binds the UDP
/// socket), drive with [`Server::run`]; dropping the run future stops
/// everything.
pub struct Server {
    endpoint: quinn::Endpoint,
    clients: Arc<ClientsServer>,
    relays: Arc<RelaysServer>,
}

impl Server {
    /// Open the durable logs under `cfg.dir` and materialize the in-memory
    /// indexes. The `server-id` is created and persisted on first start.
    pub fn new(cfg: Config) -> Result<Self, ControlError> {
        let config: KvLog<ConfigKey, ConfigValue> = KvLog::open(cfg.dir.join("config"))?;
        let server_id = config
            .get_or_init(ConfigKey(CONFIG_SERVER_ID.into()), |_| ConfigValue {
                string: Some(gen_server_name("connet")),
                ..Default::default()
            })?
            .string
            .unwrap_or_else(|| gen_server_name("connet"));

        let relays = Arc::new(RelaysServer::new(
            server_id,
            cfg.relay_auth,
            &cfg.dir,
        )?);
        let clients = Arc::new(ClientsServer::new(
            cfg.client_auth,
            relays.clone(),
            &cfg.dir,
        )?);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3 is supported by the ring provider")
            .with_no_client_auth()
            .with_single_cert(cfg.cert_chain, cfg.key)?;
        tls.alpn_protocols = vec![ALPN_CLIENT.to_vec(), ALPN_RELAYS.to_vec()];
        let crypto = Arc::new(
            QuicServerConfig::try_from(tls).map_err(|err| {
                ControlError::Io(std::io::Error::other(format!("quic tls: {err}")))
            })?,
        );

        let mut server_config = quinn::ServerConfig::with_crypto(crypto);
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(connet_core::net::KEEP_ALIVE_PERIOD));
        server_config.transport_config(Arc::new(transport));

        debug!(addr = %cfg.addr, "start quic listener");
        let endpoint = quinn::Endpoint::server(server_config, cfg.addr)?;

        Ok(Self {
            endpoint,
            clients,
            relays,
        })
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the listener and the index maintenance tasks until one fails.
    pub async fn run(&self) -> Result<(), ControlError> {
        tokio::try_join!(
            self.relays.run_forwards_index(),
            self.clients.run_clients_index(),
            self.run_listener(),
        )?;
        Ok(())
    }

    async fn run_listener(&self) -> Result<(), ControlError> {
        info!(addr = %self.endpoint.local_addr()?, "waiting for connections");
        while let Some(incoming) = self.endpoint.accept().await {
            let clients = self.clients.clone();
            let relays = self.relays.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(err = %err, "handshake failed");
                        return;
                    }
                };

                let protocol = conn
                    .handshake_data()
                    .and_then(|data| data.downcast::<HandshakeData>().ok())
                    .and_then(|data| data.protocol);
                info!(remote = %conn.remote_address(), proto = ?protocol.as_deref().map(String::from_utf8_lossy), "connection accepted");

                match protocol.as_deref() {
                    Some(p) if p == ALPN_CLIENT => clients.handle(conn).await,
                    Some(p) if p == ALPN_RELAYS => relays.handle(conn).await,
                    _ => conn.close(1u32.into(), b"unknown protocol"),
                }
            });
        }

        Ok(())
    }

    /// The stable identity of this control server instance.
    #[must_use]
    pub fn server_id(&self) -> &str {
        self.relays.id()
    }
}
