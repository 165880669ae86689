//! The connet relay: a QUIC endpoint clients fall back to when direct
//! peer-to-peer connectivity fails.
//!
//! The relay learns what to serve from the control server (one virtual
//! server certificate per forward), terminates mTLS from both the source
//! and the destination of a forward, and splices their streams. Its durable
//! state is a set of keyed logs scoped by control server id, so reconnects
//! resume from the last acknowledged watermark.

mod control;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use connet_cert::{Cert, CertError};
use connet_core::net::KEEP_ALIVE_PERIOD;
use connet_core::HostPort;
use connet_log::LogError;
use connet_proto::{WireError, ALPN_DIRECT};
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::CertificateDer;
use thiserror::Error;

use control::{ActiveState, ControlClient};
use server::{CertResolver, ClientVerifier, DataServer};
use store::Stores;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("log: {0}")]
    Log(#[from] LogError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate: {0}")]
    Cert(#[from] CertError),

    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Protocol(#[from] connet_proto::Error),
}

/// Relay configuration, a plain validated record.
pub struct RelayConfig {
    /// Control server UDP address.
    pub control_addr: SocketAddr,
    /// Name the control server's certificate is verified against.
    pub control_host: String,
    /// Extra trust anchors for the control server; native roots when empty.
    pub control_cas: Option<Vec<CertificateDer<'static>>>,
    /// Relay authentication token.
    pub token: String,
    /// Public address clients dial this relay at.
    pub hostport: HostPort,
    /// UDP address the data plane binds.
    pub bind_addr: SocketAddr,
    /// Durable state directory.
    pub dir: PathBuf,
}

/// The relay process: one control session plus the data plane, sharing a
/// single QUIC endpoint.
pub struct Relay {
    control: ControlClient,
    data: DataServer,
    endpoint: quinn::Endpoint,
}

impl Relay {
    /// Mint the relay's root certificate and bind the shared endpoint.
    pub fn new(cfg: RelayConfig) -> Result<Self, RelayError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let root = Cert::new_root()?;
        let state = Arc::new(ActiveState::default());

        let mut tls = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3 is supported by the ring provider")
            .with_client_cert_verifier(Arc::new(ClientVerifier {
                state: state.clone(),
                provider: provider.clone(),
            }))
            .with_cert_resolver(Arc::new(CertResolver {
                state: state.clone(),
            }));
        tls.alpn_protocols = vec![ALPN_DIRECT.to_vec()];

        let crypto = Arc::new(QuicServerConfig::try_from(tls).map_err(|err| {
            RelayError::Tls(rustls::Error::General(err.to_string()))
        })?);

        let mut server_config = quinn::ServerConfig::with_crypto(crypto);
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE_PERIOD));
        server_config.transport_config(Arc::new(transport));
        let endpoint = quinn::Endpoint::server(server_config, cfg.bind_addr)?;

        // a zero port advertises whatever the socket actually bound
        let mut hostport = cfg.hostport;
        if hostport.port == 0 {
            hostport.port = endpoint.local_addr()?.port();
        }

        Ok(Self {
            control: ControlClient {
                hostport,
                root,
                stores: Stores::new(&cfg.dir),
                control_addr: cfg.control_addr,
                control_host: cfg.control_host,
                control_cas: cfg.control_cas,
                token: cfg.token,
                state: state.clone(),
                provider,
            },
            data: DataServer { state },
            endpoint,
        })
    }

    /// The bound UDP address of the data plane.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the data plane and the control session until one fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        tokio::try_join!(
            self.data.run(self.endpoint.clone()),
            self.control.run(self.endpoint.clone()),
        )?;
        Ok(())
    }
}
