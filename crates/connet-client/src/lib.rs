//! The connet client: authenticates to the control server, advertises its
//! destinations and sources, discovers peers, and moves bytes over direct
//! or relayed QUIC connections.
//!
//! One UDP socket backs everything: the control connection, the direct
//! endpoint accepting inbound peers, and all outbound peer and relay dials.

mod destination;
mod direct;
mod peer;
mod source;
mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use connet_cert::{Cert, CertError};
use connet_core::net::{local_addrs, next_backoff, MIN_BACKOFF};
use connet_core::{Forward, RouteOption};
use connet_proto::client::{Authenticate, AuthenticateResp};
use connet_proto::{read_message, write_message, WireError, ALPN_CLIENT};
use quinn::Connection;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use destination::Destination;
use direct::DirectServer;
use peer::Peer;
use source::Source;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate: {0}")]
    Cert(#[from] CertError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Protocol(#[from] connet_proto::Error),

    /// No active connection accepted a stream
    #[error("could not find route")]
    NoRoute,
}

/// One destination or source, as configured.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// TCP address: the dial target for destinations, the listen address
    /// for sources.
    pub addr: String,
    pub route: RouteOption,
}

/// Client configuration, a plain validated record.
pub struct ClientConfig {
    pub token: String,
    /// Control server UDP address.
    pub control_addr: SocketAddr,
    /// Name the control server's certificate is verified against.
    pub control_host: String,
    /// Extra trust anchors for the control server; native roots when empty.
    pub control_cas: Option<Vec<CertificateDer<'static>>>,
    /// Local UDP address for the shared QUIC socket.
    pub direct_addr: SocketAddr,
    pub destinations: HashMap<Forward, ForwardConfig>,
    pub sources: HashMap<Forward, ForwardConfig>,
}

/// The client process. Create with [`Client::new`], drive with
/// [`Client::run`]; dropping the run future stops everything.
pub struct Client {
    cfg: ClientConfig,
    intermediate: Cert,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl Client {
    /// Mint the process root and the intermediate every per-forward
    /// certificate is issued from. Neither outlives the process.
    pub fn new(cfg: ClientConfig) -> Result<Self, ClientError> {
        let root = Cert::new_root()?;
        let intermediate = root.new_intermediate(Default::default())?;
        debug!("generated root cert");
        Ok(Self {
            cfg,
            intermediate,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Bind the shared socket, start every forward, and keep a control
    /// session alive until a fatal error.
    pub async fn run(&self) -> Result<(), ClientError> {
        let direct = Arc::new(DirectServer::new(self.provider.clone()));

        let socket = std::net::UdpSocket::bind(self.cfg.direct_addr)?;
        let mut server_config = quinn::ServerConfig::with_crypto(direct.server_config()?);
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(connet_core::net::KEEP_ALIVE_PERIOD));
        server_config.transport_config(Arc::new(transport));

        let endpoint = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;

        let mut destinations = Vec::new();
        for (forward, fwd_cfg) in &self.cfg.destinations {
            let (peer, conns) = Peer::new(
                forward.clone(),
                fwd_cfg.route,
                &self.intermediate,
                direct.clone(),
                endpoint.clone(),
                self.provider.clone(),
            )?;
            destinations.push(Destination::new(
                forward.clone(),
                fwd_cfg.addr.clone(),
                fwd_cfg.route,
                peer,
                conns,
            ));
        }

        let mut sources = Vec::new();
        for (forward, fwd_cfg) in &self.cfg.sources {
            let (peer, conns) = Peer::new(
                forward.clone(),
                fwd_cfg.route,
                &self.intermediate,
                direct.clone(),
                endpoint.clone(),
                self.provider.clone(),
            )?;
            sources.push(Source::new(
                forward.clone(),
                fwd_cfg.addr.clone(),
                fwd_cfg.route,
                peer,
                conns,
            ));
        }

        let mut tasks: JoinSet<Result<(), ClientError>> = JoinSet::new();

        {
            let direct = direct.clone();
            let endpoint = endpoint.clone();
            tasks.spawn(async move { direct.run(endpoint).await });
        }
        for dst in &destinations {
            let dst = dst.clone();
            tasks.spawn(async move { dst.run().await });
        }
        for src in &sources {
            let src = src.clone();
            tasks.spawn(async move { src.run().await });
        }

        {
            let this = SessionRunner {
                token: self.cfg.token.clone(),
                control_addr: self.cfg.control_addr,
                control_host: self.cfg.control_host.clone(),
                control_cas: self.cfg.control_cas.clone(),
                provider: self.provider.clone(),
                endpoint: endpoint.clone(),
                destinations: destinations.clone(),
                sources: sources.clone(),
            };
            tasks.spawn(async move { this.run().await });
        }

        // error-group: the first failure aborts every sibling
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(ClientError::Io(std::io::Error::other(join_err))),
            }
        }
        Ok(())
    }
}

/// The control session: dial, authenticate, run per-forward streams, and
/// reconnect with bounded exponential backoff when the session drops.
struct SessionRunner {
    token: String,
    control_addr: SocketAddr,
    control_host: String,
    control_cas: Option<Vec<CertificateDer<'static>>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
    endpoint: quinn::Endpoint,
    destinations: Vec<Arc<Destination>>,
    sources: Vec<Arc<Source>>,
}

impl SessionRunner {
    async fn run(&self) -> Result<(), ClientError> {
        let (mut conn, mut token) = self.connect(None).await?;

        loop {
            if let Err(err) = self.run_connection(&conn).await {
                warn!(err = %err, "session ended");
            }
            (conn, token) = self.reconnect(token).await?;
        }
    }

    async fn connect(
        &self,
        reconnect_token: Option<Vec<u8>>,
    ) -> Result<(Connection, Option<Vec<u8>>), ClientError> {
        debug!(addr = %self.control_addr, "dialing control server");
        let config = tls::control_client_config(
            &self.provider,
            self.control_cas.as_deref(),
            ALPN_CLIENT,
        )?;
        let conn = self
            .endpoint
            .connect_with(config, self.control_addr, &self.control_host)?
            .await?;

        debug!(addr = %self.control_addr, "authenticating");
        let (mut send, mut recv) = conn.open_bi().await?;
        write_message(
            &mut send,
            &Authenticate {
                token: self.token.clone(),
                reconnect_token,
            },
        )
        .await?;

        let resp: AuthenticateResp = read_message(&mut recv).await?;
        if let Some(err) = resp.error {
            return Err(ClientError::Protocol(err));
        }

        // direct candidates: every local address plus the server's view of
        // us, all on the locally bound QUIC port
        let port = self.endpoint.local_addr()?.port();
        let mut addrs: Vec<SocketAddr> = local_addrs()?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if let Some(public) = resp.public_addr {
            if !addrs.contains(&public) {
                addrs.push(public);
            }
        }

        for dst in &self.destinations {
            dst.peer.set_direct_addrs(&addrs);
        }
        for src in &self.sources {
            src.peer.set_direct_addrs(&addrs);
        }

        info!(?addrs, "authenticated");
        Ok((conn, resp.reconnect_token))
    }

    async fn reconnect(
        &self,
        token: Option<Vec<u8>>,
    ) -> Result<(Connection, Option<Vec<u8>>), ClientError> {
        let mut delay = MIN_BACKOFF;
        loop {
            debug!(?delay, "backoff wait");
            tokio::time::sleep(delay).await;

            match self.connect(token.clone()).await {
                Ok((conn, new_token)) => return Ok((conn, new_token)),
                Err(err) => debug!(err = %err, "reconnect failed, retrying"),
            }
            delay = next_backoff(delay);
        }
    }

    async fn run_connection(&self, conn: &Connection) -> Result<(), ClientError> {
        let mut tasks: JoinSet<Result<(), ClientError>> = JoinSet::new();

        for dst in &self.destinations {
            let dst1 = dst.clone();
            let conn1 = conn.clone();
            tasks.spawn(async move { dst1.run_control(&conn1).await });
            let dst2 = dst.clone();
            let conn2 = conn.clone();
            tasks.spawn(async move { dst2.run_relay(&conn2).await });
        }
        for src in &self.sources {
            let src1 = src.clone();
            let conn1 = conn.clone();
            tasks.spawn(async move { src1.run_control(&conn1).await });
            let src2 = src.clone();
            let conn2 = conn.clone();
            tasks.spawn(async move { src2.run_relay(&conn2).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(ClientError::Io(std::io::Error::other(join_err))),
            }
        }
        Ok(())
    }
}
