//! A source: a local TCP listener proxying into a named remote destination.

use std::sync::Arc;

use connet_core::{Forward, RouteOption};
use connet_proto::client::{Request, Response};
use connet_proto::{data, read_message, write_message, Error, ErrorCode};
use quinn::Connection;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::peer::Peer;
use crate::ClientError;

pub(crate) struct Source {
    forward: Forward,
    /// TCP address to listen on.
    addr: String,
    route: RouteOption,
    pub(crate) peer: Arc<Peer>,
    conns: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Connection>>>,
}

impl Source {
    pub(crate) fn new(
        forward: Forward,
        addr: String,
        route: RouteOption,
        peer: Arc<Peer>,
        conns: mpsc::UnboundedReceiver<Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            forward,
            addr,
            route,
            peer,
            conns: std::sync::Mutex::new(Some(conns)),
        })
    }

    /// Run the peer model and the TCP accept loop.
    pub(crate) async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        let conns = self
            .conns
            .lock()
            .unwrap()
            .take()
            .expect("source run started twice");

        tokio::try_join!(self.peer.run(), self.run_server(), drain(conns))?;
        Ok(())
    }

    async fn run_server(self: &Arc<Self>) -> Result<(), ClientError> {
        // a bare `:port` listens on every interface
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        debug!(forward = %self.forward, %addr, "starting server");
        let listener = TcpListener::bind(&addr).await?;

        info!(forward = %self.forward, addr = %self.addr, "listening for conns");
        loop {
            let (tcp, remote) = listener.accept().await?;
            debug!(forward = %self.forward, %remote, "received conn");

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.run_conn(tcp).await {
                    warn!(forward = %this.forward, %remote, err = %err, "error handling conn");
                }
            });
        }
    }

    /// Proxy one inbound TCP connection over the first active route that
    /// accepts a stream.
    async fn run_conn(&self, mut tcp: TcpStream) -> Result<(), ClientError> {
        let (mut send, mut recv) = self.find_stream().await?;

        write_message(
            &mut send,
            &data::Request::Connect {
                to: self.forward.clone(),
            },
        )
        .await?;
        data::read_response(&mut recv).await?;

        debug!(forward = %self.forward, "joining to destination");
        let mut stream = tokio::io::join(recv, send);
        let result = connet_core::net::join(&mut tcp, &mut stream).await;
        debug!(forward = %self.forward, ok = result.is_ok(), "disconnected from destination");
        Ok(())
    }

    async fn find_stream(
        &self,
    ) -> Result<(quinn::SendStream, quinn::RecvStream), ClientError> {
        for conn in self.peer.get_active() {
            match conn.open_bi().await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(forward = %self.forward, err = %err, "connection not usable");
                }
            }
        }
        warn!(forward = %self.forward, "could not find route");
        Err(ClientError::NoRoute)
    }

    /// Publish the self descriptor upward and consume matching destinations.
    pub(crate) async fn run_control(&self, conn: &Connection) -> Result<(), ClientError> {
        let (mut send, mut recv) = conn.open_bi().await?;
        let forward = self.forward.clone();

        let writer = async {
            let mut rx = self.peer.self_descriptor().subscribe();
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(peer) = current {
                    debug!(
                        forward = %forward,
                        direct = peer.direct.as_ref().map(|d| d.addresses.len()).unwrap_or(0),
                        relays = peer.relays.len(),
                        "updated source"
                    );
                    write_message(
                        &mut send,
                        &Request::Source {
                            to: forward.clone(),
                            peer,
                        },
                    )
                    .await?;
                }
                if rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        };

        let reader = async {
            loop {
                let resp: Response = read_message(&mut recv).await?;
                match resp {
                    Response::Source { destinations } => self.peer.set_peers(destinations),
                    Response::Error(err) => return Err(ClientError::Protocol(err)),
                    _ => {
                        return Err(ClientError::Protocol(Error::new(
                            ErrorCode::RequestUnknown,
                            "unexpected response on source stream",
                        )))
                    }
                }
            }
        };

        tokio::select! {
            res = writer => res,
            res = reader => res,
        }
    }

    /// Subscribe to relays for this forward and feed them to the peer model.
    pub(crate) async fn run_relay(&self, conn: &Connection) -> Result<(), ClientError> {
        if !self.route.allow_relay() {
            return Ok(());
        }

        let (mut send, mut recv) = conn.open_bi().await?;
        write_message(
            &mut send,
            &Request::SourceRelay {
                to: self.forward.clone(),
                certificate: self.peer.client_cert.der().to_vec(),
            },
        )
        .await?;

        loop {
            let resp: Response = read_message(&mut recv).await?;
            match resp {
                Response::Relays { relays } => self.peer.set_relays(relays),
                Response::Error(err) => {
                    warn!(forward = %self.forward, err = %err, "relay stream failed");
                    return Err(ClientError::Protocol(err));
                }
                _ => {
                    return Err(ClientError::Protocol(Error::new(
                        ErrorCode::RequestUnknown,
                        "unexpected response on relay stream",
                    )))
                }
            }
        }
    }
}

/// Sources do not serve streams on peer connections; the events only need
/// to be consumed so the channel does not accumulate.
async fn drain(mut conns: mpsc::UnboundedReceiver<Connection>) -> Result<(), ClientError> {
    while conns.recv().await.is_some() {}
    Ok(())
}
