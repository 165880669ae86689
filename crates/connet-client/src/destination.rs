//! A destination: a locally reachable TCP service exposed under a forward.

use std::sync::{Arc, Mutex};

use connet_core::{Forward, RouteOption};
use connet_proto::client::{Request, Response};
use connet_proto::{data, read_message, write_message, Error, ErrorCode};
use quinn::Connection;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::peer::Peer;
use crate::ClientError;

pub(crate) struct Destination {
    forward: Forward,
    /// TCP address proxied streams are dialed to.
    addr: String,
    route: RouteOption,
    pub(crate) peer: Arc<Peer>,
    conns: Mutex<Option<mpsc::UnboundedReceiver<Connection>>>,
}

impl Destination {
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
            conns: Mutex::new(Some(conns)),
        })
    }

    /// Run the peer model and serve streams on every active connection.
    pub(crate) async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        let conns = self
            .conns
            .lock()
            .unwrap()
            .take()
            .expect("destination run started twice");

        tokio::try_join!(self.peer.run(), self.serve_conns(conns))?;
        Ok(())
    }

    async fn serve_conns(
        self: &Arc<Self>,
        mut conns: mpsc::UnboundedReceiver<Connection>,
    ) -> Result<(), ClientError> {
        while let Some(conn) = conns.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.serve_conn(conn).await });
        }
        Ok(())
    }

    async fn serve_conn(self: Arc<Self>, conn: Connection) {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(forward = %self.forward, err = %err, "peer connection ended");
                    return;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.serve_stream(send, recv).await {
                    debug!(forward = %this.forward, err = %err, "stream ended");
                }
            });
        }
    }

    /// Serve one proxied stream: check the forward, dial the TCP target,
    /// acknowledge, splice.
    async fn serve_stream(
        &self,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<(), ClientError> {
        let req: data::Request = read_message(&mut recv).await?;
        let data::Request::Connect { to } = req;

        if to != self.forward {
            let err = Error::new(
                ErrorCode::DestinationNotFound,
                format!("{to} not found on this client"),
            );
            write_message(&mut send, &data::Response::err(err.clone())).await?;
            return Err(ClientError::Protocol(err));
        }

        let mut tcp = match TcpStream::connect(&self.addr).await {
            Ok(tcp) => tcp,
            Err(dial_err) => {
                let err = Error::new(
                    ErrorCode::DestinationDialFailed,
                    format!("{to} could not be dialed: {dial_err}"),
                );
                write_message(&mut send, &data::Response::err(err.clone())).await?;
                return Err(ClientError::Protocol(err));
            }
        };

        write_message(&mut send, &data::Response::ok()).await?;

        debug!(forward = %self.forward, "joining to target");
        let mut stream = tokio::io::join(recv, send);
        let result = connet_core::net::join(&mut stream, &mut tcp).await;
        debug!(forward = %self.forward, ok = result.is_ok(), "disconnected from target");
        Ok(())
    }

    /// Publish the self descriptor upward and consume matching sources.
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
                        "updated destination"
                    );
                    write_message(
                        &mut send,
                        &Request::Destination {
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
                    Response::Destination { sources } => self.peer.set_peers(sources),
                    Response::Error(err) => return Err(ClientError::Protocol(err)),
                    _ => {
                        return Err(ClientError::Protocol(Error::new(
                            ErrorCode::RequestUnknown,
                            "unexpected response on destination stream",
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
            &Request::DestinationRelay {
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
