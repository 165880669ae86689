//! The relay data plane: a QUIC endpoint terminating mTLS for every served
//! forward, multiplexed by SNI, splicing destination and source traffic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use connet_cert::CertificateKey;
use connet_core::net::join;
use connet_core::Role;
use quinn::crypto::rustls::HandshakeData;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::control::{ActiveState, VirtualServer};
use crate::RelayError;

/// Close code for connections no forward expects.
const CLOSE_CLIENT_NOT_FOUND: u32 = 2;

/// Per-forward matching of destination and source connections.
///
/// A destination connection parks under its certificate key until a source
/// claims it; a source either claims a parked destination or parks itself
/// on a one-shot channel a later destination completes.
#[derive(Default)]
pub(crate) struct Rendezvous {
    waiting_destinations: HashMap<CertificateKey, quinn::Connection>,
    waiting_sources: Vec<oneshot::Sender<quinn::Connection>>,
}

impl Rendezvous {
    /// A destination connection arrived: hand it to a waiting source, or
    /// park it (replacing a stale connection under the same key).
    pub(crate) fn offer_destination(
        &mut self,
        key: CertificateKey,
        mut conn: quinn::Connection,
    ) -> Option<quinn::Connection> {
        while let Some(tx) = self.waiting_sources.pop() {
            match tx.send(conn) {
                Ok(()) => return None,
                // the parked source gave up; try the next one
                Err(returned) => conn = returned,
            }
        }
        self.waiting_destinations.insert(key, conn)
    }

    /// A source connection arrived: claim any parked destination, or park.
    pub(crate) fn claim_destination(
        &mut self,
    ) -> Result<quinn::Connection, oneshot::Receiver<quinn::Connection>> {
        if let Some(key) = self.waiting_destinations.keys().next().copied() {
            return Ok(self.waiting_destinations.remove(&key).unwrap());
        }
        let (tx, rx) = oneshot::channel();
        self.waiting_sources.push(tx);
        Err(rx)
    }
}

/// Presents each virtual server's certificate by SNI.
pub(crate) struct CertResolver {
    pub state: Arc<ActiveState>,
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let name = hello.server_name()?;
        let state = self.state.get()?;
        let server = state.get_server(name)?;
        Some(server.certified.clone())
    }
}

/// Requires a client certificate and accepts exactly the leaves the control
/// server authorized for some served forward. Forward-level isolation is
/// enforced after the handshake, where the SNI is known.
pub(crate) struct ClientVerifier {
    pub state: Arc<ActiveState>,
    pub provider: Arc<CryptoProvider>,
}

impl fmt::Debug for ClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for ClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let allowed = self
            .state
            .get()
            .map(|state| state.allows_client(end_entity))
            .unwrap_or(false);
        if allowed {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::Tls12NotOffered,
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts data-plane connections and runs the rendezvous.
pub(crate) struct DataServer {
    pub state: Arc<ActiveState>,
}

impl DataServer {
    pub(crate) async fn run(&self, endpoint: quinn::Endpoint) -> Result<(), RelayError> {
        debug!("listening for data connections");
        while let Some(incoming) = endpoint.accept().await {
            let state = self.state.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!(err = %err, "data handshake failed");
                        return;
                    }
                };
                handle_conn(state, conn).await;
            });
        }
        Ok(())
    }
}

async fn handle_conn(state: Arc<ActiveState>, conn: quinn::Connection) {
    let Some(state) = state.get() else {
        conn.close(1u32.into(), b"server not found");
        return;
    };

    let server_name = conn
        .handshake_data()
        .and_then(|data| data.downcast::<HandshakeData>().ok())
        .and_then(|data| data.server_name);
    let Some(server) = server_name.as_deref().and_then(|name| state.get_server(name)) else {
        conn.close(1u32.into(), b"server not found");
        return;
    };

    let Some((role, key)) = authenticate(&server, &conn) else {
        conn.close(CLOSE_CLIENT_NOT_FOUND.into(), b"client not found");
        return;
    };
    debug!(forward = %server.forward, %role, cert = %key, "accepted data connection");

    match role {
        Role::Destination => {
            let replaced = state
                .rendezvous
                .lock()
                .unwrap()
                .entry(server.forward.clone())
                .or_default()
                .offer_destination(key, conn);
            if let Some(stale) = replaced {
                stale.close(CLOSE_CLIENT_NOT_FOUND.into(), b"client not found");
            }
        }
        Role::Source => {
            let claimed = state
                .rendezvous
                .lock()
                .unwrap()
                .entry(server.forward.clone())
                .or_default()
                .claim_destination();

            let destination = match claimed {
                Ok(destination) => destination,
                Err(rx) => {
                    // park until a destination arrives or the source goes away
                    tokio::select! {
                        conn = rx => match conn {
                            Ok(conn) => conn,
                            Err(_) => return,
                        },
                        _ = conn.closed() => return,
                    }
                }
            };

            run_pair(conn, destination).await;
        }
    }
}

/// Match the presented client leaf against the forward's allowed set.
fn authenticate(server: &VirtualServer, conn: &quinn::Connection) -> Option<(Role, CertificateKey)> {
    let identity = conn
        .peer_identity()?
        .downcast::<Vec<CertificateDer<'static>>>()
        .ok()?;
    let leaf = identity.first()?;

    let key = CertificateKey::of(leaf);
    match server.clients.get(&key) {
        Some((role, der)) if der.as_slice() == leaf.as_ref() => Some((*role, key)),
        _ => None,
    }
}

/// Splice a matched pair: every stream the source opens is mirrored by a
/// stream toward the destination and the bytes joined both ways.
async fn run_pair(source: quinn::Connection, destination: quinn::Connection) {
    loop {
        let (src_send, src_recv) = match source.accept_bi().await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(err = %err, "source connection ended");
                destination.close(0u32.into(), b"done");
                return;
            }
        };

        let destination = destination.clone();
        tokio::spawn(async move {
            let (dst_send, dst_recv) = match destination.open_bi().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(err = %err, "destination stream failed");
                    return;
                }
            };

            let mut source_side = tokio::io::join(src_recv, src_send);
            let mut destination_side = tokio::io::join(dst_recv, dst_send);
            match join(&mut source_side, &mut destination_side).await {
                Ok((up, down)) => debug!(up, down, "spliced stream ended"),
                Err(err) => debug!(err = %err, "spliced stream failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_parks_source_when_no_destination() {
        let mut rdv = Rendezvous::default();
        match rdv.claim_destination() {
            Ok(_) => panic!("no destination should be parked"),
            Err(_rx) => assert_eq!(rdv.waiting_sources.len(), 1),
        }
    }

    #[test]
    fn test_dropped_rendezvous_wakes_parked_sources_with_error() {
        let mut rdv = Rendezvous::default();
        let mut rx = match rdv.claim_destination() {
            Err(rx) => rx,
            Ok(_) => panic!("no destination should be parked"),
        };
        drop(rdv);
        assert!(rx.try_recv().is_err());
    }
}
