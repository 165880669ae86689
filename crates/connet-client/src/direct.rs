//! The client's direct endpoint: accepts inbound peer-to-peer QUIC.
//!
//! Each forward registers a virtual server keyed by the fingerprint of its
//! per-forward server certificate; dialing peers send that fingerprint as
//! SNI (they verify the pinned leaf, so the name carries routing, not
//! trust). The set of client certificates a virtual server accepts is the
//! forward's current remote peers, replaced wholesale on every peers
//! update.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use connet_cert::{Cert, CertificateKey};
use connet_proto::ALPN_DIRECT;
use quinn::crypto::rustls::{HandshakeData, QuicServerConfig};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ClientError;

/// Close code for connections no peer expects.
const CLOSE_CLIENT_NOT_FOUND: u32 = 2;

struct VServer {
    certified: Arc<CertifiedKey>,
    /// Allowed peer client certificates, fingerprint to DER. Replaced
    /// wholesale; no reader observes a partial set.
    allowed: RwLock<Arc<HashMap<CertificateKey, Vec<u8>>>>,
    incoming: mpsc::UnboundedSender<(CertificateKey, quinn::Connection)>,
}

#[derive(Default)]
struct DirectState {
    servers: RwLock<HashMap<String, Arc<VServer>>>,
}

impl DirectState {
    fn get(&self, name: &str) -> Option<Arc<VServer>> {
        self.servers.read().unwrap().get(name).cloned()
    }

    fn allows_client(&self, der: &[u8]) -> bool {
        let key = CertificateKey::of(der);
        self.servers
            .read()
            .unwrap()
            .values()
            .any(|srv| matches!(srv.allowed.read().unwrap().get(&key), Some(cert) if cert == der))
    }
}

/// The shared direct endpoint of one client process.
pub(crate) struct DirectServer {
    provider: Arc<CryptoProvider>,
    state: Arc<DirectState>,
}

impl DirectServer {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self {
            provider,
            state: Arc::new(DirectState::default()),
        }
    }

    /// TLS config for the shared endpoint; SNI picks the virtual server.
    pub(crate) fn server_config(&self) -> Result<Arc<QuicServerConfig>, ClientError> {
        let mut tls = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3 is supported by the ring provider")
            .with_client_cert_verifier(Arc::new(DirectClientVerifier {
                state: self.state.clone(),
                provider: self.provider.clone(),
            }))
            .with_cert_resolver(Arc::new(DirectCertResolver {
                state: self.state.clone(),
            }));
        tls.alpn_protocols = vec![ALPN_DIRECT.to_vec()];

        Ok(Arc::new(QuicServerConfig::try_from(tls).map_err(
            |err| ClientError::Tls(rustls::Error::General(err.to_string())),
        )?))
    }

    /// Register a forward's virtual server. Accepted connections arrive on
    /// the returned channel tagged with the dialer's certificate key.
    ///
    /// The SNI name is the short id of the server certificate's fingerprint
    /// (a full fingerprint would not fit in a DNS label).
    pub(crate) fn add_server(
        &self,
        cert: &Cert,
    ) -> Result<mpsc::UnboundedReceiver<(CertificateKey, quinn::Connection)>, ClientError> {
        let name = cert.certificate_key().short_id();
        let certified = Arc::new(cert.certified_key(&self.provider)?);
        let (tx, rx) = mpsc::unbounded_channel();

        debug!(server = %name, "add direct server");
        self.state.servers.write().unwrap().insert(
            name,
            Arc::new(VServer {
                certified,
                allowed: RwLock::new(Arc::new(HashMap::new())),
                incoming: tx,
            }),
        );
        Ok(rx)
    }

    /// Replace the allowed client set of a forward's virtual server.
    pub(crate) fn set_allowed(
        &self,
        server: &CertificateKey,
        allowed: HashMap<CertificateKey, Vec<u8>>,
    ) {
        if let Some(srv) = self.state.get(&server.short_id()) {
            *srv.allowed.write().unwrap() = Arc::new(allowed);
        }
    }

    /// Accept loop over the shared endpoint.
    pub(crate) async fn run(&self, endpoint: quinn::Endpoint) -> Result<(), ClientError> {
        debug!("listening for direct connections");
        while let Some(incoming) = endpoint.accept().await {
            let state = self.state.clone();
            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!(err = %err, "direct handshake failed");
                        return;
                    }
                };
                accept_conn(&state, conn);
            });
        }
        Ok(())
    }
}

fn accept_conn(state: &DirectState, conn: quinn::Connection) {
    let server_name = conn
        .handshake_data()
        .and_then(|data| data.downcast::<HandshakeData>().ok())
        .and_then(|data| data.server_name);
    let Some(server) = server_name.as_deref().and_then(|name| state.get(name)) else {
        conn.close(1u32.into(), b"server not found");
        return;
    };

    let leaf = conn
        .peer_identity()
        .and_then(|id| id.downcast::<Vec<CertificateDer<'static>>>().ok())
        .and_then(|certs| certs.first().map(|c| c.as_ref().to_vec()));
    let Some(leaf) = leaf else {
        conn.close(CLOSE_CLIENT_NOT_FOUND.into(), b"client not found");
        return;
    };

    let key = CertificateKey::of(&leaf);
    let expected = matches!(
        server.allowed.read().unwrap().get(&key),
        Some(der) if *der == leaf
    );
    if !expected {
        conn.close(CLOSE_CLIENT_NOT_FOUND.into(), b"client not found");
        return;
    }

    debug!(cert = %key, remote = %conn.remote_address(), "accepted direct connection");
    if server.incoming.send((key, conn)).is_err() {
        // the forward is gone; nothing expects connections anymore
    }
}

struct DirectCertResolver {
    state: Arc<DirectState>,
}

impl fmt::Debug for DirectCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for DirectCertResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = hello.server_name()?;
        Some(self.state.get(name)?.certified.clone())
    }
}

struct DirectClientVerifier {
    state: Arc<DirectState>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for DirectClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectClientVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for DirectClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.state.allows_client(end_entity) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_set_is_swapped_wholesale() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = DirectServer::new(provider);

        let root = Cert::new_root().unwrap();
        let server_cert = root
            .new_server(connet_cert::CertOpts::domains(["connet-direct"]))
            .unwrap();
        let peer_a = root.new_client(Default::default()).unwrap();
        let peer_b = root.new_client(Default::default()).unwrap();

        let _rx = server.add_server(&server_cert).unwrap();
        let name = server_cert.certificate_key();

        let mut allowed = HashMap::new();
        allowed.insert(peer_a.certificate_key(), peer_a.der().to_vec());
        server.set_allowed(&name, allowed);
        assert!(server.state.allows_client(&peer_a.der()));
        assert!(!server.state.allows_client(&peer_b.der()));

        let mut allowed = HashMap::new();
        allowed.insert(peer_b.certificate_key(), peer_b.der().to_vec());
        server.set_allowed(&name, allowed);
        assert!(!server.state.allows_client(&peer_a.der()));
        assert!(server.state.allows_client(&peer_b.der()));
    }

    #[test]
    fn test_unknown_server_name() {
        let state = DirectState::default();
        assert!(state.get("missing").is_none());
        assert!(!state.allows_client(b"whatever"));
    }
}
