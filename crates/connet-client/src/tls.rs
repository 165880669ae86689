//! Client-side TLS plumbing: pinned-leaf verification for peer and relay
//! dials, root-based verification for the control connection, and the
//! resolver that presents the per-forward client certificate.

use std::fmt;
use std::sync::Arc;

use connet_cert::Cert;
use connet_core::net::KEEP_ALIVE_PERIOD;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::ClientError;

/// Accepts exactly one expected leaf certificate, by DER equality. The peer
/// advertised this certificate through the control plane; nothing else may
/// stand in for it.
struct PinnedServerVerifier {
    expected: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for PinnedServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedServerVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
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

/// Always presents the per-forward client certificate.
struct ClientCertPresenter {
    certified: Arc<CertifiedKey>,
}

impl fmt::Debug for ClientCertPresenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertPresenter").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for ClientCertPresenter {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

fn into_quinn(tls: rustls::ClientConfig) -> Result<quinn::ClientConfig, ClientError> {
    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|err| ClientError::Tls(rustls::Error::General(err.to_string())))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_PERIOD));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Config for dialing a peer or relay: pin the advertised leaf, present the
/// per-forward client certificate, speak the data-plane ALPN.
pub(crate) fn pinned_client_config(
    provider: &Arc<CryptoProvider>,
    expected: Vec<u8>,
    client_cert: &Cert,
    alpn: &[u8],
) -> Result<quinn::ClientConfig, ClientError> {
    let certified = Arc::new(client_cert.certified_key(provider)?);

    let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS 1.3 is supported by the ring provider")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
            expected,
            provider: provider.clone(),
        }))
        .with_client_cert_resolver(Arc::new(ClientCertPresenter { certified }));
    tls.alpn_protocols = vec![alpn.to_vec()];

    into_quinn(tls)
}

/// Config for dialing the control server: root-based verification, no
/// client certificate.
pub(crate) fn control_client_config(
    provider: &Arc<CryptoProvider>,
    cas: Option<&[CertificateDer<'static>]>,
    alpn: &[u8],
) -> Result<quinn::ClientConfig, ClientError> {
    let mut roots = RootCertStore::empty();
    match cas {
        Some(cas) => {
            for ca in cas {
                roots
                    .add(ca.clone())
                    .map_err(|err| ClientError::Tls(rustls::Error::General(err.to_string())))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = roots.add(cert);
            }
        }
    }

    let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS 1.3 is supported by the ring provider")
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![alpn.to_vec()];

    into_quinn(tls)
}
