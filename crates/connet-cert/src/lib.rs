//! Ephemeral certificate material.
//!
//! Every participant mints an ed25519 root at startup and derives short-lived
//! leaf certificates from it: per-forward server certificates for accepting
//! direct QUIC, per-forward client certificates for dialing peers and relays,
//! and relay virtual server certificates. Nothing here is persisted as key
//! material; the certificates live as long as the advertisement that carries
//! them.
//!
//! A [`CertificateKey`] is the SHA-256 fingerprint of a certificate's DER
//! body. It is the stable identity of a peer across reconnects and appears as
//! a dictionary key in logs and on the wire; the DER itself always travels
//! alongside it, so the certificate is re-derivable from any record.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Certificate material errors.
#[derive(Debug, Error)]
pub enum CertError {
    /// Key or certificate generation failed
    #[error("certificate generation: {0}")]
    Generate(#[from] rcgen::Error),

    /// The DER body could not be parsed
    #[error("certificate parse: {0}")]
    Parse(String),

    /// Conversion into rustls key material failed
    #[error("key material: {0}")]
    KeyMaterial(String),
}

/// Options for issuing a certificate.
#[derive(Debug, Clone, Default)]
pub struct CertOpts {
    /// DNS names (or textual IP addresses) to carry as SANs.
    pub domains: Vec<String>,
}

impl CertOpts {
    pub fn domains(domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Copy)]
enum CertKind {
    Root,
    Intermediate,
    Server,
    Client,
}

/// A certificate and its private key.
///
/// Cheap to clone; the key pair is shared. A CA `Cert` issues children with
/// [`new_intermediate`](Cert::new_intermediate), [`new_server`](Cert::new_server)
/// and [`new_client`](Cert::new_client).
#[derive(Clone)]
pub struct Cert {
    cert: Arc<rcgen::Certificate>,
    key: Arc<KeyPair>,
}

impl fmt::Debug for Cert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cert")
            .field("key", &self.certificate_key())
            .finish_non_exhaustive()
    }
}

fn shared_subject() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::OrganizationName, "Connet");
    dn
}

fn base_params(opts: &CertOpts, kind: CertKind) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::new(opts.domains.clone())?;
    params.distinguished_name = shared_subject();

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    params.serial_number = Some(SerialNumber::from(micros));

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(1);
    params.not_after = now + time::Duration::days(90);

    match kind {
        CertKind::Root | CertKind::Intermediate => {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ];
        }
        CertKind::Server => {
            params.is_ca = IsCa::NoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
                KeyUsagePurpose::ContentCommitment,
            ];
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        }
        CertKind::Client => {
            params.is_ca = IsCa::NoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
                KeyUsagePurpose::ContentCommitment,
            ];
        }
    }

    Ok(params)
}

impl Cert {
    /// Mint a new self-signed ed25519 root, valid for 90 days.
    pub fn new_root() -> Result<Self, CertError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let params = base_params(&CertOpts::default(), CertKind::Root)?;
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert: Arc::new(cert),
            key: Arc::new(key),
        })
    }

    fn issue(&self, opts: CertOpts, kind: CertKind) -> Result<Self, CertError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let params = base_params(&opts, kind)?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(Self {
            cert: Arc::new(cert),
            key: Arc::new(key),
        })
    }

    /// Issue an intermediate CA.
    pub fn new_intermediate(&self, opts: CertOpts) -> Result<Self, CertError> {
        self.issue(opts, CertKind::Intermediate)
    }

    /// Issue a server leaf with the given SANs.
    pub fn new_server(&self, opts: CertOpts) -> Result<Self, CertError> {
        self.issue(opts, CertKind::Server)
    }

    /// Issue a client leaf.
    pub fn new_client(&self, opts: CertOpts) -> Result<Self, CertError> {
        self.issue(opts, CertKind::Client)
    }

    /// The certificate's DER body.
    #[must_use]
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// The stable fingerprint of this certificate.
    #[must_use]
    pub fn certificate_key(&self) -> CertificateKey {
        CertificateKey::of(self.cert.der())
    }

    /// The private key in PKCS#8 DER form.
    #[must_use]
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }

    /// The raw PKCS#8 DER bytes of the private key, for durable storage of
    /// certificates whose lifetime outlives the minting process state.
    #[must_use]
    pub fn private_key_pkcs8(&self) -> Vec<u8> {
        self.key.serialize_der()
    }

    /// This certificate as rustls key material, for presenting in handshakes.
    pub fn certified_key(&self, provider: &CryptoProvider) -> Result<CertifiedKey, CertError> {
        CertifiedKey::from_der(vec![self.der()], self.private_key_der(), provider)
            .map_err(|err| CertError::KeyMaterial(err.to_string()))
    }
}

/// The SHA-256 fingerprint of an X.509 DER body.
///
/// Deterministic, collision-resistant, and string-comparable via its
/// lowercase-hex rendering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateKey([u8; 32]);

impl CertificateKey {
    /// Fingerprint a DER body.
    #[must_use]
    pub fn of(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self(digest.into())
    }

    /// A short stable identifier derived from the fingerprint, used where a
    /// compact opaque id is enough (e.g. server-assigned peer ids).
    #[must_use]
    pub fn short_id(&self) -> String {
        let hex = self.to_string();
        hex[..16].to_string()
    }
}

impl fmt::Display for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateKey({self})")
    }
}

impl Serialize for CertificateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CertificateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != 64 {
            return Err(D::Error::custom("certificate key must be 64 hex chars"));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(D::Error::custom)?;
            bytes[i] = u8::from_str_radix(s, 16).map_err(D::Error::custom)?;
        }
        Ok(Self(bytes))
    }
}

/// DNS names carried in a certificate's subject alternative names.
///
/// Relay virtual server certificates carry their SNI name here; dialers
/// recover it from the DER that traveled through the control plane.
pub fn dns_names(der: &[u8]) -> Result<Vec<String>, CertError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| CertError::Parse(err.to_string()))?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                names.push((*dns).to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_leaves() {
        let root = Cert::new_root().unwrap();
        let server = root
            .new_server(CertOpts::domains(["connet-direct"]))
            .unwrap();
        let client = root.new_client(CertOpts::default()).unwrap();

        assert_ne!(server.certificate_key(), client.certificate_key());
        assert_ne!(root.certificate_key(), server.certificate_key());
    }

    #[test]
    fn test_certificate_key_deterministic() {
        let root = Cert::new_root().unwrap();
        let der = root.der();
        assert_eq!(CertificateKey::of(&der), CertificateKey::of(&der));

        let other = Cert::new_root().unwrap();
        assert_ne!(CertificateKey::of(&der), CertificateKey::of(&other.der()));
    }

    #[test]
    fn test_certificate_key_hex_roundtrip() {
        let key = CertificateKey::of(b"some der bytes");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json.len(), 66); // 64 hex chars in quotes
        let back: CertificateKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_certificate_key_rejects_bad_hex() {
        assert!(serde_json::from_str::<CertificateKey>("\"abc\"").is_err());
        let bad = format!("\"{}\"", "zz".repeat(32));
        assert!(serde_json::from_str::<CertificateKey>(&bad).is_err());
    }

    #[test]
    fn test_short_id() {
        let key = CertificateKey::of(b"peer");
        assert_eq!(key.short_id().len(), 16);
        assert!(key.to_string().starts_with(&key.short_id()));
    }

    #[test]
    fn test_dns_names() {
        let root = Cert::new_root().unwrap();
        let server = root
            .new_server(CertOpts::domains(["connet-relay-abc123"]))
            .unwrap();
        let names = dns_names(&server.der()).unwrap();
        assert_eq!(names, vec!["connet-relay-abc123".to_string()]);
    }

    #[test]
    fn test_certified_key_material() {
        let provider = rustls::crypto::ring::default_provider();
        let root = Cert::new_root().unwrap();
        let server = root
            .new_server(CertOpts::domains(["connet-direct"]))
            .unwrap();
        server.certified_key(&provider).unwrap();
    }
}
