//! Durable relay state, kept per control server.
//!
//! A relay keys its stores by the control server's stable id: reconnecting
//! to the same control server resumes from the durable watermarks, while a
//! different control server gets a fresh directory.

use std::path::{Path, PathBuf};

use connet_cert::CertificateKey;
use connet_core::{Forward, Role};
use connet_log::{KvLog, LogError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct ConfigKey(pub String);

pub(crate) const CONFIG_CLIENTS_STREAM_OFFSET: &str = "clients-stream-offset";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ConfigValue {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub int64: Option<i64>,
}

/// A client certificate the control server authorized for a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct ClientKey {
    pub forward: Forward,
    pub role: Role,
    pub key: CertificateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClientValue {
    pub certificate: Vec<u8>,
}

/// One virtual server: a forward this relay terminates TLS for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct ServerKey {
    pub forward: Forward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServerClient {
    pub role: Role,
    pub certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServerValue {
    /// The SNI name clients dial this forward with.
    pub name: String,
    /// Virtual server certificate DER.
    pub certificate: Vec<u8>,
    /// Virtual server private key, PKCS#8 DER.
    pub key: Vec<u8>,
    /// Clients currently allowed to connect.
    pub clients: Vec<ServerClient>,
}

impl ServerValue {
    pub(crate) fn client_position(&self, role: Role, key: &CertificateKey) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| c.role == role && CertificateKey::of(&c.certificate) == *key)
    }
}

/// Opens the per-control-server logs.
pub(crate) struct Stores {
    dir: PathBuf,
}

impl Stores {
    pub(crate) fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub(crate) fn config(&self, sid: &str) -> Result<KvLog<ConfigKey, ConfigValue>, LogError> {
        KvLog::open(self.dir.join(sid).join("config"))
    }

    pub(crate) fn clients(&self, sid: &str) -> Result<KvLog<ClientKey, ClientValue>, LogError> {
        KvLog::open(self.dir.join(sid).join("clients"))
    }

    pub(crate) fn servers(&self, sid: &str) -> Result<KvLog<ServerKey, ServerValue>, LogError> {
        KvLog::open(self.dir.join(sid).join("servers"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stores_are_scoped_by_server_id() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path());

        let a = stores.config("server-a").unwrap();
        a.put(
            ConfigKey(CONFIG_CLIENTS_STREAM_OFFSET.into()),
            ConfigValue { int64: Some(7) },
        )
        .unwrap();

        let b = stores.config("server-b").unwrap();
        assert!(b.get(&ConfigKey(CONFIG_CLIENTS_STREAM_OFFSET.into())).is_err());

        let a2 = stores.config("server-a").unwrap();
        assert_eq!(
            a2.get(&ConfigKey(CONFIG_CLIENTS_STREAM_OFFSET.into()))
                .unwrap()
                .int64,
            Some(7)
        );
    }

    #[test]
    fn test_server_value_client_position() {
        let value = ServerValue {
            name: "connet-relay-abc".into(),
            certificate: vec![1],
            key: vec![2],
            clients: vec![
                ServerClient {
                    role: Role::Destination,
                    certificate: vec![10],
                },
                ServerClient {
                    role: Role::Source,
                    certificate: vec![11],
                },
            ],
        };

        let dst_key = CertificateKey::of(&[10]);
        assert_eq!(value.client_position(Role::Destination, &dst_key), Some(0));
        assert_eq!(value.client_position(Role::Source, &dst_key), None);
    }
}
