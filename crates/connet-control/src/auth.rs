//! Token authentication for clients and relays.
//!
//! The control server only sees opaque tokens; what a token may do is
//! decided by these traits. The static implementations accept a fixed token
//! set and allow everything, which is what a self-hosted deployment wants;
//! multi-tenant deployments implement the traits themselves (e.g. rewriting
//! forwards into a tenant namespace in `validate`).

use std::collections::HashSet;
use std::sync::Arc;

use connet_core::{Forward, Role};
use connet_proto::{Error, ErrorCode};

/// Authenticates client tokens.
pub trait ClientAuthenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> Result<Arc<dyn ClientAuthentication>, Error>;
}

/// What an authenticated client may do.
pub trait ClientAuthentication: Send + Sync {
    /// Validate (and possibly rewrite) a forward the client wants to use.
    fn validate(&self, forward: &Forward, role: Role) -> Result<Forward, Error>;
}

/// Authenticates relay tokens.
pub trait RelayAuthenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> Result<Arc<dyn RelayAuthentication>, Error>;
}

/// What an authenticated relay may serve.
pub trait RelayAuthentication: Send + Sync {
    fn allow(&self, forward: &Forward) -> bool;
}

/// Token-set client authenticator; every known token may use any forward.
pub struct StaticClientAuthenticator {
    tokens: HashSet<String>,
}

impl StaticClientAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl ClientAuthenticator for StaticClientAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Arc<dyn ClientAuthentication>, Error> {
        if self.tokens.contains(token) {
            Ok(Arc::new(StaticClientAuthentication))
        } else {
            Err(Error::new(
                ErrorCode::AuthenticationFailed,
                "invalid or unknown token",
            ))
        }
    }
}

struct StaticClientAuthentication;

impl ClientAuthentication for StaticClientAuthentication {
    fn validate(&self, forward: &Forward, _role: Role) -> Result<Forward, Error> {
        Ok(forward.clone())
    }
}

/// Token-set relay authenticator; every known token may serve any forward.
pub struct StaticRelayAuthenticator {
    tokens: HashSet<String>,
}

impl StaticRelayAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl RelayAuthenticator for StaticRelayAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Arc<dyn RelayAuthentication>, Error> {
        if self.tokens.contains(token) {
            Ok(Arc::new(StaticRelayAuthentication))
        } else {
            Err(Error::new(
                ErrorCode::AuthenticationFailed,
                "invalid or unknown token",
            ))
        }
    }
}

struct StaticRelayAuthentication;

impl RelayAuthentication for StaticRelayAuthentication {
    fn allow(&self, _forward: &Forward) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tokens() {
        let auth = StaticClientAuthenticator::new(["alpha", "beta"]);
        assert!(auth.authenticate("alpha").is_ok());
        assert!(auth.authenticate("beta").is_ok());

        let err = match auth.authenticate("gamma") {
            Err(err) => err,
            Ok(_) => panic!("expected authentication to fail"),
        };
        assert_eq!(err.code, ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn test_client_validate_passes_forward_through() {
        let auth = StaticClientAuthenticator::new(["alpha"]);
        let authn = auth.authenticate("alpha").unwrap();
        let fwd = Forward::new("team/sws");
        assert_eq!(authn.validate(&fwd, Role::Destination).unwrap(), fwd);
    }

    #[test]
    fn test_relay_tokens_allow_everything() {
        let auth = StaticRelayAuthenticator::new(["relay-1"]);
        let authn = auth.authenticate("relay-1").unwrap();
        assert!(authn.allow(&Forward::new("sws")));
        assert!(auth.authenticate("other").is_err());
    }
}
