//! Credentials and the authentication boundary.
//!
//! Per the design's scope section, the mechanics of a SCRAM/x509/etc.
//! handshake are an external collaborator; this crate owns only the
//! credential value type and the cache-reconciliation policy in
//! [`crate::client`].

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::socket::Socket;

/// An opaque authentication credential. Equality is structural across all
/// fields, matching the design's data model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub mechanism: String,
    pub source: String,
    pub username: String,
    pub secret: String,
    pub extras: Vec<(String, String)>,
}

impl Credential {
    pub fn new(
        mechanism: impl Into<String>,
        source: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Credential {
        Credential {
            mechanism: mechanism.into(),
            source: source.into(),
            username: username.into(),
            secret: secret.into(),
            extras: Vec::new(),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.username, self.source, self.mechanism)
    }
}

/// The authentication helper this crate invokes but does not implement.
/// A real implementation runs the mechanism-specific handshake (SCRAM-SHA-1,
/// SCRAM-SHA-256, x.509, ...) over the given socket.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &Credential, socket: &mut Socket) -> Result<()>;

    /// Issue a `{logout: 1}` against the credential's source database.
    async fn logout(&self, credential: &Credential, socket: &mut Socket) -> Result<()>;
}

/// An [`Authenticator`] that accepts every credential without talking to a
/// server. Useful for tests and for deployments that authenticate some
/// other way (e.g. at the transport layer).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate(&self, _credential: &Credential, _socket: &mut Socket) -> Result<()> {
        Ok(())
    }

    async fn logout(&self, _credential: &Credential, _socket: &mut Socket) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_equality_is_structural() {
        let a = Credential::new("SCRAM-SHA-1", "admin", "alice", "secret");
        let b = Credential::new("SCRAM-SHA-1", "admin", "alice", "secret");
        let c = Credential::new("SCRAM-SHA-1", "admin", "alice", "different");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
