//! Component E: the client front-end.
//!
//! Grounded on `pymongo.mongo_client.MongoClient`: single-flight topology
//! resolution (`__ensure_member`), the credential cache reconciled against a
//! socket's `authset` on every checkout (`__check_auth`), BSON size
//! enforcement before any I/O (`__check_bson_size`), and `not master`
//! detection triggering a full disconnect (`__check_response_to_last_error`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{Authenticator, Credential};
use crate::caller::CallerId;
use crate::error::{Error, Result};
use crate::member::Member;
use crate::options::ClientOptions;
use crate::pool::PooledSocket;
use crate::resolver::{Resolver, ResolverConfig};
use crate::socket::Address;
use crate::wire::{CommandOutcome, MessageCodec, OutboundMessage, OP_REPLY};

/// A MongoDB-compatible deployment handle: resolves and caches a [`Member`]
/// to talk to, reconnecting on demand after a `disconnect`.
///
/// Single-flight resolution is implemented with a `tokio::sync::Mutex`
/// guarding the actual resolve call plus a double-checked read of the cached
/// member, rather than the `watch`-channel broadcast sketched early on: the
/// broadcast approach has no natural way to tell "no resolution has started
/// yet" apart from "a resolution finished with no member", which made
/// waiters racy. The mutex version is the same single-flight guarantee
/// (every concurrent caller either resolves or waits on the one resolve in
/// flight) with none of that ambiguity. See DESIGN.md.
pub struct Client {
    options: ClientOptions,
    codec: Arc<dyn MessageCodec>,
    authenticator: Arc<dyn Authenticator>,
    resolver: Resolver,
    direct: bool,
    seeds: Mutex<Vec<Address>>,
    /// The router (mongos) node set from the last successful resolution that
    /// found one, kept sticky across re-resolutions per §4.D step 4.
    known_routers: Mutex<HashSet<Address>>,
    member: Mutex<Option<Member>>,
    resolving: tokio::sync::Mutex<()>,
    credentials: Mutex<HashMap<String, Credential>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        seeds: Vec<Address>,
        options: ClientOptions,
        codec: Arc<dyn MessageCodec>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Client> {
        if seeds.is_empty() {
            return Err(Error::Configuration(
                "need to specify at least one host".to_string(),
            ));
        }
        let direct = seeds.len() == 1;
        Ok(Client {
            options,
            resolver: Resolver::new(codec.clone()),
            codec,
            authenticator,
            direct,
            seeds: Mutex::new(seeds),
            known_routers: Mutex::new(HashSet::new()),
            member: Mutex::new(None),
            resolving: tokio::sync::Mutex::new(()),
            credentials: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The cached member, if this client is currently connected, without
    /// triggering resolution.
    pub fn cached_member(&self) -> Option<Member> {
        self.member.lock().unwrap().clone()
    }

    fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            pool_options: self.options.pool.clone(),
            replica_set_name: self.options.replica_set_name.clone(),
            direct: self.direct,
            latency_threshold: Duration::from_millis(15),
        }
    }

    /// Resolve (or return the cached) member to talk to. Concurrent callers
    /// during an in-flight resolution wait for it rather than each starting
    /// their own, per §4.E.
    pub async fn ensure_member(&self) -> Result<Member> {
        if let Some(member) = self.cached_member() {
            return Ok(member);
        }

        let _guard = self.resolving.lock().await;
        if let Some(member) = self.cached_member() {
            return Ok(member);
        }

        let seeds = self.seeds.lock().unwrap().clone();
        let known_routers = self.known_routers.lock().unwrap().clone();
        let (member, nodes) = self
            .resolver
            .resolve(&seeds, &self.resolver_config(), &known_routers)
            .await?;
        if !nodes.is_empty() {
            *self.seeds.lock().unwrap() = nodes.iter().cloned().collect();
            if member.is_router() {
                *self.known_routers.lock().unwrap() = nodes;
            }
        }
        *self.member.lock().unwrap() = Some(member.clone());
        Ok(member)
    }

    /// Drop the cached member and reset its pool, closing sockets promptly.
    /// The next operation re-resolves from scratch.
    pub fn disconnect(&self) {
        let member = self.member.lock().unwrap().take();
        if let Some(member) = member {
            log::debug!("disconnecting from {}", member.address);
            member.pool.reset();
        }
    }

    pub fn close(&self) {
        self.disconnect();
    }

    /// Best-effort liveness probe: true unless there is no cached member or
    /// its pool's socket looks dead. Cheaper than a round trip, but not a
    /// guarantee the next operation will succeed.
    pub async fn alive(&self) -> bool {
        match self.cached_member() {
            None => false,
            Some(member) => match member.pool.get_socket(None).await {
                Ok(sock) => !sock.looks_dead(member.pool.options().socket_check_interval),
                Err(_) => false,
            },
        }
    }

    async fn checked_out_socket(&self, member: &Member, caller: Option<CallerId>) -> Result<PooledSocket> {
        let mut sock = member.pool.get_socket(caller).await.map_err(|e| {
            self.disconnect();
            Error::AutoReconnect(format!("could not connect to {}: {}", member.address, e))
        })?;
        self.reconcile_credentials(&mut sock).await?;
        Ok(sock)
    }

    /// Logout any socket credential no longer in the cache, authenticate any
    /// cached credential missing from the socket. Mirrors `__check_auth`.
    async fn reconcile_credentials(&self, sock: &mut crate::socket::Socket) -> Result<()> {
        let cached: std::collections::HashSet<Credential> =
            self.credentials.lock().unwrap().values().cloned().collect();
        if cached.is_empty() && sock.auth_set.is_empty() {
            return Ok(());
        }

        let stale: Vec<Credential> = sock.auth_set.difference(&cached).cloned().collect();
        for credential in stale {
            log::debug!("logging out stale credential {}", credential);
            self.authenticator.logout(&credential, sock).await?;
            sock.auth_set.remove(&credential);
        }

        let missing: Vec<Credential> = cached.difference(&sock.auth_set).cloned().collect();
        for credential in missing {
            log::debug!("authenticating missing credential {}", credential);
            self.authenticator.authenticate(&credential, sock).await?;
            sock.auth_set.insert(credential);
        }
        Ok(())
    }

    /// Add a credential to the authentication cache, verifying it against
    /// the server first. Mirrors `_cache_credentials`.
    pub async fn cache_credentials(&self, source: &str, credential: Credential) -> Result<()> {
        {
            let creds = self.credentials.lock().unwrap();
            if let Some(existing) = creds.get(source) {
                if existing == &credential {
                    return Ok(());
                }
                return Err(Error::Configuration(
                    "another user is already authenticated to this database; log out first"
                        .to_string(),
                ));
            }
        }

        let member = self.ensure_member().await?;
        let mut sock = self.checked_out_socket(&member, None).await?;
        self.authenticator.authenticate(&credential, &mut sock).await?;
        sock.auth_set.insert(credential.clone());
        drop(sock);

        self.credentials.lock().unwrap().insert(source.to_string(), credential);
        Ok(())
    }

    /// Mirrors `_purge_credentials`.
    pub fn purge_credentials(&self, source: &str) {
        self.credentials.lock().unwrap().remove(source);
    }

    /// BSON size enforcement before any I/O, per §4.E and §6.
    fn check_document_size(&self, outbound: &OutboundMessage, member: &Member) -> Result<()> {
        if let Some(size) = outbound.max_doc_size {
            if size > member.max_bson_size {
                return Err(Error::DocumentTooLarge {
                    size,
                    max: member.max_bson_size,
                });
            }
        }
        Ok(())
    }

    /// Send a message with no acknowledgement, per `_send_message` without
    /// `with_last_error`. An unacknowledged write against a non-primary would
    /// otherwise fail silently, so a `check_primary` message fails fast
    /// instead of going out at all.
    pub async fn send_message(&self, outbound: &OutboundMessage, caller: Option<CallerId>) -> Result<()> {
        let member = self.ensure_member().await?;
        if outbound.check_primary && !member.is_primary() {
            return Err(Error::AutoReconnect("not master".to_string()));
        }
        self.check_document_size(outbound, &member)?;
        let mut sock = self.checked_out_socket(&member, caller).await?;
        sock.send(&outbound.bytes).await.map_err(|e| {
            self.disconnect();
            e
        })
    }

    /// Send a message and wait for its reply, classifying any server-side
    /// error and disconnecting on a stepped-down primary. Mirrors
    /// `_send_message(with_last_error=True)` /
    /// `__check_response_to_last_error`.
    pub async fn send_message_with_response(
        &self,
        outbound: &OutboundMessage,
        caller: Option<CallerId>,
    ) -> Result<CommandOutcome> {
        let member = self.ensure_member().await?;
        self.check_document_size(outbound, &member)?;
        let mut sock = self.checked_out_socket(&member, caller).await?;

        let outcome = match self.exchange(&mut sock, outbound).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.disconnect();
                return Err(Error::AutoReconnect(e.to_string()));
            }
        };

        if let Some((message, code)) = outcome.effective_error() {
            if Error::is_not_master(&message) {
                self.disconnect();
                return Err(Error::AutoReconnect(message));
            }
            return Err(Error::from_command_error(message, code));
        }
        Ok(outcome)
    }

    /// As [`Client::send_message_with_response`], but for a reply the caller
    /// will keep streaming further batches off of (an exhaust cursor): the
    /// checked-out socket is marked exhaust and handed back to the caller
    /// instead of being released at scope exit. Per §4.A, an exhaust-flagged
    /// socket is never silently returned to the pool; the caller is
    /// responsible for closing it once the stream is drained.
    pub async fn send_message_with_response_exhaust(
        &self,
        outbound: &OutboundMessage,
        caller: Option<CallerId>,
    ) -> Result<(CommandOutcome, PooledSocket)> {
        let member = self.ensure_member().await?;
        self.check_document_size(outbound, &member)?;
        let mut sock = self.checked_out_socket(&member, caller).await?;
        sock.mark_exhaust(true);

        let outcome = match self.exchange(&mut sock, outbound).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.disconnect();
                return Err(Error::AutoReconnect(e.to_string()));
            }
        };

        if let Some((message, code)) = outcome.effective_error() {
            if Error::is_not_master(&message) {
                self.disconnect();
                return Err(Error::AutoReconnect(message));
            }
            return Err(Error::from_command_error(message, code));
        }
        Ok((outcome, sock))
    }

    async fn exchange(&self, sock: &mut PooledSocket, outbound: &OutboundMessage) -> Result<CommandOutcome> {
        sock.send(&outbound.bytes).await?;
        let body = sock.recv_message(OP_REPLY, Some(outbound.request_id)).await?;
        self.codec
            .decode_command_reply(&body)
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoopAuthenticator;
    use crate::socket::Socket;
    use crate::wire::{CodecError, HandshakeReply, MessageHeader, HEADER_LEN};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FakeCodec {
        handshake: HandshakeReply,
        command_err: Option<(String, Option<i32>)>,
    }

    impl MessageCodec for FakeCodec {
        fn encode_handshake(&self, request_id: i32) -> OutboundMessage {
            OutboundMessage {
                request_id,
                bytes: minimal_request(request_id),
                max_doc_size: None,
                check_primary: false,
            }
        }

        fn decode_handshake(&self, _body: &[u8]) -> std::result::Result<HandshakeReply, CodecError> {
            Ok(self.handshake.clone())
        }

        fn decode_command_reply(&self, _body: &[u8]) -> std::result::Result<CommandOutcome, CodecError> {
            Ok(match &self.command_err {
                Some((err, code)) => CommandOutcome {
                    err: Some(err.clone()),
                    code: *code,
                    err_objects: vec![],
                },
                None => CommandOutcome::default(),
            })
        }
    }

    struct SpyAuthenticator {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Authenticator for SpyAuthenticator {
        async fn authenticate(&self, credential: &Credential, _socket: &mut Socket) -> Result<()> {
            self.log.lock().unwrap().push(format!("auth:{}", credential.username));
            Ok(())
        }

        async fn logout(&self, credential: &Credential, _socket: &mut Socket) -> Result<()> {
            self.log.lock().unwrap().push(format!("logout:{}", credential.username));
            Ok(())
        }
    }

    fn minimal_request(request_id: i32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(&(HEADER_LEN as i32).to_le_bytes());
        bytes.extend_from_slice(&request_id.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&2004i32.to_le_bytes());
        bytes
    }

    /// A one-connection fake server that answers `rounds` request/reply
    /// cycles with an empty-bodied `OP_REPLY`, then idles briefly before
    /// closing.
    async fn spawn_sequenced_node(rounds: usize) -> Address {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            for _ in 0..rounds {
                let mut header_buf = [0u8; HEADER_LEN];
                if socket.read_exact(&mut header_buf).await.is_err() {
                    return;
                }
                let header = MessageHeader::parse(&header_buf);
                let body_len = header.total_length as usize - HEADER_LEN;
                if body_len > 0 {
                    let mut discard = vec![0u8; body_len];
                    if socket.read_exact(&mut discard).await.is_err() {
                        return;
                    }
                }
                let body = [0u8; 1];
                let total_length = (HEADER_LEN + body.len()) as i32;
                let mut reply = Vec::with_capacity(total_length as usize);
                reply.extend_from_slice(&total_length.to_le_bytes());
                reply.extend_from_slice(&1i32.to_le_bytes());
                reply.extend_from_slice(&header.request_id.to_le_bytes());
                reply.extend_from_slice(&OP_REPLY.to_le_bytes());
                reply.extend_from_slice(&body);
                if socket.write_all(&reply).await.is_err() {
                    return;
                }
            }
            tokio::time::delay_for(Duration::from_millis(300)).await;
        });
        Address::Tcp(addr.ip().to_string(), addr.port())
    }

    fn standalone_codec() -> Arc<FakeCodec> {
        Arc::new(FakeCodec {
            handshake: HandshakeReply {
                is_master: true,
                max_bson_object_size: Some(16_000_000),
                ..Default::default()
            },
            command_err: None,
        })
    }

    #[test]
    fn empty_seed_list_is_rejected() {
        let err = Client::new(vec![], ClientOptions::default(), standalone_codec(), Arc::new(NoopAuthenticator))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn ensure_member_resolves_and_caches() {
        let addr = spawn_sequenced_node(1).await;
        let client = Client::new(
            vec![addr],
            ClientOptions::default(),
            standalone_codec(),
            Arc::new(NoopAuthenticator),
        )
        .unwrap();

        let first = client.ensure_member().await.unwrap();
        assert!(first.is_primary());
        let second = client.ensure_member().await.unwrap();
        assert_eq!(first.address, second.address);
    }

    #[tokio::test]
    async fn document_too_large_is_rejected_before_any_further_io() {
        let addr = spawn_sequenced_node(1).await;
        let codec = Arc::new(FakeCodec {
            handshake: HandshakeReply {
                is_master: true,
                max_bson_object_size: Some(100),
                ..Default::default()
            },
            command_err: None,
        });
        let client = Client::new(vec![addr], ClientOptions::default(), codec, Arc::new(NoopAuthenticator)).unwrap();

        let outbound = OutboundMessage {
            request_id: 1,
            bytes: vec![],
            max_doc_size: Some(200),
            check_primary: false,
        };
        let err = client.send_message(&outbound, None).await.unwrap_err();
        assert!(matches!(err, Error::DocumentTooLarge { size: 200, max: 100 }));
    }

    #[tokio::test]
    async fn check_primary_message_fails_fast_against_non_primary() {
        let addr = spawn_sequenced_node(1).await;
        let codec = Arc::new(FakeCodec {
            handshake: HandshakeReply {
                is_master: false,
                is_secondary: true,
                set_name: Some("rs0".to_string()),
                max_bson_object_size: Some(16_000_000),
                ..Default::default()
            },
            command_err: None,
        });
        let client = Client::new(vec![addr], ClientOptions::default(), codec, Arc::new(NoopAuthenticator)).unwrap();
        let member = client.ensure_member().await.unwrap();
        assert!(!member.is_primary());

        let outbound = OutboundMessage {
            request_id: 1,
            bytes: minimal_request(1),
            max_doc_size: None,
            check_primary: true,
        };
        let err = client.send_message(&outbound, None).await.unwrap_err();
        assert!(matches!(err, Error::AutoReconnect(_)));
    }

    #[tokio::test]
    async fn exhaust_socket_is_not_returned_to_pool_on_drop() {
        let addr = spawn_sequenced_node(2).await;
        let client = Client::new(
            vec![addr],
            ClientOptions::default(),
            standalone_codec(),
            Arc::new(NoopAuthenticator),
        )
        .unwrap();

        let outbound = OutboundMessage {
            request_id: 9,
            bytes: minimal_request(9),
            max_doc_size: None,
            check_primary: false,
        };
        let (_, sock) = client
            .send_message_with_response_exhaust(&outbound, None)
            .await
            .unwrap();
        assert!(sock.is_exhaust());
        let member = client.cached_member().unwrap();
        drop(sock);
        assert_eq!(member.pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn not_master_reply_disconnects_client() {
        let addr = spawn_sequenced_node(2).await;
        let codec = Arc::new(FakeCodec {
            handshake: HandshakeReply {
                is_master: true,
                max_bson_object_size: Some(16_000_000),
                ..Default::default()
            },
            command_err: Some(("not master".to_string(), None)),
        });
        let client = Client::new(vec![addr], ClientOptions::default(), codec, Arc::new(NoopAuthenticator)).unwrap();
        client.ensure_member().await.unwrap();

        let outbound = OutboundMessage {
            request_id: 7,
            bytes: minimal_request(7),
            max_doc_size: None,
            check_primary: false,
        };
        let err = client.send_message_with_response(&outbound, None).await.unwrap_err();
        assert!(matches!(err, Error::AutoReconnect(_)));
        assert!(client.cached_member().is_none());
    }

    #[tokio::test]
    async fn disconnect_clears_cached_member() {
        let addr = spawn_sequenced_node(1).await;
        let client = Client::new(
            vec![addr],
            ClientOptions::default(),
            standalone_codec(),
            Arc::new(NoopAuthenticator),
        )
        .unwrap();

        client.ensure_member().await.unwrap();
        assert!(client.cached_member().is_some());
        client.disconnect();
        assert!(client.cached_member().is_none());
    }

    #[tokio::test]
    async fn credential_cache_is_reconciled_on_checkout() {
        let addr = spawn_sequenced_node(1).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let auth = Arc::new(SpyAuthenticator { log: log.clone() });
        let client = Client::new(vec![addr], ClientOptions::default(), standalone_codec(), auth).unwrap();

        let cred = Credential::new("SCRAM-SHA-1", "admin", "alice", "secret");
        client.cache_credentials("admin", cred.clone()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["auth:alice".to_string()]);

        client.purge_credentials("admin");
        let member = client.ensure_member().await.unwrap();
        let _sock = client.checked_out_socket(&member, None).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["auth:alice".to_string(), "logout:alice".to_string()]
        );
    }

    #[tokio::test]
    async fn recaching_the_same_credential_is_a_no_op() {
        let addr = spawn_sequenced_node(1).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let auth = Arc::new(SpyAuthenticator { log: log.clone() });
        let client = Client::new(vec![addr], ClientOptions::default(), standalone_codec(), auth).unwrap();

        let cred = Credential::new("SCRAM-SHA-1", "admin", "alice", "secret");
        client.cache_credentials("admin", cred.clone()).await.unwrap();
        client.cache_credentials("admin", cred).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn caching_a_different_credential_for_the_same_source_is_an_error() {
        let addr = spawn_sequenced_node(1).await;
        let client = Client::new(
            vec![addr],
            ClientOptions::default(),
            standalone_codec(),
            Arc::new(NoopAuthenticator),
        )
        .unwrap();

        client
            .cache_credentials("admin", Credential::new("SCRAM-SHA-1", "admin", "alice", "secret"))
            .await
            .unwrap();
        let err = client
            .cache_credentials("admin", Credential::new("SCRAM-SHA-1", "admin", "bob", "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
