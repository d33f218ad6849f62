//! Component D: topology/member resolution.
//!
//! Grounded on `pymongo.mongo_client.MongoClient.{__try_node, __find_node,
//! __pick_nearest}`. Candidate nodes are tried in seed-list order; a
//! replica-set secondary that names a primary causes recursion to that
//! primary; a seed list of routers (mongos) is instead resolved by latency,
//! picking uniformly among candidates within `latency_threshold` of the
//! fastest, matching the original's random tie-break.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::member::Member;
use crate::options::PoolOptions;
use crate::pool::Pool;
use crate::socket::Address;
use crate::uri::{parse_host, DEFAULT_PORT};
use crate::wire::{next_request_id, MessageCodec, OP_REPLY};

/// Resolution parameters that don't change between candidates within one
/// resolve attempt.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub pool_options: PoolOptions,
    pub replica_set_name: Option<String>,
    /// True for a single-seed direct connection, where membership in a
    /// replica set (or lack of one) is not enforced -- only arbiter
    /// rejection applies.
    pub direct: bool,
    pub latency_threshold: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            pool_options: PoolOptions::default(),
            replica_set_name: None,
            direct: false,
            latency_threshold: Duration::from_millis(15),
        }
    }
}

/// Stateless resolver: everything it needs per call is either `self` (the
/// injected wire codec) or the arguments. Safe to share across concurrent
/// resolution attempts.
pub struct Resolver {
    codec: Arc<dyn MessageCodec>,
}

impl Resolver {
    pub fn new(codec: Arc<dyn MessageCodec>) -> Resolver {
        Resolver { codec }
    }

    /// Try every seed in order; recurse to a reported primary; if every
    /// reachable candidate turns out to be a router, pick the nearest one
    /// instead. Mirrors `__find_node`.
    ///
    /// `known_routers` is the node set from a previous successful router
    /// resolution, if any: per `__find_node`'s `self.__nodes or mongoses`,
    /// once a router node set is known it stays sticky across later
    /// re-resolutions rather than being recomputed from whichever routers
    /// happen to answer this attempt's probes.
    pub async fn resolve(
        &self,
        seeds: &[Address],
        config: &ResolverConfig,
        known_routers: &HashSet<Address>,
    ) -> Result<(Member, HashSet<Address>)> {
        if seeds.is_empty() {
            return Err(Error::Configuration(
                "need to specify at least one host".to_string(),
            ));
        }

        let mut errors = Vec::new();
        let mut router_candidates: Vec<Member> = Vec::new();
        let mut router_nodes: HashSet<Address> = HashSet::new();

        for candidate in seeds {
            match self.try_node(candidate, config).await {
                Ok((member, nodes)) => {
                    if member.is_router() && !config.direct {
                        router_nodes.extend(nodes);
                        router_candidates.push(member);
                        continue;
                    }
                    if !router_candidates.is_empty() {
                        return Err(Error::Configuration(
                            "seed list cannot contain a mix of mongod and mongos instances"
                                .to_string(),
                        ));
                    }
                    return Ok((member, nodes));
                }
                // Configuration mistakes (wrong replica set, arbiter via
                // direct connect, bad host syntax) are fatal immediately;
                // everything else just rules out this one candidate.
                Err(e @ Error::Configuration(_)) => return Err(e),
                Err(e) => {
                    log::debug!("candidate {} ruled out: {}", candidate, e);
                    errors.push(e.to_string());
                }
            }
        }

        if !router_candidates.is_empty() {
            let chosen = pick_nearest(&router_candidates, config.latency_threshold)
                .expect("router_candidates is non-empty")
                .clone();
            let nodes = if known_routers.is_empty() {
                router_nodes
            } else {
                known_routers.clone()
            };
            return Ok((chosen, nodes));
        }

        Err(Error::AutoReconnect(errors.join(", ")))
    }

    /// Connect to one candidate and classify it, recursing to a reported
    /// primary for a replica-set member that isn't primary itself. Returns
    /// the resolved member plus the set of hosts it reported (including
    /// itself). Async recursion needs manual boxing since `async fn` can't
    /// call itself directly.
    pub fn try_node<'a>(
        &'a self,
        address: &'a Address,
        config: &'a ResolverConfig,
    ) -> Pin<Box<dyn Future<Output = Result<(Member, HashSet<Address>)>> + Send + 'a>> {
        Box::pin(async move {
            let pool = Pool::new(address.clone(), config.pool_options.clone());
            let (reply, round_trip) = {
                let mut sock = pool.get_socket(None).await?;
                self.handshake(&mut sock).await?
            };
            let member = Member::from_handshake(address.clone(), pool, &reply, round_trip);

            let mut nodes: HashSet<Address> = HashSet::new();
            nodes.insert(address.clone());

            if config.direct {
                if member.is_arbiter() {
                    return Err(Error::Configuration(format!("{} is an arbiter", address)));
                }
                return Ok((member, nodes));
            }

            if let (Some(wanted), Some(got)) = (&config.replica_set_name, &member.set_name) {
                if wanted != got {
                    return Err(Error::Configuration(format!(
                        "{} is not a member of replica set {}",
                        address, wanted
                    )));
                }
            }

            if !reply.hosts.is_empty() {
                nodes = reply
                    .hosts
                    .iter()
                    .filter_map(|h| parse_host(h, DEFAULT_PORT).ok())
                    .collect();
            }

            if member.is_primary() {
                return Ok((member, nodes));
            }

            if let Some(primary) = &reply.primary {
                let candidate = parse_host(primary, DEFAULT_PORT)?;
                return self.try_node(&candidate, config).await;
            }

            Err(Error::AutoReconnect(format!(
                "{} is not primary or master",
                address
            )))
        })
    }

    async fn handshake(
        &self,
        sock: &mut crate::pool::PooledSocket,
    ) -> Result<(crate::wire::HandshakeReply, Duration)> {
        let request_id = next_request_id();
        let outbound = self.codec.encode_handshake(request_id);
        let start = Instant::now();
        sock.send(&outbound.bytes).await?;
        let body = sock.recv_message(OP_REPLY, Some(outbound.request_id)).await?;
        let round_trip = start.elapsed();
        let reply = self
            .codec
            .decode_handshake(&body)
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok((reply, round_trip))
    }
}

/// Pick uniformly at random among the members within `latency_threshold` of
/// the fastest candidate. Mirrors `__pick_nearest`.
pub fn pick_nearest(candidates: &[Member], latency_threshold: Duration) -> Option<&Member> {
    let fastest = candidates.iter().map(|m| m.ping).min()?;
    let near: Vec<&Member> = candidates
        .iter()
        .filter(|m| m.ping.saturating_sub(fastest) < latency_threshold)
        .collect();
    if near.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0, near.len());
    Some(near[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CodecError, CommandOutcome, HandshakeReply, MessageHeader, OutboundMessage, HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A `MessageCodec` whose handshake replies are scripted by a node
    /// index carried in the reply body, so a fake server can hand back a
    /// pre-baked `HandshakeReply` without any real BSON.
    struct ScriptedCodec {
        replies: Vec<HandshakeReply>,
    }

    impl MessageCodec for ScriptedCodec {
        fn encode_handshake(&self, request_id: i32) -> OutboundMessage {
            let mut bytes = Vec::with_capacity(HEADER_LEN);
            bytes.extend_from_slice(&(HEADER_LEN as i32).to_le_bytes());
            bytes.extend_from_slice(&request_id.to_le_bytes());
            bytes.extend_from_slice(&0i32.to_le_bytes());
            bytes.extend_from_slice(&2004i32.to_le_bytes()); // OP_QUERY
            OutboundMessage {
                request_id,
                bytes,
                max_doc_size: None,
                check_primary: false,
            }
        }

        fn decode_handshake(&self, body: &[u8]) -> std::result::Result<HandshakeReply, CodecError> {
            let idx = u16::from_le_bytes([body[0], body[1]]) as usize;
            self.replies
                .get(idx)
                .cloned()
                .ok_or_else(|| CodecError("unscripted node index".to_string()))
        }

        fn decode_command_reply(&self, _body: &[u8]) -> std::result::Result<CommandOutcome, CodecError> {
            Ok(CommandOutcome::default())
        }
    }

    /// Spin up a one-shot loopback server that reads a handshake request and
    /// replies with `index` as its two-byte body, which `ScriptedCodec`
    /// looks up against a shared script.
    async fn spawn_scripted_node(index: u16) -> Address {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut header_buf = [0u8; HEADER_LEN];
            if socket.read_exact(&mut header_buf).await.is_err() {
                return;
            }
            let header = MessageHeader::parse(&header_buf);
            let body_len = header.total_length as usize - HEADER_LEN;
            if body_len > 0 {
                let mut discard = vec![0u8; body_len];
                let _ = socket.read_exact(&mut discard).await;
            }

            let body = index.to_le_bytes();
            let total_length = (HEADER_LEN + body.len()) as i32;
            let mut reply = Vec::with_capacity(total_length as usize);
            reply.extend_from_slice(&total_length.to_le_bytes());
            reply.extend_from_slice(&99i32.to_le_bytes());
            reply.extend_from_slice(&header.request_id.to_le_bytes());
            reply.extend_from_slice(&OP_REPLY.to_le_bytes());
            reply.extend_from_slice(&body);
            let _ = socket.write_all(&reply).await;
            tokio::time::delay_for(Duration::from_millis(300)).await;
        });
        Address::Tcp(addr.ip().to_string(), addr.port())
    }

    fn standalone_reply() -> HandshakeReply {
        HandshakeReply {
            is_master: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn standalone_happy_path() {
        let addr = spawn_scripted_node(0).await;
        let codec = Arc::new(ScriptedCodec {
            replies: vec![standalone_reply()],
        });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig::default();

        let (member, _nodes) = resolver
            .resolve(&[addr.clone()], &config, &HashSet::new())
            .await
            .unwrap();
        assert!(member.is_primary());
        assert_eq!(member.address, addr);
    }

    #[tokio::test]
    async fn secondary_recurses_to_reported_primary() {
        let secondary_addr_holder = spawn_scripted_node(0).await;
        let primary_addr_holder = spawn_scripted_node(1).await;

        let primary_str = primary_addr_holder.to_string();
        let replies = vec![
            HandshakeReply {
                is_secondary: true,
                set_name: Some("rs0".to_string()),
                primary: Some(primary_str),
                hosts: vec![secondary_addr_holder.to_string(), primary_addr_holder.to_string()],
                ..Default::default()
            },
            HandshakeReply {
                is_master: true,
                set_name: Some("rs0".to_string()),
                hosts: vec![secondary_addr_holder.to_string(), primary_addr_holder.to_string()],
                ..Default::default()
            },
        ];
        let codec = Arc::new(ScriptedCodec { replies });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig {
            replica_set_name: Some("rs0".to_string()),
            ..Default::default()
        };

        let (member, nodes) = resolver
            .resolve(&[secondary_addr_holder.clone()], &config, &HashSet::new())
            .await
            .unwrap();
        assert!(member.is_primary());
        assert_eq!(member.address, primary_addr_holder);
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn wrong_replica_set_name_fails_fast() {
        let addr = spawn_scripted_node(0).await;
        let replies = vec![HandshakeReply {
            is_secondary: true,
            set_name: Some("other".to_string()),
            ..Default::default()
        }];
        let codec = Arc::new(ScriptedCodec { replies });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig {
            replica_set_name: Some("rs0".to_string()),
            ..Default::default()
        };

        let err = resolver.resolve(&[addr], &config, &HashSet::new()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn direct_connect_to_arbiter_is_rejected() {
        let addr = spawn_scripted_node(0).await;
        let replies = vec![HandshakeReply {
            is_arbiter: true,
            set_name: Some("rs0".to_string()),
            ..Default::default()
        }];
        let codec = Arc::new(ScriptedCodec { replies });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig {
            direct: true,
            ..Default::default()
        };

        let err = resolver.resolve(&[addr], &config, &HashSet::new()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn mixed_mongod_and_mongos_seed_list_is_rejected() {
        let router_addr = spawn_scripted_node(0).await;
        let mongod_addr = spawn_scripted_node(1).await;
        let replies = vec![
            HandshakeReply {
                is_master: true,
                msg: Some("isdbgrid".to_string()),
                ..Default::default()
            },
            HandshakeReply {
                is_master: true,
                ..Default::default()
            },
        ];
        let codec = Arc::new(ScriptedCodec { replies });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig::default();

        let err = resolver
            .resolve(&[router_addr, mongod_addr], &config, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn router_resolution_prefers_previously_known_node_set() {
        let router_addr = spawn_scripted_node(0).await;
        let replies = vec![HandshakeReply {
            is_master: true,
            msg: Some("isdbgrid".to_string()),
            ..Default::default()
        }];
        let codec = Arc::new(ScriptedCodec { replies });
        let resolver = Resolver::new(codec);
        let config = ResolverConfig::default();

        let stale_router = Address::Tcp("stale-router".to_string(), 27017);
        let mut known_routers = HashSet::new();
        known_routers.insert(stale_router.clone());

        let (chosen, nodes) = resolver
            .resolve(&[router_addr.clone()], &config, &known_routers)
            .await
            .unwrap();
        assert_eq!(chosen.address, router_addr);
        assert_eq!(nodes, known_routers);
        assert!(!nodes.contains(&router_addr));
    }

    #[test]
    fn pick_nearest_only_considers_candidates_within_threshold() {
        let addr = Address::Tcp("x".into(), 1);
        let far_addr = Address::Tcp("y".into(), 2);
        let pool = |a: Address| Pool::new(a, PoolOptions::default());

        let near1 = Member::from_handshake(
            addr.clone(),
            pool(addr.clone()),
            &HandshakeReply {
                is_master: true,
                msg: Some("isdbgrid".to_string()),
                ..Default::default()
            },
            Duration::from_millis(10),
        );
        let near2 = Member::from_handshake(
            addr.clone(),
            pool(addr.clone()),
            &HandshakeReply {
                is_master: true,
                msg: Some("isdbgrid".to_string()),
                ..Default::default()
            },
            Duration::from_millis(12),
        );
        let far = Member::from_handshake(
            far_addr.clone(),
            pool(far_addr.clone()),
            &HandshakeReply {
                is_master: true,
                msg: Some("isdbgrid".to_string()),
                ..Default::default()
            },
            Duration::from_millis(50),
        );

        let candidates = vec![near1, near2, far];
        for _ in 0..20 {
            let chosen = pick_nearest(&candidates, Duration::from_millis(15)).unwrap();
            assert_ne!(chosen.ping, Duration::from_millis(50));
        }
    }

    #[test]
    fn pick_nearest_empty_candidates_is_none() {
        assert!(pick_nearest(&[], Duration::from_millis(15)).is_none());
    }
}
