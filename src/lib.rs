//! The core of a MongoDB client library: connection pool, topology/member
//! resolver, and client front-end.
//!
//! This crate owns the wire-framing, pooling, and topology-discovery
//! machinery; it does not speak BSON or any MongoDB command's document
//! shape. Those concerns cross the [`wire::MessageCodec`] and
//! [`auth::Authenticator`] trait boundaries, implemented by a collaborator
//! outside this crate. See DESIGN.md for the full scope and the rationale
//! behind each boundary.

pub mod auth;
pub mod caller;
pub mod client;
pub mod error;
pub mod member;
pub mod options;
pub mod pool;
pub mod resolver;
pub mod socket;
pub mod uri;
pub mod wire;

pub use auth::{Authenticator, Credential, NoopAuthenticator};
pub use caller::CallerId;
pub use client::Client;
pub use error::{Error, Result};
pub use member::{Member, ServerKind};
pub use options::{ClientOptions, PoolOptions, WriteConcern};
pub use pool::{Pool, PooledSocket, PoolStats, RequestGuard};
pub use resolver::{pick_nearest, Resolver, ResolverConfig};
pub use socket::{Address, Socket};
pub use uri::{parse as parse_uri, ParsedUri, DEFAULT_PORT};
pub use wire::{CodecError, CommandOutcome, HandshakeReply, MessageCodec, OutboundMessage};
