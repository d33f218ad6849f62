//! Component C: a remote endpoint's observed state.

use std::time::Duration;

use crate::pool::Pool;
use crate::socket::Address;
use crate::wire::{
    HandshakeReply, DEFAULT_MAX_BSON_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_WIRE_VERSION,
    DEFAULT_MAX_WRITE_BATCH_SIZE, DEFAULT_MIN_WIRE_VERSION,
};

/// A server's classification, derived from its handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Standalone,
    Primary,
    Secondary,
    Arbiter,
    Router,
    Unknown,
}

/// The client's current model of one remote server, including the pool
/// created to reach it. Immutable after construction; a fresh `Member`
/// replaces a stale one rather than being mutated in place.
#[derive(Debug, Clone)]
pub struct Member {
    pub address: Address,
    pub pool: Pool,
    pub kind: ServerKind,
    pub set_name: Option<String>,
    pub ping: Duration,
    pub max_bson_size: usize,
    pub max_message_size: usize,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub max_write_batch_size: usize,
}

impl Member {
    /// Derive a `Member` from a handshake response and measured round-trip
    /// time, per §4.C.
    pub fn from_handshake(
        address: Address,
        pool: Pool,
        reply: &HandshakeReply,
        round_trip: Duration,
    ) -> Member {
        let kind = if reply.is_router() {
            ServerKind::Router
        } else if reply.is_master {
            ServerKind::Primary
        } else if reply.is_secondary {
            ServerKind::Secondary
        } else if reply.is_arbiter {
            ServerKind::Arbiter
        } else if reply.set_name.is_some() {
            ServerKind::Unknown
        } else {
            ServerKind::Standalone
        };

        Member {
            address,
            pool,
            kind,
            set_name: reply.set_name.clone(),
            ping: round_trip,
            max_bson_size: reply
                .max_bson_object_size
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_BSON_SIZE),
            max_message_size: reply
                .max_message_size_bytes
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            min_wire_version: reply.min_wire_version.unwrap_or(DEFAULT_MIN_WIRE_VERSION),
            max_wire_version: reply.max_wire_version.unwrap_or(DEFAULT_MAX_WIRE_VERSION),
            max_write_batch_size: reply
                .max_write_batch_size
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.kind == ServerKind::Primary
    }

    pub fn is_router(&self) -> bool {
        self.kind == ServerKind::Router
    }

    pub fn is_arbiter(&self) -> bool {
        self.kind == ServerKind::Arbiter
    }
}
