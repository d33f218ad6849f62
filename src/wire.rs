//! Wire-level primitives this crate owns, plus the trait boundary to the
//! BSON/command layer that it does not.
//!
//! Per the design's scope section, this crate frames message bytes (16-byte
//! header: total length, request id, response-to, opcode, all little-endian
//! `i32`s) but does not decode BSON. The few handshake and `lastError`
//! fields the core must inspect (to pick a primary, size-check documents,
//! and classify write errors) are produced by an injected [`MessageCodec`]
//! implementation, kept on the other side of this trait boundary.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Byte length of a wire protocol message header.
pub const HEADER_LEN: usize = 16;

/// The `OP_REPLY` opcode used by every handshake/command response this crate
/// reads directly (§6).
pub const OP_REPLY: i32 = 1;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// A process-wide monotonically increasing request id, used to correlate a
/// sent message with its reply the way the original driver's
/// `itertools.count()`-based id generator does.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Fallback limits in effect before any handshake completes.
pub const DEFAULT_MAX_BSON_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MIN_WIRE_VERSION: i32 = 0;
pub const DEFAULT_MAX_WIRE_VERSION: i32 = 0;

/// A parsed wire-message header, as read from the first 16 bytes of any
/// server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub total_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    /// Parse a 16-byte little-endian header.
    pub fn parse(buf: &[u8]) -> MessageHeader {
        debug_assert_eq!(buf.len(), HEADER_LEN);
        MessageHeader {
            total_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// The handshake (`{ismaster: 1}`) reply fields the core is allowed to
/// understand, per the design's scope section.
#[derive(Debug, Clone, Default)]
pub struct HandshakeReply {
    pub is_master: bool,
    pub is_secondary: bool,
    pub is_arbiter: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub hosts: Vec<String>,
    pub primary: Option<String>,
    pub max_bson_object_size: Option<i64>,
    pub max_message_size_bytes: Option<i64>,
    pub max_write_batch_size: Option<i64>,
    pub min_wire_version: Option<i32>,
    pub max_wire_version: Option<i32>,
}

impl HandshakeReply {
    /// `msg == "isdbgrid"` denotes a mongos-style router.
    pub fn is_router(&self) -> bool {
        self.msg.as_deref() == Some("isdbgrid")
    }
}

/// The `lastError`/command-reply fields the core inspects to classify write
/// errors, per §6.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub err: Option<String>,
    pub code: Option<i32>,
    pub err_objects: Vec<CommandOutcome>,
}

impl CommandOutcome {
    /// Resolve the effective `(message, code)` pair, preferring a matching
    /// `errObjects` entry the way multi-shard mongos replies do.
    pub fn effective_error(&self) -> Option<(String, Option<i32>)> {
        let err = self.err.clone()?;
        if err.is_empty() {
            return None;
        }
        for obj in &self.err_objects {
            if obj.err.as_deref() == Some(err.as_str()) {
                return Some((err, obj.code));
            }
        }
        Some((err, self.code))
    }
}

/// An outbound message ready to hand to a [`crate::socket::Socket`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub request_id: i32,
    pub bytes: Vec<u8>,
    /// Set when the message embeds a document whose encoded size must be
    /// checked against the server's `max_bson_size` before sending.
    pub max_doc_size: Option<usize>,
    /// Set for a write sent without acknowledgement, where a silent no-op
    /// against a non-primary would otherwise go unnoticed: `send_message`
    /// refuses to hand such a message to a socket unless the cached member
    /// is currently primary.
    pub check_primary: bool,
}

/// The boundary to the BSON/command layer: encodes commands into wire bytes
/// and decodes the handshake/command replies this crate needs to read.
/// Implementations live outside this crate (see §1's Out of scope list).
pub trait MessageCodec: Send + Sync {
    /// Build the `{ismaster: 1}` handshake command against `admin.$cmd`.
    fn encode_handshake(&self, request_id: i32) -> OutboundMessage;

    /// Decode a handshake reply body (the bytes after the 16-byte header).
    fn decode_handshake(&self, body: &[u8]) -> Result<HandshakeReply, CodecError>;

    /// Decode a command/`lastError` reply body.
    fn decode_command_reply(&self, body: &[u8]) -> Result<CommandOutcome, CodecError>;
}

/// Opaque decode failure from a [`MessageCodec`] implementation.
#[derive(Debug, Clone)]
pub struct CodecError(pub String);

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec error: {}", self.0)
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_little_endian_header() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&42i32.to_le_bytes());
        buf[4..8].copy_from_slice(&7i32.to_le_bytes());
        buf[8..12].copy_from_slice(&7i32.to_le_bytes());
        buf[12..16].copy_from_slice(&1i32.to_le_bytes());
        let header = MessageHeader::parse(&buf);
        assert_eq!(header.total_length, 42);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.response_to, 7);
        assert_eq!(header.op_code, 1);
    }

    #[test]
    fn router_detection() {
        let mut reply = HandshakeReply::default();
        assert!(!reply.is_router());
        reply.msg = Some("isdbgrid".to_string());
        assert!(reply.is_router());
    }

    #[test]
    fn effective_error_prefers_matching_err_object() {
        let outcome = CommandOutcome {
            err: Some("boom".to_string()),
            code: None,
            err_objects: vec![CommandOutcome {
                err: Some("boom".to_string()),
                code: Some(11000),
                err_objects: vec![],
            }],
        };
        let (msg, code) = outcome.effective_error().unwrap();
        assert_eq!(msg, "boom");
        assert_eq!(code, Some(11000));
    }

    #[test]
    fn empty_err_is_not_an_error() {
        let outcome = CommandOutcome {
            err: Some(String::new()),
            code: None,
            err_objects: vec![],
        };
        assert!(outcome.effective_error().is_none());
    }
}
