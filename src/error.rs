//! The error taxonomy described in the design's error-handling section.
//!
//! Every fallible operation in this crate returns [`Error`]. Unlike the
//! driver this crate is modeled on, which raises one exception class per
//! taxonomy entry, Rust callers match on variants of a single enum.

use std::fmt;

/// A server-reported command failure, carried alongside [`Error::Operation`]
/// and [`Error::DuplicateKey`].
#[derive(Debug, Clone)]
pub struct CommandError {
    pub message: String,
    pub code: Option<i32>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Error codes that classify an `OperationFailure` as a duplicate-key error.
pub const DUPLICATE_KEY_CODES: [i32; 3] = [11000, 11001, 12582];

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Bad URI, impossible option combination, mismatched replica-set name,
    /// mixed mongod/router seed list, arbiter via direct connect, or a
    /// duplicate authentication attempt on a source.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Generic inability to communicate with the deployment.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A network-level failure for which transparent retry by the caller is
    /// reasonable.
    #[error("{0}")]
    AutoReconnect(String),

    /// The wait queue for a pool permit was exceeded.
    #[error("Timed out waiting for socket from pool with max_pool_size {max_pool_size} and wait_queue_timeout {wait_queue_timeout_ms:?}ms")]
    WaitQueueTimeout {
        max_pool_size: u32,
        wait_queue_timeout_ms: Option<u64>,
    },

    /// The server returned a non-network error.
    #[error("operation failure: {0}")]
    Operation(CommandError),

    /// An `OperationFailure` whose code is a well-known duplicate-key code.
    #[error("duplicate key error: {0}")]
    DuplicateKey(CommandError),

    /// A document exceeded the negotiated `max_bson_size` and was never sent.
    #[error("BSON document too large ({size} bytes) - the connected server supports BSON document sizes up to {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },

    /// An unrecognized URI scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

impl Error {
    /// Build an [`Error::Operation`] or [`Error::DuplicateKey`] from a raw
    /// server error message and optional code, as seen in a `lastError`
    /// response or a command reply's top-level error fields.
    pub fn from_command_error(message: impl Into<String>, code: Option<i32>) -> Error {
        let err = CommandError {
            message: message.into(),
            code,
        };
        match code {
            Some(c) if DUPLICATE_KEY_CODES.contains(&c) => Error::DuplicateKey(err),
            _ => Error::Operation(err),
        }
    }

    /// True if the server-reported error text marks a stepped-down primary.
    pub fn is_not_master(message: &str) -> bool {
        message.starts_with("not master")
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::AutoReconnect(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
