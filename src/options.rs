//! Component F: immutable configuration, derived from URI + keyword
//! overrides (§4.F).

use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound accepted for millisecond-valued timeout options, per §8's
/// boundary behavior (`socketTimeoutMS > 10^9` is a configuration error).
const MAX_TIMEOUT_MS: i64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_pool_size: u32,
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
    pub wait_queue_timeout: Option<Duration>,
    pub wait_queue_multiple: Option<u32>,
    pub socket_keepalive: bool,
    /// How long an idle socket can go since its last checkout before
    /// `get_socket` bothers probing it for liveness again. A socket checked
    /// out more recently than this is assumed still good, per §4.B `_check`.
    pub socket_check_interval: Duration,
    pub tls: bool,
    pub tls_verify_peer: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_pool_size: 100,
            connect_timeout: Duration::from_secs(20),
            socket_timeout: None,
            wait_queue_timeout: None,
            wait_queue_multiple: None,
            socket_keepalive: false,
            socket_check_interval: Duration::from_secs(1),
            tls: false,
            tls_verify_peer: true,
        }
    }
}

impl PoolOptions {
    /// Maximum number of waiters allowed in the wait queue, if bounded.
    pub fn max_waiters(&self) -> Option<u32> {
        self.wait_queue_multiple
            .map(|multiple| self.max_pool_size * multiple)
    }
}

/// Write-concern passthrough fields (`w`, `wtimeout`, `j`, `fsync`). The
/// core does not interpret these; it only carries them for the
/// acknowledgement-message assembly that lives outside this crate.
#[derive(Debug, Clone, Default)]
pub struct WriteConcern {
    pub w: Option<String>,
    pub wtimeout: Option<Duration>,
    pub journal: Option<bool>,
    pub fsync: Option<bool>,
}

/// Immutable configuration record for a [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub pool: PoolOptions,
    pub replica_set_name: Option<String>,
    pub read_preference_tag: Option<String>,
    pub write_concern: WriteConcern,
    pub auto_start_request: bool,
    pub default_database: Option<String>,
    /// Options recognized by the URI/keyword layer but not interpreted by
    /// this crate (forwarded verbatim to collaborators outside its scope).
    pub raw_options: Vec<(String, String)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            pool: PoolOptions::default(),
            replica_set_name: None,
            read_preference_tag: None,
            write_concern: WriteConcern::default(),
            auto_start_request: false,
            default_database: None,
            raw_options: Vec::new(),
        }
    }
}

impl ClientOptions {
    /// Apply a single `key=value` query-string option, as parsed from a
    /// connection URI or supplied as a keyword override. Returns
    /// `Err(Error::Configuration(_))` for a recognized-but-invalid value.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "connectTimeoutMS" => {
                self.pool.connect_timeout = Duration::from_millis(parse_timeout_ms(value)?);
            }
            "socketTimeoutMS" => {
                self.pool.socket_timeout = Some(Duration::from_millis(parse_timeout_ms(value)?));
            }
            "waitQueueTimeoutMS" => {
                self.pool.wait_queue_timeout =
                    Some(Duration::from_millis(parse_timeout_ms(value)?));
            }
            "waitQueueMultiple" => {
                self.pool.wait_queue_multiple = Some(parse_positive_int(value)?);
            }
            "maxPoolSize" | "max_pool_size" => {
                self.pool.max_pool_size = parse_positive_int(value)?;
            }
            "socketKeepAlive" => {
                self.pool.socket_keepalive = parse_bool(value)?;
            }
            "socketCheckIntervalMS" => {
                self.pool.socket_check_interval = Duration::from_millis(parse_timeout_ms(value)?);
            }
            "ssl" => {
                self.pool.tls = parse_bool(value)?;
            }
            "ssl_cert_reqs" => {
                self.pool.tls = true;
                self.pool.tls_verify_peer = value != "CERT_NONE";
            }
            "replicaSet" => {
                self.replica_set_name = Some(value.to_string());
            }
            "read_preference" => {
                self.read_preference_tag = Some(value.to_string());
            }
            "w" => self.write_concern.w = Some(value.to_string()),
            "wtimeout" | "wtimeoutMS" => {
                self.write_concern.wtimeout = Some(Duration::from_millis(parse_timeout_ms(value)?));
            }
            "j" | "journal" => self.write_concern.journal = Some(parse_bool(value)?),
            "fsync" => self.write_concern.fsync = Some(parse_bool(value)?),
            "auto_start_request" => self.auto_start_request = parse_bool(value)?,
            _ => self.raw_options.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }
}

fn parse_timeout_ms(value: &str) -> Result<u64> {
    let parsed: i64 = value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid timeout value: {}", value)))?;
    if parsed <= 0 || parsed > MAX_TIMEOUT_MS {
        return Err(Error::Configuration(format!(
            "timeout value out of range: {}",
            value
        )));
    }
    Ok(parsed as u64)
}

fn parse_positive_int(value: &str) -> Result<u32> {
    value
        .parse()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::Configuration(format!("invalid positive integer: {}", value)))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Configuration(format!("invalid boolean: {}", value))),
    }
}
