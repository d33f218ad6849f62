//! Connection URI parsing (§6).
//!
//! Full BSON-aware URI semantics (auth mechanism properties beyond
//! username/password, read/write-concern documents) are out of scope; this
//! module extracts exactly what [`crate::options::ClientOptions`] and the
//! seed list need, grounded on `pymongo.uri_parser`.

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::socket::Address;

pub const DEFAULT_PORT: u16 = 27017;

/// The parsed result of one or more connection strings/bare host lists,
/// unioned together (§6: "If multiple URIs are supplied... all hosts are
/// unioned into the seed set").
#[derive(Debug, Clone, Default)]
pub struct ParsedUri {
    pub seeds: Vec<Address>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub options: ClientOptions,
}

/// Parse one or more host specifications -- each either a full
/// `mongodb://...` URI or a bare comma-separated `host[:port]` list -- and
/// union the results. The last URI's database/username/password/options win
/// per §6.
pub fn parse(entries: &[&str], default_port: u16) -> Result<ParsedUri> {
    let mut result = ParsedUri::default();
    let mut seeds = Vec::new();

    for entry in entries {
        if let Some(rest) = entry.strip_prefix("mongodb://") {
            let parsed = parse_mongodb_uri(rest, default_port)?;
            seeds.extend(parsed.seeds);
            if parsed.username.is_some() {
                result.username = parsed.username;
            }
            if parsed.password.is_some() {
                result.password = parsed.password;
            }
            if parsed.database.is_some() {
                result.database = parsed.database;
            }
            result.options = parsed.options;
        } else if entry.contains("://") {
            let scheme_end = entry.find("://").unwrap();
            return Err(Error::InvalidUri(format!(
                "unrecognized URI scheme: {}",
                &entry[..scheme_end]
            )));
        } else {
            seeds.extend(split_hosts(entry, default_port)?);
        }
    }

    if seeds.is_empty() {
        return Err(Error::Configuration(
            "need to specify at least one host".to_string(),
        ));
    }

    result.seeds = dedup_addresses(seeds);
    Ok(result)
}

fn dedup_addresses(mut addrs: Vec<Address>) -> Vec<Address> {
    let mut seen = std::collections::HashSet::new();
    addrs.retain(|a| seen.insert(a.clone()));
    addrs
}

fn parse_mongodb_uri(rest: &str, default_port: u16) -> Result<ParsedUri> {
    // rest is everything after "mongodb://": [user[:pass]@]hostlist[/db][?opts]
    let (before_query, query) = match rest.find('?') {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    let (before_db, database) = match before_query.find('/') {
        Some(idx) => {
            let db = &before_query[idx + 1..];
            (
                &before_query[..idx],
                if db.is_empty() {
                    None
                } else {
                    Some(db.to_string())
                },
            )
        }
        None => (before_query, None),
    };

    let (userinfo, hostlist) = match before_db.rfind('@') {
        Some(idx) => (Some(&before_db[..idx]), &before_db[idx + 1..]),
        None => (None, before_db),
    };

    let (username, password) = match userinfo {
        Some(info) => match info.find(':') {
            Some(idx) => (
                Some(decode(&info[..idx])?),
                Some(decode(&info[idx + 1..])?),
            ),
            None => (Some(decode(info)?), None),
        },
        None => (None, None),
    };

    let seeds = split_hosts(hostlist, default_port)?;

    let mut options = ClientOptions::default();
    if let Some(query) = query {
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            options.apply(key, &decode(value)?)?;
        }
    }

    Ok(ParsedUri {
        seeds,
        username,
        password,
        database,
        options,
    })
}

fn decode(value: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidUri(e.to_string()))
}

/// Split a comma-separated `host[:port]` list into addresses, honoring
/// bracketed IPv6 literals (`[::1]:27017`) and `.sock`-suffixed Unix-domain
/// paths.
pub fn split_hosts(hosts: &str, default_port: u16) -> Result<Vec<Address>> {
    if hosts.is_empty() {
        return Ok(Vec::new());
    }
    hosts.split(',').map(|h| parse_host(h, default_port)).collect()
}

pub(crate) fn parse_host(host: &str, default_port: u16) -> Result<Address> {
    let host = host.trim();
    if host.ends_with(".sock") {
        return Ok(Address::Unix(host.to_string()));
    }

    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by :port.
        let close = rest
            .find(']')
            .ok_or_else(|| Error::InvalidUri(format!("unterminated IPv6 literal: {}", host)))?;
        let addr = &rest[..close];
        let remainder = &rest[close + 1..];
        let port = if let Some(p) = remainder.strip_prefix(':') {
            parse_port(p)?
        } else {
            default_port
        };
        return Ok(Address::Tcp(addr.to_string(), port));
    }

    match host.rfind(':') {
        Some(idx) => {
            let (name, port) = (&host[..idx], &host[idx + 1..]);
            Ok(Address::Tcp(name.to_string(), parse_port(port)?))
        }
        None => Ok(Address::Tcp(host.to_string(), default_port)),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid port: {}", value)))
}
