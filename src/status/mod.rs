//! Cluster status reports.
//!
//! The installer prints its status either as a JSON document or as
//! human-readable `Key: value` text with one line per node. [`parse_status`]
//! accepts both and normalises them into a [`ClusterStatus`].

use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dd;

pub use dd::{parse_dd_output, parse_dd_speed};

/// Number of leading bytes inspected to detect a JSON document.
pub const PEEK_LIMIT: u64 = 1024;

const EXCERPT_LIMIT: usize = 160;

static STATUS_KV: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(?P<key>[\w\s]+):\s*(?P<val>[\w.-]+),*.*"));
static STATUS_NODE_IP: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^[\s\w*-]+\((?P<ip>[\d.]+)\).*"));

#[expect(clippy::expect_used, reason = "patterns are string literals covered by tests")]
pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern must compile")
}

/// Application installed on the cluster.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Application {
    /// Application package name.
    #[serde(default)]
    pub name: String,
}

/// Token other nodes use to join the cluster.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JoinToken {
    /// Token value.
    #[serde(default)]
    pub token: String,
}

/// Cluster member as reported by the installer.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterServer {
    /// Address the member advertises to the rest of the cluster.
    #[serde(default, rename = "advertise_ip")]
    pub advertise_ip: String,
}

/// Normalised cluster status.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterStatus {
    /// Cluster name.
    #[serde(default, rename = "domain")]
    pub name: String,
    /// Installed application.
    #[serde(default, rename = "app")]
    pub application: Application,
    /// Cluster state, e.g. `active`.
    #[serde(default, rename = "state")]
    pub status: String,
    /// Join token.
    #[serde(default)]
    pub token: JoinToken,
    /// Cluster members.
    #[serde(default)]
    pub nodes: Vec<ClusterServer>,
}

impl ClusterStatus {
    /// Folds a newer report into this one.
    ///
    /// Non-empty values in `newer` win. A known join token is never replaced
    /// by an empty one, and the node list is only replaced by a non-empty
    /// list.
    pub fn merge(&mut self, newer: Self) {
        let Self {
            name,
            application,
            status,
            token,
            nodes,
        } = newer;
        if !name.is_empty() {
            self.name = name;
        }
        if !application.name.is_empty() {
            self.application = application;
        }
        if !status.is_empty() {
            self.status = status;
        }
        if !token.token.is_empty() {
            self.token = token;
        }
        if !nodes.is_empty() {
            self.nodes = nodes;
        }
    }

    /// Returns `true` once a join token is known.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.token.token.is_empty()
    }
}

/// Errors raised while parsing installer output.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StatusError {
    /// Raised when reading the status stream fails.
    #[error("failed to read status output: {0}")]
    Io(String),
    /// Raised when a JSON status document is malformed.
    #[error("failed to decode status JSON: {message}; input starts with: {excerpt}")]
    Json {
        /// Decoder error.
        message: String,
        /// Leading part of the offending input.
        excerpt: String,
    },
    /// Raised when `dd` output does not have the expected shape.
    #[error("expected 3 lines of dd output but got {count}: {output}")]
    DdLineCount {
        /// Number of lines found.
        count: usize,
        /// The full output.
        output: String,
    },
    /// Raised when a line carries no transfer speed.
    #[error("no transfer speed found in '{line}'")]
    DdSpeed {
        /// Offending line.
        line: String,
    },
    /// Raised when the speed value is not a number.
    #[error("invalid transfer speed value '{value}'")]
    DdValue {
        /// Offending value.
        value: String,
    },
    /// Raised when the speed unit is not one of kB/s, MB/s or GB/s.
    #[error("unsupported transfer speed unit '{unit}'")]
    DdUnit {
        /// Offending unit.
        unit: String,
    },
}

impl From<io::Error> for StatusError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Parses an installer status report in either JSON or text form.
///
/// Only the first [`PEEK_LIMIT`] bytes are buffered to choose the format;
/// the rest is streamed.
///
/// # Errors
///
/// Returns [`StatusError::Json`] for malformed JSON documents and
/// [`StatusError::Io`] when the reader fails. Unrecognised text lines are
/// ignored.
pub fn parse_status<R: Read>(mut reader: R) -> Result<ClusterStatus, StatusError> {
    let mut prefix = Vec::new();
    reader.by_ref().take(PEEK_LIMIT).read_to_end(&mut prefix)?;

    if looks_like_json(&prefix) {
        let excerpt = excerpt_of(&prefix);
        let stream = Cursor::new(prefix).chain(reader);
        return decode_json(stream, excerpt);
    }

    let stream = BufReader::new(Cursor::new(prefix).chain(reader));
    parse_text(stream)
}

fn looks_like_json(prefix: &[u8]) -> bool {
    prefix
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'{')
}

fn excerpt_of(prefix: &[u8]) -> String {
    String::from_utf8_lossy(prefix)
        .trim()
        .chars()
        .take(EXCERPT_LIMIT)
        .collect()
}

fn decode_json<R: Read>(stream: R, excerpt: String) -> Result<ClusterStatus, StatusError> {
    let json_error = |message: String| StatusError::Json {
        message,
        excerpt: excerpt.clone(),
    };
    serde_json::Deserializer::from_reader(stream)
        .into_iter::<ClusterStatus>()
        .next()
        .ok_or_else(|| json_error(String::from("empty document")))?
        .map_err(|err| json_error(err.to_string()))
}

fn parse_text<R: BufRead>(stream: R) -> Result<ClusterStatus, StatusError> {
    let mut status = ClusterStatus::default();
    for raw in stream.split(b'\n') {
        let bytes = raw?;
        let decoded = String::from_utf8_lossy(&bytes);
        let line = decoded.trim_end_matches('\r');

        if let Some(captures) = STATUS_KV.captures(line) {
            let key = captures.name("key").map_or("", |m| m.as_str().trim());
            let value = captures.name("val").map_or("", |m| m.as_str());
            apply_field(&mut status, key, value);
        } else if let Some(ip) = STATUS_NODE_IP
            .captures(line)
            .and_then(|captures| captures.name("ip"))
        {
            status.nodes.push(ClusterServer {
                advertise_ip: ip.as_str().to_owned(),
            });
        }
    }
    Ok(status)
}

fn apply_field(status: &mut ClusterStatus, key: &str, value: &str) {
    let slot = match key {
        "Cluster" => &mut status.name,
        "Join token" => &mut status.token.token,
        "Application" => &mut status.application.name,
        "Status" | "Application Status" => &mut status.status,
        _ => return,
    };
    value.clone_into(slot);
}
