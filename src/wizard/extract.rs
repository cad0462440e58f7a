//! Values carried by the installer's wizard URL.

use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::status::compile;

/// Path prefix under which the installer serves the wizard.
pub const INSTALLER_PATH_PREFIX: &str = "/web/installer/new/";

static WIZARD_URL: LazyLock<Regex> =
    LazyLock::new(|| compile(r"OPEN THIS IN BROWSER: (?P<url>.+)$"));

/// Identifies the application package being installed.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Locator {
    /// Package repository.
    pub repository: String,
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

/// Errors raised while interpreting the wizard URL.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExtractError {
    /// Raised when the path is not `/web/installer/new/<repo>/<name>/<version>`.
    #[error(
        "invalid installer path '{path}': \
         expected /web/installer/new/<repository>/<name>/<version>"
    )]
    InvalidPath {
        /// Offending path.
        path: String,
    },
    /// Raised when a line does not announce the wizard URL.
    #[error("no wizard URL in '{line}'")]
    MissingUrl {
        /// Offending line.
        line: String,
    },
    /// Raised when the announced URL cannot be parsed.
    #[error("invalid wizard URL '{url}': {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser error.
        message: String,
    },
    /// Raised when the URL does not name its port explicitly.
    #[error("wizard URL '{url}' has no explicit port")]
    MissingPort {
        /// Offending URL.
        url: String,
    },
    /// Raised when the URL host cannot be replaced.
    #[error("cannot replace the host of '{url}'")]
    HostRewrite {
        /// Offending URL.
        url: String,
    },
}

/// Splits an installer path into its package [`Locator`].
///
/// # Errors
///
/// Returns [`ExtractError::InvalidPath`] unless the path is the installer
/// prefix followed by exactly three non-empty segments.
pub fn extract_locator(path: &str) -> Result<Locator, ExtractError> {
    let invalid = || ExtractError::InvalidPath {
        path: path.to_owned(),
    };
    let rest = path.strip_prefix(INSTALLER_PATH_PREFIX).ok_or_else(invalid)?;
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [repository, name, version]
            if !repository.is_empty() && !name.is_empty() && !version.is_empty() =>
        {
            Ok(Locator {
                repository: (*repository).to_owned(),
                name: (*name).to_owned(),
                version: (*version).to_owned(),
            })
        }
        _ => Err(invalid()),
    }
}

/// Replaces the host of `url` with `public_ip`, keeping scheme, port, path
/// and query.
///
/// # Errors
///
/// Returns [`ExtractError::MissingPort`] when `url` has no explicit port and
/// [`ExtractError::HostRewrite`] when the URL cannot carry a host.
pub fn rewrite_host(url: &Url, public_ip: IpAddr) -> Result<Url, ExtractError> {
    if url.port().is_none() {
        return Err(ExtractError::MissingPort {
            url: url.to_string(),
        });
    }
    let mut rewritten = url.clone();
    rewritten
        .set_ip_host(public_ip)
        .map_err(|()| ExtractError::HostRewrite {
            url: url.to_string(),
        })?;
    Ok(rewritten)
}

/// Extracts the wizard URL from an installer line and points it at
/// `public_ip`.
///
/// # Errors
///
/// Returns [`ExtractError::MissingUrl`] when the line does not announce the
/// URL, plus any error from URL parsing or [`rewrite_host`].
pub fn extract_installer_url(line: &str, public_ip: IpAddr) -> Result<Url, ExtractError> {
    let trimmed = line.trim_end();
    let raw = WIZARD_URL
        .captures(trimmed)
        .and_then(|captures| captures.name("url"))
        .map(|m| m.as_str().trim())
        .ok_or_else(|| ExtractError::MissingUrl {
            line: trimmed.to_owned(),
        })?;
    let url = Url::parse(raw).map_err(|err| ExtractError::InvalidUrl {
        url: raw.to_owned(),
        message: err.to_string(),
    })?;
    rewrite_host(&url, public_ip)
}
