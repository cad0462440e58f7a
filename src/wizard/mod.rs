//! Scanner for the installer's interactive wizard dialogue.
//!
//! The installer lists the node's network interfaces, asks which one the
//! cluster should advertise, asks for confirmation and finally prints the URL
//! of the web wizard. [`configure_wizard`] reads that dialogue line by line,
//! answers the prompts and returns the URL rewritten to the bootstrap node's
//! public address.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::provisioner::{Node, Provisioner, ProvisionerError};
use crate::status::compile;

pub mod extract;

pub use extract::{
    ExtractError, INSTALLER_PATH_PREFIX, Locator, extract_installer_url, extract_locator,
    rewrite_host,
};

const INTERFACES_MARKER: &str = "[interfaces]";
const SELECT_PROMPT: &str = "select interface number";
const CONFIRM_PROMPT: &str = "confirm (yes/no)";
const URL_MARKER: &str = "OPEN THIS IN BROWSER";
const SEPARATOR: &str = "---";
const CONFIRMATION: &[u8] = b"yes\n";

static INTERFACE_LINE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\s*(?P<index>\d+)\.\s+(?P<addr>\d+\.\d+\.\d+\.\d+)"));

/// Errors raised while driving the wizard dialogue.
#[derive(Debug, Error)]
pub enum WizardError {
    /// Raised when the installer asks for an interface without listing any.
    #[error("installer asked to select an interface but listed none")]
    NoInterfaces,
    /// Raised when the provisioner picks an index outside the list.
    #[error("selected interface {index} but only {available} are listed")]
    InvalidSelection {
        /// Zero-based index returned by the provisioner.
        index: usize,
        /// Number of listed interfaces.
        available: usize,
    },
    /// Raised when the provisioner cannot choose an interface.
    #[error(transparent)]
    Select(#[from] ProvisionerError),
    /// Raised when reading installer output fails.
    #[error("failed to read installer output: {0}")]
    Read(#[source] std::io::Error),
    /// Raised when answering a prompt fails.
    #[error("failed to answer the '{prompt}' prompt: {source}")]
    Write {
        /// Prompt being answered.
        prompt: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Raised when the wizard URL cannot be interpreted.
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// Raised when output ends before the wizard URL appears.
    #[error("wizard URL not found; inspect the installer output for errors")]
    UrlNotFound,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScannerState {
    Idle,
    ReadingInterfaces,
}

/// Drives the installer dialogue on `output`, writing answers to `input`.
///
/// Interface selection is delegated to `provisioner`; the chosen entry is
/// answered with its one-based number. Returns the wizard URL with its host
/// replaced by `bootstrap.public_addr`.
///
/// # Errors
///
/// Returns [`WizardError::NoInterfaces`] when the selection prompt arrives
/// with an empty interface list, [`WizardError::UrlNotFound`] when output
/// ends without a URL, and I/O or extraction errors as they occur.
pub async fn configure_wizard<R, W, P>(
    output: R,
    input: &mut W,
    provisioner: &P,
    bootstrap: &Node,
) -> Result<Url, WizardError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    P: Provisioner + ?Sized,
{
    let mut lines = output.lines();
    let mut state = ScannerState::Idle;
    let mut addrs: Vec<IpAddr> = Vec::new();

    while let Some(line) = lines.next_line().await.map_err(WizardError::Read)? {
        if state == ScannerState::ReadingInterfaces {
            if line.starts_with(SEPARATOR) {
                continue;
            }
            if let Some(addr) = parse_interface(&line) {
                addrs.push(addr);
                continue;
            }
            debug!(interfaces = addrs.len(), "interface list complete");
            state = ScannerState::Idle;
        }

        if line.starts_with(INTERFACES_MARKER) {
            addrs.clear();
            state = ScannerState::ReadingInterfaces;
        } else if line.starts_with(SELECT_PROMPT) {
            let index = select(provisioner, bootstrap, &addrs)?;
            if let Some(addr) = addrs.get(index) {
                info!(%addr, choice = index + 1, "selecting interface");
            }
            answer(input, SELECT_PROMPT, format!("{}\n", index + 1).as_bytes()).await?;
        } else if line.starts_with(CONFIRM_PROMPT) {
            answer(input, CONFIRM_PROMPT, CONFIRMATION).await?;
        } else if line.starts_with(URL_MARKER) {
            let url = extract_installer_url(&line, bootstrap.public_addr)?;
            info!(%url, "wizard is ready");
            return Ok(url);
        }
    }

    Err(WizardError::UrlNotFound)
}

fn parse_interface(line: &str) -> Option<IpAddr> {
    INTERFACE_LINE
        .captures(line)
        .and_then(|captures| captures.name("addr"))
        .and_then(|addr| addr.as_str().parse().ok())
}

fn select<P>(provisioner: &P, bootstrap: &Node, addrs: &[IpAddr]) -> Result<usize, WizardError>
where
    P: Provisioner + ?Sized,
{
    if addrs.is_empty() {
        return Err(WizardError::NoInterfaces);
    }
    let index = provisioner.select_interface(bootstrap, addrs)?;
    if index >= addrs.len() {
        return Err(WizardError::InvalidSelection {
            index,
            available: addrs.len(),
        });
    }
    Ok(index)
}

async fn answer<W>(input: &mut W, prompt: &'static str, reply: &[u8]) -> Result<(), WizardError>
where
    W: AsyncWrite + Unpin,
{
    let write_error = |source| WizardError::Write { prompt, source };
    input.write_all(reply).await.map_err(write_error)?;
    input.flush().await.map_err(write_error)
}
