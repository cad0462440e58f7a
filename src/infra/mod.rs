//! Infrastructure facade.
//!
//! An [`Infra`] is either *local*, backed by a [`Provisioner`] that creates
//! nodes and drives the installer wizard on them, or *remote*, pointing at
//! an already running Ops Center. Both variants can be captured in an
//! [`InfraSnapshot`] and restored in a later run.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::command::CommandRunner;
use crate::provisioner::{BackendKind, Node, Provisioner, ProvisionerError, ProvisionerState};
use crate::retry::{RetryError, RetryPolicy, cancel_after};
use crate::ssh::{RemoteCommand, SshClient, SshError, WizardSession};
use crate::wizard::{ExtractError, Locator, WizardError, configure_wizard, extract_locator};

/// Default time budget for bringing up the wizard.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default delay between SSH readiness probes.
pub const DEFAULT_SSH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Path of the Ops Center portal relative to its entry URL.
pub const PORTAL_PATH: &str = "web/portal";

/// Which flavour of infrastructure is in use.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraKind {
    /// Nodes created by a provisioner.
    Local,
    /// An existing Ops Center reached by URL.
    Remote,
}

impl fmt::Display for InfraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

impl FromStr for InfraKind {
    type Err = InfraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(InfraError::UnknownKind {
                name: other.to_owned(),
            }),
        }
    }
}

/// Persistent record of an infrastructure.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InfraSnapshot {
    /// Infrastructure flavour.
    pub infra: InfraKind,
    /// Display name.
    pub name: String,
    /// Ops Center entry URL, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_center_url: Option<Url>,
    /// Wizard URL obtained during bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wizard_url: Option<Url>,
    /// Application package announced by the wizard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<Locator>,
    /// Backend that owns the nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    /// Backend state needed to reattach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_state: Option<ProvisionerState>,
}

impl InfraSnapshot {
    /// Checks that the recorded backend and provisioner state agree.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InvalidSnapshot`] when a remote snapshot carries
    /// backend data, and [`InfraError::StateMismatch`] when the state was
    /// produced by a different backend than the one recorded.
    pub fn validate(&self) -> Result<(), InfraError> {
        match (self.infra, self.backend, &self.provisioner_state) {
            (InfraKind::Remote, None, None) => Ok(()),
            (InfraKind::Remote, _, _) => Err(InfraError::InvalidSnapshot(String::from(
                "remote infrastructure must not record provisioner state",
            ))),
            (InfraKind::Local, Some(kind), Some(state)) if state.kind() == kind => Ok(()),
            (InfraKind::Local, Some(kind), Some(state)) => Err(InfraError::StateMismatch {
                expected: kind,
                found: state.kind(),
            }),
            (InfraKind::Local, _, _) => Err(InfraError::InvalidSnapshot(String::from(
                "local infrastructure must record both backend and provisioner state",
            ))),
        }
    }
}

/// Settings for the bootstrap flow.
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    /// Budget for SSH readiness probes.
    pub ssh_retry: RetryPolicy,
    /// Overall deadline for reaching the wizard URL.
    pub timeout: Duration,
    /// External cancellation, e.g. on interrupt.
    pub cancel: CancellationToken,
    /// Whether installer output is echoed locally.
    pub echo: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            ssh_retry: RetryPolicy::default().with_delay(DEFAULT_SSH_RETRY_DELAY),
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            cancel: CancellationToken::new(),
            echo: true,
        }
    }
}

/// Errors raised by the infrastructure facade.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Raised for an unrecognised infrastructure flavour.
    #[error("unknown infrastructure kind '{name}'; expected local or remote")]
    UnknownKind {
        /// Name supplied by the caller.
        name: String,
    },
    /// Raised when a snapshot is internally inconsistent.
    #[error("invalid infrastructure snapshot: {0}")]
    InvalidSnapshot(String),
    /// Raised when provisioner state belongs to another backend.
    #[error("snapshot records a {expected} backend but holds {found} state")]
    StateMismatch {
        /// Backend recorded in the snapshot.
        expected: BackendKind,
        /// Backend that produced the state.
        found: BackendKind,
    },
    /// Raised when an operation needs a provisioner but the infra is remote.
    #[error("remote infrastructure has no provisioner")]
    NoProvisioner,
    /// Raised by the provisioner.
    #[error(transparent)]
    Provisioner(#[from] ProvisionerError),
    /// Raised when the bootstrap node never accepts SSH connections.
    #[error("bootstrap node is not reachable over SSH: {0}")]
    Connect(#[source] RetryError<SshError>),
    /// Raised by SSH operations.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised while driving the wizard dialogue.
    #[error(transparent)]
    Wizard(#[from] WizardError),
    /// Raised when the wizard URL does not identify an application.
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// Raised when the wizard URL does not appear before the deadline.
    #[error("wizard did not start within {} seconds", .0.as_secs())]
    BootstrapTimeout(Duration),
    /// Raised when a URL cannot be derived.
    #[error("cannot derive URL from '{base}': {message}")]
    Url {
        /// Base URL.
        base: String,
        /// Parser error.
        message: String,
    },
}

/// Local or remote infrastructure hosting the cluster under test.
#[derive(Debug)]
pub struct Infra<P> {
    kind: InfraKind,
    name: String,
    ops_center_url: Option<Url>,
    wizard_url: Option<Url>,
    application: Option<Locator>,
    installer_path: Option<Utf8PathBuf>,
    provisioner: Option<P>,
    session: Option<WizardSession>,
}

impl<P: Provisioner> Infra<P> {
    /// Creates local infrastructure; nodes are created by [`Infra::init`].
    /// The installer wizard is started only when `installer_path` is set.
    #[must_use]
    pub fn local(
        name: impl Into<String>,
        provisioner: P,
        installer_path: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            kind: InfraKind::Local,
            name: name.into(),
            ops_center_url: None,
            wizard_url: None,
            application: None,
            installer_path,
            provisioner: Some(provisioner),
            session: None,
        }
    }

    /// Creates remote infrastructure pointing at an existing Ops Center.
    #[must_use]
    pub fn remote(name: impl Into<String>, ops_center_url: Url) -> Self {
        Self {
            kind: InfraKind::Remote,
            name: name.into(),
            ops_center_url: Some(ops_center_url),
            wizard_url: None,
            application: None,
            installer_path: None,
            provisioner: None,
            session: None,
        }
    }

    /// Restores infrastructure from a snapshot. Local snapshots require the
    /// reattached `provisioner`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError`] when the snapshot is inconsistent or a local
    /// snapshot comes without a provisioner.
    pub fn from_snapshot(
        snapshot: InfraSnapshot,
        provisioner: Option<P>,
    ) -> Result<Self, InfraError> {
        snapshot.validate()?;
        if snapshot.infra == InfraKind::Local && provisioner.is_none() {
            return Err(InfraError::NoProvisioner);
        }
        Ok(Self {
            kind: snapshot.infra,
            name: snapshot.name,
            ops_center_url: snapshot.ops_center_url,
            wizard_url: snapshot.wizard_url,
            application: snapshot.application,
            installer_path: None,
            provisioner: if snapshot.infra == InfraKind::Local {
                provisioner
            } else {
                None
            },
            session: None,
        })
    }

    /// Returns the infrastructure flavour.
    #[must_use]
    pub const fn kind(&self) -> InfraKind {
        self.kind
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the Ops Center entry URL, when known.
    #[must_use]
    pub const fn ops_center_url(&self) -> Option<&Url> {
        self.ops_center_url.as_ref()
    }

    /// Replaces the Ops Center entry URL.
    pub fn set_ops_center_url(&mut self, url: Url) {
        self.ops_center_url = Some(url);
    }

    /// Returns the wizard URL obtained during bootstrap.
    #[must_use]
    pub const fn wizard_url(&self) -> Option<&Url> {
        self.wizard_url.as_ref()
    }

    /// Returns the application announced by the wizard.
    #[must_use]
    pub const fn application(&self) -> Option<&Locator> {
        self.application.as_ref()
    }

    /// Returns the provisioner of local infrastructure.
    #[must_use]
    pub const fn provisioner(&self) -> Option<&P> {
        self.provisioner.as_ref()
    }

    /// Returns `true` while the installer started by [`Infra::init`] is
    /// still running.
    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.session.as_ref().is_some_and(WizardSession::is_active)
    }

    /// Returns every node of local infrastructure; empty for remote.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.provisioner.as_ref().map_or_else(Vec::new, P::nodes)
    }

    /// Points the Ops Center URL at the portal behind `entry`, dropping any
    /// query string.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Url`] when `entry` is not a valid base URL.
    pub fn set_portal_url(&mut self, entry: &str) -> Result<(), InfraError> {
        let url = with_path(entry, PORTAL_PATH)?;
        info!(%url, "ops center URL updated");
        self.ops_center_url = Some(url);
        Ok(())
    }

    /// Returns the Ops Center page of cluster `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Url`] when no Ops Center URL is known.
    pub fn cluster_url(&self, cluster: &str) -> Result<Url, InfraError> {
        let base = self.ops_center_url.as_ref().ok_or_else(|| InfraError::Url {
            base: String::new(),
            message: String::from("no ops center URL is known"),
        })?;
        with_path(base.as_str(), &format!("web/site/{cluster}"))
    }

    /// Creates the nodes and, when an installer bundle is configured,
    /// starts the installer and drives its wizard until the URL is known.
    /// Remote infrastructure needs no initialisation.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError`] when provisioning, SSH or the wizard fails, or
    /// when `options.timeout` elapses.
    pub async fn init<R>(
        &mut self,
        ssh: &SshClient<R>,
        options: &BootstrapOptions,
    ) -> Result<(), InfraError>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let with_installer = self.installer_path.is_some();
        let Some(provisioner) = self.provisioner.as_mut() else {
            return Ok(());
        };

        info!(
            name = %self.name,
            backend = %provisioner.kind(),
            with_installer,
            "creating infrastructure"
        );
        let bootstrap = provisioner.create(with_installer).await?;
        if with_installer {
            self.start_wizard(ssh, &bootstrap, options).await?;
        }
        Ok(())
    }

    async fn start_wizard<R>(
        &mut self,
        ssh: &SshClient<R>,
        bootstrap: &Node,
        options: &BootstrapOptions,
    ) -> Result<(), InfraError>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let deadline = cancel_after(&options.cancel, options.timeout);
        let outcome = self.bootstrap_wizard(ssh, bootstrap, options, &deadline).await;
        deadline.cancel();
        outcome
    }

    async fn bootstrap_wizard<R>(
        &mut self,
        ssh: &SshClient<R>,
        bootstrap: &Node,
        options: &BootstrapOptions,
        deadline: &CancellationToken,
    ) -> Result<(), InfraError>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let provisioner = self.provisioner.as_ref().ok_or(InfraError::NoProvisioner)?;
        ssh.wait_until_reachable(bootstrap, options.ssh_retry, deadline)
            .await
            .map_err(|err| match err {
                RetryError::Timeout { .. } if !options.cancel.is_cancelled() => {
                    InfraError::BootstrapTimeout(options.timeout)
                }
                other => InfraError::Connect(other),
            })?;

        let mut session = ssh.session(bootstrap).with_echo(options.echo);
        let outcome = drive_wizard(provisioner, &mut session, bootstrap, deadline, options.timeout)
            .await
            .and_then(|url| Ok((extract_locator(url.path())?, url)));
        match outcome {
            Ok((locator, url)) => {
                session.drain_output();
                self.application = Some(locator);
                self.wizard_url = Some(url);
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    error!(error = %close_err, "failed to close wizard session");
                }
                Err(err)
            }
        }
    }

    /// Waits until the installer started by [`Infra::init`] exits on its
    /// own. Returns at once when no session is open.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Ssh`] when the session cannot be waited on.
    pub async fn wait_for_installer(&mut self) -> Result<(), InfraError> {
        if let Some(session) = self.session.as_mut()
            && let Some(status) = session.wait().await?
        {
            info!(name = %self.name, %status, "installer exited");
        }
        Ok(())
    }

    /// Closes the wizard session, if any. Nodes are left running.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Ssh`] when the session cannot be closed cleanly.
    pub async fn close(&mut self) -> Result<(), InfraError> {
        if let Some(mut session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }

    /// Destroys the nodes of local infrastructure.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::NoProvisioner`] for remote infrastructure and
    /// any error reported by the provisioner.
    pub async fn destroy(&mut self) -> Result<(), InfraError> {
        let provisioner = self.provisioner.as_mut().ok_or(InfraError::NoProvisioner)?;
        provisioner.destroy().await?;
        info!(name = %self.name, "infrastructure destroyed");
        Ok(())
    }

    /// Runs `command` on the allocated nodes, or on every node when none
    /// are allocated.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::NoProvisioner`] for remote infrastructure and
    /// [`InfraError::Ssh`] when the command fails on any node.
    pub async fn distribute<R>(
        &self,
        ssh: &SshClient<R>,
        command: &RemoteCommand,
    ) -> Result<(), InfraError>
    where
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let provisioner = self.provisioner.as_ref().ok_or(InfraError::NoProvisioner)?;
        let allocated = provisioner.allocated_nodes()?;
        let targets = if allocated.is_empty() {
            provisioner.nodes()
        } else {
            allocated
        };
        ssh.distribute(command, &targets).await?;
        Ok(())
    }

    /// Captures the current state for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Provisioner`] when the provisioner cannot
    /// report its state.
    pub fn snapshot(&self) -> Result<InfraSnapshot, InfraError> {
        let recorded = self
            .provisioner
            .as_ref()
            .map(|provisioner| provisioner.state().map(|state| (provisioner.kind(), state)))
            .transpose()?;
        let (backend, provisioner_state) =
            recorded.map_or((None, None), |(kind, state)| (Some(kind), Some(state)));
        Ok(InfraSnapshot {
            infra: self.kind,
            name: self.name.clone(),
            ops_center_url: self.ops_center_url.clone(),
            wizard_url: self.wizard_url.clone(),
            application: self.application.clone(),
            backend,
            provisioner_state,
        })
    }
}

async fn drive_wizard<P>(
    provisioner: &P,
    session: &mut WizardSession,
    bootstrap: &Node,
    deadline: &CancellationToken,
    timeout: Duration,
) -> Result<Url, InfraError>
where
    P: Provisioner + ?Sized,
{
    provisioner.start_install(session)?;
    let (output, input) = session.io()?;
    let scan = configure_wizard(BufReader::new(output), input, provisioner, bootstrap);
    tokio::select! {
        biased;
        () = deadline.cancelled() => {
            warn!(node = %bootstrap.name, "installer wizard did not start before the deadline");
            Err(InfraError::BootstrapTimeout(timeout))
        }
        result = scan => Ok(result?),
    }
}

fn with_path(base: &str, path: &str) -> Result<Url, InfraError> {
    let url_error = |message: String| InfraError::Url {
        base: base.to_owned(),
        message,
    };
    let mut url = Url::parse(base).map_err(|err| url_error(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(url_error(String::from("URL cannot carry a path")));
    }
    url.set_query(None);
    url.set_path(path);
    Ok(url)
}

#[cfg(test)]
mod tests;
