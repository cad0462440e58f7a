//! Infrastructure backends.
//!
//! A [`Provisioner`] creates and destroys the machines an installation runs
//! on. Backends are selected at runtime through [`AnyProvisioner`] and built
//! by a [`ProvisionerFactory`], either fresh from an [`InfraRequest`] or by
//! reattaching to a [`ProvisionerState`] recorded in an earlier run.

mod node;
mod request;
pub mod terraform;
pub mod vagrant;

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{CommandError, CommandRunner};
use crate::ssh::{RemoteCommand, SshError, WizardSession};

pub use node::{DEFAULT_SSH_PORT, Node, NodePool, SshEndpoint};
pub use request::{AwsCredentials, BackendRequest, InfraRequest, TerraformRequest, VagrantRequest};
pub use terraform::TerraformProvisioner;
pub use vagrant::VagrantProvisioner;

/// Boxed future returned by asynchronous provisioner operations.
pub type ProvisionerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionerError>> + Send + 'a>>;

/// Script executed inside the install directory to start the wizard.
pub const INSTALL_SCRIPT: &str = "./install";

/// Supported backend implementations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Declarative-script backend (`terraform`).
    Terraform,
    /// Desktop virtualisation backend (`vagrant`).
    Vagrant,
}

impl BackendKind {
    /// Returns the lowercase identifier used in configuration and snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Terraform => "terraform",
            Self::Vagrant => "vagrant",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ProvisionerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "terraform" => Ok(Self::Terraform),
            "vagrant" => Ok(Self::Vagrant),
            other => Err(ProvisionerError::UnknownBackend {
                name: other.to_owned(),
            }),
        }
    }
}

/// Persistable state shared by the built-in backends.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BackendState {
    /// Per-run directory holding the staged script and backend state.
    pub state_dir: Utf8PathBuf,
    /// Remote directory holding the unpacked installer.
    pub install_dir: String,
    /// Machines created by the backend.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Names of nodes handed out to callers.
    #[serde(default)]
    pub allocated: Vec<String>,
}

/// Backend state tagged with the backend that produced it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProvisionerState {
    /// State recorded by [`TerraformProvisioner`].
    Terraform(BackendState),
    /// State recorded by [`VagrantProvisioner`].
    Vagrant(BackendState),
}

impl ProvisionerState {
    /// Returns the backend that produced this state.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Terraform(_) => BackendKind::Terraform,
            Self::Vagrant(_) => BackendKind::Vagrant,
        }
    }

    /// Returns the recorded backend state.
    #[must_use]
    pub const fn backend_state(&self) -> &BackendState {
        match self {
            Self::Terraform(state) | Self::Vagrant(state) => state,
        }
    }

    /// Unwraps the state if it was produced by `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::StateMismatch`] for any other backend.
    pub fn into_backend_state(
        self,
        expected: BackendKind,
    ) -> Result<BackendState, ProvisionerError> {
        let found = self.kind();
        if found != expected {
            return Err(ProvisionerError::StateMismatch { expected, found });
        }
        match self {
            Self::Terraform(state) | Self::Vagrant(state) => Ok(state),
        }
    }
}

/// Errors surfaced by provisioners and their factories.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionerError {
    /// Raised when the backend name is not recognised.
    #[error("unknown provisioner backend '{name}'; expected terraform or vagrant")]
    UnknownBackend {
        /// Name supplied by the caller.
        name: String,
    },
    /// Raised when settings required for an operation are missing.
    #[error("provisioner configuration error: {0}")]
    Config(String),
    /// Raised when a recorded state belongs to a different backend.
    #[error("cannot reattach a {expected} provisioner to {found} state")]
    StateMismatch {
        /// Backend being reattached.
        expected: BackendKind,
        /// Backend recorded in the state.
        found: BackendKind,
    },
    /// Raised when a backend tool invocation fails.
    #[error("{action} failed: {source}")]
    Command {
        /// Operation being performed, e.g. `terraform apply`.
        action: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when backend tool output cannot be interpreted.
    #[error("failed to interpret {action} output: {message}")]
    Output {
        /// Operation whose output was parsed.
        action: String,
        /// Parser error.
        message: String,
    },
    /// Raised when staging files into the state directory fails.
    #[error("failed to stage {path}: {message}")]
    Staging {
        /// File or directory being staged.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
    /// Raised when every node in the pool is allocated.
    #[error("node pool exhausted: all {total} node(s) are allocated")]
    PoolExhausted {
        /// Pool size.
        total: usize,
    },
    /// Raised when deallocating a node outside the pool.
    #[error("node {name} is not part of the pool")]
    UnknownNode {
        /// Node name.
        name: String,
    },
    /// Raised when deallocating a node that is not allocated.
    #[error("node {name} is not allocated")]
    NotAllocated {
        /// Node name.
        name: String,
    },
    /// Raised when a thread panicked while holding the pool lock.
    #[error("node pool lock poisoned")]
    PoolPoisoned,
    /// Raised when an operation needs nodes that do not exist yet.
    #[error("no nodes provisioned")]
    NotProvisioned,
    /// Raised when no usable interface can be chosen.
    #[error("cannot select a network interface: {0}")]
    InterfaceSelection(String),
    /// Raised when the installer cannot be launched on the bootstrap node.
    #[error("failed to launch installer: {0}")]
    Install(#[source] SshError),
}

/// Infrastructure backend creating and destroying nodes.
pub trait Provisioner: Send + Sync {
    /// Creates the nodes and returns the bootstrap node. When
    /// `with_installer` is set the installer bundle is uploaded as well.
    fn create(&mut self, with_installer: bool) -> ProvisionerFuture<'_, Node>;

    /// Destroys every node created by this provisioner.
    fn destroy(&mut self) -> ProvisionerFuture<'_, ()>;

    /// Reports whether [`Provisioner::destroy`] can run with the settings
    /// this provisioner was built from.
    fn can_destroy(&self) -> bool {
        true
    }

    /// Chooses which of the interfaces listed by the installer the cluster
    /// should advertise. Returns an index into `addrs`; the first address
    /// unless a backend knows better.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::InterfaceSelection`] when no candidate is
    /// acceptable.
    fn select_interface(
        &self,
        _bootstrap: &Node,
        _addrs: &[IpAddr],
    ) -> Result<usize, ProvisionerError> {
        Ok(0)
    }

    /// Launches the installer through `session`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::Install`] when the remote command cannot
    /// be started.
    fn start_install(&self, session: &mut WizardSession) -> Result<(), ProvisionerError>;

    /// Returns every node owned by the provisioner.
    fn nodes(&self) -> Vec<Node>;

    /// Allocates a node for exclusive use by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolExhausted`] when all nodes are in use.
    fn allocate(&self) -> Result<Node, ProvisionerError>;

    /// Returns a node to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or not allocated.
    fn deallocate(&self, node: &Node) -> Result<(), ProvisionerError>;

    /// Returns the nodes currently allocated.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolPoisoned`] if the pool is unusable.
    fn allocated_nodes(&self) -> Result<Vec<Node>, ProvisionerError>;

    /// Identifies the backend.
    fn kind(&self) -> BackendKind;

    /// Captures the state needed to reattach in a later run.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::PoolPoisoned`] if the pool is unusable.
    fn state(&self) -> Result<ProvisionerState, ProvisionerError>;

    /// Restores state captured by [`Provisioner::state`].
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::StateMismatch`] when `state` was produced
    /// by another backend.
    fn update_with_state(&mut self, state: ProvisionerState) -> Result<(), ProvisionerError>;
}

/// Builds provisioners for fresh or recorded infrastructure.
pub trait ProvisionerFactory {
    /// Provisioner type produced by the factory.
    type Provisioner: Provisioner;

    /// Builds a provisioner that will create nodes under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError`] when the request cannot be honoured.
    fn build(
        &self,
        request: &InfraRequest,
        state_dir: &Utf8Path,
    ) -> Result<Self::Provisioner, ProvisionerError>;

    /// Builds a provisioner of `kind` and restores `state` into it.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::StateMismatch`] when the configured
    /// backend, `kind` and `state` disagree.
    fn reattach(
        &self,
        kind: BackendKind,
        state: ProvisionerState,
    ) -> Result<Self::Provisioner, ProvisionerError>;
}

/// Runtime-selected built-in backend.
#[derive(Debug)]
pub enum AnyProvisioner<R> {
    /// Terraform backend.
    Terraform(TerraformProvisioner<R>),
    /// Vagrant backend.
    Vagrant(VagrantProvisioner<R>),
}

impl<R> Provisioner for AnyProvisioner<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    fn create(&mut self, with_installer: bool) -> ProvisionerFuture<'_, Node> {
        match self {
            Self::Terraform(inner) => inner.create(with_installer),
            Self::Vagrant(inner) => inner.create(with_installer),
        }
    }

    fn destroy(&mut self) -> ProvisionerFuture<'_, ()> {
        match self {
            Self::Terraform(inner) => inner.destroy(),
            Self::Vagrant(inner) => inner.destroy(),
        }
    }

    fn can_destroy(&self) -> bool {
        match self {
            Self::Terraform(inner) => inner.can_destroy(),
            Self::Vagrant(inner) => inner.can_destroy(),
        }
    }

    fn select_interface(
        &self,
        bootstrap: &Node,
        addrs: &[IpAddr],
    ) -> Result<usize, ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.select_interface(bootstrap, addrs),
            Self::Vagrant(inner) => inner.select_interface(bootstrap, addrs),
        }
    }

    fn start_install(&self, session: &mut WizardSession) -> Result<(), ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.start_install(session),
            Self::Vagrant(inner) => inner.start_install(session),
        }
    }

    fn nodes(&self) -> Vec<Node> {
        match self {
            Self::Terraform(inner) => inner.nodes(),
            Self::Vagrant(inner) => inner.nodes(),
        }
    }

    fn allocate(&self) -> Result<Node, ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.allocate(),
            Self::Vagrant(inner) => inner.allocate(),
        }
    }

    fn deallocate(&self, node: &Node) -> Result<(), ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.deallocate(node),
            Self::Vagrant(inner) => inner.deallocate(node),
        }
    }

    fn allocated_nodes(&self) -> Result<Vec<Node>, ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.allocated_nodes(),
            Self::Vagrant(inner) => inner.allocated_nodes(),
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Self::Terraform(inner) => inner.kind(),
            Self::Vagrant(inner) => inner.kind(),
        }
    }

    fn state(&self) -> Result<ProvisionerState, ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.state(),
            Self::Vagrant(inner) => inner.state(),
        }
    }

    fn update_with_state(&mut self, state: ProvisionerState) -> Result<(), ProvisionerError> {
        match self {
            Self::Terraform(inner) => inner.update_with_state(state),
            Self::Vagrant(inner) => inner.update_with_state(state),
        }
    }
}

/// Factory for the built-in backends sharing one command runner.
#[derive(Clone, Debug)]
pub struct BackendFactory<R> {
    runner: R,
    configured: Option<BackendRequest>,
    installer_path: Option<Utf8PathBuf>,
}

impl<R> BackendFactory<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    /// Creates a factory without configured backend settings. Reattached
    /// provisioners can report state but not destroy cloud resources.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self {
            runner,
            configured: None,
            installer_path: None,
        }
    }

    /// Supplies the configured backend, used to validate and complete
    /// reattached state.
    #[must_use]
    pub fn with_configured(mut self, request: Option<&InfraRequest>) -> Self {
        self.configured = request.map(|req| req.backend.clone());
        self.installer_path = request.and_then(|req| req.installer_path.clone());
        self
    }
}

impl<R> ProvisionerFactory for BackendFactory<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    type Provisioner = AnyProvisioner<R>;

    fn build(
        &self,
        request: &InfraRequest,
        state_dir: &Utf8Path,
    ) -> Result<Self::Provisioner, ProvisionerError> {
        let installer = request.installer_path.clone();
        Ok(match &request.backend {
            BackendRequest::Terraform(settings) => AnyProvisioner::Terraform(
                TerraformProvisioner::new(settings.clone(), state_dir, self.runner.clone())
                    .with_installer_path(installer),
            ),
            BackendRequest::Vagrant(settings) => AnyProvisioner::Vagrant(
                VagrantProvisioner::new(settings.clone(), state_dir, self.runner.clone())
                    .with_installer_path(installer),
            ),
        })
    }

    fn reattach(
        &self,
        kind: BackendKind,
        state: ProvisionerState,
    ) -> Result<Self::Provisioner, ProvisionerError> {
        if let Some(configured) = &self.configured
            && configured.kind() != kind
        {
            return Err(ProvisionerError::StateMismatch {
                expected: configured.kind(),
                found: kind,
            });
        }
        if state.kind() != kind {
            return Err(ProvisionerError::StateMismatch {
                expected: kind,
                found: state.kind(),
            });
        }

        let installer = self.installer_path.clone();
        let mut provisioner = match (kind, &self.configured) {
            (BackendKind::Terraform, Some(BackendRequest::Terraform(settings))) => {
                AnyProvisioner::Terraform(
                    TerraformProvisioner::new(
                        settings.clone(),
                        &state.backend_state().state_dir,
                        self.runner.clone(),
                    )
                    .with_installer_path(installer),
                )
            }
            (BackendKind::Vagrant, Some(BackendRequest::Vagrant(settings))) => {
                AnyProvisioner::Vagrant(
                    VagrantProvisioner::new(
                        settings.clone(),
                        &state.backend_state().state_dir,
                        self.runner.clone(),
                    )
                    .with_installer_path(installer),
                )
            }
            (BackendKind::Terraform, _) => {
                AnyProvisioner::Terraform(TerraformProvisioner::detached(self.runner.clone()))
            }
            (BackendKind::Vagrant, _) => {
                AnyProvisioner::Vagrant(VagrantProvisioner::detached(self.runner.clone()))
            }
        };
        provisioner.update_with_state(state)?;
        Ok(provisioner)
    }
}

/// Copies `script` into `state_dir` under `target_name`.
pub(crate) fn stage_script(
    script: &Utf8Path,
    state_dir: &Utf8Path,
    target_name: &str,
) -> Result<(), ProvisionerError> {
    let staging_error = |path: &Utf8Path, err: std::io::Error| ProvisionerError::Staging {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    let file_name = script.file_name().ok_or_else(|| ProvisionerError::Staging {
        path: script.to_path_buf(),
        message: String::from("script path has no file name"),
    })?;
    let source_dir_path = script
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let source_dir = Dir::open_ambient_dir(source_dir_path, ambient_authority())
        .map_err(|err| staging_error(script, err))?;
    let contents = source_dir.read(file_name).map_err(|err| staging_error(script, err))?;

    Dir::create_ambient_dir_all(state_dir, ambient_authority())
        .map_err(|err| staging_error(state_dir, err))?;
    let target_dir = Dir::open_ambient_dir(state_dir, ambient_authority())
        .map_err(|err| staging_error(state_dir, err))?;
    target_dir
        .write(target_name, contents)
        .map_err(|err| staging_error(&state_dir.join(target_name), err))
}

/// Starts the installer script from `install_dir` on the session's node.
pub(crate) fn launch_installer(
    session: &mut WizardSession,
    install_dir: &str,
) -> Result<(), ProvisionerError> {
    let command = RemoteCommand::new(INSTALL_SCRIPT).sudo().in_dir(install_dir);
    session.launch(&command).map_err(ProvisionerError::Install)
}

/// Maps a failed backend tool invocation into [`ProvisionerError::Command`].
pub(crate) fn command_error(action: &str) -> impl FnOnce(CommandError) -> ProvisionerError + '_ {
    move |source| ProvisionerError::Command {
        action: action.to_owned(),
        source,
    }
}
