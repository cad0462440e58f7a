//! Process-level lifecycle of the infrastructure under test.
//!
//! A run either creates fresh infrastructure or resumes the one recorded in
//! the state file, never both. [`Lifecycle::shutdown`] closes transient
//! resources and then either retains the snapshot for the next run or tears
//! the infrastructure down and forgets it.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::command::CommandRunner;
use crate::infra::{BootstrapOptions, Infra, InfraError, InfraKind, InfraSnapshot};
use crate::provisioner::{InfraRequest, Provisioner, ProvisionerError, ProvisionerFactory};
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::ssh::SshClient;

/// Request to create fresh infrastructure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InitRequest {
    /// Provision nodes with a backend.
    Local(InfraRequest),
    /// Target an existing Ops Center.
    Remote {
        /// Display name.
        name: String,
        /// Ops Center entry URL.
        ops_center_url: Url,
    },
}

impl InitRequest {
    /// Returns the infrastructure flavour the request creates.
    #[must_use]
    pub const fn kind(&self) -> InfraKind {
        match self {
            Self::Local(_) => InfraKind::Local,
            Self::Remote { .. } => InfraKind::Remote,
        }
    }
}

/// What [`Lifecycle::shutdown`] did with the infrastructure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownOutcome {
    /// The snapshot was written for a later run.
    Retained,
    /// The infrastructure was destroyed and the snapshot removed.
    Destroyed,
}

/// Errors raised by the lifecycle entry points.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Raised when creation is requested while a snapshot exists.
    #[error(
        "infrastructure is already initialized (state file {path}); \
         tear it down first or resume without --init"
    )]
    AlreadyInitialized {
        /// State file holding the existing snapshot.
        path: Utf8PathBuf,
    },
    /// Raised when neither creation nor a snapshot is available.
    #[error("infrastructure must be initialized: no state file at {path}; rerun with --init")]
    NotInitialized {
        /// Expected state file location.
        path: Utf8PathBuf,
    },
    /// Raised when teardown is requested but the reattached provisioner
    /// lacks the settings needed to destroy the nodes. The state file is
    /// left untouched.
    #[error(
        "cannot destroy infrastructure '{name}': backend settings are missing or invalid; \
         fix the configuration and retry (state file {path} kept)"
    )]
    TeardownUnavailable {
        /// Display name of the infrastructure.
        name: String,
        /// State file that still records the infrastructure.
        path: Utf8PathBuf,
    },
    /// Raised when the per-run state directory cannot be created.
    #[error("failed to create state directory {path}: {message}")]
    StateDir {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when reading or writing the state file fails.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Raised when a provisioner cannot be built or reattached.
    #[error(transparent)]
    Provisioner(#[from] ProvisionerError),
    /// Raised by the infrastructure facade.
    #[error(transparent)]
    Infra(#[from] InfraError),
}

/// Owner of the active infrastructure for one process.
#[derive(Debug)]
pub struct Lifecycle<P> {
    store: SnapshotStore,
    infra: Infra<P>,
}

impl<P: Provisioner> Lifecycle<P> {
    /// Creates fresh infrastructure from `init`, or resumes the snapshot in
    /// `store` when `init` is `None`. The snapshot is written once the
    /// infrastructure is ready.
    ///
    /// A failed bootstrap still records the snapshot so that the created
    /// nodes can be torn down by a later run.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyInitialized`] when `init` is given
    /// but a snapshot exists, [`LifecycleError::NotInitialized`] when neither
    /// is available, and any error raised while creating or restoring the
    /// infrastructure.
    pub async fn initialize<F, R>(
        store: SnapshotStore,
        factory: &F,
        ssh: &SshClient<R>,
        init: Option<InitRequest>,
        bootstrap: &BootstrapOptions,
    ) -> Result<Self, LifecycleError>
    where
        F: ProvisionerFactory<Provisioner = P>,
        R: CommandRunner + Clone + Send + Sync + 'static,
    {
        let existing = store.load()?;
        let infra = match (existing, init) {
            (Some(_), Some(_)) => {
                return Err(LifecycleError::AlreadyInitialized {
                    path: store.path().to_path_buf(),
                });
            }
            (None, None) => {
                return Err(LifecycleError::NotInitialized {
                    path: store.path().to_path_buf(),
                });
            }
            (Some(snapshot), None) => resume(factory, snapshot)?,
            (None, Some(request)) => create(&store, factory, ssh, request, bootstrap).await?,
        };

        let lifecycle = Self { store, infra };
        lifecycle.save_state()?;
        Ok(lifecycle)
    }

    /// Returns the active infrastructure.
    #[must_use]
    pub const fn infra(&self) -> &Infra<P> {
        &self.infra
    }

    /// Returns the active infrastructure for modification.
    pub const fn infra_mut(&mut self) -> &mut Infra<P> {
        &mut self.infra
    }

    /// Returns the backing state file.
    #[must_use]
    pub const fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Writes the current snapshot to the state file.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the snapshot cannot be captured or
    /// written.
    pub fn save_state(&self) -> Result<(), LifecycleError> {
        let snapshot = self.infra.snapshot()?;
        self.store.save(&snapshot)?;
        Ok(())
    }

    /// Closes transient resources, then either retains the snapshot or,
    /// when `teardown` is set, destroys the infrastructure and removes the
    /// snapshot.
    ///
    /// A failed destroy is logged and reported after the snapshot has been
    /// removed. Teardown of local infrastructure whose provisioner cannot
    /// destroy is refused before the snapshot is touched.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TeardownUnavailable`] when the nodes cannot
    /// be destroyed with the current settings, and [`LifecycleError`] when
    /// the destroy or a state file operation fails.
    pub async fn shutdown(mut self, teardown: bool) -> Result<ShutdownOutcome, LifecycleError> {
        if let Err(err) = self.infra.close().await {
            warn!(error = %err, "failed to close installer session");
        }

        if !teardown {
            self.save_state()?;
            info!(name = %self.infra.name(), path = %self.store.path(), "infrastructure retained");
            return Ok(ShutdownOutcome::Retained);
        }

        let local = self.infra.kind() == InfraKind::Local;
        if local
            && self
                .infra
                .provisioner()
                .is_none_or(|provisioner| !provisioner.can_destroy())
        {
            error!(name = %self.infra.name(), "teardown refused: provisioner cannot destroy");
            return Err(LifecycleError::TeardownUnavailable {
                name: self.infra.name().to_owned(),
                path: self.store.path().to_path_buf(),
            });
        }

        let destroyed = if local {
            self.infra.destroy().await
        } else {
            Ok(())
        };
        if let Err(err) = &destroyed {
            error!(name = %self.infra.name(), error = %err, "failed to destroy infrastructure");
        }
        self.store.remove()?;
        destroyed?;
        info!(name = %self.infra.name(), "infrastructure torn down");
        Ok(ShutdownOutcome::Destroyed)
    }
}

fn resume<F>(factory: &F, snapshot: InfraSnapshot) -> Result<Infra<F::Provisioner>, LifecycleError>
where
    F: ProvisionerFactory,
    F::Provisioner: Provisioner,
{
    snapshot.validate()?;
    let provisioner = match (snapshot.backend, snapshot.provisioner_state.clone()) {
        (Some(kind), Some(state)) => Some(factory.reattach(kind, state)?),
        _ => None,
    };
    info!(name = %snapshot.name, infra = %snapshot.infra, "resuming infrastructure");
    Ok(Infra::from_snapshot(snapshot, provisioner)?)
}

async fn create<F, R>(
    store: &SnapshotStore,
    factory: &F,
    ssh: &SshClient<R>,
    init: InitRequest,
    bootstrap: &BootstrapOptions,
) -> Result<Infra<F::Provisioner>, LifecycleError>
where
    F: ProvisionerFactory,
    F::Provisioner: Provisioner,
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    match init {
        InitRequest::Remote {
            name,
            ops_center_url,
        } => {
            info!(%name, url = %ops_center_url, "using remote infrastructure");
            Ok(Infra::remote(name, ops_center_url))
        }
        InitRequest::Local(request) => {
            let state_dir = create_state_dir(&request.state_root, &request.name)?;
            let provisioner = factory.build(&request, &state_dir)?;
            let mut infra = Infra::local(request.name, provisioner, request.installer_path);
            if let Err(err) = infra.init(ssh, bootstrap).await {
                record_partial(store, &infra);
                if let Err(close_err) = infra.close().await {
                    warn!(error = %close_err, "failed to close installer session");
                }
                return Err(err.into());
            }
            Ok(infra)
        }
    }
}

fn record_partial<P: Provisioner>(store: &SnapshotStore, infra: &Infra<P>) {
    let saved = infra
        .snapshot()
        .map_err(LifecycleError::from)
        .and_then(|snapshot| store.save(&snapshot).map_err(LifecycleError::from));
    match saved {
        Ok(()) => warn!(path = %store.path(), "initialization failed; state recorded for teardown"),
        Err(err) => {
            error!(error = %err, "failed to record state of partially created infrastructure");
        }
    }
}

fn create_state_dir(root: &Utf8Path, name: &str) -> Result<Utf8PathBuf, LifecycleError> {
    let path = root.join(format!("rigger-{name}-{}", Uuid::new_v4().simple()));
    Dir::create_ambient_dir_all(&path, ambient_authority()).map_err(|err| LifecycleError::StateDir {
        path: path.clone(),
        message: err.to_string(),
    })?;
    info!(%path, "created state directory");
    Ok(path)
}
