//! Installer command line on cluster nodes.
//!
//! Wraps the installer binary unpacked on each node: installing the first
//! node, joining further nodes and reading the cluster status. All values
//! are passed as shell-escaped flags.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::CommandRunner;
use crate::provisioner::Node;
use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
use crate::ssh::{RemoteCommand, SshClient, SshError};
use crate::status::{ClusterStatus, StatusError, parse_status};

/// Installer binary relative to the install directory.
pub const INSTALLER_BINARY: &str = "./gravity";

/// Pause between status polls in [`ClusterNode::wait_for_status`].
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default budget for [`ClusterNode::wait_for_status`].
#[must_use]
pub const fn status_poll_policy() -> RetryPolicy {
    RetryPolicy::new(DEFAULT_STATUS_POLL_INTERVAL, crate::retry::DEFAULT_RETRY_ATTEMPTS)
}

/// Parameters for installing the first cluster node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstallParams {
    /// Token other nodes will use to join.
    pub token: String,
    /// Cluster name; the installer picks one when absent.
    pub cluster: Option<String>,
    /// Installation flavor.
    pub flavor: Option<String>,
    /// Role of this node.
    pub role: Option<String>,
    /// Block device dedicated to container storage.
    pub docker_device: Option<String>,
}

/// Parameters for joining a node to an existing cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JoinParams {
    /// Address of a node already in the cluster.
    pub peer: String,
    /// Join token.
    pub token: String,
    /// Role of the joining node.
    pub role: String,
    /// Block device dedicated to container storage.
    pub docker_device: Option<String>,
}

/// Errors raised by installer commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Raised when the command could not be run over SSH.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the installer exits non-zero.
    #[error("'{command}' failed on {node} with status {status}: {stderr}")]
    Exit {
        /// Node name.
        node: String,
        /// Rendered command.
        command: String,
        /// Exit status, or `unknown`.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when the status report cannot be parsed.
    #[error(transparent)]
    Status(#[from] StatusError),
    /// Raised while the cluster has not reached the awaited condition.
    #[error("cluster is not ready yet (state '{state}')")]
    NotReady {
        /// Last reported cluster state.
        state: String,
    },
}

impl Retryable for ClusterError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Ssh(err) => err.is_retryable(),
            Self::Exit { .. } | Self::NotReady { .. } => true,
            Self::Status(_) => false,
        }
    }
}

/// Runs installer commands on one node.
#[derive(Debug)]
pub struct ClusterNode<'a, R: CommandRunner> {
    ssh: &'a SshClient<R>,
    node: Node,
    install_dir: String,
}

impl<'a, R: CommandRunner> ClusterNode<'a, R> {
    /// Targets the installer unpacked in `install_dir` on `node`.
    #[must_use]
    pub fn new(ssh: &'a SshClient<R>, node: Node, install_dir: impl Into<String>) -> Self {
        Self {
            ssh,
            node,
            install_dir: install_dir.into(),
        }
    }

    /// Returns the targeted node.
    #[must_use]
    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Builds the command installing the first node.
    #[must_use]
    pub fn install_command(&self, params: &InstallParams) -> RemoteCommand {
        self.installer()
            .arg("install")
            .flag("advertise-addr", self.node.private_addr)
            .flag("token", &params.token)
            .optional_flag("cluster", params.cluster.as_ref())
            .optional_flag("flavor", params.flavor.as_ref())
            .optional_flag("role", params.role.as_ref())
            .optional_flag("docker-device", params.docker_device.as_ref())
    }

    /// Builds the command joining this node to `params.peer`.
    #[must_use]
    pub fn join_command(&self, params: &JoinParams) -> RemoteCommand {
        self.installer()
            .arg("join")
            .arg(params.peer.clone())
            .flag("advertise-addr", self.node.private_addr)
            .flag("token", &params.token)
            .flag("role", &params.role)
            .optional_flag("docker-device", params.docker_device.as_ref())
    }

    /// Installs the first cluster node.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when SSH fails or the installer exits
    /// non-zero.
    pub fn install(&self, params: &InstallParams) -> Result<(), ClusterError> {
        self.execute(&self.install_command(params)).map(drop)
    }

    /// Joins this node to an existing cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when SSH fails or the installer exits
    /// non-zero.
    pub fn join(&self, params: &JoinParams) -> Result<(), ClusterError> {
        self.execute(&self.join_command(params)).map(drop)
    }

    /// Reads the cluster status as seen from this node.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when SSH fails, the installer exits non-zero
    /// or the report cannot be parsed.
    pub fn status(&self) -> Result<ClusterStatus, ClusterError> {
        let stdout = self.execute(&self.installer().arg("status"))?;
        Ok(parse_status(stdout.as_bytes())?)
    }

    /// Polls [`ClusterNode::status`] until `ready` accepts the merged report.
    ///
    /// Reports are folded together with [`ClusterStatus::merge`], so a join
    /// token seen once stays known even if later reports omit it.
    ///
    /// # Errors
    ///
    /// Returns the [`RetryError`] describing why the condition was never met.
    pub async fn wait_for_status<F>(
        &self,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        ready: F,
    ) -> Result<ClusterStatus, RetryError<ClusterError>>
    where
        F: Fn(&ClusterStatus) -> bool,
    {
        let mut merged = ClusterStatus::default();
        retry(policy, cancel, || {
            let outcome = self.status().and_then(|report| {
                merged.merge(report);
                if ready(&merged) {
                    Ok(merged.clone())
                } else {
                    Err(ClusterError::NotReady {
                        state: merged.status.clone(),
                    })
                }
            });
            std::future::ready(outcome)
        })
        .await
    }

    fn installer(&self) -> RemoteCommand {
        RemoteCommand::new(INSTALLER_BINARY)
            .sudo()
            .in_dir(self.install_dir.clone())
    }

    fn execute(&self, command: &RemoteCommand) -> Result<String, ClusterError> {
        debug!(node = %self.node.name, command = %command, "running installer command");
        let output = self.ssh.run(&self.node, command)?;
        if !output.is_success() {
            return Err(ClusterError::Exit {
                node: self.node.name.clone(),
                command: command.render(),
                status: output
                    .exit_code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        info!(node = %self.node.name, command = %command, "installer command succeeded");
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests;
