//! SSH access to provisioned nodes.
//!
//! One-shot commands go through the system `ssh` binary via a
//! [`CommandRunner`], which keeps them scriptable in tests. The long-lived
//! installer conversation uses a [`WizardSession`] that streams output while
//! it is being scanned.

use std::ffi::OsString;
use std::fmt::Write as _;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};
use crate::provisioner::Node;
use crate::retry::{RetryError, RetryPolicy, Retryable, retry};

mod command;
mod config;
mod session;

pub use command::RemoteCommand;
pub use config::{SshConfig, SshConfigLoadError, expand_tilde};
pub use session::WizardSession;

/// Output captured from a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code reported by the remote command, if available.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Returns `true` when the remote command exited with zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    fn describe_failure(&self) -> String {
        let status = self
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with status {status}")
        } else {
            format!("exited with status {status}: {stderr}")
        }
    }
}

/// Failure of a command on a single node during [`SshClient::distribute`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeFailure {
    /// Node name.
    pub node: String,
    /// What went wrong.
    pub message: String,
}

/// Errors raised while talking to nodes over SSH.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when configuration is missing required values.
    #[error(
        "missing {field}: set RIGGER_SSH_{env_suffix} or add {field} to rigger.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the local `ssh` client cannot run.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when a node does not accept SSH connections yet.
    #[error("node {node} is not reachable over SSH: {message}")]
    Unreachable {
        /// Node name.
        node: String,
        /// Exit status and stderr of the probe.
        message: String,
    },
    /// Raised when the interactive session cannot be started or used.
    #[error("SSH session on {node} failed: {message}")]
    Session {
        /// Node name.
        node: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when session streams are requested before launch.
    #[error("no remote command has been launched on {node}")]
    NotLaunched {
        /// Node name.
        node: String,
    },
    /// Raised when a distributed command is given no target nodes.
    #[error("no target nodes for remote command")]
    NoNodes,
    /// Raised when a distributed command fails on one or more nodes.
    #[error("remote command failed on {} node(s): {}", .failures.len(), summarize(.failures))]
    Distribute {
        /// Per-node failures, sorted by node name.
        failures: Vec<NodeFailure>,
    },
}

impl Retryable for SshError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

fn summarize(failures: &[NodeFailure]) -> String {
    let mut summary = String::new();
    for (index, failure) in failures.iter().enumerate() {
        if index > 0 {
            summary.push_str("; ");
        }
        write!(summary, "{}: {}", failure.node, failure.message).ok();
    }
    summary
}

/// Runs commands on provisioned nodes through the system SSH client.
#[derive(Clone, Debug)]
pub struct SshClient<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl SshClient<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshClient<R> {
    /// Creates a client using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when validation fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Runs a structured command on `node`.
    ///
    /// # Errors
    ///
    /// Propagates failures to spawn the local SSH client.
    pub fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
    ) -> Result<RemoteCommandOutput, SshError> {
        self.run_raw(node, &command.render())
    }

    /// Runs `remote_command` verbatim on `node`.
    ///
    /// # Errors
    ///
    /// Propagates failures to spawn the local SSH client.
    ///
    /// # Security
    ///
    /// `remote_command` is passed to the remote shell unmodified; prefer
    /// [`SshClient::run`] for commands built from untrusted values.
    pub fn run_raw(
        &self,
        node: &Node,
        remote_command: &str,
    ) -> Result<RemoteCommandOutput, SshError> {
        let mut args = self.ssh_args(node);
        args.push(OsString::from(remote_command));
        let output = self.runner.run(&self.config.ssh_bin, &args)?;

        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Checks whether `node` accepts SSH connections.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Unreachable`] when the connection or the trivial
    /// remote command fails, and [`SshError::Command`] when the local client
    /// cannot start.
    pub fn probe(&self, node: &Node) -> Result<(), SshError> {
        let output = self.run_raw(node, "true")?;
        if output.is_success() {
            Ok(())
        } else {
            Err(SshError::Unreachable {
                node: node.name.clone(),
                message: output.describe_failure(),
            })
        }
    }

    /// Prepares an interactive session on `node`. Nothing runs until
    /// [`WizardSession::launch`] is called.
    #[must_use]
    pub fn session(&self, node: &Node) -> WizardSession {
        WizardSession::new(node.name.clone(), self.config.ssh_bin.clone(), self.ssh_args(node))
    }

    /// Builds the client arguments up to and including the destination.
    #[must_use]
    pub fn ssh_args(&self, node: &Node) -> Vec<OsString> {
        let endpoint = &node.ssh;
        let mut args = vec![OsString::from("-p"), OsString::from(endpoint.port.to_string())];

        let identity = endpoint
            .identity_file
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.config.ssh_identity_file.clone());
        if let Some(identity_file) = identity {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(&identity_file)));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        if self.config.ssh_connect_timeout_secs > 0 {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ConnectTimeout={}",
                self.config.ssh_connect_timeout_secs
            )));
        }

        args.push(OsString::from(format!("{}@{}", endpoint.user, endpoint.host)));
        args
    }
}

impl<R> SshClient<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    /// Probes `node` until it answers, the policy budget runs out or
    /// `cancel` fires. Each probe runs on the blocking pool, so cancellation
    /// does not wait for an attempt in flight.
    ///
    /// # Errors
    ///
    /// Returns the [`RetryError`] describing why the node never answered.
    pub async fn wait_until_reachable(
        &self,
        node: &Node,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<SshError>> {
        debug!(node = %node.name, host = %node.ssh.host, "waiting for SSH");
        retry(policy, cancel, || {
            let client = self.clone();
            let target = node.clone();
            async move {
                let name = target.name.clone();
                tokio::task::spawn_blocking(move || client.probe(&target))
                    .await
                    .map_err(|err| SshError::Unreachable {
                        node: name,
                        message: format!("probe task failed: {err}"),
                    })?
            }
        })
        .await?;
        info!(node = %node.name, "SSH is reachable");
        Ok(())
    }

    /// Runs `command` on every node in `nodes` concurrently and waits for
    /// all of them.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NoNodes`] for an empty target list and
    /// [`SshError::Distribute`] listing every node where the command could
    /// not run or exited non-zero.
    pub async fn distribute(
        &self,
        command: &RemoteCommand,
        nodes: &[Node],
    ) -> Result<(), SshError> {
        if nodes.is_empty() {
            return Err(SshError::NoNodes);
        }

        let rendered = command.render();
        info!(nodes = nodes.len(), command = %rendered, "distributing remote command");

        let mut tasks = JoinSet::new();
        for target in nodes {
            let client = self.clone();
            let node = target.clone();
            let remote = rendered.clone();
            tasks.spawn_blocking(move || {
                let result = client.run_raw(&node, &remote);
                (node.name, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(output))) if output.is_success() => {
                    debug!(node = %name, "remote command succeeded");
                }
                Ok((name, Ok(output))) => failures.push(NodeFailure {
                    node: name,
                    message: output.describe_failure(),
                }),
                Ok((name, Err(err))) => failures.push(NodeFailure {
                    node: name,
                    message: err.to_string(),
                }),
                Err(err) => failures.push(NodeFailure {
                    node: String::from("<unknown>"),
                    message: format!("worker task failed: {err}"),
                }),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by(|left, right| left.node.cmp(&right.node));
        for failure in &failures {
            warn!(node = %failure.node, error = %failure.message, "remote command failed");
        }
        Err(SshError::Distribute { failures })
    }
}

#[cfg(test)]
mod tests;
