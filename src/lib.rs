//! Core library for the Rigger infrastructure orchestrator.
//!
//! The crate turns a provisioner-agnostic infrastructure request into
//! running machines (Terraform or Vagrant), drives the interactive cluster
//! installer over SSH until its wizard URL is known, parses installer status
//! reports, and records the infrastructure in a state file so a later run
//! can resume or tear it down.

pub mod cluster;
pub mod command;
pub mod config;
pub mod infra;
pub mod lifecycle;
pub mod provisioner;
pub mod retry;
pub mod snapshot;
pub mod ssh;
pub mod status;
pub mod test_support;
pub mod wizard;

pub use cluster::{ClusterError, ClusterNode, InstallParams, JoinParams};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{AwsConfig, ConfigError, InfraConfig};
pub use infra::{BootstrapOptions, Infra, InfraError, InfraKind, InfraSnapshot};
pub use lifecycle::{InitRequest, Lifecycle, LifecycleError, ShutdownOutcome};
pub use provisioner::{
    AnyProvisioner, BackendFactory, BackendKind, InfraRequest, Node, Provisioner,
    ProvisionerError, ProvisionerFactory, ProvisionerState,
};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use snapshot::{SnapshotError, SnapshotStore};
pub use ssh::{RemoteCommand, SshClient, SshConfig, SshError, WizardSession};
pub use status::{ClusterStatus, StatusError, parse_status};
pub use wizard::{Locator, WizardError, configure_wizard};
