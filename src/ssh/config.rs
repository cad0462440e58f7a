//! SSH client configuration loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::SshError;

/// SSH client settings shared by every connection to provisioned nodes.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RIGGER_SSH",
    discovery(
        app_name = "rigger",
        env_var = "RIGGER_CONFIG_PATH",
        config_file_name = "rigger.toml",
        dotfile_name = ".rigger.toml",
        project_file_name = "rigger.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Whether to force batch mode to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled by default because
    /// provisioned hosts are ephemeral.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used when a node does not name its own. Supports tilde
    /// expansion.
    pub ssh_identity_file: Option<String>,
    /// Seconds to wait for the TCP connection before a probe fails.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u32,
}

/// Errors raised when loading the SSH configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads configuration from defaults, configuration files and environment
    /// variables, ignoring the process command line.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("rigger")])
            .map_err(|err| SshConfigLoadError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] naming the first empty field.
    pub fn validate(&self) -> Result<(), SshError> {
        require(Some(&self.ssh_bin), "ssh_bin")?;
        require(self.ssh_identity_file.as_deref(), "ssh_identity_file")
    }
}

fn require(value: Option<&str>, field: &str) -> Result<(), SshError> {
    match value {
        Some(text) if text.trim().is_empty() => Err(SshError::InvalidConfig {
            field: field.to_owned(),
        }),
        _ => Ok(()),
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
