//! Configuration loading via `ortho-config`.
//!
//! Settings are layered from defaults, `rigger.toml` and the environment,
//! then resolved once into the typed requests consumed by the lifecycle.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::infra::InfraKind;
use crate::lifecycle::InitRequest;
use crate::provisioner::{
    AwsCredentials, BackendKind, BackendRequest, InfraRequest, TerraformRequest, VagrantRequest,
};
use crate::ssh::expand_tilde;

const CONFIG_FILE: &str = "rigger.toml";

/// Infrastructure settings shared by every backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RIGGER",
    discovery(
        app_name = "rigger",
        env_var = "RIGGER_CONFIG_PATH",
        config_file_name = "rigger.toml",
        dotfile_name = ".rigger.toml",
        project_file_name = "rigger.toml"
    )
)]
pub struct InfraConfig {
    /// Display name of the infrastructure.
    #[ortho_config(default = "rigger".to_owned())]
    pub name: String,
    /// Backend creating the nodes: `terraform` or `vagrant`.
    pub provisioner: Option<String>,
    /// Number of nodes to create.
    #[ortho_config(default = 1)]
    pub nodes: u32,
    /// Terraform script or Vagrantfile describing the nodes.
    pub script_path: Option<String>,
    /// Installer bundle to upload. The installer wizard only runs when set.
    pub installer_path: Option<String>,
    /// Directory under which per-run state directories are created.
    #[ortho_config(default = ".rigger".to_owned())]
    pub state_dir: String,
    /// Remote directory holding the unpacked installer. Defaults to
    /// `installer` in the login user's home directory.
    pub install_dir: Option<String>,
    /// Ops Center entry URL used by remote infrastructure.
    pub ops_center_url: Option<String>,
    /// Terraform executable.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_bin: String,
    /// Vagrant executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
}

/// AWS settings consumed by the Terraform backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "AWS",
    discovery(
        app_name = "rigger",
        env_var = "RIGGER_CONFIG_PATH",
        config_file_name = "rigger.toml",
        dotfile_name = ".rigger.toml",
        project_file_name = "rigger.toml"
    )
)]
pub struct AwsConfig {
    /// Access key identifier.
    pub access_key_id: Option<String>,
    /// Secret access key.
    pub secret_access_key: Option<String>,
    /// Region in which instances are created.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Key pair installed on the instances.
    pub key_pair: Option<String>,
    /// Private key matching `key_pair`. Supports tilde expansion.
    pub ssh_key_path: Option<String>,
    /// Login user on the instances.
    #[ortho_config(default = "centos".to_owned())]
    pub ssh_user: String,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value that cannot be used.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn require<'a>(value: Option<&'a str>, metadata: &FieldMetadata) -> Result<&'a str, ConfigError> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| metadata.missing())
}

impl InfraConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("rigger")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the configured backend kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provisioner is missing or unknown.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        let raw = require(
            self.provisioner.as_deref(),
            &FieldMetadata::new("provisioner", "RIGGER_PROVISIONER", "provisioner"),
        )?;
        raw.parse::<BackendKind>()
            .map_err(|err| ConfigError::InvalidValue(err.to_string()))
    }

    /// Builds the request for fresh local infrastructure.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is missing or invalid.
    pub fn as_request(&self, aws: &AwsConfig) -> Result<InfraRequest, ConfigError> {
        let kind = self.backend_kind()?;
        let script = require(
            self.script_path.as_deref(),
            &FieldMetadata::new("provisioning script", "RIGGER_SCRIPT_PATH", "script_path"),
        )?;
        if self.nodes == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "nodes must be at least 1 (RIGGER_NODES)",
            )));
        }
        let name = require(
            Some(self.name.as_str()),
            &FieldMetadata::new("infrastructure name", "RIGGER_NAME", "name"),
        )?;

        let script_path = Utf8PathBuf::from(expand_tilde(script));
        let backend = match kind {
            BackendKind::Terraform => BackendRequest::Terraform(TerraformRequest {
                script_path,
                nodes: self.nodes,
                credentials: aws.credentials()?,
                ssh_user: aws.ssh_user.trim().to_owned(),
                ssh_key_path: aws
                    .ssh_key_path
                    .as_deref()
                    .map(|path| Utf8PathBuf::from(expand_tilde(path))),
                install_dir: self.install_dir_for(aws.ssh_user.trim()),
                terraform_bin: self.terraform_bin.clone(),
            }),
            BackendKind::Vagrant => BackendRequest::Vagrant(VagrantRequest {
                script_path,
                nodes: self.nodes,
                install_dir: self.install_dir_for("vagrant"),
                vagrant_bin: self.vagrant_bin.clone(),
            }),
        };

        Ok(InfraRequest {
            name: name.to_owned(),
            state_root: Utf8PathBuf::from(expand_tilde(&self.state_dir)),
            installer_path: self
                .installer_path
                .as_deref()
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(|path| Utf8PathBuf::from(expand_tilde(path))),
            backend,
        })
    }

    /// Resolves the Ops Center URL of remote infrastructure.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the URL is missing or malformed.
    pub fn as_remote(&self) -> Result<Url, ConfigError> {
        let raw = require(
            self.ops_center_url.as_deref(),
            &FieldMetadata::new("Ops Center URL", "RIGGER_OPS_CENTER_URL", "ops_center_url"),
        )?;
        Url::parse(raw)
            .map_err(|err| ConfigError::InvalidValue(format!("ops_center_url '{raw}': {err}")))
    }

    /// Builds the lifecycle request for a fresh infrastructure of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the settings for `kind` are incomplete.
    pub fn init_request(
        &self,
        kind: InfraKind,
        aws: &AwsConfig,
    ) -> Result<InitRequest, ConfigError> {
        Ok(match kind {
            InfraKind::Local => InitRequest::Local(self.as_request(aws)?),
            InfraKind::Remote => InitRequest::Remote {
                name: self.name.trim().to_owned(),
                ops_center_url: self.as_remote()?,
            },
        })
    }

    fn install_dir_for(&self, user: &str) -> String {
        self.install_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map_or_else(|| format!("/home/{user}/installer"), str::to_owned)
    }
}

impl AwsConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("rigger")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the credentials forwarded to Terraform.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first absent value.
    pub fn credentials(&self) -> Result<AwsCredentials, ConfigError> {
        let access_key_id = require(
            self.access_key_id.as_deref(),
            &FieldMetadata::new("AWS access key", "AWS_ACCESS_KEY_ID", "access_key_id"),
        )?;
        let secret_access_key = require(
            self.secret_access_key.as_deref(),
            &FieldMetadata::new("AWS secret key", "AWS_SECRET_ACCESS_KEY", "secret_access_key"),
        )?;
        let region = require(
            Some(self.region.as_str()),
            &FieldMetadata::new("AWS region", "AWS_REGION", "region"),
        )?;
        let key_pair = require(
            self.key_pair.as_deref(),
            &FieldMetadata::new("AWS key pair", "AWS_KEY_PAIR", "key_pair"),
        )?;
        Ok(AwsCredentials {
            access_key_id: access_key_id.to_owned(),
            secret_access_key: secret_access_key.to_owned(),
            region: region.to_owned(),
            key_pair: key_pair.to_owned(),
        })
    }
}
