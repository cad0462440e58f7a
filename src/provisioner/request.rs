//! Resolved provisioning requests.
//!
//! Configuration is loaded and validated by [`crate::config`]; the types here
//! carry the result to the backend factories.

use camino::{Utf8Path, Utf8PathBuf};

use super::BackendKind;

/// Everything needed to create a fresh local infrastructure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InfraRequest {
    /// Logical infrastructure name, used in state directory names.
    pub name: String,
    /// Directory under which the per-run state directory is created.
    pub state_root: Utf8PathBuf,
    /// Installer bundle to upload to the nodes, if any.
    pub installer_path: Option<Utf8PathBuf>,
    /// Backend selection and its settings.
    pub backend: BackendRequest,
}

impl InfraRequest {
    /// Returns `true` when an installer bundle was requested.
    #[must_use]
    pub const fn with_installer(&self) -> bool {
        self.installer_path.is_some()
    }
}

/// Backend-specific settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendRequest {
    /// Declarative-script backend driving `terraform`.
    Terraform(TerraformRequest),
    /// Desktop virtualisation backend driving `vagrant`.
    Vagrant(VagrantRequest),
}

impl BackendRequest {
    /// Returns the backend kind the request targets.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Terraform(_) => BackendKind::Terraform,
            Self::Vagrant(_) => BackendKind::Vagrant,
        }
    }

    /// Returns the provisioning script staged into the state directory.
    #[must_use]
    pub fn script_path(&self) -> &Utf8Path {
        match self {
            Self::Terraform(request) => &request.script_path,
            Self::Vagrant(request) => &request.script_path,
        }
    }
}

/// Cloud credentials forwarded to the Terraform script.
#[derive(Clone, Eq, PartialEq)]
pub struct AwsCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Region in which instances are created.
    pub region: String,
    /// Name of the key pair installed on the instances.
    pub key_pair: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("key_pair", &self.key_pair)
            .finish()
    }
}

/// Settings for the Terraform backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerraformRequest {
    /// Terraform script (a single `.tf` file) describing the nodes.
    pub script_path: Utf8PathBuf,
    /// Number of nodes to create.
    pub nodes: u32,
    /// Cloud credentials.
    pub credentials: AwsCredentials,
    /// Login user on the created instances.
    pub ssh_user: String,
    /// Private key matching `credentials.key_pair`.
    pub ssh_key_path: Option<Utf8PathBuf>,
    /// Remote directory holding the unpacked installer.
    pub install_dir: String,
    /// Terraform executable.
    pub terraform_bin: String,
}

/// Settings for the Vagrant backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VagrantRequest {
    /// Vagrantfile describing the machines.
    pub script_path: Utf8PathBuf,
    /// Number of machines to bring up.
    pub nodes: u32,
    /// Remote directory holding the unpacked installer.
    pub install_dir: String,
    /// Vagrant executable.
    pub vagrant_bin: String,
}
