//! Terraform-backed provisioner.
//!
//! The configured script is staged into the per-run state directory and
//! driven with `terraform -chdir=<state_dir>`. Credentials and node counts
//! travel as `TF_VAR_*` environment variables so they never appear on a
//! command line. The script must expose `public_ips` and `private_ips`
//! outputs listing one address per node.

use std::ffi::OsString;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::info;

use super::{
    BackendKind, BackendState, Node, NodePool, Provisioner, ProvisionerError, ProvisionerFuture,
    ProvisionerState, SshEndpoint, TerraformRequest, command_error, launch_installer, stage_script,
};
use crate::command::{CommandOutput, CommandRunner, run_blocking};
use crate::ssh::WizardSession;

/// Executable used when no explicit binary is configured.
pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";

/// File name the script is staged under.
pub const SCRIPT_FILE_NAME: &str = "main.tf";

/// Provisioner creating cloud instances through Terraform.
#[derive(Debug)]
pub struct TerraformProvisioner<R> {
    settings: Option<TerraformRequest>,
    binary: String,
    install_dir: String,
    installer_path: Option<Utf8PathBuf>,
    state_dir: Utf8PathBuf,
    pool: NodePool,
    runner: R,
}

impl<R> TerraformProvisioner<R> {
    /// Creates a provisioner that stages its script into `state_dir`.
    #[must_use]
    pub fn new(settings: TerraformRequest, state_dir: &Utf8Path, runner: R) -> Self {
        Self {
            binary: settings.terraform_bin.clone(),
            install_dir: settings.install_dir.clone(),
            settings: Some(settings),
            installer_path: None,
            state_dir: state_dir.to_path_buf(),
            pool: NodePool::default(),
            runner,
        }
    }

    /// Creates a provisioner without settings, to be populated from a
    /// recorded [`ProvisionerState`]. It cannot create or destroy nodes.
    #[must_use]
    pub fn detached(runner: R) -> Self {
        Self {
            settings: None,
            binary: DEFAULT_TERRAFORM_BIN.to_owned(),
            install_dir: String::new(),
            installer_path: None,
            state_dir: Utf8PathBuf::new(),
            pool: NodePool::default(),
            runner,
        }
    }

    /// Sets the local installer bundle forwarded to the script.
    #[must_use]
    pub fn with_installer_path(mut self, installer_path: Option<Utf8PathBuf>) -> Self {
        self.installer_path = installer_path;
        self
    }

    /// Returns the per-run state directory.
    #[must_use]
    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    fn settings(&self, action: &str) -> Result<&TerraformRequest, ProvisionerError> {
        self.settings.as_ref().ok_or_else(|| {
            ProvisionerError::Config(format!(
                "terraform settings and cloud credentials are required to {action}"
            ))
        })
    }

    fn variables(
        &self,
        settings: &TerraformRequest,
        with_installer: bool,
    ) -> Vec<(String, String)> {
        let credentials = &settings.credentials;
        let mut env = vec![
            (String::from("TF_VAR_nodes"), settings.nodes.to_string()),
            (String::from("TF_VAR_access_key"), credentials.access_key_id.clone()),
            (String::from("TF_VAR_secret_key"), credentials.secret_access_key.clone()),
            (String::from("TF_VAR_region"), credentials.region.clone()),
            (String::from("TF_VAR_key_pair"), credentials.key_pair.clone()),
        ];
        if with_installer && let Some(path) = &self.installer_path {
            env.push((String::from("TF_VAR_installer_path"), path.to_string()));
        }
        env
    }
}

impl<R> TerraformProvisioner<R>
where
    R: CommandRunner + Clone + Send + 'static,
{
    async fn terraform(
        &self,
        action: &str,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionerError> {
        let mut full_args = vec![OsString::from(format!("-chdir={}", self.state_dir))];
        full_args.extend(args.iter().map(OsString::from));

        info!(action, state_dir = %self.state_dir, "running terraform");
        run_blocking(self.runner.clone(), self.binary.clone(), full_args, env.to_vec())
            .await
            .and_then(|output| output.into_success(&self.binary))
            .map_err(command_error(action))
    }
}

impl<R> Provisioner for TerraformProvisioner<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    fn create(&mut self, with_installer: bool) -> ProvisionerFuture<'_, Node> {
        Box::pin(async move {
            if with_installer && self.installer_path.is_none() {
                return Err(ProvisionerError::Config(String::from(
                    "an installer bundle path is required to upload the installer",
                )));
            }
            let settings = self.settings("create infrastructure")?;
            stage_script(&settings.script_path, &self.state_dir, SCRIPT_FILE_NAME)?;

            let env = self.variables(settings, with_installer);
            self.terraform("terraform init", &["init", "-input=false"], &env).await?;
            self.terraform("terraform apply", &["apply", "-auto-approve", "-input=false"], &env)
                .await?;
            let output = self.terraform("terraform output", &["output", "-json"], &env).await?;
            let nodes = parse_outputs(&output.stdout, settings)?;

            self.pool = NodePool::new(nodes);
            let bootstrap = self
                .pool
                .nodes()
                .first()
                .cloned()
                .ok_or(ProvisionerError::NotProvisioned)?;
            info!(
                nodes = self.pool.nodes().len(),
                bootstrap = %bootstrap.name,
                "terraform infrastructure created"
            );
            Ok(bootstrap)
        })
    }

    fn destroy(&mut self) -> ProvisionerFuture<'_, ()> {
        Box::pin(async move {
            let settings = self.settings("destroy infrastructure")?;
            let env = self.variables(settings, false);
            self.terraform(
                "terraform destroy",
                &["destroy", "-auto-approve", "-input=false"],
                &env,
            )
            .await?;
            self.pool = NodePool::default();
            info!(state_dir = %self.state_dir, "terraform infrastructure destroyed");
            Ok(())
        })
    }

    fn can_destroy(&self) -> bool {
        self.settings.is_some()
    }

    fn select_interface(
        &self,
        bootstrap: &Node,
        addrs: &[IpAddr],
    ) -> Result<usize, ProvisionerError> {
        Ok(addrs
            .iter()
            .position(|addr| *addr == bootstrap.private_addr)
            .unwrap_or(0))
    }

    fn start_install(&self, session: &mut WizardSession) -> Result<(), ProvisionerError> {
        launch_installer(session, &self.install_dir)
    }

    fn nodes(&self) -> Vec<Node> {
        self.pool.nodes().to_vec()
    }

    fn allocate(&self) -> Result<Node, ProvisionerError> {
        self.pool.allocate()
    }

    fn deallocate(&self, node: &Node) -> Result<(), ProvisionerError> {
        self.pool.deallocate(node)
    }

    fn allocated_nodes(&self) -> Result<Vec<Node>, ProvisionerError> {
        self.pool.allocated()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Terraform
    }

    fn state(&self) -> Result<ProvisionerState, ProvisionerError> {
        Ok(ProvisionerState::Terraform(BackendState {
            state_dir: self.state_dir.clone(),
            install_dir: self.install_dir.clone(),
            nodes: self.pool.nodes().to_vec(),
            allocated: self.pool.allocated_names()?,
        }))
    }

    fn update_with_state(&mut self, state: ProvisionerState) -> Result<(), ProvisionerError> {
        let recorded = state.into_backend_state(BackendKind::Terraform)?;
        self.state_dir = recorded.state_dir;
        self.install_dir = recorded.install_dir;
        self.pool = NodePool::with_allocated(recorded.nodes, recorded.allocated);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TerraformOutputs {
    public_ips: OutputValue,
    private_ips: OutputValue,
}

#[derive(Debug, Deserialize)]
struct OutputValue {
    value: Vec<String>,
}

fn parse_outputs(json: &str, settings: &TerraformRequest) -> Result<Vec<Node>, ProvisionerError> {
    let output_error = |message: String| ProvisionerError::Output {
        action: String::from("terraform output"),
        message,
    };

    let outputs: TerraformOutputs =
        serde_json::from_str(json).map_err(|err| output_error(err.to_string()))?;
    let public = outputs.public_ips.value;
    let private = outputs.private_ips.value;
    if public.len() != private.len() {
        return Err(output_error(format!(
            "public_ips lists {} address(es) but private_ips lists {}",
            public.len(),
            private.len()
        )));
    }

    let parse = |raw: &str| {
        raw.trim()
            .parse::<IpAddr>()
            .map_err(|err| output_error(format!("invalid address '{raw}': {err}")))
    };

    public
        .iter()
        .zip(private.iter())
        .enumerate()
        .map(|(index, (public_raw, private_raw))| {
            let public_addr = parse(public_raw)?;
            Ok(Node {
                name: format!("node-{}", index + 1),
                public_addr,
                private_addr: parse(private_raw)?,
                ssh: SshEndpoint::new(public_addr, settings.ssh_user.clone())
                    .with_identity_file(settings.ssh_key_path.clone()),
            })
        })
        .collect()
}
