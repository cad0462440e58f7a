//! Vagrant-backed provisioner for local virtual machines.
//!
//! Machines are reached through the forwarded SSH ports reported by
//! `vagrant ssh-config`, while the cluster itself runs on the host-only
//! network. VirtualBox gives every machine the same NAT address, which the
//! installer must never advertise.

use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::{
    BackendKind, BackendState, DEFAULT_SSH_PORT, Node, NodePool, Provisioner, ProvisionerError,
    ProvisionerFuture, ProvisionerState, SshEndpoint, VagrantRequest, command_error,
    launch_installer, stage_script,
};
use crate::command::{CommandOutput, CommandRunner, run_blocking};
use crate::ssh::WizardSession;

/// Executable used when no explicit binary is configured.
pub const DEFAULT_VAGRANT_BIN: &str = "vagrant";

/// Address VirtualBox assigns to the NAT interface of every guest.
pub const NAT_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

const VAGRANTFILE: &str = "Vagrantfile";
const DEFAULT_VAGRANT_USER: &str = "vagrant";

/// Provisioner managing local virtual machines through Vagrant.
#[derive(Debug)]
pub struct VagrantProvisioner<R> {
    settings: Option<VagrantRequest>,
    binary: String,
    install_dir: String,
    installer_path: Option<Utf8PathBuf>,
    state_dir: Utf8PathBuf,
    pool: NodePool,
    runner: R,
}

impl<R> VagrantProvisioner<R> {
    /// Creates a provisioner that stages its Vagrantfile into `state_dir`.
    #[must_use]
    pub fn new(settings: VagrantRequest, state_dir: &Utf8Path, runner: R) -> Self {
        Self {
            binary: settings.vagrant_bin.clone(),
            install_dir: settings.install_dir.clone(),
            settings: Some(settings),
            installer_path: None,
            state_dir: state_dir.to_path_buf(),
            pool: NodePool::default(),
            runner,
        }
    }

    /// Creates a provisioner to be populated from a recorded
    /// [`ProvisionerState`]. It can destroy machines but not create them.
    #[must_use]
    pub fn detached(runner: R) -> Self {
        Self {
            settings: None,
            binary: DEFAULT_VAGRANT_BIN.to_owned(),
            install_dir: String::new(),
            installer_path: None,
            state_dir: Utf8PathBuf::new(),
            pool: NodePool::default(),
            runner,
        }
    }

    /// Sets the local installer bundle exposed to the Vagrantfile.
    #[must_use]
    pub fn with_installer_path(mut self, installer_path: Option<Utf8PathBuf>) -> Self {
        self.installer_path = installer_path;
        self
    }
}

impl<R> VagrantProvisioner<R>
where
    R: CommandRunner + Clone + Send + 'static,
{
    fn invocation(
        &self,
        args: &[&str],
        extra_env: &[(String, String)],
    ) -> (Vec<OsString>, Vec<(String, String)>) {
        let mut env = vec![(String::from("VAGRANT_CWD"), self.state_dir.to_string())];
        env.extend_from_slice(extra_env);
        (args.iter().map(OsString::from).collect(), env)
    }

    fn vagrant(
        &self,
        action: &str,
        args: &[&str],
        extra_env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionerError> {
        let (os_args, env) = self.invocation(args, extra_env);
        debug!(action, state_dir = %self.state_dir, "running vagrant");
        self.runner
            .run_with_env(&self.binary, &os_args, &env)
            .and_then(|output| output.into_success(&self.binary))
            .map_err(command_error(action))
    }

    /// Runs the long `up`/`destroy` commands off the async runtime.
    async fn vagrant_pooled(
        &self,
        action: &str,
        args: &[&str],
        extra_env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionerError> {
        let (os_args, env) = self.invocation(args, extra_env);
        debug!(action, state_dir = %self.state_dir, "running vagrant");
        run_blocking(self.runner.clone(), self.binary.clone(), os_args, env)
            .await
            .and_then(|output| output.into_success(&self.binary))
            .map_err(command_error(action))
    }

    fn discover_nodes(&self) -> Result<Vec<Node>, ProvisionerError> {
        let output = self.vagrant("vagrant ssh-config", &["ssh-config"], &[])?;
        parse_ssh_config(&output.stdout)?
            .into_iter()
            .map(|entry| {
                let addresses = self.vagrant(
                    "vagrant ssh hostname -I",
                    &["ssh", &entry.host, "-c", "hostname -I"],
                    &[],
                )?;
                let host_only = pick_host_only_address(&addresses.stdout).ok_or_else(|| {
                    ProvisionerError::Output {
                        action: String::from("vagrant ssh hostname -I"),
                        message: format!("machine {} reports no host-only address", entry.host),
                    }
                })?;
                Ok(Node {
                    public_addr: host_only,
                    private_addr: host_only,
                    ssh: SshEndpoint::new(entry.hostname, entry.user)
                        .with_port(entry.port)
                        .with_identity_file(entry.identity_file),
                    name: entry.host,
                })
            })
            .collect()
    }
}

impl<R> Provisioner for VagrantProvisioner<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    fn create(&mut self, with_installer: bool) -> ProvisionerFuture<'_, Node> {
        Box::pin(async move {
            let settings = self.settings.as_ref().ok_or_else(|| {
                ProvisionerError::Config(String::from(
                    "vagrant settings are required to create infrastructure",
                ))
            })?;
            stage_script(&settings.script_path, &self.state_dir, VAGRANTFILE)?;

            let mut env = vec![(String::from("RIGGER_NODES"), settings.nodes.to_string())];
            if with_installer {
                let path = self.installer_path.as_ref().ok_or_else(|| {
                    ProvisionerError::Config(String::from(
                        "an installer bundle path is required to upload the installer",
                    ))
                })?;
                env.push((String::from("RIGGER_INSTALLER_PATH"), path.to_string()));
            }

            info!(nodes = settings.nodes, state_dir = %self.state_dir, "starting vagrant machines");
            self.vagrant_pooled("vagrant up", &["up"], &env).await?;
            let nodes = self.discover_nodes()?;

            self.pool = NodePool::new(nodes);
            self.pool
                .nodes()
                .first()
                .cloned()
                .ok_or(ProvisionerError::NotProvisioned)
        })
    }

    fn destroy(&mut self) -> ProvisionerFuture<'_, ()> {
        Box::pin(async move {
            self.vagrant_pooled("vagrant destroy", &["destroy", "-f"], &[]).await?;
            self.pool = NodePool::default();
            info!(state_dir = %self.state_dir, "vagrant machines destroyed");
            Ok(())
        })
    }

    fn select_interface(
        &self,
        bootstrap: &Node,
        addrs: &[IpAddr],
    ) -> Result<usize, ProvisionerError> {
        if let Some(index) = addrs.iter().position(|addr| *addr == bootstrap.private_addr) {
            return Ok(index);
        }
        addrs
            .iter()
            .position(|addr| !is_nat_address(*addr))
            .ok_or_else(|| {
                ProvisionerError::InterfaceSelection(String::from(
                    "only the VirtualBox NAT interface is available",
                ))
            })
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
        BackendKind::Vagrant
    }

    fn state(&self) -> Result<ProvisionerState, ProvisionerError> {
        Ok(ProvisionerState::Vagrant(BackendState {
            state_dir: self.state_dir.clone(),
            install_dir: self.install_dir.clone(),
            nodes: self.pool.nodes().to_vec(),
            allocated: self.pool.allocated_names()?,
        }))
    }

    fn update_with_state(&mut self, state: ProvisionerState) -> Result<(), ProvisionerError> {
        let recorded = state.into_backend_state(BackendKind::Vagrant)?;
        self.state_dir = recorded.state_dir;
        self.install_dir = recorded.install_dir;
        self.pool = NodePool::with_allocated(recorded.nodes, recorded.allocated);
        Ok(())
    }
}

/// One `Host` block from `vagrant ssh-config`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SshConfigEntry {
    pub(crate) host: String,
    pub(crate) hostname: IpAddr,
    pub(crate) port: u16,
    pub(crate) user: String,
    pub(crate) identity_file: Option<Utf8PathBuf>,
}

#[derive(Default)]
struct PartialEntry {
    host: String,
    hostname: Option<String>,
    port: Option<String>,
    user: Option<String>,
    identity_file: Option<String>,
}

impl PartialEntry {
    fn finish(self) -> Result<SshConfigEntry, ProvisionerError> {
        let output_error = |message: String| ProvisionerError::Output {
            action: String::from("vagrant ssh-config"),
            message,
        };
        let raw_hostname = self
            .hostname
            .ok_or_else(|| output_error(format!("host {} has no HostName", self.host)))?;
        let hostname = raw_hostname
            .parse::<IpAddr>()
            .map_err(|err| output_error(format!("invalid HostName '{raw_hostname}': {err}")))?;
        let port = self
            .port
            .map(|raw| {
                raw.parse::<u16>()
                    .map_err(|err| output_error(format!("invalid Port '{raw}': {err}")))
            })
            .transpose()?
            .unwrap_or(DEFAULT_SSH_PORT);

        Ok(SshConfigEntry {
            host: self.host,
            hostname,
            port,
            user: self.user.unwrap_or_else(|| DEFAULT_VAGRANT_USER.to_owned()),
            identity_file: self
                .identity_file
                .map(|path| Utf8PathBuf::from(path.trim_matches('"'))),
        })
    }
}

/// Parses the OpenSSH client configuration printed by `vagrant ssh-config`.
pub(crate) fn parse_ssh_config(text: &str) -> Result<Vec<SshConfigEntry>, ProvisionerError> {
    let mut entries = Vec::new();
    let mut current: Option<PartialEntry> = None;

    for line in text.lines() {
        let Some((key, raw_value)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let value = raw_value.trim().to_owned();
        match key {
            "Host" => {
                if let Some(entry) = current.take() {
                    entries.push(entry.finish()?);
                }
                current = Some(PartialEntry {
                    host: value,
                    ..PartialEntry::default()
                });
            }
            "HostName" | "Port" | "User" | "IdentityFile" => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                let slot = match key {
                    "HostName" => &mut entry.hostname,
                    "Port" => &mut entry.port,
                    "User" => &mut entry.user,
                    _ => &mut entry.identity_file,
                };
                slot.get_or_insert(value);
            }
            _ => {}
        }
    }
    if let Some(entry) = current {
        entries.push(entry.finish()?);
    }
    Ok(entries)
}

/// Picks the first address from `hostname -I` output that is not the
/// VirtualBox NAT address.
pub(crate) fn pick_host_only_address(output: &str) -> Option<IpAddr> {
    output
        .split_whitespace()
        .filter_map(|raw| raw.parse::<IpAddr>().ok())
        .find(|addr| addr.is_ipv4() && !is_nat_address(*addr))
}

fn is_nat_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            let [nat_a, nat_b, nat_c, _] = NAT_ADDRESS.octets();
            a == nat_a && b == nat_b && c == nat_c
        }
        IpAddr::V6(_) => false,
    }
}
