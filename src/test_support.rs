//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::provisioner::{
    BackendKind, BackendState, InfraRequest, Node, NodePool, Provisioner, ProvisionerError,
    ProvisionerFactory, ProvisionerFuture, ProvisionerState, SshEndpoint, launch_installer,
};
use crate::ssh::WizardSession;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the same queue and invocation log, so a clone handed to the
/// code under test can be inspected afterwards.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables passed to the program.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    /// Returns the value of an environment variable passed to the program.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_with_env(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Builds a node reachable on the default SSH port as `tester`.
#[must_use]
pub fn sample_node(name: &str, public: [u8; 4], private: [u8; 4]) -> Node {
    let public_addr = IpAddr::V4(Ipv4Addr::from(public));
    Node {
        name: name.to_owned(),
        public_addr,
        private_addr: IpAddr::V4(Ipv4Addr::from(private)),
        ssh: SshEndpoint::new(public_addr, "tester"),
    }
}

#[derive(Debug)]
struct ScriptedState {
    template: Vec<Node>,
    pool: NodePool,
    state_dir: Utf8PathBuf,
    install_dir: String,
    selection: Option<usize>,
    create_error: Option<ProvisionerError>,
    destroy_error: Option<ProvisionerError>,
    destroy_disabled: bool,
    create_calls: usize,
    destroy_calls: usize,
    restored: Vec<ProvisionerState>,
}

/// In-memory provisioner with scripted outcomes and call counters.
///
/// Clones share state, so tests keep a clone to observe calls made by the
/// lifecycle that owns the other.
#[derive(Clone, Debug)]
pub struct ScriptedProvisioner {
    kind: BackendKind,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner that will "create" `nodes`; the first node is
    /// the bootstrap node.
    #[must_use]
    pub fn new(kind: BackendKind, nodes: Vec<Node>) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(ScriptedState {
                template: nodes,
                pool: NodePool::default(),
                state_dir: Utf8PathBuf::from("/tmp/rigger-scripted"),
                install_dir: String::from("/opt/installer"),
                selection: None,
                create_error: None,
                destroy_error: None,
                destroy_disabled: false,
                create_calls: 0,
                destroy_calls: 0,
                restored: Vec::new(),
            })),
        }
    }

    /// Forces [`Provisioner::select_interface`] to return `index`.
    #[must_use]
    pub fn with_selection(self, index: usize) -> Self {
        lock(&self.state).selection = Some(index);
        self
    }

    /// Makes [`Provisioner::create`] fail with `error`.
    #[must_use]
    pub fn failing_create(self, error: ProvisionerError) -> Self {
        lock(&self.state).create_error = Some(error);
        self
    }

    /// Makes [`Provisioner::destroy`] fail with `error`.
    #[must_use]
    pub fn failing_destroy(self, error: ProvisionerError) -> Self {
        lock(&self.state).destroy_error = Some(error);
        self
    }

    /// Reports that [`Provisioner::destroy`] cannot run, as a provisioner
    /// reattached without backend settings does.
    #[must_use]
    pub fn without_destroy(self) -> Self {
        lock(&self.state).destroy_disabled = true;
        self
    }

    /// Sets the remote directory the installer is started from.
    #[must_use]
    pub fn with_install_dir(self, install_dir: &str) -> Self {
        install_dir.clone_into(&mut lock(&self.state).install_dir);
        self
    }

    /// Sets the state directory reported in snapshots.
    pub fn set_state_dir(&self, state_dir: &Utf8Path) {
        lock(&self.state).state_dir = state_dir.to_path_buf();
    }

    /// Number of [`Provisioner::create`] calls so far.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    /// Number of [`Provisioner::destroy`] calls so far.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        lock(&self.state).destroy_calls
    }

    /// States passed to [`Provisioner::update_with_state`].
    #[must_use]
    pub fn restored_states(&self) -> Vec<ProvisionerState> {
        lock(&self.state).restored.clone()
    }
}

impl Provisioner for ScriptedProvisioner {
    fn create(&mut self, _with_installer: bool) -> ProvisionerFuture<'_, Node> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.create_calls += 1;
            if let Some(err) = state.create_error.clone() {
                return Err(err);
            }
            let nodes = state.template.clone();
            state.pool = NodePool::new(nodes);
            state
                .pool
                .nodes()
                .first()
                .cloned()
                .ok_or(ProvisionerError::NotProvisioned)
        })
    }

    fn destroy(&mut self) -> ProvisionerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroy_calls += 1;
            if let Some(err) = state.destroy_error.clone() {
                return Err(err);
            }
            state.pool = NodePool::default();
            Ok(())
        })
    }

    fn can_destroy(&self) -> bool {
        !lock(&self.state).destroy_disabled
    }

    fn select_interface(
        &self,
        bootstrap: &Node,
        addrs: &[IpAddr],
    ) -> Result<usize, ProvisionerError> {
        match lock(&self.state).selection {
            Some(index) => Ok(index),
            None => Ok(addrs
                .iter()
                .position(|addr| *addr == bootstrap.private_addr)
                .unwrap_or(0)),
        }
    }

    fn start_install(&self, session: &mut WizardSession) -> Result<(), ProvisionerError> {
        let install_dir = lock(&self.state).install_dir.clone();
        launch_installer(session, &install_dir)
    }

    fn nodes(&self) -> Vec<Node> {
        lock(&self.state).pool.nodes().to_vec()
    }

    fn allocate(&self) -> Result<Node, ProvisionerError> {
        lock(&self.state).pool.allocate()
    }

    fn deallocate(&self, node: &Node) -> Result<(), ProvisionerError> {
        lock(&self.state).pool.deallocate(node)
    }

    fn allocated_nodes(&self) -> Result<Vec<Node>, ProvisionerError> {
        lock(&self.state).pool.allocated()
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn state(&self) -> Result<ProvisionerState, ProvisionerError> {
        let state = lock(&self.state);
        let recorded = BackendState {
            state_dir: state.state_dir.clone(),
            install_dir: state.install_dir.clone(),
            nodes: state.pool.nodes().to_vec(),
            allocated: state.pool.allocated_names()?,
        };
        Ok(match self.kind {
            BackendKind::Terraform => ProvisionerState::Terraform(recorded),
            BackendKind::Vagrant => ProvisionerState::Vagrant(recorded),
        })
    }

    fn update_with_state(&mut self, state: ProvisionerState) -> Result<(), ProvisionerError> {
        let mut inner = lock(&self.state);
        inner.restored.push(state.clone());
        let recorded = state.into_backend_state(self.kind)?;
        inner.state_dir = recorded.state_dir;
        inner.install_dir = recorded.install_dir;
        inner.pool = NodePool::with_allocated(recorded.nodes, recorded.allocated);
        Ok(())
    }
}

/// Factory handing out clones of a single [`ScriptedProvisioner`].
#[derive(Clone, Debug)]
pub struct ScriptedFactory {
    provisioner: ScriptedProvisioner,
    builds: Arc<Mutex<Vec<Utf8PathBuf>>>,
    reattaches: Arc<Mutex<Vec<BackendKind>>>,
}

impl ScriptedFactory {
    /// Creates a factory around `provisioner`.
    #[must_use]
    pub fn new(provisioner: ScriptedProvisioner) -> Self {
        Self {
            provisioner,
            builds: Arc::default(),
            reattaches: Arc::default(),
        }
    }

    /// State directories passed to [`ProvisionerFactory::build`].
    #[must_use]
    pub fn builds(&self) -> Vec<Utf8PathBuf> {
        lock(&self.builds).clone()
    }

    /// Kinds passed to [`ProvisionerFactory::reattach`].
    #[must_use]
    pub fn reattaches(&self) -> Vec<BackendKind> {
        lock(&self.reattaches).clone()
    }
}

impl ProvisionerFactory for ScriptedFactory {
    type Provisioner = ScriptedProvisioner;

    fn build(
        &self,
        _request: &InfraRequest,
        state_dir: &Utf8Path,
    ) -> Result<Self::Provisioner, ProvisionerError> {
        lock(&self.builds).push(state_dir.to_path_buf());
        self.provisioner.set_state_dir(state_dir);
        Ok(self.provisioner.clone())
    }

    fn reattach(
        &self,
        kind: BackendKind,
        state: ProvisionerState,
    ) -> Result<Self::Provisioner, ProvisionerError> {
        lock(&self.reattaches).push(kind);
        if kind != self.provisioner.kind() {
            return Err(ProvisionerError::StateMismatch {
                expected: self.provisioner.kind(),
                found: kind,
            });
        }
        let mut provisioner = self.provisioner.clone();
        provisioner.update_with_state(state)?;
        Ok(provisioner)
    }
}
