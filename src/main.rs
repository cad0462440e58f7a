//! Binary entry point for the Rigger CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rigger::{
    AwsConfig, BackendFactory, BootstrapOptions, ClusterError, ClusterNode, ConfigError,
    InfraConfig, InfraError, InfraKind, Lifecycle, LifecycleError, ProcessCommandRunner,
    RemoteCommand, ShutdownOutcome, SnapshotError, SnapshotStore, SshClient, SshConfig,
};

mod cli;

use cli::{Cli, Command, DownCommand, InitKind, RunCommand, StatusCommand, UpCommand};

type Runner = ProcessCommandRunner;
type ActiveLifecycle = Lifecycle<rigger::AnyProvisioner<Runner>>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("ssh configuration error: {0}")]
    Ssh(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("cluster status failed: {0}")]
    Cluster(#[from] ClusterError),
    #[error(
        "infrastructure must be initialized: no state file at {0}; \
         run `rigger up --init local|remote`"
    )]
    NotInitialized(String),
    #[error("{0} infrastructure has no nodes to run commands on")]
    NoNodes(InfraKind),
    #[error("{source}: {config}")]
    Teardown {
        source: LifecycleError,
        config: ConfigError,
    },
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let store = SnapshotStore::new(cli.state_file);
    match cli.command {
        Command::Up(args) => up(store, &args).await,
        Command::Status(args) => status(&store, &args),
        Command::Run(args) => run(store, &args).await,
        Command::Down(args) => down(store, &args).await,
    }
}

struct Context {
    infra: InfraConfig,
    aws: AwsConfig,
    ssh: SshClient<Runner>,
}

impl Context {
    fn load() -> Result<Self, CliError> {
        let ssh_config =
            SshConfig::load_without_cli_args().map_err(|err| CliError::Ssh(err.to_string()))?;
        let ssh = SshClient::with_process_runner(ssh_config)
            .map_err(|err| CliError::Ssh(err.to_string()))?;
        Ok(Self {
            infra: InfraConfig::load_without_cli_args()?,
            aws: AwsConfig::load_without_cli_args()?,
            ssh,
        })
    }

    /// Backend settings are optional when resuming; without them the
    /// reattached provisioner can report state but not destroy it.
    fn factory(&self) -> BackendFactory<Runner> {
        let configured = match self.infra.as_request(&self.aws) {
            Ok(request) => Some(request),
            Err(err) if self.infra.provisioner.is_some() => {
                warn!(error = %err, "invalid backend settings; nodes cannot be destroyed");
                None
            }
            Err(err) => {
                debug!(error = %err, "no backend configured");
                None
            }
        };
        BackendFactory::new(ProcessCommandRunner).with_configured(configured.as_ref())
    }

    async fn resume(&self, store: SnapshotStore) -> Result<ActiveLifecycle, CliError> {
        let bootstrap = BootstrapOptions::default();
        Ok(Lifecycle::initialize(store, &self.factory(), &self.ssh, None, &bootstrap).await?)
    }
}

async fn up(store: SnapshotStore, args: &UpCommand) -> Result<(), CliError> {
    let context = Context::load()?;
    let init = args
        .init
        .map(|kind| {
            let infra_kind = match kind {
                InitKind::Local => InfraKind::Local,
                InitKind::Remote => InfraKind::Remote,
            };
            context.infra.init_request(infra_kind, &context.aws)
        })
        .transpose()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    let bootstrap = BootstrapOptions {
        cancel: cancel.clone(),
        echo: !args.no_echo,
        ..BootstrapOptions::default()
    };

    let mut lifecycle =
        Lifecycle::initialize(store, &context.factory(), &context.ssh, init, &bootstrap).await?;
    print_summary(&lifecycle)?;

    if lifecycle.infra().has_active_session() && !args.detach {
        info!("installer is running; press Ctrl-C to stop it");
        tokio::select! {
            () = cancel.cancelled() => info!("interrupted; stopping installer"),
            exited = lifecycle.infra_mut().wait_for_installer() => {
                if let Err(err) = exited {
                    warn!(error = %err, "lost track of the installer session");
                }
            }
        }
    }
    lifecycle.shutdown(false).await?;
    Ok(())
}

fn print_summary(lifecycle: &ActiveLifecycle) -> Result<(), CliError> {
    let infra = lifecycle.infra();
    let mut stdout = io::stdout();
    let mut line = |text: String| {
        writeln!(stdout, "{text}").map_err(|err| CliError::Output(err.to_string()))
    };
    line(format!("{} infrastructure '{}' is ready", infra.kind(), infra.name()))?;
    if let Some(url) = infra.ops_center_url() {
        line(format!("ops center: {url}"))?;
    }
    if let Some(url) = infra.wizard_url() {
        line(format!("wizard: {url}"))?;
    }
    if let Some(application) = infra.application() {
        line(format!("application: {application}"))?;
    }
    for node in infra.nodes() {
        line(format!(
            "node {}: {} ({})",
            node.name, node.public_addr, node.private_addr
        ))?;
    }
    Ok(())
}

fn status(store: &SnapshotStore, args: &StatusCommand) -> Result<(), CliError> {
    let snapshot = store
        .load()?
        .ok_or_else(|| CliError::NotInitialized(store.path().to_string()))?;
    let mut report = serde_json::json!({ "infra": &snapshot });

    if args.cluster {
        let context = Context::load()?;
        let (node, install_dir) = snapshot
            .provisioner_state
            .as_ref()
            .and_then(|state| {
                let recorded = state.backend_state();
                recorded
                    .nodes
                    .first()
                    .map(|node| (node.clone(), recorded.install_dir.clone()))
            })
            .ok_or(CliError::NoNodes(snapshot.infra))?;
        let cluster = ClusterNode::new(&context.ssh, node, install_dir).status()?;
        report["cluster"] = serde_json::json!(cluster);
    }

    let rendered =
        serde_json::to_string_pretty(&report).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

async fn run(store: SnapshotStore, args: &RunCommand) -> Result<(), CliError> {
    validate_command_args(&args.command)?;
    let command = RemoteCommand::from_argv(&args.command)
        .ok_or_else(|| CliError::InvalidCommand(String::from("command must not be empty")))?;
    require_snapshot(&store)?;

    let context = Context::load()?;
    let lifecycle = context.resume(store).await?;
    if lifecycle.infra().kind() == InfraKind::Remote {
        return Err(CliError::NoNodes(InfraKind::Remote));
    }
    let outcome = lifecycle.infra().distribute(&context.ssh, &command).await;
    lifecycle.shutdown(false).await?;
    outcome.map_err(CliError::from)
}

async fn down(store: SnapshotStore, args: &DownCommand) -> Result<(), CliError> {
    require_snapshot(&store)?;
    let context = Context::load()?;
    let lifecycle = context.resume(store).await?;
    let outcome = match lifecycle.shutdown(args.destroy).await {
        Err(source @ LifecycleError::TeardownUnavailable { .. }) => {
            return Err(match context.infra.as_request(&context.aws) {
                Err(config) => CliError::Teardown { source, config },
                Ok(_) => CliError::Lifecycle(source),
            });
        }
        other => other?,
    };
    match outcome {
        ShutdownOutcome::Destroyed => info!("infrastructure destroyed"),
        ShutdownOutcome::Retained => {
            warn!("infrastructure retained; pass --destroy to tear it down");
        }
    }
    Ok(())
}

fn require_snapshot(store: &SnapshotStore) -> Result<(), CliError> {
    if store.load()?.is_none() {
        return Err(CliError::NotInitialized(store.path().to_string()));
    }
    Ok(())
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
