//! Tests for the infrastructure facade and its snapshots.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::provisioner::BackendState;
use crate::ssh::SshConfig;
use crate::test_support::{ScriptedProvisioner, ScriptedRunner, sample_node};

fn ssh_config(ssh_bin: &str) -> SshConfig {
    SshConfig {
        ssh_bin: ssh_bin.to_owned(),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        ssh_connect_timeout_secs: 10,
    }
}

fn client(runner: &ScriptedRunner) -> SshClient<ScriptedRunner> {
    SshClient::new(ssh_config("ssh"), runner.clone()).expect("valid ssh config")
}

#[fixture]
fn provisioner() -> ScriptedProvisioner {
    ScriptedProvisioner::new(
        BackendKind::Terraform,
        vec![
            sample_node("node-1", [203, 0, 113, 1], [10, 0, 0, 1]),
            sample_node("node-2", [203, 0, 113, 2], [10, 0, 0, 2]),
        ],
    )
}

fn quick_bootstrap() -> BootstrapOptions {
    BootstrapOptions {
        ssh_retry: RetryPolicy::new(Duration::from_millis(1), 2),
        timeout: Duration::from_secs(5),
        cancel: CancellationToken::new(),
        echo: false,
    }
}

fn entry_url() -> Url {
    Url::parse("https://ops.example.com:32009/login?next=home").expect("valid url")
}

#[rstest]
#[case("local", InfraKind::Local)]
#[case(" Remote ", InfraKind::Remote)]
fn parses_infra_kinds(#[case] raw: &str, #[case] expected: InfraKind) {
    assert_eq!(raw.parse::<InfraKind>().expect("known kind"), expected);
}

#[rstest]
fn rejects_unknown_infra_kinds() {
    let err = "cloud".parse::<InfraKind>().expect_err("unknown kind");
    assert!(matches!(err, InfraError::UnknownKind { name } if name == "cloud"));
}

#[rstest]
fn portal_url_replaces_path_and_query() {
    let mut infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    infra
        .set_portal_url("https://ops.example.com:32009/login?next=home")
        .expect("valid entry url");

    assert_eq!(
        infra.ops_center_url().map(Url::as_str),
        Some("https://ops.example.com:32009/web/portal")
    );
}

#[rstest]
fn cluster_url_points_at_the_site_page() {
    let infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    let url = infra.cluster_url("prod-east").expect("cluster url");
    assert_eq!(url.as_str(), "https://ops.example.com:32009/web/site/prod-east");
}

#[rstest]
fn cluster_url_requires_an_ops_center(provisioner: ScriptedProvisioner) {
    let infra = Infra::local("dev", provisioner, None);
    assert!(matches!(infra.cluster_url("any"), Err(InfraError::Url { .. })));
}

#[rstest]
fn portal_url_rejects_invalid_entries() {
    let mut infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    let err = infra.set_portal_url("not a url").expect_err("invalid entry");
    assert!(matches!(err, InfraError::Url { base, .. } if base == "not a url"));
    assert_eq!(infra.ops_center_url(), Some(&entry_url()));
}

#[rstest]
#[tokio::test]
async fn init_without_installer_only_creates_nodes(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    let observer = provisioner.clone();
    let mut infra = Infra::local("dev", provisioner, None);

    infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect("init succeeds");

    assert_eq!(observer.create_calls(), 1);
    assert!(runner.invocations().is_empty());
    assert_eq!(infra.nodes().len(), 2);
    assert!(infra.wizard_url().is_none());
}

#[rstest]
#[tokio::test]
async fn remote_init_is_a_no_op() {
    let runner = ScriptedRunner::new();
    let mut infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());

    infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect("nothing to do");

    assert!(infra.nodes().is_empty());
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn init_propagates_create_failures(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    let failing = provisioner.failing_create(ProvisionerError::PoolExhausted { total: 0 });
    let mut infra = Infra::local("dev", failing, Some(Utf8PathBuf::from("/bundles/app.tar")));

    let err = infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect_err("create fails");

    assert!(matches!(
        err,
        InfraError::Provisioner(ProvisionerError::PoolExhausted { total: 0 })
    ));
}

#[rstest]
#[tokio::test]
async fn init_reports_an_unreachable_bootstrap_node(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    runner.push_failure(255, "connection refused");
    runner.push_failure(255, "connection refused");
    let mut infra = Infra::local("dev", provisioner, Some(Utf8PathBuf::from("/bundles/app.tar")));

    let err = infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect_err("node never answers");

    assert!(matches!(
        err,
        InfraError::Connect(RetryError::Exhausted { attempts: 2, .. })
    ));
    assert_eq!(runner.invocations().len(), 2);
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn init_times_out_when_the_wizard_never_starts(provisioner: ScriptedProvisioner) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().expect("temp dir");
    let script = dir.path().join("fake-ssh");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    let script_path = script.to_str().expect("utf-8 path");

    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = SshClient::new(ssh_config(script_path), runner).expect("valid ssh config");
    let mut options = quick_bootstrap();
    options.timeout = Duration::from_millis(200);
    let mut infra = Infra::local("dev", provisioner, Some(Utf8PathBuf::from("/bundles/app.tar")));

    let err = infra.init(&ssh, &options).await.expect_err("deadline elapses");

    assert!(matches!(err, InfraError::BootstrapTimeout(timeout) if timeout == Duration::from_millis(200)));
    assert!(infra.wizard_url().is_none());
    infra.close().await.expect("nothing to close");
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn unexpected_wizard_url_closes_the_session(provisioner: ScriptedProvisioner) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().expect("temp dir");
    let pid_file = dir.path().join("ssh.pid");
    let script = dir.path().join("fake-ssh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho $$ > '{}'\necho 'OPEN THIS IN BROWSER: https://10.0.0.5:3009/web/site/x'\nexec sleep 30\n",
            pid_file.display()
        ),
    )
    .expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    let script_path = script.to_str().expect("utf-8 path");

    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = SshClient::new(ssh_config(script_path), runner).expect("valid ssh config");
    let mut infra = Infra::local("dev", provisioner, Some(Utf8PathBuf::from("/bundles/app.tar")));

    let err = infra.init(&ssh, &quick_bootstrap()).await.expect_err("not an installer URL");

    assert!(matches!(err, InfraError::Extract(ExtractError::InvalidPath { .. })), "{err}");
    assert!(!infra.has_active_session());
    assert!(infra.wizard_url().is_none());
    let pid = std::fs::read_to_string(&pid_file).expect("pid recorded");
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .expect("run kill");
    assert!(!alive.success(), "ssh client {} was not reaped", pid.trim());
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn waiting_returns_once_the_installer_exits(provisioner: ScriptedProvisioner) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().expect("temp dir");
    let script = dir.path().join("fake-ssh");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         echo 'OPEN THIS IN BROWSER: https://10.1.0.10:3009/web/installer/new/acme.io/app/1.0.0'\n\
         sleep 1\n\
         exit 0\n",
    )
    .expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    let script_path = script.to_str().expect("utf-8 path");

    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = SshClient::new(ssh_config(script_path), runner).expect("valid ssh config");
    let mut infra = Infra::local("dev", provisioner, Some(Utf8PathBuf::from("/bundles/app.tar")));
    infra.init(&ssh, &quick_bootstrap()).await.expect("wizard URL found");
    assert!(infra.has_active_session());

    tokio::time::timeout(Duration::from_secs(10), infra.wait_for_installer())
        .await
        .expect("installer exit is observed")
        .expect("wait succeeds");

    infra.close().await.expect("close after exit");
    assert!(!infra.has_active_session());
}

#[rstest]
#[tokio::test]
async fn waiting_without_a_session_returns_immediately() {
    let mut infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    infra.wait_for_installer().await.expect("nothing to wait for");
}

#[rstest]
#[tokio::test]
async fn destroy_requires_a_provisioner() {
    let mut infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    assert!(matches!(infra.destroy().await, Err(InfraError::NoProvisioner)));
}

#[rstest]
#[tokio::test]
async fn distribute_targets_allocated_nodes_first(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    let mut infra = Infra::local("dev", provisioner, None);
    infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect("init succeeds");
    let allocated = infra
        .provisioner()
        .expect("local infra")
        .allocate()
        .expect("free node");

    runner.push_success();
    infra
        .distribute(&client(&runner), &RemoteCommand::new("uptime"))
        .await
        .expect("command runs");

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    let destination = format!("tester@{}", allocated.public_addr);
    let invocation = invocations.first().expect("one invocation");
    assert!(invocation.command_string().contains(&destination));
}

#[rstest]
#[tokio::test]
async fn distribute_falls_back_to_every_node(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    let mut infra = Infra::local("dev", provisioner, None);
    infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect("init succeeds");

    runner.push_success();
    runner.push_success();
    infra
        .distribute(&client(&runner), &RemoteCommand::new("uptime"))
        .await
        .expect("command runs");

    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn snapshot_restores_local_infrastructure(provisioner: ScriptedProvisioner) {
    let runner = ScriptedRunner::new();
    let observer = provisioner.clone();
    let mut infra = Infra::local("dev", provisioner, None);
    infra
        .init(&client(&runner), &quick_bootstrap())
        .await
        .expect("init succeeds");
    infra
        .set_portal_url("https://ops.example.com:32009/")
        .expect("valid url");

    let snapshot = infra.snapshot().expect("snapshot");
    let encoded = serde_json::to_string(&snapshot).expect("encode");
    let decoded: InfraSnapshot = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded, snapshot);
    assert_eq!(decoded.backend, Some(BackendKind::Terraform));

    let restored = Infra::from_snapshot(decoded, Some(observer)).expect("restore");
    assert_eq!(restored.kind(), InfraKind::Local);
    assert_eq!(restored.name(), "dev");
    assert_eq!(
        restored.ops_center_url().map(Url::as_str),
        Some("https://ops.example.com:32009/web/portal")
    );
}

#[rstest]
fn remote_snapshot_omits_backend_fields() {
    let infra = Infra::<ScriptedProvisioner>::remote("staging", entry_url());
    let snapshot = infra.snapshot().expect("snapshot");
    let encoded = serde_json::to_value(&snapshot).expect("encode");

    assert_eq!(encoded["infra"], "remote");
    assert!(encoded.get("backend").is_none());
    assert!(encoded.get("provisioner_state").is_none());
    assert!(Infra::<ScriptedProvisioner>::from_snapshot(snapshot, None).is_ok());
}

fn local_snapshot(backend: Option<BackendKind>, state: Option<ProvisionerState>) -> InfraSnapshot {
    InfraSnapshot {
        infra: InfraKind::Local,
        name: String::from("dev"),
        ops_center_url: None,
        wizard_url: None,
        application: None,
        backend,
        provisioner_state: state,
    }
}

fn vagrant_state() -> ProvisionerState {
    ProvisionerState::Vagrant(BackendState {
        state_dir: Utf8PathBuf::from("/tmp/state"),
        install_dir: String::from("/vagrant"),
        nodes: Vec::new(),
        allocated: Vec::new(),
    })
}

#[rstest]
fn validate_rejects_mismatched_backend_state() {
    let snapshot = local_snapshot(Some(BackendKind::Terraform), Some(vagrant_state()));
    assert!(matches!(
        snapshot.validate(),
        Err(InfraError::StateMismatch {
            expected: BackendKind::Terraform,
            found: BackendKind::Vagrant,
        })
    ));
}

#[rstest]
#[case(local_snapshot(None, Some(vagrant_state())))]
#[case(local_snapshot(Some(BackendKind::Vagrant), None))]
fn validate_rejects_incomplete_local_snapshots(#[case] snapshot: InfraSnapshot) {
    assert!(matches!(snapshot.validate(), Err(InfraError::InvalidSnapshot(_))));
}

#[rstest]
fn validate_rejects_remote_snapshots_with_backend_state() {
    let mut snapshot = local_snapshot(Some(BackendKind::Vagrant), Some(vagrant_state()));
    snapshot.infra = InfraKind::Remote;
    assert!(matches!(snapshot.validate(), Err(InfraError::InvalidSnapshot(_))));
}

#[rstest]
fn local_restore_requires_a_provisioner() {
    let snapshot = local_snapshot(Some(BackendKind::Vagrant), Some(vagrant_state()));
    assert!(matches!(
        Infra::<ScriptedProvisioner>::from_snapshot(snapshot, None),
        Err(InfraError::NoProvisioner)
    ));
}
