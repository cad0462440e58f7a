//! Tests for installer command construction and status polling.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::ssh::SshConfig;
use crate::test_support::{ScriptedRunner, sample_node};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn client(runner: &ScriptedRunner) -> SshClient<ScriptedRunner> {
    let config = SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        ssh_connect_timeout_secs: 10,
    };
    SshClient::new(config, runner.clone()).expect("valid config")
}

fn last_remote_command(runner: &ScriptedRunner) -> String {
    runner
        .invocations()
        .last()
        .and_then(|call| call.args.last().map(|arg| arg.to_string_lossy().into_owned()))
        .expect("ssh invocation")
}

#[rstest]
fn install_command_carries_escaped_flags(runner: ScriptedRunner) {
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-1", [54, 0, 0, 10], [10, 1, 0, 10]),
        "/home/centos/installer",
    );

    let command = node.install_command(&InstallParams {
        token: String::from("s3cr3t"),
        flavor: Some(String::from("three nodes")),
        docker_device: Some(String::from("/dev/xvdb")),
        ..InstallParams::default()
    });

    assert_eq!(
        command.render(),
        "cd /home/centos/installer && sudo ./gravity install --advertise-addr 10.1.0.10 \
         --token s3cr3t --flavor 'three nodes' --docker-device /dev/xvdb"
    );
}

#[rstest]
fn join_command_targets_peer(runner: ScriptedRunner) {
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-2", [54, 0, 0, 11], [10, 1, 0, 11]),
        "/opt/inst",
    );

    let command = node.join_command(&JoinParams {
        peer: String::from("10.1.0.10"),
        token: String::from("abc"),
        role: String::from("worker"),
        docker_device: None,
    });

    assert_eq!(
        command.render(),
        "cd /opt/inst && sudo ./gravity join 10.1.0.10 --advertise-addr 10.1.0.11 --token abc --role worker"
    );
}

#[rstest]
fn install_reports_installer_failures(runner: ScriptedRunner) {
    runner.push_failure(2, "insufficient disk space\n");
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-1", [54, 0, 0, 10], [10, 1, 0, 10]),
        "/opt/inst",
    );

    let err = node
        .install(&InstallParams {
            token: String::from("abc"),
            ..InstallParams::default()
        })
        .expect_err("installer failure should surface");

    match err {
        ClusterError::Exit { node, status, stderr, .. } => {
            assert_eq!(node, "node-1");
            assert_eq!(status, "2");
            assert_eq!(stderr, "insufficient disk space");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[rstest]
fn status_parses_remote_report(runner: ScriptedRunner) {
    runner.push_stdout("Cluster: demo\nJoin token: abc123\nnode-1 (10.1.0.10) healthy\n");
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-1", [54, 0, 0, 10], [10, 1, 0, 10]),
        "/opt/inst",
    );

    let status = node.status().expect("status should parse");

    assert_eq!(status.name, "demo");
    assert_eq!(status.token.token, "abc123");
    assert_eq!(last_remote_command(&runner), "cd /opt/inst && sudo ./gravity status");
}

#[rstest]
#[tokio::test]
async fn wait_for_status_merges_reports_until_ready(runner: ScriptedRunner) {
    runner.push_failure(1, "status unavailable");
    runner.push_stdout("Cluster: demo\nJoin token: abc123\nStatus: installing\n");
    runner.push_stdout("Cluster: demo\nStatus: active\nnode-1 (10.1.0.10) healthy\n");
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-1", [54, 0, 0, 10], [10, 1, 0, 10]),
        "/opt/inst",
    );

    let status = node
        .wait_for_status(
            RetryPolicy::new(Duration::ZERO, 5),
            &CancellationToken::new(),
            |report| report.status == "active",
        )
        .await
        .expect("cluster should become active");

    assert_eq!(status.status, "active");
    assert_eq!(status.token.token, "abc123");
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(runner.invocations().len(), 3);
}

#[rstest]
#[tokio::test]
async fn wait_for_status_aborts_on_unparseable_report(runner: ScriptedRunner) {
    runner.push_stdout("{\"domain\": ");
    let ssh = client(&runner);
    let node = ClusterNode::new(
        &ssh,
        sample_node("node-1", [54, 0, 0, 10], [10, 1, 0, 10]),
        "/opt/inst",
    );

    let err = node
        .wait_for_status(RetryPolicy::new(Duration::ZERO, 5), &CancellationToken::new(), |_| true)
        .await
        .expect_err("malformed JSON is not retried");

    assert!(matches!(err, RetryError::Aborted(ClusterError::Status(_))));
}

#[rstest]
fn default_poll_policy_waits_between_reports() {
    let policy = status_poll_policy();
    assert_eq!(policy.delay, Duration::from_secs(10));
    assert!(policy.max_attempts > 1);
}
