//! Tests for SSH argument construction, probing and fan-out.

use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::*;
use crate::command::CommandOutput;
use crate::test_support::{ScriptedRunner, sample_node};

#[fixture]
fn config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        ssh_connect_timeout_secs: 10,
    }
}

fn args_of(client: &SshClient<ScriptedRunner>, node: &Node) -> Vec<String> {
    client
        .ssh_args(node)
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
fn ssh_args_include_endpoint_and_options(config: SshConfig) {
    let client = SshClient::new(config, ScriptedRunner::new()).expect("valid config");
    let mut node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);
    node.ssh.port = 2222;
    node.ssh.identity_file = Some(camino::Utf8PathBuf::from("/keys/node.pem"));

    assert_eq!(
        args_of(&client, &node),
        vec![
            "-p",
            "2222",
            "-i",
            "/keys/node.pem",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "tester@203.0.113.5",
        ]
    );
}

#[rstest]
fn ssh_args_fall_back_to_configured_identity(mut config: SshConfig) {
    config.ssh_identity_file = Some(String::from("/keys/default"));
    config.ssh_batch_mode = false;
    config.ssh_strict_host_key_checking = true;
    config.ssh_known_hosts_file = String::new();
    config.ssh_connect_timeout_secs = 0;
    let client = SshClient::new(config, ScriptedRunner::new()).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);

    assert_eq!(
        args_of(&client, &node),
        vec!["-p", "22", "-i", "/keys/default", "tester@203.0.113.5"]
    );
}

#[rstest]
fn client_rejects_blank_identity_file(mut config: SshConfig) {
    config.ssh_identity_file = Some(String::from("   "));

    let err = SshClient::new(config, ScriptedRunner::new()).expect_err("blank identity");
    assert_eq!(
        err,
        SshError::InvalidConfig {
            field: String::from("ssh_identity_file")
        }
    );
    assert!(err.to_string().contains("RIGGER_SSH_SSH_IDENTITY_FILE"));
}

#[rstest]
fn run_appends_rendered_command(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("ok\n");
    let client = SshClient::new(config, runner.clone()).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);

    let command = RemoteCommand::new("./gravity").sudo().in_dir("/opt/install dir").arg("status");
    let output = client.run(&node, &command).expect("run should succeed");

    assert!(output.is_success());
    assert_eq!(output.stdout, "ok\n");
    let invocation = runner.invocations().pop().expect("ssh invocation");
    assert_eq!(invocation.program, "ssh");
    assert_eq!(
        invocation.args.last().map(|arg| arg.to_string_lossy().into_owned()),
        Some(String::from("cd '/opt/install dir' && sudo ./gravity status"))
    );
}

#[rstest]
#[case(Some(255), "Connection refused", true)]
#[case(None, "", true)]
fn probe_failures_are_retryable(
    config: SshConfig,
    #[case] code: Option<i32>,
    #[case] stderr: &str,
    #[case] retryable: bool,
) {
    let runner = ScriptedRunner::new();
    runner.push_output(code, "", stderr);
    let client = SshClient::new(config, runner).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);

    let err = client.probe(&node).expect_err("probe should fail");
    assert!(matches!(err, SshError::Unreachable { .. }));
    assert_eq!(err.is_retryable(), retryable);
    assert!(err.to_string().contains(stderr));
}

#[rstest]
fn spawn_failures_are_not_retryable(config: SshConfig) {
    let client = SshClient::new(config, ScriptedRunner::new()).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);

    let err = client.probe(&node).expect_err("no scripted response");
    assert!(matches!(err, SshError::Command(_)));
    assert!(!err.is_retryable());
}

#[rstest]
#[tokio::test]
async fn wait_until_reachable_retries_until_the_host_answers(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_failure(255, "Connection refused");
    runner.push_failure(255, "Connection refused");
    runner.push_success();
    let client = SshClient::new(config, runner.clone()).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);

    client
        .wait_until_reachable(&node, RetryPolicy::new(Duration::ZERO, 5), &CancellationToken::new())
        .await
        .expect("third probe should succeed");

    assert_eq!(runner.invocations().len(), 3);
}

#[derive(Clone, Debug)]
struct HangingRunner;

impl CommandRunner for HangingRunner {
    fn run_with_env(
        &self,
        _program: &str,
        _args: &[OsString],
        _env: &[(String, String)],
    ) -> Result<CommandOutput, CommandError> {
        std::thread::sleep(Duration::from_secs(2));
        Ok(CommandOutput::default())
    }
}

#[rstest]
#[tokio::test]
async fn cancellation_does_not_wait_for_an_attempt_in_flight(config: SshConfig) {
    let client = SshClient::new(config, HangingRunner).expect("valid config");
    let node = sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = client
        .wait_until_reachable(&node, RetryPolicy::new(Duration::ZERO, 5), &cancel)
        .await
        .expect_err("cancelled before the probe returns");

    assert!(matches!(err, RetryError::Timeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[rstest]
#[tokio::test]
async fn distribute_runs_on_every_node(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let client = SshClient::new(config, runner.clone()).expect("valid config");
    let nodes = vec![
        sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]),
        sample_node("node-2", [203, 0, 113, 6], [10, 0, 0, 6]),
    ];

    client
        .distribute(&RemoteCommand::new("uptime"), &nodes)
        .await
        .expect("distribute should succeed");

    let mut hosts: Vec<String> = runner
        .invocations()
        .iter()
        .filter_map(|call| call.args.iter().rev().nth(1).map(|arg| arg.to_string_lossy().into_owned()))
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["tester@203.0.113.5", "tester@203.0.113.6"]);
}

#[rstest]
#[tokio::test]
async fn distribute_aggregates_failures(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_failure(3, "disk full");
    runner.push_failure(3, "disk full");
    let client = SshClient::new(config, runner).expect("valid config");
    let nodes = vec![
        sample_node("node-2", [203, 0, 113, 6], [10, 0, 0, 6]),
        sample_node("node-1", [203, 0, 113, 5], [10, 0, 0, 5]),
    ];

    let err = client
        .distribute(&RemoteCommand::new("df"), &nodes)
        .await
        .expect_err("both nodes fail");

    match &err {
        SshError::Distribute { failures } => {
            let names: Vec<&str> = failures.iter().map(|failure| failure.node.as_str()).collect();
            assert_eq!(names, vec!["node-1", "node-2"]);
        }
        other => panic!("expected aggregated failure, got {other:?}"),
    }
    assert!(err.to_string().starts_with("remote command failed on 2 node(s)"));
}

#[rstest]
#[tokio::test]
async fn distribute_requires_targets(config: SshConfig) {
    let client = SshClient::new(config, ScriptedRunner::new()).expect("valid config");

    let err = client
        .distribute(&RemoteCommand::new("true"), &[])
        .await
        .expect_err("no nodes");
    assert_eq!(err, SshError::NoNodes);
}

#[rstest]
#[case(RemoteCommand::new("./gravity").arg("status"), "./gravity status")]
#[case(
    RemoteCommand::new("./gravity").flag("token", "abc; rm -rf /"),
    "./gravity --token 'abc; rm -rf /'"
)]
#[case(RemoteCommand::new("echo").optional_flag::<&str>("role", None), "echo")]
fn remote_commands_are_escaped(#[case] command: RemoteCommand, #[case] expected: &str) {
    assert_eq!(command.render(), expected);
}

#[rstest]
fn argv_commands_keep_argument_boundaries() {
    let argv = vec![String::from("echo"), String::from("a b"), String::from("c'd")];
    let command = RemoteCommand::from_argv(&argv).expect("non-empty argv");

    assert_eq!(command.render(), r"echo 'a b' 'c'\''d'");
    assert!(RemoteCommand::from_argv(&[]).is_none());
}

#[rstest]
#[tokio::test]
async fn session_streams_output_and_accepts_input() {
    let mut session = WizardSession::new(
        String::from("local"),
        String::from("sh"),
        vec![std::ffi::OsString::from("-c")],
    )
    .with_echo(false);

    assert!(matches!(session.io(), Err(SshError::NotLaunched { .. })));
    session
        .launch(&RemoteCommand::new("cat"))
        .expect("launch should succeed");
    assert!(session.is_active());

    {
        let (output, input) = session.io().expect("session streams");
        input.write_all(b"ping\n").await.expect("write stdin");
        input.flush().await.expect("flush stdin");
        let mut lines = BufReader::new(output).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("echo should arrive")
            .expect("read line");
        assert_eq!(line.as_deref(), Some("ping"));
    }

    session.drain_output();
    tokio::time::timeout(Duration::from_secs(5), session.close())
        .await
        .expect("close should not hang")
        .expect("close should succeed");
    assert!(!session.is_active());
    session.close().await.expect("second close is a no-op");
}
