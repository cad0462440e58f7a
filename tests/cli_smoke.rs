//! Behavioural tests for the `rigger` CLI using remote infrastructure, which
//! needs no provisioner or SSH access.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Workdir {
    dir: TempDir,
}

impl Workdir {
    fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join("state.json")
    }

    fn rigger(&self, args: &[&str]) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("rigger");
        cmd.current_dir(self.dir.path())
            .env_remove("RIGGER_CONFIG_PATH")
            .env_remove("RUST_LOG")
            .env("RIGGER_STATE_FILE", self.state_file())
            .env("RIGGER_NAME", "staging")
            .env("RIGGER_OPS_CENTER_URL", "https://ops.example.com:32009/web/portal")
            .args(args);
        cmd
    }
}

#[fixture]
fn workdir() -> Workdir {
    Workdir {
        dir: TempDir::new().expect("create temp dir"),
    }
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("rigger");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[rstest]
fn status_requires_initialized_infrastructure(workdir: Workdir) {
    workdir
        .rigger(&["status"])
        .assert()
        .code(1)
        .stderr(contains("must be initialized"));
}

#[rstest]
fn down_requires_initialized_infrastructure(workdir: Workdir) {
    workdir
        .rigger(&["down", "--destroy"])
        .assert()
        .code(1)
        .stderr(contains("must be initialized"));
    assert!(!workdir.state_file().exists());
}

#[rstest]
fn up_then_status_then_down_round_trip(workdir: Workdir) {
    workdir
        .rigger(&["up", "--init", "remote"])
        .assert()
        .success()
        .stdout(contains("remote infrastructure 'staging' is ready").and(contains(
            "ops center: https://ops.example.com:32009/web/portal",
        )));
    assert!(workdir.state_file().exists());

    workdir
        .rigger(&["status"])
        .assert()
        .success()
        .stdout(contains("\"infra\": \"remote\"").and(contains("\"name\": \"staging\"")));

    workdir
        .rigger(&["down", "--destroy"])
        .assert()
        .success();
    assert!(!workdir.state_file().exists());
}

#[rstest]
fn creating_twice_is_rejected(workdir: Workdir) {
    workdir.rigger(&["up", "--init", "remote"]).assert().success();

    workdir
        .rigger(&["up", "--init", "remote"])
        .assert()
        .code(1)
        .stderr(contains("already initialized"));
}

#[rstest]
fn resuming_remote_infrastructure_succeeds(workdir: Workdir) {
    workdir.rigger(&["up", "--init", "remote"]).assert().success();

    workdir
        .rigger(&["up"])
        .assert()
        .success()
        .stdout(contains("remote infrastructure 'staging' is ready"));
}

#[rstest]
fn run_rejects_remote_infrastructure(workdir: Workdir) {
    workdir.rigger(&["up", "--init", "remote"]).assert().success();

    workdir
        .rigger(&["run", "--", "uptime"])
        .assert()
        .code(1)
        .stderr(contains("has no nodes"));
}

#[rstest]
fn run_rejects_control_characters(workdir: Workdir) {
    workdir
        .rigger(&["run", "--", "echo", "a\nb"])
        .assert()
        .code(1)
        .stderr(contains("control characters"));
}

#[rstest]
fn remote_init_requires_an_ops_center_url(workdir: Workdir) {
    workdir
        .rigger(&["up", "--init", "remote"])
        .env_remove("RIGGER_OPS_CENTER_URL")
        .assert()
        .code(1)
        .stderr(contains("RIGGER_OPS_CENTER_URL"));
    assert!(!workdir.state_file().exists());
}

#[rstest]
fn local_init_requires_a_provisioner(workdir: Workdir) {
    workdir
        .rigger(&["up", "--init", "local"])
        .env_remove("RIGGER_PROVISIONER")
        .assert()
        .code(1)
        .stderr(contains("RIGGER_PROVISIONER"));
    assert!(!workdir.state_file().exists());
}

#[rstest]
fn destroy_without_cloud_credentials_keeps_the_state_file(workdir: Workdir) {
    let snapshot = r#"{
  "infra": "local",
  "name": "cloud",
  "backend": "terraform",
  "provisioner_state": {
    "kind": "terraform",
    "state_dir": ".rigger/rigger-cloud",
    "install_dir": "/home/centos/installer"
  }
}"#;
    std::fs::write(workdir.state_file(), snapshot).expect("seed state file");

    workdir
        .rigger(&["down", "--destroy"])
        .env("RIGGER_PROVISIONER", "terraform")
        .env("RIGGER_SCRIPT_PATH", "main.tf")
        .env("RIGGER_TERRAFORM_BIN", "false")
        .env_remove("AWS_ACCESS_KEY_ID")
        .env_remove("AWS_SECRET_ACCESS_KEY")
        .env_remove("AWS_KEY_PAIR")
        .assert()
        .code(1)
        .stderr(contains("cannot destroy infrastructure 'cloud'").and(contains("AWS_ACCESS_KEY_ID")));

    let kept = std::fs::read_to_string(workdir.state_file()).expect("state file kept");
    assert!(kept.contains("\"name\": \"cloud\""), "state file: {kept}");
}
