//! Unit tests for configuration validation and request resolution.

use camino::Utf8PathBuf;
use rigger::config::{AwsConfig, ConfigError, InfraConfig};
use rigger::provisioner::BackendRequest;
use rigger::{InfraKind, InitRequest};
use rstest::*;

#[fixture]
fn infra_config() -> InfraConfig {
    InfraConfig {
        name: String::from("nightly"),
        provisioner: Some(String::from("terraform")),
        nodes: 3,
        script_path: Some(String::from("/scripts/aws.tf")),
        installer_path: Some(String::from("/bundles/telekube.tar")),
        state_dir: String::from("/var/tmp/rigger"),
        install_dir: None,
        ops_center_url: Some(String::from("https://ops.example.com:32009/web/portal")),
        terraform_bin: String::from("terraform"),
        vagrant_bin: String::from("vagrant"),
    }
}

#[fixture]
fn aws_config() -> AwsConfig {
    AwsConfig {
        access_key_id: Some(String::from("AKIAEXAMPLE")),
        secret_access_key: Some(String::from("secret")),
        region: String::from("eu-west-1"),
        key_pair: Some(String::from("ops")),
        ssh_key_path: Some(String::from("/keys/ops.pem")),
        ssh_user: String::from("centos"),
    }
}

#[rstest]
fn terraform_request_carries_credentials_and_defaults(infra_config: InfraConfig, aws_config: AwsConfig) {
    let request = infra_config.as_request(&aws_config).expect("valid configuration");

    assert_eq!(request.name, "nightly");
    assert_eq!(request.state_root, Utf8PathBuf::from("/var/tmp/rigger"));
    assert_eq!(request.installer_path, Some(Utf8PathBuf::from("/bundles/telekube.tar")));
    let BackendRequest::Terraform(terraform) = request.backend else {
        panic!("expected terraform request");
    };
    assert_eq!(terraform.nodes, 3);
    assert_eq!(terraform.credentials.region, "eu-west-1");
    assert_eq!(terraform.credentials.key_pair, "ops");
    assert_eq!(terraform.ssh_user, "centos");
    assert_eq!(terraform.ssh_key_path, Some(Utf8PathBuf::from("/keys/ops.pem")));
    assert_eq!(terraform.install_dir, "/home/centos/installer");
}

#[rstest]
fn vagrant_request_ignores_aws_settings(mut infra_config: InfraConfig) {
    infra_config.provisioner = Some(String::from("Vagrant"));
    infra_config.install_dir = Some(String::from("/vagrant/installer"));
    let empty_aws = AwsConfig {
        access_key_id: None,
        secret_access_key: None,
        region: String::from("us-east-1"),
        key_pair: None,
        ssh_key_path: None,
        ssh_user: String::from("centos"),
    };

    let request = infra_config.as_request(&empty_aws).expect("valid configuration");

    let BackendRequest::Vagrant(vagrant) = request.backend else {
        panic!("expected vagrant request");
    };
    assert_eq!(vagrant.install_dir, "/vagrant/installer");
    assert_eq!(vagrant.vagrant_bin, "vagrant");
}

#[rstest]
fn blank_installer_path_disables_the_wizard(mut infra_config: InfraConfig, aws_config: AwsConfig) {
    infra_config.installer_path = Some(String::from("  "));
    let request = infra_config.as_request(&aws_config).expect("valid configuration");
    assert!(!request.with_installer());
}

#[rstest]
#[case::provisioner(|cfg: &mut InfraConfig, _: &mut AwsConfig| cfg.provisioner = None, "RIGGER_PROVISIONER")]
#[case::script(|cfg: &mut InfraConfig, _: &mut AwsConfig| cfg.script_path = Some(String::new()), "RIGGER_SCRIPT_PATH")]
#[case::access_key(|_: &mut InfraConfig, aws: &mut AwsConfig| aws.access_key_id = None, "AWS_ACCESS_KEY_ID")]
#[case::secret_key(|_: &mut InfraConfig, aws: &mut AwsConfig| aws.secret_access_key = Some(String::from(" ")), "AWS_SECRET_ACCESS_KEY")]
#[case::key_pair(|_: &mut InfraConfig, aws: &mut AwsConfig| aws.key_pair = None, "AWS_KEY_PAIR")]
fn missing_fields_produce_actionable_errors(
    mut infra_config: InfraConfig,
    mut aws_config: AwsConfig,
    #[case] mutate: fn(&mut InfraConfig, &mut AwsConfig),
    #[case] env_var: &str,
) {
    mutate(&mut infra_config, &mut aws_config);

    let error = infra_config.as_request(&aws_config).expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(message.contains("rigger.toml"), "error should mention config file: {message}");
}

#[rstest]
fn unknown_provisioner_is_invalid(mut infra_config: InfraConfig, aws_config: AwsConfig) {
    infra_config.provisioner = Some(String::from("openstack"));

    let error = infra_config.as_request(&aws_config).expect_err("unknown backend");
    assert!(matches!(error, ConfigError::InvalidValue(ref message) if message.contains("openstack")));
}

#[rstest]
fn zero_nodes_is_invalid(mut infra_config: InfraConfig, aws_config: AwsConfig) {
    infra_config.nodes = 0;
    assert!(matches!(
        infra_config.as_request(&aws_config),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[rstest]
fn remote_init_request_uses_the_ops_center_url(infra_config: InfraConfig, aws_config: AwsConfig) {
    let init = infra_config
        .init_request(InfraKind::Remote, &aws_config)
        .expect("valid configuration");

    let InitRequest::Remote { name, ops_center_url } = init else {
        panic!("expected remote request");
    };
    assert_eq!(name, "nightly");
    assert_eq!(ops_center_url.as_str(), "https://ops.example.com:32009/web/portal");
}

#[rstest]
fn remote_init_rejects_malformed_urls(mut infra_config: InfraConfig, aws_config: AwsConfig) {
    infra_config.ops_center_url = Some(String::from("ops.example.com"));
    assert!(matches!(
        infra_config.init_request(InfraKind::Remote, &aws_config),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[rstest]
fn local_init_request_wraps_the_infra_request(infra_config: InfraConfig, aws_config: AwsConfig) {
    let init = infra_config
        .init_request(InfraKind::Local, &aws_config)
        .expect("valid configuration");
    assert_eq!(init.kind(), InfraKind::Local);
}
