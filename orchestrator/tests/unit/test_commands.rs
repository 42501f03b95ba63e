//! Idempotency of remote commands

use logfleet::deploy::commands::config::WriteConfig;
use logfleet::deploy::commands::directory::{CreateRemoteDir, DeleteDirectory};
use logfleet::deploy::commands::package::{ExtractPackage, UploadPackage};
use logfleet::deploy::commands::process::{StartProcess, StopProcess, VerifyProcess};
use logfleet::deploy::commands::{run_command, CommandContext, CommandOutcome, CommandSettings};
use logfleet::deploy::paths::InstancePaths;
use logfleet::models::machine::Machine;
use logfleet::models::process::{ConfigArtifact, Instance, NewInstance};
use logfleet::models::task::StepKind;
use logfleet::remote::memory::{FaultKind, HostOp};

use crate::common::{fast_commands, harness, templates, Harness};

struct Fixture {
    h: Harness,
    machine: Machine,
    settings: CommandSettings,
}

impl Fixture {
    async fn new() -> Self {
        let h = harness(&[1]);
        let machine = h.machine(1).await;
        let settings = fast_commands(h.package.clone());
        Self { h, machine, settings }
    }

    async fn instance(&self) -> Instance {
        let existing = self.h.state.stores.instances.get_instance(1).await.unwrap();
        match existing {
            Some(instance) => instance,
            None => self
                .h
                .state
                .stores
                .instances
                .insert_instance(NewInstance {
                    process_id: 1,
                    machine_id: 1,
                    deploy_path: "/opt/ls-test".to_string(),
                    config: templates(),
                })
                .await
                .unwrap(),
        }
    }

    async fn run(&self, command: &dyn logfleet::deploy::commands::RemoteCommand) -> CommandOutcome {
        let instance = self.instance().await;
        let ctx = CommandContext::new(
            &self.machine,
            &instance,
            self.h.host.as_ref(),
            self.h.state.stores.instances.as_ref(),
            &self.settings,
        );
        run_command(command, &ctx).await
    }
}

#[tokio::test]
async fn test_create_remote_dir_twice_never_errors() {
    let f = Fixture::new().await;
    assert_eq!(f.run(&CreateRemoteDir).await, CommandOutcome::Applied);
    assert_eq!(f.run(&CreateRemoteDir).await, CommandOutcome::Satisfied);
    assert!(f.h.host.has_dir(1, "/opt/ls-test/config"));
    assert!(f.h.host.has_dir(1, "/opt/ls-test/logs"));
}

#[tokio::test]
async fn test_upload_is_satisfied_once_extracted() {
    let f = Fixture::new().await;
    f.run(&CreateRemoteDir).await;
    assert_eq!(f.run(&UploadPackage).await, CommandOutcome::Applied);
    assert_eq!(f.run(&ExtractPackage).await, CommandOutcome::Applied);

    f.h.host.clear_history(1);
    assert_eq!(f.run(&UploadPackage).await, CommandOutcome::Satisfied);
    assert_eq!(f.run(&ExtractPackage).await, CommandOutcome::Satisfied);
    assert_eq!(f.h.host.count(1, HostOp::Upload), 0);
    assert_eq!(f.h.host.count(1, HostOp::Extract), 0);
}

#[tokio::test]
async fn test_upload_runs_on_a_spawned_task() {
    let outcome = tokio::spawn(async {
        let f = Fixture::new().await;
        f.run(&CreateRemoteDir).await;
        let outcome = f.run(&UploadPackage).await;
        (outcome, f.h.host.count(1, HostOp::Upload))
    })
    .await
    .unwrap();
    assert_eq!(outcome, (CommandOutcome::Applied, 1));
}

#[tokio::test]
async fn test_missing_local_package_is_an_environment_failure() {
    let mut f = Fixture::new().await;
    f.settings.package_path = std::env::temp_dir().join("logfleet-no-such-package.tar.gz");
    f.run(&CreateRemoteDir).await;

    match f.run(&UploadPackage).await {
        CommandOutcome::Failed(failure) => {
            assert!(failure.environment);
            assert!(failure.message.contains("not found"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_write_config_compares_fingerprints() {
    let f = Fixture::new().await;
    let paths = InstancePaths::new("/opt/ls-test", f.instance().await.id);
    let write = || {
        WriteConfig::new(
            StepKind::UpdateMainConfig,
            vec![(ConfigArtifact::Main, "input { stdin {} }".to_string())],
        )
    };

    assert_eq!(f.run(&write()).await, CommandOutcome::Applied);
    assert_eq!(f.run(&write()).await, CommandOutcome::Satisfied);
    assert_eq!(
        f.h.host.file(1, &paths.main_config_file()).as_deref(),
        Some("input { stdin {} }")
    );

    // Drift on the remote side is rewritten
    f.h.host.put_file(1, &paths.main_config_file(), "edited by hand");
    assert_eq!(f.run(&write()).await, CommandOutcome::Applied);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let f = Fixture::new().await;
    f.run(&CreateRemoteDir).await;
    f.run(&UploadPackage).await;
    f.run(&ExtractPackage).await;

    assert_eq!(f.run(&StartProcess).await, CommandOutcome::Applied);
    assert_eq!(f.run(&VerifyProcess).await, CommandOutcome::Applied);
    let pid = f.instance().await.process_pid.unwrap();
    assert_eq!(f.h.host.running_pids(1), vec![pid]);

    // Already running: no second launch
    assert_eq!(f.run(&StartProcess).await, CommandOutcome::Satisfied);
    assert_eq!(f.h.host.count(1, HostOp::Launch), 1);

    assert_eq!(f.run(&StopProcess).await, CommandOutcome::Applied);
    assert!(f.h.host.running_pids(1).is_empty());
    assert_eq!(f.instance().await.process_pid, None);
    assert_eq!(f.run(&StopProcess).await, CommandOutcome::Satisfied);
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let f = Fixture::new().await;
    f.run(&CreateRemoteDir).await;
    f.run(&UploadPackage).await;
    f.run(&ExtractPackage).await;
    f.run(&StartProcess).await;

    f.h.host.ignore_term(1, true);
    assert_eq!(f.run(&StopProcess).await, CommandOutcome::Applied);
    assert!(f.h.host.running_pids(1).is_empty());
    assert_eq!(f.h.host.count(1, HostOp::Signal), 2);
}

#[tokio::test]
async fn test_failed_check_falls_through_to_apply() {
    let f = Fixture::new().await;
    f.h.host.fail_times(1, HostOp::DirExists, FaultKind::Timeout, 1);
    assert_eq!(f.run(&CreateRemoteDir).await, CommandOutcome::Applied);
}

#[tokio::test]
async fn test_delete_directory_twice() {
    let f = Fixture::new().await;
    f.run(&CreateRemoteDir).await;
    assert_eq!(f.run(&DeleteDirectory).await, CommandOutcome::Applied);
    assert!(!f.h.host.has_dir(1, "/opt/ls-test"));
    assert_eq!(f.run(&DeleteDirectory).await, CommandOutcome::Satisfied);
}
