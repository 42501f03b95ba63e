//! End-to-end fleet operations against the simulated host

use std::collections::BTreeMap;

use logfleet::deploy::executor::FailurePolicy;
use logfleet::deploy::fsm::InstanceState;
use logfleet::deploy::paths::InstancePaths;
use logfleet::errors::OrchestratorError;
use logfleet::fleet::DeployTarget;
use logfleet::models::process::{ConfigUpdate, Instance};
use logfleet::models::task::{OperationType, StepKind, StepStatus, TaskStatus};
use logfleet::remote::memory::{FaultKind, HostOp};
use logfleet::tasks::ledger::{NewTask, StepTarget};

use crate::common::{harness, harness_with, templates, Harness};

async fn instances_by_machine(h: &Harness, process_id: i64) -> BTreeMap<i64, Instance> {
    h.fleet()
        .instances_for_process(process_id)
        .await
        .unwrap()
        .into_iter()
        .map(|i| (i.machine_id, i))
        .collect()
}

#[tokio::test]
async fn test_deploy_with_one_failing_machine() {
    let h = harness(&[1, 2]);
    h.host.fail(2, HostOp::Upload, FaultKind::NonZeroExit);

    let process = h.fleet().create_process("beats-ingest", templates()).await.unwrap();
    let tasks = h
        .fleet()
        .deploy(process.id, &[DeployTarget::new(1), DeployTarget::new(2)])
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    for task_id in tasks.values() {
        h.wait(task_id).await;
    }

    let instances = instances_by_machine(&h, process.id).await;
    assert_eq!(instances[&1].state, InstanceState::Running);
    assert!(instances[&1].process_pid.is_some());
    assert_eq!(instances[&2].state, InstanceState::StartFailed);
    assert_eq!(instances[&2].process_pid, None);

    let ok = h.fleet().task(&tasks[&1]).await.unwrap();
    assert_eq!(ok.status, TaskStatus::Completed);
    assert_eq!(ok.name, "Deploy beats-ingest");
    assert_eq!(h.fleet().task_progress(&tasks[&1]).await.unwrap().percentage, 100);

    let failed = h.fleet().task(&tasks[&2]).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error_message.unwrap().contains("UPLOAD_PACKAGE"));

    // One directory made, one failed upload, the rest never ran
    let progress = h.fleet().task_progress(&tasks[&2]).await.unwrap();
    assert_eq!(progress.total, 11);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.skipped, 4);
    assert_eq!(progress.pending, 5);
    assert!(progress.percentage > 0 && progress.percentage < 100);

    let mut upload_failed = 0;
    let mut upload_completed = 0;
    for task_id in tasks.values() {
        let groups = h.fleet().task_steps_grouped(task_id).await.unwrap();
        let upload = groups.iter().find(|g| g.step_id == "UPLOAD_PACKAGE").unwrap();
        upload_failed += upload.failed;
        upload_completed += upload.completed;
    }
    assert_eq!((upload_failed, upload_completed), (1, 1));

    let detail = h.fleet().task_detail(&tasks[&2]).await.unwrap();
    assert_eq!(detail.operation_type, "INITIALIZE");
    assert_eq!(detail.instances.len(), 1);
    let upload = detail.instances[0]
        .steps
        .iter()
        .find(|s| s.step_id == "UPLOAD_PACKAGE")
        .unwrap();
    assert_eq!(upload.status, "FAILED");
    assert!(upload.error_message.as_deref().unwrap().contains("injected failure"));

    let listed = h.fleet().tasks_for_process(process.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    let on_two = h.fleet().tasks_for_process_machine(process.id, 2).await.unwrap();
    assert_eq!(on_two.len(), 1);
    assert_eq!(on_two[0].status, "FAILED");
}

#[tokio::test]
async fn test_deploy_rejects_bad_targets() {
    let h = harness(&[1]);
    let process = h.fleet().create_process("shipper", templates()).await.unwrap();

    assert!(h.fleet().deploy(process.id, &[]).await.unwrap_err().is_validation());
    assert!(h
        .fleet()
        .deploy(process.id, &[DeployTarget::new(1), DeployTarget::new(1)])
        .await
        .unwrap_err()
        .is_validation());
    assert!(matches!(
        h.fleet().deploy(process.id, &[DeployTarget::new(7)]).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        h.fleet().deploy(99, &[DeployTarget::new(1)]).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h.fleet().create_process("  ", templates()).await.unwrap_err().is_validation());

    assert!(h.fleet().instances_for_process(process.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_machine_fails_before_any_task() {
    let h = harness(&[1, 2]);
    h.host.set_unreachable(2, true);
    let process = h.fleet().create_process("shipper", templates()).await.unwrap();

    let err = h
        .fleet()
        .deploy(process.id, &[DeployTarget::new(1), DeployTarget::new(2)])
        .await
        .unwrap_err();
    match err {
        OrchestratorError::ConnectionFailed(msg) => assert!(msg.contains("m2")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.fleet().instances_for_process(process.id).await.unwrap().is_empty());
    assert!(h.fleet().tasks_for_process(process.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_stop_with_one_already_stopped() {
    let h = harness(&[1, 2, 3]);
    let (process_id, _) = h.deploy("shipper", &[1, 2, 3]).await;
    let instances = instances_by_machine(&h, process_id).await;
    let ids: Vec<i64> = instances.values().map(|i| i.id).collect();

    let first = h.fleet().stop_instance(instances[&2].id).await.unwrap();
    assert_eq!(h.wait(&first).await.status, TaskStatus::Completed);
    h.host.clear_history(2);

    let tasks = h.fleet().stop_instances(&ids).await.unwrap();
    assert_eq!(tasks.len(), 3);
    for task_id in tasks.values() {
        assert_eq!(h.wait(task_id).await.status, TaskStatus::Completed);
    }

    let skipped = h.state.ledger.steps(&tasks[&instances[&2].id]).await.unwrap();
    assert!(skipped.iter().all(|s| s.status == StepStatus::Skipped));
    assert_eq!(h.host.count(2, HostOp::Signal), 0);

    for instance in h.fleet().instances_for_process(process_id).await.unwrap() {
        assert_eq!(instance.state, InstanceState::NotStarted);
        assert_eq!(instance.process_pid, None);
        assert!(h.host.running_pids(instance.machine_id).is_empty());
    }
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();
    let old_pid = instance.process_pid.unwrap();

    let task_id = h.fleet().restart_instance(instance.id).await.unwrap();
    let task = h.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.operation, OperationType::Restart);

    let instance = h.fleet().instance(instance.id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    let new_pid = instance.process_pid.unwrap();
    assert_ne!(new_pid, old_pid);
    assert_eq!(h.host.running_pids(1), vec![new_pid]);

    let latest = h.fleet().latest_task_for_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(latest.id, task_id);
    assert_eq!(h.fleet().tasks_for_instance(instance.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_on_running_instance_skips_everything() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();
    h.host.clear_history(1);

    let task_id = h.fleet().start_instance(instance.id).await.unwrap();
    assert_eq!(h.wait(&task_id).await.status, TaskStatus::Completed);
    assert_eq!(h.host.count(1, HostOp::Launch), 0);
    let steps = h.state.ledger.steps(&task_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test]
async fn test_busy_instance_is_rejected() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();

    let pending = h
        .state
        .ledger
        .create_machine_task(
            NewTask::new(OperationType::Stop, Some(process_id)),
            StepTarget::new(1, Some(instance.id)),
            &[StepKind::StopProcess],
        )
        .await
        .unwrap();

    let err = h.fleet().stop_instance(instance.id).await.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains(&pending));
    assert!(h
        .fleet()
        .update_config(
            process_id,
            ConfigUpdate {
                jvm_options: Some("-Xmx2g\n".to_string()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err()
        .is_validation());

    // Once the other task is over the instance takes requests again
    assert!(h.fleet().cancel_task(&pending).await.unwrap());
    let stop = h.fleet().stop_instance(instance.id).await.unwrap();
    assert_eq!(h.wait(&stop).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_fleet_wide_task_keeps_instances_busy() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let instances = instances_by_machine(&h, process_id).await;
    let (one, two) = (instances[&1].id, instances[&2].id);
    let stop = h.fleet().stop_instance(one).await.unwrap();
    assert_eq!(h.wait(&stop).await.status, TaskStatus::Completed);

    // Machine 2's share of the config task waits behind this lock
    let guard = h.state.locks.lock(two).await;
    let update = ConfigUpdate {
        jvm_options: Some("-Xmx1g\n".to_string()),
        ..Default::default()
    };
    let tasks = h.fleet().update_config(process_id, update, None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(h.fleet().task(&tasks[0]).await.unwrap().instance_id, None);

    let listed = h.fleet().tasks_for_instance(two).await.unwrap();
    assert!(listed.iter().any(|t| t.task_id == tasks[0]));

    let err = h.fleet().stop_instance(two).await.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains(&tasks[0]));
    let err = h.fleet().delete_instance(one).await.unwrap_err();
    assert!(err.is_validation());
    assert!(h.host.has_dir(1, &instances[&1].deploy_path));

    drop(guard);
    assert_eq!(h.wait(&tasks[0]).await.status, TaskStatus::Completed);

    h.fleet().delete_instance(one).await.unwrap();
    let stop = h.fleet().stop_instance(two).await.unwrap();
    assert_eq!(h.wait(&stop).await.status, TaskStatus::Completed);
    // The fleet-wide record stays with the process
    assert!(h.fleet().task(&tasks[0]).await.is_ok());
}

#[tokio::test]
async fn test_batch_is_checked_before_any_task() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let instances = instances_by_machine(&h, process_id).await;
    h.host.set_unreachable(2, true);

    let err = h
        .fleet()
        .stop_instances(&[instances[&1].id, instances[&2].id])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ConnectionFailed(_)));
    assert_eq!(h.fleet().tasks_for_instance(instances[&1].id).await.unwrap().len(), 1);
    assert_eq!(
        h.fleet().instance(instances[&1].id).await.unwrap().state,
        InstanceState::Running
    );

    assert!(h.fleet().stop_instances(&[]).await.unwrap_err().is_validation());
    assert!(h
        .fleet()
        .stop_instances(&[instances[&1].id, instances[&1].id])
        .await
        .unwrap_err()
        .is_validation());
}

#[tokio::test]
async fn test_update_config_across_fleet() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let pipeline = "input { tcp { port => 6000 } }\noutput { stdout {} }\n".to_string();
    let update = ConfigUpdate {
        main_config: Some(pipeline.clone()),
        ..Default::default()
    };

    let tasks = h.fleet().update_config(process_id, update, None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = h.wait(&tasks[0]).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.machine_id, None);

    let steps = h.state.ledger.steps(&tasks[0]).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.kind == StepKind::UpdateMainConfig));

    for instance in h.fleet().instances_for_process(process_id).await.unwrap() {
        let paths = InstancePaths::new(&instance.deploy_path, instance.id);
        assert_eq!(h.host.file(instance.machine_id, &paths.main_config_file()), Some(pipeline.clone()));
        assert_eq!(instance.config.main_config, pipeline);
        assert_eq!(instance.config.jvm_options, templates().jvm_options);
        // Config changes do not touch the lifecycle
        assert_eq!(instance.state, InstanceState::Running);
    }
    assert_eq!(h.fleet().process(process_id).await.unwrap().templates.main_config, pipeline);
}

#[tokio::test]
async fn test_update_config_on_selected_machines() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let update = ConfigUpdate {
        system_config: Some("pipeline.workers: 8\n".to_string()),
        ..Default::default()
    };

    let tasks = h
        .fleet()
        .update_config(process_id, update, Some(&[2]))
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    let task = h.wait(&tasks[0]).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.machine_id, Some(2));

    let instances = instances_by_machine(&h, process_id).await;
    assert_eq!(instances[&2].config.system_config, "pipeline.workers: 8\n");
    assert_eq!(instances[&1].config.system_config, templates().system_config);
    assert_eq!(
        h.fleet().process(process_id).await.unwrap().templates.system_config,
        templates().system_config
    );

    assert!(h
        .fleet()
        .update_config(process_id, ConfigUpdate::default(), None)
        .await
        .unwrap_err()
        .is_validation());
    assert!(matches!(
        h.fleet().refresh_config(process_id, Some(&[5])).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_refresh_config_restores_drift() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();
    let paths = InstancePaths::new(&instance.deploy_path, instance.id);
    h.host.put_file(1, &paths.jvm_options_file(), "-Xmx64m\n");

    let tasks = h.fleet().refresh_config(process_id, None).await.unwrap();
    assert_eq!(h.wait(&tasks[0]).await.status, TaskStatus::Completed);
    assert_eq!(
        h.host.file(1, &paths.jvm_options_file()),
        Some(templates().jvm_options)
    );
}

#[tokio::test]
async fn test_delete_requires_stopped_instance() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let instances = instances_by_machine(&h, process_id).await;
    let one = &instances[&1];

    let err = h.fleet().delete_instance(one.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
    assert!(h.host.has_dir(1, &one.deploy_path));

    let stop = h.fleet().stop_instance(one.id).await.unwrap();
    assert_eq!(h.wait(&stop).await.status, TaskStatus::Completed);
    h.fleet().delete_instance(one.id).await.unwrap();

    assert!(!h.host.has_dir(1, &one.deploy_path));
    assert!(matches!(
        h.fleet().instance(one.id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h.fleet().tasks_for_instance(one.id).await.unwrap().is_empty());
    assert_eq!(h.fleet().instances_for_process(process_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_process_checks_every_instance_first() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("shipper", &[1, 2]).await;
    let instances = instances_by_machine(&h, process_id).await;

    let stop = h.fleet().stop_instance(instances[&1].id).await.unwrap();
    h.wait(&stop).await;

    // Machine 2 still runs, so nothing is removed
    let err = h.fleet().delete_process(process_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));
    assert_eq!(h.fleet().instances_for_process(process_id).await.unwrap().len(), 2);
    assert!(h.host.has_dir(1, &instances[&1].deploy_path));

    let stop = h.fleet().stop_instance(instances[&2].id).await.unwrap();
    h.wait(&stop).await;
    h.fleet().delete_process(process_id).await.unwrap();

    assert!(matches!(
        h.fleet().process(process_id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h.fleet().tasks_for_process(process_id).await.unwrap().is_empty());
    assert!(!h.host.has_dir(2, &instances[&2].deploy_path));
}

#[tokio::test]
async fn test_tail_instance_log() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();

    let tail = h.fleet().tail_instance_log(instance.id, 5).await.unwrap();
    assert!(tail.contains("Starting Logstash"));
}

#[tokio::test]
async fn test_environment_failure_aborts_the_rest_of_the_batch() {
    let h = harness(&[1, 2, 3]);
    let (process_id, _) = h.deploy("shipper", &[1, 2, 3]).await;
    let instances = instances_by_machine(&h, process_id).await;
    let ids: Vec<i64> = instances.values().map(|i| i.id).collect();
    for task_id in h.fleet().stop_instances(&ids).await.unwrap().values() {
        assert_eq!(h.wait(task_id).await.status, TaskStatus::Completed);
    }

    // Machines 2 and 3 wait until machine 1 has hit the missing tool
    let held = vec![
        h.state.locks.lock(instances[&2].id).await,
        h.state.locks.lock(instances[&3].id).await,
    ];
    h.host.fail_times(1, HostOp::Launch, FaultKind::ToolMissing, 1);
    let tasks = h.fleet().start_instances(&ids).await.unwrap();

    let first = h.wait(&tasks[&instances[&1].id]).await;
    assert_eq!(first.status, TaskStatus::Failed);
    assert!(first.error_message.unwrap().contains("START_PROCESS"));
    drop(held);

    for machine_id in [2, 3] {
        let instance = &instances[&machine_id];
        let task = h.wait(&tasks[&instance.id]).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("batch aborted"));

        let steps = h.state.ledger.steps(&task.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(steps
            .iter()
            .all(|s| s.error_message.as_deref().unwrap_or_default().contains("batch aborted")));
        assert_eq!(h.host.count(machine_id, HostOp::Launch), 0);
        assert_eq!(
            h.fleet().instance(instance.id).await.unwrap().state,
            InstanceState::NotStarted
        );
    }

    // Deferred steps run on retry once the tool is back
    let retry = h.fleet().retry_task(&tasks[&instances[&2].id]).await.unwrap();
    assert!(retry.resubmitted);
    assert_eq!(retry.reset, 2);
    assert_eq!(h.wait(&retry.task_id).await.status, TaskStatus::Completed);
    assert_eq!(
        h.fleet().instance(instances[&2].id).await.unwrap().state,
        InstanceState::Running
    );
}

#[tokio::test]
async fn test_skip_remaining_policy_marks_rest_of_deploy() {
    let h = harness_with(&[1], |options| {
        options.failure_policy = FailurePolicy::SkipRemaining;
    });
    h.host.fail_times(1, HostOp::Upload, FaultKind::NonZeroExit, 1);
    let process = h.fleet().create_process("shipper", templates()).await.unwrap();
    let tasks = h.fleet().deploy(process.id, &[DeployTarget::new(1)]).await.unwrap();
    let task = h.wait(&tasks[&1]).await;
    assert_eq!(task.status, TaskStatus::Failed);

    let progress = h.fleet().task_progress(&task.id).await.unwrap();
    assert_eq!((progress.completed, progress.failed), (1, 1));
    assert_eq!((progress.skipped, progress.pending), (9, 0));

    let steps = h.state.ledger.steps(&task.id).await.unwrap();
    let deferred: Vec<StepKind> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped && s.error_message.is_some())
        .map(|s| s.kind)
        .collect();
    assert_eq!(deferred.len(), 5);
    assert!(deferred.contains(&StepKind::ExtractPackage));
    assert!(deferred.contains(&StepKind::VerifyProcess));
    let extract = steps.iter().find(|s| s.kind == StepKind::ExtractPackage).unwrap();
    assert_eq!(
        extract.error_message.as_deref(),
        Some("skipped after UPLOAD_PACKAGE failed")
    );

    let retry = h.fleet().retry_task(&task.id).await.unwrap();
    assert_eq!(retry.reset, 6);
    assert_eq!(h.wait(&task.id).await.status, TaskStatus::Completed);

    let steps = h.state.ledger.steps(&task.id).await.unwrap();
    let extract = steps.iter().find(|s| s.kind == StepKind::ExtractPackage).unwrap();
    assert_eq!(extract.status, StepStatus::Completed);
    assert_eq!(extract.error_message, None);
    let instance = h.fleet().instances_for_process(process.id).await.unwrap()[0].clone();
    assert_eq!(instance.state, InstanceState::Running);
}
