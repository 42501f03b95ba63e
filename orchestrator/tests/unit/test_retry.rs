//! Retrying failed and cancelled tasks

use logfleet::deploy::fsm::InstanceState;
use logfleet::models::task::{OperationType, Step, StepKind, StepStatus, TaskStatus};
use logfleet::remote::memory::{FaultKind, HostOp};
use logfleet::tasks::ledger::{NewTask, StepTarget};

use crate::common::{harness, harness_with};

fn status_of(steps: &[Step], kind: StepKind) -> StepStatus {
    steps.iter().find(|s| s.kind == kind).map(|s| s.status).unwrap()
}

#[tokio::test]
async fn test_retry_resumes_failed_deploy() {
    let h = harness(&[1]);
    h.host.fail_times(1, HostOp::Upload, FaultKind::NonZeroExit, 1);
    let (process_id, tasks) = h.deploy("shipper", &[1]).await;
    let task_id = &tasks[0];

    let task = h.fleet().task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let steps = h.state.ledger.steps(task_id).await.unwrap();
    assert_eq!(status_of(&steps, StepKind::CreateRemoteDir), StepStatus::Completed);
    assert_eq!(status_of(&steps, StepKind::UploadPackage), StepStatus::Failed);
    assert_eq!(status_of(&steps, StepKind::ExtractPackage), StepStatus::Pending);
    let dir_started = steps
        .iter()
        .find(|s| s.kind == StepKind::CreateRemoteDir)
        .and_then(|s| s.start_time);

    let instance = &h.fleet().instances_for_process(process_id).await.unwrap()[0];
    assert_eq!(instance.state, InstanceState::StartFailed);

    let outcome = h.fleet().retry_task(task_id).await.unwrap();
    assert_eq!(outcome.reset, 1);
    assert!(outcome.resubmitted);

    let task = h.wait(task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error_message, None);

    let steps = h.state.ledger.steps(task_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status.is_terminal()));
    assert_eq!(status_of(&steps, StepKind::UploadPackage), StepStatus::Completed);
    assert_eq!(status_of(&steps, StepKind::StopProcess), StepStatus::Skipped);
    // Completed steps keep their original timing
    assert_eq!(
        steps
            .iter()
            .find(|s| s.kind == StepKind::CreateRemoteDir)
            .and_then(|s| s.start_time),
        dir_started
    );

    let instance = h.fleet().instance(instance.id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert!(instance.process_pid.is_some());
}

#[tokio::test]
async fn test_retry_of_completed_task_is_a_noop() {
    let h = harness(&[1]);
    let (_, tasks) = h.deploy("shipper", &[1]).await;
    let before = h.fleet().task(&tasks[0]).await.unwrap();
    assert_eq!(before.status, TaskStatus::Completed);

    let outcome = h.fleet().retry_task(&tasks[0]).await.unwrap();
    assert_eq!(outcome.reset, 0);
    assert!(!outcome.resubmitted);

    let after = h.fleet().task(&tasks[0]).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.end_time, before.end_time);
}

#[tokio::test]
async fn test_retry_of_unfinished_task_is_rejected() {
    let h = harness(&[1]);
    let task_id = h
        .state
        .ledger
        .create_machine_task(
            NewTask::new(OperationType::Start, Some(1)),
            StepTarget::new(1, Some(1)),
            &[StepKind::StartProcess, StepKind::VerifyProcess],
        )
        .await
        .unwrap();

    let err = h.fleet().retry_task(&task_id).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(h.fleet().task(&task_id).await.unwrap().status, TaskStatus::Pending);

    let err = h.fleet().retry_task("no-such-task").await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_retry_runs_cancelled_task() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();

    // Recorded but never submitted, then cancelled
    let task_id = h
        .state
        .ledger
        .create_machine_task(
            NewTask::new(OperationType::Stop, Some(process_id)),
            StepTarget::new(1, Some(instance.id)),
            &[StepKind::StopProcess],
        )
        .await
        .unwrap();
    assert!(h.fleet().cancel_task(&task_id).await.unwrap());

    let outcome = h.fleet().retry_task(&task_id).await.unwrap();
    assert_eq!(outcome.reset, 0);
    assert!(outcome.resubmitted);

    let task = h.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        h.fleet().instance(instance.id).await.unwrap().state,
        InstanceState::NotStarted
    );
    assert!(h.host.running_pids(1).is_empty());
}

async fn failed_restart_retry(revalidate: bool) -> usize {
    let h = harness_with(&[1], |o| o.fleet.retry_revalidates_skipped = revalidate);
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();

    let stop = h.fleet().stop_instance(instance.id).await.unwrap();
    assert_eq!(h.wait(&stop).await.status, TaskStatus::Completed);

    // Restart from NOT_STARTED skips the stop step, then the launch fails
    h.host.fail_times(1, HostOp::Launch, FaultKind::NonZeroExit, 1);
    let restart = h.fleet().restart_instance(instance.id).await.unwrap();
    assert_eq!(h.wait(&restart).await.status, TaskStatus::Failed);
    let steps = h.state.ledger.steps(&restart).await.unwrap();
    assert_eq!(status_of(&steps, StepKind::StopProcess), StepStatus::Skipped);
    assert_eq!(status_of(&steps, StepKind::StartProcess), StepStatus::Failed);
    assert_eq!(
        h.fleet().instance(instance.id).await.unwrap().state,
        InstanceState::StartFailed
    );

    let outcome = h.fleet().retry_task(&restart).await.unwrap();
    assert_eq!(h.wait(&restart).await.status, TaskStatus::Completed);
    assert_eq!(
        h.fleet().instance(instance.id).await.unwrap().state,
        InstanceState::Running
    );
    outcome.reset
}

#[tokio::test]
async fn test_retry_leaves_plain_skips_by_default() {
    // Verify never ran and is still PENDING, so only the start is reset
    assert_eq!(failed_restart_retry(false).await, 1);
}

#[tokio::test]
async fn test_retry_can_revalidate_plain_skips() {
    assert_eq!(failed_restart_retry(true).await, 2);
}
