//! Liveness monitor passes

use std::time::Duration;

use logfleet::deploy::fsm::InstanceState;
use logfleet::models::process::Instance;
use logfleet::remote::memory::{FaultKind, HostOp};
use logfleet::workers::monitor;

use crate::common::{harness, harness_with, Harness, WAIT};

async fn running_instance(h: &Harness) -> Instance {
    let (process_id, _) = h.deploy("shipper", &[1]).await;
    let instance = h.fleet().instances_for_process(process_id).await.unwrap()[0].clone();
    assert_eq!(instance.state, InstanceState::Running);
    assert!(instance.process_pid.is_some());
    instance
}

#[tokio::test]
async fn test_live_process_is_left_alone() {
    let h = harness(&[1]);
    let instance = running_instance(&h).await;

    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.alive, vec![instance.id]);
    assert!(report.demoted.is_empty());
    assert_eq!(
        h.fleet().instance(instance.id).await.unwrap().state,
        InstanceState::Running
    );
}

#[tokio::test]
async fn test_dead_process_is_demoted() {
    let h = harness(&[1]);
    let instance = running_instance(&h).await;
    let pid = instance.process_pid.unwrap();
    h.host.kill(1, pid);

    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.demoted.len(), 1);
    let demoted = &report.demoted[0];
    assert_eq!(demoted.instance_id, instance.id);
    assert_eq!(demoted.pid, pid);
    assert!(demoted.log_tail.contains("Starting Logstash"));

    let instance = h.fleet().instance(instance.id).await.unwrap();
    assert_eq!(instance.state, InstanceState::NotStarted);
    assert_eq!(instance.process_pid, None);

    // Nothing left to check
    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_unreadable_liveness_changes_nothing() {
    let h = harness(&[1]);
    let instance = running_instance(&h).await;
    h.host.fail(1, HostOp::ProcessAlive, FaultKind::Timeout);

    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.unknown, vec![instance.id]);
    assert!(report.demoted.is_empty());

    let after = h.fleet().instance(instance.id).await.unwrap();
    assert_eq!(after.state, InstanceState::Running);
    assert_eq!(after.process_pid, instance.process_pid);
}

#[tokio::test]
async fn test_recent_changes_are_in_grace() {
    let h = harness_with(&[1], |o| o.monitor.grace_period = Duration::from_secs(3600));
    let instance = running_instance(&h).await;
    h.host.kill(1, instance.process_pid.unwrap());
    h.host.clear_history(1);

    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.skipped_grace, vec![instance.id]);
    assert_eq!(h.host.count(1, HostOp::ProcessAlive), 0);
    assert_eq!(
        h.fleet().instance(instance.id).await.unwrap().state,
        InstanceState::Running
    );
}

#[tokio::test]
async fn test_locked_instance_is_skipped() {
    let h = harness(&[1]);
    let instance = running_instance(&h).await;
    h.host.kill(1, instance.process_pid.unwrap());

    let guard = h.state.locks.lock(instance.id).await;
    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.skipped_busy, vec![instance.id]);
    assert!(report.demoted.is_empty());
    drop(guard);

    let report = h.state.monitor.check_once().await.unwrap();
    assert_eq!(report.demoted.len(), 1);
}

#[tokio::test]
async fn test_worker_runs_until_shutdown() {
    let h = harness_with(&[1], |o| {
        o.monitor.initial_delay = Duration::ZERO;
        o.monitor.interval = Duration::from_millis(10);
    });
    let instance = running_instance(&h).await;
    h.host.kill(1, instance.process_pid.unwrap());

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let liveness = h.state.monitor.clone();
    let worker = tokio::spawn(async move {
        monitor::run(
            liveness.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = rx.await;
            }),
        )
        .await;
    });

    let demoted = tokio::time::timeout(WAIT, async {
        loop {
            let state = h.fleet().instance(instance.id).await.unwrap().state;
            if state == InstanceState::NotStarted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(demoted.is_ok());

    tx.send(()).unwrap();
    tokio::time::timeout(WAIT, worker).await.unwrap().unwrap();
}
