//! Deploy path resolution and collisions

use std::collections::HashSet;

use logfleet::deploy::paths::{DeployPathResolver, InstancePaths};
use logfleet::errors::OrchestratorError;
use logfleet::fleet::DeployTarget;
use logfleet::models::machine::Machine;

use crate::common::{harness, templates};

#[test]
fn test_generated_paths_never_collide() {
    let resolver = DeployPathResolver::new("logstash");
    let machine = Machine::new(1, "m1", "10.0.0.1").with_user("deploy");

    let mut seen = HashSet::new();
    for _ in 0..2_000 {
        let path = resolver.resolve(None, None, &machine).unwrap();
        assert!(path.starts_with("/home/deploy/logstash/logstash-"), "{}", path);
        assert!(seen.insert(path));
    }
}

#[test]
fn test_persisted_path_wins() {
    let resolver = DeployPathResolver::new("/opt/logstash");
    let machine = Machine::new(1, "m1", "10.0.0.1");
    let path = resolver
        .resolve(Some("/srv/ls-1"), Some("~/elsewhere"), &machine)
        .unwrap();
    assert_eq!(path, "/srv/ls-1");

    let path = resolver.resolve(None, Some("~/shippers/../ls"), &machine).unwrap();
    assert_eq!(path, "/root/ls");
}

#[test]
fn test_file_layout_is_pure() {
    let a = InstancePaths::new("/opt/ls-a", 7);
    let b = InstancePaths::new("/opt/ls-a", 7);
    assert_eq!(a.log_file(), b.log_file());
    assert_eq!(a.pid_file(), "/opt/ls-a/logs/logstash-7.pid");
    assert_ne!(a.pid_file(), InstancePaths::new("/opt/ls-a", 8).pid_file());
}

#[tokio::test]
async fn test_two_instances_on_one_machine_get_distinct_paths() {
    let h = harness(&[1]);
    let (process_id, _) = h.deploy("P", &[1]).await;

    // Scale out on the same machine: a second directory is generated
    let other = h.fleet().create_process("Q", templates()).await.unwrap();
    h.fleet().deploy(other.id, &[DeployTarget::new(1)]).await.unwrap();

    let first = h.fleet().instances_for_process(process_id).await.unwrap();
    let second = h.fleet().instances_for_process(other.id).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].deploy_path, second[0].deploy_path);
}

#[tokio::test]
async fn test_explicit_path_collision_is_rejected_and_rolled_back() {
    let h = harness(&[1, 2]);
    let process = h.fleet().create_process("P", templates()).await.unwrap();
    h.fleet()
        .deploy(process.id, &[DeployTarget::at(1, "/opt/shared")])
        .await
        .unwrap();

    let other = h.fleet().create_process("Q", templates()).await.unwrap();
    let err = h
        .fleet()
        .deploy(
            other.id,
            &[DeployTarget::at(2, "/opt/shared"), DeployTarget::at(1, "/opt/shared")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ValidationError(_)), "{}", err);

    // The instance created for machine 2 before the collision is gone
    assert!(h.fleet().instances_for_process(other.id).await.unwrap().is_empty());
    assert!(h.fleet().tasks_for_process(other.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deploy_skips_machines_already_running_the_process() {
    let h = harness(&[1, 2]);
    let (process_id, _) = h.deploy("P", &[1]).await;

    let tasks = h
        .fleet()
        .deploy(process_id, &[DeployTarget::new(1), DeployTarget::new(2)])
        .await
        .unwrap();
    assert_eq!(tasks.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(h.fleet().instances_for_process(process_id).await.unwrap().len(), 2);
}
