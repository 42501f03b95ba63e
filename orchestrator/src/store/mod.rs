//! Repository interfaces over the relational store

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::deploy::fsm::InstanceState;
use crate::errors::OrchestratorError;
use crate::models::machine::{Machine, MachineId};
use crate::models::process::{
    ConfigArtifacts, Instance, InstanceId, LogicalProcess, NewInstance, ProcessId,
};
use crate::models::task::{Step, StepKey, StepStatus, Task, TaskStatus};

pub type StoreResult<T> = Result<T, OrchestratorError>;

#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn get_machine(&self, id: MachineId) -> StoreResult<Option<Machine>>;
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn insert_process(&self, name: &str, templates: ConfigArtifacts)
        -> StoreResult<LogicalProcess>;

    async fn get_process(&self, id: ProcessId) -> StoreResult<Option<LogicalProcess>>;

    async fn list_processes(&self) -> StoreResult<Vec<LogicalProcess>>;

    async fn update_templates(&self, id: ProcessId, templates: ConfigArtifacts) -> StoreResult<()>;

    async fn delete_process(&self, id: ProcessId) -> StoreResult<()>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, new: NewInstance) -> StoreResult<Instance>;

    async fn get_instance(&self, id: InstanceId) -> StoreResult<Option<Instance>>;

    async fn list_instances_by_process(&self, process_id: ProcessId) -> StoreResult<Vec<Instance>>;

    async fn list_instances_by_machine(&self, machine_id: MachineId) -> StoreResult<Vec<Instance>>;

    async fn list_instances_by_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> StoreResult<Vec<Instance>>;

    /// Instances with a recorded process id
    async fn list_with_pid(&self) -> StoreResult<Vec<Instance>>;

    async fn update_state(
        &self,
        id: InstanceId,
        state: InstanceState,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn update_pid(&self, id: InstanceId, pid: Option<u32>) -> StoreResult<()>;

    async fn update_config(&self, id: InstanceId, config: ConfigArtifacts) -> StoreResult<()>;

    async fn delete_instance(&self, id: InstanceId) -> StoreResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert every task with its steps, or nothing
    async fn insert_tasks(&self, tasks: Vec<(Task, Vec<Step>)>) -> StoreResult<()>;

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>>;

    async fn list_tasks_by_process(&self, process_id: ProcessId) -> StoreResult<Vec<Task>>;

    async fn list_tasks_by_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> StoreResult<Vec<Task>>;

    /// Tasks owning the instance, plus fleet-wide tasks with a step on it
    async fn list_tasks_by_instance(&self, instance_id: InstanceId) -> StoreResult<Vec<Task>>;

    async fn update_task_times(
        &self,
        id: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Move the task to `status` and set its error in one write, but only
    /// while its current status is one of `from`. An `end_time` also fills
    /// in a missing start time. Returns false when the task was elsewhere.
    async fn transition_task(
        &self,
        id: &str,
        from: &[TaskStatus],
        status: TaskStatus,
        error: Option<String>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Delete the task and its steps
    async fn delete_task(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    /// Steps of a task in (machine, step kind) order
    async fn list_steps(&self, task_id: &str) -> StoreResult<Vec<Step>>;

    async fn get_step(&self, key: &StepKey) -> StoreResult<Option<Step>>;

    async fn update_step_status(&self, key: &StepKey, status: StepStatus) -> StoreResult<()>;

    async fn update_step_times(
        &self,
        key: &StepKey,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn update_step_error(&self, key: &StepKey, error: Option<String>) -> StoreResult<()>;

    /// Put the given steps back to PENDING with no timestamps or error.
    /// Returns how many rows changed.
    async fn reset_steps(&self, task_id: &str, keys: &[StepKey]) -> StoreResult<usize>;
}

/// Helper to build a not-found error
pub fn not_found(kind: &str, id: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::NotFound(format!("{} {} does not exist", kind, id))
}

/// Bundle of repositories shared across components
#[derive(Clone)]
pub struct Stores {
    pub machines: std::sync::Arc<dyn MachineStore>,
    pub processes: std::sync::Arc<dyn ProcessStore>,
    pub instances: std::sync::Arc<dyn InstanceStore>,
    pub tasks: std::sync::Arc<dyn TaskStore>,
    pub steps: std::sync::Arc<dyn StepStore>,
}

impl Stores {
    /// All repositories backed by one in-memory store
    pub fn in_memory(store: std::sync::Arc<memory::MemoryStore>) -> Self {
        Self {
            machines: store.clone(),
            processes: store.clone(),
            instances: store.clone(),
            tasks: store.clone(),
            steps: store,
        }
    }
}
