//! In-memory implementation of every repository

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::deploy::fsm::InstanceState;
use crate::errors::OrchestratorError;
use crate::models::machine::{Machine, MachineId};
use crate::models::process::{
    ConfigArtifacts, Instance, InstanceId, LogicalProcess, NewInstance, ProcessId,
};
use crate::models::task::{Step, StepKey, StepStatus, Task, TaskId, TaskStatus};
use crate::store::{
    not_found, InstanceStore, MachineStore, ProcessStore, StepStore, StoreResult, TaskStore,
};

#[derive(Default)]
struct Tables {
    machines: BTreeMap<MachineId, Machine>,
    processes: BTreeMap<ProcessId, LogicalProcess>,
    instances: BTreeMap<InstanceId, Instance>,
    tasks: BTreeMap<TaskId, Task>,
    steps: BTreeMap<StepKey, Step>,
    next_process_id: ProcessId,
    next_instance_id: InstanceId,
}

/// Tables behind a single lock, so multi-row writes are atomic
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Machines are owned elsewhere; this registers one for lookups
    pub fn insert_machine(&self, machine: Machine) {
        self.write().machines.insert(machine.id, machine);
    }

    fn newest_first(mut tasks: Vec<Task>) -> Vec<Task> {
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }
}

fn step_not_found(key: &StepKey) -> OrchestratorError {
    not_found(
        "step",
        format!("{}/{}/{}", key.task_id, key.machine_id, key.kind),
    )
}

#[async_trait]
impl MachineStore for MemoryStore {
    async fn get_machine(&self, id: MachineId) -> StoreResult<Option<Machine>> {
        Ok(self.read().machines.get(&id).cloned())
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn insert_process(
        &self,
        name: &str,
        templates: ConfigArtifacts,
    ) -> StoreResult<LogicalProcess> {
        let mut tables = self.write();
        if tables.processes.values().any(|p| p.name == name) {
            return Err(OrchestratorError::ValidationError(format!(
                "process '{}' already exists",
                name
            )));
        }
        tables.next_process_id += 1;
        let now = Utc::now();
        let process = LogicalProcess {
            id: tables.next_process_id,
            name: name.to_string(),
            templates,
            created_at: now,
            updated_at: now,
        };
        tables.processes.insert(process.id, process.clone());
        Ok(process)
    }

    async fn get_process(&self, id: ProcessId) -> StoreResult<Option<LogicalProcess>> {
        Ok(self.read().processes.get(&id).cloned())
    }

    async fn list_processes(&self) -> StoreResult<Vec<LogicalProcess>> {
        Ok(self.read().processes.values().cloned().collect())
    }

    async fn update_templates(&self, id: ProcessId, templates: ConfigArtifacts) -> StoreResult<()> {
        let mut tables = self.write();
        let process = tables
            .processes
            .get_mut(&id)
            .ok_or_else(|| not_found("process", id))?;
        process.templates = templates;
        process.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_process(&self, id: ProcessId) -> StoreResult<()> {
        self.write().processes.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, new: NewInstance) -> StoreResult<Instance> {
        let mut tables = self.write();
        if tables
            .instances
            .values()
            .any(|i| i.machine_id == new.machine_id && i.deploy_path == new.deploy_path)
        {
            return Err(OrchestratorError::ValidationError(format!(
                "deploy path {} is already used on machine {}",
                new.deploy_path, new.machine_id
            )));
        }
        tables.next_instance_id += 1;
        let now = Utc::now();
        let instance = Instance {
            id: tables.next_instance_id,
            process_id: new.process_id,
            machine_id: new.machine_id,
            deploy_path: new.deploy_path,
            config: new.config,
            process_pid: None,
            state: InstanceState::NotStarted,
            state_changed_at: now,
            created_at: now,
            updated_at: now,
        };
        tables.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: InstanceId) -> StoreResult<Option<Instance>> {
        Ok(self.read().instances.get(&id).cloned())
    }

    async fn list_instances_by_process(&self, process_id: ProcessId) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()
            .instances
            .values()
            .filter(|i| i.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn list_instances_by_machine(&self, machine_id: MachineId) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()
            .instances
            .values()
            .filter(|i| i.machine_id == machine_id)
            .cloned()
            .collect())
    }

    async fn list_instances_by_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()
            .instances
            .values()
            .filter(|i| i.process_id == process_id && i.machine_id == machine_id)
            .cloned()
            .collect())
    }

    async fn list_with_pid(&self) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read()
            .instances
            .values()
            .filter(|i| i.process_pid.is_some())
            .cloned()
            .collect())
    }

    async fn update_state(
        &self,
        id: InstanceId,
        state: InstanceState,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.write();
        let instance = tables
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found("instance", id))?;
        instance.state = state;
        instance.state_changed_at = at;
        instance.updated_at = at;
        Ok(())
    }

    async fn update_pid(&self, id: InstanceId, pid: Option<u32>) -> StoreResult<()> {
        let mut tables = self.write();
        let instance = tables
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found("instance", id))?;
        instance.process_pid = pid;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn update_config(&self, id: InstanceId, config: ConfigArtifacts) -> StoreResult<()> {
        let mut tables = self.write();
        let instance = tables
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found("instance", id))?;
        instance.config = config;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_instance(&self, id: InstanceId) -> StoreResult<()> {
        self.write().instances.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_tasks(&self, tasks: Vec<(Task, Vec<Step>)>) -> StoreResult<()> {
        let mut tables = self.write();

        // Validate the whole batch before touching any table
        for (task, steps) in &tasks {
            if tables.tasks.contains_key(&task.id) {
                return Err(OrchestratorError::StorageError(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            if let Some(step) = steps.iter().find(|s| s.task_id != task.id) {
                return Err(OrchestratorError::StorageError(format!(
                    "step {} belongs to task {}, not {}",
                    step.kind, step.task_id, task.id
                )));
            }
        }

        for (task, steps) in tasks {
            for step in steps {
                tables.steps.insert(step.key(), step);
            }
            tables.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        Ok(self.read().tasks.get(id).cloned())
    }

    async fn list_tasks_by_process(&self, process_id: ProcessId) -> StoreResult<Vec<Task>> {
        let tasks = self
            .read()
            .tasks
            .values()
            .filter(|t| t.process_id == Some(process_id))
            .cloned()
            .collect();
        Ok(Self::newest_first(tasks))
    }

    async fn list_tasks_by_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> StoreResult<Vec<Task>> {
        let tasks = self
            .read()
            .tasks
            .values()
            .filter(|t| t.process_id == Some(process_id) && t.machine_id == Some(machine_id))
            .cloned()
            .collect();
        Ok(Self::newest_first(tasks))
    }

    async fn list_tasks_by_instance(&self, instance_id: InstanceId) -> StoreResult<Vec<Task>> {
        let tables = self.read();
        // Fleet-wide tasks reach the instance through their steps only
        let via_steps: BTreeSet<&TaskId> = tables
            .steps
            .values()
            .filter(|s| s.instance_id == Some(instance_id))
            .map(|s| &s.task_id)
            .collect();
        let tasks = tables
            .tasks
            .values()
            .filter(|t| t.instance_id == Some(instance_id) || via_steps.contains(&t.id))
            .cloned()
            .collect();
        Ok(Self::newest_first(tasks))
    }

    async fn update_task_times(
        &self,
        id: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut tables = self.write();
        let task = tables.tasks.get_mut(id).ok_or_else(|| not_found("task", id))?;
        task.start_time = start_time;
        task.end_time = end_time;
        Ok(())
    }

    async fn transition_task(
        &self,
        id: &str,
        from: &[TaskStatus],
        status: TaskStatus,
        error: Option<String>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut tables = self.write();
        let task = tables.tasks.get_mut(id).ok_or_else(|| not_found("task", id))?;
        if !from.contains(&task.status) {
            return Ok(false);
        }
        task.status = status;
        task.error_message = error;
        if let Some(end) = end_time {
            task.start_time.get_or_insert(end);
            task.end_time = Some(end);
        }
        Ok(true)
    }

    async fn delete_task(&self, id: &str) -> StoreResult<()> {
        let mut tables = self.write();
        tables.steps.retain(|key, _| key.task_id != id);
        tables.tasks.remove(id);
        Ok(())
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn list_steps(&self, task_id: &str) -> StoreResult<Vec<Step>> {
        Ok(self
            .read()
            .steps
            .iter()
            .filter(|(key, _)| key.task_id == task_id)
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn get_step(&self, key: &StepKey) -> StoreResult<Option<Step>> {
        Ok(self.read().steps.get(key).cloned())
    }

    async fn update_step_status(&self, key: &StepKey, status: StepStatus) -> StoreResult<()> {
        let mut tables = self.write();
        let step = tables
            .steps
            .get_mut(key)
            .ok_or_else(|| step_not_found(key))?;
        step.status = status;
        Ok(())
    }

    async fn update_step_times(
        &self,
        key: &StepKey,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut tables = self.write();
        let step = tables
            .steps
            .get_mut(key)
            .ok_or_else(|| step_not_found(key))?;
        step.start_time = start_time;
        step.end_time = end_time;
        Ok(())
    }

    async fn update_step_error(&self, key: &StepKey, error: Option<String>) -> StoreResult<()> {
        let mut tables = self.write();
        let step = tables
            .steps
            .get_mut(key)
            .ok_or_else(|| step_not_found(key))?;
        step.error_message = error;
        Ok(())
    }

    async fn reset_steps(&self, task_id: &str, keys: &[StepKey]) -> StoreResult<usize> {
        let mut tables = self.write();
        let mut changed = 0;
        for key in keys.iter().filter(|k| k.task_id == task_id) {
            if let Some(step) = tables.steps.get_mut(key) {
                step.status = StepStatus::Pending;
                step.start_time = None;
                step.end_time = None;
                step.error_message = None;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
