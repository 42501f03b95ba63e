//! Inbound operations on processes, instances and tasks
//!
//! Every mutating call validates synchronously, records its tasks and
//! returns their ids; the work itself runs on the worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use fleet_api::models::{TaskDetailResponse, TaskStepsGroupResponse, TaskSummaryResponse};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::commands::directory::DeleteDirectory;
use crate::deploy::commands::{run_command, CommandContext, CommandOutcome};
use crate::deploy::executor::{apply_transition, InstanceExecutor, Operation};
use crate::deploy::fsm::{InstanceAction, InstanceEvent};
use crate::deploy::paths::{DeployPathResolver, InstancePaths};
use crate::deploy::validator::ConnectionValidator;
use crate::errors::OrchestratorError;
use crate::models::machine::MachineId;
use crate::models::process::{
    ConfigArtifacts, ConfigUpdate, Instance, InstanceId, LogicalProcess, NewInstance, ProcessId,
};
use crate::models::task::{StepStatus, Task, TaskId, TaskProgress, TaskStatus};
use crate::store::{not_found, Stores};
use crate::tasks::ledger::{retry_keys, NewTask, StepTarget, TaskLedger};

/// A machine to deploy to, with an optional explicit directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub machine_id: MachineId,
    pub deploy_path: Option<String>,
}

impl DeployTarget {
    pub fn new(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            deploy_path: None,
        }
    }

    pub fn at(machine_id: MachineId, path: impl Into<String>) -> Self {
        Self {
            machine_id,
            deploy_path: Some(path.into()),
        }
    }
}

/// What a retry did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub task_id: TaskId,
    /// Steps put back to PENDING
    pub reset: usize,
    pub resubmitted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    /// Re-run plan steps that an earlier attempt skipped as already done
    pub retry_revalidates_skipped: bool,
}

pub struct FleetService {
    stores: Stores,
    ledger: Arc<TaskLedger>,
    executor: Arc<InstanceExecutor>,
    validator: ConnectionValidator,
    resolver: DeployPathResolver,
    options: FleetOptions,
}

impl FleetService {
    pub fn new(
        stores: Stores,
        ledger: Arc<TaskLedger>,
        executor: Arc<InstanceExecutor>,
        validator: ConnectionValidator,
        resolver: DeployPathResolver,
        options: FleetOptions,
    ) -> Self {
        Self {
            stores,
            ledger,
            executor,
            validator,
            resolver,
            options,
        }
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    // ------------------------------ processes ----------------------------- //

    pub async fn create_process(
        &self,
        name: &str,
        templates: ConfigArtifacts,
    ) -> Result<LogicalProcess, OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::ValidationError(
                "process name must not be empty".to_string(),
            ));
        }
        let process = self.stores.processes.insert_process(name.trim(), templates).await?;
        info!(process_id = process.id, name = %process.name, "created process");
        Ok(process)
    }

    pub async fn process(&self, id: ProcessId) -> Result<LogicalProcess, OrchestratorError> {
        self.stores
            .processes
            .get_process(id)
            .await?
            .ok_or_else(|| not_found("process", id))
    }

    pub async fn instance(&self, id: InstanceId) -> Result<Instance, OrchestratorError> {
        self.stores
            .instances
            .get_instance(id)
            .await?
            .ok_or_else(|| not_found("instance", id))
    }

    pub async fn instances_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<Instance>, OrchestratorError> {
        self.stores.instances.list_instances_by_process(process_id).await
    }

    /// Deploy a process to machines: one new instance and one INITIALIZE task
    /// per machine. Machines that already run the process and name no new
    /// directory are left out.
    pub async fn deploy(
        &self,
        process_id: ProcessId,
        targets: &[DeployTarget],
    ) -> Result<BTreeMap<MachineId, TaskId>, OrchestratorError> {
        let process = self.process(process_id).await?;
        if targets.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "no machines to deploy to".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = targets.iter().find(|t| !seen.insert(t.machine_id)) {
            return Err(OrchestratorError::ValidationError(format!(
                "machine {} listed more than once",
                dup.machine_id
            )));
        }

        let existing = self.instances_for_process(process_id).await?;
        let fresh: Vec<&DeployTarget> = targets
            .iter()
            .filter(|t| {
                let explicit = t.deploy_path.as_deref().is_some_and(|p| !p.trim().is_empty());
                let deployed = existing.iter().any(|i| i.machine_id == t.machine_id);
                if deployed && !explicit {
                    debug!(process_id, machine_id = t.machine_id, "already deployed, skipping");
                }
                explicit || !deployed
            })
            .collect();
        if fresh.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut machines = Vec::with_capacity(fresh.len());
        for target in &fresh {
            machines.push(self.validator.validate_id(Some(target.machine_id)).await?);
        }

        let mut created: Vec<Instance> = Vec::with_capacity(fresh.len());
        for (target, machine) in fresh.iter().zip(&machines) {
            let inserted = match self.resolver.resolve(None, target.deploy_path.as_deref(), machine) {
                Ok(deploy_path) => {
                    self.stores
                        .instances
                        .insert_instance(NewInstance {
                            process_id,
                            machine_id: machine.id,
                            deploy_path,
                            config: process.templates.clone(),
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            match inserted {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    self.rollback_instances(&created).await;
                    return Err(e);
                }
            }
        }

        let targets: Vec<StepTarget> = created
            .iter()
            .map(|i| StepTarget::new(i.machine_id, Some(i.id)))
            .collect();
        let new = NewTask::new(Operation::Initialize.operation_type(), Some(process_id))
            .with_name(format!("Deploy {}", process.name))
            .with_description(format!("Deploy {} to {} machine(s)", process.name, targets.len()));
        let tasks = match self
            .ledger
            .create_machine_tasks(new, &targets, &Operation::Initialize.task_steps())
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                self.rollback_instances(&created).await;
                return Err(e);
            }
        };

        let abort = Arc::new(AtomicBool::new(false));
        for task_id in tasks.values() {
            self.submit(task_id.clone(), Arc::clone(&abort));
        }
        info!(process_id, tasks = tasks.len(), "deployment submitted");
        Ok(tasks)
    }

    async fn rollback_instances(&self, created: &[Instance]) {
        for instance in created {
            if let Err(e) = self.stores.instances.delete_instance(instance.id).await {
                warn!(instance_id = instance.id, "failed to roll back instance: {}", e);
            }
        }
    }

    // ------------------------------ lifecycle ----------------------------- //

    pub async fn start_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<BTreeMap<InstanceId, TaskId>, OrchestratorError> {
        self.lifecycle(ids, Operation::Start).await
    }

    pub async fn stop_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<BTreeMap<InstanceId, TaskId>, OrchestratorError> {
        self.lifecycle(ids, Operation::Stop).await
    }

    pub async fn restart_instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<BTreeMap<InstanceId, TaskId>, OrchestratorError> {
        self.lifecycle(ids, Operation::Restart).await
    }

    pub async fn start_instance(&self, id: InstanceId) -> Result<TaskId, OrchestratorError> {
        self.single(id, Operation::Start).await
    }

    pub async fn stop_instance(&self, id: InstanceId) -> Result<TaskId, OrchestratorError> {
        self.single(id, Operation::Stop).await
    }

    pub async fn restart_instance(&self, id: InstanceId) -> Result<TaskId, OrchestratorError> {
        self.single(id, Operation::Restart).await
    }

    async fn single(&self, id: InstanceId, operation: Operation) -> Result<TaskId, OrchestratorError> {
        self.lifecycle(&[id], operation)
            .await?
            .remove(&id)
            .ok_or_else(|| OrchestratorError::Internal(format!("no task recorded for instance {}", id)))
    }

    /// Every instance is checked before any task exists. Instances already
    /// in the requested state get a task whose steps are all skipped.
    async fn lifecycle(
        &self,
        ids: &[InstanceId],
        operation: Operation,
    ) -> Result<BTreeMap<InstanceId, TaskId>, OrchestratorError> {
        if ids.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "no instances given".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(OrchestratorError::ValidationError(format!(
                "instance {} listed more than once",
                dup
            )));
        }

        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            let instance = self.instance(*id).await?;
            self.ensure_idle(instance.id).await?;
            if !operation.is_noop_in(instance.state) {
                instance.state.ensure(operation.action())?;
            }
            instances.push(instance);
        }

        let active: Vec<&Instance> = instances
            .iter()
            .filter(|i| !operation.is_noop_in(i.state))
            .collect();
        self.preflight(active.iter().map(|i| i.machine_id)).await?;

        let batch: Vec<(NewTask, StepTarget)> = instances
            .iter()
            .map(|i| {
                let new = NewTask::new(operation.operation_type(), Some(i.process_id))
                    .with_description(format!(
                        "{} instance {} on machine {}",
                        operation.operation_type().label(),
                        i.id,
                        i.machine_id
                    ));
                (new, StepTarget::new(i.machine_id, Some(i.id)))
            })
            .collect();
        let task_ids = self
            .ledger
            .create_instance_tasks(&batch, &operation.task_steps())
            .await?;

        let abort = Arc::new(AtomicBool::new(false));
        for task_id in &task_ids {
            self.submit(task_id.clone(), Arc::clone(&abort));
        }
        Ok(ids.iter().copied().zip(task_ids).collect())
    }

    // -------------------------------- config ------------------------------ //

    /// Write new config content. Without a machine filter the process
    /// templates change too.
    pub async fn update_config(
        &self,
        process_id: ProcessId,
        update: ConfigUpdate,
        machine_ids: Option<&[MachineId]>,
    ) -> Result<Vec<TaskId>, OrchestratorError> {
        if update.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "config update carries no content".to_string(),
            ));
        }
        let process = self.process(process_id).await?;
        let operation = Operation::UpdateConfig(update.clone());
        let instances = self.config_targets(process_id, machine_ids, &operation).await?;

        if machine_ids.is_none() {
            self.stores
                .processes
                .update_templates(process_id, process.templates.merged(&update))
                .await?;
        }

        let new = NewTask::new(operation.operation_type(), Some(process_id))
            .with_name(format!("Update config of {}", process.name))
            .with_config_update(update);
        self.submit_fleet(new, &instances, &operation, machine_ids.is_none())
            .await
    }

    /// Rewrite the persisted config files without changing their content
    pub async fn refresh_config(
        &self,
        process_id: ProcessId,
        machine_ids: Option<&[MachineId]>,
    ) -> Result<Vec<TaskId>, OrchestratorError> {
        let process = self.process(process_id).await?;
        let operation = Operation::RefreshConfig;
        let instances = self.config_targets(process_id, machine_ids, &operation).await?;

        let new = NewTask::new(operation.operation_type(), Some(process_id))
            .with_name(format!("Refresh config of {}", process.name));
        self.submit_fleet(new, &instances, &operation, machine_ids.is_none())
            .await
    }

    async fn config_targets(
        &self,
        process_id: ProcessId,
        machine_ids: Option<&[MachineId]>,
        operation: &Operation,
    ) -> Result<Vec<Instance>, OrchestratorError> {
        let all = self.instances_for_process(process_id).await?;
        let instances = match machine_ids {
            None => all,
            Some(ids) => {
                let mut selected = Vec::new();
                for id in ids {
                    let on_machine: Vec<Instance> =
                        all.iter().filter(|i| i.machine_id == *id).cloned().collect();
                    if on_machine.is_empty() {
                        return Err(OrchestratorError::NotFound(format!(
                            "process {} is not deployed on machine {}",
                            process_id, id
                        )));
                    }
                    selected.extend(on_machine);
                }
                selected
            }
        };
        if instances.is_empty() {
            return Err(OrchestratorError::ValidationError(format!(
                "process {} has no instances",
                process_id
            )));
        }

        for instance in &instances {
            self.ensure_idle(instance.id).await?;
            instance.state.ensure(operation.action())?;
        }
        self.preflight(instances.iter().map(|i| i.machine_id)).await?;
        Ok(instances)
    }

    /// A fleet-wide request is one task across machines when every machine
    /// holds a single instance; otherwise, and for filtered requests, one
    /// task per instance.
    async fn submit_fleet(
        &self,
        new: NewTask,
        instances: &[Instance],
        operation: &Operation,
        fleet_wide: bool,
    ) -> Result<Vec<TaskId>, OrchestratorError> {
        let targets: Vec<StepTarget> = instances
            .iter()
            .map(|i| StepTarget::new(i.machine_id, Some(i.id)))
            .collect();
        let distinct = targets.iter().map(|t| t.machine_id).collect::<BTreeSet<_>>().len();

        let task_ids = if fleet_wide && distinct == targets.len() {
            vec![
                self.ledger
                    .create_global_task(new, &targets, &operation.task_steps())
                    .await?,
            ]
        } else {
            let batch: Vec<(NewTask, StepTarget)> =
                targets.iter().map(|t| (new.clone(), *t)).collect();
            self.ledger
                .create_instance_tasks(&batch, &operation.task_steps())
                .await?
        };

        let abort = Arc::new(AtomicBool::new(false));
        for task_id in &task_ids {
            self.submit(task_id.clone(), Arc::clone(&abort));
        }
        Ok(task_ids)
    }

    // -------------------------------- tasks ------------------------------- //

    /// Re-run what a failed or cancelled task left undone
    pub async fn retry_task(&self, task_id: &str) -> Result<RetryOutcome, OrchestratorError> {
        let task = self.ledger.task(task_id).await?;
        let untouched = RetryOutcome {
            task_id: task.id.clone(),
            reset: 0,
            resubmitted: false,
        };
        match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled => {}
            TaskStatus::Completed => return Ok(untouched),
            other => {
                return Err(OrchestratorError::ValidationError(format!(
                    "task {} is still {}",
                    task_id, other
                )))
            }
        }

        let operation = Operation::from_task(&task)?;
        let steps = self.ledger.steps(task_id).await?;
        let keys = retry_keys(&steps, &operation.plan(), self.options.retry_revalidates_skipped);
        let has_pending = steps.iter().any(|s| s.status == StepStatus::Pending);
        if keys.is_empty() && !has_pending {
            debug!(task_id, "nothing to retry");
            return Ok(untouched);
        }

        self.ledger.reopen_task(task_id).await?;
        let reset = self.ledger.reset_step_statuses(task_id, &keys).await?;
        self.submit(task.id.clone(), Arc::new(AtomicBool::new(false)));
        info!(task_id, reset, "task resubmitted");

        Ok(RetryOutcome {
            task_id: task.id,
            reset,
            resubmitted: true,
        })
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        self.ledger.cancel_task(task_id).await
    }

    pub async fn task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.ledger.task(task_id).await
    }

    pub async fn task_detail(&self, task_id: &str) -> Result<TaskDetailResponse, OrchestratorError> {
        self.ledger.task_detail(task_id).await
    }

    pub async fn task_steps_grouped(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskStepsGroupResponse>, OrchestratorError> {
        self.ledger.task_steps_grouped(task_id).await
    }

    pub async fn task_progress(&self, task_id: &str) -> Result<TaskProgress, OrchestratorError> {
        self.ledger.progress(task_id).await
    }

    pub async fn machine_progress(
        &self,
        task_id: &str,
        machine_id: MachineId,
    ) -> Result<TaskProgress, OrchestratorError> {
        self.ledger.machine_progress(task_id, machine_id).await
    }

    pub async fn tasks_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<TaskSummaryResponse>, OrchestratorError> {
        let tasks = self.ledger.tasks_for_process(process_id).await?;
        self.ledger.summarize(tasks).await
    }

    pub async fn tasks_for_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> Result<Vec<TaskSummaryResponse>, OrchestratorError> {
        let tasks = self.ledger.tasks_for_process_machine(process_id, machine_id).await?;
        self.ledger.summarize(tasks).await
    }

    pub async fn tasks_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<TaskSummaryResponse>, OrchestratorError> {
        let tasks = self.ledger.tasks_for_instance(instance_id).await?;
        self.ledger.summarize(tasks).await
    }

    pub async fn latest_task_for_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<Task>, OrchestratorError> {
        self.ledger.latest_task_for_instance(instance_id).await
    }

    /// Poll until the task reaches a terminal status
    pub async fn await_task(&self, task_id: &str, within: Duration) -> Result<Task, OrchestratorError> {
        let deadline = Instant::now() + within;
        loop {
            let task = self.ledger.task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(format!(
                    "task {} still {} after {:?}",
                    task_id, task.status, within
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn submit(&self, task_id: TaskId, abort: Arc<AtomicBool>) {
        let executor = Arc::clone(&self.executor);
        let id = task_id.clone();
        let _handle = self.ledger.execute_async(
            task_id,
            async move {
                let runs = executor.run_task(&id, abort).await?;
                debug!(task_id = %id, instances = runs.len(), "task executed");
                Ok(())
            },
            |completion| {
                debug!(task_id = %completion.task_id, status = %completion.status, "task callback");
            },
        );
    }

    /// A caller must not stack operations on an instance
    async fn ensure_idle(&self, instance_id: InstanceId) -> Result<(), OrchestratorError> {
        let tasks = self.ledger.tasks_for_instance(instance_id).await?;
        if let Some(task) = tasks.iter().find(|t| !t.status.is_terminal()) {
            return Err(OrchestratorError::ValidationError(format!(
                "instance {} has task {} still {}",
                instance_id, task.id, task.status
            )));
        }
        Ok(())
    }

    async fn preflight(
        &self,
        machine_ids: impl Iterator<Item = MachineId>,
    ) -> Result<(), OrchestratorError> {
        let unique: BTreeSet<MachineId> = machine_ids.collect();
        for id in unique {
            self.validator.validate_id(Some(id)).await?;
        }
        Ok(())
    }

    // ------------------------------- removal ------------------------------ //

    /// Remove the instance directory, its tasks and its row
    pub async fn delete_instance(&self, id: InstanceId) -> Result<(), OrchestratorError> {
        let locks = Arc::clone(self.executor.locks());
        let guard = locks.lock(id).await;

        let instance = self.instance(id).await?;
        instance.state.ensure(InstanceAction::Delete)?;
        self.ensure_idle(id).await?;
        let machine = self.validator.validate_id(Some(instance.machine_id)).await?;

        let ctx = CommandContext::new(
            &machine,
            &instance,
            self.executor.host().as_ref(),
            self.stores.instances.as_ref(),
            self.executor.command_settings(),
        );
        if let CommandOutcome::Failed(failure) = run_command(&DeleteDirectory, &ctx).await {
            return Err(if failure.environment {
                OrchestratorError::EnvironmentError(failure.message)
            } else {
                OrchestratorError::RemoteError(failure.message)
            });
        }

        apply_transition(self.stores.instances.as_ref(), id, InstanceEvent::Removed).await?;
        // Fleet-wide tasks belong to the process and go with it
        for task in self.ledger.tasks_for_instance(id).await? {
            if task.instance_id == Some(id) {
                self.ledger.delete_task(&task.id).await?;
            }
        }
        self.stores.instances.delete_instance(id).await?;

        drop(guard);
        locks.forget(id);
        info!(instance_id = id, machine_id = instance.machine_id, "instance deleted");
        Ok(())
    }

    /// Delete every instance, every task and the process itself. Fails
    /// before touching anything if an instance cannot be deleted.
    pub async fn delete_process(&self, id: ProcessId) -> Result<(), OrchestratorError> {
        self.process(id).await?;
        let instances = self.instances_for_process(id).await?;
        for instance in &instances {
            instance.state.ensure(InstanceAction::Delete)?;
            self.ensure_idle(instance.id).await?;
        }

        for instance in &instances {
            self.delete_instance(instance.id).await?;
        }
        for task in self.ledger.tasks_for_process(id).await? {
            self.ledger.delete_task(&task.id).await?;
        }
        self.stores.processes.delete_process(id).await?;
        info!(process_id = id, instances = instances.len(), "process deleted");
        Ok(())
    }

    // --------------------------------- logs ------------------------------- //

    pub async fn tail_instance_log(
        &self,
        instance_id: InstanceId,
        lines: usize,
    ) -> Result<String, OrchestratorError> {
        let instance = self.instance(instance_id).await?;
        let machine = self
            .stores
            .machines
            .get_machine(instance.machine_id)
            .await?
            .ok_or_else(|| not_found("machine", instance.machine_id))?;
        let paths = InstancePaths::new(&instance.deploy_path, instance.id);
        Ok(self
            .executor
            .host()
            .tail_file(&machine, &paths.log_file(), lines)
            .await?)
    }
}
