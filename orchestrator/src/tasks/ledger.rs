//! Task and step bookkeeping

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use fleet_api::models::{
    InstanceStepsResponse, MachineStepResponse, ProgressResponse, StepResponse,
    TaskDetailResponse, TaskStepsGroupResponse, TaskSummaryResponse,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::OrchestratorError;
use crate::models::machine::MachineId;
use crate::models::process::{ConfigUpdate, InstanceId, ProcessId};
use crate::models::task::{
    OperationType, Step, StepKey, StepKind, StepStatus, Task, TaskId, TaskProgress, TaskStatus,
};
use crate::store::{not_found, StepStore, StoreResult, TaskStore};
use crate::tasks::pool::WorkerPool;
use crate::utils::generate_uuid;

/// Error text put on steps that a cancellation kept from running
pub const CANCELLED_REASON: &str = "cancelled";

/// Machine (and instance, when known) a step set is recorded for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepTarget {
    pub machine_id: MachineId,
    pub instance_id: Option<InstanceId>,
}

impl StepTarget {
    pub fn new(machine_id: MachineId, instance_id: Option<InstanceId>) -> Self {
        Self {
            machine_id,
            instance_id,
        }
    }
}

/// Descriptive fields shared by every task of one request
#[derive(Debug, Clone)]
pub struct NewTask {
    pub process_id: Option<ProcessId>,
    pub operation: OperationType,
    pub name: String,
    pub description: String,
    pub config_update: Option<ConfigUpdate>,
}

impl NewTask {
    pub fn new(operation: OperationType, process_id: Option<ProcessId>) -> Self {
        Self {
            process_id,
            operation,
            name: operation.label().to_string(),
            description: String::new(),
            config_update: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config_update(mut self, update: ConfigUpdate) -> Self {
        self.config_update = Some(update);
        self
    }
}

/// Reported once a task has been finalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub error_message: Option<String>,
}

/// Records operations as tasks with per-machine steps and drives their
/// execution on the worker pool.
pub struct TaskLedger {
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    pool: WorkerPool,
}

impl TaskLedger {
    pub fn new(tasks: Arc<dyn TaskStore>, steps: Arc<dyn StepStore>, pool: WorkerPool) -> Self {
        Self { tasks, steps, pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    // ------------------------------ creation ------------------------------ //

    fn build(
        new: &NewTask,
        machine_id: Option<MachineId>,
        instance_id: Option<InstanceId>,
        targets: &[StepTarget],
        kinds: &[StepKind],
    ) -> StoreResult<(Task, Vec<Step>)> {
        if targets.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "a task needs at least one machine".to_string(),
            ));
        }
        let kinds: BTreeSet<StepKind> = kinds.iter().copied().collect();
        if kinds.is_empty() {
            return Err(OrchestratorError::ValidationError(
                "a task needs at least one step".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = targets.iter().find(|t| !seen.insert(t.machine_id)) {
            return Err(OrchestratorError::ValidationError(format!(
                "machine {} appears twice in one task",
                dup.machine_id
            )));
        }

        let id = generate_uuid();
        let steps = targets
            .iter()
            .flat_map(|target| {
                kinds
                    .iter()
                    .map(|kind| Step::pending(&id, target.machine_id, target.instance_id, *kind))
                    .collect::<Vec<_>>()
            })
            .collect();
        let task = Task {
            id,
            process_id: new.process_id,
            machine_id,
            instance_id,
            name: new.name.clone(),
            description: new.description.clone(),
            operation: new.operation,
            status: TaskStatus::Pending,
            config_update: new.config_update.clone(),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error_message: None,
        };
        Ok((task, steps))
    }

    /// One task spanning several machines
    pub async fn create_global_task(
        &self,
        new: NewTask,
        targets: &[StepTarget],
        kinds: &[StepKind],
    ) -> StoreResult<TaskId> {
        let (task, steps) = Self::build(&new, None, None, targets, kinds)?;
        let id = task.id.clone();
        self.tasks.insert_tasks(vec![(task, steps)]).await?;
        info!(task_id = %id, operation = %new.operation, machines = targets.len(), "created task");
        Ok(id)
    }

    pub async fn create_machine_task(
        &self,
        new: NewTask,
        target: StepTarget,
        kinds: &[StepKind],
    ) -> StoreResult<TaskId> {
        let mut ids = self.create_instance_tasks(&[(new, target)], kinds).await?;
        ids.pop()
            .ok_or_else(|| OrchestratorError::Internal("no task created".to_string()))
    }

    /// One task per entry, all inserted or none. Ids come back in entry
    /// order; entries may share a machine.
    pub async fn create_instance_tasks(
        &self,
        batch: &[(NewTask, StepTarget)],
        kinds: &[StepKind],
    ) -> StoreResult<Vec<TaskId>> {
        let rows = batch
            .iter()
            .map(|(new, target)| {
                Self::build(
                    new,
                    Some(target.machine_id),
                    target.instance_id,
                    std::slice::from_ref(target),
                    kinds,
                )
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let ids: Vec<TaskId> = rows.iter().map(|(task, _)| task.id.clone()).collect();
        self.tasks.insert_tasks(rows).await?;
        info!(count = ids.len(), "created tasks");
        Ok(ids)
    }

    /// One task per machine, keyed by machine id
    pub async fn create_machine_tasks(
        &self,
        new: NewTask,
        targets: &[StepTarget],
        kinds: &[StepKind],
    ) -> StoreResult<BTreeMap<MachineId, TaskId>> {
        let mut seen = BTreeSet::new();
        if let Some(dup) = targets.iter().find(|t| !seen.insert(t.machine_id)) {
            return Err(OrchestratorError::ValidationError(format!(
                "machine {} listed more than once",
                dup.machine_id
            )));
        }
        let batch: Vec<(NewTask, StepTarget)> =
            targets.iter().map(|t| (new.clone(), *t)).collect();
        let ids = self.create_instance_tasks(&batch, kinds).await?;
        Ok(targets.iter().map(|t| t.machine_id).zip(ids).collect())
    }

    // ------------------------------ execution ----------------------------- //

    /// Run `action` on the worker pool. The task is marked RUNNING first;
    /// once the action returns its status is derived from the step rows and
    /// `callback` receives the result.
    pub fn execute_async<F, C>(
        self: &Arc<Self>,
        task_id: TaskId,
        action: F,
        callback: C,
    ) -> JoinHandle<Option<TaskCompletion>>
    where
        F: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
        C: FnOnce(TaskCompletion) + Send + 'static,
    {
        let ledger = Arc::clone(self);
        self.pool.spawn(async move {
            if let Err(e) = ledger.mark_running(&task_id).await {
                error!(task_id = %task_id, "failed to mark task running: {}", e);
            }

            let result = action.await;
            if let Err(e) = &result {
                warn!(task_id = %task_id, "task action failed: {}", e);
            }

            let completion = match ledger.finalize(&task_id, &result).await {
                Ok(completion) => completion,
                Err(e) => {
                    error!(task_id = %task_id, "failed to finalize task: {}", e);
                    TaskCompletion {
                        task_id: task_id.clone(),
                        status: TaskStatus::Failed,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            callback(completion.clone());
            completion
        })
    }

    /// PENDING -> RUNNING. Any other status is left alone.
    pub async fn mark_running(&self, task_id: &str) -> StoreResult<()> {
        let started = self
            .tasks
            .transition_task(task_id, &[TaskStatus::Pending], TaskStatus::Running, None, None)
            .await?;
        if !started {
            return Ok(());
        }
        self.tasks
            .update_task_times(task_id, Some(Utc::now()), None)
            .await
    }

    /// Write the terminal status implied by the step rows.
    ///
    /// A cancelled task stays cancelled. Otherwise any failed step or a
    /// failed action makes it FAILED, and it is COMPLETED only when every
    /// step reached a terminal status.
    pub async fn finalize(
        &self,
        task_id: &str,
        result: &Result<(), OrchestratorError>,
    ) -> StoreResult<TaskCompletion> {
        let task = self.task(task_id).await?;
        let steps = self.steps.list_steps(task_id).await?;
        let progress = TaskProgress::from_steps(&steps);

        let (status, error_message) = if task.status == TaskStatus::Cancelled {
            (
                TaskStatus::Cancelled,
                task.error_message.clone().or_else(|| Some(CANCELLED_REASON.to_string())),
            )
        } else if let Err(e) = result {
            (TaskStatus::Failed, Some(e.to_string()))
        } else if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
            (
                TaskStatus::Failed,
                Some(format!(
                    "{} failed on machine {}: {}",
                    failed.kind,
                    failed.machine_id,
                    failed.error_message.as_deref().unwrap_or("unknown error")
                )),
            )
        } else if progress.done() == progress.total {
            (TaskStatus::Completed, None)
        } else {
            (
                TaskStatus::Failed,
                Some(format!(
                    "{} of {} steps did not run",
                    progress.total - progress.done(),
                    progress.total
                )),
            )
        };

        // Status, error and end time land together, and only over the status
        // read above; a cancel in between wins
        let from = match status {
            TaskStatus::Cancelled => vec![TaskStatus::Cancelled],
            _ => vec![TaskStatus::Pending, TaskStatus::Running],
        };
        let end = Some(Utc::now());
        let (status, error_message) = if self
            .tasks
            .transition_task(task_id, &from, status, error_message.clone(), end)
            .await?
        {
            (status, error_message)
        } else {
            let current = self.task(task_id).await?;
            if current.status == TaskStatus::Cancelled {
                let reason = current
                    .error_message
                    .or_else(|| Some(CANCELLED_REASON.to_string()));
                self.tasks
                    .transition_task(
                        task_id,
                        &[TaskStatus::Cancelled],
                        TaskStatus::Cancelled,
                        reason.clone(),
                        end,
                    )
                    .await?;
                (TaskStatus::Cancelled, reason)
            } else {
                warn!(task_id = %task_id, status = %current.status, "task finished elsewhere");
                (current.status, current.error_message)
            }
        };

        info!(task_id = %task_id, status = %status, progress = progress.percentage, "task finished");
        Ok(TaskCompletion {
            task_id: task_id.to_string(),
            status,
            error_message,
        })
    }

    /// Mark a task CANCELLED. Returns false when it had already finished.
    pub async fn cancel_task(&self, task_id: &str) -> StoreResult<bool> {
        let cancelled = self
            .tasks
            .transition_task(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Running],
                TaskStatus::Cancelled,
                Some(CANCELLED_REASON.to_string()),
                None,
            )
            .await?;
        if cancelled {
            info!(task_id = %task_id, "task cancelled");
        }
        Ok(cancelled)
    }

    pub async fn is_cancelled(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.task(task_id).await?.status == TaskStatus::Cancelled)
    }

    // ---------------------------- step mutators --------------------------- //

    pub async fn start_step(&self, key: &StepKey) -> StoreResult<()> {
        self.steps.update_step_status(key, StepStatus::Running).await?;
        self.steps.update_step_error(key, None).await?;
        self.steps.update_step_times(key, Some(Utc::now()), None).await
    }

    pub async fn complete_step(&self, key: &StepKey) -> StoreResult<()> {
        self.finish_step(key, StepStatus::Completed, None).await
    }

    pub async fn fail_step(&self, key: &StepKey, message: impl Into<String>) -> StoreResult<()> {
        self.finish_step(key, StepStatus::Failed, Some(message.into())).await
    }

    /// A skip with a reason is a deferral: retry resets it
    pub async fn skip_step(&self, key: &StepKey, reason: Option<String>) -> StoreResult<()> {
        self.finish_step(key, StepStatus::Skipped, reason).await
    }

    async fn finish_step(
        &self,
        key: &StepKey,
        status: StepStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let start = self.steps.get_step(key).await?.and_then(|s| s.start_time);
        self.steps.update_step_status(key, status).await?;
        self.steps.update_step_error(key, error).await?;
        self.steps.update_step_times(key, start, Some(Utc::now())).await?;
        debug!(task_id = %key.task_id, machine_id = key.machine_id, step = %key.kind, status = %status, "step finished");
        Ok(())
    }

    /// Skip every still-PENDING step of one machine within the task
    pub async fn skip_pending_steps(
        &self,
        task_id: &str,
        machine_id: MachineId,
        kinds: Option<&[StepKind]>,
        reason: Option<&str>,
    ) -> StoreResult<usize> {
        let steps = self.steps.list_steps(task_id).await?;
        let mut skipped = 0;
        for step in steps.iter().filter(|s| {
            s.machine_id == machine_id
                && s.status == StepStatus::Pending
                && kinds.map_or(true, |k| k.contains(&s.kind))
        }) {
            self.skip_step(&step.key(), reason.map(str::to_string)).await?;
            skipped += 1;
        }
        Ok(skipped)
    }

    // -------------------------------- retry ------------------------------- //

    /// Put the given steps back to PENDING
    pub async fn reset_step_statuses(&self, task_id: &str, keys: &[StepKey]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.steps.reset_steps(task_id, keys).await
    }

    /// Return a finished task to PENDING so it can be executed again
    pub async fn reopen_task(&self, task_id: &str) -> StoreResult<()> {
        let reopened = self
            .tasks
            .transition_task(
                task_id,
                &[TaskStatus::Failed, TaskStatus::Cancelled],
                TaskStatus::Pending,
                None,
                None,
            )
            .await?;
        if !reopened {
            return Err(OrchestratorError::ValidationError(format!(
                "task {} is not failed or cancelled",
                task_id
            )));
        }
        self.tasks.update_task_times(task_id, None, None).await
    }

    // ------------------------------- queries ------------------------------ //

    pub async fn task(&self, task_id: &str) -> StoreResult<Task> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| not_found("task", task_id))
    }

    pub async fn steps(&self, task_id: &str) -> StoreResult<Vec<Step>> {
        self.steps.list_steps(task_id).await
    }

    pub async fn progress(&self, task_id: &str) -> StoreResult<TaskProgress> {
        self.task(task_id).await?;
        Ok(TaskProgress::from_steps(&self.steps.list_steps(task_id).await?))
    }

    pub async fn machine_progress(
        &self,
        task_id: &str,
        machine_id: MachineId,
    ) -> StoreResult<TaskProgress> {
        let steps = self.steps.list_steps(task_id).await?;
        Ok(TaskProgress::from_steps(
            steps.iter().filter(|s| s.machine_id == machine_id),
        ))
    }

    pub async fn task_detail(&self, task_id: &str) -> StoreResult<TaskDetailResponse> {
        let task = self.task(task_id).await?;
        let steps = self.steps.list_steps(task_id).await?;

        let mut by_machine: BTreeMap<MachineId, Vec<&Step>> = BTreeMap::new();
        for step in &steps {
            by_machine.entry(step.machine_id).or_default().push(step);
        }
        let instances = by_machine
            .into_iter()
            .map(|(machine_id, steps)| InstanceStepsResponse {
                machine_id,
                instance_id: steps.first().and_then(|s| s.instance_id),
                progress: progress_response(&TaskProgress::from_steps(steps.iter().copied())),
                steps: steps.iter().map(|s| step_response(s)).collect(),
            })
            .collect();

        Ok(TaskDetailResponse {
            duration_ms: match (task.start_time, task.end_time) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            },
            task_id: task.id,
            name: task.name,
            description: task.description,
            process_id: task.process_id,
            machine_id: task.machine_id,
            instance_id: task.instance_id,
            operation_type: task.operation.as_str().to_string(),
            status: task.status.as_str().to_string(),
            created_at: task.created_at,
            start_time: task.start_time,
            end_time: task.end_time,
            error_message: task.error_message,
            progress: progress_response(&TaskProgress::from_steps(&steps)),
            instances,
        })
    }

    /// One entry per step kind with counts across machines
    pub async fn task_steps_grouped(&self, task_id: &str) -> StoreResult<Vec<TaskStepsGroupResponse>> {
        self.task(task_id).await?;
        let steps = self.steps.list_steps(task_id).await?;

        let mut by_kind: BTreeMap<StepKind, Vec<&Step>> = BTreeMap::new();
        for step in &steps {
            by_kind.entry(step.kind).or_default().push(step);
        }

        Ok(by_kind
            .into_iter()
            .map(|(kind, mut steps)| {
                steps.sort_by_key(|s| s.machine_id);
                let counts = TaskProgress::from_steps(steps.iter().copied());
                TaskStepsGroupResponse {
                    step_id: kind.as_str().to_string(),
                    step_name: kind.display_name().to_string(),
                    total: counts.total,
                    pending: counts.pending,
                    running: counts.running,
                    completed: counts.completed,
                    failed: counts.failed,
                    skipped: counts.skipped,
                    machines: steps
                        .iter()
                        .map(|s| MachineStepResponse {
                            machine_id: s.machine_id,
                            instance_id: s.instance_id,
                            status: s.status.as_str().to_string(),
                            start_time: s.start_time,
                            end_time: s.end_time,
                            error_message: s.error_message.clone(),
                        })
                        .collect(),
                }
            })
            .collect())
    }

    pub async fn summarize(&self, tasks: Vec<Task>) -> StoreResult<Vec<TaskSummaryResponse>> {
        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let progress = TaskProgress::from_steps(&self.steps.list_steps(&task.id).await?);
            summaries.push(TaskSummaryResponse {
                task_id: task.id,
                name: task.name,
                operation_type: task.operation.as_str().to_string(),
                status: task.status.as_str().to_string(),
                progress_percentage: progress.percentage,
                created_at: task.created_at,
                end_time: task.end_time,
            });
        }
        Ok(summaries)
    }

    pub async fn tasks_for_process(&self, process_id: ProcessId) -> StoreResult<Vec<Task>> {
        self.tasks.list_tasks_by_process(process_id).await
    }

    pub async fn tasks_for_process_machine(
        &self,
        process_id: ProcessId,
        machine_id: MachineId,
    ) -> StoreResult<Vec<Task>> {
        self.tasks.list_tasks_by_process_machine(process_id, machine_id).await
    }

    pub async fn tasks_for_instance(&self, instance_id: InstanceId) -> StoreResult<Vec<Task>> {
        self.tasks.list_tasks_by_instance(instance_id).await
    }

    pub async fn latest_task_for_instance(&self, instance_id: InstanceId) -> StoreResult<Option<Task>> {
        Ok(self.tasks.list_tasks_by_instance(instance_id).await?.into_iter().next())
    }

    pub async fn delete_task(&self, task_id: &str) -> StoreResult<()> {
        self.tasks.delete_task(task_id).await
    }
}

/// Steps a retry puts back to PENDING.
///
/// FAILED and stuck RUNNING steps always qualify, as do steps skipped with a
/// reason (cancelled, or deferred after an earlier failure). A plain skip
/// counts only for steps of `plan` and only when `revalidate_skipped` is set.
pub fn retry_keys(steps: &[Step], plan: &[StepKind], revalidate_skipped: bool) -> Vec<StepKey> {
    steps
        .iter()
        .filter(|step| match step.status {
            StepStatus::Failed | StepStatus::Running => true,
            StepStatus::Skipped if step.error_message.is_some() => true,
            StepStatus::Skipped => revalidate_skipped && plan.contains(&step.kind),
            StepStatus::Pending | StepStatus::Completed => false,
        })
        .map(Step::key)
        .collect()
}

fn step_response(step: &Step) -> StepResponse {
    StepResponse {
        step_id: step.kind.as_str().to_string(),
        step_name: step.kind.display_name().to_string(),
        status: step.status.as_str().to_string(),
        start_time: step.start_time,
        end_time: step.end_time,
        error_message: step.error_message.clone(),
    }
}

fn progress_response(progress: &TaskProgress) -> ProgressResponse {
    ProgressResponse {
        total: progress.total,
        pending: progress.pending,
        running: progress.running,
        completed: progress.completed,
        failed: progress.failed,
        skipped: progress.skipped,
        percentage: progress.percentage,
    }
}
