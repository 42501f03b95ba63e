//! Instance executor
//!
//! Drives one task's steps against each affected instance: checks the
//! lifecycle state, walks the operation plan in order and records every
//! step outcome in the ledger.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn, Instrument};

use crate::deploy::commands::{
    run_command, CommandContext, CommandFactory, CommandOutcome, CommandSettings,
};
use crate::deploy::fsm::{InstanceAction, InstanceEvent, InstanceState};
use crate::errors::OrchestratorError;
use crate::logs::OpContext;
use crate::models::process::{ConfigUpdate, Instance, InstanceId};
use crate::models::task::{OperationType, Step, StepKey, StepKind, StepStatus, Task};
use crate::remote::host::RemoteHost;
use crate::store::{not_found, InstanceStore, MachineStore};
use crate::tasks::ledger::{TaskLedger, CANCELLED_REASON};

/// What happens to the rest of the plan after a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Remaining steps stay PENDING
    #[default]
    LeavePending,
    /// Remaining steps are marked SKIPPED
    SkipRemaining,
}

/// An operation with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    Start,
    Stop,
    Restart,
    UpdateConfig(ConfigUpdate),
    RefreshConfig,
}

/// Lifecycle edge a phase runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    Stop,
}

/// Steps executed together under at most one lifecycle edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub edge: Option<Edge>,
    pub steps: Vec<StepKind>,
}

impl Operation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Operation::Initialize => OperationType::Initialize,
            Operation::Start => OperationType::Start,
            Operation::Stop => OperationType::Stop,
            Operation::Restart => OperationType::Restart,
            Operation::UpdateConfig(_) => OperationType::UpdateConfig,
            Operation::RefreshConfig => OperationType::RefreshConfig,
        }
    }

    /// Capability the instance must have for this operation
    pub fn action(&self) -> InstanceAction {
        match self {
            Operation::Initialize | Operation::Start => InstanceAction::Start,
            Operation::Stop => InstanceAction::Stop,
            Operation::Restart => InstanceAction::Restart,
            Operation::UpdateConfig(_) => InstanceAction::UpdateConfig,
            Operation::RefreshConfig => InstanceAction::RefreshConfig,
        }
    }

    /// Rebuild the operation recorded on a task
    pub fn from_task(task: &Task) -> Result<Operation, OrchestratorError> {
        Ok(match task.operation {
            OperationType::Initialize => Operation::Initialize,
            OperationType::Start => Operation::Start,
            OperationType::Stop => Operation::Stop,
            OperationType::Restart => Operation::Restart,
            OperationType::RefreshConfig => Operation::RefreshConfig,
            OperationType::UpdateConfig => match &task.config_update {
                Some(update) if !update.is_empty() => Operation::UpdateConfig(update.clone()),
                _ => {
                    return Err(OrchestratorError::ValidationError(format!(
                        "task {} carries no config update",
                        task.id
                    )))
                }
            },
        })
    }

    pub fn phases(&self) -> Vec<Phase> {
        let start = Phase {
            edge: Some(Edge::Start),
            steps: vec![StepKind::StartProcess, StepKind::VerifyProcess],
        };
        let stop = Phase {
            edge: Some(Edge::Stop),
            steps: vec![StepKind::StopProcess],
        };
        match self {
            Operation::Initialize => vec![Phase {
                edge: Some(Edge::Start),
                steps: vec![
                    StepKind::CreateRemoteDir,
                    StepKind::UploadPackage,
                    StepKind::ExtractPackage,
                    StepKind::CreateConfig,
                    StepKind::UpdateSystemConfig,
                    StepKind::StartProcess,
                    StepKind::VerifyProcess,
                ],
            }],
            Operation::Start => vec![start],
            Operation::Stop => vec![stop],
            Operation::Restart => vec![stop, start],
            Operation::UpdateConfig(update) => vec![Phase {
                edge: None,
                steps: update.artifacts().iter().map(|a| a.update_step()).collect(),
            }],
            Operation::RefreshConfig => vec![Phase {
                edge: None,
                steps: vec![StepKind::RefreshConfig],
            }],
        }
    }

    /// Steps executed, in order
    pub fn plan(&self) -> Vec<StepKind> {
        self.phases().into_iter().flat_map(|p| p.steps).collect()
    }

    /// Step rows recorded for the task. INITIALIZE records the whole
    /// vocabulary; steps outside the plan are skipped when it runs.
    pub fn task_steps(&self) -> Vec<StepKind> {
        match self {
            Operation::Initialize => StepKind::ALL.to_vec(),
            other => other.plan(),
        }
    }

    /// States in which the operation is a no-op: the task is recorded with
    /// every step skipped and nothing runs remotely.
    pub fn is_noop_in(&self, state: InstanceState) -> bool {
        matches!(
            (self, state),
            (Operation::Start, InstanceState::Running) | (Operation::Stop, InstanceState::NotStarted)
        )
    }
}

/// Serializes lifecycle changes per instance. Task execution holds the lock
/// for a whole operation; the liveness monitor only ever tries it.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    pub async fn lock(&self, id: InstanceId) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    pub fn try_lock(&self, id: InstanceId) -> Option<OwnedMutexGuard<()>> {
        self.entry(id).try_lock_owned().ok()
    }

    /// Drop the lock entry of a deleted instance
    pub fn forget(&self, id: InstanceId) {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

/// The single write path for lifecycle state. Callers hold the instance
/// lock.
pub async fn apply_transition(
    instances: &dyn InstanceStore,
    instance_id: InstanceId,
    event: InstanceEvent,
) -> Result<InstanceState, OrchestratorError> {
    let instance = instances
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| not_found("instance", instance_id))?;
    let next = instance.state.next(event)?;
    instances.update_state(instance_id, next, Utc::now()).await?;
    debug!(instance_id, from = %instance.state, to = %next, "instance state changed");
    Ok(next)
}

/// How the steps of one instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceRun {
    /// Every planned step succeeded or was already satisfied
    Completed,
    /// Nothing needed doing
    Skipped,
    Failed { step: StepKind, message: String },
    Cancelled,
    /// The batch stopped after an environment failure elsewhere
    Aborted,
}

pub struct InstanceExecutor {
    machines: Arc<dyn MachineStore>,
    instances: Arc<dyn InstanceStore>,
    host: Arc<dyn RemoteHost>,
    ledger: Arc<TaskLedger>,
    factory: CommandFactory,
    locks: Arc<InstanceLocks>,
    failure_policy: FailurePolicy,
}

impl InstanceExecutor {
    pub fn new(
        machines: Arc<dyn MachineStore>,
        instances: Arc<dyn InstanceStore>,
        host: Arc<dyn RemoteHost>,
        ledger: Arc<TaskLedger>,
        factory: CommandFactory,
        locks: Arc<InstanceLocks>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            machines,
            instances,
            host,
            ledger,
            factory,
            locks,
            failure_policy,
        }
    }

    pub fn locks(&self) -> &Arc<InstanceLocks> {
        &self.locks
    }

    pub fn host(&self) -> &Arc<dyn RemoteHost> {
        &self.host
    }

    pub fn command_settings(&self) -> &CommandSettings {
        self.factory.settings()
    }

    /// Execute every machine of a task concurrently. Steps for a machine
    /// run in plan order; only PENDING steps are attempted.
    pub async fn run_task(
        &self,
        task_id: &str,
        abort: Arc<AtomicBool>,
    ) -> Result<BTreeMap<InstanceId, InstanceRun>, OrchestratorError> {
        let task = self.ledger.task(task_id).await?;
        let operation = Operation::from_task(&task)?;
        let ctx = OpContext::new(task_id, operation.operation_type());

        let steps = self.ledger.steps(task_id).await?;
        let mut targets: BTreeMap<InstanceId, Vec<Step>> = BTreeMap::new();
        for step in steps {
            match step.instance_id.or(task.instance_id) {
                Some(instance_id) => targets.entry(instance_id).or_default().push(step),
                None => {
                    return Err(OrchestratorError::Internal(format!(
                        "step {} of task {} has no instance",
                        step.kind, task_id
                    )))
                }
            }
        }

        let runs = futures::future::join_all(targets.into_iter().map(|(instance_id, steps)| {
            let ctx = &ctx;
            let operation = &operation;
            let abort = Arc::clone(&abort);
            async move {
                let machine_id = steps.first().map(|s| s.machine_id).unwrap_or_default();
                let span = ctx.instance_span(instance_id, machine_id);
                let result = self
                    .run_instance(ctx, operation, instance_id, &steps, &abort)
                    .instrument(span)
                    .await;
                (instance_id, machine_id, result)
            }
        }))
        .await;

        let mut results = BTreeMap::new();
        let mut first_error = None;
        for (instance_id, machine_id, result) in runs {
            match result {
                Ok(run) => {
                    results.insert(instance_id, run);
                }
                Err(e) => {
                    error!(task_id, instance_id, "instance execution failed: {}", e);
                    let reason = e.to_string();
                    self.ledger
                        .skip_pending_steps(task_id, machine_id, None, Some(&reason))
                        .await?;
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if results.values().any(|run| *run == InstanceRun::Aborted) {
            return Err(OrchestratorError::EnvironmentError(
                "batch aborted after a local environment failure".to_string(),
            ));
        }
        Ok(results)
    }

    /// Cancellation or a batch abort, if either applies
    async fn interruption(
        &self,
        task_id: &str,
        abort: &AtomicBool,
    ) -> Result<Option<InstanceRun>, OrchestratorError> {
        if self.ledger.is_cancelled(task_id).await? {
            return Ok(Some(InstanceRun::Cancelled));
        }
        if abort.load(Ordering::SeqCst) {
            return Ok(Some(InstanceRun::Aborted));
        }
        Ok(None)
    }

    async fn run_instance(
        &self,
        ctx: &OpContext,
        operation: &Operation,
        instance_id: InstanceId,
        steps: &[Step],
        abort: &AtomicBool,
    ) -> Result<InstanceRun, OrchestratorError> {
        let _guard = self.locks.lock(instance_id).await;

        let instance = self.load_instance(instance_id).await?;
        let machine_id = instance.machine_id;
        let task_id = ctx.task_id.as_str();
        let pending = |kind: StepKind| {
            steps
                .iter()
                .any(|s| s.kind == kind && s.status == StepStatus::Pending)
        };

        // Rows outside the plan only exist for the record
        let plan = operation.plan();
        let extra: Vec<StepKind> = steps
            .iter()
            .map(|s| s.kind)
            .filter(|k| !plan.contains(k))
            .collect();
        if !extra.is_empty() {
            self.ledger
                .skip_pending_steps(task_id, machine_id, Some(&extra), None)
                .await?;
        }

        if operation.is_noop_in(instance.state) {
            info!(state = %instance.state, "instance already in the requested state, skipping");
            self.ledger
                .skip_pending_steps(task_id, machine_id, None, None)
                .await?;
            return Ok(InstanceRun::Skipped);
        }

        let phases = operation.phases();
        let mut ran_any = false;
        for (index, phase) in phases.iter().enumerate() {
            let todo: Vec<StepKind> = phase.steps.iter().copied().filter(|k| pending(*k)).collect();
            if todo.is_empty() {
                continue;
            }

            if let Some(stop) = self.interruption(task_id, abort).await? {
                let reason = self.deferral_reason(&stop);
                let remaining: Vec<StepKind> = phases[index..]
                    .iter()
                    .flat_map(|p| p.steps.iter().copied())
                    .collect();
                self.ledger
                    .skip_pending_steps(task_id, machine_id, Some(&remaining), Some(&reason))
                    .await?;
                return Ok(stop);
            }

            let state = self.load_instance(instance_id).await?.state;
            match phase.edge {
                Some(Edge::Stop) if *operation == Operation::Restart && state == InstanceState::NotStarted => {
                    debug!("nothing to stop before restart");
                    self.ledger
                        .skip_pending_steps(task_id, machine_id, Some(&todo), None)
                        .await?;
                    continue;
                }
                Some(Edge::Start) => {
                    state.ensure(InstanceAction::Start)?;
                    apply_transition(self.instances.as_ref(), instance_id, InstanceEvent::StartRequested)
                        .await?;
                }
                Some(Edge::Stop) => {
                    state.ensure(InstanceAction::Stop)?;
                    apply_transition(self.instances.as_ref(), instance_id, InstanceEvent::StopRequested)
                        .await?;
                }
                None => state.ensure(operation.action())?,
            }
            ran_any = true;

            let outcome = self.run_steps(ctx, operation, instance_id, &todo, abort).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.settle_edge(instance_id, phase.edge, false).await;
                    return Err(e);
                }
            };
            self.settle_edge(instance_id, phase.edge, outcome == InstanceRun::Completed)
                .await;

            if outcome != InstanceRun::Completed {
                let later: Vec<StepKind> = phases[index + 1..]
                    .iter()
                    .flat_map(|p| p.steps.iter().copied())
                    .collect();
                match &outcome {
                    InstanceRun::Cancelled | InstanceRun::Aborted => {
                        let reason = self.deferral_reason(&outcome);
                        self.ledger
                            .skip_pending_steps(task_id, machine_id, Some(&later), Some(&reason))
                            .await?;
                    }
                    InstanceRun::Failed { step, .. } if self.failure_policy == FailurePolicy::SkipRemaining => {
                        let reason = format!("skipped after {} failed", step);
                        self.ledger
                            .skip_pending_steps(task_id, machine_id, Some(&later), Some(&reason))
                            .await?;
                    }
                    _ => {}
                }
                return Ok(outcome);
            }
        }

        if let Operation::UpdateConfig(update) = operation {
            let instance = self.load_instance(instance_id).await?;
            self.instances
                .update_config(instance_id, instance.config.merged(update))
                .await?;
        }

        Ok(if ran_any {
            InstanceRun::Completed
        } else {
            InstanceRun::Skipped
        })
    }

    /// Run `kinds` in order; stop at the first failure
    async fn run_steps(
        &self,
        ctx: &OpContext,
        operation: &Operation,
        instance_id: InstanceId,
        kinds: &[StepKind],
        abort: &AtomicBool,
    ) -> Result<InstanceRun, OrchestratorError> {
        let task_id = ctx.task_id.as_str();

        for (index, kind) in kinds.iter().copied().enumerate() {
            let instance = self.load_instance(instance_id).await?;
            let key = StepKey {
                task_id: task_id.to_string(),
                machine_id: instance.machine_id,
                kind,
            };
            let rest = &kinds[index..];

            if let Some(stop) = self.interruption(task_id, abort).await? {
                let reason = self.deferral_reason(&stop);
                self.ledger
                    .skip_pending_steps(task_id, instance.machine_id, Some(rest), Some(&reason))
                    .await?;
                return Ok(stop);
            }

            let machine = match self.machines.get_machine(instance.machine_id).await? {
                Some(machine) => machine,
                None => {
                    let message = format!("machine {} does not exist", instance.machine_id);
                    self.ledger.fail_step(&key, message.clone()).await?;
                    return Ok(InstanceRun::Failed {
                        step: kind,
                        message,
                    });
                }
            };

            self.ledger.start_step(&key).await?;
            let desired = match operation {
                Operation::UpdateConfig(update) => instance.config.merged(update),
                _ => instance.config.clone(),
            };
            let command = self
                .factory
                .command_for(kind, operation.operation_type(), &desired);
            let command_ctx = CommandContext::new(
                &machine,
                &instance,
                self.host.as_ref(),
                self.instances.as_ref(),
                self.factory.settings(),
            );

            match run_command(command.as_ref(), &command_ctx).await {
                CommandOutcome::Satisfied | CommandOutcome::Applied => {
                    self.ledger.complete_step(&key).await?;
                }
                CommandOutcome::Failed(failure) => {
                    warn!(step = %kind, "step failed: {}", failure);
                    self.ledger.fail_step(&key, failure.message.clone()).await?;
                    if failure.environment {
                        error!(step = %kind, "local environment failure, aborting the batch");
                        abort.store(true, Ordering::SeqCst);
                    }
                    let later = &kinds[index + 1..];
                    if self.failure_policy == FailurePolicy::SkipRemaining && !later.is_empty() {
                        let reason = format!("skipped after {} failed", kind);
                        self.ledger
                            .skip_pending_steps(task_id, instance.machine_id, Some(later), Some(&reason))
                            .await?;
                    }
                    return Ok(InstanceRun::Failed {
                        step: kind,
                        message: failure.message,
                    });
                }
            }
        }
        Ok(InstanceRun::Completed)
    }

    /// Close the edge a phase opened
    async fn settle_edge(&self, instance_id: InstanceId, edge: Option<Edge>, succeeded: bool) {
        let event = match (edge, succeeded) {
            (None, _) => return,
            (Some(Edge::Start), true) => InstanceEvent::StartSucceeded,
            (Some(Edge::Start), false) => InstanceEvent::StartFailed,
            (Some(Edge::Stop), true) => InstanceEvent::StopSucceeded,
            (Some(Edge::Stop), false) => InstanceEvent::StopFailed,
        };
        if let Err(e) = apply_transition(self.instances.as_ref(), instance_id, event).await {
            error!(instance_id, "failed to record {:?}: {}", event, e);
        }
    }

    fn deferral_reason(&self, run: &InstanceRun) -> String {
        match run {
            InstanceRun::Aborted => "batch aborted after a local environment failure".to_string(),
            _ => CANCELLED_REASON.to_string(),
        }
    }

    async fn load_instance(&self, id: InstanceId) -> Result<Instance, OrchestratorError> {
        self.instances
            .get_instance(id)
            .await?
            .ok_or_else(|| not_found("instance", id))
    }
}
