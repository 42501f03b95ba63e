//! Task and step records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::machine::MachineId;
use crate::models::process::{ConfigUpdate, InstanceId, ProcessId};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Initialize,
    Start,
    Stop,
    Restart,
    UpdateConfig,
    RefreshConfig,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Initialize => "INITIALIZE",
            OperationType::Start => "START",
            OperationType::Stop => "STOP",
            OperationType::Restart => "RESTART",
            OperationType::UpdateConfig => "UPDATE_CONFIG",
            OperationType::RefreshConfig => "REFRESH_CONFIG",
        }
    }

    /// Human label used in task names
    pub fn label(&self) -> &'static str {
        match self {
            OperationType::Initialize => "Deploy",
            OperationType::Start => "Start",
            OperationType::Stop => "Stop",
            OperationType::Restart => "Restart",
            OperationType::UpdateConfig => "Update config",
            OperationType::RefreshConfig => "Refresh config",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed vocabulary of remote work units, declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    CreateRemoteDir,
    UploadPackage,
    ExtractPackage,
    CreateConfig,
    UpdateMainConfig,
    UpdateJvmConfig,
    UpdateSystemConfig,
    RefreshConfig,
    StartProcess,
    VerifyProcess,
    StopProcess,
}

impl StepKind {
    pub const ALL: [StepKind; 11] = [
        StepKind::CreateRemoteDir,
        StepKind::UploadPackage,
        StepKind::ExtractPackage,
        StepKind::CreateConfig,
        StepKind::UpdateMainConfig,
        StepKind::UpdateJvmConfig,
        StepKind::UpdateSystemConfig,
        StepKind::RefreshConfig,
        StepKind::StartProcess,
        StepKind::VerifyProcess,
        StepKind::StopProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::CreateRemoteDir => "CREATE_REMOTE_DIR",
            StepKind::UploadPackage => "UPLOAD_PACKAGE",
            StepKind::ExtractPackage => "EXTRACT_PACKAGE",
            StepKind::CreateConfig => "CREATE_CONFIG",
            StepKind::UpdateMainConfig => "UPDATE_MAIN_CONFIG",
            StepKind::UpdateJvmConfig => "UPDATE_JVM_CONFIG",
            StepKind::UpdateSystemConfig => "UPDATE_SYSTEM_CONFIG",
            StepKind::RefreshConfig => "REFRESH_CONFIG",
            StepKind::StartProcess => "START_PROCESS",
            StepKind::VerifyProcess => "VERIFY_PROCESS",
            StepKind::StopProcess => "STOP_PROCESS",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StepKind::CreateRemoteDir => "Create remote directory",
            StepKind::UploadPackage => "Upload package",
            StepKind::ExtractPackage => "Extract package",
            StepKind::CreateConfig => "Create pipeline config",
            StepKind::UpdateMainConfig => "Update pipeline config",
            StepKind::UpdateJvmConfig => "Update JVM options",
            StepKind::UpdateSystemConfig => "Update system config",
            StepKind::RefreshConfig => "Refresh config files",
            StepKind::StartProcess => "Start process",
            StepKind::VerifyProcess => "Verify process",
            StepKind::StopProcess => "Stop process",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded operation
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub process_id: Option<ProcessId>,
    /// Absent for fleet-wide tasks
    pub machine_id: Option<MachineId>,
    pub instance_id: Option<InstanceId>,
    pub name: String,
    pub description: String,
    pub operation: OperationType,
    pub status: TaskStatus,
    /// Content requested by an UPDATE_CONFIG, kept so a retry can reapply it
    pub config_update: Option<ConfigUpdate>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Store key of a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    pub task_id: TaskId,
    pub machine_id: MachineId,
    pub kind: StepKind,
}

/// One unit of remote work for one machine within a task
#[derive(Debug, Clone)]
pub struct Step {
    pub task_id: TaskId,
    pub machine_id: MachineId,
    pub instance_id: Option<InstanceId>,
    pub kind: StepKind,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Step {
    pub fn pending(
        task_id: &str,
        machine_id: MachineId,
        instance_id: Option<InstanceId>,
        kind: StepKind,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            machine_id,
            instance_id,
            kind,
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    pub fn key(&self) -> StepKey {
        StepKey {
            task_id: self.task_id.clone(),
            machine_id: self.machine_id,
            kind: self.kind,
        }
    }
}

/// Step counts and completion percentage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percentage: u8,
}

impl TaskProgress {
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a Step>) -> Self {
        let mut progress = TaskProgress::default();
        for step in steps {
            progress.total += 1;
            match step.status {
                StepStatus::Pending => progress.pending += 1,
                StepStatus::Running => progress.running += 1,
                StepStatus::Completed => progress.completed += 1,
                StepStatus::Failed => progress.failed += 1,
                StepStatus::Skipped => progress.skipped += 1,
            }
        }
        progress.percentage = progress_percentage(progress.done(), progress.total);
        progress
    }

    /// Steps that reached a terminal status
    pub fn done(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Rounded share of finished steps. Never rounds a partially finished set
/// up to 100 or a started set down to 0.
pub fn progress_percentage(done: usize, total: usize) -> u8 {
    if total == 0 || done == 0 {
        return 0;
    }
    if done >= total {
        return 100;
    }
    let rounded = (done * 100 + total / 2) / total;
    rounded.clamp(1, 99) as u8
}
