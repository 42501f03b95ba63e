//! Task and step views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step counts and completion percentage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percentage: u8,
}

/// One step of one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResponse {
    pub step_id: String,
    pub step_name: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// The ordered steps of one machine within a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStepsResponse {
    pub machine_id: i64,
    pub instance_id: Option<i64>,
    pub progress: ProgressResponse,
    pub steps: Vec<StepResponse>,
}

/// Full task view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetailResponse {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub process_id: Option<i64>,
    pub machine_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub operation_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub progress: ProgressResponse,
    pub instances: Vec<InstanceStepsResponse>,
}

/// Status of one step kind on one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStepResponse {
    pub machine_id: i64,
    pub instance_id: Option<i64>,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Pivoted view: one entry per step kind, counts across machines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStepsGroupResponse {
    pub step_id: String,
    pub step_name: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub machines: Vec<MachineStepResponse>,
}

/// Row in a task listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummaryResponse {
    pub task_id: String,
    pub name: String,
    pub operation_type: String,
    pub status: String,
    pub progress_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}
