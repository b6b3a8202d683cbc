//! Wire types for the task orchestrator
//!
//! These types are used by both:
//! - The orchestrator HTTP API (native Rust)
//! - Callers such as the chat agent tool layer (TypeScript bindings via ts-rs)
//!
//! Serializable with serde for JSON over HTTP

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Variable bindings exchanged with callers.
pub type VariableMap = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Requests
// ============================================================================

/// Per-task limit overrides. Each field may only tighten the configured ceiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct LimitOverrides {
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub allow_network: Option<bool>,
    #[serde(default)]
    pub allow_file_io: Option<bool>,
}

/// POST /tasks/execute
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TaskRequest {
    pub chat_key: String,
    pub user_id: String,
    pub instruction: String,

    /// Either an object or a string holding JSON. `variables` seeds the task.
    #[serde(default)]
    #[ts(type = "unknown")]
    pub context: Option<serde_json::Value>,

    #[serde(default)]
    pub limits: Option<LimitOverrides>,

    /// Originating platform (e.g. "qq", "discord"), for logging only
    #[serde(default)]
    pub platform_type: Option<String>,

    #[serde(default)]
    pub bot_id: Option<String>,
}

/// POST /workflows/execute
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct WorkflowRequest {
    pub chat_key: String,
    pub user_id: String,

    /// A JSON array of instructions, or a string holding one
    #[ts(type = "string[] | string")]
    pub instructions: serde_json::Value,

    #[serde(default)]
    #[ts(type = "unknown")]
    pub context: Option<serde_json::Value>,

    #[serde(default)]
    pub limits: Option<LimitOverrides>,

    /// Run every step even after a failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Restrict the session variables seeded into each step to these names
    #[serde(default)]
    pub carry: Option<Vec<String>>,

    #[serde(default)]
    pub platform_type: Option<String>,

    #[serde(default)]
    pub bot_id: Option<String>,
}

/// Identifies a session for administrative calls.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct SessionRef {
    pub chat_key: String,
    pub user_id: String,
}

// ============================================================================
// Results
// ============================================================================

/// Stable caller-facing error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export, export_to = "orchestrator.ts")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidLimits,
    SessionLimitExceeded,
    TaskLimitExceeded,
    Timeout,
    MemoryExceeded,
    PermissionDenied,
    RuntimeError,
    Cancelled,
    InternalError,
}

impl ErrorCode {
    /// Codes that reject the request itself rather than describe an execution outcome.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest
                | Self::InvalidLimits
                | Self::SessionLimitExceeded
                | Self::TaskLimitExceeded
        )
    }
}

/// Categorized failure with a remediation hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    pub hint: String,
    /// Best-effort script position for runtime errors
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
}

/// A file produced during execution, relative to the session directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct ArtifactInfo {
    pub path: String,
    pub size_bytes: u64,
    /// "image" | "table" | "data" | "text" | "other"
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct TaskResponse {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<ArtifactInfo>,
    #[ts(type = "Record<string, unknown>")]
    pub variables: VariableMap,
    /// Seconds
    pub execution_time: f64,
    pub started_at: DateTime<Utc>,
    pub error: Option<TaskError>,
}

/// One step of a workflow run (step numbers start at 1)
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct WorkflowStep {
    pub step: u32,
    pub instruction: String,
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<ArtifactInfo>,
    pub error: Option<TaskError>,
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct WorkflowResponse {
    pub success: bool,
    pub steps: Vec<WorkflowStep>,
    /// Output of the last step that ran
    pub final_output: String,
    pub artifacts: Vec<ArtifactInfo>,
    #[ts(type = "Record<string, unknown>")]
    pub variables: VariableMap,
    pub execution_time: f64,
    /// 1-based numbers of every failed step
    pub failed_steps: Vec<u32>,
    /// First failing step, if any
    pub failed_step: Option<u32>,
    pub error: Option<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct SessionSummary {
    /// "chat_key/user_id"
    pub key: String,
    pub idle_seconds: f64,
    pub task_count: u64,
    pub failed_tasks: u64,
    pub pending_tasks: u64,
    pub variable_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct SessionStatsResponse {
    pub active_sessions: u64,
    pub max_sessions: u64,
    pub total_tasks: u64,
    pub per_session: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "orchestrator.ts")]
pub struct SessionActionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
