//! Bridge between the caller-facing wire types and the execution layers.
//!
//! Everything below this module speaks [`Task`], [`ExecutionResult`] and
//! [`SandboxError`]; everything above it speaks `shared_types`. This is the
//! only place that maps internal failures to error codes and hints.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use shared_types::{
    ArtifactInfo, ErrorCode, SessionStatsResponse, SessionSummary, TaskError, TaskRequest,
    TaskResponse, WorkflowRequest, WorkflowResponse, WorkflowStep,
};

use crate::error::SandboxError;
use crate::executor::{Artifact, ExecutionResult, Variables};
use crate::limits::{LimitOverrides, ResourceLimiter, ResourceLimits};
use crate::manager::ManagerStats;
use crate::session::SessionKey;
use crate::task::{Task, TaskMetadata};
use crate::workflow::{WorkflowOptions, WorkflowOutcome};

static CODE_FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").ok());

const CREATED_BY: &str = "orchestrator";

/// A validated workflow submission.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub key: SessionKey,
    /// One task per step, in order
    pub steps: Vec<Task>,
    pub options: WorkflowOptions,
}

#[derive(Debug, Clone)]
pub struct Bridge {
    limiter: ResourceLimiter,
}

impl Bridge {
    pub fn new(limiter: ResourceLimiter) -> Self {
        Self { limiter }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    pub fn build_request(&self, req: &TaskRequest) -> Result<Task, SandboxError> {
        let key = session_key(&req.chat_key, &req.user_id)?;
        let context_vars = parse_context(req.context.as_ref())?;
        let limits = self.resolve_limits(req.limits.as_ref())?;
        let metadata = TaskMetadata {
            platform_type: req.platform_type.clone(),
            bot_id: req.bot_id.clone(),
            created_by: CREATED_BY.to_string(),
        };
        build_task(key, &req.instruction, context_vars, limits, None, metadata)
    }

    pub fn build_workflow(&self, req: &WorkflowRequest) -> Result<WorkflowPlan, SandboxError> {
        let key = session_key(&req.chat_key, &req.user_id)?;
        let instructions = parse_instructions(&req.instructions)?;
        let context_vars = parse_context(req.context.as_ref())?;
        let limits = self.resolve_limits(req.limits.as_ref())?;
        if let Some(carry) = &req.carry {
            for name in carry {
                validate_variable_name(name)?;
            }
        }
        let metadata = TaskMetadata {
            platform_type: req.platform_type.clone(),
            bot_id: req.bot_id.clone(),
            created_by: CREATED_BY.to_string(),
        };

        // Explicit context seeds the first step only; later steps see
        // whatever the earlier steps committed.
        let steps = instructions
            .iter()
            .enumerate()
            .map(|(i, instruction)| {
                let vars = if i == 0 {
                    context_vars.clone()
                } else {
                    Variables::new()
                };
                build_task(
                    key.clone(),
                    instruction,
                    vars,
                    limits,
                    req.carry.clone(),
                    metadata.clone(),
                )
                .map_err(|e| match e {
                    SandboxError::InvalidRequest(msg) => {
                        SandboxError::InvalidRequest(format!("step {}: {msg}", i + 1))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WorkflowPlan {
            key,
            steps,
            options: WorkflowOptions {
                continue_on_error: req.continue_on_error,
            },
        })
    }

    fn resolve_limits(
        &self,
        overrides: Option<&shared_types::LimitOverrides>,
    ) -> Result<ResourceLimits, SandboxError> {
        let overrides = overrides.map(LimitOverrides::from);
        self.limiter.resolve(overrides.as_ref())
    }

    // ========================================================================
    // Results
    // ========================================================================

    pub fn format_result(&self, result: &ExecutionResult) -> TaskResponse {
        TaskResponse {
            task_id: result.task_id.clone(),
            success: result.success,
            output: result.output.clone(),
            artifacts: relative_artifacts(&result.artifacts, &result.workdir),
            variables: result.variables.clone(),
            execution_time: result.elapsed.as_secs_f64(),
            started_at: result.started_at,
            error: result.error.as_ref().map(error_info),
        }
    }

    /// Response for a request rejected before any task ran.
    pub fn format_rejection(&self, err: &SandboxError) -> TaskResponse {
        TaskResponse {
            task_id: String::new(),
            success: false,
            output: String::new(),
            artifacts: Vec::new(),
            variables: Variables::new(),
            execution_time: 0.0,
            started_at: chrono::Utc::now(),
            error: Some(error_info(err)),
        }
    }

    pub fn format_workflow(&self, outcome: &WorkflowOutcome) -> WorkflowResponse {
        let steps: Vec<WorkflowStep> = outcome
            .steps
            .iter()
            .map(|step| WorkflowStep {
                step: step.index as u32 + 1,
                instruction: step.instruction.clone(),
                success: step.result.success,
                output: step.result.output.clone(),
                artifacts: relative_artifacts(&step.result.artifacts, &step.result.workdir),
                error: step.result.error.as_ref().map(error_info),
                execution_time: step.result.elapsed.as_secs_f64(),
            })
            .collect();

        let (failed_step, error) = match &outcome.first_failure {
            Some((index, err)) => {
                let mut info = error_info(err);
                info.message = format!("Step {} failed: {}", index + 1, info.message);
                (Some(*index as u32 + 1), Some(info))
            }
            None => (None, None),
        };

        WorkflowResponse {
            success: outcome.success(),
            final_output: steps.last().map(|s| s.output.clone()).unwrap_or_default(),
            artifacts: relative_artifacts(&outcome.artifacts, &outcome.workdir),
            variables: outcome.variables.clone(),
            execution_time: outcome.elapsed.as_secs_f64(),
            failed_steps: outcome.failed_steps.iter().map(|i| *i as u32 + 1).collect(),
            failed_step,
            error,
            steps,
        }
    }

    pub fn format_workflow_rejection(&self, err: &SandboxError) -> WorkflowResponse {
        WorkflowResponse {
            success: false,
            steps: Vec::new(),
            final_output: String::new(),
            artifacts: Vec::new(),
            variables: Variables::new(),
            execution_time: 0.0,
            failed_steps: Vec::new(),
            failed_step: None,
            error: Some(error_info(err)),
        }
    }

    pub fn format_stats(&self, stats: &ManagerStats) -> SessionStatsResponse {
        SessionStatsResponse {
            active_sessions: stats.active_sessions as u64,
            max_sessions: stats.max_sessions as u64,
            total_tasks: stats.total_tasks as u64,
            per_session: stats
                .sessions
                .iter()
                .map(|s| SessionSummary {
                    key: s.key.to_string(),
                    idle_seconds: s.idle.as_secs_f64(),
                    task_count: s.task_count as u64,
                    failed_tasks: s.failed_count as u64,
                    pending_tasks: s.pending as u64,
                    variable_count: s.variable_count as u64,
                    created_at: s.created_at,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Request helpers
// ============================================================================

pub fn session_key(chat_key: &str, user_id: &str) -> Result<SessionKey, SandboxError> {
    for (field, value) in [("chat_key", chat_key), ("user_id", user_id)] {
        if value.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(format!("{field} is required")));
        }
        if value.chars().any(char::is_control) {
            return Err(SandboxError::InvalidRequest(format!(
                "{field} contains control characters"
            )));
        }
    }
    Ok(SessionKey::new(chat_key, user_id))
}

fn build_task(
    key: SessionKey,
    instruction: &str,
    context_vars: Variables,
    limits: ResourceLimits,
    carry: Option<Vec<String>>,
    metadata: TaskMetadata,
) -> Result<Task, SandboxError> {
    if instruction.trim().is_empty() {
        return Err(SandboxError::InvalidRequest(
            "instruction is empty".to_string(),
        ));
    }
    let code = extract_code(instruction);
    if code.trim().is_empty() {
        return Err(SandboxError::InvalidRequest(
            "instruction contains no code".to_string(),
        ));
    }

    Ok(Task {
        id: ulid::Ulid::new().to_string(),
        key,
        instruction: instruction.to_string(),
        code,
        context_vars,
        limits,
        carry,
        metadata,
    })
}

/// Fenced code blocks are joined in order; without fences the whole
/// instruction is the script.
pub fn extract_code(instruction: &str) -> String {
    let Some(fence) = CODE_FENCE.as_ref() else {
        return instruction.trim().to_string();
    };
    let blocks: Vec<&str> = fence
        .captures_iter(instruction)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if blocks.is_empty() {
        instruction.trim().to_string()
    } else {
        blocks.join("\n")
    }
}

/// Context may be an object or a string holding one. Only `variables` is read.
pub fn parse_context(context: Option<&Value>) -> Result<Variables, SandboxError> {
    let parsed;
    let object = match context {
        None | Some(Value::Null) => return Ok(Variables::new()),
        Some(Value::String(raw)) if raw.trim().is_empty() => return Ok(Variables::new()),
        Some(Value::String(raw)) => {
            parsed = serde_json::from_str::<Value>(raw).map_err(|_| {
                SandboxError::InvalidRequest("invalid context JSON format".to_string())
            })?;
            &parsed
        }
        Some(other) => other,
    };

    let Value::Object(map) = object else {
        return Err(SandboxError::InvalidRequest(
            "context must be a JSON object".to_string(),
        ));
    };

    match map.get("variables") {
        None | Some(Value::Null) => Ok(Variables::new()),
        Some(Value::Object(vars)) => {
            let mut out = Variables::new();
            for (name, value) in vars {
                validate_variable_name(name)?;
                out.insert(name.clone(), value.clone());
            }
            Ok(out)
        }
        Some(_) => Err(SandboxError::InvalidRequest(
            "context.variables must be a JSON object".to_string(),
        )),
    }
}

fn parse_instructions(value: &Value) -> Result<Vec<String>, SandboxError> {
    let parsed;
    let list = match value {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).map_err(|_| {
                SandboxError::InvalidRequest("invalid instructions JSON format".to_string())
            })?;
            &parsed
        }
        other => other,
    };

    let Value::Array(items) = list else {
        return Err(SandboxError::InvalidRequest(
            "instructions must be a list".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(SandboxError::InvalidRequest(
            "workflow has no instructions".to_string(),
        ));
    }
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            _ => Err(SandboxError::InvalidRequest(
                "every instruction must be a string".to_string(),
            )),
        })
        .collect()
}

fn validate_variable_name(name: &str) -> Result<(), SandboxError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "invalid variable name '{name}'"
        )))
    }
}

// ============================================================================
// Result helpers
// ============================================================================

fn relative_artifacts(artifacts: &[Artifact], workdir: &Path) -> Vec<ArtifactInfo> {
    let root = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
    artifacts
        .iter()
        .filter_map(|a| {
            let rel = a
                .path
                .strip_prefix(&root)
                .or_else(|_| a.path.strip_prefix(workdir))
                .ok()?;
            Some(ArtifactInfo {
                path: rel.to_string_lossy().replace('\\', "/"),
                size_bytes: a.size_bytes,
                kind: a.kind.to_string(),
            })
        })
        .collect()
}

pub fn error_code(err: &SandboxError) -> ErrorCode {
    match err {
        SandboxError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        SandboxError::InvalidLimits(_) => ErrorCode::InvalidLimits,
        SandboxError::SessionLimitExceeded { .. } => ErrorCode::SessionLimitExceeded,
        SandboxError::TaskLimitExceeded { .. } => ErrorCode::TaskLimitExceeded,
        SandboxError::Timeout { .. } => ErrorCode::Timeout,
        SandboxError::MemoryExceeded { .. } => ErrorCode::MemoryExceeded,
        SandboxError::PermissionDenied(_) => ErrorCode::PermissionDenied,
        SandboxError::Runtime { .. } => ErrorCode::RuntimeError,
        SandboxError::Cancelled(_) => ErrorCode::Cancelled,
        SandboxError::Internal(_) => ErrorCode::InternalError,
    }
}

fn hint(err: &SandboxError) -> &'static str {
    match err {
        SandboxError::InvalidRequest(_) => "Check the instruction and context fields.",
        SandboxError::InvalidLimits(_) => {
            "Limit overrides may only tighten the configured ceilings."
        }
        SandboxError::SessionLimitExceeded { .. } => "Retry later or raise MAX_SESSIONS.",
        SandboxError::TaskLimitExceeded { .. } => {
            "Restart the session or raise MAX_TASKS_PER_SESSION."
        }
        SandboxError::Timeout { .. } => {
            "Increase TASK_TIMEOUT or break the work into smaller tasks."
        }
        SandboxError::MemoryExceeded { .. } => {
            "Increase MAX_MEMORY_MB or process the data in smaller pieces."
        }
        SandboxError::PermissionDenied(_) => {
            "Enable ALLOW_NETWORK / ALLOW_FILE_IO, or keep file access inside the session directory."
        }
        SandboxError::Runtime { message, .. } if message.starts_with("syntax error") => {
            "Check the script syntax at the reported line."
        }
        SandboxError::Runtime { message, .. } if message.contains("Function not found") => {
            "That function is not available in the sandbox."
        }
        SandboxError::Runtime { .. } => "Review the task requirements and try again.",
        SandboxError::Cancelled(_) => "The session was restarted; resubmit the task.",
        SandboxError::Internal(_) => "Infrastructure fault; the request may be retried.",
    }
}

/// Caller-facing error descriptor. Internal details stay in the logs.
pub fn error_info(err: &SandboxError) -> TaskError {
    let (line, column) = match err {
        SandboxError::Runtime { line, column, .. } => (*line, *column),
        _ => (None, None),
    };
    let message = match err {
        SandboxError::Internal(_) => "internal error while executing the task".to_string(),
        other => other.to_string(),
    };
    TaskError {
        code: error_code(err),
        message,
        hint: hint(err).to_string(),
        line,
        column,
    }
}
