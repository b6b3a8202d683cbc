use std::time::Duration;

/// Every failure the orchestrator can report.
///
/// Cloneable so it can travel inside [`crate::executor::ExecutionResult`] and
/// across actor reply ports.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    #[error("session limit of {max} reached and no session is evictable")]
    SessionLimitExceeded { max: usize },

    #[error("session already ran its limit of {max} tasks")]
    TaskLimitExceeded { max: usize },

    #[error("task exceeded its timeout of {:.1}s", limit.as_secs_f64())]
    Timeout { limit: Duration },

    #[error("task exceeded its memory limit of {limit_mb} MB")]
    MemoryExceeded { limit_mb: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            line: None,
            column: None,
        }
    }
}
