use crate::executor::Variables;
use crate::limits::ResourceLimits;
use crate::session::SessionKey;

/// Who asked for a task. Carried for logging only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    pub platform_type: Option<String>,
    pub bot_id: Option<String>,
    pub created_by: String,
}

/// One unit of sandboxed execution, built by the bridge.
#[derive(Debug, Clone)]
pub struct Task {
    /// ULID
    pub id: String,
    pub key: SessionKey,
    /// Instruction as received from the caller
    pub instruction: String,
    /// Script extracted from the instruction
    pub code: String,
    /// Caller-supplied bindings, applied over the session's variables
    pub context_vars: Variables,
    pub limits: ResourceLimits,
    /// When set, only these session variables are seeded
    pub carry: Option<Vec<String>>,
    pub metadata: TaskMetadata,
}
