//! Sandboxed task-execution orchestrator
//!
//! Accepts tasks and multi-step workflows on behalf of chat sessions, runs
//! each one in a resource-bounded script sandbox tied to the session's
//! working directory, and reports output, artifacts and variables back.

pub mod api;
pub mod app_state;
pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod limits;
pub mod manager;
pub mod session;
pub mod task;
pub mod workflow;

pub use app_state::AppState;
pub use config::Config;
pub use error::SandboxError;
