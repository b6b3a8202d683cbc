use std::sync::Arc;
use std::time::Duration;

use shared_types::{
    SessionActionResponse, SessionRef, SessionStatsResponse, TaskRequest, TaskResponse,
    WorkflowRequest, WorkflowResponse,
};
use tracing::{info, warn};

use crate::bridge::{self, Bridge};
use crate::config::Config;
use crate::error::SandboxError;
use crate::executor::SandboxExecutor;
use crate::limits::ResourceLimiter;
use crate::manager::{SessionManager, SessionManagerConfig};
use crate::workflow::WorkflowRunner;

/// Upper bound on waiting for a cancelled task before deleting its directory.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry points shared by the HTTP API and embedders.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    bridge: Bridge,
    executor: SandboxExecutor,
    sessions: SessionManager,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, SandboxError> {
        let sessions = SessionManager::start(SessionManagerConfig::from_config(&config)).await?;
        let executor = SandboxExecutor::new(config.max_concurrent_executions);
        let bridge = Bridge::new(ResourceLimiter::from_config(&config));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                bridge,
                executor,
                sessions,
            }),
        })
    }

    /// Run one instruction in the caller's session.
    pub async fn execute_task(&self, req: &TaskRequest) -> TaskResponse {
        let bridge = &self.inner.bridge;
        let task = match bridge.build_request(req) {
            Ok(task) => task,
            Err(err) => {
                warn!(chat_key = %req.chat_key, user_id = %req.user_id, error = %err, "task rejected");
                return bridge.format_rejection(&err);
            }
        };
        info!(
            session = %task.key,
            task_id = %task.id,
            platform = task.metadata.platform_type.as_deref().unwrap_or("-"),
            "task received"
        );

        let session = match self.inner.sessions.get(task.key.clone()).await {
            Ok(session) => session,
            Err(err) => {
                warn!(session = %task.key, error = %err, "no session for task");
                return bridge.format_rejection(&err);
            }
        };

        let result = session.run_task(&self.inner.executor, &task).await;
        bridge.format_result(&result)
    }

    /// Run a list of instructions in order in the caller's session.
    pub async fn execute_workflow(&self, req: &WorkflowRequest) -> WorkflowResponse {
        let bridge = &self.inner.bridge;
        let plan = match bridge.build_workflow(req) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(chat_key = %req.chat_key, user_id = %req.user_id, error = %err, "workflow rejected");
                return bridge.format_workflow_rejection(&err);
            }
        };
        info!(session = %plan.key, steps = plan.steps.len(), "workflow received");

        let session = match self.inner.sessions.get(plan.key.clone()).await {
            Ok(session) => session,
            Err(err) => return bridge.format_workflow_rejection(&err),
        };

        let outcome = WorkflowRunner::new(&self.inner.executor)
            .run(&session, &plan)
            .await;
        bridge.format_workflow(&outcome)
    }

    pub async fn session_stats(&self) -> Result<SessionStatsResponse, SandboxError> {
        let stats = self.inner.sessions.stats().await?;
        Ok(self.inner.bridge.format_stats(&stats))
    }

    /// Drop the session's in-memory state. Its artifacts stay on disk.
    pub async fn restart_session(&self, req: &SessionRef) -> Result<SessionActionResponse, SandboxError> {
        let key = bridge::session_key(&req.chat_key, &req.user_id)?;
        let existed = self.inner.sessions.restart(key.clone()).await?;

        Ok(if existed {
            SessionActionResponse {
                success: true,
                message: Some(format!("session {key} restarted")),
            }
        } else {
            SessionActionResponse {
                success: false,
                message: Some(format!("no active session for {key}")),
            }
        })
    }

    /// Drop the session and delete its working directory.
    pub async fn cleanup_session(&self, req: &SessionRef) -> Result<SessionActionResponse, SandboxError> {
        let key = bridge::session_key(&req.chat_key, &req.user_id)?;
        let session = self.inner.sessions.remove(key.clone()).await?;

        let workdir = match &session {
            Some(session) => {
                if tokio::time::timeout(DRAIN_TIMEOUT, session.wait_idle())
                    .await
                    .is_err()
                {
                    warn!(session = %key, "cancelled task still running, deleting its directory anyway");
                }
                session.workdir().to_path_buf()
            }
            None => self.inner.config.workdir.join(key.dir_name()),
        };

        let deleted = match tokio::fs::remove_dir_all(&workdir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(SandboxError::Internal(format!(
                    "cannot delete {}: {e}",
                    workdir.display()
                )))
            }
        };
        info!(session = %key, had_session = session.is_some(), deleted, "session cleaned up");

        let success = session.is_some() || deleted;
        Ok(SessionActionResponse {
            success,
            message: Some(if success {
                format!("session {key} cleaned up")
            } else {
                format!("nothing to clean up for {key}")
            }),
        })
    }

    pub fn shutdown(&self) {
        self.inner.sessions.shutdown();
    }
}
