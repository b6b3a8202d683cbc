//! Sandbox executor
//!
//! Runs one script on a blocking worker, bounded by a global concurrency
//! ceiling. Requests over the ceiling wait for a slot; the timeout starts
//! once a slot is granted.

pub mod artifacts;
pub mod fs_policy;
pub mod runtime;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use artifacts::{Artifact, ArtifactKind};
use artifacts::Snapshot;
use fs_policy::FsPolicy;
use runtime::{Interrupt, Signals};

use crate::error::SandboxError;
use crate::limits::ResourceLimits;

/// Variable bindings. Values are limited to null, bool, number, string,
/// list and map.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Extra wait past the timeout before the executor stops waiting for a
/// worker that ignores the deadline.
const BACKSTOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub code: String,
    pub variables: Variables,
    pub limits: ResourceLimits,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<Artifact>,
    /// Final bindings; empty on failure
    pub variables: Variables,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<SandboxError>,
    /// Session directory the artifacts live under
    pub workdir: PathBuf,
}

impl ExecutionResult {
    /// A result for a task that never reached the runtime.
    pub fn rejected(task_id: impl Into<String>, workdir: PathBuf, error: SandboxError) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            success: false,
            output: String::new(),
            artifacts: Vec::new(),
            variables: Variables::new(),
            elapsed: Duration::ZERO,
            started_at: now,
            finished_at: now,
            error: Some(error),
            workdir,
        }
    }
}

struct Outcome {
    output: String,
    artifacts: Vec<Artifact>,
    result: Result<Variables, SandboxError>,
}

impl Outcome {
    fn failed(error: SandboxError) -> Self {
        Self {
            output: String::new(),
            artifacts: Vec::new(),
            result: Err(error),
        }
    }
}

/// Stateless apart from the concurrency ceiling; share it behind an `Arc`.
#[derive(Debug)]
pub struct SandboxExecutor {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SandboxExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Scripts running right now.
    pub fn running(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let ExecutionRequest {
            task_id,
            code,
            variables,
            limits,
            workdir,
        } = request;

        let outcome = self
            .run(&task_id, code, variables, limits, workdir.clone(), &cancel)
            .await;
        let elapsed = started.elapsed();

        let (success, variables, error) = match outcome.result {
            Ok(vars) => {
                tracing::info!(
                    task_id = %task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    artifacts = outcome.artifacts.len(),
                    "task completed"
                );
                (true, vars, None)
            }
            Err(err) => {
                if matches!(err, SandboxError::Internal(_)) {
                    tracing::error!(task_id = %task_id, error = %err, "task failed");
                } else {
                    tracing::warn!(
                        task_id = %task_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %err,
                        "task failed"
                    );
                }
                (false, Variables::new(), Some(err))
            }
        };

        ExecutionResult {
            task_id,
            success,
            output: outcome.output,
            artifacts: outcome.artifacts,
            variables,
            elapsed,
            started_at,
            finished_at: Utc::now(),
            error,
            workdir,
        }
    }

    async fn run(
        &self,
        task_id: &str,
        code: String,
        variables: Variables,
        limits: ResourceLimits,
        workdir: PathBuf,
        cancel: &CancellationToken,
    ) -> Outcome {
        if let Err(err) = limits.validate() {
            return Outcome::failed(err);
        }

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::failed(SandboxError::Internal("executor is shut down".to_string())),
            },
            _ = cancel.cancelled() => {
                return Outcome::failed(SandboxError::Cancelled("cancelled while queued".to_string()));
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            return Outcome::failed(SandboxError::Internal(format!(
                "cannot create working directory {}: {e}",
                workdir.display()
            )));
        }
        let policy = match FsPolicy::new(&workdir, limits.allow_file_io) {
            Ok(policy) => policy,
            Err(e) => {
                return Outcome::failed(SandboxError::Internal(format!(
                    "cannot resolve working directory {}: {e}",
                    workdir.display()
                )))
            }
        };

        tracing::debug!(task_id, workdir = %workdir.display(), "task started");

        let deadline = Instant::now() + limits.timeout;
        let signals = Arc::new(Signals::default());
        let worker_signals = signals.clone();
        let mut worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let root = policy.root().to_path_buf();
            let before = Snapshot::capture(&root);
            let result =
                runtime::run_script(&code, &variables, &limits, policy, deadline, worker_signals);
            (result, before.changed_since(&root))
        });

        tokio::select! {
            joined = &mut worker => match joined {
                Ok((result, artifacts)) => Outcome {
                    output: signals.output(),
                    artifacts,
                    result,
                },
                Err(e) => {
                    tracing::error!(task_id, error = %e, "sandbox worker crashed");
                    Outcome {
                        output: signals.output(),
                        artifacts: Vec::new(),
                        result: Err(SandboxError::Internal("sandbox worker crashed".to_string())),
                    }
                }
            },
            _ = tokio::time::sleep(limits.timeout + BACKSTOP_GRACE) => {
                signals.interrupt(Interrupt::Timeout);
                signals.cancel();
                tracing::warn!(task_id, "worker ignored its deadline, abandoning it");
                Outcome {
                    output: signals.output(),
                    artifacts: Vec::new(),
                    result: Err(SandboxError::Timeout { limit: limits.timeout }),
                }
            }
            _ = cancel.cancelled() => {
                signals.interrupt(Interrupt::Cancelled);
                signals.cancel();
                let artifacts = match tokio::time::timeout(BACKSTOP_GRACE, &mut worker).await {
                    Ok(Ok((_, artifacts))) => artifacts,
                    _ => Vec::new(),
                };
                Outcome {
                    output: signals.output(),
                    artifacts,
                    result: Err(SandboxError::Cancelled("session was restarted".to_string())),
                }
            }
        }
    }
}
