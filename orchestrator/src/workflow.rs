//! Workflow Runner - runs a list of tasks against one session.
//!
//! The session slot is held for the whole workflow, so no other task on the
//! session can interleave between steps. Each step sees the variables the
//! previous successful steps committed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::WorkflowPlan;
use crate::error::SandboxError;
use crate::executor::{Artifact, ExecutionResult, SandboxExecutor, Variables};
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowOptions {
    /// Keep running after a failed step instead of aborting
    pub continue_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// 0-based
    pub index: usize,
    pub instruction: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub steps: Vec<StepOutcome>,
    /// 0-based indices of failed steps
    pub failed_steps: Vec<usize>,
    pub first_failure: Option<(usize, SandboxError)>,
    /// Bindings of every successful step, later steps winning
    pub variables: Variables,
    /// Artifacts of every step, later steps winning on the same path
    pub artifacts: Vec<Artifact>,
    pub elapsed: Duration,
    pub workdir: PathBuf,
}

impl WorkflowOutcome {
    pub fn success(&self) -> bool {
        self.failed_steps.is_empty()
    }

    fn record(&mut self, step: StepOutcome) {
        if step.result.success {
            self.variables.extend(
                step.result
                    .variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        } else {
            self.failed_steps.push(step.index);
            if self.first_failure.is_none() {
                let err = step
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| SandboxError::Internal("step failed without an error".to_string()));
                self.first_failure = Some((step.index, err));
            }
        }

        for artifact in &step.result.artifacts {
            self.artifacts.retain(|a| a.path != artifact.path);
            self.artifacts.push(artifact.clone());
        }
        self.steps.push(step);
    }
}

pub struct WorkflowRunner<'a> {
    executor: &'a SandboxExecutor,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(executor: &'a SandboxExecutor) -> Self {
        Self { executor }
    }

    pub async fn run(&self, session: &Arc<Session>, plan: &WorkflowPlan) -> WorkflowOutcome {
        let started = Instant::now();
        let mut outcome = WorkflowOutcome {
            steps: Vec::new(),
            failed_steps: Vec::new(),
            first_failure: None,
            variables: Variables::new(),
            artifacts: Vec::new(),
            elapsed: Duration::ZERO,
            workdir: session.workdir().to_path_buf(),
        };

        let slot = match session.acquire().await {
            Ok(slot) => slot,
            Err(err) => {
                if let Some(first) = plan.steps.first() {
                    outcome.record(StepOutcome {
                        index: 0,
                        instruction: first.instruction.clone(),
                        result: ExecutionResult::rejected(
                            first.id.clone(),
                            session.workdir().to_path_buf(),
                            err,
                        ),
                    });
                }
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        for (index, task) in plan.steps.iter().enumerate() {
            let result = slot.run(self.executor, task).await;
            let failed = !result.success;
            let cancelled = matches!(result.error, Some(SandboxError::Cancelled(_)));

            tracing::debug!(
                session = %plan.key,
                step = index + 1,
                success = !failed,
                "workflow step finished"
            );
            outcome.record(StepOutcome {
                index,
                instruction: task.instruction.clone(),
                result,
            });

            if failed && (cancelled || !plan.options.continue_on_error) {
                break;
            }
        }
        drop(slot);

        outcome.elapsed = started.elapsed();
        tracing::info!(
            session = %plan.key,
            steps = outcome.steps.len(),
            failed = outcome.failed_steps.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "workflow finished"
        );
        outcome
    }
}
