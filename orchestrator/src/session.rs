//! Per-conversation execution context.
//!
//! A session owns a variable map, a private working directory and a FIFO
//! execution slot. Tasks on one session run one at a time in submission
//! order; different sessions run concurrently.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::executor::{ExecutionRequest, ExecutionResult, SandboxExecutor, Variables};
use crate::task::Task;

/// Characters kept from each key part in the directory name.
const DIR_PART_MAX: usize = 64;

// ============================================================================
// Key
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub chat_key: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(chat_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            chat_key: chat_key.into(),
            user_id: user_id.into(),
        }
    }

    /// Deterministic directory name. The hash suffix keeps keys that
    /// sanitize to the same text apart.
    pub fn dir_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chat_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.user_id.as_bytes());
        let digest = hex::encode(hasher.finalize());

        format!(
            "{}_{}-{}",
            sanitize(&self.chat_key),
            sanitize(&self.user_id),
            &digest[..12]
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_key, self.user_id)
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .take(DIR_PART_MAX)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// Session
// ============================================================================

/// Point-in-time view for stats.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub idle: Duration,
    pub task_count: usize,
    pub failed_count: usize,
    /// Outstanding leases plus queued and running tasks
    pub pending: usize,
    pub variable_count: usize,
}

#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    workdir: PathBuf,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    variables: RwLock<Variables>,
    /// tokio's mutex queues waiters in FIFO order
    slot: Arc<tokio::sync::Mutex<()>>,
    pending: AtomicUsize,
    task_count: AtomicUsize,
    failed_count: AtomicUsize,
    /// Lifetime task cap; 0 means unlimited
    max_tasks: usize,
    retired: CancellationToken,
}

impl Session {
    pub fn new(key: SessionKey, workdir: PathBuf, max_tasks: usize) -> Self {
        Self {
            key,
            workdir,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            variables: RwLock::new(Variables::new()),
            slot: Arc::new(tokio::sync::Mutex::new(())),
            pending: AtomicUsize::new(0),
            task_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            max_tasks,
            retired: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn variables(&self) -> Variables {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.pending() > 0
    }

    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Cancel the in-flight task and fail every queued one. Committed
    /// variables are left as they are.
    pub fn retire(&self) {
        self.retired.cancel();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            created_at: self.created_at,
            idle: self.idle_for(),
            task_count: self.task_count(),
            failed_count: self.failed_count.load(Ordering::SeqCst),
            pending: self.pending(),
            variable_count: self
                .variables
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Bindings for the next task: session variables (optionally limited to
    /// `carry`) overlaid with the caller's explicit context.
    pub fn seed(&self, carry: Option<&[String]>, explicit: &Variables) -> Variables {
        let mut seed = self.variables();
        if let Some(carry) = carry {
            seed.retain(|name, _| carry.iter().any(|c| c == name));
        }
        seed.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
        seed
    }

    fn commit(&self, updates: &Variables) {
        let mut vars = self
            .variables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        vars.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Resolves once no task holds the slot. Ignores retirement, so it can
    /// be used to drain a session that was just retired.
    pub async fn wait_idle(&self) {
        let _guard = self.slot.lock().await;
    }

    /// Wait for this session's execution slot.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionSlot, SandboxError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = PendingGuard(self.clone());
        self.touch();

        let guard = tokio::select! {
            biased;
            _ = self.retired.cancelled() => {
                return Err(SandboxError::Cancelled(format!("session {} was restarted", self.key)));
            }
            guard = self.slot.clone().lock_owned() => guard,
        };

        Ok(SessionSlot {
            session: self.clone(),
            _guard: guard,
            _pending: pending,
        })
    }

    /// Queue behind any in-flight task, then run.
    pub async fn run_task(self: &Arc<Self>, executor: &SandboxExecutor, task: &Task) -> ExecutionResult {
        match self.acquire().await {
            Ok(slot) => slot.run(executor, task).await,
            Err(err) => {
                self.touch();
                ExecutionResult::rejected(task.id.clone(), self.workdir.clone(), err)
            }
        }
    }
}

struct PendingGuard(Arc<Session>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A session handed out by the manager. While a lease is alive the session
/// counts as busy, so neither eviction nor the idle sweep can retire it.
pub struct SessionLease {
    session: Arc<Session>,
    _pending: PendingGuard,
}

impl SessionLease {
    /// Reserve `session`. The manager calls this before replying so no
    /// eviction can slip in between lookup and use.
    pub fn reserve(session: &Arc<Session>) -> Self {
        session.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            session: session.clone(),
            _pending: PendingGuard(session.clone()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Give up the reservation and keep only the session.
    pub fn into_session(self) -> Arc<Session> {
        self.session.clone()
    }
}

impl Clone for SessionLease {
    fn clone(&self) -> Self {
        Self::reserve(&self.session)
    }
}

impl std::ops::Deref for SessionLease {
    type Target = Arc<Session>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.session.key)
            .finish()
    }
}

/// Exclusive right to execute on a session. Held across several tasks by
/// the workflow runner.
pub struct SessionSlot {
    session: Arc<Session>,
    _guard: OwnedMutexGuard<()>,
    _pending: PendingGuard,
}

impl SessionSlot {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn run(&self, executor: &SandboxExecutor, task: &Task) -> ExecutionResult {
        let session = &self.session;
        session.touch();

        if session.is_retired() {
            return ExecutionResult::rejected(
                task.id.clone(),
                session.workdir.clone(),
                SandboxError::Cancelled(format!("session {} was restarted", session.key)),
            );
        }

        let max = session.max_tasks;
        let admitted = session
            .task_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            tracing::warn!(session = %session.key, task_id = %task.id, max, "task limit reached");
            return ExecutionResult::rejected(
                task.id.clone(),
                session.workdir.clone(),
                SandboxError::TaskLimitExceeded { max },
            );
        }

        let request = ExecutionRequest {
            task_id: task.id.clone(),
            code: task.code.clone(),
            variables: session.seed(task.carry.as_deref(), &task.context_vars),
            limits: task.limits,
            workdir: session.workdir.clone(),
        };
        let result = executor.execute(request, session.retired.child_token()).await;

        if result.success && !session.is_retired() {
            session.commit(&result.variables);
        } else if !result.success {
            session.failed_count.fetch_add(1, Ordering::SeqCst);
        }
        session.touch();
        result
    }
}
