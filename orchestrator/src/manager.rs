//! Session Manager - owns the map of live sessions
//!
//! A single actor serializes create-or-get, eviction, the idle sweep and
//! restarts, so concurrent first use of a key always yields one session.
//! Evicted, swept and restarted sessions keep their working directories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SandboxError;
use crate::session::{Session, SessionKey, SessionLease, SessionSnapshot};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    /// Idle time after which the sweep drops a session
    pub session_timeout: Duration,
    /// Sessions active more recently than this are never evicted for capacity
    pub eviction_grace: Duration,
    /// Zero disables the periodic sweep
    pub sweep_interval: Duration,
    pub workdir_root: PathBuf,
    pub max_tasks_per_session: usize,
}

impl SessionManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.max_sessions,
            session_timeout: config.session_timeout,
            eviction_grace: config.session_eviction_grace,
            sweep_interval: config.session_sweep_interval,
            workdir_root: config.workdir.clone(),
            max_tasks_per_session: config.max_tasks_per_session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub total_tasks: usize,
    /// Sorted by key
    pub sessions: Vec<SessionSnapshot>,
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Default)]
pub struct SessionManagerActor;

pub struct SessionManagerState {
    config: SessionManagerConfig,
    sessions: HashMap<SessionKey, Arc<Session>>,
    sweeper: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub enum SessionManagerMsg {
    /// Lease the session for a key, creating it if needed
    Get {
        key: SessionKey,
        reply: RpcReplyPort<Result<SessionLease, SandboxError>>,
    },
    /// Drop a session's in-memory state, cancelling its in-flight task
    Restart {
        key: SessionKey,
        reply: RpcReplyPort<bool>,
    },
    /// Drop a session and hand it back to the caller
    Remove {
        key: SessionKey,
        reply: RpcReplyPort<Option<Arc<Session>>>,
    },
    Stats {
        reply: RpcReplyPort<ManagerStats>,
    },
    /// Drop sessions idle past the timeout. Replies with the number removed.
    Sweep {
        reply: Option<RpcReplyPort<usize>>,
    },
}

impl SessionManagerState {
    fn get_or_create(&mut self, key: SessionKey) -> Result<Arc<Session>, SandboxError> {
        if let Some(session) = self.sessions.get(&key) {
            session.touch();
            return Ok(session.clone());
        }

        if self.sessions.len() >= self.config.max_sessions {
            self.evict_lru()?;
        }

        let workdir = self.config.workdir_root.join(key.dir_name());
        std::fs::create_dir_all(&workdir).map_err(|e| {
            SandboxError::Internal(format!(
                "cannot create session directory {}: {e}",
                workdir.display()
            ))
        })?;

        let session = Arc::new(Session::new(
            key.clone(),
            workdir,
            self.config.max_tasks_per_session,
        ));
        info!(
            session = %key,
            workdir = %session.workdir().display(),
            active = self.sessions.len() + 1,
            "session created"
        );
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Evict the least-recently-active idle session outside the grace window.
    fn evict_lru(&mut self) -> Result<(), SandboxError> {
        let grace = self.config.eviction_grace;
        let victim = self
            .sessions
            .values()
            .filter(|s| !s.is_busy() && s.idle_for() >= grace)
            .min_by_key(|s| s.last_activity())
            .map(|s| s.key().clone());

        let Some(victim) = victim else {
            warn!(
                max_sessions = self.config.max_sessions,
                "session cap reached and no session is evictable"
            );
            return Err(SandboxError::SessionLimitExceeded {
                max: self.config.max_sessions,
            });
        };

        if let Some(session) = self.sessions.remove(&victim) {
            session.retire();
            info!(
                session = %victim,
                idle_secs = session.idle_for().as_secs(),
                "session evicted for capacity"
            );
        }
        Ok(())
    }

    fn sweep(&mut self) -> usize {
        let timeout = self.config.session_timeout;
        let expired: Vec<SessionKey> = self
            .sessions
            .values()
            .filter(|s| !s.is_busy() && s.idle_for() > timeout)
            .map(|s| s.key().clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            // A task may have been queued since the scan; such sessions stay.
            let still_idle = self
                .sessions
                .get(key)
                .map(|s| !s.is_busy())
                .unwrap_or(false);
            if !still_idle {
                continue;
            }
            if let Some(session) = self.sessions.remove(key) {
                session.retire();
                removed += 1;
                warn!(
                    session = %key,
                    idle_secs = session.idle_for().as_secs(),
                    "session idle timeout, removing"
                );
            }
        }
        removed
    }

    fn remove(&mut self, key: &SessionKey) -> Option<Arc<Session>> {
        let session = self.sessions.remove(key)?;
        session.retire();
        Some(session)
    }

    fn stats(&self) -> ManagerStats {
        let mut sessions: Vec<SessionSnapshot> =
            self.sessions.values().map(|s| s.snapshot()).collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));

        ManagerStats {
            active_sessions: sessions.len(),
            max_sessions: self.config.max_sessions,
            total_tasks: sessions.iter().map(|s| s.task_count).sum(),
            sessions,
        }
    }
}

#[ractor::async_trait]
impl Actor for SessionManagerActor {
    type Msg = SessionManagerMsg;
    type State = SessionManagerState;
    type Arguments = SessionManagerConfig;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        std::fs::create_dir_all(&config.workdir_root)?;
        info!(
            actor_id = %myself.get_id(),
            workdir = %config.workdir_root.display(),
            max_sessions = config.max_sessions,
            "SessionManagerActor starting"
        );
        Ok(SessionManagerState {
            config,
            sessions: HashMap::new(),
            sweeper: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let period = state.config.sweep_interval;
        if period.is_zero() {
            return Ok(());
        }

        state.sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself
                    .send_message(SessionManagerMsg::Sweep { reply: None })
                    .is_err()
                {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionManagerMsg::Get { key, reply } => {
                // Reserved before the reply leaves the actor, so a later Get
                // at the cap cannot pick this session as its victim.
                let lease = state.get_or_create(key).map(|s| SessionLease::reserve(&s));
                let _ = reply.send(lease);
            }
            SessionManagerMsg::Restart { key, reply } => {
                let existed = state.remove(&key).is_some();
                if existed {
                    info!(session = %key, "session restarted");
                }
                let _ = reply.send(existed);
            }
            SessionManagerMsg::Remove { key, reply } => {
                let _ = reply.send(state.remove(&key));
            }
            SessionManagerMsg::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            SessionManagerMsg::Sweep { reply } => {
                let removed = state.sweep();
                if removed > 0 {
                    info!(removed, active = state.sessions.len(), "idle sweep finished");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
        for session in state.sessions.values() {
            session.retire();
        }
        tracing::info!(actor_id = %myself.get_id(), "SessionManagerActor stopped");
        Ok(())
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to the session manager actor.
#[derive(Clone)]
pub struct SessionManager {
    actor: ActorRef<SessionManagerMsg>,
}

impl SessionManager {
    pub async fn start(config: SessionManagerConfig) -> Result<Self, SandboxError> {
        let (actor, _) = Actor::spawn(None, SessionManagerActor, config)
            .await
            .map_err(|e| SandboxError::Internal(format!("cannot start session manager: {e}")))?;
        Ok(Self { actor })
    }

    /// The session stays protected from eviction and the sweep until the
    /// lease is dropped.
    pub async fn get(&self, key: SessionKey) -> Result<SessionLease, SandboxError> {
        ractor::call!(self.actor, |reply| SessionManagerMsg::Get { key, reply })
            .map_err(|e| SandboxError::Internal(e.to_string()))?
    }

    /// Returns whether a session existed for the key.
    pub async fn restart(&self, key: SessionKey) -> Result<bool, SandboxError> {
        ractor::call!(self.actor, |reply| SessionManagerMsg::Restart { key, reply })
            .map_err(|e| SandboxError::Internal(e.to_string()))
    }

    pub async fn remove(&self, key: SessionKey) -> Result<Option<Arc<Session>>, SandboxError> {
        ractor::call!(self.actor, |reply| SessionManagerMsg::Remove { key, reply })
            .map_err(|e| SandboxError::Internal(e.to_string()))
    }

    pub async fn stats(&self) -> Result<ManagerStats, SandboxError> {
        ractor::call!(self.actor, |reply| SessionManagerMsg::Stats { reply })
            .map_err(|e| SandboxError::Internal(e.to_string()))
    }

    /// Run the idle sweep now.
    pub async fn sweep_idle(&self) -> Result<usize, SandboxError> {
        ractor::call!(self.actor, |reply| SessionManagerMsg::Sweep {
            reply: Some(reply)
        })
        .map_err(|e| SandboxError::Internal(e.to_string()))
    }

    /// Stop the actor. Every live session is retired.
    pub fn shutdown(&self) {
        self.actor.stop(Some("shutdown".to_string()));
    }
}
