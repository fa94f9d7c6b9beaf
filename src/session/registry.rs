//! Session registry
//!
//! Process-wide map of session id to actor handle. Constructed once at
//! startup and passed to the gateway; tests build as many as they like.
//! The map lock is only held to insert, remove, or clone handles.
//!
//! While an end or delete is stopping an actor, its id stays in the map as
//! [`Slot::Stopping`]. Other lifecycle calls on that id wait for the stop to
//! finish, so a delete never purges a session created behind its back.

use super::actor::{self, ActorContext, ActorSettings, SessionHandle};
use super::types::{validate_session_id, Session, SessionOptions, SessionStatus};
use crate::agent::AdapterFactory;
use crate::config::StorageConfig;
use crate::protocol::{EventBroadcaster, ServerEvent};
use crate::store::{MessagePage, Storage};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;

/// Result of a bulk lifecycle operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Map entry for one session id
enum Slot {
    Live(SessionHandle),
    /// An end or delete is still running
    Stopping,
}

impl Slot {
    fn live(&self) -> Option<&SessionHandle> {
        match self {
            Slot::Live(handle) => Some(handle),
            Slot::Stopping => None,
        }
    }
}

type SlotMap = HashMap<String, Slot>;

/// Owner of every live session actor
pub struct SessionRegistry {
    sessions: RwLock<SlotMap>,
    /// Signalled whenever stopping slots are released
    stopped: Notify,
    factory: Arc<dyn AdapterFactory>,
    ctx: ActorContext,
    default_model: Option<String>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        storage: Storage,
        events: EventBroadcaster,
        settings: ActorSettings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            stopped: Notify::new(),
            factory,
            ctx: ActorContext {
                storage,
                events,
                settings: Arc::new(settings),
            },
            default_model: None,
        }
    }

    /// Model applied to sessions that do not pick one
    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.ctx.events
    }

    pub fn storage(&self) -> &Storage {
        &self.ctx.storage
    }

    /// Number of live actors
    pub async fn live_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.live().is_some())
            .count()
    }

    /// Spawn an actor for `id`
    ///
    /// An id whose record is persisted but not live is revived: the new actor
    /// continues the stored counters and message sequence. Creating an id
    /// that is being ended or deleted waits for that to finish first.
    pub async fn create(
        &self,
        id: &str,
        mut options: SessionOptions,
    ) -> crate::Result<SessionHandle> {
        validate_session_id(id)?;
        options.validate()?;
        if options.model.is_none() {
            options.model = self.default_model.clone();
        }

        let mut sessions = self.settled(id).await;
        if sessions
            .get(id)
            .and_then(Slot::live)
            .is_some_and(|h| h.is_alive())
        {
            return Err(crate::Error::DuplicateSession(id.to_string()));
        }

        let session = match self.ctx.storage.sessions.get(id).await {
            Some(mut record) if record.status != SessionStatus::Deleted => {
                tracing::info!(
                    session_id = %id,
                    message_count = record.message_count,
                    "Reviving persisted session"
                );
                record.options = options;
                record.status = SessionStatus::Idle;
                record.error_message = None;
                record
            }
            _ => Session::new(id, options),
        };

        let handle = actor::spawn(session, self.factory.create(id), self.ctx.clone());
        sessions.insert(id.to_string(), Slot::Live(handle.clone()));
        tracing::info!(session_id = %id, "Session created");
        Ok(handle)
    }

    /// Handle of a live session
    pub async fn get(&self, id: &str) -> crate::Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(id)
            .and_then(Slot::live)
            .filter(|h| h.is_alive())
            .cloned()
            .ok_or_else(|| crate::Error::SessionNotFound(id.to_string()))
    }

    /// Live sessions plus persisted ended ones, newest first
    pub async fn list(&self) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|slot| slot.live().cloned())
            .collect();
        let mut sessions: Vec<Session> = handles.iter().map(|h| h.snapshot()).collect();
        let live: HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();

        sessions.extend(
            self.ctx
                .storage
                .sessions
                .list()
                .await
                .into_iter()
                .filter(|s| !live.contains(&s.id) && s.status != SessionStatus::Deleted),
        );
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// A page of a session's log; `limit = None` loads everything
    pub async fn load_messages(
        &self,
        id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> crate::Result<MessagePage> {
        if !self.is_known(id).await {
            return Err(crate::Error::SessionNotFound(id.to_string()));
        }
        Ok(self.ctx.storage.messages.load(id, limit, offset).await)
    }

    /// Stop a session's agent and keep its record
    ///
    /// Ending a session that is already ended is a no-op.
    pub async fn end(&self, id: &str) -> crate::Result<()> {
        let handle = self.begin_stop(id).await;
        let result = match handle {
            Some(handle) => match handle.end().await {
                Err(crate::Error::SessionNotFound(_)) => Ok(()),
                other => other,
            },
            None if self.ctx.storage.sessions.get(id).await.is_some() => Ok(()),
            None => Err(crate::Error::SessionNotFound(id.to_string())),
        };
        self.finish_stop([id]).await;
        result
    }

    /// Stop a session's agent and purge its record and messages
    ///
    /// Storage is purged even when the agent fails to stop; that failure is
    /// still reported.
    pub async fn delete(&self, id: &str) -> crate::Result<()> {
        let handle = self.begin_stop(id).await;
        if handle.is_none() && !self.is_known(id).await {
            self.finish_stop([id]).await;
            return Err(crate::Error::SessionNotFound(id.to_string()));
        }

        let result = match handle {
            Some(handle) => match handle.delete().await {
                Err(crate::Error::SessionNotFound(_)) => Ok(()),
                other => other,
            },
            None => Ok(()),
        };

        let purged = self.ctx.storage.messages.purge(id).await;
        self.ctx.storage.sessions.remove(id).await;
        self.ctx.events.send(ServerEvent::SessionDeleted {
            session_id: id.to_string(),
        });
        tracing::info!(session_id = %id, purged, "Session deleted");
        self.finish_stop([id]).await;
        result
    }

    /// Stop every live agent concurrently
    pub async fn kill_all(&self) -> BulkOutcome {
        let handles = self.begin_stop_all().await;
        let results = join_all(handles.iter().map(|h| h.end())).await;
        self.finish_stop(handles.iter().map(|h| h.id())).await;

        let mut outcome = BulkOutcome::default();
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(()) | Err(crate::Error::SessionNotFound(_)) => outcome.succeeded += 1,
                Err(e) => {
                    tracing::warn!(session_id = %handle.id(), "Failed to stop agent: {}", e);
                    outcome.failed += 1;
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Killed all agents"
        );
        self.ctx.events.send(ServerEvent::AgentsKilled {
            count: outcome.succeeded,
            failed: outcome.failed,
        });
        outcome
    }

    /// Stop every agent and purge every record and message
    pub async fn delete_all(&self) -> BulkOutcome {
        let handles = self.begin_stop_all().await;
        let results = join_all(handles.iter().map(|h| h.delete())).await;

        let mut ids: HashSet<String> = handles.iter().map(|h| h.id().to_string()).collect();
        let mut failed = 0;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(()) | Err(crate::Error::SessionNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(session_id = %handle.id(), "Failed to stop agent: {}", e);
                    failed += 1;
                }
            }
        }

        ids.extend(self.ctx.storage.messages.session_ids().await);
        self.ctx.storage.messages.purge_all().await;
        ids.extend(self.ctx.storage.sessions.purge_all().await);
        self.finish_stop(handles.iter().map(|h| h.id())).await;

        let outcome = BulkOutcome {
            succeeded: ids.len().saturating_sub(failed),
            failed,
        };
        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Deleted all sessions"
        );
        self.ctx.events.send(ServerEvent::AllSessionsDeleted {
            count: outcome.succeeded,
            failed: outcome.failed,
        });
        outcome
    }

    /// Stop every agent and flush storage before the process exits
    pub async fn shutdown(&self) -> BulkOutcome {
        tracing::info!("Shutting down session registry");
        let outcome = self.kill_all().await;
        self.ctx.storage.flush().await;
        outcome
    }

    /// Remove ended sessions not updated within `retention`
    pub async fn sweep_expired(&self, retention: chrono::Duration) -> usize {
        let cutoff = chrono::Utc::now() - retention;
        let expired = self.ctx.storage.sessions.expired(cutoff).await;
        let live: HashSet<String> = self.sessions.read().await.keys().cloned().collect();

        let mut removed = 0;
        for id in expired.iter().filter(|id| !live.contains(*id)) {
            self.ctx.storage.messages.purge(id).await;
            if self.ctx.storage.sessions.remove(id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed expired sessions");
        }
        removed
    }

    /// Periodically remove expired sessions; `None` when retention is disabled
    pub fn spawn_retention_sweeper(self: &Arc<Self>, config: &StorageConfig) -> Option<JoinHandle<()>> {
        if config.retention_days == 0 {
            return None;
        }

        let retention = chrono::Duration::days(config.retention_days.min(36_500) as i64);
        let period = std::time::Duration::from_secs(config.cleanup_interval_hours.max(1) * 3600);
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.sweep_expired(retention).await;
            }
        }))
    }

    /// Write access to the map once no stop of `id` is in progress
    async fn settled(&self, id: &str) -> RwLockWriteGuard<'_, SlotMap> {
        loop {
            let sessions = self.sessions.write().await;
            if !matches!(sessions.get(id), Some(Slot::Stopping)) {
                return sessions;
            }
            // Registered before the lock is released, so no wakeup is lost
            let stopped = self.stopped.notified();
            drop(sessions);
            stopped.await;
        }
    }

    /// Mark `id` stopping and take its live handle, if any
    async fn begin_stop(&self, id: &str) -> Option<SessionHandle> {
        let mut sessions = self.settled(id).await;
        match sessions.insert(id.to_string(), Slot::Stopping) {
            Some(Slot::Live(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Mark every live session stopping and take the handles
    async fn begin_stop_all(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let mut handles = Vec::new();
        for slot in sessions.values_mut() {
            if let Slot::Live(handle) = std::mem::replace(slot, Slot::Stopping) {
                handles.push(handle);
            }
        }
        handles
    }

    /// Release the stopping slots of `ids` and wake anyone waiting on them
    async fn finish_stop<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut sessions = self.sessions.write().await;
        for id in ids {
            if matches!(sessions.get(id), Some(Slot::Stopping)) {
                sessions.remove(id);
            }
        }
        drop(sessions);
        self.stopped.notify_waiters();
    }

    async fn is_known(&self, id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(id)
            .is_some_and(|slot| slot.live().is_some())
            || self.ctx.storage.sessions.get(id).await.is_some()
            || self.ctx.storage.messages.count(id).await > 0
    }
}
