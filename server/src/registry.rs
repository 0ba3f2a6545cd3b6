//! Directory of live sessions.
//!
//! The registry only maps session ids to actor handles; all session state
//! lives inside the actors. The lock is held for map lookups and updates,
//! never across a call into a session.

use crate::config::ServerConfig;
use crate::directory::{CharacterStore, UserIdentity};
use crate::roster::ConnectionHandle;
use crate::session::{self, Session, SessionHandle};
use log::info;
use shared::{CharacterId, GameId, Role, SessionId, SessionInfo, StateSnapshot, SyncError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Directory {
    sessions: HashMap<SessionId, SessionHandle>,
    next_session_id: SessionId,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Directory>>,
    config: Arc<ServerConfig>,
    characters: Arc<dyn CharacterStore>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ServerConfig>, characters: Arc<dyn CharacterStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Directory {
                sessions: HashMap::new(),
                next_session_id: 1,
            })),
            config,
            characters,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts a session with `master` as its master and joins them on
    /// `connection`. The session is torn down again if that join fails.
    pub async fn create_session(
        &self,
        master: UserIdentity,
        game_id: GameId,
        name: String,
        connection: ConnectionHandle,
    ) -> Result<SessionHandle, SyncError> {
        let handle = {
            let mut directory = self.inner.write().await;
            let session_id = directory.next_session_id;
            directory.next_session_id += 1;

            let info = SessionInfo {
                session_id,
                game_id,
                name,
                master_id: master.user_id.clone(),
            };
            let session = Session::new(info, Arc::clone(&self.config), Arc::clone(&self.characters));

            let registry = self.clone();
            let handle = session::spawn(session, move |session_id| async move {
                registry.remove(session_id).await;
            });
            directory.sessions.insert(session_id, handle.clone());
            handle
        };

        info!(
            "Session {} created by {} for game {}",
            handle.id(),
            master.user_id,
            handle.info().game_id
        );

        match handle.join(master, None, connection).await {
            Ok(_) => Ok(handle),
            Err(error) => {
                let _ = handle.end("the master could not join").await;
                self.remove(handle.id()).await;
                Err(error)
            }
        }
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionHandle, SyncError> {
        self.inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("session {}", session_id)))
    }

    /// Joins or resumes; the reply arrives once the snapshot has been queued
    /// on `connection`
    pub async fn join_session(
        &self,
        session_id: SessionId,
        identity: UserIdentity,
        character_id: Option<CharacterId>,
        connection: ConnectionHandle,
    ) -> Result<(SessionHandle, Role), SyncError> {
        let handle = self.get_session(session_id).await?;
        let role = handle.join(identity, character_id, connection).await?;
        Ok((handle, role))
    }

    pub async fn leave_session(
        &self,
        session_id: SessionId,
        user_id: &str,
        connection_id: u64,
    ) -> Result<(), SyncError> {
        self.get_session(session_id)
            .await?
            .leave(user_id.to_string(), connection_id)
    }

    /// Broadcasts `SessionEnded`, evicts everyone and forgets the session
    pub async fn end_session(&self, session_id: SessionId, reason: &str) -> Result<(), SyncError> {
        let handle = self.get_session(session_id).await?;
        handle.end(reason).await?;
        self.remove(session_id).await;
        Ok(())
    }

    pub async fn export_session(&self, session_id: SessionId) -> Result<StateSnapshot, SyncError> {
        self.get_session(session_id).await?.export().await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|handle| !handle.is_closed())
            .map(|handle| handle.info().clone())
            .collect();
        sessions.sort_by_key(|info| info.session_id);
        sessions
    }

    pub async fn remove(&self, session_id: SessionId) -> Option<SessionHandle> {
        let removed = self.inner.write().await.sessions.remove(&session_id);
        if removed.is_some() {
            info!("Session {} removed from registry", session_id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ends every session, e.g. on shutdown
    pub async fn shutdown(&self, reason: &str) {
        let handles: Vec<SessionHandle> = self.inner.read().await.sessions.values().cloned().collect();
        for handle in handles {
            let _ = handle.end(reason).await;
            self.remove(handle.id()).await;
        }
    }
}
