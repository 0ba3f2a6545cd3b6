//! Participant tracking for a single session
//!
//! This module handles the server-side bookkeeping of who is at the table:
//! - Participant lifecycle (join, resume, disconnect, removal)
//! - Role assignment with exactly one master per session
//! - Connection handle ownership and replacement on resume
//! - Resume-window expiry for participants whose connection dropped
//!
//! The roster only knows about connections. What participants have done
//! lives in the session's reconciled state.

use crate::directory::UserIdentity;
use log::info;
use shared::{CharacterId, ParticipantInfo, Role, ServerMessage, SyncError, UserId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

/// Outbound half of one client connection.
///
/// Sending never blocks: messages are queued for the connection's writer
/// task. Dropping every clone of a handle lets the writer drain its queue and
/// close the socket; `close` additionally tells the reader to stop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerMessage>,
        closer: CancellationToken,
    ) -> Self {
        Self { id, tx, closer }
    }

    /// Queues a message. Returns false if the connection is already gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Fires when the session closes this connection
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.closer.is_cancelled()
    }
}

/// A member of the session and their live connection, if any
#[derive(Debug)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub character_id: Option<CharacterId>,
    /// None while the participant is inside its resume window
    pub connection: Option<ConnectionHandle>,
    /// When the connection dropped; cleared on resume
    pub disconnected_at: Option<Instant>,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            character_id: self.character_id.clone(),
            connected: self.connection.is_some(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Checks if a dropped participant has exceeded the resume window
    pub fn resume_expired(&self, window: Duration, now: Instant) -> bool {
        self.disconnected_at
            .map(|at| now.saturating_duration_since(at) > window)
            .unwrap_or(false)
    }
}

/// Result of a successful join
#[derive(Debug)]
pub enum JoinOutcome {
    /// First time this user is in the session
    Joined,
    /// Same user came back; any previous live connection is returned so the
    /// caller can close it
    Resumed {
        was_connected: bool,
        replaced: Option<ConnectionHandle>,
        previous_character: Option<CharacterId>,
    },
}

/// Participants of one session, in join order
///
/// Enforces the session capacity, the at-most-one-entry-per-user rule and
/// the single master. A re-join by a known user id replaces the connection
/// handle instead of adding a second entry.
#[derive(Debug)]
pub struct Roster {
    participants: Vec<Participant>,
    max_participants: usize,
}

impl Roster {
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: Vec::new(),
            max_participants,
        }
    }

    /// Adds a participant or resumes an existing one
    ///
    /// A resume keeps the participant's role. The bound character is replaced
    /// only if the join names one. New participants are refused once the
    /// session is full, and only the first master is admitted.
    pub fn join(
        &mut self,
        identity: &UserIdentity,
        role: Role,
        character_id: Option<CharacterId>,
        connection: ConnectionHandle,
    ) -> Result<JoinOutcome, SyncError> {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.user_id == identity.user_id)
        {
            let was_connected = existing.is_connected();
            let replaced = existing.connection.replace(connection);
            let previous_character = existing.character_id.clone();
            if character_id.is_some() {
                existing.character_id = character_id;
            }
            existing.display_name = identity.display_name.clone();
            existing.disconnected_at = None;
            info!("Participant {} resumed", existing.user_id);
            return Ok(JoinOutcome::Resumed {
                was_connected,
                replaced,
                previous_character,
            });
        }

        self.check_admission(&identity.user_id, role)?;

        info!("Participant {} joined as {:?}", identity.user_id, role);
        self.participants.push(Participant {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            role,
            character_id,
            connection: Some(connection),
            disconnected_at: None,
        });
        Ok(JoinOutcome::Joined)
    }

    /// Would a join by `user_id` with `role` be accepted?
    ///
    /// Known users may always come back; new ones need a free seat, and
    /// only the first master is admitted.
    pub fn check_admission(&self, user_id: &str, role: Role) -> Result<(), SyncError> {
        if self.get(user_id).is_some() {
            return Ok(());
        }
        if self.participants.len() >= self.max_participants {
            return Err(SyncError::unauthorized("session is full"));
        }
        if role.is_master() && self.master().is_some() {
            return Err(SyncError::unauthorized("session already has a master"));
        }
        Ok(())
    }

    /// Marks a participant's connection as dropped
    ///
    /// Ignored unless `connection_id` is the participant's current
    /// connection: a stale socket closing after a resume must not knock out
    /// the new one. Returns true if the participant entered its resume window.
    pub fn disconnect(&mut self, user_id: &str, connection_id: ConnectionId, now: Instant) -> bool {
        match self.participants.iter_mut().find(|p| p.user_id == user_id) {
            Some(p) if p.connection.as_ref().map(|c| c.id) == Some(connection_id) => {
                p.connection = None;
                p.disconnected_at = Some(now);
                info!("Participant {} disconnected, awaiting resume", user_id);
                true
            }
            _ => false,
        }
    }

    /// Removes a participant, closing their connection if still open
    pub fn remove(&mut self, user_id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.user_id == user_id)?;
        let participant = self.participants.remove(index);
        if let Some(connection) = &participant.connection {
            connection.close();
        }
        info!("Participant {} removed", user_id);
        Some(participant)
    }

    /// Removes everyone, closing all connections
    pub fn evict_all(&mut self) -> Vec<Participant> {
        for participant in &self.participants {
            if let Some(connection) = &participant.connection {
                connection.close();
            }
        }
        std::mem::take(&mut self.participants)
    }

    /// Participants whose resume window has run out
    pub fn expired(&self, window: Duration, now: Instant) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.resume_expired(window, now))
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// True if `connection_id` is the live connection of `user_id`
    pub fn is_live(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        self.get(user_id)
            .and_then(|p| p.connection.as_ref())
            .map(|c| c.id == connection_id)
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn master(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.role.is_master())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn connected(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_connected())
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
