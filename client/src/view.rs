//! Read-only local projection of a session.
//!
//! The view is rebuilt from every snapshot and advanced only by events the
//! server delivered, applied with the same reconciler the hub uses. Events
//! that arrive before the first snapshot, or that the current snapshot
//! already reflects, are dropped.

use crate::connection::ConnectionEvent;
use log::{debug, warn};
use shared::{
    AudioCommand, CharacterId, CharacterSnapshot, LogEntry, NoteDocument, ParticipantInfo, Role,
    SessionEvent, SessionInfo, SessionState, SketchState, SyncError, UserId,
};
use std::time::Duration;

/// Something the UI should tell the user about
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Rejected {
        request_id: Option<u64>,
        error: SyncError,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Back in sync after a snapshot
    Synced,
    /// An audio cue from the master; not part of the state
    Audio(AudioCommand),
    SessionEnded {
        reason: String,
    },
    Disconnected(SyncError),
}

#[derive(Debug, Default)]
pub struct SessionView {
    session: Option<SessionInfo>,
    you: Option<UserId>,
    role: Option<Role>,
    accepted_character: Option<CharacterId>,
    state: Option<SessionState>,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one connection event into the view
    pub fn handle(&mut self, event: ConnectionEvent) -> Option<Notice> {
        match event {
            ConnectionEvent::Snapshot(snapshot) => {
                debug!(
                    "Snapshot of session {} at #{}",
                    snapshot.session.session_id, snapshot.seq
                );
                self.state = Some(SessionState::from_snapshot(&snapshot));
                self.session = Some(snapshot.session);
                self.you = Some(snapshot.you);
                self.role = Some(snapshot.role);
                self.accepted_character = snapshot.accepted_character_id;
                Some(Notice::Synced)
            }
            ConnectionEvent::Event(envelope) => {
                let state = match self.state.as_mut() {
                    Some(state) => state,
                    None => {
                        debug!("Dropping event #{} received before snapshot", envelope.seq);
                        return None;
                    }
                };
                if envelope.seq <= state.seq() {
                    debug!("Dropping event #{} already in snapshot", envelope.seq);
                    return None;
                }
                if let Err(e) = state.apply(&envelope) {
                    warn!("Could not apply event #{}: {}", envelope.seq, e);
                    return None;
                }
                match envelope.event {
                    SessionEvent::Audio(command) => Some(Notice::Audio(command)),
                    SessionEvent::SessionEnded { reason } => Some(Notice::SessionEnded { reason }),
                    _ => None,
                }
            }
            ConnectionEvent::Rejected { request_id, error } => {
                Some(Notice::Rejected { request_id, error })
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                Some(Notice::Reconnecting { attempt, delay })
            }
            ConnectionEvent::Closed(SyncError::SessionEnded) => None,
            ConnectionEvent::Closed(error) => Some(Notice::Disconnected(error)),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_some()
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn you(&self) -> Option<&str> {
        self.you.as_deref()
    }

    pub fn is_master(&self) -> bool {
        self.role.map(|r| r.is_master()).unwrap_or(false)
    }

    pub fn accepted_character(&self) -> Option<&str> {
        self.accepted_character.as_deref()
    }

    pub fn seq(&self) -> u64 {
        self.state.as_ref().map(|s| s.seq()).unwrap_or(0)
    }

    pub fn users(&self) -> &[ParticipantInfo] {
        self.state.as_ref().map(|s| s.participants()).unwrap_or(&[])
    }

    pub fn logs(&self) -> &[LogEntry] {
        self.state.as_ref().map(|s| s.log()).unwrap_or(&[])
    }

    pub fn sketch(&self) -> SketchState {
        self.state
            .as_ref()
            .map(|s| s.sketch().clone())
            .unwrap_or_default()
    }

    pub fn characters(&self) -> Vec<&CharacterSnapshot> {
        self.state
            .as_ref()
            .map(|s| s.characters().collect())
            .unwrap_or_default()
    }

    pub fn character(&self, character_id: &str) -> Option<&CharacterSnapshot> {
        self.state.as_ref().and_then(|s| s.character(character_id))
    }

    pub fn notes(&self) -> Vec<&NoteDocument> {
        self.state
            .as_ref()
            .map(|s| s.notes().collect())
            .unwrap_or_default()
    }

    pub fn ended(&self) -> Option<&str> {
        self.state.as_ref().and_then(|s| s.ended())
    }
}
