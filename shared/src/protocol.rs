//! Wire messages exchanged between clients and the session hub.
//!
//! A connection starts with exactly one `ClientMessage::Hello`. The server
//! answers with `ServerMessage::Welcome` carrying the viewer's snapshot, and
//! only then streams `ServerMessage::Event`s. Everything after the welcome
//! is either an event envelope or a rejection addressed to this client.

use crate::dice::DiceFormula;
use crate::error::SyncError;
use crate::model::{
    AudioCommand, Author, CharacterId, CharacterPatch, CharacterSnapshot, DiceRoll, GameId,
    LogEntry, NoteDocument, NoteId, ParticipantInfo, Role, RollVisibility, SessionId,
    SessionInfo, SketchState, UserId,
};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: UserId,
    pub display_name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    /// Start a new session with the sender as master.
    Create {
        credentials: Credentials,
        game_id: GameId,
        name: String,
    },
    /// Join (or resume) an existing session.
    Join {
        session_id: SessionId,
        credentials: Credentials,
        character_id: Option<CharacterId>,
    },
}

impl Handshake {
    pub fn credentials(&self) -> &Credentials {
        match self {
            Handshake::Create { credentials, .. } | Handshake::Join { credentials, .. } => {
                credentials
            }
        }
    }
}

/// Something a participant wants to happen in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    RequestDice {
        formula: DiceFormula,
        label: Option<String>,
        visibility: RollVisibility,
    },
    UpdateCharacter {
        character_id: CharacterId,
        patch: CharacterPatch,
        instant_refresh: bool,
    },
    UpdateSketch(SketchState),
    Audio(AudioCommand),
    UpdateNote {
        note_id: NoteId,
        title: String,
        text: String,
    },
    Chat {
        text: String,
    },
    SetCharacterViewer {
        user_id: UserId,
        allowed: bool,
    },
    EndSession,
}

/// Discriminant of an [`Intent`], used as the key of the authorization and
/// propagation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntentKind {
    RequestDice,
    UpdateCharacter,
    UpdateSketch,
    Audio,
    UpdateNote,
    Chat,
    SetCharacterViewer,
    EndSession,
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::RequestDice { .. } => IntentKind::RequestDice,
            Intent::UpdateCharacter { .. } => IntentKind::UpdateCharacter,
            Intent::UpdateSketch(_) => IntentKind::UpdateSketch,
            Intent::Audio(_) => IntentKind::Audio,
            Intent::UpdateNote { .. } => IntentKind::UpdateNote,
            Intent::Chat { .. } => IntentKind::Chat,
            Intent::SetCharacterViewer { .. } => IntentKind::SetCharacterViewer,
            Intent::EndSession => IntentKind::EndSession,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello {
        protocol_version: u32,
        handshake: Handshake,
    },
    Intent {
        request_id: u64,
        intent: Intent,
    },
    Heartbeat,
    Leave,
}

/// Reconciled state change, as broadcast to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft { user_id: UserId },
    ParticipantConnection { user_id: UserId, connected: bool },
    DiceRolled(DiceRoll),
    CharacterUpdated(CharacterSnapshot),
    SketchUpdated(SketchState),
    Audio(AudioCommand),
    NoteUpdated(NoteDocument),
    Chat { text: String },
    CharacterViewerChanged { user_id: UserId, allowed: bool },
    SessionEnded { reason: String },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ParticipantJoined(_) => "participantJoined",
            SessionEvent::ParticipantLeft { .. } => "participantLeft",
            SessionEvent::ParticipantConnection { .. } => "participantConnection",
            SessionEvent::DiceRolled(_) => "diceResult",
            SessionEvent::CharacterUpdated(_) => "characterUpdate",
            SessionEvent::SketchUpdated(_) => "sketchUpdate",
            SessionEvent::Audio(_) => "audioCommand",
            SessionEvent::NoteUpdated(_) => "noteUpdate",
            SessionEvent::Chat { .. } => "log",
            SessionEvent::CharacterViewerChanged { .. } => "characterViewer",
            SessionEvent::SessionEnded { .. } => "sessionEnded",
        }
    }
}

/// Every server-originated event travels in one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Per-session arrival order, strictly increasing.
    pub seq: u64,
    pub session_id: SessionId,
    pub sender: Author,
    pub server_timestamp: u64,
    pub event: SessionEvent,
}

/// Everything a client needs before it may apply live events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSnapshot {
    pub session: SessionInfo,
    pub you: UserId,
    pub role: Role,
    pub accepted_character_id: Option<CharacterId>,
    /// Sequence number of the last event reflected in this snapshot.
    pub seq: u64,
    pub participants: Vec<ParticipantInfo>,
    pub sketch: SketchState,
    pub characters: Vec<CharacterSnapshot>,
    pub notes: Vec<NoteDocument>,
    pub character_viewers: Vec<UserId>,
    pub recent_log: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome(JoinSnapshot),
    Event(EventEnvelope),
    Rejected {
        request_id: Option<u64>,
        error: SyncError,
    },
}
