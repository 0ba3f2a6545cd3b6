//! Session data model: participants, characters, the shared sketch, notes,
//! dice rolls and log entries.

use crate::dice::DiceFormula;
use serde::{Deserialize, Serialize};

pub type SessionId = u64;
pub type UserId = String;
pub type CharacterId = String;
pub type NoteId = String;
pub type GameId = String;
/// Opaque reference into the asset store (URL or id). Never dereferenced here.
pub type AssetRef = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Master,
    Player,
}

impl Role {
    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub game_id: GameId,
    pub name: String,
    pub master_id: UserId,
}

/// Public view of a session member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub character_id: Option<CharacterId>,
    /// False while the participant is inside its resume window.
    pub connected: bool,
}

/// Last accepted version of a character sheet.
///
/// `data` is the game-specific serialized sheet; this layer never looks
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub character_id: CharacterId,
    pub owner_id: UserId,
    pub name: String,
    pub data: String,
    pub revision: u64,
}

impl CharacterSnapshot {
    pub fn new(
        character_id: impl Into<CharacterId>,
        owner_id: impl Into<UserId>,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            character_id: character_id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            data: data.into(),
            revision: 0,
        }
    }

    /// Replaces the fields present in `patch` and bumps the revision.
    pub fn patched(&self, patch: &CharacterPatch) -> Self {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(data) = &patch.data {
            next.data = data.clone();
        }
        next.revision += 1;
        next
    }
}

/// Full or partial replacement of a character's top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterPatch {
    pub name: Option<String>,
    pub data: Option<String>,
}

impl CharacterPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.data.is_none()
    }

    /// Folds a later patch into this one; fields set later win.
    pub fn merge(&mut self, later: CharacterPatch) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.data.is_some() {
            self.data = later.data;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SketchElement {
    Stroke {
        color: String,
        width: f32,
        points: Vec<(f32, f32)>,
    },
    Token {
        id: String,
        label: String,
        x: f32,
        y: f32,
        asset: Option<AssetRef>,
    },
    Background {
        asset: AssetRef,
    },
}

/// The master's shared canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SketchState {
    pub displayed: bool,
    pub elements: Vec<SketchElement>,
}

/// Ephemeral audio cue. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCommand {
    Play { track: AssetRef, looped: bool },
    Stop { track: Option<AssetRef> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDocument {
    pub note_id: NoteId,
    pub owner_id: UserId,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollVisibility {
    /// Everyone sees the result.
    Public,
    /// Only the requester and the master see the result.
    Private,
}

/// A resolved dice request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub requester_id: UserId,
    pub formula: DiceFormula,
    pub label: Option<String>,
    pub visibility: RollVisibility,
    pub rolls: Vec<u32>,
    pub total: i64,
}

/// Who caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Author {
    Participant(UserId),
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Everyone,
    MasterAnd(UserId),
}

impl Visibility {
    pub fn admits(&self, viewer: &str, role: Role) -> bool {
        match self {
            Visibility::Everyone => true,
            Visibility::MasterAnd(user_id) => role.is_master() || user_id == viewer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContent {
    Chat(String),
    Dice(DiceRoll),
    Joined { display_name: String, role: Role },
    Left { display_name: String },
    SessionEnded { reason: String },
}

/// One line of the session console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: u64,
    pub author: Author,
    pub content: LogContent,
    pub visibility: Visibility,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_patch_replaces_only_given_fields() {
        let sheet = CharacterSnapshot::new("c1", "alice", "Brom", r#"{"hp":10}"#);

        let renamed = sheet.patched(&CharacterPatch {
            name: Some("Brom the Bold".into()),
            data: None,
        });
        assert_eq!(renamed.name, "Brom the Bold");
        assert_eq!(renamed.data, r#"{"hp":10}"#);
        assert_eq!(renamed.revision, 1);
        assert_eq!(renamed.owner_id, "alice");
    }

    #[test]
    fn test_patch_merge_later_wins() {
        let mut pending = CharacterPatch {
            name: Some("A".into()),
            data: Some("1".into()),
        };
        pending.merge(CharacterPatch {
            name: None,
            data: Some("2".into()),
        });
        assert_eq!(pending.name.as_deref(), Some("A"));
        assert_eq!(pending.data.as_deref(), Some("2"));
        assert!(!pending.is_empty());
        assert!(CharacterPatch::default().is_empty());
    }

    #[test]
    fn test_visibility() {
        let private = Visibility::MasterAnd("bob".into());
        assert!(private.admits("bob", Role::Player));
        assert!(private.admits("gm", Role::Master));
        assert!(!private.admits("carol", Role::Player));
        assert!(Visibility::Everyone.admits("carol", Role::Player));
    }
}
