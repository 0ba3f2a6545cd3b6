//! Typed operations a player or master can perform in a session.
//!
//! Each call queues one intent and returns its request id; the outcome
//! arrives later as an event (or a rejection) on the connection.

use crate::connection::IntentSender;
use shared::{
    AudioCommand, CharacterPatch, DiceFormula, Intent, RollVisibility, SketchState, SyncError,
};

#[derive(Debug, Clone)]
pub struct PlayHandle {
    sender: IntentSender,
}

impl PlayHandle {
    pub fn new(sender: IntentSender) -> Self {
        Self { sender }
    }

    /// Asks the hub to roll `formula` (e.g. `2d6+1`). Bad formulas are
    /// refused here without a round trip.
    pub fn request_dice(
        &self,
        formula: &str,
        label: Option<String>,
        visibility: RollVisibility,
    ) -> Result<u64, SyncError> {
        let formula: DiceFormula = formula.parse()?;
        Ok(self.sender.send(Intent::RequestDice {
            formula,
            label,
            visibility,
        }))
    }

    pub fn update_character(
        &self,
        character_id: impl Into<String>,
        patch: CharacterPatch,
        instant_refresh: bool,
    ) -> u64 {
        self.sender.send(Intent::UpdateCharacter {
            character_id: character_id.into(),
            patch,
            instant_refresh,
        })
    }

    pub fn play_audio(&self, track: impl Into<String>, looped: bool) -> u64 {
        self.sender.send(Intent::Audio(AudioCommand::Play {
            track: track.into(),
            looped,
        }))
    }

    /// Stops one track, or everything when `track` is `None`
    pub fn stop_audio(&self, track: Option<String>) -> u64 {
        self.sender.send(Intent::Audio(AudioCommand::Stop { track }))
    }

    pub fn update_sketch(&self, sketch: SketchState) -> u64 {
        self.sender.send(Intent::UpdateSketch(sketch))
    }

    pub fn update_note(
        &self,
        note_id: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> u64 {
        self.sender.send(Intent::UpdateNote {
            note_id: note_id.into(),
            title: title.into(),
            text: text.into(),
        })
    }

    pub fn chat(&self, text: impl Into<String>) -> u64 {
        self.sender.send(Intent::Chat { text: text.into() })
    }

    pub fn set_character_viewer(&self, user_id: impl Into<String>, allowed: bool) -> u64 {
        self.sender.send(Intent::SetCharacterViewer {
            user_id: user_id.into(),
            allowed,
        })
    }

    pub fn end_session(&self) -> u64 {
        self.sender.send(Intent::EndSession)
    }
}
