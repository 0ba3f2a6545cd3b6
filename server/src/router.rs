//! Intent routing: authorization, payload validation and resolution of an
//! intent into the session event it produces, plus the audience each event
//! is delivered to.
//!
//! Every permission decision is made here, from one table, before the
//! reconciler sees anything.

use crate::dice::DiceRoller;
use shared::{
    AudioCommand, CharacterPatch, DiceRoll, Intent, IntentKind, NoteDocument, Role,
    RollVisibility, SessionEvent, SessionState, SketchElement, SyncError, UserId,
};

pub const MAX_CHAT_LEN: usize = 2_000;
pub const MAX_LABEL_LEN: usize = 100;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NOTE_LEN: usize = 64 * 1024;
pub const MAX_SHEET_LEN: usize = 256 * 1024;
pub const MAX_SKETCH_ELEMENTS: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Anyone,
    MasterOnly,
    /// Owner of the targeted resource, or the master
    OwnerOrMaster,
    /// Owner of the targeted resource only; creating one makes you its owner
    OwnerOnly,
}

/// The authorization table
pub fn permission(kind: IntentKind) -> Permission {
    match kind {
        IntentKind::RequestDice | IntentKind::Chat => Permission::Anyone,
        IntentKind::UpdateCharacter => Permission::OwnerOrMaster,
        IntentKind::UpdateNote => Permission::OwnerOnly,
        IntentKind::UpdateSketch
        | IntentKind::Audio
        | IntentKind::SetCharacterViewer
        | IntentKind::EndSession => Permission::MasterOnly,
    }
}

/// Who receives an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    /// Master, owner and admitted character viewers
    CharacterWatchers { owner: UserId },
    MasterAnd(UserId),
}

impl Audience {
    pub fn admits(&self, state: &SessionState, user_id: &str, role: Role) -> bool {
        match self {
            Audience::All => true,
            Audience::CharacterWatchers { owner } => {
                state.can_watch_character(user_id, role, owner)
            }
            Audience::MasterAnd(requester) => role.is_master() || requester == user_id,
        }
    }
}

pub fn audience_for(event: &SessionEvent) -> Audience {
    match event {
        SessionEvent::DiceRolled(DiceRoll {
            visibility: RollVisibility::Private,
            requester_id,
            ..
        }) => Audience::MasterAnd(requester_id.clone()),
        SessionEvent::CharacterUpdated(character) => Audience::CharacterWatchers {
            owner: character.owner_id.clone(),
        },
        _ => Audience::All,
    }
}

/// Owner of the resource an intent targets, if it has one yet
fn resource_owner<'a>(state: &'a SessionState, intent: &Intent) -> Result<Option<&'a str>, SyncError> {
    match intent {
        Intent::UpdateCharacter { character_id, .. } => state
            .character(character_id)
            .map(|c| Some(c.owner_id.as_str()))
            .ok_or_else(|| SyncError::not_found(format!("character {}", character_id))),
        Intent::UpdateNote { note_id, .. } => Ok(state.note(note_id).map(|n| n.owner_id.as_str())),
        _ => Ok(None),
    }
}

/// Applies the authorization table to one intent
pub fn authorize(
    state: &SessionState,
    sender: &str,
    role: Role,
    intent: &Intent,
) -> Result<(), SyncError> {
    let kind = intent.kind();
    let allowed = match permission(kind) {
        Permission::Anyone => true,
        Permission::MasterOnly => role.is_master(),
        Permission::OwnerOrMaster => {
            role.is_master() || resource_owner(state, intent)? == Some(sender)
        }
        Permission::OwnerOnly => match resource_owner(state, intent)? {
            Some(owner) => owner == sender,
            None => true,
        },
    };

    if allowed {
        Ok(())
    } else {
        Err(SyncError::unauthorized(format!(
            "{:?} not permitted for {}",
            kind, sender
        )))
    }
}

fn too_long(what: &str, len: usize, max: usize) -> Result<(), SyncError> {
    if len > max {
        Err(SyncError::malformed(format!(
            "{} is {} bytes, limit is {}",
            what, len, max
        )))
    } else {
        Ok(())
    }
}

/// Payload checks that do not depend on who sent the intent
pub fn validate(state: &SessionState, intent: &Intent) -> Result<(), SyncError> {
    match intent {
        Intent::RequestDice { formula, label, .. } => {
            formula.validate()?;
            too_long("label", label.as_ref().map_or(0, |l| l.len()), MAX_LABEL_LEN)
        }
        Intent::UpdateCharacter { patch, .. } => validate_patch(patch),
        Intent::UpdateSketch(sketch) => {
            if sketch.elements.len() > MAX_SKETCH_ELEMENTS {
                return Err(SyncError::malformed(format!(
                    "sketch has {} elements, limit is {}",
                    sketch.elements.len(),
                    MAX_SKETCH_ELEMENTS
                )));
            }
            for element in &sketch.elements {
                let finite = match element {
                    SketchElement::Stroke { width, points, .. } => {
                        width.is_finite()
                            && points.iter().all(|(x, y)| x.is_finite() && y.is_finite())
                    }
                    SketchElement::Token { x, y, .. } => x.is_finite() && y.is_finite(),
                    SketchElement::Background { .. } => true,
                };
                if !finite {
                    return Err(SyncError::malformed("sketch coordinates must be finite"));
                }
            }
            Ok(())
        }
        Intent::Audio(AudioCommand::Play { track, .. }) if track.trim().is_empty() => {
            Err(SyncError::malformed("audio track is empty"))
        }
        Intent::Audio(_) => Ok(()),
        Intent::UpdateNote {
            note_id,
            title,
            text,
        } => {
            if note_id.trim().is_empty() {
                return Err(SyncError::malformed("note id is empty"));
            }
            too_long("note title", title.len(), MAX_TITLE_LEN)?;
            too_long("note text", text.len(), MAX_NOTE_LEN)
        }
        Intent::Chat { text } => {
            if text.trim().is_empty() {
                return Err(SyncError::malformed("chat message is empty"));
            }
            too_long("chat message", text.len(), MAX_CHAT_LEN)
        }
        Intent::SetCharacterViewer { user_id, .. } => match state.participant(user_id) {
            Some(p) if !p.role.is_master() => Ok(()),
            Some(_) => Err(SyncError::malformed("the master always sees characters")),
            None => Err(SyncError::malformed(format!(
                "{} is not in this session",
                user_id
            ))),
        },
        Intent::EndSession => Ok(()),
    }
}

fn validate_patch(patch: &CharacterPatch) -> Result<(), SyncError> {
    if patch.is_empty() {
        return Err(SyncError::malformed("character patch is empty"));
    }
    if let Some(name) = &patch.name {
        if name.trim().is_empty() {
            return Err(SyncError::malformed("character name is empty"));
        }
        too_long("character name", name.len(), MAX_TITLE_LEN)?;
    }
    too_long(
        "character sheet",
        patch.data.as_ref().map_or(0, |d| d.len()),
        MAX_SHEET_LEN,
    )
}

/// Role of a session member, or `NotFound`
pub fn role_of(state: &SessionState, user_id: &str) -> Result<Role, SyncError> {
    state
        .participant(user_id)
        .map(|p| p.role)
        .ok_or_else(|| SyncError::not_found(format!("participant {}", user_id)))
}

/// Turns accepted intents into session events.
///
/// Owns the session's dice RNG so that rolls are resolved in arrival order.
#[derive(Debug)]
pub struct Router {
    roller: DiceRoller,
}

impl Router {
    pub fn new(roller: DiceRoller) -> Self {
        Self { roller }
    }

    /// Authorization and validation only, for intents whose resolution is
    /// deferred
    pub fn admit(state: &SessionState, sender: &str, intent: &Intent) -> Result<(), SyncError> {
        let role = role_of(state, sender)?;
        authorize(state, sender, role, intent)?;
        validate(state, intent)
    }

    /// Resolves an intent against the current state. Nothing is mutated;
    /// the caller publishes the returned event.
    pub fn resolve(
        &mut self,
        state: &SessionState,
        sender: &str,
        intent: &Intent,
    ) -> Result<SessionEvent, SyncError> {
        Self::admit(state, sender, intent)?;

        let event = match intent {
            Intent::RequestDice {
                formula,
                label,
                visibility,
            } => SessionEvent::DiceRolled(self.roller.roll(
                sender.to_string(),
                *formula,
                label.clone(),
                *visibility,
            )?),
            Intent::UpdateCharacter {
                character_id,
                patch,
                ..
            } => {
                let current = state
                    .character(character_id)
                    .ok_or_else(|| SyncError::not_found(format!("character {}", character_id)))?;
                SessionEvent::CharacterUpdated(current.patched(patch))
            }
            Intent::UpdateSketch(sketch) => SessionEvent::SketchUpdated(sketch.clone()),
            Intent::Audio(command) => SessionEvent::Audio(command.clone()),
            Intent::UpdateNote {
                note_id,
                title,
                text,
            } => SessionEvent::NoteUpdated(NoteDocument {
                note_id: note_id.clone(),
                owner_id: state
                    .note(note_id)
                    .map(|n| n.owner_id.clone())
                    .unwrap_or_else(|| sender.to_string()),
                title: title.clone(),
                text: text.clone(),
            }),
            Intent::Chat { text } => SessionEvent::Chat { text: text.clone() },
            Intent::SetCharacterViewer { user_id, allowed } => {
                SessionEvent::CharacterViewerChanged {
                    user_id: user_id.clone(),
                    allowed: *allowed,
                }
            }
            Intent::EndSession => SessionEvent::SessionEnded {
                reason: "ended by the master".to_string(),
            },
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        Author, CharacterSnapshot, DiceFormula, EventEnvelope, ParticipantInfo, SketchState,
    };

    fn table() -> SessionState {
        let mut state = SessionState::authoritative();
        let events = vec![
            SessionEvent::ParticipantJoined(member("gm", Role::Master)),
            SessionEvent::ParticipantJoined(member("alice", Role::Player)),
            SessionEvent::ParticipantJoined(member("bob", Role::Player)),
            SessionEvent::CharacterUpdated(CharacterSnapshot::new("c1", "alice", "Brom", "{}")),
            SessionEvent::NoteUpdated(NoteDocument {
                note_id: "n1".into(),
                owner_id: "alice".into(),
                title: "Clues".into(),
                text: String::new(),
            }),
        ];
        for (i, event) in events.into_iter().enumerate() {
            state
                .apply(&EventEnvelope {
                    seq: i as u64 + 1,
                    session_id: 1,
                    sender: Author::Server,
                    server_timestamp: 0,
                    event,
                })
                .unwrap();
        }
        state
    }

    fn member(user_id: &str, role: Role) -> ParticipantInfo {
        ParticipantInfo {
            user_id: user_id.into(),
            display_name: user_id.into(),
            role,
            character_id: None,
            connected: true,
        }
    }

    fn rename(character_id: &str) -> Intent {
        Intent::UpdateCharacter {
            character_id: character_id.into(),
            patch: CharacterPatch {
                name: Some("Brom the Bold".into()),
                data: None,
            },
            instant_refresh: true,
        }
    }

    fn router() -> Router {
        Router::new(DiceRoller::new(Some(3)))
    }

    #[test]
    fn test_authorization_table() {
        assert_eq!(permission(IntentKind::RequestDice), Permission::Anyone);
        assert_eq!(permission(IntentKind::UpdateSketch), Permission::MasterOnly);
        assert_eq!(permission(IntentKind::UpdateCharacter), Permission::OwnerOrMaster);
        assert_eq!(permission(IntentKind::UpdateNote), Permission::OwnerOnly);
        assert_eq!(permission(IntentKind::EndSession), Permission::MasterOnly);
    }

    #[test]
    fn test_character_update_by_non_owner_rejected() {
        let state = table();
        let result = router().resolve(&state, "bob", &rename("c1"));
        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
    }

    #[test]
    fn test_character_update_by_owner_and_master() {
        let state = table();
        let mut router = router();
        for sender in ["alice", "gm"] {
            match router.resolve(&state, sender, &rename("c1")).unwrap() {
                SessionEvent::CharacterUpdated(c) => {
                    assert_eq!(c.name, "Brom the Bold");
                    assert_eq!(c.owner_id, "alice");
                    assert_eq!(c.revision, 1);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_character_is_not_found() {
        let state = table();
        assert!(matches!(
            router().resolve(&state, "gm", &rename("c9")),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_player_sketch_rejected() {
        let state = table();
        let intent = Intent::UpdateSketch(SketchState::default());
        assert!(matches!(
            router().resolve(&state, "alice", &intent),
            Err(SyncError::Unauthorized(_))
        ));
        assert!(router().resolve(&state, "gm", &intent).is_ok());
    }

    #[test]
    fn test_note_ownership() {
        let state = table();
        let edit = |note_id: &str| Intent::UpdateNote {
            note_id: note_id.into(),
            title: "Mine".into(),
            text: "text".into(),
        };
        let mut router = router();

        assert!(matches!(
            router.resolve(&state, "bob", &edit("n1")),
            Err(SyncError::Unauthorized(_))
        ));
        // the master does not get to edit players' notes either
        assert!(router.resolve(&state, "gm", &edit("n1")).is_err());

        match router.resolve(&state, "bob", &edit("n2")).unwrap() {
            SessionEvent::NoteUpdated(note) => assert_eq!(note.owner_id, "bob"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let state = table();
        let mut router = router();
        let cases = vec![
            Intent::Chat { text: "   ".into() },
            Intent::Chat {
                text: "x".repeat(MAX_CHAT_LEN + 1),
            },
            Intent::RequestDice {
                formula: DiceFormula::new(1, 1, 0),
                label: None,
                visibility: RollVisibility::Public,
            },
            Intent::UpdateCharacter {
                character_id: "c1".into(),
                patch: CharacterPatch::default(),
                instant_refresh: false,
            },
        ];
        for intent in cases {
            assert!(
                matches!(
                    router.resolve(&state, "alice", &intent),
                    Err(SyncError::MalformedPayload(_))
                ),
                "{:?} should be malformed",
                intent
            );
        }

        let unknown_viewer = Intent::SetCharacterViewer {
            user_id: "zed".into(),
            allowed: true,
        };
        assert!(matches!(
            router.resolve(&state, "gm", &unknown_viewer),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_sketch_tokens_need_finite_position() {
        let state = table();
        let mut router = router();
        let token = |x: f32, y: f32| {
            Intent::UpdateSketch(SketchState {
                displayed: true,
                elements: vec![SketchElement::Token {
                    id: "t1".into(),
                    label: "Goblin".into(),
                    x,
                    y,
                    asset: None,
                }],
            })
        };

        for (x, y) in [(f32::NAN, 1.0), (2.0, f32::INFINITY), (f32::NEG_INFINITY, f32::NAN)] {
            assert!(matches!(
                router.resolve(&state, "gm", &token(x, y)),
                Err(SyncError::MalformedPayload(_))
            ));
        }
        assert!(router.resolve(&state, "gm", &token(3.5, -1.0)).is_ok());
    }

    #[test]
    fn test_unknown_sender_is_not_found() {
        let state = table();
        assert!(matches!(
            router().resolve(&state, "mallory", &Intent::Chat { text: "hi".into() }),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_dice_resolution() {
        let state = table();
        let intent = Intent::RequestDice {
            formula: DiceFormula::new(1, 20, 0),
            label: Some("perception".into()),
            visibility: RollVisibility::Public,
        };
        match router().resolve(&state, "alice", &intent).unwrap() {
            SessionEvent::DiceRolled(roll) => {
                assert_eq!(roll.requester_id, "alice");
                assert!((1..=20).contains(&roll.total));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_audiences() {
        let mut state = table();
        let character = SessionEvent::CharacterUpdated(CharacterSnapshot::new("c1", "alice", "Brom", "{}"));
        let audience = audience_for(&character);
        assert!(audience.admits(&state, "gm", Role::Master));
        assert!(audience.admits(&state, "alice", Role::Player));
        assert!(!audience.admits(&state, "bob", Role::Player));

        state
            .apply(&EventEnvelope {
                seq: state.seq() + 1,
                session_id: 1,
                sender: Author::Participant("gm".into()),
                server_timestamp: 0,
                event: SessionEvent::CharacterViewerChanged {
                    user_id: "bob".into(),
                    allowed: true,
                },
            })
            .unwrap();
        assert!(audience.admits(&state, "bob", Role::Player));

        let private = SessionEvent::DiceRolled(DiceRoll {
            requester_id: "alice".into(),
            formula: DiceFormula::new(1, 20, 0),
            label: None,
            visibility: RollVisibility::Private,
            rolls: vec![4],
            total: 4,
        });
        let audience = audience_for(&private);
        assert!(audience.admits(&state, "alice", Role::Player));
        assert!(audience.admits(&state, "gm", Role::Master));
        assert!(!audience.admits(&state, "bob", Role::Player));

        assert_eq!(
            audience_for(&SessionEvent::Chat { text: "hi".into() }),
            Audience::All
        );
    }
}
