//! Deterministic per-session state.
//!
//! The hub keeps one authoritative `SessionState` per session and applies
//! every event envelope to it in arrival order. Clients run the very same
//! `apply` against a projection built from their join snapshot, which is
//! what makes their view converge with the hub's on everything they are
//! delivered.
//!
//! Applying is all-or-nothing: an envelope is validated against the current
//! state before anything is mutated.

use crate::error::SyncError;
use crate::model::{
    Author, CharacterId, CharacterSnapshot, LogContent, LogEntry, NoteDocument, NoteId,
    ParticipantInfo, Role, RollVisibility, SessionInfo, SketchState, UserId, Visibility,
};
use crate::protocol::{EventEnvelope, JoinSnapshot, SessionEvent};
use std::collections::{BTreeMap, BTreeSet};

/// Full, unfiltered export of a session's reconciled state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub seq: u64,
    pub participants: Vec<ParticipantInfo>,
    pub characters: Vec<CharacterSnapshot>,
    pub sketch: SketchState,
    pub notes: Vec<NoteDocument>,
    pub character_viewers: Vec<UserId>,
    pub log: Vec<LogEntry>,
    pub ended: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    seq: u64,
    participants: Vec<ParticipantInfo>,
    characters: BTreeMap<CharacterId, CharacterSnapshot>,
    sketch: SketchState,
    notes: BTreeMap<NoteId, NoteDocument>,
    character_viewers: BTreeSet<UserId>,
    log: Vec<LogEntry>,
    ended: Option<String>,
    /// Applied envelopes, kept only on the authoritative copy.
    journal: Option<Vec<EventEnvelope>>,
}

impl SessionState {
    /// Empty state that records every applied envelope for replay.
    pub fn authoritative() -> Self {
        Self {
            journal: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Client-side projection seeded from a join snapshot.
    pub fn from_snapshot(snapshot: &JoinSnapshot) -> Self {
        Self {
            seq: snapshot.seq,
            participants: snapshot.participants.clone(),
            characters: snapshot
                .characters
                .iter()
                .map(|c| (c.character_id.clone(), c.clone()))
                .collect(),
            sketch: snapshot.sketch.clone(),
            notes: snapshot
                .notes
                .iter()
                .map(|n| (n.note_id.clone(), n.clone()))
                .collect(),
            character_viewers: snapshot.character_viewers.iter().cloned().collect(),
            log: snapshot.recent_log.clone(),
            ended: None,
            journal: None,
        }
    }

    /// Rebuilds a state by applying `events` in order to an empty session.
    pub fn replay<'a>(
        events: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<Self, SyncError> {
        let mut state = Self::authoritative();
        for envelope in events {
            state.apply(envelope)?;
        }
        Ok(state)
    }

    /// Applies one envelope. On error the state is left untouched.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), SyncError> {
        if envelope.seq <= self.seq {
            return Err(SyncError::malformed(format!(
                "event {} is not after {}",
                envelope.seq, self.seq
            )));
        }
        if self.ended.is_some() {
            return Err(SyncError::SessionEnded);
        }
        self.check(envelope)?;

        let log_entry = |content: LogContent, visibility: Visibility| LogEntry {
            seq: envelope.seq,
            timestamp: envelope.server_timestamp,
            author: envelope.sender.clone(),
            content,
            visibility,
        };

        match &envelope.event {
            SessionEvent::ParticipantJoined(participant) => {
                match self
                    .participants
                    .iter_mut()
                    .find(|p| p.user_id == participant.user_id)
                {
                    Some(existing) => *existing = participant.clone(),
                    None => self.participants.push(participant.clone()),
                }
                self.log.push(log_entry(
                    LogContent::Joined {
                        display_name: participant.display_name.clone(),
                        role: participant.role,
                    },
                    Visibility::Everyone,
                ));
            }
            SessionEvent::ParticipantLeft { user_id } => {
                let display_name = self
                    .participant(user_id)
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| user_id.clone());
                self.participants.retain(|p| &p.user_id != user_id);
                self.character_viewers.remove(user_id);
                self.log.push(log_entry(
                    LogContent::Left { display_name },
                    Visibility::Everyone,
                ));
            }
            SessionEvent::ParticipantConnection { user_id, connected } => {
                if let Some(p) = self.participants.iter_mut().find(|p| &p.user_id == user_id) {
                    p.connected = *connected;
                }
            }
            SessionEvent::DiceRolled(roll) => {
                let visibility = match roll.visibility {
                    RollVisibility::Public => Visibility::Everyone,
                    RollVisibility::Private => Visibility::MasterAnd(roll.requester_id.clone()),
                };
                self.log
                    .push(log_entry(LogContent::Dice(roll.clone()), visibility));
            }
            SessionEvent::CharacterUpdated(character) => {
                self.characters
                    .insert(character.character_id.clone(), character.clone());
            }
            SessionEvent::SketchUpdated(sketch) => {
                self.sketch = sketch.clone();
            }
            SessionEvent::Audio(_) => {}
            SessionEvent::NoteUpdated(note) => {
                self.notes.insert(note.note_id.clone(), note.clone());
            }
            SessionEvent::Chat { text } => {
                self.log
                    .push(log_entry(LogContent::Chat(text.clone()), Visibility::Everyone));
            }
            SessionEvent::CharacterViewerChanged { user_id, allowed } => {
                if *allowed {
                    self.character_viewers.insert(user_id.clone());
                } else {
                    self.character_viewers.remove(user_id);
                }
            }
            SessionEvent::SessionEnded { reason } => {
                self.ended = Some(reason.clone());
                self.log.push(log_entry(
                    LogContent::SessionEnded {
                        reason: reason.clone(),
                    },
                    Visibility::Everyone,
                ));
            }
        }

        self.seq = envelope.seq;
        if let Some(journal) = self.journal.as_mut() {
            journal.push(envelope.clone());
        }
        Ok(())
    }

    /// Validation that must pass before `apply` mutates anything.
    fn check(&self, envelope: &EventEnvelope) -> Result<(), SyncError> {
        match &envelope.event {
            SessionEvent::ParticipantJoined(participant) => {
                if participant.role.is_master() {
                    if let Some(master) = self.master() {
                        if master.user_id != participant.user_id {
                            return Err(SyncError::unauthorized(
                                "session already has a master",
                            ));
                        }
                    }
                }
                Ok(())
            }
            SessionEvent::ParticipantLeft { user_id }
            | SessionEvent::ParticipantConnection { user_id, .. } => self
                .participant(user_id)
                .map(|_| ())
                .ok_or_else(|| SyncError::not_found(format!("participant {}", user_id))),
            SessionEvent::CharacterUpdated(character) => match self.character(&character.character_id) {
                Some(existing) if existing.owner_id != character.owner_id => Err(
                    SyncError::unauthorized("character owner cannot change"),
                ),
                _ => Ok(()),
            },
            SessionEvent::NoteUpdated(note) => match self.note(&note.note_id) {
                Some(existing) if existing.owner_id != note.owner_id => {
                    Err(SyncError::unauthorized("note owner cannot change"))
                }
                _ => Ok(()),
            },
            SessionEvent::Chat { .. } | SessionEvent::DiceRolled(_) => {
                match &envelope.sender {
                    Author::Participant(_) => Ok(()),
                    Author::Server => Err(SyncError::malformed(
                        "chat and dice must come from a participant",
                    )),
                }
            }
            _ => Ok(()),
        }
    }

    /// Full export, used for replay comparison and debugging.
    pub fn export(&self) -> StateSnapshot {
        StateSnapshot {
            seq: self.seq,
            participants: self.participants.clone(),
            characters: self.characters.values().cloned().collect(),
            sketch: self.sketch.clone(),
            notes: self.notes.values().cloned().collect(),
            character_viewers: self.character_viewers.iter().cloned().collect(),
            log: self.log.clone(),
            ended: self.ended.clone(),
        }
    }

    /// May `viewer` see updates to characters owned by `owner`?
    pub fn can_watch_character(&self, viewer: &str, role: Role, owner: &str) -> bool {
        role.is_master() || viewer == owner || self.character_viewers.contains(viewer)
    }

    pub fn visible_characters(&self, viewer: &str, role: Role) -> Vec<CharacterSnapshot> {
        self.characters
            .values()
            .filter(|c| self.can_watch_character(viewer, role, &c.owner_id))
            .cloned()
            .collect()
    }

    /// The last `limit` log entries `viewer` is allowed to see, oldest first.
    pub fn visible_log(&self, viewer: &str, role: Role, limit: usize) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .log
            .iter()
            .rev()
            .filter(|entry| entry.visibility.admits(viewer, role))
            .take(limit)
            .cloned()
            .collect();
        entries.reverse();
        entries
    }

    /// Join snapshot filtered for one viewer.
    ///
    /// Characters and log entries are limited to what `viewer` may see; the
    /// accepted character is whatever the viewer's participant record is
    /// bound to.
    pub fn view_for(
        &self,
        session: &SessionInfo,
        viewer: &str,
        role: Role,
        recent_log_len: usize,
    ) -> JoinSnapshot {
        JoinSnapshot {
            session: session.clone(),
            you: viewer.to_string(),
            role,
            accepted_character_id: self
                .participant(viewer)
                .and_then(|p| p.character_id.clone()),
            seq: self.seq,
            participants: self.participants.clone(),
            sketch: self.sketch.clone(),
            characters: self.visible_characters(viewer, role),
            notes: self.notes.values().cloned().collect(),
            character_viewers: self.character_viewers.iter().cloned().collect(),
            recent_log: self.visible_log(viewer, role, recent_log_len),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn participant(&self, user_id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn master(&self) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.role.is_master())
    }

    pub fn characters(&self) -> impl Iterator<Item = &CharacterSnapshot> {
        self.characters.values()
    }

    pub fn character(&self, character_id: &str) -> Option<&CharacterSnapshot> {
        self.characters.get(character_id)
    }

    pub fn sketch(&self) -> &SketchState {
        &self.sketch
    }

    pub fn notes(&self) -> impl Iterator<Item = &NoteDocument> {
        self.notes.values()
    }

    pub fn note(&self, note_id: &str) -> Option<&NoteDocument> {
        self.notes.get(note_id)
    }

    pub fn character_viewers(&self) -> impl Iterator<Item = &UserId> {
        self.character_viewers.iter()
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn ended(&self) -> Option<&str> {
        self.ended.as_deref()
    }

    pub fn journal(&self) -> &[EventEnvelope] {
        self.journal.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::DiceFormula;
    use crate::model::{AudioCommand, DiceRoll, SketchElement};

    struct Feed {
        seq: u64,
    }

    impl Feed {
        fn new() -> Self {
            Self { seq: 0 }
        }

        fn next(&mut self, sender: Author, event: SessionEvent) -> EventEnvelope {
            self.seq += 1;
            EventEnvelope {
                seq: self.seq,
                session_id: 1,
                sender,
                server_timestamp: 1_000 + self.seq,
                event,
            }
        }
    }

    fn participant(user_id: &str, role: Role) -> ParticipantInfo {
        ParticipantInfo {
            user_id: user_id.into(),
            display_name: user_id.to_uppercase(),
            role,
            character_id: None,
            connected: true,
        }
    }

    fn by(user_id: &str) -> Author {
        Author::Participant(user_id.into())
    }

    fn roll(requester: &str, visibility: RollVisibility, value: u32) -> DiceRoll {
        DiceRoll {
            requester_id: requester.into(),
            formula: DiceFormula::new(1, 20, 0),
            label: None,
            visibility,
            rolls: vec![value],
            total: value as i64,
        }
    }

    fn sample_session(feed: &mut Feed) -> Vec<EventEnvelope> {
        vec![
            feed.next(
                Author::Server,
                SessionEvent::ParticipantJoined(participant("gm", Role::Master)),
            ),
            feed.next(
                Author::Server,
                SessionEvent::ParticipantJoined(participant("alice", Role::Player)),
            ),
            feed.next(
                Author::Server,
                SessionEvent::CharacterUpdated(CharacterSnapshot::new("c1", "alice", "Brom", "{}")),
            ),
            feed.next(
                by("alice"),
                SessionEvent::DiceRolled(roll("alice", RollVisibility::Public, 17)),
            ),
            feed.next(
                by("gm"),
                SessionEvent::SketchUpdated(SketchState {
                    displayed: true,
                    elements: vec![SketchElement::Background {
                        asset: "maps/cave.png".into(),
                    }],
                }),
            ),
            feed.next(
                by("gm"),
                SessionEvent::Audio(AudioCommand::Play {
                    track: "rain.ogg".into(),
                    looped: true,
                }),
            ),
            feed.next(
                by("alice"),
                SessionEvent::NoteUpdated(NoteDocument {
                    note_id: "n1".into(),
                    owner_id: "alice".into(),
                    title: "Clues".into(),
                    text: "The innkeeper lies".into(),
                }),
            ),
            feed.next(
                by("alice"),
                SessionEvent::Chat {
                    text: "I search the room".into(),
                },
            ),
        ]
    }

    #[test]
    fn test_replay_matches_live_state() {
        let mut feed = Feed::new();
        let events = sample_session(&mut feed);

        let mut live = SessionState::authoritative();
        for envelope in &events {
            live.apply(envelope).unwrap();
        }

        let replayed = SessionState::replay(live.journal()).unwrap();
        assert_eq!(replayed.export(), live.export());
        assert_eq!(live.export().seq, 8);
    }

    #[test]
    fn test_replay_is_order_sensitive() {
        let mut feed = Feed::new();
        let mut events = sample_session(&mut feed);
        events.push(feed.next(
            by("gm"),
            SessionEvent::SketchUpdated(SketchState::default()),
        ));

        let live = SessionState::replay(&events).unwrap();
        assert_eq!(live.sketch(), &SketchState::default());

        // swapping the two sketch updates (and their seqs) changes the outcome
        let mut swapped = events.clone();
        let (a, b) = (4, swapped.len() - 1);
        let first = swapped[a].event.clone();
        swapped[a].event = swapped[b].event.clone();
        swapped[b].event = first;
        let other = SessionState::replay(&swapped).unwrap();
        assert_ne!(other.export(), live.export());
    }

    #[test]
    fn test_audio_changes_nothing_but_seq() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let before = state.export();

        state
            .apply(&feed.next(
                by("gm"),
                SessionEvent::Audio(AudioCommand::Stop { track: None }),
            ))
            .unwrap();
        let after = state.export();
        assert_eq!(after.seq, before.seq + 1);
        assert_eq!(StateSnapshot { seq: before.seq, ..after }, before);

        // still replays to the same place
        let replayed = SessionState::replay(state.journal()).unwrap();
        assert_eq!(replayed.export(), state.export());
    }

    #[test]
    fn test_log_order_follows_seq() {
        let mut feed = Feed::new();
        let state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let seqs: Vec<u64> = state.log().iter().map(|e| e.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
        // two joins, one roll, one chat
        assert_eq!(state.log().len(), 4);
    }

    #[test]
    fn test_stale_envelope_rejected_without_side_effects() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let before = state.export();

        let stale = EventEnvelope {
            seq: 3,
            session_id: 1,
            sender: by("gm"),
            server_timestamp: 0,
            event: SessionEvent::SketchUpdated(SketchState::default()),
        };
        assert!(matches!(
            state.apply(&stale),
            Err(SyncError::MalformedPayload(_))
        ));
        assert_eq!(state.export(), before);
    }

    #[test]
    fn test_second_master_rejected() {
        let mut feed = Feed::new();
        let mut state = SessionState::authoritative();
        state
            .apply(&feed.next(
                Author::Server,
                SessionEvent::ParticipantJoined(participant("gm", Role::Master)),
            ))
            .unwrap();

        let usurper = feed.next(
            Author::Server,
            SessionEvent::ParticipantJoined(participant("mallory", Role::Master)),
        );
        assert!(matches!(
            state.apply(&usurper),
            Err(SyncError::Unauthorized(_))
        ));
        assert_eq!(
            state.participants().iter().filter(|p| p.role.is_master()).count(),
            1
        );
    }

    #[test]
    fn test_character_owner_is_fixed() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let hijack = feed.next(
            by("gm"),
            SessionEvent::CharacterUpdated(CharacterSnapshot::new("c1", "bob", "Brom", "{}")),
        );
        assert!(state.apply(&hijack).is_err());
        assert_eq!(state.character("c1").unwrap().owner_id, "alice");
    }

    #[test]
    fn test_private_rolls_hidden_from_other_players() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        state
            .apply(&feed.next(
                by("alice"),
                SessionEvent::DiceRolled(roll("alice", RollVisibility::Private, 3)),
            ))
            .unwrap();

        let private_seen = |viewer: &str, role: Role| {
            state
                .visible_log(viewer, role, 100)
                .iter()
                .any(|e| matches!(&e.content, LogContent::Dice(r) if r.visibility == RollVisibility::Private))
        };
        assert!(private_seen("alice", Role::Player));
        assert!(private_seen("gm", Role::Master));
        assert!(!private_seen("bob", Role::Player));
    }

    #[test]
    fn test_visible_log_keeps_most_recent_in_order() {
        let mut feed = Feed::new();
        let state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let recent = state.visible_log("alice", Role::Player, 2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].seq < recent[1].seq);
        assert_eq!(recent[1].content, LogContent::Chat("I search the room".into()));
    }

    #[test]
    fn test_character_visibility_follows_viewers() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        assert!(state.visible_characters("bob", Role::Player).is_empty());
        assert_eq!(state.visible_characters("alice", Role::Player).len(), 1);
        assert_eq!(state.visible_characters("gm", Role::Master).len(), 1);

        state
            .apply(&feed.next(
                by("gm"),
                SessionEvent::CharacterViewerChanged {
                    user_id: "bob".into(),
                    allowed: true,
                },
            ))
            .unwrap();
        assert_eq!(state.visible_characters("bob", Role::Player).len(), 1);
    }

    #[test]
    fn test_leave_keeps_character_and_drops_viewer_grant() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        state
            .apply(&feed.next(
                by("gm"),
                SessionEvent::CharacterViewerChanged {
                    user_id: "alice".into(),
                    allowed: true,
                },
            ))
            .unwrap();
        state
            .apply(&feed.next(
                Author::Server,
                SessionEvent::ParticipantLeft {
                    user_id: "alice".into(),
                },
            ))
            .unwrap();

        assert!(state.participant("alice").is_none());
        assert!(state.character("c1").is_some());
        assert_eq!(state.character_viewers().count(), 0);
        assert!(matches!(
            state.log().last().map(|e| &e.content),
            Some(LogContent::Left { display_name }) if display_name == "ALICE"
        ));
    }

    #[test]
    fn test_nothing_applies_after_end() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        state
            .apply(&feed.next(
                Author::Server,
                SessionEvent::SessionEnded {
                    reason: "master left".into(),
                },
            ))
            .unwrap();
        assert_eq!(state.ended(), Some("master left"));

        let late = feed.next(by("alice"), SessionEvent::Chat { text: "hello?".into() });
        assert_eq!(state.apply(&late), Err(SyncError::SessionEnded));
    }

    #[test]
    fn test_view_for_filters_per_viewer() {
        let mut feed = Feed::new();
        let mut state = SessionState::replay(&sample_session(&mut feed)).unwrap();
        state
            .apply(&feed.next(
                by("alice"),
                SessionEvent::DiceRolled(roll("alice", RollVisibility::Private, 3)),
            ))
            .unwrap();
        let session = SessionInfo {
            session_id: 1,
            game_id: "g".into(),
            name: "Night one".into(),
            master_id: "gm".into(),
        };

        let gm = state.view_for(&session, "gm", Role::Master, 50);
        let bob = state.view_for(&session, "bob", Role::Player, 50);
        assert_eq!(gm.characters.len(), 1);
        assert!(bob.characters.is_empty());
        assert_eq!(gm.recent_log.len(), bob.recent_log.len() + 1);
        assert_eq!(bob.seq, state.seq());
        assert_eq!(bob.you, "bob");
        assert_eq!(bob.accepted_character_id, None);
    }

    #[test]
    fn test_projection_from_snapshot_applies_later_events() {
        let mut feed = Feed::new();
        let authoritative = SessionState::replay(&sample_session(&mut feed)).unwrap();
        let session = SessionInfo {
            session_id: 1,
            game_id: "g".into(),
            name: "Night one".into(),
            master_id: "gm".into(),
        };
        let snapshot = authoritative.view_for(&session, "alice", Role::Player, 50);
        assert_eq!(snapshot.seq, authoritative.seq());
        assert_eq!(snapshot.characters.len(), 1);

        let mut projection = SessionState::from_snapshot(&snapshot);
        let sketch = SketchState {
            displayed: false,
            elements: vec![],
        };
        projection
            .apply(&feed.next(by("gm"), SessionEvent::SketchUpdated(sketch.clone())))
            .unwrap();
        assert_eq!(projection.sketch(), &sketch);
        assert!(projection.journal().is_empty());
    }
}
