//! Coalescing buffer for debounced updates.
//!
//! Updates are keyed by what they replace. A newer update from the same
//! sender supersedes the buffered one (character patches are merged
//! field-wise) while keeping the original deadline, so a steady stream of
//! edits is published at most once per window. Updates from different
//! senders are never folded together: the older one is handed back so it
//! can be applied on its own first.

use shared::{CharacterId, Intent, NoteId, UserId};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKey {
    Character(CharacterId),
    Note(NoteId),
    Sketch,
}

impl PendingKey {
    /// Key of a coalescible intent
    pub fn of(intent: &Intent) -> Option<Self> {
        match intent {
            Intent::UpdateCharacter { character_id, .. } => {
                Some(PendingKey::Character(character_id.clone()))
            }
            Intent::UpdateNote { note_id, .. } => Some(PendingKey::Note(note_id.clone())),
            Intent::UpdateSketch(_) => Some(PendingKey::Sketch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub key: PendingKey,
    pub sender: UserId,
    /// Request id of the latest intent folded into this update
    pub request_id: Option<u64>,
    pub intent: Intent,
    pub due: Instant,
}

#[derive(Debug, Default)]
pub struct Debouncer {
    /// First-arrival order
    pending: Vec<PendingUpdate>,
}

/// What `Debouncer::push` did with an update
#[derive(Debug)]
pub enum Buffered {
    /// Queued, possibly folded into an earlier update from the same sender
    Queued,
    /// Queued; the pending update for the same key came from someone else
    /// and must be applied now, before the new one
    Displaced(PendingUpdate),
    /// The intent cannot be debounced
    Refused(Intent),
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers an update, coalescing with a pending one for the same key
    /// from the same sender.
    pub fn push(
        &mut self,
        sender: UserId,
        request_id: Option<u64>,
        intent: Intent,
        due: Instant,
    ) -> Buffered {
        let key = match PendingKey::of(&intent) {
            Some(key) => key,
            None => return Buffered::Refused(intent),
        };

        let displaced = self
            .pending
            .iter()
            .position(|p| p.key == key && p.sender != sender)
            .map(|index| self.pending.remove(index));

        match self.pending.iter_mut().find(|p| p.key == key) {
            Some(existing) => {
                let merged = match (&mut existing.intent, intent) {
                    (
                        Intent::UpdateCharacter { patch, .. },
                        Intent::UpdateCharacter { patch: later, .. },
                    ) => {
                        patch.merge(later);
                        None
                    }
                    (_, other) => Some(other),
                };
                if let Some(replacement) = merged {
                    existing.intent = replacement;
                }
                existing.request_id = request_id;
            }
            None => self.pending.push(PendingUpdate {
                key,
                sender,
                request_id,
                intent,
                due,
            }),
        }
        match displaced {
            Some(update) => Buffered::Displaced(update),
            None => Buffered::Queued,
        }
    }

    /// Removes and returns every update whose deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Vec<PendingUpdate> {
        let (due, rest) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.due <= now);
        self.pending = rest;
        due
    }

    pub fn take_all(&mut self) -> Vec<PendingUpdate> {
        std::mem::take(&mut self.pending)
    }

    pub fn take(&mut self, key: &PendingKey) -> Option<PendingUpdate> {
        let index = self.pending.iter().position(|p| &p.key == key)?;
        Some(self.pending.remove(index))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
