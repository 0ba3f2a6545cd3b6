//! One live session: its reconciled state, roster, router and debounce
//! buffer, driven by a single actor task.
//!
//! `Session` is plain synchronous code. Everything that mutates it arrives
//! as a `SessionCommand` on the actor's queue, so operations on one session
//! are totally ordered and the event sequence numbers follow that order.
//! Different sessions run in different tasks and share nothing.

use crate::config::{PropagationPolicy, ServerConfig};
use crate::debounce::{Buffered, Debouncer, PendingKey, PendingUpdate};
use crate::dice::DiceRoller;
use crate::directory::{CharacterStore, UserIdentity};
use crate::roster::{ConnectionHandle, ConnectionId, JoinOutcome, Participant, Roster};
use crate::router::{audience_for, Router};
use crate::utils::server_timestamp;
use log::{debug, info, warn};
use shared::{
    Author, CharacterId, EventEnvelope, Intent, Role, ServerMessage, SessionEvent, SessionId,
    SessionInfo, SessionState, StateSnapshot, SyncError, UserId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

pub struct Session {
    info: SessionInfo,
    config: Arc<ServerConfig>,
    state: SessionState,
    roster: Roster,
    router: Router,
    debouncer: Debouncer,
    characters: Arc<dyn CharacterStore>,
    /// When the last connected participant went away
    idle_since: Option<Instant>,
}

impl Session {
    pub fn new(
        info: SessionInfo,
        config: Arc<ServerConfig>,
        characters: Arc<dyn CharacterStore>,
    ) -> Self {
        let seed = config
            .dice_seed
            .map(|seed| seed.wrapping_add(info.session_id));
        Self {
            roster: Roster::new(config.max_participants),
            router: Router::new(DiceRoller::new(seed)),
            state: SessionState::authoritative(),
            debouncer: Debouncer::new(),
            idle_since: None,
            info,
            config,
            characters,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_over(&self) -> bool {
        self.state.ended().is_some()
    }

    pub fn handle(&mut self, command: SessionCommand, now: Instant) {
        match command {
            SessionCommand::Join {
                identity,
                character_id,
                connection,
                reply,
            } => {
                let result = self.join(identity, character_id, connection);
                let _ = reply.send(result);
            }
            SessionCommand::Intent {
                user_id,
                connection_id,
                request_id,
                intent,
            } => self.handle_intent(&user_id, connection_id, request_id, intent, now),
            SessionCommand::Leave {
                user_id,
                connection_id,
            } => self.leave(&user_id, connection_id),
            SessionCommand::ConnectionLost {
                user_id,
                connection_id,
            } => self.connection_lost(&user_id, connection_id, now),
            SessionCommand::End { reason, reply } => {
                self.end(&reason);
                let _ = reply.send(());
            }
            SessionCommand::Export { reply } => {
                let _ = reply.send(self.export());
            }
        }
    }

    /// Admits or resumes a participant and sends them their snapshot.
    ///
    /// The session's master id decides the role. A join naming a character
    /// loads it into the session on first use; players may only bind
    /// characters they own and the master binds none. Everyone else learns about the join through
    /// events sequenced before the snapshot, so the joiner's first live
    /// event follows its snapshot directly.
    pub fn join(
        &mut self,
        identity: UserIdentity,
        character_id: Option<CharacterId>,
        connection: ConnectionHandle,
    ) -> Result<Role, SyncError> {
        if self.is_over() {
            return Err(SyncError::SessionEnded);
        }
        self.flush_all();

        let user_id = identity.user_id.clone();
        let role = if user_id == self.info.master_id {
            Role::Master
        } else {
            Role::Player
        };
        self.roster.check_admission(&user_id, role)?;

        if let Some(character_id) = &character_id {
            if role.is_master() {
                return Err(SyncError::unauthorized(format!(
                    "the master cannot play character {}",
                    character_id
                )));
            }
            let character = match self.state.character(character_id) {
                Some(existing) => existing.clone(),
                None => self
                    .characters
                    .load(character_id)
                    .ok_or_else(|| SyncError::not_found(format!("character {}", character_id)))?,
            };
            if character.owner_id != user_id {
                return Err(SyncError::unauthorized(format!(
                    "{} does not own character {}",
                    user_id, character_id
                )));
            }
            if self.state.character(character_id).is_none() {
                self.publish(Author::Server, SessionEvent::CharacterUpdated(character), None)?;
            }
        }

        let outcome = self.roster.join(&identity, role, character_id, connection)?;
        let participant = self
            .roster
            .get(&user_id)
            .map(Participant::info)
            .ok_or_else(|| SyncError::not_found(format!("participant {}", user_id)))?;

        match outcome {
            JoinOutcome::Joined => {
                self.publish(
                    Author::Server,
                    SessionEvent::ParticipantJoined(participant),
                    Some(&user_id),
                )?;
            }
            JoinOutcome::Resumed {
                was_connected,
                replaced,
                previous_character,
            } => {
                if let Some(old) = replaced {
                    debug!("Closing superseded connection {} of {}", old.id, user_id);
                    old.close();
                }
                if participant.character_id != previous_character {
                    self.publish(
                        Author::Server,
                        SessionEvent::ParticipantJoined(participant),
                        Some(&user_id),
                    )?;
                } else if !was_connected {
                    self.publish(
                        Author::Server,
                        SessionEvent::ParticipantConnection {
                            user_id: user_id.clone(),
                            connected: true,
                        },
                        Some(&user_id),
                    )?;
                }
            }
        }

        self.send_welcome(&user_id);
        self.idle_since = None;
        Ok(role)
    }

    /// Routes one intent from a live connection
    pub fn handle_intent(
        &mut self,
        user_id: &str,
        connection_id: ConnectionId,
        request_id: u64,
        intent: Intent,
        now: Instant,
    ) {
        if !self.roster.is_live(user_id, connection_id) {
            debug!(
                "Ignoring intent from stale connection {} of {}",
                connection_id, user_id
            );
            return;
        }
        if self.is_over() {
            self.reject(user_id, Some(request_id), SyncError::SessionEnded);
            return;
        }

        match self.config.policy_for(&intent) {
            PropagationPolicy::Debounced(window) => {
                match Router::admit(&self.state, user_id, &intent) {
                    Ok(()) => match self.debouncer.push(
                        user_id.to_string(),
                        Some(request_id),
                        intent,
                        now + window,
                    ) {
                        Buffered::Queued => {}
                        Buffered::Displaced(earlier) => self.flush(earlier),
                        Buffered::Refused(intent) => {
                            self.apply_intent(user_id, Some(request_id), &intent)
                        }
                    },
                    Err(error) => self.reject(user_id, Some(request_id), error),
                }
            }
            PropagationPolicy::Immediate => {
                if matches!(intent, Intent::EndSession) {
                    self.flush_all();
                } else if let Some(key) = PendingKey::of(&intent) {
                    if let Some(pending) = self.debouncer.take(&key) {
                        self.flush(pending);
                    }
                }
                self.apply_intent(user_id, Some(request_id), &intent);
            }
        }
    }

    /// Voluntary departure. The master leaving ends the session.
    pub fn leave(&mut self, user_id: &str, connection_id: ConnectionId) {
        if !self.roster.is_live(user_id, connection_id) {
            return;
        }
        let is_master = self
            .roster
            .get(user_id)
            .map(|p| p.role.is_master())
            .unwrap_or(false);
        if is_master {
            self.end("the master left");
        } else {
            self.flush_all();
            self.remove_participant(user_id);
        }
    }

    /// The connection dropped without a `Leave`; start the resume window
    pub fn connection_lost(&mut self, user_id: &str, connection_id: ConnectionId, now: Instant) {
        if !self.roster.disconnect(user_id, connection_id, now) || self.is_over() {
            return;
        }
        let event = SessionEvent::ParticipantConnection {
            user_id: user_id.to_string(),
            connected: false,
        };
        if let Err(e) = self.publish(Author::Server, event, None) {
            warn!("Could not record disconnect of {}: {}", user_id, e);
        }
    }

    /// Housekeeping: flush due updates, expire resume windows, evict idle
    /// sessions
    pub fn tick(&mut self, now: Instant) {
        if self.is_over() {
            return;
        }

        for pending in self.debouncer.take_due(now) {
            self.flush(pending);
        }

        for user_id in self.roster.expired(self.config.resume_window, now) {
            let is_master = self
                .roster
                .get(&user_id)
                .map(|p| p.role.is_master())
                .unwrap_or(false);
            if is_master {
                self.end("the master did not return");
                return;
            }
            info!(
                "Participant {} did not resume within {:?}",
                user_id, self.config.resume_window
            );
            self.flush_all();
            self.remove_participant(&user_id);
        }

        if self.roster.connected_count() == 0 {
            let since = *self.idle_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.config.idle_timeout {
                self.end("the session was idle");
            }
        } else {
            self.idle_since = None;
        }
    }

    /// Broadcasts `SessionEnded` and evicts everyone. Idempotent.
    pub fn end(&mut self, reason: &str) {
        if !self.is_over() {
            self.flush_all();
            let event = SessionEvent::SessionEnded {
                reason: reason.to_string(),
            };
            if let Err(e) = self.publish(Author::Server, event, None) {
                warn!("Could not end session {}: {}", self.info.session_id, e);
            }
        }
        self.roster.evict_all();
    }

    /// Consistent export, with nothing left pending
    pub fn export(&mut self) -> StateSnapshot {
        self.flush_all();
        self.state.export()
    }

    fn flush_all(&mut self) {
        for pending in self.debouncer.take_all() {
            self.flush(pending);
        }
    }

    /// Resolves a buffered update against the state as it is now
    fn flush(&mut self, pending: PendingUpdate) {
        self.apply_intent(&pending.sender, pending.request_id, &pending.intent);
    }

    fn apply_intent(&mut self, sender: &str, request_id: Option<u64>, intent: &Intent) {
        let result = match self.router.resolve(&self.state, sender, intent) {
            Ok(event) => self.publish(Author::Participant(sender.to_string()), event, None),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            self.reject(sender, request_id, error);
        }
    }

    fn remove_participant(&mut self, user_id: &str) {
        if self.roster.remove(user_id).is_none() {
            return;
        }
        let event = SessionEvent::ParticipantLeft {
            user_id: user_id.to_string(),
        };
        if let Err(e) = self.publish(Author::Server, event, None) {
            warn!("Could not record departure of {}: {}", user_id, e);
        }
    }

    /// Sequences, applies and delivers one event.
    ///
    /// Nothing is delivered unless the reconciler accepted the envelope.
    fn publish(
        &mut self,
        sender: Author,
        event: SessionEvent,
        exclude: Option<&str>,
    ) -> Result<u64, SyncError> {
        let envelope = EventEnvelope {
            seq: self.state.seq() + 1,
            session_id: self.info.session_id,
            sender,
            server_timestamp: server_timestamp(),
            event,
        };
        self.state.apply(&envelope)?;

        let audience = audience_for(&envelope.event);
        let mut delivered = 0;
        for participant in self.roster.connected() {
            if exclude == Some(participant.user_id.as_str())
                || !audience.admits(&self.state, &participant.user_id, participant.role)
            {
                continue;
            }
            if let Some(connection) = &participant.connection {
                if connection.send(ServerMessage::Event(envelope.clone())) {
                    delivered += 1;
                }
            }
        }
        debug!(
            "Session {} event #{} {} delivered to {}",
            self.info.session_id,
            envelope.seq,
            envelope.event.name(),
            delivered
        );

        match &envelope.event {
            SessionEvent::CharacterViewerChanged { user_id, .. } => self.send_welcome(user_id),
            SessionEvent::SessionEnded { reason } => {
                info!("Session {} ended: {}", self.info.session_id, reason);
                self.roster.evict_all();
            }
            _ => {}
        }
        Ok(envelope.seq)
    }

    /// Sends a participant a fresh snapshot of what they may see
    fn send_welcome(&self, user_id: &str) {
        if let Some(participant) = self.roster.get(user_id) {
            if let Some(connection) = &participant.connection {
                let snapshot = self.state.view_for(
                    &self.info,
                    user_id,
                    participant.role,
                    self.config.recent_log_len,
                );
                connection.send(ServerMessage::Welcome(snapshot));
            }
        }
    }

    fn reject(&self, user_id: &str, request_id: Option<u64>, error: SyncError) {
        warn!(
            "Session {} rejected request {:?} from {}: {}",
            self.info.session_id, request_id, user_id, error
        );
        if let Some(connection) = self.roster.get(user_id).and_then(|p| p.connection.as_ref()) {
            connection.send(ServerMessage::Rejected { request_id, error });
        }
    }
}

/// Work for a session actor
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        identity: UserIdentity,
        character_id: Option<CharacterId>,
        connection: ConnectionHandle,
        reply: oneshot::Sender<Result<Role, SyncError>>,
    },
    Intent {
        user_id: UserId,
        connection_id: ConnectionId,
        request_id: u64,
        intent: Intent,
    },
    Leave {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    ConnectionLost {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    End {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Export {
        reply: oneshot::Sender<StateSnapshot>,
    },
}

/// Cheap, cloneable address of a running session actor.
///
/// Every method fails with `SessionEnded` once the actor has stopped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    info: SessionInfo,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> SessionId {
        self.info.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(
        &self,
        identity: UserIdentity,
        character_id: Option<CharacterId>,
        connection: ConnectionHandle,
    ) -> Result<Role, SyncError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::Join {
            identity,
            character_id,
            connection,
            reply,
        })?;
        response.await.map_err(|_| SyncError::SessionEnded)?
    }

    pub fn intent(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        request_id: u64,
        intent: Intent,
    ) -> Result<(), SyncError> {
        self.send(SessionCommand::Intent {
            user_id,
            connection_id,
            request_id,
            intent,
        })
    }

    pub fn leave(&self, user_id: UserId, connection_id: ConnectionId) -> Result<(), SyncError> {
        self.send(SessionCommand::Leave {
            user_id,
            connection_id,
        })
    }

    pub fn connection_lost(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), SyncError> {
        self.send(SessionCommand::ConnectionLost {
            user_id,
            connection_id,
        })
    }

    pub async fn end(&self, reason: impl Into<String>) -> Result<(), SyncError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::End {
            reason: reason.into(),
            reply,
        })?;
        response.await.map_err(|_| SyncError::SessionEnded)
    }

    pub async fn export(&self) -> Result<StateSnapshot, SyncError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::Export { reply })?;
        response.await.map_err(|_| SyncError::SessionEnded)
    }

    fn send(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.tx.send(command).map_err(|_| SyncError::SessionEnded)
    }
}

/// Starts the actor for `session`. `on_exit` runs once the session is over.
pub fn spawn<F, Fut>(session: Session, on_exit: F) -> SessionHandle
where
    F: FnOnce(SessionId) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        info: session.info().clone(),
        tx,
    };
    tokio::spawn(async move {
        let session_id = session.info().session_id;
        run(session, rx).await;
        on_exit(session_id).await;
    });
    handle
}

async fn run(mut session: Session, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
    let session_id = session.info.session_id;
    let mut housekeeping = interval(session.config.housekeeping_interval);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Session {} ({}) started", session_id, session.info.name);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => session.handle(command, Instant::now()),
                None => session.end("the hub is shutting down"),
            },
            _ = housekeeping.tick() => session.tick(Instant::now()),
        }

        if session.is_over() {
            break;
        }
    }

    info!("Session {} closed", session_id);
}
