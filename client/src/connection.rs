//! Client side of the session link.
//!
//! `Connection::connect` performs the handshake and hands back a
//! connection whose background task keeps the link alive: it sends
//! heartbeats, forwards intents, and on an unexpected drop reconnects with
//! exponential backoff, re-joining the same session with the same character.
//! Everything the server says, plus link status changes, comes out of
//! `next_event` in order.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{
    CharacterId, ClientCodec, ClientMessage, Credentials, EventEnvelope, GameId, Handshake,
    Intent, JoinSnapshot, ServerMessage, SessionEvent, SessionId, SyncError, PROTOCOL_VERSION,
};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

type Reader = FramedRead<OwnedReadHalf, ClientCodec>;
type Writer = FramedWrite<OwnedWriteHalf, ClientCodec>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub credentials: Credentials,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up reconnecting once this much time has passed since the drop
    pub resume_deadline: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server_addr: server_addr.into(),
            credentials,
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            resume_deadline: Duration::from_secs(30),
        }
    }
}

/// Which session to enter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Create {
        game_id: GameId,
        name: String,
    },
    Join {
        session_id: SessionId,
        character_id: Option<CharacterId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A full snapshot. Always the first event, and again after every
    /// resume or server-side re-sync.
    Snapshot(JoinSnapshot),
    Event(EventEnvelope),
    Rejected {
        request_id: Option<u64>,
        error: SyncError,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Terminal. No further events follow.
    Closed(SyncError),
}

#[derive(Debug)]
enum LinkCommand {
    Intent { request_id: u64, intent: Intent },
    Close,
}

/// Exponential backoff: doubles from `initial` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Cloneable, non-blocking intent submission
#[derive(Debug, Clone)]
pub struct IntentSender {
    commands: mpsc::UnboundedSender<LinkCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_request_id: Arc<AtomicU64>,
}

impl IntentSender {
    /// Queues an intent and returns its request id. If the link task is
    /// gone the intent is rejected locally with `ConnectionLost`.
    pub fn send(&self, intent: Intent) -> u64 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        if self
            .commands
            .send(LinkCommand::Intent { request_id, intent })
            .is_err()
        {
            let _ = self.events.send(ConnectionEvent::Rejected {
                request_id: Some(request_id),
                error: SyncError::ConnectionLost,
            });
        }
        request_id
    }
}

pub struct Connection {
    sender: IntentSender,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    task: JoinHandle<()>,
    closed: bool,
}

impl Connection {
    /// Connects and completes the handshake. Fails with the server's
    /// rejection, or `ConnectionLost` if the server cannot be reached.
    pub async fn connect(config: ClientConfig, target: JoinTarget) -> Result<Self, SyncError> {
        let handshake = match target {
            JoinTarget::Create { game_id, name } => Handshake::Create {
                credentials: config.credentials.clone(),
                game_id,
                name,
            },
            JoinTarget::Join {
                session_id,
                character_id,
            } => Handshake::Join {
                session_id,
                credentials: config.credentials.clone(),
                character_id,
            },
        };

        let (reader, writer, snapshot) = open(&config, handshake).await?;
        info!(
            "Joined session {} as {:?}",
            snapshot.session.session_id, snapshot.role
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let link = Link {
            session_id: snapshot.session.session_id,
            character_id: snapshot.accepted_character_id.clone(),
            config,
            commands,
            events: events_tx.clone(),
        };
        let _ = events_tx.send(ConnectionEvent::Snapshot(snapshot));
        let task = tokio::spawn(link.run(reader, writer));

        Ok(Self {
            sender: IntentSender {
                commands: commands_tx,
                events: events_tx,
                next_request_id: Arc::new(AtomicU64::new(1)),
            },
            events,
            task,
            closed: false,
        })
    }

    /// Non-blocking; returns the request id rejections will refer to
    pub fn send(&self, intent: Intent) -> u64 {
        self.sender.send(intent)
    }

    pub fn sender(&self) -> IntentSender {
        self.sender.clone()
    }

    /// Next event, or `None` once the connection has closed
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(ConnectionEvent::Closed(_)) | None) {
            self.closed = true;
        }
        event
    }

    /// Leaves the session and waits for the link to shut down
    pub async fn close(self) {
        let _ = self.sender.commands.send(LinkCommand::Close);
        let _ = self.task.await;
    }
}

/// Opens a socket and runs the handshake
async fn open(
    config: &ClientConfig,
    handshake: Handshake,
) -> Result<(Reader, Writer, JoinSnapshot), SyncError> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(&config.server_addr))
        .await
        .map_err(|_| SyncError::ConnectionLost)?
        .map_err(|e| {
            debug!("Connect to {} failed: {}", config.server_addr, e);
            SyncError::ConnectionLost
        })?;
    let _ = stream.set_nodelay(true);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, ClientCodec::new());
    let mut writer = FramedWrite::new(write_half, ClientCodec::new());

    writer
        .send(ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            handshake,
        })
        .await
        .map_err(|_| SyncError::ConnectionLost)?;

    match timeout(config.connect_timeout, reader.next()).await {
        Ok(Some(Ok(Ok(ServerMessage::Welcome(snapshot))))) => Ok((reader, writer, snapshot)),
        Ok(Some(Ok(Ok(ServerMessage::Rejected { error, .. })))) => Err(error),
        Ok(Some(Ok(Ok(ServerMessage::Event(_))))) => {
            Err(SyncError::malformed("event before welcome"))
        }
        Ok(Some(Ok(Err(error)))) => Err(error),
        Ok(Some(Err(_))) | Ok(None) | Err(_) => Err(SyncError::ConnectionLost),
    }
}

/// How a connected phase ended
enum Ended {
    /// Local close; the server has been told
    Closed,
    /// Nothing more to do; carries the reason
    Terminal(SyncError),
    /// The link dropped; try to resume
    Lost,
}

struct Link {
    config: ClientConfig,
    session_id: SessionId,
    character_id: Option<CharacterId>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Link {
    async fn run(mut self, mut reader: Reader, mut writer: Writer) {
        loop {
            match self.serve(&mut reader, &mut writer).await {
                Ended::Closed => return,
                Ended::Terminal(error) => {
                    self.emit(ConnectionEvent::Closed(error));
                    return;
                }
                Ended::Lost => {
                    warn!("Connection to session {} lost", self.session_id);
                }
            }

            match self.reconnect().await {
                Some(Ok((new_reader, new_writer, snapshot))) => {
                    info!("Resumed session {}", self.session_id);
                    self.character_id = snapshot.accepted_character_id.clone();
                    self.emit(ConnectionEvent::Snapshot(snapshot));
                    reader = new_reader;
                    writer = new_writer;
                }
                Some(Err(error)) => {
                    self.emit(ConnectionEvent::Closed(error));
                    return;
                }
                None => return,
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Pumps frames both ways until the link ends
    async fn serve(&mut self, reader: &mut Reader, writer: &mut Writer) -> Ended {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Ok(ServerMessage::Welcome(snapshot)))) => {
                        self.character_id = snapshot.accepted_character_id.clone();
                        self.emit(ConnectionEvent::Snapshot(snapshot));
                    }
                    Some(Ok(Ok(ServerMessage::Event(envelope)))) => {
                        let ended = matches!(envelope.event, SessionEvent::SessionEnded { .. });
                        self.emit(ConnectionEvent::Event(envelope));
                        if ended {
                            return Ended::Terminal(SyncError::SessionEnded);
                        }
                    }
                    Some(Ok(Ok(ServerMessage::Rejected { request_id, error }))) => {
                        self.emit(ConnectionEvent::Rejected { request_id, error });
                    }
                    Some(Ok(Err(error))) => {
                        warn!("Ignoring undecodable frame: {}", error);
                    }
                    Some(Err(e)) => {
                        debug!("Transport error: {}", e);
                        return Ended::Lost;
                    }
                    None => return Ended::Lost,
                },
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Intent { request_id, intent }) => {
                        if writer.send(ClientMessage::Intent { request_id, intent }).await.is_err() {
                            self.emit(ConnectionEvent::Rejected {
                                request_id: Some(request_id),
                                error: SyncError::ConnectionLost,
                            });
                            return Ended::Lost;
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = writer.send(ClientMessage::Leave).await;
                        let _ = SinkExt::<ClientMessage>::close(writer).await;
                        return Ended::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if writer.send(ClientMessage::Heartbeat).await.is_err() {
                        return Ended::Lost;
                    }
                }
            }
        }
    }

    /// Retries the join until it succeeds, fails terminally or the resume
    /// deadline passes. `None` means the user closed the connection meanwhile.
    async fn reconnect(&mut self) -> Option<Result<(Reader, Writer, JoinSnapshot), SyncError>> {
        let deadline = Instant::now() + self.config.resume_deadline;
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let delay = backoff.next_delay();
            if Instant::now() + delay > deadline {
                return Some(Err(SyncError::ConnectionLost));
            }
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
            self.while_down(sleep(delay)).await?;

            let handshake = Handshake::Join {
                session_id: self.session_id,
                credentials: self.config.credentials.clone(),
                character_id: self.character_id.clone(),
            };
            let config = self.config.clone();
            match self.while_down(async move { open(&config, handshake).await }).await? {
                Ok(link) => return Some(Ok(link)),
                Err(error) if error.is_terminal() => return Some(Err(error)),
                Err(error) => debug!("Resume attempt {} failed: {}", attempt, error),
            }
        }
    }

    /// Awaits `work` while rejecting intents locally. `None` if a close was
    /// requested first.
    async fn while_down<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Intent { request_id, .. }) => {
                        self.emit(ConnectionEvent::Rejected {
                            request_id: Some(request_id),
                            error: SyncError::ConnectionLost,
                        });
                    }
                    Some(LinkCommand::Close) | None => return None,
                },
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A sender wired to plain channels, for exercising intent builders
    pub(crate) fn detached_sender() -> (IntentSender, mpsc::UnboundedReceiver<Intent>) {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if let LinkCommand::Intent { intent, .. } = command {
                    let _ = intent_tx.send(intent);
                }
            }
        });
        (
            IntentSender {
                commands,
                events,
                next_request_id: Arc::new(AtomicU64::new(1)),
            },
            intent_rx,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new(
            "127.0.0.1:7878",
            Credentials {
                user_id: "alice".into(),
                display_name: "Alice".into(),
                token: String::new(),
            },
        );
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.resume_deadline, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_send_without_link_is_rejected_locally() {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, mut events_rx) = mpsc::unbounded_channel();
        drop(command_rx);
        let sender = IntentSender {
            commands,
            events,
            next_request_id: Arc::new(AtomicU64::new(7)),
        };

        let request_id = sender.send(Intent::Chat { text: "hello?".into() });
        assert_eq!(request_id, 7);
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectionEvent::Rejected {
                request_id: Some(7),
                error: SyncError::ConnectionLost
            })
        );
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let (sender, mut intents) = detached_sender();
        let first = sender.send(Intent::Chat { text: "a".into() });
        let second = sender.clone().send(Intent::Chat { text: "b".into() });
        assert!(second > first);
        assert_eq!(intents.recv().await, Some(Intent::Chat { text: "a".into() }));
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = ClientConfig::new(
            addr.to_string(),
            Credentials {
                user_id: "alice".into(),
                display_name: String::new(),
                token: String::new(),
            },
        );
        config.connect_timeout = Duration::from_millis(500);
        let result = Connection::connect(
            config,
            JoinTarget::Join {
                session_id: 1,
                character_id: None,
            },
        )
        .await;
        assert!(matches!(result, Err(SyncError::ConnectionLost)));
    }
}
