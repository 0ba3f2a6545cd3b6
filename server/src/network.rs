//! Server network layer: accepts TCP connections, runs the handshake and
//! shuttles frames between sockets and session actors

use crate::config::ServerConfig;
use crate::directory::{CharacterStore, UserDirectory};
use crate::registry::SessionRegistry;
use crate::roster::{ConnectionHandle, ConnectionId};
use crate::session::SessionHandle;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    ClientMessage, CodecError, Handshake, ServerCodec, ServerMessage, SyncError, UserId,
    PROTOCOL_VERSION,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

type Reader = FramedRead<OwnedReadHalf, ServerCodec>;
type Writer = FramedWrite<OwnedWriteHalf, ServerCodec>;

/// What every connection task needs from the hub
#[derive(Clone)]
struct Hub {
    registry: SessionRegistry,
    users: Arc<dyn UserDirectory>,
    config: Arc<ServerConfig>,
}

/// The session hub's listener
pub struct Server {
    listener: TcpListener,
    hub: Hub,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        users: Arc<dyn UserDirectory>,
        characters: Arc<dyn CharacterStore>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Session hub listening on {}", listener.local_addr()?);

        let config = Arc::new(config);
        Ok(Server {
            listener,
            hub: Hub {
                registry: SessionRegistry::new(Arc::clone(&config), characters),
                users,
                config,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.hub.registry.clone()
    }

    /// Accept loop. Each connection gets its own reader and writer task.
    pub async fn run(self) -> io::Result<()> {
        let mut next_connection_id: ConnectionId = 1;

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let connection_id = next_connection_id;
            next_connection_id += 1;
            debug!("Connection {} from {}", connection_id, peer);

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, connection_id, hub).await {
                    debug!("Connection {} ended with error: {}", connection_id, e);
                }
            });
        }
    }
}

/// Drives one client connection from handshake to close
async fn serve_connection(
    stream: TcpStream,
    connection_id: ConnectionId,
    hub: Hub,
) -> Result<(), CodecError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, ServerCodec::new());
    let writer = FramedWrite::new(write_half, ServerCodec::new());

    let (tx, outbound) = mpsc::unbounded_channel();
    let closer = CancellationToken::new();
    let writer_task = tokio::spawn(write_loop(writer, outbound, closer.clone()));
    let connection = ConnectionHandle::new(connection_id, tx, closer.clone());

    let result = match handshake(&mut reader, &connection, &hub).await {
        Ok((session, user_id)) => {
            info!(
                "Connection {} is {} in session {}",
                connection_id,
                user_id,
                session.id()
            );
            read_loop(&mut reader, &connection, &session, &user_id, &hub).await
        }
        Err(HandshakeError::Rejected(error)) => {
            warn!("Connection {} refused: {}", connection_id, error);
            connection.send(ServerMessage::Rejected {
                request_id: None,
                error,
            });
            Ok(())
        }
        Err(HandshakeError::Transport(e)) => Err(e),
        Err(HandshakeError::Closed) => Ok(()),
    };

    // the writer drains whatever is still queued before closing the socket
    drop(connection);
    closer.cancel();
    let _ = writer_task.await;
    result
}

enum HandshakeError {
    Rejected(SyncError),
    Transport(CodecError),
    Closed,
}

impl From<SyncError> for HandshakeError {
    fn from(error: SyncError) -> Self {
        HandshakeError::Rejected(error)
    }
}

/// Reads the `Hello`, authenticates and creates or joins a session.
///
/// On success the session has already queued the `Welcome` on `connection`.
async fn handshake(
    reader: &mut Reader,
    connection: &ConnectionHandle,
    hub: &Hub,
) -> Result<(SessionHandle, UserId), HandshakeError> {
    let frame = match timeout(hub.config.handshake_timeout, reader.next()).await {
        Ok(frame) => frame,
        Err(_) => return Err(SyncError::malformed("handshake timed out").into()),
    };

    let (protocol_version, handshake) = match frame {
        None => return Err(HandshakeError::Closed),
        Some(Err(e)) => return Err(HandshakeError::Transport(e)),
        Some(Ok(Err(error))) => return Err(error.into()),
        Some(Ok(Ok(ClientMessage::Hello {
            protocol_version,
            handshake,
        }))) => (protocol_version, handshake),
        Some(Ok(Ok(_))) => return Err(SyncError::malformed("expected Hello").into()),
    };

    if protocol_version != PROTOCOL_VERSION {
        return Err(SyncError::malformed(format!(
            "protocol version {} is not supported (expected {})",
            protocol_version, PROTOCOL_VERSION
        ))
        .into());
    }

    let identity = hub.users.authenticate(handshake.credentials())?;
    let user_id = identity.user_id.clone();

    let session = match handshake {
        Handshake::Create { game_id, name, .. } => {
            hub.registry
                .create_session(identity, game_id, name, connection.clone())
                .await?
        }
        Handshake::Join {
            session_id,
            character_id,
            ..
        } => {
            let (session, _role) = hub
                .registry
                .join_session(session_id, identity, character_id, connection.clone())
                .await?;
            session
        }
    };
    Ok((session, user_id))
}

/// Forwards client frames to the session until the client leaves, the
/// connection goes quiet or drops, or the session closes it
async fn read_loop(
    reader: &mut Reader,
    connection: &ConnectionHandle,
    session: &SessionHandle,
    user_id: &str,
    hub: &Hub,
) -> Result<(), CodecError> {
    let idle = hub.config.connection_idle_timeout;
    let closer = connection.closer();
    let mut outcome = Ok(());
    let mut left = false;

    loop {
        let frame = tokio::select! {
            _ = closer.cancelled() => {
                debug!("Connection {} closed by session {}", connection.id, session.id());
                break;
            }
            frame = timeout(idle, reader.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                info!("Connection {} of {} idle for {:?}", connection.id, user_id, idle);
                break;
            }
            Ok(None) => {
                debug!("Connection {} of {} closed by peer", connection.id, user_id);
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("Transport error on connection {}: {}", connection.id, e);
                outcome = Err(e);
                break;
            }
            Ok(Some(Ok(Err(error)))) => {
                warn!("Malformed frame from {}: {}", user_id, error);
                connection.send(ServerMessage::Rejected {
                    request_id: None,
                    error,
                });
                continue;
            }
            Ok(Some(Ok(Ok(message)))) => message,
        };

        let delivered = match message {
            ClientMessage::Intent { request_id, intent } => {
                debug!("Intent {} {:?} from {}", request_id, intent.kind(), user_id);
                session.intent(user_id.to_string(), connection.id, request_id, intent)
            }
            ClientMessage::Heartbeat => Ok(()),
            ClientMessage::Leave => {
                left = true;
                let _ = session.leave(user_id.to_string(), connection.id);
                break;
            }
            ClientMessage::Hello { .. } => {
                connection.send(ServerMessage::Rejected {
                    request_id: None,
                    error: SyncError::malformed("already joined"),
                });
                Ok(())
            }
        };

        if delivered.is_err() {
            debug!("Session {} is gone", session.id());
            break;
        }
    }

    if !left {
        let _ = session.connection_lost(user_id.to_string(), connection.id);
    }
    outcome
}

/// Writes queued messages in order. Once `closer` fires, flushes what is
/// already queued and shuts the socket.
async fn write_loop(
    mut writer: Writer,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    closer: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closer.cancelled() => break,
        };

        if let Err(e) = writer.send(message).await {
            debug!("Error writing frame: {}", e);
            return;
        }
    }

    if let Err(e) = SinkExt::<ServerMessage>::close(&mut writer).await {
        debug!("Error closing connection: {}", e);
    }
}
