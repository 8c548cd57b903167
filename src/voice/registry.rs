//! # Connection Registry
//!
//! Tracks every live voice connection. Each client id maps to one [`ClientEntry`] that
//! bundles the outbound connection handle, the conversation session and the audio
//! buffer. The three are inserted together and removed together, so an id is either
//! fully present or fully absent.
//!
//! ## Thread Safety:
//! The map sits behind an `RwLock`. Lookups take the read lock and clone the `Arc`s they
//! need, so no lock is held while a connection awaits the model.

use crate::audio::AudioBuffer;
use crate::error::{AppError, AppResult};
use crate::voice::messages::ServerMessage;
use crate::voice::session::{ConversationSession, PersonaState};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound side of one WebSocket connection.
///
/// The actor owning the socket holds the receiving end; dropping every handle closes
/// the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::UnboundedSender<ServerMessage>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Create a handle together with the receiver the socket should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True once the socket side has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn deliver(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Everything the server holds for one connected client.
#[derive(Debug)]
pub struct ClientEntry {
    pub connection: ConnectionHandle,
    pub session: Arc<Mutex<ConversationSession>>,
    pub buffer: Arc<AudioBuffer>,
}

/// Summary of one live client, for the health endpoints.
#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub client_id: String,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    /// `None` while the session is busy with a turn
    pub persona_state: Option<PersonaState>,
    pub persona: Option<String>,
    pub message_count: Option<u64>,
}

pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ClientEntry>>,
    max_clients: usize,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
        }
    }

    /// Register a fresh session and empty buffer for `client_id`.
    ///
    /// An existing entry whose socket is already gone is replaced.
    ///
    /// ## Returns:
    /// - **Err(Conflict)**: the id already has a live connection
    /// - **Err(ServiceUnavailable)**: `max_clients` connections are already live
    pub fn connect(&self, client_id: &str, connection: ConnectionHandle) -> AppResult<()> {
        let mut clients = self.write();

        match clients.get(client_id) {
            Some(existing) if existing.connection.is_closed() => {
                warn!(
                    client_id = %client_id,
                    stale_connection_id = %existing.connection.id(),
                    "Replacing stale connection"
                );
                clients.remove(client_id);
            }
            Some(_) => {
                return Err(AppError::Conflict(format!("Client '{}' is already connected", client_id)));
            }
            None => {}
        }

        if clients.len() >= self.max_clients {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_clients
            )));
        }

        let connection_id = connection.id();
        clients.insert(
            client_id.to_string(),
            ClientEntry {
                connection,
                session: Arc::new(Mutex::new(ConversationSession::new(client_id))),
                buffer: Arc::new(AudioBuffer::new()),
            },
        );

        info!(client_id = %client_id, connection_id = %connection_id, active = clients.len(), "Client connected");
        Ok(())
    }

    /// Remove every resource for `client_id`. Unknown ids are a no-op.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let removed = self.write().remove(client_id);
        Self::log_removal(client_id, removed)
    }

    /// Like [`disconnect`](Self::disconnect), but only when the entry still belongs to
    /// `connection_id`. A closing socket must not tear down a newer connection that
    /// reused its client id.
    pub fn release(&self, client_id: &str, connection_id: Uuid) -> bool {
        let removed = {
            let mut clients = self.write();
            match clients.get(client_id) {
                Some(entry) if entry.connection.id() == connection_id => clients.remove(client_id),
                _ => None,
            }
        };
        Self::log_removal(client_id, removed)
    }

    /// Deliver a message to a client.
    ///
    /// Sending to a client that has already gone away is not an error: returns false.
    pub fn send(&self, client_id: &str, message: ServerMessage) -> bool {
        let clients = self.read();
        match clients.get(client_id) {
            Some(entry) => {
                let delivered = entry.connection.deliver(message);
                if !delivered {
                    debug!(client_id = %client_id, "Connection closed before message could be sent");
                }
                delivered
            }
            None => {
                debug!(client_id = %client_id, "Dropping message for disconnected client");
                false
            }
        }
    }

    pub fn get_session(&self, client_id: &str) -> Option<Arc<Mutex<ConversationSession>>> {
        self.read().get(client_id).map(|entry| entry.session.clone())
    }

    pub fn get_buffer(&self, client_id: &str) -> Option<Arc<AudioBuffer>> {
        self.read().get(client_id).map(|entry| entry.buffer.clone())
    }

    /// Append a fragment to the client's buffer. False when the client is unknown.
    pub fn append_audio(&self, client_id: &str, data: Vec<u8>) -> bool {
        match self.get_buffer(client_id) {
            Some(buffer) => {
                buffer.append(data);
                true
            }
            None => false,
        }
    }

    /// Flush the client's buffer. None when the client is unknown.
    pub fn flush_audio(&self, client_id: &str) -> Option<Vec<u8>> {
        self.get_buffer(client_id).map(|buffer| buffer.flush_and_clear())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.read().contains_key(client_id)
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn summaries(&self) -> Vec<ClientSummary> {
        self.read()
            .iter()
            .map(|(client_id, entry)| {
                let session = entry.session.try_lock().ok();
                ClientSummary {
                    client_id: client_id.clone(),
                    connection_id: entry.connection.id(),
                    connected_at: entry.connection.connected_at(),
                    buffered_chunks: entry.buffer.chunk_count(),
                    buffered_bytes: entry.buffer.len(),
                    persona_state: session.as_ref().map(|s| s.state()),
                    persona: session.as_ref().and_then(|s| s.persona().map(str::to_string)),
                    message_count: session.as_ref().map(|s| s.message_count()),
                }
            })
            .collect()
    }

    fn log_removal(client_id: &str, removed: Option<ClientEntry>) -> bool {
        match removed {
            Some(entry) => {
                let dropped = entry.buffer.len();
                entry.buffer.clear();
                if dropped > 0 {
                    warn!(client_id = %client_id, bytes = dropped, "Discarding unflushed audio on disconnect");
                }
                info!(client_id = %client_id, connection_id = %entry.connection.id(), "Client disconnected");
                true
            }
            None => false,
        }
    }

    // The map stays consistent even if a holder panicked: every mutation is a single
    // insert or remove.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}
