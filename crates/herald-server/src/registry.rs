//! Connection registry actor.
//!
//! One task owns the map of live connections and performs every
//! persist-then-push decision. Producers talk to it through a cloneable
//! [`RegistryHandle`]; commands are processed strictly one at a time in
//! mailbox order, so replacement, eviction and dispatch never race.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use herald_core::codec::{InboundCommand, SendMessage};
use herald_core::directory::{ConversationDirectory, MessageStore, NewMessage};
use herald_core::ids::{ConnectionId, UserId};
use herald_core::{EventType, OutboundFrame};
use herald_store::EventLog;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is shut down")]
    Closed,
}

/// The registry's end of one live connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

/// The connection's end: frames to write, and a token cancelled when the
/// registry lets go of the connection.
pub struct Outbound {
    pub rx: mpsc::Receiver<String>,
    pub closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            closed: closed.clone(),
        };
        (handle, Outbound { rx, closed })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    // Dropping `tx` lets the writer drain what is queued and then send Close.
    fn close(self) {
        self.closed.cancel();
    }
}

/// One classified inbound command and who sent it.
#[derive(Debug, Clone)]
pub struct DispatchCommand {
    pub sender: UserId,
    pub command: InboundCommand,
}

enum RegistryCommand {
    Register {
        connection: ConnectionHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Dispatch(DispatchCommand),
    Publish {
        recipients: Vec<UserId>,
        event_type: EventType,
        payload: serde_json::Value,
    },
    ConnectionFor {
        user_id: UserId,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    async fn send(&self, cmd: RegistryCommand) -> Result<(), RegistryError> {
        self.tx.send(cmd).await.map_err(|_| RegistryError::Closed)
    }

    /// Make `connection` the live connection of its user, closing any
    /// previous one. Returns once the user is push-eligible.
    pub async fn register(&self, connection: ConnectionHandle) -> Result<(), RegistryError> {
        let (ack, done) = oneshot::channel();
        self.send(RegistryCommand::Register { connection, ack }).await?;
        done.await.map_err(|_| RegistryError::Closed)
    }

    /// Remove the connection if it is still the current one for `user_id`.
    pub async fn unregister(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Unregister {
            user_id,
            connection_id,
        })
        .await
    }

    pub async fn dispatch(
        &self,
        sender: UserId,
        command: InboundCommand,
    ) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Dispatch(DispatchCommand { sender, command }))
            .await
    }

    /// Persist one event per recipient and push to those connected.
    pub async fn publish(
        &self,
        recipients: Vec<UserId>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Publish {
            recipients,
            event_type,
            payload,
        })
        .await
    }

    pub async fn connection_for(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::ConnectionFor {
            user_id: user_id.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn connected_count(&self) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Count { reply }).await?;
        rx.await.map_err(|_| RegistryError::Closed)
    }
}

/// Collaborators the registry calls while dispatching.
#[derive(Clone)]
pub struct RegistryDeps {
    pub log: EventLog,
    pub conversations: Arc<dyn ConversationDirectory>,
    pub messages: Arc<dyn MessageStore>,
}

/// Start the actor. It runs until `shutdown` is cancelled or every handle is
/// dropped, and closes all live connections on the way out.
pub fn spawn(
    deps: RegistryDeps,
    mailbox_capacity: usize,
    shutdown: CancellationToken,
) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = Registry {
        connections: HashMap::new(),
        deps,
    };
    let task = tokio::spawn(actor.run(rx, shutdown));
    (RegistryHandle { tx }, task)
}

struct Registry {
    connections: HashMap<UserId, ConnectionHandle>,
    deps: RegistryDeps,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>, shutdown: CancellationToken) {
        loop {
            let cmd = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(cmd).await;
        }

        let live = self.connections.len();
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
        info!(closed = live, "registry stopped");
    }

    async fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register { connection, ack } => {
                self.register(connection);
                let _ = ack.send(());
            }
            RegistryCommand::Unregister {
                user_id,
                connection_id,
            } => self.unregister(&user_id, &connection_id),
            RegistryCommand::Dispatch(cmd) => self.dispatch(cmd).await,
            RegistryCommand::Publish {
                recipients,
                event_type,
                payload,
            } => self.deliver(&recipients, event_type, payload),
            RegistryCommand::ConnectionFor { user_id, reply } => {
                let _ = reply.send(self.connections.get(&user_id).map(|c| c.id.clone()));
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn register(&mut self, connection: ConnectionHandle) {
        let user_id = connection.user_id.clone();
        let connection_id = connection.id.clone();
        if let Some(previous) = self.connections.insert(user_id.clone(), connection) {
            info!(
                user_id = %user_id,
                connection_id = %previous.id,
                replaced_by = %connection_id,
                "closing superseded connection"
            );
            previous.close();
        }
        info!(user_id = %user_id, connection_id = %connection_id, "connection registered");
    }

    fn unregister(&mut self, user_id: &UserId, connection_id: &ConnectionId) {
        match self.connections.get(user_id) {
            Some(current) if &current.id == connection_id => {
                if let Some(conn) = self.connections.remove(user_id) {
                    conn.close();
                }
                info!(user_id = %user_id, connection_id = %connection_id, "connection unregistered");
            }
            _ => debug!(
                user_id = %user_id,
                connection_id = %connection_id,
                "ignoring unregister of superseded connection"
            ),
        }
    }

    async fn dispatch(&mut self, cmd: DispatchCommand) {
        let DispatchCommand { sender, command } = cmd;
        debug!(user_id = %sender, event_type = %command.event_type(), "dispatching");
        match command {
            InboundCommand::SendMessage(msg) => self.send_message(sender, msg).await,
            InboundCommand::Direct {
                event_type,
                recipient,
                payload,
            } => self.deliver(&[recipient], event_type, payload),
            InboundCommand::Originator {
                event_type,
                payload,
            } => self.deliver(&[sender], event_type, payload),
        }
    }

    async fn send_message(&mut self, sender: UserId, msg: SendMessage) {
        let conversation_id = msg.conversation_id;
        let participants = match self
            .deps
            .conversations
            .participant_ids(&conversation_id)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    user_id = %sender,
                    conversation_id = %conversation_id,
                    error = %e,
                    "participant lookup failed, dropping message"
                );
                return;
            }
        };
        if !participants.contains(&sender) {
            warn!(
                user_id = %sender,
                conversation_id = %conversation_id,
                "sender is not a participant, dropping message"
            );
            return;
        }

        let saved = match self
            .deps
            .messages
            .save_message(NewMessage {
                conversation_id: conversation_id.clone(),
                sender_id: sender.clone(),
                content: msg.content,
            })
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                warn!(
                    user_id = %sender,
                    conversation_id = %conversation_id,
                    error = %e,
                    "message save failed, dropping message"
                );
                return;
            }
        };

        match serde_json::to_value(&saved) {
            Ok(payload) => self.deliver(&participants, EventType::NewMessage, payload),
            Err(e) => error!(message_id = %saved.id, error = %e, "message payload encode failed"),
        }
    }

    /// Append one event per distinct recipient, then push the frame to that
    /// recipient if connected. A failed append is logged and skipped.
    fn deliver(&mut self, recipients: &[UserId], event_type: EventType, payload: serde_json::Value) {
        let frame = match OutboundFrame::new(event_type, payload.clone()).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "outbound frame encode failed");
                return;
            }
        };

        let mut seen = HashSet::with_capacity(recipients.len());
        for recipient in recipients {
            if !seen.insert(recipient) {
                continue;
            }
            if let Err(e) = self.deps.log.append(recipient, event_type, payload.clone()) {
                error!(
                    user_id = %recipient,
                    event_type = %event_type,
                    error = %e,
                    "event append failed"
                );
            }
            self.push(recipient, &frame);
        }
    }

    fn push(&mut self, user_id: &UserId, frame: &str) {
        let Some(conn) = self.connections.get(user_id) else {
            return;
        };
        let reason = match conn.tx.try_send(frame.to_owned()) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => "outbound queue full",
            Err(mpsc::error::TrySendError::Closed(_)) => "outbound queue closed",
        };
        if let Some(conn) = self.connections.remove(user_id) {
            warn!(user_id = %user_id, connection_id = %conn.id, reason, "evicting connection");
            conn.close();
        }
    }
}
