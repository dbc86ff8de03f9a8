//! Chat Service
//!
//! Leader-side chat semantics on top of the replicated room directory.
//! Room and identity changes go through the replication leader; chat
//! text is only fanned out to live sessions on this server.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{
    validate_display_name, validate_message, validate_room_name, RoomSummary, ServerEvent,
    ServerMessage,
};
use crate::clock::{LamportClock, LamportTs};
use crate::replication::{ReplicationLeader, SharedState};
use crate::state::{SessionId, StateOp};
use crate::error::{Error, Result};

/// Messages a connection may have queued before it counts as stalled
pub const OUTBOX_CAPACITY: usize = 256;

/// Delivery queue of one client connection.
///
/// Bounded: a client that stops reading until the queue is full gets its
/// `overflow` token cancelled and is disconnected.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::Sender<ServerMessage>,
    overflow: CancellationToken,
}

impl Outbox {
    /// Create a queue of `capacity` messages; `overflow` fires when it fills
    pub fn new(
        capacity: usize,
        overflow: CancellationToken,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, overflow }, receiver)
    }

    /// Queue a message without waiting.
    ///
    /// Returns false when the connection is gone or has fallen too far
    /// behind.
    pub fn push(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the queue filled up and the connection should be dropped
    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }
}

/// A session with an open connection on this server
struct LiveSession {
    display_name: String,
    outbox: Outbox,
}

/// Chat request semantics for the leader
pub struct ChatService {
    /// This server's ID
    server_id: String,
    /// Process clock
    clock: Arc<LamportClock>,
    /// Mutation originator
    leader: Arc<ReplicationLeader>,
    /// Local replica
    state: SharedState,
    /// Sessions connected here
    live: RwLock<HashMap<SessionId, LiveSession>>,
}

impl ChatService {
    pub fn new(
        server_id: String,
        clock: Arc<LamportClock>,
        leader: Arc<ReplicationLeader>,
        state: SharedState,
    ) -> Self {
        Self {
            server_id,
            clock,
            leader,
            state,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Stamp an event with a fresh Lamport time
    pub fn stamp(&self, event: ServerEvent) -> ServerMessage {
        ServerMessage {
            lamport_ts: self.clock.tick(),
            event,
        }
    }

    /// Open a session for `display_name`, rejoining `room` if given.
    ///
    /// The room is recreated when this replica never saw it, which covers
    /// mutations lost in a leader transition.
    pub async fn open_session(
        &self,
        display_name: &str,
        room: Option<&str>,
        outbox: Outbox,
    ) -> Result<(SessionId, Vec<ServerMessage>)> {
        let display_name = validate_display_name(display_name).map_err(Error::Rejected)?;
        let room = room
            .map(|r| validate_room_name(r).map_err(Error::Rejected))
            .transpose()?;

        let session_id = Uuid::new_v4().to_string();
        let (ts, joined) = match self.establish(&session_id, display_name, room).await {
            Ok(published) => published,
            Err(e) => {
                self.discard(&session_id).await;
                return Err(e);
            }
        };

        self.live.write().await.insert(
            session_id.clone(),
            LiveSession {
                display_name: display_name.to_string(),
                outbox,
            },
        );
        tracing::info!("Session {} opened for {}", session_id, display_name);

        let mut replies = vec![ServerMessage {
            lamport_ts: ts,
            event: ServerEvent::Welcome {
                session_id: session_id.clone(),
                room: room.map(str::to_string),
                server_id: self.server_id.clone(),
            },
        }];
        if let (Some(room), Some(ts)) = (room, joined) {
            self.notify_room(room, &session_id, &format!("{} rejoined", display_name))
                .await;
            replies.push(ServerMessage {
                lamport_ts: ts,
                event: ServerEvent::RoomJoined {
                    room: room.to_string(),
                    created: false,
                },
            });
        }
        Ok((session_id, replies))
    }

    /// Publish the identity and optional room of a new session
    async fn establish(
        &self,
        session_id: &str,
        display_name: &str,
        room: Option<&str>,
    ) -> Result<(LamportTs, Option<LamportTs>)> {
        let ts = self
            .leader
            .publish(StateOp::SetIdentity {
                session_id: session_id.to_string(),
                display_name: display_name.to_string(),
            })
            .await?;

        let joined = match room {
            Some(room) => Some(
                self.leader
                    .publish(StateOp::JoinRoom {
                        room: room.to_string(),
                        session_id: session_id.to_string(),
                    })
                    .await?,
            ),
            None => None,
        };
        Ok((ts, joined))
    }

    /// Best-effort removal of a half-opened session from the replica.
    ///
    /// Fails quietly when leadership moved; the next leader ends it as an
    /// orphan.
    async fn discard(&self, session_id: &str) {
        if self.state.read().await.session(session_id).is_none() {
            return;
        }
        if let Err(e) = self
            .leader
            .publish(StateOp::EndSession {
                session_id: session_id.to_string(),
            })
            .await
        {
            tracing::debug!("Half-opened session {} left in replica: {}", session_id, e);
        }
    }

    /// Create a room and move the creator into it
    pub async fn create_room(&self, session_id: &str, room: &str) -> Result<ServerMessage> {
        let room = validate_room_name(room).map_err(Error::Rejected)?;
        if self.state.read().await.has_room(room) {
            return Err(Error::Rejected(format!("room '{}' already exists", room)));
        }
        self.move_to(session_id, room, true).await
    }

    /// Move a session into an existing room
    pub async fn join_room(&self, session_id: &str, room: &str) -> Result<ServerMessage> {
        let room = validate_room_name(room).map_err(Error::Rejected)?;
        let current = {
            let state = self.state.read().await;
            if !state.has_room(room) {
                return Err(Error::Rejected(format!("no room named '{}'", room)));
            }
            state.room_of(session_id).map(str::to_string)
        };
        if current.as_deref() == Some(room) {
            return Err(Error::Rejected(format!("already in '{}'", room)));
        }
        self.move_to(session_id, room, false).await
    }

    async fn move_to(&self, session_id: &str, room: &str, create: bool) -> Result<ServerMessage> {
        let name = self.display_name(session_id).await;
        let previous = self.room_of(session_id).await;

        let op = if create {
            StateOp::CreateRoom {
                room: room.to_string(),
                session_id: session_id.to_string(),
            }
        } else {
            StateOp::JoinRoom {
                room: room.to_string(),
                session_id: session_id.to_string(),
            }
        };
        let ts = self.leader.publish(op).await?;

        if let Some(previous) = previous {
            self.notify_room(&previous, session_id, &format!("{} left", name))
                .await;
        }
        self.notify_room(room, session_id, &format!("{} joined", name))
            .await;

        Ok(ServerMessage {
            lamport_ts: ts,
            event: ServerEvent::RoomJoined {
                room: room.to_string(),
                created: create,
            },
        })
    }

    /// Take a session out of its room
    pub async fn leave_room(&self, session_id: &str) -> Result<ServerMessage> {
        let room = self
            .room_of(session_id)
            .await
            .ok_or_else(|| Error::Rejected("not in a room".into()))?;
        let ts = self
            .leader
            .publish(StateOp::LeaveRoom {
                session_id: session_id.to_string(),
            })
            .await?;

        let name = self.display_name(session_id).await;
        self.notify_room(&room, session_id, &format!("{} left", name))
            .await;

        Ok(ServerMessage {
            lamport_ts: ts,
            event: ServerEvent::RoomLeft { room },
        })
    }

    /// All rooms with their member counts
    pub async fn list_rooms(&self) -> ServerMessage {
        let rooms = {
            let state = self.state.read().await;
            state
                .rooms()
                .into_iter()
                .map(|name| {
                    let members = state.room_members(&name).len();
                    RoomSummary { name, members }
                })
                .collect()
        };
        self.stamp(ServerEvent::RoomList { rooms })
    }

    /// Deliver chat text to every live session in the sender's room.
    ///
    /// The sender receives its own message through its outbox as well.
    /// Returns the number of deliveries.
    pub async fn chat(&self, session_id: &str, text: &str) -> Result<usize> {
        let text = validate_message(text).map_err(Error::Rejected)?;
        let (room, members) = {
            let state = self.state.read().await;
            let room = state
                .room_of(session_id)
                .ok_or_else(|| Error::Rejected("join a room first".into()))?
                .to_string();
            let members = state.room_members(&room);
            (room, members)
        };

        let live = self.live.read().await;
        let sender = live
            .get(session_id)
            .map(|s| s.display_name.clone())
            .unwrap_or_default();
        let message = self.stamp(ServerEvent::ChatMessage {
            room,
            sender,
            text: text.to_string(),
            sent_at: Utc::now(),
        });

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for member in &members {
            if let Some(session) = live.get(member) {
                if session.outbox.push(message.clone()) {
                    delivered += 1;
                } else if session.outbox.is_overflowed() {
                    stalled.push(member.clone());
                }
            }
        }
        drop(live);

        self.evict(stalled).await;
        Ok(delivered)
    }

    /// Describe where a session is
    pub async fn where_am_i(&self, session_id: &str) -> ServerMessage {
        let text = match self.room_of(session_id).await {
            Some(room) => format!("in room '{}' on {}", room, self.server_id),
            None => format!("not in a room, connected to {}", self.server_id),
        };
        self.stamp(ServerEvent::Info { text })
    }

    /// Drop a session whose connection ended.
    ///
    /// The replicated record is only removed while this server leads;
    /// after a failover the client resumes with a fresh session.
    pub async fn end_session(&self, session_id: &str) -> Option<LamportTs> {
        let removed = self.live.write().await.remove(session_id);
        let room = self.room_of(session_id).await;

        let ts = match self
            .leader
            .publish(StateOp::EndSession {
                session_id: session_id.to_string(),
            })
            .await
        {
            Ok(ts) => Some(ts),
            Err(e) => {
                tracing::debug!("Session {} not ended in replica: {}", session_id, e);
                None
            }
        };

        if let (Some(session), Some(room)) = (removed, room) {
            self.notify_room(&room, session_id, &format!("{} disconnected", session.display_name))
                .await;
        }
        tracing::info!("Session {} closed", session_id);
        ts
    }

    /// End replicated sessions that have no connection here.
    ///
    /// Run when this server takes over leadership: sessions owned by the
    /// previous leader lost their connections with it, and their clients
    /// come back with fresh sessions. Returns how many were ended.
    pub async fn end_orphaned_sessions(&self) -> usize {
        let orphans: Vec<SessionId> = {
            let state = self.state.read().await;
            let live = self.live.read().await;
            state
                .session_ids()
                .into_iter()
                .filter(|id| !live.contains_key(id))
                .collect()
        };

        let mut ended = 0;
        for session_id in orphans {
            match self
                .leader
                .publish(StateOp::EndSession { session_id })
                .await
            {
                Ok(_) => ended += 1,
                Err(e) => {
                    tracing::debug!("Stopped ending orphaned sessions: {}", e);
                    break;
                }
            }
        }
        if ended > 0 {
            tracing::info!("Ended {} sessions left by the previous leader", ended);
        }
        ended
    }

    /// Number of sessions connected to this server
    pub async fn live_sessions(&self) -> usize {
        self.live.read().await.len()
    }

    /// Stop delivering to sessions whose outbox overflowed.
    ///
    /// Their connections notice the cancelled overflow token, close, and
    /// end the replicated session.
    async fn evict(&self, stalled: Vec<SessionId>) {
        if stalled.is_empty() {
            return;
        }
        let mut live = self.live.write().await;
        for session_id in stalled {
            if live.remove(&session_id).is_some() {
                tracing::warn!("Session {} is not reading, disconnecting it", session_id);
            }
        }
    }

    async fn room_of(&self, session_id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .room_of(session_id)
            .map(str::to_string)
    }

    async fn display_name(&self, session_id: &str) -> String {
        self.live
            .read()
            .await
            .get(session_id)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| "someone".to_string())
    }

    /// Send a notice to everyone in `room` except `except`
    async fn notify_room(&self, room: &str, except: &str, text: &str) {
        let members = self.state.read().await.room_members(room);
        let live = self.live.read().await;
        let notice = self.stamp(ServerEvent::Info {
            text: text.to_string(),
        });
        let mut stalled = Vec::new();
        for member in members.iter().filter(|m| m.as_str() != except) {
            if let Some(session) = live.get(member) {
                if !session.outbox.push(notice.clone()) && session.outbox.is_overflowed() {
                    stalled.push(member.clone());
                }
            }
        }
        drop(live);

        self.evict(stalled).await;
    }
}
