//! Client Protocol
//!
//! Request/response messages on the client stream. Every server message
//! carries the Lamport time it was produced at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::LamportTs;
use crate::coordinator::ClusterStatus;
use crate::state::{Member, SessionId};

/// Longest accepted display name
pub const MAX_NAME_LEN: usize = 32;

/// Longest accepted room name
pub const MAX_ROOM_LEN: usize = 64;

/// Longest accepted chat message
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Client-to-server requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Establish or resume a session
    Hello {
        display_name: String,
        /// Room to rejoin after a failover
        room: Option<String>,
    },
    CreateRoom { room: String },
    JoinRoom { room: String },
    LeaveRoom,
    ListRooms,
    Chat { text: String },
    WhereAmI,
    Ping,
    Status,
}

impl ClientRequest {
    /// Request name (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Hello { .. } => "Hello",
            ClientRequest::CreateRoom { .. } => "CreateRoom",
            ClientRequest::JoinRoom { .. } => "JoinRoom",
            ClientRequest::LeaveRoom => "LeaveRoom",
            ClientRequest::ListRooms => "ListRooms",
            ClientRequest::Chat { .. } => "Chat",
            ClientRequest::WhereAmI => "WhereAmI",
            ClientRequest::Ping => "Ping",
            ClientRequest::Status => "Status",
        }
    }
}

/// One row of a room listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

/// Server-to-client event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Session established
    Welcome {
        session_id: SessionId,
        /// Room the session was placed back into, if any
        room: Option<String>,
        server_id: String,
    },
    RoomJoined { room: String, created: bool },
    RoomLeft { room: String },
    RoomList { rooms: Vec<RoomSummary> },
    ChatMessage {
        room: String,
        sender: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
    /// Informational notice (joins, departures, location)
    Info { text: String },
    Pong,
    Error { message: String },
    /// This server does not lead; reconnect to the named member
    Redirect {
        leader_id: String,
        leader_host: String,
        leader_port: u16,
    },
    Status(ClusterStatus),
    /// No leader is known yet
    Unavailable { reason: String },
}

impl ServerEvent {
    /// Redirect pointing at a member's client port
    pub fn redirect_to(leader: &Member) -> Self {
        ServerEvent::Redirect {
            leader_id: leader.id.clone(),
            leader_host: leader.host.clone(),
            leader_port: leader.client_port,
        }
    }

    /// Whether the server closes the connection after sending this
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::Redirect { .. } | ServerEvent::Unavailable { .. }
        )
    }
}

/// A timestamped server event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub lamport_ts: LamportTs,
    pub event: ServerEvent,
}

/// Check a display name
pub fn validate_display_name(name: &str) -> Result<&str, String> {
    validate_label("display name", name, MAX_NAME_LEN)
}

/// Check a room name
pub fn validate_room_name(room: &str) -> Result<&str, String> {
    validate_label("room name", room, MAX_ROOM_LEN)
}

/// Check chat text
pub fn validate_message(text: &str) -> Result<&str, String> {
    if text.trim().is_empty() {
        return Err("message cannot be empty".to_string());
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(format!("message longer than {} characters", MAX_MESSAGE_LEN));
    }
    Ok(text)
}

fn validate_label<'a>(what: &str, value: &'a str, max: usize) -> Result<&'a str, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{} cannot be empty", what));
    }
    if value.chars().count() > max {
        return Err(format!("{} longer than {} characters", what, max));
    }
    if value.chars().any(char::is_control) {
        return Err(format!("{} contains control characters", what));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_validation() {
        assert_eq!(validate_display_name("  alice "), Ok("alice"));
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_room_name("bad\nroom").is_err());
        assert_eq!(validate_room_name("général"), Ok("général"));
    }

    #[test]
    fn test_message_validation() {
        assert!(validate_message("").is_err());
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_LEN)).is_ok());
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_LEN + 1)).is_err());
    }

    #[test]
    fn test_server_message_encoding() {
        let msg = ServerMessage {
            lamport_ts: 12,
            event: ServerEvent::ChatMessage {
                room: "general".to_string(),
                sender: "alice".to_string(),
                text: "hi".to_string(),
                sent_at: Utc::now(),
            },
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ServerMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_redirect_is_terminal() {
        let member = Member {
            id: "server3".to_string(),
            host: "10.0.0.3".to_string(),
            client_port: 8002,
            cluster_port: 8022,
            ring_position: 2,
        };
        let event = ServerEvent::redirect_to(&member);
        assert!(event.is_terminal());
        assert_eq!(
            event,
            ServerEvent::Redirect {
                leader_id: "server3".to_string(),
                leader_host: "10.0.0.3".to_string(),
                leader_port: 8002,
            }
        );
        assert!(!ServerEvent::Pong.is_terminal());
    }
}
