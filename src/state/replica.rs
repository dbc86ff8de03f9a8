//! Replicated Chat State
//!
//! The leader's authoritative room and user directory. Followers hold a
//! copy fed only by replication; every mutation is tagged with the
//! Lamport time it was originated at, and applying is idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use serde::{Deserialize, Serialize};

use crate::clock::LamportTs;

/// Session identifier assigned by the leader
pub type SessionId = String;

/// A replicated state mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateOp {
    /// Register a session's display name
    SetIdentity {
        session_id: SessionId,
        display_name: String,
    },
    /// Create a room and move its creator into it
    CreateRoom {
        room: String,
        session_id: SessionId,
    },
    /// Move a session into an existing room
    JoinRoom {
        room: String,
        session_id: SessionId,
    },
    /// Take a session out of its current room
    LeaveRoom {
        session_id: SessionId,
    },
    /// Forget a session entirely
    EndSession {
        session_id: SessionId,
    },
}

impl StateOp {
    /// Operation name (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            StateOp::SetIdentity { .. } => "SetIdentity",
            StateOp::CreateRoom { .. } => "CreateRoom",
            StateOp::JoinRoom { .. } => "JoinRoom",
            StateOp::LeaveRoom { .. } => "LeaveRoom",
            StateOp::EndSession { .. } => "EndSession",
        }
    }
}

/// Replicated view of one chat session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub display_name: String,
    pub room: Option<String>,
}

/// Outcome of applying a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Mutation was newer than anything applied and took effect
    Applied,
    /// Mutation was not newer than the last applied one and was skipped
    Duplicate { last_applied: LamportTs },
}

/// Room membership and user directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatedState {
    /// Room name -> sessions in it
    rooms: BTreeMap<String, BTreeSet<SessionId>>,
    /// Session id -> identity and location
    sessions: HashMap<SessionId, SessionRecord>,
    /// Timestamp of the newest applied mutation
    last_applied: LamportTs,
}

impl ReplicatedState {
    /// Create an empty replica
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a mutation stamped with `ts`.
    ///
    /// Anything not newer than the last applied timestamp is a duplicate
    /// and leaves the state untouched.
    pub fn apply(&mut self, ts: LamportTs, op: &StateOp) -> Applied {
        if ts <= self.last_applied {
            return Applied::Duplicate {
                last_applied: self.last_applied,
            };
        }
        self.mutate(op);
        self.last_applied = ts;
        Applied::Applied
    }

    fn mutate(&mut self, op: &StateOp) {
        match op {
            StateOp::SetIdentity {
                session_id,
                display_name,
            } => {
                self.sessions
                    .entry(session_id.clone())
                    .and_modify(|s| s.display_name = display_name.clone())
                    .or_insert_with(|| SessionRecord {
                        display_name: display_name.clone(),
                        room: None,
                    });
            }
            // A join may arrive for a room this replica never saw created;
            // both cases end with the session in the room.
            StateOp::CreateRoom { room, session_id } | StateOp::JoinRoom { room, session_id } => {
                self.remove_from_room(session_id);
                self.rooms
                    .entry(room.clone())
                    .or_default()
                    .insert(session_id.clone());
                self.sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| SessionRecord {
                        display_name: String::new(),
                        room: None,
                    })
                    .room = Some(room.clone());
            }
            StateOp::LeaveRoom { session_id } => {
                self.remove_from_room(session_id);
            }
            StateOp::EndSession { session_id } => {
                self.remove_from_room(session_id);
                self.sessions.remove(session_id);
            }
        }
    }

    fn remove_from_room(&mut self, session_id: &str) {
        let previous = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.room.take());
        if let Some(room) = previous {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(session_id);
            }
        }
    }

    /// Timestamp of the newest applied mutation
    pub fn last_applied(&self) -> LamportTs {
        self.last_applied
    }

    /// Check if a room exists
    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Room names in sorted order
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Number of rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Sessions currently in `room`
    pub fn room_members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replicated record of a session
    pub fn session(&self, session_id: &str) -> Option<&SessionRecord> {
        self.sessions.get(session_id)
    }

    /// Room a session is in
    pub fn room_of(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.room.as_deref())
    }

    /// Number of known sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of every known session
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }
}
