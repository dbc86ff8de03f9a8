//! Client Failover Agent
//!
//! Finds the current leader for a chat client and carries the client's
//! display name and room across reconnects. Candidates are tried in
//! ring order, highest position first, with a redirect target jumping
//! the queue. Between full sweeps the agent backs off with jitter.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use rand::Rng;

use crate::chat::{ClientRequest, ServerEvent, ServerMessage};
use crate::config::ClusterTimings;
use crate::network::ChatConnection;
use crate::state::Member;
use crate::error::{Error, Result};

/// Client-visible session state preserved across reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub display_name: String,
    pub room: Option<String>,
    /// Session id assigned by the current leader
    pub session_id: Option<String>,
    /// Server that issued the session
    pub server_id: Option<String>,
}

impl SessionState {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            room: None,
            session_id: None,
            server_id: None,
        }
    }

    /// Greeting that resumes this session on a new leader
    pub fn hello(&self) -> ClientRequest {
        ClientRequest::Hello {
            display_name: self.display_name.clone(),
            room: self.room.clone(),
        }
    }

    /// Track room and session changes from server events
    pub fn on_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::Welcome {
                session_id,
                room,
                server_id,
            } => {
                self.session_id = Some(session_id.clone());
                self.server_id = Some(server_id.clone());
                self.room = room.clone();
            }
            ServerEvent::RoomJoined { room, .. } => self.room = Some(room.clone()),
            ServerEvent::RoomLeft { .. } => self.room = None,
            _ => {}
        }
    }
}

/// Result of trying one candidate
enum Attempt {
    Established(ChatConnection, ServerMessage),
    Redirected(Member),
}

/// Leader discovery and reconnection for one client
pub struct FailoverAgent {
    /// Known members, highest ring position first
    members: Vec<Member>,
    /// Resolved tunables
    timings: ClusterTimings,
    /// Member to try first on the next connect
    preferred: Option<Member>,
    /// Member currently connected to
    current: Option<String>,
    /// Give up after this many full sweeps
    max_sweeps: Option<usize>,
}

impl FailoverAgent {
    pub fn new(mut members: Vec<Member>, timings: ClusterTimings) -> Self {
        members.sort_by(|a, b| b.ring_position.cmp(&a.ring_position));
        Self {
            members,
            timings,
            preferred: None,
            current: None,
            max_sweeps: None,
        }
    }

    /// Stop after `sweeps` full passes without a leader
    pub fn with_max_sweeps(mut self, sweeps: usize) -> Self {
        self.max_sweeps = Some(sweeps);
        self
    }

    /// Member currently connected to
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// How often an idle client should ping
    pub fn keepalive_interval(&self) -> Duration {
        self.timings.client_idle_timeout / 3
    }

    /// Remember where a redirect points; returns false for other events
    pub fn note_redirect(&mut self, event: &ServerEvent) -> bool {
        match self.redirect_target(event) {
            Some(target) => {
                tracing::info!("Redirected to {}", target);
                self.preferred = Some(target);
                true
            }
            None => false,
        }
    }

    /// Forget the current connection after it failed
    pub fn connection_lost(&mut self) {
        if let Some(id) = self.current.take() {
            tracing::warn!("Lost connection to {}", id);
        }
    }

    /// Order of candidates for the next sweep
    pub fn candidates(&self) -> Vec<Member> {
        let mut order: Vec<Member> = self.preferred.iter().cloned().collect();
        for member in &self.members {
            if !order.iter().any(|m| m.id == member.id) {
                order.push(member.clone());
            }
        }
        order
    }

    /// Connect to the leader and resume `session`.
    ///
    /// Returns the connection and the server's welcome. Retryable
    /// failures move on to the next candidate; a rejected greeting is
    /// returned immediately.
    pub async fn connect(&mut self, session: &SessionState) -> Result<(ChatConnection, ServerMessage)> {
        self.current = None;
        let mut sweeps = 0usize;

        loop {
            let mut queue: VecDeque<Member> = self.candidates().into();
            let mut tried = HashSet::new();

            while let Some(candidate) = queue.pop_front() {
                if !tried.insert(candidate.id.clone()) {
                    continue;
                }
                match self.attempt(&candidate, session).await {
                    Ok(Attempt::Established(conn, welcome)) => {
                        tracing::info!("Connected to leader {}", candidate);
                        self.preferred = None;
                        self.current = Some(candidate.id);
                        return Ok((conn, welcome));
                    }
                    Ok(Attempt::Redirected(target)) => {
                        tracing::debug!("{} redirected to {}", candidate.id, target.id);
                        queue.push_front(target);
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::debug!("{} unavailable: {}", candidate.id, e);
                    }
                    Err(e) => return Err(e),
                }
            }

            sweeps += 1;
            self.preferred = None;
            if self.max_sweeps.is_some_and(|max| sweeps >= max) {
                return Err(Error::NoLeader);
            }

            let delay = self.backoff();
            tracing::warn!(
                "No leader found after sweep {}, retrying in {:?}",
                sweeps,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, candidate: &Member, session: &SessionState) -> Result<Attempt> {
        let limit = self.timings.connect_timeout;
        let mut conn = ChatConnection::open(candidate, limit).await?;
        let reply = conn.request(&session.hello(), limit).await?;

        if let Some(target) = self.redirect_target(&reply.event) {
            return Ok(Attempt::Redirected(target));
        }
        match reply.event {
            ServerEvent::Welcome { .. } => Ok(Attempt::Established(conn, reply)),
            ServerEvent::Unavailable { reason } => {
                tracing::debug!("{} has no leader: {}", candidate.id, reason);
                Err(Error::NoLeader)
            }
            ServerEvent::Error { message } => Err(Error::Rejected(message)),
            other => Err(Error::Protocol(format!(
                "unexpected reply to Hello: {:?}",
                other
            ))),
        }
    }

    fn redirect_target(&self, event: &ServerEvent) -> Option<Member> {
        let ServerEvent::Redirect {
            leader_id,
            leader_host,
            leader_port,
        } = event
        else {
            return None;
        };
        let known = self.members.iter().find(|m| &m.id == leader_id).cloned();
        Some(known.unwrap_or_else(|| Member {
            id: leader_id.clone(),
            host: leader_host.clone(),
            client_port: *leader_port,
            cluster_port: 0,
            ring_position: 0,
        }))
    }

    fn backoff(&self) -> Duration {
        let base = self.timings.failover_backoff;
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}
