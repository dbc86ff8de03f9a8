//! Cluster Membership
//!
//! The static member list and the local reachability view built on top
//! of it. Every server keeps its own table; tables are never shared.

use std::collections::HashMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Identity of a configured cluster participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Unique member identifier
    pub id: String,
    /// Host name or IP address
    pub host: String,
    /// Port for chat client connections
    pub client_port: u16,
    /// Datagram port for heartbeat, election and replication traffic
    pub cluster_port: u16,
    /// Static rank; the highest reachable position leads
    pub ring_position: u32,
}

impl Member {
    /// Address chat clients connect to (host:port)
    pub fn client_address(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    /// Address cluster datagrams are sent to (host:port)
    pub fn cluster_address(&self) -> String {
        format!("{}:{}", self.host, self.cluster_port)
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} (ring {})", self.id, self.client_address(), self.ring_position)
    }
}

/// Immutable member list as seen from one server
#[derive(Debug, Clone)]
pub struct Roster {
    /// This server's ID
    self_id: String,
    /// Members ordered by descending ring position
    members: Vec<Member>,
}

impl Roster {
    /// Build a roster; `self_id` must name one of the members
    pub fn new(self_id: &str, mut members: Vec<Member>) -> Result<Self> {
        if !members.iter().any(|m| m.id == self_id) {
            return Err(Error::MemberNotFound(self_id.to_string()));
        }
        members.sort_by(|a, b| {
            b.ring_position
                .cmp(&a.ring_position)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(Self {
            self_id: self_id.to_string(),
            members,
        })
    }

    /// This server's ID
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// This server's member entry
    pub fn self_member(&self) -> &Member {
        self.members
            .iter()
            .find(|m| m.id == self.self_id)
            .unwrap_or(&self.members[0])
    }

    /// Look up a member
    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Check whether `id` is a configured member
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All members, highest ring position first
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// All members except this server, highest ring position first
    pub fn peers(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|m| m.id != self.self_id)
            .cloned()
            .collect()
    }

    /// Number of configured members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a validated roster
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Liveness record for one peer
#[derive(Debug, Clone, Copy)]
pub struct PeerHealth {
    /// When the most recent datagram from the peer arrived
    pub last_seen: Option<Instant>,
    /// Derived reachability, re-evaluated by `sweep`
    pub reachable: bool,
}

impl PeerHealth {
    fn unheard() -> Self {
        Self {
            last_seen: None,
            reachable: false,
        }
    }

    /// Time since the peer was last heard from
    pub fn silence(&self, now: Instant) -> Option<Duration> {
        self.last_seen.map(|t| now.saturating_duration_since(t))
    }
}

/// Result of recording a datagram from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// Sender is self or not a configured member
    Ignored,
    /// Peer was already reachable
    Refreshed,
    /// Peer transitioned from unreachable to reachable
    Recovered,
}

/// Local reachability view: member id -> last seen / reachable
#[derive(Debug)]
pub struct ReachabilityTable {
    /// This server's ID (never tracked)
    self_id: String,
    /// Silence after which a peer becomes unreachable
    failure_threshold: Duration,
    /// Every configured peer
    peers: HashMap<String, PeerHealth>,
}

impl ReachabilityTable {
    /// Create a table where every peer starts unreachable
    pub fn new(roster: &Roster, failure_threshold: Duration) -> Self {
        let peers = roster
            .peers()
            .into_iter()
            .map(|m| (m.id, PeerHealth::unheard()))
            .collect();

        Self {
            self_id: roster.self_id().to_string(),
            failure_threshold,
            peers,
        }
    }

    /// Record a datagram from `id` received at `at`.
    ///
    /// `last_seen` only ever moves forward, so duplicate or reordered
    /// deliveries are harmless.
    pub fn record(&mut self, id: &str, at: Instant) -> Touch {
        if id == self.self_id {
            return Touch::Ignored;
        }
        let Some(peer) = self.peers.get_mut(id) else {
            return Touch::Ignored;
        };

        peer.last_seen = Some(match peer.last_seen {
            Some(previous) if previous > at => previous,
            _ => at,
        });

        if peer.reachable {
            Touch::Refreshed
        } else {
            peer.reachable = true;
            Touch::Recovered
        }
    }

    /// Mark peers silent for longer than the threshold as unreachable.
    ///
    /// Returns the ids that transitioned to unreachable.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut lost = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let expired = match peer.silence(now) {
                Some(silence) => silence > self.failure_threshold,
                None => true,
            };
            if expired && peer.reachable {
                peer.reachable = false;
                lost.push(id.clone());
            }
        }
        lost.sort();
        lost
    }

    /// Check if a peer is currently reachable
    pub fn is_reachable(&self, id: &str) -> bool {
        self.peers.get(id).map(|p| p.reachable).unwrap_or(false)
    }

    /// IDs of reachable peers (self excluded), sorted
    pub fn reachable_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.reachable)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Health record for a peer
    pub fn get(&self, id: &str) -> Option<PeerHealth> {
        self.peers.get(id).copied()
    }

    /// Configured failure threshold
    pub fn failure_threshold(&self) -> Duration {
        self.failure_threshold
    }
}

#[cfg(test)]
pub(crate) fn test_members(count: u16) -> Vec<Member> {
    (0..count)
        .map(|i| Member {
            id: format!("server{}", i + 1),
            host: "127.0.0.1".to_string(),
            client_port: 18000 + i,
            cluster_port: 18100 + i,
            ring_position: u32::from(i),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_orders_by_ring_position() {
        let roster = Roster::new("server1", test_members(3)).unwrap();
        let order: Vec<_> = roster.members().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["server3", "server2", "server1"]);
        assert_eq!(roster.self_member().id, "server1");
        assert_eq!(roster.peers().len(), 2);
    }

    #[test]
    fn test_roster_requires_self() {
        assert!(matches!(
            Roster::new("ghost", test_members(3)),
            Err(Error::MemberNotFound(_))
        ));
    }

    #[test]
    fn test_never_heard_is_unreachable() {
        let roster = Roster::new("server1", test_members(3)).unwrap();
        let mut table = ReachabilityTable::new(&roster, Duration::from_secs(5));
        assert!(table.reachable_ids().is_empty());
        assert!(table.sweep(Instant::now()).is_empty());
        assert!(!table.is_reachable("server2"));
    }

    #[test]
    fn test_record_and_recover() {
        let roster = Roster::new("server1", test_members(3)).unwrap();
        let mut table = ReachabilityTable::new(&roster, Duration::from_secs(5));
        let now = Instant::now();

        assert_eq!(table.record("server2", now), Touch::Recovered);
        assert_eq!(table.record("server2", now), Touch::Refreshed);
        assert_eq!(table.record("server1", now), Touch::Ignored);
        assert_eq!(table.record("stranger", now), Touch::Ignored);
        assert_eq!(table.reachable_ids(), vec!["server2".to_string()]);
    }

    #[test]
    fn test_last_seen_only_moves_forward() {
        let roster = Roster::new("server1", test_members(2)).unwrap();
        let mut table = ReachabilityTable::new(&roster, Duration::from_secs(5));
        let later = Instant::now();
        let earlier = later - Duration::from_secs(3);

        table.record("server2", later);
        table.record("server2", earlier);
        assert_eq!(table.get("server2").unwrap().last_seen, Some(later));
    }

    #[test]
    fn test_sweep_marks_silent_peers() {
        let roster = Roster::new("server1", test_members(3)).unwrap();
        let mut table = ReachabilityTable::new(&roster, Duration::from_secs(5));
        let start = Instant::now();

        table.record("server2", start);
        table.record("server3", start + Duration::from_secs(4));

        assert!(table.sweep(start + Duration::from_secs(5)).is_empty());
        assert_eq!(
            table.sweep(start + Duration::from_secs(6)),
            vec!["server2".to_string()]
        );
        // Already unreachable peers are not reported twice
        assert!(table.sweep(start + Duration::from_secs(7)).is_empty());
        assert_eq!(table.reachable_ids(), vec!["server3".to_string()]);
    }
}
