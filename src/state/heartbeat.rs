//! Heartbeat Monitor
//!
//! Announces this server's liveness to every other member and keeps the
//! local reachability table. The monitor is the only writer of that
//! table; other tasks read it through the accessors below.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::clock::LamportClock;
use crate::network::{broadcast, DatagramSender};
use crate::replication::ClusterMessage;
use crate::state::{PeerHealth, ReachabilityTable, Roster, Touch};

/// Per-server liveness tracker
pub struct HeartbeatMonitor {
    /// Static members
    roster: Arc<Roster>,
    /// Process clock
    clock: Arc<LamportClock>,
    /// Outbound cluster channel
    sender: Arc<dyn DatagramSender>,
    /// Local reachability view
    table: RwLock<ReachabilityTable>,
}

impl HeartbeatMonitor {
    /// Create a monitor where every peer starts unreachable
    pub fn new(
        roster: Arc<Roster>,
        clock: Arc<LamportClock>,
        sender: Arc<dyn DatagramSender>,
        failure_threshold: Duration,
    ) -> Self {
        let table = ReachabilityTable::new(&roster, failure_threshold);
        Self {
            roster,
            clock,
            sender,
            table: RwLock::new(table),
        }
    }

    /// Broadcast a heartbeat to every other configured member.
    ///
    /// Advances the local clock; returns how many sends succeeded.
    pub async fn announce(&self, believed_leader: Option<String>) -> usize {
        let message = ClusterMessage::Heartbeat {
            sender_id: self.roster.self_id().to_string(),
            lamport_ts: self.clock.tick(),
            leader_id: believed_leader,
        };
        let peers = self.roster.peers();
        let delivered = broadcast(self.sender.as_ref(), &peers, &message).await;
        tracing::trace!("Heartbeat delivered to {}/{} peers", delivered, peers.len());
        delivered
    }

    /// Record any valid datagram as proof that its sender is alive.
    ///
    /// Merges the message timestamp into the local clock.
    pub async fn on_receive(&self, message: &ClusterMessage) -> Touch {
        let sender = message.sender_id();
        if sender == self.roster.self_id() || !self.roster.contains(sender) {
            tracing::debug!(
                "Ignoring {} from non-member {}",
                message.type_name(),
                sender
            );
            return Touch::Ignored;
        }

        self.clock.observe(message.lamport_ts());
        let touch = self.table.write().await.record(sender, Instant::now());
        if touch == Touch::Recovered {
            tracing::info!("Member {} is reachable", sender);
        }
        touch
    }

    /// Re-evaluate reachability; returns members that became unreachable
    pub async fn sweep(&self) -> Vec<String> {
        let lost = self.table.write().await.sweep(Instant::now());
        for id in &lost {
            tracing::info!("Member {} is unreachable (no heartbeat)", id);
        }
        lost
    }

    /// Reachable peers, self excluded
    pub async fn reachable_members(&self) -> Vec<String> {
        self.table.read().await.reachable_ids()
    }

    /// Check if a peer is reachable
    pub async fn is_reachable(&self, id: &str) -> bool {
        self.table.read().await.is_reachable(id)
    }

    /// Health record of a peer
    pub async fn peer_health(&self, id: &str) -> Option<PeerHealth> {
        self.table.read().await.get(id)
    }
}
