//! Leader-side replication
//!
//! Applies accepted mutations to the local replica and pushes them to
//! every other configured member.

use std::sync::Arc;

use super::{ClusterMessage, SharedState};
use crate::clock::{LamportClock, LamportTs};
use crate::network::{broadcast, DatagramSender};
use crate::state::{ElectionEngine, Roster, StateOp};
use crate::error::{Error, Result};

/// Originates replicated mutations while this server leads
pub struct ReplicationLeader {
    /// Static members
    roster: Arc<Roster>,
    /// Process clock
    clock: Arc<LamportClock>,
    /// Leadership view
    election: Arc<ElectionEngine>,
    /// Local replica
    state: SharedState,
    /// Outbound cluster channel
    sender: Arc<dyn DatagramSender>,
}

impl ReplicationLeader {
    pub fn new(
        roster: Arc<Roster>,
        clock: Arc<LamportClock>,
        election: Arc<ElectionEngine>,
        state: SharedState,
        sender: Arc<dyn DatagramSender>,
    ) -> Self {
        Self {
            roster,
            clock,
            election,
            state,
            sender,
        }
    }

    /// Apply a mutation locally and broadcast it.
    ///
    /// Fails with `NotLeader` unless this server currently believes it
    /// leads; a follower never originates a mutation. Returns the
    /// Lamport timestamp the mutation was stamped with.
    pub async fn publish(&self, op: StateOp) -> Result<LamportTs> {
        if !self.election.is_self_leader() {
            return Err(Error::NotLeader(
                self.election.leader_id().unwrap_or_default(),
            ));
        }

        // Hold the replica lock across stamp, apply and send so mutations
        // leave this server in timestamp order.
        let name = op.name();
        let mut state = self.state.write().await;
        let ts = self.clock.tick();
        state.apply(ts, &op);

        let message = ClusterMessage::Replicate {
            sender_id: self.roster.self_id().to_string(),
            lamport_ts: ts,
            op,
        };
        let peers = self.roster.peers();
        let delivered = broadcast(self.sender.as_ref(), &peers, &message).await;
        drop(state);

        tracing::debug!(
            "Replicated {} at ts {} to {}/{} peers",
            name,
            ts,
            delivered,
            peers.len()
        );
        Ok(ts)
    }
}
