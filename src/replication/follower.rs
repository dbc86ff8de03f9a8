//! Follower-side replication
//!
//! Applies mutations from the believed leader to the local replica.

use std::sync::Arc;

use super::SharedState;
use crate::clock::LamportTs;
use crate::state::{Applied, ElectionEngine, StateOp};

/// What happened to an incoming mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Mutation took effect
    Applied,
    /// Not newer than the last applied mutation
    Duplicate { last_applied: LamportTs },
    /// Sender is not the believed leader
    RejectedStaleSender { sender: String, leader: Option<String> },
    /// This server leads; its own replica is authoritative
    IgnoredAsLeader { sender: String },
}

/// Receives replicated mutations while this server follows
pub struct ReplicationFollower {
    election: Arc<ElectionEngine>,
    state: SharedState,
}

impl ReplicationFollower {
    pub fn new(election: Arc<ElectionEngine>, state: SharedState) -> Self {
        Self { election, state }
    }

    /// Handle a replicated mutation from `sender` stamped `ts`
    pub async fn on_replicate(&self, sender: &str, ts: LamportTs, op: &StateOp) -> FollowOutcome {
        if self.election.is_self_leader() {
            tracing::warn!(
                "Ignoring {} at ts {} from {}: this server is leader",
                op.name(),
                ts,
                sender
            );
            return FollowOutcome::IgnoredAsLeader {
                sender: sender.to_string(),
            };
        }

        let leader = self.election.leader_id();
        if leader.as_deref() != Some(sender) {
            tracing::warn!(
                "Dropping {} at ts {} from {}: believed leader is {:?}",
                op.name(),
                ts,
                sender,
                leader
            );
            return FollowOutcome::RejectedStaleSender {
                sender: sender.to_string(),
                leader,
            };
        }

        match self.state.write().await.apply(ts, op) {
            Applied::Applied => {
                tracing::debug!("Applied {} at ts {} from {}", op.name(), ts, sender);
                FollowOutcome::Applied
            }
            Applied::Duplicate { last_applied } => {
                tracing::debug!(
                    "Duplicate {} at ts {} (last applied {})",
                    op.name(),
                    ts,
                    last_applied
                );
                FollowOutcome::Duplicate { last_applied }
            }
        }
    }
}
