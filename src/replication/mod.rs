//! Replication Module
//!
//! Best-effort, leader-originated propagation of chat state mutations
//! over the cluster datagram channel. No acknowledgements, no retries,
//! no quorum.

pub mod protocol;
mod leader;
mod follower;

pub use protocol::{ClusterMessage, FrameHeader};
pub use leader::ReplicationLeader;
pub use follower::{FollowOutcome, ReplicationFollower};

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::state::ReplicatedState;

/// Replica shared by the replication halves and the chat layer
pub type SharedState = Arc<RwLock<ReplicatedState>>;
