//! State Management Module
//!
//! Cluster membership and reachability, leader election, heartbeat
//! liveness tracking and the replicated room directory.

pub mod membership;
pub mod election;
pub mod heartbeat;
pub mod replica;

pub use membership::{Member, Roster, PeerHealth, ReachabilityTable, Touch};
pub use election::{ElectionEngine, Leadership, SplitBrain, Transition};
pub use heartbeat::HeartbeatMonitor;
pub use replica::{Applied, ReplicatedState, SessionId, SessionRecord, StateOp};
