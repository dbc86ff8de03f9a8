//! ChatSync - Fault-Tolerant Chat Cluster
//!
//! A small group of chat servers that agree on a single leader without
//! a voting protocol. Every server tracks which peers are alive through
//! heartbeats and independently picks the reachable member with the
//! highest ring position. Clients talk only to the leader; followers
//! redirect them, and the leader replicates room and user changes to the
//! followers so any of them can take over.
//!
//! # Architecture
//!
//! - [`state::HeartbeatMonitor`] owns the local reachability view
//! - [`state::ElectionEngine`] owns the believed leader
//! - [`replication`] pushes leader mutations to followers, best effort
//! - [`coordinator`] wires these together and serves chat clients
//! - [`failover::FailoverAgent`] finds the leader from the client side
//!
//! All cluster traffic shares one datagram port per member and is
//! stamped with a [`clock::LamportClock`] time.

pub mod config;
pub mod error;
pub mod clock;
pub mod state;
pub mod replication;
pub mod network;
pub mod chat;
pub mod coordinator;
pub mod failover;

pub use config::ChatSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ChatSyncConfig, ClusterTimings};
    pub use crate::error::{Error, Result};
    pub use crate::clock::{LamportClock, LamportTs};
    pub use crate::state::{ElectionEngine, HeartbeatMonitor, Member, Roster};
    pub use crate::replication::ClusterMessage;
    pub use crate::chat::{ClientRequest, ServerEvent, ServerMessage};
    pub use crate::coordinator::{start, ClusterCoordinator, ClusterStatus, CoordinatorHandle};
    pub use crate::failover::{FailoverAgent, SessionState};
}
