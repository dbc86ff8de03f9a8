//! Cluster Coordinator
//!
//! Per-process façade wiring the heartbeat monitor, election engine,
//! replication halves and chat service together. [`start`] binds the
//! configured ports and drives the periodic loops for the life of the
//! process; [`CoordinatorHandle::shutdown`] stops all of them.
//!
//! A fresh coordinator holds no leader until its first evaluation, one
//! heartbeat interval after start, so every running peer has had a
//! chance to announce itself. Hearing from the top-ranked member settles
//! it earlier, since that member wins whenever it is reachable. Clients
//! connecting before settling are told the cluster is unavailable and
//! retry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::chat::{serve_connection, ChatService, ServerEvent};
use crate::clock::{LamportClock, LamportTs};
use crate::config::{ChatSyncConfig, ClusterTimings};
use crate::network::{bind_datagram, broadcast, ClientServer, DatagramReceiver, DatagramSender};
use crate::replication::{
    ClusterMessage, FollowOutcome, ReplicationFollower, ReplicationLeader, SharedState,
};
use crate::state::{
    ElectionEngine, HeartbeatMonitor, Member, ReplicatedState, Roster, Touch, Transition,
};
use crate::error::Result;

/// Snapshot of one server's coordination view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub server_id: String,
    pub ring_position: u32,
    pub leader_id: Option<String>,
    pub is_leader: bool,
    /// Reachable peers, self excluded
    pub reachable: Vec<String>,
    pub lamport_time: LamportTs,
    pub rooms: usize,
    pub sessions: usize,
    pub live_sessions: usize,
    pub last_applied: LamportTs,
}

/// Coordination core of one server
pub struct ClusterCoordinator {
    /// Static members
    roster: Arc<Roster>,
    /// Resolved tunables
    timings: ClusterTimings,
    /// Process clock
    clock: Arc<LamportClock>,
    /// Reachability owner
    heartbeat: HeartbeatMonitor,
    /// Leadership owner
    election: Arc<ElectionEngine>,
    /// Local replica
    state: SharedState,
    /// Follower half of replication
    follower: ReplicationFollower,
    /// Leader-side chat semantics
    chat: ChatService,
    /// Outbound cluster channel
    sender: Arc<dyn DatagramSender>,
    /// Set once the first evaluation has run
    settled: AtomicBool,
    /// Serializes reading reachability with writing leadership
    evaluation: Mutex<()>,
}

impl ClusterCoordinator {
    /// Wire up a coordinator for `roster.self_id()`
    pub fn new(roster: Roster, timings: ClusterTimings, sender: Arc<dyn DatagramSender>) -> Self {
        let roster = Arc::new(roster);
        let clock = Arc::new(LamportClock::new());
        let state: SharedState = Arc::new(RwLock::new(ReplicatedState::new()));

        let heartbeat = HeartbeatMonitor::new(
            Arc::clone(&roster),
            Arc::clone(&clock),
            Arc::clone(&sender),
            timings.failure_threshold,
        );
        let election = Arc::new(ElectionEngine::new(Arc::clone(&roster), Arc::clone(&clock)));
        let leader = Arc::new(ReplicationLeader::new(
            Arc::clone(&roster),
            Arc::clone(&clock),
            Arc::clone(&election),
            Arc::clone(&state),
            Arc::clone(&sender),
        ));
        let follower = ReplicationFollower::new(Arc::clone(&election), Arc::clone(&state));
        let chat = ChatService::new(
            roster.self_id().to_string(),
            Arc::clone(&clock),
            leader,
            Arc::clone(&state),
        );

        Self {
            roster,
            timings,
            clock,
            heartbeat,
            election,
            state,
            follower,
            chat,
            sender,
            settled: AtomicBool::new(false),
            evaluation: Mutex::new(()),
        }
    }

    /// This server's ID
    pub fn self_id(&self) -> &str {
        self.roster.self_id()
    }

    /// Static members
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Resolved tunables
    pub fn timings(&self) -> ClusterTimings {
        self.timings
    }

    /// Process clock
    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Leadership owner
    pub fn election(&self) -> &ElectionEngine {
        &self.election
    }

    /// Chat service
    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    /// Currently believed leader; no I/O
    pub fn current_leader(&self) -> Option<Member> {
        self.election.leader()
    }

    /// Whether this server believes it leads; no I/O
    pub fn is_self_leader(&self) -> bool {
        self.election.is_self_leader()
    }

    /// Whether the first evaluation has run
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Where a client talking to this server should go instead
    pub fn redirect_event(&self) -> ServerEvent {
        match self.current_leader() {
            Some(leader) if leader.id != self.self_id() => ServerEvent::redirect_to(&leader),
            Some(_) => ServerEvent::Unavailable {
                reason: "leadership is changing".to_string(),
            },
            None => ServerEvent::Unavailable {
                reason: "no leader elected yet".to_string(),
            },
        }
    }

    /// Snapshot of the local coordination view
    pub async fn status(&self) -> ClusterStatus {
        let reachable = self.heartbeat.reachable_members().await;
        let (rooms, sessions, last_applied) = {
            let state = self.state.read().await;
            (state.room_count(), state.session_count(), state.last_applied())
        };
        let leadership = self.election.leadership();

        ClusterStatus {
            server_id: self.self_id().to_string(),
            ring_position: self.roster.self_member().ring_position,
            is_leader: leadership.leader_id.as_deref() == Some(self.self_id()),
            leader_id: leadership.leader_id,
            reachable,
            lamport_time: self.clock.now(),
            rooms,
            sessions,
            live_sessions: self.chat.live_sessions().await,
            last_applied,
        }
    }

    /// Send one heartbeat round
    pub async fn announce(&self) -> usize {
        self.heartbeat.announce(self.election.leader_id()).await
    }

    /// Process one cluster datagram
    pub async fn handle_datagram(&self, message: ClusterMessage) {
        let touch = self.heartbeat.on_receive(&message).await;
        if touch == Touch::Ignored {
            return;
        }
        if touch == Touch::Recovered && (self.is_settled() || self.settle_if_decided().await) {
            self.recompute().await;
        }

        match message {
            ClusterMessage::Heartbeat {
                sender_id,
                leader_id,
                ..
            } => {
                self.election.observe_claim(&sender_id, leader_id.as_deref());
            }
            ClusterMessage::LeaderAnnounce { sender_id, lamport_ts } => {
                tracing::debug!("{} announced leadership at ts {}", sender_id, lamport_ts);
                self.election.observe_claim(&sender_id, Some(&sender_id));
            }
            ClusterMessage::Replicate {
                sender_id,
                lamport_ts,
                op,
            } => {
                if let FollowOutcome::IgnoredAsLeader { sender } =
                    self.follower.on_replicate(&sender_id, lamport_ts, &op).await
                {
                    self.election.observe_claim(&sender, Some(&sender));
                }
            }
        }
    }

    /// Re-evaluate reachability, then leadership.
    ///
    /// The first call settles the coordinator.
    pub async fn sweep_and_recompute(&self) -> Option<Transition> {
        self.heartbeat.sweep().await;
        if !self.settled.swap(true, Ordering::AcqRel) {
            tracing::info!("Initial reachability settled, evaluating leadership");
        }
        self.recompute().await
    }

    /// Settle before the first sweep when the outcome is already fixed.
    ///
    /// That is the case once the top-ranked member is reachable, or is
    /// this server. Returns true if this call settled the coordinator.
    pub async fn settle_if_decided(&self) -> bool {
        if self.is_settled() {
            return false;
        }
        let decided = match self.roster.members().first() {
            Some(top) if top.id == self.self_id() => true,
            Some(top) => self.heartbeat.is_reachable(&top.id).await,
            None => false,
        };
        if decided && !self.settled.swap(true, Ordering::AcqRel) {
            tracing::info!("Top-ranked member known, evaluating leadership early");
            return true;
        }
        false
    }

    async fn recompute(&self) -> Option<Transition> {
        let transition = {
            let _evaluation = self.evaluation.lock().await;
            let reachable = self.heartbeat.reachable_members().await;
            self.election.recompute(&reachable)?
        };

        if transition.current == self.self_id() {
            let message = ClusterMessage::LeaderAnnounce {
                sender_id: self.self_id().to_string(),
                lamport_ts: self.clock.tick(),
            };
            broadcast(self.sender.as_ref(), &self.roster.peers(), &message).await;
            self.chat.end_orphaned_sessions().await;
        }
        Some(transition)
    }
}

/// Handle to a running server
pub struct CoordinatorHandle {
    coordinator: Arc<ClusterCoordinator>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    client_addr: SocketAddr,
    cluster_addr: SocketAddr,
}

impl CoordinatorHandle {
    /// The running coordinator
    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    /// Bound client port address
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Bound cluster port address
    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// Token cancelled on shutdown
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every loop and connection, then wait for them
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down {}", self.coordinator.self_id());
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Task ended abnormally: {}", e);
            }
        }
        tracing::info!("{} stopped", self.coordinator.self_id());
    }
}

/// Start the server identified by `self_id`.
///
/// Binds the member's cluster and client ports on all interfaces and
/// spawns the announce, sweep, receive and accept loops.
pub async fn start(config: &ChatSyncConfig, self_id: &str) -> Result<CoordinatorHandle> {
    config.validate()?;
    let roster = config.roster(self_id)?;
    let me = roster.self_member().clone();
    let timings = config.timings();
    let cancel = CancellationToken::new();

    let (sender, receiver) = bind_datagram(&format!("0.0.0.0:{}", me.cluster_port)).await?;
    let cluster_addr = sender.local_addr()?;
    let server = ClientServer::bind(&format!("0.0.0.0:{}", me.client_port), cancel.clone()).await?;
    let client_addr = server.local_addr()?;

    let coordinator = Arc::new(ClusterCoordinator::new(roster, timings, Arc::new(sender)));
    tracing::info!(
        "Starting {} (ring position {}, {} members)",
        me.id,
        me.ring_position,
        coordinator.roster().len()
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(announce_loop(Arc::clone(&coordinator), cancel.clone()));
    tasks.spawn(sweep_loop(Arc::clone(&coordinator), cancel.clone()));
    tasks.spawn(receive_loop(Arc::clone(&coordinator), receiver, cancel.clone()));

    let accept_coordinator = Arc::clone(&coordinator);
    tasks.spawn(async move {
        let result = server
            .run(move |stream, peer, token| {
                serve_connection(stream, peer, Arc::clone(&accept_coordinator), token)
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Client server failed: {}", e);
        }
    });

    Ok(CoordinatorHandle {
        coordinator,
        cancel,
        tasks,
        client_addr,
        cluster_addr,
    })
}

async fn announce_loop(coordinator: Arc<ClusterCoordinator>, cancel: CancellationToken) {
    let mut ticker = interval(coordinator.timings().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                coordinator.announce().await;
            }
        }
    }
    tracing::debug!("Announce loop stopped");
}

async fn sweep_loop(coordinator: Arc<ClusterCoordinator>, cancel: CancellationToken) {
    let timings = coordinator.timings();

    if coordinator.settle_if_decided().await {
        coordinator.recompute().await;
    }

    // Let every running peer announce once before the first evaluation
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(timings.heartbeat_interval) => {}
    }

    let mut ticker = interval(timings.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                coordinator.sweep_and_recompute().await;
            }
        }
    }
    tracing::debug!("Sweep loop stopped");
}

async fn receive_loop<R: DatagramReceiver>(
    coordinator: Arc<ClusterCoordinator>,
    mut receiver: R,
    cancel: CancellationToken,
) {
    let limit = coordinator.timings().receive_timeout;
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = timeout(limit, receiver.recv()) => received,
        };
        match received {
            Ok(Ok(message)) => coordinator.handle_datagram(message).await,
            Ok(Err(e)) => {
                tracing::warn!("Cluster receive error: {}", e);
                if e.is_fatal() {
                    break;
                }
                // Pause so a persistent socket fault does not spin
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(limit) => {}
                }
            }
            // Quiet period; loop to re-check cancellation
            Err(_) => {}
        }
    }
    tracing::debug!("Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Outbox, RoomSummary};
    use crate::error::Error;
    use crate::network::datagram::loopback::{LoopbackNetwork, LoopbackReceiver};
    use crate::state::membership::test_members;
    use crate::state::SplitBrain;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    fn timings() -> ClusterTimings {
        ClusterTimings {
            heartbeat_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(500),
            failure_threshold: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(3),
            receive_timeout: Duration::from_secs(1),
            client_idle_timeout: Duration::from_secs(30),
            failover_backoff: Duration::from_secs(2),
        }
    }

    fn outbox() -> Outbox {
        Outbox::new(16, CancellationToken::new()).0
    }

    /// Coordinators on a loopback network, driven by hand
    struct Cluster {
        net: LoopbackNetwork,
        members: Vec<Member>,
        nodes: Vec<(Arc<ClusterCoordinator>, LoopbackReceiver)>,
    }

    impl Cluster {
        fn new(count: u16) -> Self {
            let net = LoopbackNetwork::new();
            let members = test_members(count);
            let nodes = members
                .iter()
                .map(|m| Self::boot(&net, &members, &m.id))
                .collect();
            Self {
                net,
                members,
                nodes,
            }
        }

        fn boot(
            net: &LoopbackNetwork,
            members: &[Member],
            id: &str,
        ) -> (Arc<ClusterCoordinator>, LoopbackReceiver) {
            let (tx, rx) = net.attach(id);
            let roster = Roster::new(id, members.to_vec()).unwrap();
            (
                Arc::new(ClusterCoordinator::new(roster, timings(), Arc::new(tx))),
                rx,
            )
        }

        /// Replace node `i` with a fresh process
        fn restart(&mut self, i: usize) {
            let id = self.members[i].id.clone();
            self.nodes[i] = Self::boot(&self.net, &self.members, &id);
        }

        fn node(&self, i: usize) -> &ClusterCoordinator {
            &self.nodes[i].0
        }

        /// One heartbeat round among `alive`, then deliver everything
        async fn round(&mut self, alive: &[usize]) {
            for &i in alive {
                self.nodes[i].0.announce().await;
            }
            self.deliver(alive).await;
        }

        async fn deliver(&mut self, alive: &[usize]) {
            for (i, (node, rx)) in self.nodes.iter_mut().enumerate() {
                let pending = rx.drain();
                if alive.contains(&i) {
                    for message in pending {
                        node.handle_datagram(message).await;
                    }
                }
            }
        }

        async fn sweep(&self, alive: &[usize]) {
            for &i in alive {
                self.nodes[i].0.sweep_and_recompute().await;
            }
        }

        fn leaders(&self, alive: &[usize]) -> Vec<Option<String>> {
            alive
                .iter()
                .map(|&i| self.node(i).election().leader_id())
                .collect()
        }
    }

    fn some(id: &str) -> Option<String> {
        Some(id.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_node_failover_and_recovery() {
        let mut cluster = Cluster::new(3);
        let all = [0, 1, 2];

        assert!(cluster.node(0).current_leader().is_none());
        cluster.round(&all).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cluster.round(&all).await;
        cluster.sweep(&all).await;
        assert_eq!(cluster.leaders(&all), vec![some("server3"); 3]);
        assert!(cluster.node(2).is_self_leader());

        // server3 dies; the survivors keep announcing
        let survivors = [0, 1];
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(2)).await;
            cluster.round(&survivors).await;
            cluster.sweep(&survivors).await;
        }
        assert_eq!(cluster.leaders(&survivors), vec![some("server2"); 2]);
        assert!(cluster.node(1).is_self_leader());

        // server3 returns: one heartbeat is enough
        cluster.round(&all).await;
        assert_eq!(cluster.leaders(&survivors), vec![some("server3"); 2]);
        assert!(!cluster.node(1).is_self_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_member_excluded_from_first_evaluation() {
        let mut cluster = Cluster::new(3);
        let present = [0, 1];

        cluster.round(&present).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cluster.sweep(&present).await;
        assert_eq!(cluster.leaders(&present), vec![some("server2"); 2]);

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(2)).await;
            cluster.round(&present).await;
            cluster.sweep(&present).await;
            assert_eq!(cluster.leaders(&present), vec![some("server2"); 2]);
        }
        assert_eq!(
            cluster.node(1).status().await.reachable,
            vec!["server1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_recompute_before_settling() {
        let mut cluster = Cluster::new(3);
        // The top-ranked member is absent, so nothing decides early
        cluster.round(&[0, 1]).await;
        assert!(!cluster.node(0).is_settled());
        assert!(cluster.node(0).current_leader().is_none());
        assert!(matches!(
            cluster.node(0).redirect_event(),
            ServerEvent::Unavailable { .. }
        ));

        cluster.sweep(&[0]).await;
        assert!(cluster.node(0).is_settled());
        assert_eq!(
            cluster.node(0).redirect_event(),
            ServerEvent::redirect_to(&test_members(3)[1])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_member_heartbeat_settles_early() {
        let mut cluster = Cluster::new(3);
        cluster.round(&[0, 2]).await;

        // No sweep has run anywhere
        assert!(cluster.node(0).is_settled());
        assert_eq!(cluster.node(0).election().leader_id(), some("server3"));
        assert!(cluster.node(2).is_self_leader());
        assert!(!cluster.node(1).is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_top_member_leads_within_one_heartbeat() {
        let mut cluster = Cluster::new(3);
        let all = [0, 1, 2];
        let survivors = [0, 1];
        cluster.round(&all).await;
        cluster.sweep(&all).await;

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(2)).await;
            cluster.round(&survivors).await;
            cluster.sweep(&survivors).await;
        }
        assert_eq!(cluster.leaders(&survivors), vec![some("server2"); 2]);

        cluster.restart(2);
        let started = Instant::now();
        assert!(cluster.node(2).current_leader().is_none());

        // What the sweep loop does before its first sleep
        assert!(cluster.node(2).settle_if_decided().await);
        cluster.node(2).recompute().await;
        assert!(cluster.node(2).is_self_leader());

        // Its first heartbeat brings the survivors back
        cluster.round(&all).await;
        assert_eq!(cluster.leaders(&all), vec![some("server3"); 3]);
        assert!(started.elapsed() < timings().heartbeat_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_ends_sessions_of_dead_leader() {
        let mut cluster = Cluster::new(3);
        let all = [0, 1, 2];
        cluster.round(&all).await;
        cluster.sweep(&all).await;
        cluster.deliver(&all).await;

        cluster
            .node(2)
            .chat()
            .open_session("alice", Some("general"), outbox())
            .await
            .unwrap();
        cluster.deliver(&all).await;
        assert_eq!(cluster.node(1).status().await.sessions, 1);

        // server3 dies with alice's connection
        let survivors = [0, 1];
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(2)).await;
            cluster.round(&survivors).await;
            cluster.sweep(&survivors).await;
        }
        cluster.deliver(&survivors).await;
        assert!(cluster.node(1).is_self_leader());

        for i in survivors {
            let status = cluster.node(i).status().await;
            assert_eq!(status.sessions, 0, "{} kept a dead session", status.server_id);
            assert_eq!(status.rooms, 1);
        }
        assert_eq!(
            cluster.node(1).chat().list_rooms().await.event,
            ServerEvent::RoomList {
                rooms: vec![RoomSummary {
                    name: "general".to_string(),
                    members: 0
                }]
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluations_match_final_reachability() {
        let net = LoopbackNetwork::new();
        let (tx, _rx) = net.attach("server1");
        let roster = Roster::new("server1", test_members(3)).unwrap();
        // Peers drop out between almost every pair of heartbeats
        let flaky = ClusterTimings {
            failure_threshold: Duration::from_millis(1),
            ..timings()
        };
        let node = Arc::new(ClusterCoordinator::new(roster, flaky, Arc::new(tx)));
        node.sweep_and_recompute().await;

        let mut workers = JoinSet::new();
        for worker in 0..4u64 {
            let node = Arc::clone(&node);
            workers.spawn(async move {
                for i in 0..200u64 {
                    if (i + worker) % 2 == 0 {
                        node.handle_datagram(ClusterMessage::Heartbeat {
                            sender_id: "server3".to_string(),
                            lamport_ts: i,
                            leader_id: None,
                        })
                        .await;
                    } else {
                        node.sweep_and_recompute().await;
                    }
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }

        let reachable = node.heartbeat.reachable_members().await;
        let expected = ElectionEngine::elect(node.roster(), node.self_id(), &reachable)
            .map(|m| m.id.clone());
        assert_eq!(node.election().leader_id(), expected);
    }

    struct BrokenSocket {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DatagramReceiver for BrokenSocket {
        async fn recv(&mut self) -> Result<ClusterMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "socket broken",
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_back_off() {
        let cluster = Cluster::new(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let receiver = BrokenSocket {
            calls: Arc::clone(&calls),
        };
        let task = tokio::spawn(receive_loop(
            Arc::clone(&cluster.nodes[0].0),
            receiver,
            cancel.clone(),
        ));

        // receive_timeout is one second
        sleep(Duration::from_millis(10_500)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert!((10..=12).contains(&seen), "{} receive attempts", seen);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_reaches_followers() {
        let mut cluster = Cluster::new(3);
        let all = [0, 1, 2];
        cluster.round(&all).await;
        cluster.sweep(&all).await;
        // LeaderAnnounce from server3
        cluster.deliver(&all).await;

        let (session, _) = cluster
            .node(2)
            .chat()
            .open_session("alice", Some("general"), outbox())
            .await
            .unwrap();
        cluster.deliver(&all).await;

        for i in 0..2 {
            let status = cluster.node(i).status().await;
            assert_eq!(status.rooms, 1);
            assert_eq!(status.sessions, 1);
            assert_eq!(status.last_applied, cluster.node(2).status().await.last_applied);
        }

        // A follower must not originate mutations
        let err = cluster.node(0).chat().create_room(&session, "random").await;
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_brain_is_reported_not_corrected() {
        let mut cluster = Cluster::new(3);
        // server3 cannot hear server2 and vice versa
        cluster.net.cut("server2", "server3");
        cluster.net.cut("server3", "server2");

        let all = [0, 1, 2];
        cluster.round(&all).await;
        cluster.sweep(&all).await;
        cluster.deliver(&all).await;
        assert_eq!(cluster.node(1).election().leader_id(), some("server2"));
        assert_eq!(cluster.node(2).election().leader_id(), some("server3"));

        // Replication from server3 reaches server1 only
        cluster
            .node(2)
            .chat()
            .open_session("bob", None, outbox())
            .await
            .unwrap();
        cluster.deliver(&all).await;
        assert_eq!(cluster.node(0).status().await.sessions, 1);
        assert_eq!(cluster.node(1).status().await.sessions, 0);

        // Views stay split until the link heals
        cluster.round(&all).await;
        cluster.sweep(&all).await;
        assert!(cluster.node(1).is_self_leader());
        assert!(cluster.node(2).is_self_leader());
        assert_eq!(
            cluster.node(1).election().observe_claim("server3", Some("server3")),
            Some(SplitBrain::DualLeaders {
                peer: "server3".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_single_member_leads_itself() {
        let cluster = Cluster::new(1);
        cluster.node(0).sweep_and_recompute().await;
        assert!(cluster.node(0).is_self_leader());
        cluster
            .node(0)
            .chat()
            .open_session("solo", None, outbox())
            .await
            .unwrap();
        let status = cluster.node(0).status().await;
        assert_eq!(status.sessions, 1);
        assert!(status.is_leader);
        assert!(status.reachable.is_empty());
    }
}
