//! Leader Election
//!
//! Deterministic leader selection from the local reachability view.
//! The leader is the reachable member with the highest ring position;
//! each server evaluates this independently, with no vote exchange.
//!
//! During a partition two servers that see disjoint reachable sets will
//! each pick the best member they can see, so two servers may believe
//! they lead at once until views converge. That window is reported
//! through [`ElectionEngine::observe_claim`] and is not corrected.

use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::{LamportClock, LamportTs};
use crate::state::{Member, Roster};

/// Locally believed leadership
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Leadership {
    /// Believed leader, `None` until the first evaluation
    pub leader_id: Option<String>,
    /// Lamport time of the last evaluation
    pub computed_at: LamportTs,
}

/// A change in the locally computed leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub previous: Option<String>,
    pub current: String,
    pub at: LamportTs,
}

/// Disagreement between a peer's leadership claim and the local view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitBrain {
    /// A peer claims leadership while this server also leads
    DualLeaders { peer: String },
    /// A peer claims leadership while this server follows someone else
    DivergentView { peer: String, local_leader: String },
}

/// Election engine; the only writer of the leadership cell
pub struct ElectionEngine {
    /// Static members
    roster: Arc<Roster>,
    /// Process clock
    clock: Arc<LamportClock>,
    /// Leadership cell, readable without blocking
    leadership: watch::Sender<Leadership>,
    /// Last split-brain condition reported, to avoid repeating the warning
    last_split: Mutex<Option<SplitBrain>>,
}

impl ElectionEngine {
    /// Create an engine with no leader
    pub fn new(roster: Arc<Roster>, clock: Arc<LamportClock>) -> Self {
        let (leadership, _) = watch::channel(Leadership::default());
        Self {
            roster,
            clock,
            leadership,
            last_split: Mutex::new(None),
        }
    }

    /// Pick the leader among `reachable` members plus `self_id`.
    ///
    /// Highest ring position wins; the member id breaks ties, which a
    /// validated configuration never needs. Unknown ids are ignored.
    pub fn elect<'a, I, S>(roster: &'a Roster, self_id: &str, reachable: I) -> Option<&'a Member>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut candidates: Vec<&Member> = reachable
            .into_iter()
            .filter_map(|id| roster.get(id.as_ref()))
            .collect();
        if let Some(me) = roster.get(self_id) {
            candidates.push(me);
        }

        candidates.into_iter().max_by(|a, b| {
            a.ring_position
                .cmp(&b.ring_position)
                .then_with(|| b.id.cmp(&a.id))
        })
    }

    /// Re-evaluate leadership from a fresh reachable-peer set.
    ///
    /// Always refreshes `computed_at`; returns a transition only when the
    /// winning id changed.
    pub fn recompute(&self, reachable: &[String]) -> Option<Transition> {
        let winner = Self::elect(&self.roster, self.roster.self_id(), reachable)
            .map(|m| m.id.clone())?;
        let at = self.clock.now();

        let mut transition = None;
        self.leadership.send_if_modified(|state| {
            state.computed_at = at;
            if state.leader_id.as_deref() == Some(winner.as_str()) {
                return false;
            }
            transition = Some(Transition {
                previous: state.leader_id.replace(winner.clone()),
                current: winner.clone(),
                at,
            });
            true
        });

        if let Some(ref t) = transition {
            if t.current == self.roster.self_id() {
                tracing::info!(
                    "Leadership transition at ts {}: {:?} -> {} (this server is now LEADER)",
                    t.at,
                    t.previous,
                    t.current
                );
            } else {
                tracing::info!(
                    "Leadership transition at ts {}: {:?} -> {} (following)",
                    t.at,
                    t.previous,
                    t.current
                );
            }
            // A fresh transition invalidates any previously reported split
            if let Ok(mut last) = self.last_split.lock() {
                *last = None;
            }
        }

        transition
    }

    /// Snapshot of the leadership cell
    pub fn leadership(&self) -> Leadership {
        self.leadership.borrow().clone()
    }

    /// Currently believed leader id
    pub fn leader_id(&self) -> Option<String> {
        self.leadership.borrow().leader_id.clone()
    }

    /// Currently believed leader
    pub fn leader(&self) -> Option<Member> {
        let leadership = self.leadership.borrow();
        leadership
            .leader_id
            .as_deref()
            .and_then(|id| self.roster.get(id))
            .cloned()
    }

    /// Whether this server believes it leads
    pub fn is_self_leader(&self) -> bool {
        self.leadership.borrow().leader_id.as_deref() == Some(self.roster.self_id())
    }

    /// Watch leadership changes
    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.leadership.subscribe()
    }

    /// Compare a peer's leadership claim with the local view.
    ///
    /// Only a peer that names itself as leader is considered. The warning
    /// is logged once per distinct condition.
    pub fn observe_claim(&self, peer: &str, claimed_leader: Option<&str>) -> Option<SplitBrain> {
        if claimed_leader != Some(peer) {
            return None;
        }
        let local = self.leader_id()?;
        if local == peer {
            return None;
        }

        let split = if local == self.roster.self_id() {
            SplitBrain::DualLeaders {
                peer: peer.to_string(),
            }
        } else {
            SplitBrain::DivergentView {
                peer: peer.to_string(),
                local_leader: local,
            }
        };

        let first_report = match self.last_split.lock() {
            Ok(mut last) => {
                let fresh = last.as_ref() != Some(&split);
                *last = Some(split.clone());
                fresh
            }
            Err(_) => true,
        };

        if first_report {
            match &split {
                SplitBrain::DualLeaders { peer } => tracing::warn!(
                    "Split brain suspected: {} also claims leadership while this server leads",
                    peer
                ),
                SplitBrain::DivergentView { peer, local_leader } => tracing::warn!(
                    "Split brain suspected: {} claims leadership, local view follows {}",
                    peer,
                    local_leader
                ),
            }
        } else {
            tracing::debug!("Split brain persists: {:?}", split);
        }

        Some(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::membership::test_members;

    fn engine(self_id: &str, count: u16) -> ElectionEngine {
        let roster = Arc::new(Roster::new(self_id, test_members(count)).unwrap());
        ElectionEngine::new(roster, Arc::new(LamportClock::new()))
    }

    #[test]
    fn test_highest_reachable_ring_position_wins_for_every_subset() {
        let members = test_members(4);
        for self_idx in 0..4 {
            let roster = Roster::new(&members[self_idx].id, members.clone()).unwrap();
            for mask in 0u8..16 {
                let reachable: Vec<String> = (0..4)
                    .filter(|i| mask & (1 << i) != 0 && *i != self_idx)
                    .map(|i| members[i].id.clone())
                    .collect();

                let expected = members
                    .iter()
                    .filter(|m| m.id == members[self_idx].id || reachable.contains(&m.id))
                    .max_by_key(|m| m.ring_position)
                    .unwrap();

                let mut reversed = reachable.clone();
                reversed.reverse();

                let a = ElectionEngine::elect(&roster, roster.self_id(), &reachable).unwrap();
                let b = ElectionEngine::elect(&roster, roster.self_id(), &reversed).unwrap();
                assert_eq!(a.id, expected.id);
                assert_eq!(b.id, expected.id);
            }
        }
    }

    #[test]
    fn test_self_is_always_a_candidate() {
        let engine = engine("server2", 3);
        assert!(engine.recompute(&[]).is_some());
        assert!(engine.is_self_leader());
        assert_eq!(engine.leader().unwrap().id, "server2");
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let roster = Roster::new("server1", test_members(2)).unwrap();
        let winner = ElectionEngine::elect(&roster, "server1", ["mallory"]).unwrap();
        assert_eq!(winner.id, "server1");
    }

    #[test]
    fn test_transition_reported_only_on_change() {
        let engine = engine("server1", 3);
        let first = engine.recompute(&["server2".to_string()]).unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.current, "server2");

        assert!(engine.recompute(&["server2".to_string()]).is_none());

        let second = engine
            .recompute(&["server2".to_string(), "server3".to_string()])
            .unwrap();
        assert_eq!(second.previous.as_deref(), Some("server2"));
        assert_eq!(second.current, "server3");
        assert!(!engine.is_self_leader());
    }

    #[test]
    fn test_computed_at_refreshes_without_transition() {
        let engine = engine("server1", 2);
        engine.recompute(&[]);
        engine.clock.tick();
        engine.clock.tick();
        assert!(engine.recompute(&[]).is_none());
        assert_eq!(engine.leadership().computed_at, 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let engine = engine("server1", 3);
        let mut rx = engine.subscribe();
        engine.recompute(&["server3".to_string()]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().leader_id.as_deref(), Some("server3"));
    }

    #[test]
    fn test_split_brain_detection() {
        let engine = engine("server2", 3);
        engine.recompute(&[]);

        // Peer that does not claim itself is not a split
        assert!(engine.observe_claim("server1", Some("server2")).is_none());
        assert!(engine.observe_claim("server1", None).is_none());

        assert_eq!(
            engine.observe_claim("server1", Some("server1")),
            Some(SplitBrain::DualLeaders {
                peer: "server1".to_string()
            })
        );

        engine.recompute(&["server3".to_string()]);
        assert!(engine.observe_claim("server3", Some("server3")).is_none());
        assert_eq!(
            engine.observe_claim("server1", Some("server1")),
            Some(SplitBrain::DivergentView {
                peer: "server1".to_string(),
                local_leader: "server3".to_string(),
            })
        );
    }
}
