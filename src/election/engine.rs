//! Election state machine
//!
//! The engine is synchronous: every input returns the announcements that
//! must go out, and the async [`super::ElectionCoordinator`] delivers them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::round::{ElectionRound, RoundKey};
use crate::state::{Epoch, MembershipTable, NodeId, NodeState, StatePublisher, StateReader};

/// Election engine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// No leader known and no round running
    Idle,
    /// Leader failure confirmed, about to start a round
    Detecting,
    /// Collecting announcements
    Electing,
    /// Resolved with ourselves as leader
    ElectedLeader,
    /// Resolved with another node as leader
    ElectedReplica,
}

/// An announcement the engine wants delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub to: NodeId,
    pub epoch: Epoch,
    pub initiator: NodeId,
}

/// Election state machine for one node
pub struct ElectionEngine {
    node_id: NodeId,
    peers: Vec<NodeId>,
    epoch: Epoch,
    phase: ElectionPhase,
    round: Option<ElectionRound>,
    /// Key standing in for a round we did not take part in
    settled: Option<RoundKey>,
    state: StatePublisher,
}

impl ElectionEngine {
    /// Create an idle engine; publishes a pending state
    pub fn new(node_id: NodeId, membership: &MembershipTable, state: StatePublisher) -> Self {
        state.publish(NodeState::pending(node_id, 0));
        Self {
            node_id,
            peers: membership.peers_of(node_id),
            epoch: 0,
            phase: ElectionPhase::Idle,
            round: None,
            settled: None,
            state,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Current round, if any
    pub fn round(&self) -> Option<&ElectionRound> {
        self.round.as_ref()
    }

    /// Recognized leader
    pub fn leader(&self) -> Option<NodeId> {
        self.state.current().leader
    }

    /// Reader over the published node state
    pub fn reader(&self) -> StateReader {
        self.state.reader()
    }

    /// Start life as the leader (bootstrap hint)
    pub fn bootstrap_as_leader(&mut self) {
        tracing::info!("Node {} bootstrapping as LEADER", self.node_id);
        self.phase = ElectionPhase::ElectedLeader;
        self.round = None;
        self.settled = Some(RoundKey {
            epoch: self.epoch,
            initiator: self.node_id,
        });
        self.state
            .publish(NodeState::resolved(self.node_id, self.epoch, self.node_id));
    }

    /// Adopt a leader learned from a peer at startup
    pub fn adopt_leader(&mut self, leader: NodeId, epoch: Epoch) {
        if self.phase == ElectionPhase::Electing || epoch < self.epoch {
            return;
        }
        if leader != self.node_id && !self.peers.contains(&leader) {
            tracing::debug!("Ignoring unknown leader {}", leader);
            return;
        }

        self.epoch = epoch;
        self.phase = self.elected_phase(leader);
        self.round = None;
        // The leader was the highest participant of whatever round chose it
        self.settled = Some(RoundKey {
            epoch,
            initiator: leader,
        });
        self.state
            .publish(NodeState::resolved(self.node_id, epoch, leader));
        tracing::info!("Following leader {} at epoch {}", leader, epoch);
    }

    /// Begin a fresh round with a new epoch
    pub fn start_election(&mut self, dead: &BTreeSet<NodeId>) -> Vec<Announcement> {
        self.phase = ElectionPhase::Detecting;
        self.epoch += 1;
        tracing::info!(
            "Node {} starting election for epoch {}",
            self.node_id,
            self.epoch
        );

        let key = RoundKey {
            epoch: self.epoch,
            initiator: self.node_id,
        };
        self.begin_round(key, dead, None)
    }

    /// The failure detector confirmed `leader` is dead
    pub fn on_leader_lost(&mut self, leader: NodeId, dead: &BTreeSet<NodeId>) -> Vec<Announcement> {
        match self.phase {
            ElectionPhase::Electing | ElectionPhase::Detecting => {
                // The running round already covers it
                self.on_peer_down(leader);
                Vec::new()
            }
            _ if self.leader() == Some(leader) && leader != self.node_id => {
                tracing::warn!("Leader {} lost at epoch {}", leader, self.epoch);
                self.start_election(dead)
            }
            _ => {
                tracing::debug!("Ignoring loss of {}, not the current leader", leader);
                Vec::new()
            }
        }
    }

    /// The failure detector confirmed a peer is dead
    pub fn on_peer_down(&mut self, id: NodeId) {
        if self.phase != ElectionPhase::Electing {
            return;
        }
        let node_id = self.node_id;
        if let Some(round) = self.round.as_mut() {
            if round.mark_dead(id, node_id) {
                tracing::debug!("Round {}: peer {} confirmed dead", round.key(), id);
            }
        }
        self.try_resolve();
    }

    /// Handle an announcement for the round `(epoch, initiator)`
    pub fn on_announce(
        &mut self,
        from: NodeId,
        epoch: Epoch,
        initiator: NodeId,
        dead: &BTreeSet<NodeId>,
    ) -> Vec<Announcement> {
        if !self.peers.contains(&from) {
            tracing::debug!("Dropping announcement from unknown node {}", from);
            return Vec::new();
        }

        let key = RoundKey { epoch, initiator };
        let current = self.current_key();
        let ordering = match current {
            Some(current) => key.cmp(&current),
            None if epoch < self.epoch => Ordering::Less,
            None => Ordering::Greater,
        };

        match ordering {
            Ordering::Less => {
                tracing::trace!("Dropping stale announcement {} from {}", key, from);
                // The sender may never hear our round otherwise
                current
                    .map(|current| Announcement {
                        to: from,
                        epoch: current.epoch,
                        initiator: current.initiator,
                    })
                    .into_iter()
                    .collect()
            }
            Ordering::Greater => {
                tracing::debug!("Adopting round {} announced by {}", key, from);
                self.epoch = epoch;
                self.begin_round(key, dead, Some(from))
            }
            Ordering::Equal => self.join(from),
        }
    }

    /// Resolve the running round with whatever was gathered
    pub fn on_collection_timeout(&mut self) {
        if self.phase != ElectionPhase::Electing {
            return;
        }
        if let Some(round) = self.round.as_ref() {
            tracing::warn!(
                "Round {} timed out with participants {:?}",
                round.key(),
                round.participants()
            );
        }
        self.resolve();
    }

    /// When the running round gives up waiting
    pub fn collection_deadline(&self, timeout: Duration) -> Option<Instant> {
        if self.phase != ElectionPhase::Electing {
            return None;
        }
        self.round.as_ref().map(|r| r.last_change() + timeout)
    }

    /// Key of the running or last resolved round
    fn current_key(&self) -> Option<RoundKey> {
        self.round.as_ref().map(|r| r.key()).or(self.settled)
    }

    fn begin_round(
        &mut self,
        key: RoundKey,
        dead: &BTreeSet<NodeId>,
        heard_from: Option<NodeId>,
    ) -> Vec<Announcement> {
        self.phase = ElectionPhase::Electing;
        self.state.publish(NodeState::pending(self.node_id, key.epoch));

        let mut round = ElectionRound::new(key, self.node_id);
        for &peer in &self.peers {
            if dead.contains(&peer) && Some(peer) != heard_from {
                round.mark_dead(peer, self.node_id);
            }
        }
        if let Some(from) = heard_from {
            round.heard_from(from);
        }

        let mut out = Vec::new();
        for &peer in &self.peers {
            if !round.confirmed_dead().contains(&peer) {
                round.mark_announced(peer);
                out.push(Announcement {
                    to: peer,
                    epoch: key.epoch,
                    initiator: key.initiator,
                });
            }
        }

        self.round = Some(round);
        if out.is_empty() {
            tracing::info!("Node {} has no live peers, electing itself", self.node_id);
        }
        self.try_resolve();
        out
    }

    fn join(&mut self, from: NodeId) -> Vec<Announcement> {
        let Some(round) = self.round.as_mut() else {
            return Vec::new();
        };

        let added = round.heard_from(from);
        let mut out = Vec::new();
        if round.mark_announced(from) {
            out.push(Announcement {
                to: from,
                epoch: round.key().epoch,
                initiator: round.key().initiator,
            });
        }

        match self.phase {
            ElectionPhase::Electing => self.try_resolve(),
            ElectionPhase::ElectedLeader | ElectionPhase::ElectedReplica if added => {
                tracing::debug!("Late participant {} joined resolved round", from);
                self.resolve();
            }
            _ => {}
        }
        out
    }

    fn try_resolve(&mut self) {
        if self.phase != ElectionPhase::Electing {
            return;
        }
        let complete = self
            .round
            .as_ref()
            .is_some_and(|r| r.is_complete(&self.peers));
        if complete {
            self.resolve();
        }
    }

    fn resolve(&mut self) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let leader = round.highest_participant().unwrap_or(self.node_id);
        let previous = round.resolved();
        round.set_resolved(leader);
        let key = round.key();

        self.phase = self.elected_phase(leader);
        self.state
            .publish(NodeState::resolved(self.node_id, key.epoch, leader));

        if previous != Some(leader) {
            tracing::info!(
                "Round {} resolved: leader is {} ({})",
                key,
                leader,
                if leader == self.node_id { "LEADER" } else { "REPLICA" }
            );
        }
    }

    fn elected_phase(&self, leader: NodeId) -> ElectionPhase {
        if leader == self.node_id {
            ElectionPhase::ElectedLeader
        } else {
            ElectionPhase::ElectedReplica
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{node_state, NodeRole};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, VecDeque};

    fn membership(n: u64) -> MembershipTable {
        MembershipTable::with_port_bases("127.0.0.1", 1..=n, 30000, 31000).unwrap()
    }

    fn engine(id: NodeId, n: u64) -> ElectionEngine {
        let (publisher, _reader) = node_state(NodeState::pending(id, 0));
        ElectionEngine::new(id, &membership(n), publisher)
    }

    fn dead(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    fn targets(out: &[Announcement]) -> Vec<NodeId> {
        out.iter().map(|a| a.to).collect()
    }

    #[test]
    fn test_single_survivor_self_elects() {
        let mut e = engine(2, 5);
        e.adopt_leader(1, 0);
        let out = e.on_leader_lost(1, &dead(&[1, 3, 4, 5]));

        assert!(out.is_empty());
        assert_eq!(e.phase(), ElectionPhase::ElectedLeader);
        assert_eq!(e.leader(), Some(2));
        assert_eq!(e.reader().snapshot().role, NodeRole::Leader);
        assert_eq!(e.epoch(), 1);
    }

    #[test]
    fn test_single_node_cluster() {
        let mut e = engine(1, 1);
        let out = e.start_election(&BTreeSet::new());
        assert!(out.is_empty());
        assert_eq!(e.leader(), Some(1));
    }

    #[test]
    fn test_round_resolves_when_everyone_accounted_for() {
        let mut e = engine(2, 5);
        e.adopt_leader(1, 0);

        let out = e.on_leader_lost(1, &dead(&[1]));
        assert_eq!(targets(&out), vec![3, 4, 5]);
        assert_eq!(e.phase(), ElectionPhase::Electing);
        assert_eq!(e.leader(), None);

        let key = e.round().unwrap().key();
        e.on_announce(3, key.epoch, key.initiator, &dead(&[1]));
        e.on_peer_down(5);
        assert_eq!(e.phase(), ElectionPhase::Electing);

        e.on_announce(4, key.epoch, key.initiator, &dead(&[1]));
        assert_eq!(e.phase(), ElectionPhase::ElectedReplica);
        assert_eq!(e.leader(), Some(4));
        assert_eq!(e.reader().snapshot().role, NodeRole::Replica);
    }

    #[test]
    fn test_higher_epoch_supersedes() {
        let mut e = engine(3, 5);
        e.adopt_leader(1, 4);
        e.on_leader_lost(1, &dead(&[1]));
        assert_eq!(e.epoch(), 5);
        e.on_announce(2, 5, 3, &dead(&[1]));

        // A round with a higher epoch restarts collection
        let out = e.on_announce(4, 7, 4, &dead(&[1]));
        assert_eq!(e.epoch(), 7);
        assert_eq!(targets(&out), vec![2, 4, 5]);
        let round = e.round().unwrap();
        assert_eq!(round.key(), RoundKey { epoch: 7, initiator: 4 });
        assert_eq!(round.participants(), &dead(&[3, 4]));
    }

    #[test]
    fn test_same_epoch_higher_initiator_supersedes() {
        let mut e = engine(3, 5);
        e.adopt_leader(1, 0);
        e.on_leader_lost(1, &dead(&[1]));

        e.on_announce(5, 1, 5, &dead(&[1]));
        assert_eq!(e.round().unwrap().key(), RoundKey { epoch: 1, initiator: 5 });

        // Lower initiator at the same epoch is now stale
        let out = e.on_announce(2, 1, 2, &dead(&[1]));
        assert_eq!(
            out,
            vec![Announcement {
                to: 2,
                epoch: 1,
                initiator: 5
            }]
        );
        assert!(!e.round().unwrap().participants().contains(&2));
    }

    #[test]
    fn test_stale_epoch_dropped() {
        let mut e = engine(3, 5);
        e.adopt_leader(1, 6);
        e.on_leader_lost(1, &dead(&[1]));

        let out = e.on_announce(5, 2, 5, &dead(&[1]));
        assert_eq!(targets(&out), vec![5]);
        assert_eq!((out[0].epoch, out[0].initiator), (7, 3));
        assert_eq!(e.epoch(), 7);
        assert_eq!(e.round().unwrap().key().initiator, 3);
        assert!(!e.round().unwrap().participants().contains(&5));
    }

    #[test]
    fn test_stale_sender_is_pulled_into_current_round() {
        // 5 elected itself while believing everyone else dead
        let mut e5 = engine(5, 5);
        e5.adopt_leader(1, 0);
        e5.on_leader_lost(1, &dead(&[1, 2, 3, 4]));
        assert_eq!(e5.leader(), Some(5));

        let mut e2 = engine(2, 5);
        e2.adopt_leader(1, 0);
        let out = e2.on_leader_lost(1, &dead(&[1, 3, 4]));
        assert_eq!(targets(&out), vec![5]);

        let replies = e5.on_announce(2, out[0].epoch, out[0].initiator, &dead(&[1, 3, 4]));
        assert_eq!(targets(&replies), vec![2]);

        let back = e2.on_announce(5, replies[0].epoch, replies[0].initiator, &dead(&[1, 3, 4]));
        assert_eq!(targets(&back), vec![5]);
        assert_eq!(e2.leader(), Some(5));

        e5.on_announce(2, back[0].epoch, back[0].initiator, &dead(&[1, 3, 4]));
        e2.on_collection_timeout();
        assert_eq!(e2.leader(), Some(5));
        assert_eq!(e5.leader(), Some(5));
        assert_eq!(e2.epoch(), e5.epoch());
    }

    #[test]
    fn test_adopted_leader_outranks_same_epoch_round() {
        let mut e = engine(3, 5);
        e.adopt_leader(5, 1);

        let out = e.on_announce(2, 1, 2, &dead(&[1]));
        assert_eq!(
            out,
            vec![Announcement {
                to: 2,
                epoch: 1,
                initiator: 5
            }]
        );
        assert_eq!(e.phase(), ElectionPhase::ElectedReplica);
        assert_eq!(e.leader(), Some(5));

        e.on_collection_timeout();
        assert_eq!(e.leader(), Some(5));

        // A genuinely newer round still supersedes
        let out = e.on_announce(4, 2, 4, &dead(&[1]));
        assert_eq!(e.phase(), ElectionPhase::Electing);
        assert_eq!(targets(&out), vec![2, 4, 5]);
    }

    #[test]
    fn test_epochs_never_decrease() {
        let mut e = engine(4, 5);
        e.adopt_leader(5, 3);
        e.adopt_leader(2, 1);
        assert_eq!(e.epoch(), 3);
        assert_eq!(e.leader(), Some(5));
    }

    #[test]
    fn test_duplicate_leader_lost_does_not_restart() {
        let mut e = engine(2, 5);
        e.adopt_leader(1, 0);
        e.on_leader_lost(1, &dead(&[1]));
        let key = e.round().unwrap().key();

        let out = e.on_leader_lost(1, &dead(&[1]));
        assert!(out.is_empty());
        assert_eq!(e.round().unwrap().key(), key);
        assert_eq!(e.epoch(), 1);
    }

    #[test]
    fn test_loss_of_non_leader_ignored() {
        let mut e = engine(2, 5);
        e.adopt_leader(5, 2);
        let out = e.on_leader_lost(3, &dead(&[3]));
        assert!(out.is_empty());
        assert_eq!(e.phase(), ElectionPhase::ElectedReplica);
        assert_eq!(e.epoch(), 2);
    }

    #[test]
    fn test_cascading_failure_uses_new_epoch() {
        let mut e = engine(2, 3);
        e.adopt_leader(1, 0);
        e.on_leader_lost(1, &dead(&[1]));
        e.on_announce(3, 1, 2, &dead(&[1]));
        assert_eq!(e.leader(), Some(3));

        let out = e.on_leader_lost(3, &dead(&[1, 3]));
        assert!(out.is_empty());
        assert_eq!(e.epoch(), 2);
        assert_eq!(e.leader(), Some(2));
        assert_eq!(e.phase(), ElectionPhase::ElectedLeader);
    }

    #[test]
    fn test_collection_timeout_resolves_best_effort() {
        let mut e = engine(2, 5);
        e.adopt_leader(1, 0);
        e.on_leader_lost(1, &dead(&[1]));
        e.on_announce(3, 1, 2, &dead(&[1]));

        let deadline = e.collection_deadline(Duration::from_millis(100)).unwrap();
        assert!(deadline > e.round().unwrap().last_change());

        e.on_collection_timeout();
        assert_eq!(e.leader(), Some(3));
        assert_eq!(e.collection_deadline(Duration::from_millis(100)), None);
    }

    #[test]
    fn test_late_participant_updates_leader() {
        let mut e = engine(2, 3);
        e.adopt_leader(1, 0);
        // 3 was believed dead when the round started
        let out = e.on_leader_lost(1, &dead(&[1, 3]));
        assert!(out.is_empty());
        assert_eq!(e.leader(), Some(2));

        let out = e.on_announce(3, 1, 2, &dead(&[1, 3]));
        assert_eq!(targets(&out), vec![3]);
        assert_eq!(e.leader(), Some(3));
        assert_eq!(e.phase(), ElectionPhase::ElectedReplica);
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let mut e = engine(2, 3);
        assert!(e.on_announce(9, 5, 9, &BTreeSet::new()).is_empty());
        assert_eq!(e.epoch(), 0);
        assert_eq!(e.phase(), ElectionPhase::Idle);
    }

    #[test]
    fn test_idle_node_joins_announced_round() {
        let mut e = engine(4, 5);
        let out = e.on_announce(2, 1, 2, &BTreeSet::new());
        assert_eq!(e.phase(), ElectionPhase::Electing);
        assert_eq!(targets(&out), vec![1, 2, 3, 5]);
    }

    /// Delivers announcements between engines in a shuffled order.
    /// Messages to dead nodes fail and the sender learns the peer is down.
    fn simulate(n: u64, failed: &[NodeId], leader: NodeId, seed: u64) -> BTreeMap<NodeId, ElectionEngine> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut engines: BTreeMap<NodeId, ElectionEngine> = (1..=n)
            .filter(|id| !failed.contains(id))
            .map(|id| {
                let mut e = engine(id, n);
                e.adopt_leader(leader, 0);
                (id, e)
            })
            .collect();

        let mut queue: VecDeque<(NodeId, Announcement)> = VecDeque::new();
        let mut survivors: Vec<NodeId> = engines.keys().copied().collect();
        survivors.shuffle(&mut rng);

        for id in survivors {
            // Each detector has seen a different subset of the failures
            let known: BTreeSet<NodeId> = failed
                .iter()
                .copied()
                .filter(|f| *f == leader || rng.gen_bool(0.5))
                .collect();
            let e = engines.get_mut(&id).unwrap();
            for a in e.on_leader_lost(leader, &known) {
                queue.push_back((id, a));
            }

            // Interleave some deliveries with the detections
            for _ in 0..rng.gen_range(0..3) {
                deliver_one(&mut engines, &mut queue, failed, &mut rng);
            }
        }

        while !queue.is_empty() {
            deliver_one(&mut engines, &mut queue, failed, &mut rng);
        }
        engines
    }

    fn deliver_one(
        engines: &mut BTreeMap<NodeId, ElectionEngine>,
        queue: &mut VecDeque<(NodeId, Announcement)>,
        failed: &[NodeId],
        rng: &mut StdRng,
    ) {
        if queue.is_empty() {
            return;
        }
        let pick = rng.gen_range(0..queue.len());
        let Some((from, a)) = queue.remove(pick) else {
            return;
        };

        if failed.contains(&a.to) {
            if let Some(sender) = engines.get_mut(&from) {
                sender.on_peer_down(a.to);
            }
            return;
        }

        let dead: BTreeSet<NodeId> = failed.iter().copied().collect();
        let receiver = engines.get_mut(&a.to).unwrap();
        for reply in receiver.on_announce(from, a.epoch, a.initiator, &dead) {
            queue.push_back((a.to, reply));
        }
    }

    #[test]
    fn test_convergence_regardless_of_order() {
        let scenarios: Vec<(Vec<NodeId>, NodeId)> = vec![
            (vec![1], 5),
            (vec![3, 1], 5),
            (vec![3, 5, 1], 4),
            (vec![3, 4, 5, 1], 2),
        ];

        for (failed, expected) in scenarios {
            for seed in 0..25 {
                let engines = simulate(5, &failed, 1, seed);
                for (id, e) in &engines {
                    assert_eq!(
                        e.leader(),
                        Some(expected),
                        "node {} with failures {:?} seed {}",
                        id,
                        failed,
                        seed
                    );
                    assert_ne!(e.phase(), ElectionPhase::Electing);
                }

                let epochs: BTreeSet<Epoch> = engines.values().map(|e| e.epoch()).collect();
                assert_eq!(epochs.len(), 1, "survivors disagree on epoch");
            }
        }
    }
}
