//! Election rounds

use std::collections::BTreeSet;
use std::time::Instant;

use crate::state::{Epoch, NodeId};

/// Orders election rounds: epoch first, initiator breaks ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoundKey {
    pub epoch: Epoch,
    pub initiator: NodeId,
}

impl std::fmt::Display for RoundKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.epoch, self.initiator)
    }
}

/// One election round as seen by a single node
#[derive(Debug, Clone)]
pub struct ElectionRound {
    key: RoundKey,
    /// Nodes heard from in this round, always including ourselves
    participants: BTreeSet<NodeId>,
    /// Peers confirmed dead during this round
    confirmed_dead: BTreeSet<NodeId>,
    /// Peers we have sent our announcement to
    announced_to: BTreeSet<NodeId>,
    /// Resolved leader, `None` while pending
    resolved: Option<NodeId>,
    last_change: Instant,
}

impl ElectionRound {
    pub fn new(key: RoundKey, self_id: NodeId) -> Self {
        Self {
            key,
            participants: BTreeSet::from([self_id]),
            confirmed_dead: BTreeSet::new(),
            announced_to: BTreeSet::new(),
            resolved: None,
            last_change: Instant::now(),
        }
    }

    pub fn key(&self) -> RoundKey {
        self.key
    }

    pub fn participants(&self) -> &BTreeSet<NodeId> {
        &self.participants
    }

    pub fn confirmed_dead(&self) -> &BTreeSet<NodeId> {
        &self.confirmed_dead
    }

    pub fn resolved(&self) -> Option<NodeId> {
        self.resolved
    }

    pub fn last_change(&self) -> Instant {
        self.last_change
    }

    /// Record an announcement; returns true if the sender is new
    pub fn heard_from(&mut self, id: NodeId) -> bool {
        self.confirmed_dead.remove(&id);
        let added = self.participants.insert(id);
        if added {
            self.last_change = Instant::now();
        }
        added
    }

    /// Record a confirmed failure; returns true if anything changed
    pub fn mark_dead(&mut self, id: NodeId, self_id: NodeId) -> bool {
        if id == self_id {
            return false;
        }
        let removed = self.participants.remove(&id);
        let added = self.confirmed_dead.insert(id);
        if removed || added {
            self.last_change = Instant::now();
        }
        removed || added
    }

    /// Note that our announcement went out to `id`
    pub fn mark_announced(&mut self, id: NodeId) -> bool {
        self.announced_to.insert(id)
    }

    /// Every peer has either announced or been confirmed dead
    pub fn is_complete(&self, peers: &[NodeId]) -> bool {
        peers
            .iter()
            .all(|p| self.participants.contains(p) || self.confirmed_dead.contains(p))
    }

    /// Highest identifier among participants
    pub fn highest_participant(&self) -> Option<NodeId> {
        self.participants.iter().next_back().copied()
    }

    pub fn set_resolved(&mut self, leader: NodeId) {
        self.resolved = Some(leader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_key_ordering() {
        let a = RoundKey { epoch: 2, initiator: 5 };
        let b = RoundKey { epoch: 3, initiator: 1 };
        let c = RoundKey { epoch: 3, initiator: 4 };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.to_string(), "3/4");
    }

    #[test]
    fn test_completion() {
        let mut round = ElectionRound::new(RoundKey { epoch: 1, initiator: 2 }, 2);
        let peers = [1, 3, 4];

        assert!(!round.is_complete(&peers));
        assert!(round.heard_from(4));
        assert!(!round.heard_from(4));
        assert!(round.mark_dead(1, 2));
        assert!(!round.is_complete(&peers));
        assert!(round.mark_dead(3, 2));
        assert!(round.is_complete(&peers));
        assert_eq!(round.highest_participant(), Some(4));
    }

    #[test]
    fn test_dead_participant_is_dropped() {
        let mut round = ElectionRound::new(RoundKey { epoch: 1, initiator: 2 }, 2);
        round.heard_from(5);
        round.mark_dead(5, 2);
        assert_eq!(round.highest_participant(), Some(2));
        // Self can never be marked dead
        assert!(!round.mark_dead(2, 2));
    }
}
