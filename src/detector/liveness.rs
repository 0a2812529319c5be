//! Peer liveness records

use std::time::Instant;

use crate::state::NodeId;

/// Liveness classification of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Missed at least one probe
    Suspected,
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Alive => write!(f, "alive"),
            Liveness::Suspected => write!(f, "suspected"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}

/// What the detector knows about one peer
#[derive(Debug, Clone)]
pub struct PeerLivenessRecord {
    pub id: NodeId,
    pub state: Liveness,
    /// Last successful exchange, `None` until the first one
    pub last_contact: Option<Instant>,
    /// Consecutive missed probes
    pub missed: u32,
}

/// Outcome of updating a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Unchanged,
    BecameDead,
    Revived,
}

impl PeerLivenessRecord {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            state: Liveness::Alive,
            last_contact: None,
            missed: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == Liveness::Dead
    }

    /// A successful exchange with the peer
    pub(crate) fn contact(&mut self) -> Transition {
        let was_dead = self.is_dead();
        self.state = Liveness::Alive;
        self.missed = 0;
        self.last_contact = Some(Instant::now());
        if was_dead {
            Transition::Revived
        } else {
            Transition::Unchanged
        }
    }

    /// One missed probe; dead once `max_missed` consecutive misses accumulate
    pub(crate) fn miss(&mut self, max_missed: u32) -> Transition {
        if self.is_dead() {
            return Transition::Unchanged;
        }
        self.missed = self.missed.saturating_add(1);
        if self.missed >= max_missed {
            self.state = Liveness::Dead;
            Transition::BecameDead
        } else {
            self.state = Liveness::Suspected;
            Transition::Unchanged
        }
    }

    /// Connection establishment failed
    pub(crate) fn unreachable(&mut self) -> Transition {
        self.missed = self.missed.saturating_add(1);
        if self.is_dead() {
            return Transition::Unchanged;
        }
        self.state = Liveness::Dead;
        Transition::BecameDead
    }
}
