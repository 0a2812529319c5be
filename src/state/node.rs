//! Node State
//!
//! The single shared record of {identifier, epoch, leader, role}. The
//! election engine holds the only [`StatePublisher`]; every other component
//! reads snapshots through a [`StateReader`], so a reader never observes a
//! leader from one update paired with the role from another.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::NodeId;

/// Election epoch
pub type Epoch = u64;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node is the cluster leader
    Leader,
    /// Node follows a resolved leader
    Replica,
    /// No leader resolved yet
    Pending,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Replica => write!(f, "REPLICA"),
            NodeRole::Pending => write!(f, "PENDING"),
        }
    }
}

/// Snapshot of a node's election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// This node's identifier
    pub id: NodeId,
    /// Current epoch
    pub epoch: Epoch,
    /// Recognized leader, absent while an election is in flight
    pub leader: Option<NodeId>,
    /// Current role
    pub role: NodeRole,
}

impl NodeState {
    /// State of a node that has not resolved any leader yet
    pub fn pending(id: NodeId, epoch: Epoch) -> Self {
        Self {
            id,
            epoch,
            leader: None,
            role: NodeRole::Pending,
        }
    }

    /// State after resolving `leader` at `epoch`
    pub fn resolved(id: NodeId, epoch: Epoch, leader: NodeId) -> Self {
        let role = if leader == id {
            NodeRole::Leader
        } else {
            NodeRole::Replica
        };
        Self {
            id,
            epoch,
            leader: Some(leader),
            role,
        }
    }

    /// Check if this node is the leader
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// Write side of the node state. Owned by the election engine.
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<NodeState>,
}

/// Read side of the node state
#[derive(Debug, Clone)]
pub struct StateReader {
    rx: watch::Receiver<NodeState>,
}

/// Create a publisher/reader pair starting at `initial`
pub fn node_state(initial: NodeState) -> (StatePublisher, StateReader) {
    let (tx, rx) = watch::channel(initial);
    (StatePublisher { tx }, StateReader { rx })
}

impl StatePublisher {
    /// Replace the published state; returns false if nothing changed
    pub fn publish(&self, state: NodeState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Current published state
    pub fn current(&self) -> NodeState {
        *self.tx.borrow()
    }

    /// Create another reader
    pub fn reader(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl StateReader {
    /// Consistent snapshot of the current state
    pub fn snapshot(&self) -> NodeState {
        *self.rx.borrow()
    }

    /// Current leader, if resolved
    pub fn leader(&self) -> Option<NodeId> {
        self.rx.borrow().leader
    }

    /// Wait until a leader is resolved, bounded by `limit`
    pub async fn wait_for_leader(&self, limit: Duration) -> Option<NodeId> {
        let mut rx = self.rx.clone();
        let leader = match tokio::time::timeout(limit, rx.wait_for(|s| s.leader.is_some())).await {
            Ok(Ok(state)) => state.leader,
            _ => None,
        };
        // Publisher dropped or timed out: answer with whatever is there
        leader.or_else(|| self.leader())
    }

    /// Wait until the published state satisfies `f`, bounded by `limit`
    pub async fn wait_until<F>(&self, limit: Duration, mut f: F) -> Option<NodeState>
    where
        F: FnMut(&NodeState) -> bool,
    {
        let mut rx = self.rx.clone();
        let result = match tokio::time::timeout(limit, rx.wait_for(|s| f(s))).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        result
    }
}
