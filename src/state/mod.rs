//! State Management Module
//!
//! Static cluster membership and the node's published election state.

mod membership;
mod node;

pub use membership::{MembershipEntry, MembershipTable, NodeId};
pub use node::{node_state, Epoch, NodeRole, NodeState, StatePublisher, StateReader};
