//! WolfElect - Fixed-Membership Leader Election
//!
//! Every node of a cluster runs the same binary. The cluster elects the
//! surviving node with the highest identifier as leader, detects leader
//! failure by timeout or refused connection, and answers "who is the
//! leader" queries on a public UDP channel.
//!
//! # Architecture
//!
//! Control flows one way through a node: the failure detector reports
//! confirmed failures to the election coordinator, the election engine
//! publishes the resulting node state, and the query responder reads it.
//!
//! # Channels
//!
//! - Coordination (TCP, port `coordination_base_port + id`): framed
//!   probes and election announcements between nodes
//! - Query (UDP, port `query_base_port + id`): `get_leader` requests
//!   answered with the leader identifier

pub mod config;
pub mod detector;
pub mod election;
pub mod error;
pub mod network;
pub mod node;
pub mod query;
pub mod state;

pub use config::ElectConfig;
pub use error::{Error, Result};
pub use node::{Node, NodeHandle};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ElectConfig, LeaderEncoding, QueryPolicy};
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, NodeHandle};
    pub use crate::query::QueryClient;
    pub use crate::state::{Epoch, MembershipTable, NodeId, NodeRole, NodeState};
}
