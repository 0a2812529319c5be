//! Cluster Membership Table
//!
//! Static mapping from node identifier to its coordination and query
//! endpoints. Loaded once at startup and never mutated afterwards.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::config::ElectConfig;
use crate::error::{Error, Result};

/// Node identifier. Unique within the cluster; higher wins elections.
pub type NodeId = u64;

/// Endpoints of a single cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// Node identifier
    pub id: NodeId,
    /// Address of the coordination (election/probe) channel
    pub coordination: SocketAddr,
    /// Address of the query channel
    pub query: SocketAddr,
}

/// Fixed cluster membership
#[derive(Debug, Clone)]
pub struct MembershipTable {
    entries: BTreeMap<NodeId, MembershipEntry>,
}

impl MembershipTable {
    /// Build a table from a list of entries
    pub fn new(entries: impl IntoIterator<Item = MembershipEntry>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for entry in entries {
            if table.insert(entry.id, entry).is_some() {
                return Err(Error::Config(format!(
                    "duplicate membership entry for node {}",
                    entry.id
                )));
            }
        }

        if table.is_empty() {
            return Err(Error::Config("cluster has no members".into()));
        }

        Ok(Self { entries: table })
    }

    /// Derive the conventional layout: node `i` listens on `base + i`
    pub fn with_port_bases(
        host: &str,
        ids: impl IntoIterator<Item = NodeId>,
        coordination_base: u16,
        query_base: u16,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for id in ids {
            entries.push(MembershipEntry {
                id,
                coordination: resolve(host, offset_port(coordination_base, id)?)?,
                query: resolve(host, offset_port(query_base, id)?)?,
            });
        }
        Self::new(entries)
    }

    /// Build the table described by a configuration
    pub fn from_config(config: &ElectConfig) -> Result<Self> {
        if config.cluster.nodes.is_empty() {
            return Self::with_port_bases(
                &config.node.host,
                config.member_ids(),
                config.cluster.coordination_base_port,
                config.cluster.query_base_port,
            );
        }

        let mut entries = Vec::with_capacity(config.cluster.nodes.len());
        for member in &config.cluster.nodes {
            entries.push(MembershipEntry {
                id: member.id,
                coordination: parse_address(&member.coordination_address)?,
                query: parse_address(&member.query_address)?,
            });
        }
        Self::new(entries)
    }

    /// Coordination and query endpoints of a node
    pub fn endpoints_for(&self, id: NodeId) -> Result<(SocketAddr, SocketAddr)> {
        self.entries
            .get(&id)
            .map(|e| (e.coordination, e.query))
            .ok_or(Error::UnknownNode(id))
    }

    /// All identifiers, ascending
    pub fn all_identifiers(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    /// All identifiers except `id`, ascending
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.entries.keys().copied().filter(|&p| p != id).collect()
    }

    /// Whether `id` is a cluster member
    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; a table is never built empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next member after `id` in ring order (wrapping to the lowest)
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let ids = self.all_identifiers();
        let pos = ids.iter().position(|&n| n == id)?;
        Some(ids[(pos + 1) % ids.len()])
    }

    /// Every other member in ring order, starting at the successor of `id`
    pub fn ring_from(&self, id: NodeId) -> Vec<NodeId> {
        std::iter::successors(self.successor(id), |&n| self.successor(n))
            .take_while(|&n| n != id)
            .collect()
    }
}

fn offset_port(base: u16, id: NodeId) -> Result<u16> {
    u64::from(base)
        .checked_add(id)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| Error::Config(format!("port {} + {} is out of range", base, id)))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("no address for {}:{}", host, port)))
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid address {}: {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("no address for {}", address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_nodes() -> MembershipTable {
        MembershipTable::with_port_bases("127.0.0.1", 1..=5, 10000, 5000).unwrap()
    }

    #[test]
    fn test_port_convention() {
        let table = five_nodes();
        let (coordination, query) = table.endpoints_for(3).unwrap();
        assert_eq!(coordination, "127.0.0.1:10003".parse::<SocketAddr>().unwrap());
        assert_eq!(query, "127.0.0.1:5003".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_unknown_identifier() {
        let table = five_nodes();
        assert!(matches!(table.endpoints_for(6), Err(Error::UnknownNode(6))));
        assert!(!table.contains(0));
    }

    #[test]
    fn test_ordering_and_peers() {
        let table = five_nodes();
        assert_eq!(table.all_identifiers(), vec![1, 2, 3, 4, 5]);
        assert_eq!(table.peers_of(3), vec![1, 2, 4, 5]);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_ring_traversal() {
        let table = five_nodes();
        assert_eq!(table.successor(2), Some(3));
        assert_eq!(table.successor(5), Some(1));
        assert_eq!(table.successor(9), None);
        assert_eq!(table.ring_from(4), vec![5, 1, 2, 3]);
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let entry = MembershipEntry {
            id: 1,
            coordination: "127.0.0.1:1".parse().unwrap(),
            query: "127.0.0.1:2".parse().unwrap(),
        };
        assert!(MembershipTable::new([entry, entry]).is_err());
        assert!(MembershipTable::new(Vec::<MembershipEntry>::new()).is_err());
    }

    #[test]
    fn test_port_overflow() {
        assert!(MembershipTable::with_port_bases("127.0.0.1", [10], 65530, 5000).is_err());
    }
}
