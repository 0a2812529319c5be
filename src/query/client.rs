//! Query channel client

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{decode_leader, QueryRequest};
use crate::config::LeaderEncoding;
use crate::error::{Error, Result};
use crate::state::NodeId;

/// Asks nodes who the leader is
#[derive(Debug, Clone, Copy)]
pub struct QueryClient {
    encoding: LeaderEncoding,
}

impl QueryClient {
    pub fn new(encoding: LeaderEncoding) -> Self {
        Self { encoding }
    }

    /// Query `address`; `None` means the node knows no leader
    pub async fn ask_leader(&self, address: SocketAddr, limit: Duration) -> Result<Option<NodeId>> {
        let local: SocketAddr = if address.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;

        let request = serde_json::to_vec(&QueryRequest::get_leader())?;
        socket.send_to(&request, address).await?;

        let mut buf = [0u8; 64];
        let len = match tokio::time::timeout(limit, socket.recv_from(&mut buf)).await {
            Ok(result) => result?.0,
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        decode_leader(&buf[..len], self.encoding)
    }
}
