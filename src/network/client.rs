//! Network Client
//!
//! TCP client for sending requests to other nodes' coordination endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, Message, PeerTransport};
use crate::error::{Error, Result};
use crate::state::{MembershipTable, NodeId};

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Where peers listen
    membership: Arc<MembershipTable>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(
        membership: Arc<MembershipTable>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to an address and wait for the response
    pub async fn send_to(&self, address: SocketAddr, message: &Message) -> Result<Message> {
        let mut stream = self.connect(address).await?;

        let result = timeout(self.request_timeout, async {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, message).await?;
            read_message(&mut reader).await
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Connect to an address
    async fn connect(&self, address: SocketAddr) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for NetworkClient {
    async fn send(&self, to: NodeId, message: Message) -> Result<Message> {
        let (address, _) = self.membership.endpoints_for(to)?;
        self.send_to(address, &message).await
    }
}
