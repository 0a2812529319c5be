//! UDP query responder

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{encode_leader, QueryRequest};
use crate::config::{QueryConfig, QueryPolicy};
use crate::error::{Error, Result};
use crate::state::StateReader;

/// Largest request datagram we read
const MAX_DATAGRAM: usize = 2048;

/// Answers leader queries from the published node state
pub struct QueryResponder {
    socket: Arc<UdpSocket>,
    state: StateReader,
    config: QueryConfig,
}

impl QueryResponder {
    /// Bind the query endpoint. Bind failures are startup errors.
    pub async fn bind(address: SocketAddr, state: StateReader, config: QueryConfig) -> Result<Self> {
        let socket = UdpSocket::bind(address).await.map_err(|e| {
            Error::Network(format!("failed to bind query channel {}: {}", address, e))
        })?;

        Ok(Self {
            socket: Arc::new(socket),
            state,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.socket.local_addr() {
            Ok(addr) => tracing::info!("Query responder listening on {}", addr),
            Err(e) => tracing::warn!("Query responder address unavailable: {}", e),
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        // Blocked queries die with the responder
        let mut waiting = JoinSet::new();

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => self.handle(&buf[..len], from, &mut waiting).await,
                        Err(e) => tracing::warn!("Query socket error: {}", e),
                    }
                }
                Some(_) = waiting.join_next(), if !waiting.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Query responder stopped");
    }

    async fn handle(&self, datagram: &[u8], from: SocketAddr, waiting: &mut JoinSet<()>) {
        let request = match QueryRequest::parse(datagram) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Dropping malformed query from {}: {}", from, e);
                return;
            }
        };
        if !request.is_get_leader() {
            tracing::debug!("Dropping unknown query {:?} from {}", request.name, from);
            return;
        }

        let encoding = self.config.encoding;
        let leader = self.state.leader();

        if leader.is_some() || self.config.policy == QueryPolicy::Sentinel {
            reply(&self.socket, from, &encode_leader(leader, encoding)).await;
            return;
        }
        if waiting.len() >= self.config.max_waiting {
            tracing::debug!(
                "{} queries already waiting, answering {} with no leader",
                waiting.len(),
                from
            );
            reply(&self.socket, from, &encode_leader(None, encoding)).await;
            return;
        }

        let socket = Arc::clone(&self.socket);
        let state = self.state.clone();
        let limit = self.config.wait_timeout();
        waiting.spawn(async move {
            let leader = state.wait_for_leader(limit).await;
            reply(&socket, from, &encode_leader(leader, encoding)).await;
        });
    }
}

async fn reply(socket: &UdpSocket, to: SocketAddr, answer: &[u8]) {
    tracing::trace!("Answering leader query from {}", to);
    if let Err(e) = socket.send_to(answer, to).await {
        tracing::debug!("Failed to answer query from {}: {}", to, e);
    }
}
