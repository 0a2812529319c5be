//! Node runtime
//!
//! Wires the membership table, failure detector, election coordinator and
//! query responder into one running node.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ElectConfig;
use crate::detector::{FailureDetector, PeerLivenessRecord};
use crate::election::{ElectionCoordinator, ElectionEngine};
use crate::error::Result;
use crate::network::{CoordinationServer, ErrorCode, Message, MessageHandler, NetworkClient};
use crate::query::QueryResponder;
use crate::state::{node_state, MembershipTable, NodeId, NodeState, StateReader};

/// Capacity of the inbound coordination queues
const INBOUND_QUEUE: usize = 256;

/// Entry point for starting a node
pub struct Node;

impl Node {
    /// Bind both channels, reach a first resolved state and spawn the
    /// background tasks.
    ///
    /// Returns once the node has bootstrapped, adopted a discovered leader,
    /// or started an election.
    pub async fn start(config: ElectConfig) -> Result<NodeHandle> {
        config.validate()?;
        let id = config.node.id;

        let membership = Arc::new(MembershipTable::from_config(&config)?);
        let (coordination, query) = membership.endpoints_for(id)?;

        let (publisher, reader) = node_state(NodeState::pending(id, 0));

        let handler = request_handler(id, Arc::clone(&membership), reader.clone());
        let (incoming_tx, mut incoming_rx) = mpsc::channel(INBOUND_QUEUE);
        let server = CoordinationServer::bind(coordination, handler, incoming_tx).await?;
        let coordination = server.local_addr()?;
        let server_stop = server.shutdown_handle();

        let responder = QueryResponder::bind(query, reader.clone(), config.query.clone()).await?;
        let query = responder.local_addr()?;

        tracing::info!(
            "Node {} starting: coordination {}, query {}",
            id,
            coordination,
            query
        );

        let probe_timeout = config.detector.probe_timeout();
        let client = Arc::new(NetworkClient::new(
            Arc::clone(&membership),
            probe_timeout,
            probe_timeout,
        ));
        let (detector, events) = FailureDetector::new(
            id,
            Arc::clone(&membership),
            client.clone(),
            reader.clone(),
            config.detector.clone(),
        );
        let detector = Arc::new(detector);

        let engine = ElectionEngine::new(id, &membership, publisher);
        let mut coordinator = ElectionCoordinator::new(
            engine,
            Arc::clone(&detector),
            client,
            config.election.collection_timeout(),
            probe_timeout,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                tracing::error!("Coordination server failed: {}", e);
            }
        }));
        tasks.push(tokio::spawn(responder.run(shutdown_rx.clone())));

        // Inbound traffic proves liveness; announcements go to the coordinator
        let (announce_tx, announce_rx) = mpsc::channel(INBOUND_QUEUE);
        let router_detector = Arc::clone(&detector);
        tasks.push(tokio::spawn(async move {
            while let Some((_, message)) = incoming_rx.recv().await {
                if let Some(from) = message.sender() {
                    router_detector.record_contact(from).await;
                }
                if matches!(message, Message::Announce { .. })
                    && announce_tx.send(message).await.is_err()
                {
                    break;
                }
            }
        }));

        coordinator.startup(config.node.bootstrap_leader).await;

        tasks.push(tokio::spawn(Arc::clone(&detector).run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(coordinator.run(events, announce_rx, shutdown_rx)));

        let snapshot = reader.snapshot();
        tracing::info!(
            "Node {} running as {} at epoch {}",
            id,
            snapshot.role,
            snapshot.epoch
        );

        Ok(NodeHandle {
            id,
            state: reader,
            coordination,
            query,
            detector,
            shutdown,
            server_stop,
            tasks,
        })
    }
}

/// Immediate responses to coordination requests
fn request_handler(
    id: NodeId,
    membership: Arc<MembershipTable>,
    state: StateReader,
) -> MessageHandler {
    Arc::new(move |peer: SocketAddr, message: &Message| {
        // Probes are read-only and may come from operator tools
        let from = message.sender()?;
        if !membership.contains(from) && !matches!(message, Message::Probe { .. }) {
            tracing::debug!("Rejecting {} from non-member {} ({})", message.type_name(), from, peer);
            return Some(Message::Error {
                code: ErrorCode::UnknownNode,
                message: format!("node {} is not a cluster member", from),
            });
        }

        match message {
            Message::Probe { .. } => {
                let snapshot = state.snapshot();
                Some(Message::ProbeAck {
                    from: id,
                    epoch: snapshot.epoch,
                    leader: snapshot.leader,
                    role: snapshot.role,
                })
            }
            Message::Announce { epoch, .. } => Some(Message::AnnounceAck {
                from: id,
                epoch: *epoch,
            }),
            _ => None,
        }
    })
}

/// Handle to a running node
pub struct NodeHandle {
    id: NodeId,
    state: StateReader,
    coordination: SocketAddr,
    query: SocketAddr,
    detector: Arc<FailureDetector>,
    shutdown: watch::Sender<bool>,
    server_stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Reader over the node's published state
    pub fn state(&self) -> StateReader {
        self.state.clone()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }

    pub fn coordination_addr(&self) -> SocketAddr {
        self.coordination
    }

    pub fn query_addr(&self) -> SocketAddr {
        self.query
    }

    /// What this node's detector thinks of its peers
    pub async fn peer_liveness(&self) -> Vec<PeerLivenessRecord> {
        self.detector.records().await
    }

    /// Stop every task at once, closing both channels without notice.
    /// Peers observe this exactly like a crashed process.
    pub async fn kill(self) {
        tracing::info!("Node {} killed", self.id);
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Graceful shutdown
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.server_stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Node {} task ended abnormally: {}", self.id, e);
            }
        }
        tracing::info!("Node {} stopped", self.id);
    }
}
