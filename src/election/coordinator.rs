//! Election coordinator task

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, watch};

use super::engine::{Announcement, ElectionEngine};
use crate::detector::{DetectorEvent, FailureDetector};
use crate::network::{Message, PeerTransport};

/// Owns the election engine and feeds it every input
pub struct ElectionCoordinator {
    engine: ElectionEngine,
    detector: Arc<FailureDetector>,
    transport: Arc<dyn PeerTransport>,
    collection_timeout: Duration,
    send_timeout: Duration,
}

impl ElectionCoordinator {
    pub fn new(
        engine: ElectionEngine,
        detector: Arc<FailureDetector>,
        transport: Arc<dyn PeerTransport>,
        collection_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            detector,
            transport,
            collection_timeout,
            send_timeout,
        }
    }

    pub fn engine(&self) -> &ElectionEngine {
        &self.engine
    }

    /// Bring the node to its first resolved state.
    ///
    /// With the bootstrap hint the node leads at epoch 0. Otherwise it asks
    /// its peers for the current leader and starts an election if nobody
    /// knows one.
    pub async fn startup(&mut self, bootstrap_leader: bool) {
        if bootstrap_leader {
            self.engine.bootstrap_as_leader();
            return;
        }

        match self.detector.discover().await {
            Some((leader, epoch)) => {
                self.engine.adopt_leader(leader, epoch);
                // The reported leader may already be gone
                self.detector.check_leader().await;
            }
            None => {
                tracing::info!(
                    "Node {} found no leader, starting election",
                    self.engine.node_id()
                );
                let dead = self.detector.dead_peers().await;
                let out = self.engine.start_election(&dead);
                self.deliver(out).await;
            }
        }
    }

    /// Event loop; runs until `shutdown` flips to true
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DetectorEvent>,
        mut announcements: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let deadline = self.engine.collection_deadline(self.collection_timeout);

            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(message) = announcements.recv() => self.handle_announcement(message).await,
                _ = sleep_until(deadline) => self.engine.on_collection_timeout(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Election coordinator for node {} stopped", self.engine.node_id());
    }

    async fn handle_event(&mut self, event: DetectorEvent) {
        match event {
            DetectorEvent::LeaderLost { leader, .. } => {
                let dead = self.detector.dead_peers().await;
                let out = self.engine.on_leader_lost(leader, &dead);
                self.deliver(out).await;
            }
            DetectorEvent::PeerDown(id) => self.engine.on_peer_down(id),
            DetectorEvent::PeerUp(id) => {
                tracing::debug!("Node {} sees peer {} back", self.engine.node_id(), id);
            }
        }
    }

    async fn handle_announcement(&mut self, message: Message) {
        let Message::Announce {
            from,
            epoch,
            initiator,
        } = message
        else {
            tracing::debug!("Coordinator ignoring {}", message.type_name());
            return;
        };

        let dead = self.detector.dead_peers().await;
        let out = self.engine.on_announce(from, epoch, initiator, &dead);
        self.deliver(out).await;
    }

    /// Send announcements concurrently and record how each peer answered
    async fn deliver(&self, announcements: Vec<Announcement>) {
        if announcements.is_empty() {
            return;
        }

        let node_id = self.engine.node_id();
        let sends = announcements.into_iter().map(|a| {
            let message = Message::Announce {
                from: node_id,
                epoch: a.epoch,
                initiator: a.initiator,
            };
            async move {
                let result =
                    tokio::time::timeout(self.send_timeout, self.transport.send(a.to, message)).await;
                (a.to, result)
            }
        });

        for (to, result) in join_all(sends).await {
            match result {
                Ok(Ok(response)) => {
                    tracing::trace!("Node {} answered announcement with {}", to, response.type_name());
                    self.detector.record_contact(to).await;
                }
                Ok(Err(e)) if e.is_unreachable() => {
                    tracing::debug!("Announcement to {} failed: {}", to, e);
                    self.detector.record_unreachable(to).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Announcement to {} failed: {}", to, e);
                    self.detector.record_missed(to).await;
                }
                Err(_) => self.detector.record_missed(to).await,
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
