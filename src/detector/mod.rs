//! Failure Detector
//!
//! Probes peers over the coordination channel and classifies them as
//! alive, suspected or dead. The recognized leader is probed every tick,
//! every other peer once every `peer_probe_every` ticks. Confirmed failures
//! are reported to the election coordinator as [`DetectorEvent`]s.

mod liveness;

pub use liveness::{Liveness, PeerLivenessRecord};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::config::DetectorConfig;
use crate::network::{Message, PeerTransport};
use crate::state::{Epoch, MembershipTable, NodeId, StateReader};
use liveness::Transition;

/// Events reported to the election coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    /// A peer was confirmed dead
    PeerDown(NodeId),
    /// A dead peer answered again
    PeerUp(NodeId),
    /// The recognized leader of `epoch` was confirmed dead
    LeaderLost { leader: NodeId, epoch: Epoch },
}

/// Periodic liveness prober for one node
pub struct FailureDetector {
    node_id: NodeId,
    membership: Arc<MembershipTable>,
    transport: Arc<dyn PeerTransport>,
    state: StateReader,
    config: DetectorConfig,
    peers: RwLock<HashMap<NodeId, PeerLivenessRecord>>,
    /// Last (leader, epoch) reported as lost
    signalled: Mutex<Option<(NodeId, Epoch)>>,
    events: mpsc::UnboundedSender<DetectorEvent>,
}

impl FailureDetector {
    /// Create a detector; every peer starts out alive
    pub fn new(
        node_id: NodeId,
        membership: Arc<MembershipTable>,
        transport: Arc<dyn PeerTransport>,
        state: StateReader,
        config: DetectorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DetectorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let peers = membership
            .peers_of(node_id)
            .into_iter()
            .map(|id| (id, PeerLivenessRecord::new(id)))
            .collect();

        let detector = Self {
            node_id,
            membership,
            transport,
            state,
            config,
            peers: RwLock::new(peers),
            signalled: Mutex::new(None),
            events,
        };
        (detector, events_rx)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Record a successful exchange with `id`
    pub async fn record_contact(&self, id: NodeId) {
        let transition = match self.peers.write().await.get_mut(&id) {
            Some(record) => record.contact(),
            None => return,
        };
        if transition == Transition::Revived {
            tracing::info!("Peer {} is reachable again", id);
            self.emit(DetectorEvent::PeerUp(id));
        }
    }

    /// Record a probe that got no answer in time
    pub async fn record_missed(&self, id: NodeId) {
        let max_missed = self.config.max_missed_probes;
        let (transition, missed) = match self.peers.write().await.get_mut(&id) {
            Some(record) => (record.miss(max_missed), record.missed),
            None => return,
        };
        tracing::trace!("Peer {} missed probe ({}/{})", id, missed, max_missed);
        if transition == Transition::BecameDead {
            self.peer_died(id).await;
        }
    }

    /// Record a refused connection to `id`
    pub async fn record_unreachable(&self, id: NodeId) {
        let transition = match self.peers.write().await.get_mut(&id) {
            Some(record) => record.unreachable(),
            None => return,
        };
        if transition == Transition::BecameDead {
            self.peer_died(id).await;
        }
    }

    /// Probe one peer, feeding the outcome into its record
    pub async fn probe(&self, id: NodeId) -> Option<Message> {
        let request = Message::Probe {
            from: self.node_id,
            epoch: self.state.snapshot().epoch,
        };

        match tokio::time::timeout(self.config.probe_timeout(), self.transport.send(id, request)).await {
            Ok(Ok(response)) => {
                self.record_contact(id).await;
                Some(response)
            }
            Ok(Err(e)) if e.is_unreachable() => {
                tracing::debug!("Probe to {} failed: {}", id, e);
                self.record_unreachable(id).await;
                None
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe to {} failed: {}", id, e);
                self.record_missed(id).await;
                None
            }
            Err(_) => {
                self.record_missed(id).await;
                None
            }
        }
    }

    /// Run one probe tick
    pub async fn tick(&self, tick: u64) {
        let leader = self.state.leader().filter(|&l| l != self.node_id);

        let mut targets: Vec<NodeId> = leader.into_iter().collect();
        if tick % self.config.peer_probe_every.max(1) == 0 {
            targets.extend(
                self.membership
                    .ring_from(self.node_id)
                    .into_iter()
                    .filter(|&id| Some(id) != leader),
            );
        }

        join_all(targets.into_iter().map(|id| self.probe(id))).await;
        self.check_leader().await;
    }

    /// Report the recognized leader as lost if it is dead
    pub async fn check_leader(&self) {
        let snapshot = self.state.snapshot();
        let Some(leader) = snapshot.leader.filter(|&l| l != self.node_id) else {
            return;
        };
        let dead = self
            .peers
            .read()
            .await
            .get(&leader)
            .is_some_and(|r| r.is_dead());
        if dead {
            self.signal_leader_lost(leader, snapshot.epoch).await;
        }
    }

    /// Probe every peer once and report the leader known by the most recent
    /// epoch, if any peer knows one
    pub async fn discover(&self) -> Option<(NodeId, Epoch)> {
        let peers = self.membership.ring_from(self.node_id);
        let responses = join_all(peers.into_iter().map(|id| self.probe(id))).await;

        responses
            .into_iter()
            .flatten()
            .filter_map(|response| match response {
                Message::ProbeAck {
                    epoch,
                    leader: Some(leader),
                    ..
                } => Some((leader, epoch)),
                _ => None,
            })
            .max_by_key(|&(leader, epoch)| (epoch, leader))
    }

    /// Peers currently classified dead
    pub async fn dead_peers(&self) -> BTreeSet<NodeId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|r| r.is_dead())
            .map(|r| r.id)
            .collect()
    }

    /// Classification of one peer
    pub async fn liveness(&self, id: NodeId) -> Option<Liveness> {
        self.peers.read().await.get(&id).map(|r| r.state)
    }

    /// Snapshot of every peer record, ascending by id
    pub async fn records(&self) -> Vec<PeerLivenessRecord> {
        let mut records: Vec<_> = self.peers.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Probe loop; runs until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.probe_interval();
        let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64);
        tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(tick).await;
                    tick = tick.wrapping_add(1);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Failure detector for node {} stopped", self.node_id);
    }

    async fn peer_died(&self, id: NodeId) {
        tracing::warn!("Peer {} confirmed dead", id);
        self.emit(DetectorEvent::PeerDown(id));

        let snapshot = self.state.snapshot();
        if snapshot.leader == Some(id) {
            self.signal_leader_lost(id, snapshot.epoch).await;
        }
    }

    async fn signal_leader_lost(&self, leader: NodeId, epoch: Epoch) {
        {
            let mut signalled = self.signalled.lock().await;
            if *signalled == Some((leader, epoch)) {
                return;
            }
            *signalled = Some((leader, epoch));
        }
        tracing::warn!("Leader {} lost at epoch {}", leader, epoch);
        self.emit(DetectorEvent::LeaderLost { leader, epoch });
    }

    fn emit(&self, event: DetectorEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Detector event {:?} dropped, no listener", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::state::{node_state, NodeRole, NodeState, StatePublisher};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ack(Option<NodeId>, Epoch),
        Refuse,
        Silent,
    }

    struct FakeTransport {
        behaviors: StdMutex<HashMap<NodeId, Behavior>>,
    }

    impl FakeTransport {
        fn new(behaviors: &[(NodeId, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: StdMutex::new(behaviors.iter().copied().collect()),
            })
        }

        fn set(&self, id: NodeId, behavior: Behavior) {
            self.behaviors.lock().unwrap().insert(id, behavior);
        }
    }

    #[async_trait::async_trait]
    impl PeerTransport for FakeTransport {
        async fn send(&self, to: NodeId, _message: Message) -> Result<Message> {
            let behavior = self.behaviors.lock().unwrap().get(&to).copied();
            match behavior {
                Some(Behavior::Ack(leader, epoch)) => Ok(Message::ProbeAck {
                    from: to,
                    epoch,
                    leader,
                    role: NodeRole::Replica,
                }),
                Some(Behavior::Refuse) | None => Err(Error::ConnectionFailed {
                    address: format!("node-{}", to),
                    reason: "connection refused".into(),
                }),
                Some(Behavior::Silent) => Err(Error::ConnectionTimeout(format!("node-{}", to))),
            }
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            probe_interval_ms: 20,
            probe_timeout_ms: 50,
            max_missed_probes: 2,
            peer_probe_every: 2,
        }
    }

    fn detector(
        node_id: NodeId,
        transport: Arc<FakeTransport>,
    ) -> (FailureDetector, mpsc::UnboundedReceiver<DetectorEvent>, StatePublisher) {
        let membership =
            MembershipTable::with_port_bases("127.0.0.1", 1..=5, 30000, 31000).unwrap();
        let (publisher, reader) = node_state(NodeState::resolved(node_id, 0, 1));
        let (detector, events) = FailureDetector::new(
            node_id,
            Arc::new(membership),
            transport,
            reader,
            config(),
        );
        (detector, events, publisher)
    }

    fn all_ack() -> Vec<(NodeId, Behavior)> {
        (1..=5).map(|id| (id, Behavior::Ack(Some(1), 0))).collect()
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<DetectorEvent>) -> Vec<DetectorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_refused_leader_is_lost_once() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, mut events, _publisher) = detector(2, transport.clone());

        transport.set(1, Behavior::Refuse);
        detector.tick(1).await;
        detector.tick(2).await;
        detector.tick(3).await;

        assert_eq!(
            drain(&mut events),
            vec![
                DetectorEvent::PeerDown(1),
                DetectorEvent::LeaderLost { leader: 1, epoch: 0 },
            ]
        );
        assert_eq!(detector.liveness(1).await, Some(Liveness::Dead));
    }

    #[tokio::test]
    async fn test_silent_leader_needs_k_misses() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, mut events, _publisher) = detector(2, transport.clone());

        transport.set(1, Behavior::Silent);
        detector.tick(1).await;
        assert_eq!(detector.liveness(1).await, Some(Liveness::Suspected));
        assert!(drain(&mut events).is_empty());

        detector.tick(3).await;
        assert_eq!(detector.liveness(1).await, Some(Liveness::Dead));
        assert_eq!(
            drain(&mut events),
            vec![
                DetectorEvent::PeerDown(1),
                DetectorEvent::LeaderLost { leader: 1, epoch: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_sweep_cadence() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, mut events, _publisher) = detector(2, transport.clone());

        transport.set(4, Behavior::Refuse);
        // Odd ticks only probe the leader
        detector.tick(1).await;
        assert_eq!(detector.liveness(4).await, Some(Liveness::Alive));

        detector.tick(2).await;
        assert_eq!(detector.liveness(4).await, Some(Liveness::Dead));
        assert_eq!(drain(&mut events), vec![DetectorEvent::PeerDown(4)]);
        assert_eq!(detector.dead_peers().await, BTreeSet::from([4]));
    }

    #[tokio::test]
    async fn test_new_epoch_can_signal_again() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, mut events, publisher) = detector(2, transport.clone());

        transport.set(1, Behavior::Refuse);
        detector.tick(1).await;
        drain(&mut events);

        // A later round resolves back to the same dead leader
        publisher.publish(NodeState::resolved(2, 1, 1));
        detector.tick(3).await;
        assert_eq!(
            drain(&mut events),
            vec![DetectorEvent::LeaderLost { leader: 1, epoch: 1 }]
        );
    }

    #[tokio::test]
    async fn test_contact_revives_dead_peer() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, mut events, _publisher) = detector(2, transport.clone());

        detector.record_unreachable(5).await;
        detector.record_contact(5).await;
        assert_eq!(
            drain(&mut events),
            vec![DetectorEvent::PeerDown(5), DetectorEvent::PeerUp(5)]
        );

        // Unknown ids are ignored
        detector.record_unreachable(42).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_discover_prefers_highest_epoch() {
        let transport = FakeTransport::new(&[
            (1, Behavior::Refuse),
            (3, Behavior::Ack(Some(1), 0)),
            (4, Behavior::Ack(Some(5), 2)),
            (5, Behavior::Ack(None, 3)),
        ]);
        let (detector, _events, _publisher) = detector(2, transport);

        assert_eq!(detector.discover().await, Some((5, 2)));
        assert_eq!(detector.liveness(1).await, Some(Liveness::Dead));
    }

    #[tokio::test]
    async fn test_discover_with_nobody_up() {
        let transport = FakeTransport::new(&[]);
        let (detector, _events, _publisher) = detector(3, transport);

        assert_eq!(detector.discover().await, None);
        assert_eq!(detector.dead_peers().await, BTreeSet::from([1, 2, 4, 5]));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let transport = FakeTransport::new(&all_ack());
        let (detector, _events, _publisher) = detector(2, transport);
        let detector = Arc::new(detector);

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&detector).run(stop_rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        let records = detector.records().await;
        assert_eq!(records.len(), 4);
        assert!(records.iter().any(|r| r.last_contact.is_some()));
    }
}
