//! The replica actor: wires the agreement engine, the view-change
//! engine, the malice table and an [`Application`] behind a single
//! lock, per the concurrency model of §5.
//!
//! Everything that can be read or mutated while handling an inbound
//! message lives in [`Shared`], guarded by one `parking_lot::Mutex`.
//! `transport`, `digest_scheme` and `timeouts` are fixed at
//! construction and never need the lock: this lets an admin interface
//! (`set_malice_mode`) take the lock briefly without contending with
//! whatever I/O the message loop is doing, and keeps every blocking
//! transport send outside of the critical section.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bft::collections::HashMap;
use crate::bft::communication::channel::{new_message_channel, MessageChannelRx, MessageChannelTx};
use crate::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, CheckpointMessage, Header, Message, NewViewMessage,
    ReplyMessage, RequestMessage, SystemMessage, ViewChangeMessage,
};
use crate::bft::communication::{NodeId, Transport};
use crate::bft::consensus::{Consensus, ConsensusStatus};
use crate::bft::crypto::hash::DigestScheme;
use crate::bft::error::*;
use crate::bft::executable::{Application, Reply, Request, State};
use crate::bft::log::Info;
use crate::bft::malice::{self, MaliceMode, MaliceTable, MessageKind};
use crate::bft::ordering::{Orderable, SeqNo, View};
use crate::bft::sync::{Synchronizer, SynchronizerStatus};
use crate::bft::timeouts::{TimeoutKind, TimerHandle, TimeoutsHandle};

/// Everything a [`Replica`] needs to come up.
pub struct ReplicaConfig<S, T, D> {
    /// This replica's own id.
    pub id: NodeId,
    /// The size of the replica group.
    pub n: usize,
    /// The number of faults the group tolerates.
    pub f: usize,
    /// How long a request may go uncommitted before this replica
    /// suspects the primary and initiates a view-change.
    pub request_timeout: Duration,
    /// The application this replica replicates.
    pub service: S,
    /// The transport used to reach peer replicas and clients.
    pub transport: T,
    /// The digest scheme used to fingerprint requests and checkpoints.
    pub digest_scheme: D,
    /// The fault-injection table this replica starts with; almost
    /// always `MaliceTable::new()` (every kind behaving normally)
    /// outside of tests exercising the Byzantine paths.
    pub initial_malice: MaliceTable,
}

/// Replica state touched while handling an inbound message: guarded by
/// a single lock, per §5.
struct Shared<S: Application> {
    view: View,
    consensus: Consensus<Request<S>, Reply<S>>,
    synchronizer: Synchronizer<Request<S>>,
    service: S,
    app_state: State<S>,
    malice: MaliceTable,
    request_timers: HashMap<(NodeId, u64), TimerHandle>,
}

/// A read-only snapshot of a replica's agreement state, for admin
/// tooling and demos. Grounded on the original implementation's
/// `getServerInfo()` introspection call.
#[derive(Debug, Copy, Clone)]
pub struct ReplicaStatus {
    pub id: NodeId,
    pub view: u32,
    pub seq: SeqNo,
    pub n: usize,
}

/// A single replica's agreement actor.
///
/// Constructed with [`Replica::new`], which also hands back the
/// [`MessageChannelRx`] to drive with [`Replica::run`] — typically
/// spawned onto the async runtime as its own task.
pub struct Replica<S: Application, T, D> {
    id: NodeId,
    request_timeout: Duration,
    transport: T,
    digest_scheme: D,
    timeouts: TimeoutsHandle<Request<S>, Reply<S>>,
    tx: MessageChannelTx<Request<S>, Reply<S>>,
    shared: Mutex<Shared<S>>,
}

impl<S, T, D> Replica<S, T, D>
where
    S: Application,
    Request<S>: AsRef<[u8]> + Default + Send + 'static,
    Reply<S>: Clone + Send + 'static,
    T: Transport<Request<S>, Reply<S>>,
    D: DigestScheme,
{
    /// Builds a new replica from `config`, returning it alongside the
    /// receiving half of its message channel.
    pub fn new(
        config: ReplicaConfig<S, T, D>,
    ) -> Result<(Arc<Self>, MessageChannelRx<Request<S>, Reply<S>>)> {
        let (tx, rx) = new_message_channel(1024);
        let replica = Self::with_channel(config, tx)?;
        Ok((replica, rx))
    }

    /// Builds a new replica from `config`, delivering inbound messages
    /// onto the externally supplied `tx` rather than a freshly created
    /// channel.
    ///
    /// Used when wiring a closed group of replicas (e.g. the demo
    /// cluster, or the integration test suite): every peer's
    /// [`Transport`] needs a `MessageChannelTx` to route to before any
    /// of the replicas it addresses have finished constructing, so the
    /// channel pair is created by the caller ahead of time and the
    /// matching receiver is driven directly with [`Replica::run`].
    pub fn with_channel(
        config: ReplicaConfig<S, T, D>,
        tx: MessageChannelTx<Request<S>, Reply<S>>,
    ) -> Result<Arc<Self>> {
        let timeouts = TimeoutsHandle::new(tx.clone());

        let mut service = config.service;
        let app_state = service.initial_state()?;
        let view = View::new(config.n, config.f);

        let shared = Mutex::new(Shared {
            view,
            consensus: Consensus::new(config.id, config.f),
            synchronizer: Synchronizer::new(config.id),
            service,
            app_state,
            malice: config.initial_malice,
            request_timers: HashMap::default(),
        });

        Ok(Arc::new(Self {
            id: config.id,
            request_timeout: config.request_timeout,
            transport: config.transport,
            digest_scheme: config.digest_scheme,
            timeouts,
            tx,
            shared,
        }))
    }

    /// Returns this replica's own id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns a sender clone for this replica's inbound message
    /// channel, for a peer's [`Transport`] to route messages into.
    pub fn sender(&self) -> MessageChannelTx<Request<S>, Reply<S>> {
        self.tx.clone()
    }

    /// Read-only introspection snapshot, for admin tooling and demos.
    pub fn status(&self) -> ReplicaStatus {
        let shared = self.shared.lock();
        ReplicaStatus {
            id: self.id,
            view: shared.view.number(),
            seq: shared.consensus.log().max_committed(),
            n: shared.view.n(),
        }
    }

    /// Configures fault injection for outbound messages of kind
    /// `kind` (every kind, if `None`), per §4.5.
    pub fn set_malice_mode(&self, kind: Option<MessageKind>, mode: MaliceMode, n: usize) -> Result<()> {
        self.shared.lock().malice.set_mode(kind, mode, n)
    }

    /// Submits a request directly to this replica, bypassing the
    /// transport. Used by an in-process client that shares the
    /// process with one of the replicas it talks to.
    pub fn submit(&self, request: RequestMessage<Request<S>>) {
        let mut shared = self.shared.lock();
        self.handle_submit(&mut shared, request);
    }

    /// Drives this replica's inbound message loop until `rx` closes.
    pub async fn run(self: Arc<Self>, mut rx: MessageChannelRx<Request<S>, Reply<S>>) {
        while let Ok(message) = rx.recv().await {
            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: Message<Request<S>, Reply<S>>) {
        match message {
            Message::System(header, system) => self.on_system_message(header, system),
            Message::Timeout(TimeoutKind::Request { client_id, timestamp }) => {
                self.on_request_timeout(client_id, timestamp)
            }
            // transport failures are tolerated by construction: the
            // request timer, not this event, is what drives recovery
            Message::Error(_, _) => {}
        }
    }

    fn on_system_message(&self, header: Header, message: SystemMessage<Request<S>, Reply<S>>) {
        let mut shared = self.shared.lock();
        match message {
            SystemMessage::Request(request) => self.handle_submit(&mut shared, request),
            SystemMessage::Consensus(m) => self.handle_consensus(&mut shared, header.from(), m),
            SystemMessage::Checkpoint(m) => self.handle_checkpoint(&mut shared, header.from(), m),
            SystemMessage::ViewChange(m) => self.handle_view_change(&mut shared, m),
            SystemMessage::NewView(m) => self.handle_new_view(&mut shared, m),
            // a reply is only ever addressed to a client
            SystemMessage::Reply(_) => {}
        }
    }

    fn handle_submit(&self, shared: &mut Shared<S>, request: RequestMessage<Request<S>>) {
        let client_id = request.client_id();
        let timestamp = request.timestamp();
        let view = shared.view;

        if shared.consensus.log().cached_reply(client_id, timestamp).is_none() {
            self.arm_timer(shared, client_id, timestamp);
        }

        let status = shared.consensus.submit_request(
            view,
            request,
            &self.digest_scheme,
            &self.transport,
            &shared.malice,
        );
        self.handle_status(shared, status);
    }

    fn handle_consensus(&self, shared: &mut Shared<S>, from: NodeId, m: ConsensusMessage<Request<S>>) {
        let view = shared.view;
        let status = match m.kind() {
            ConsensusMessageKind::PrePrepare(..) => shared.consensus.on_pre_prepare(
                from,
                view,
                m,
                &self.digest_scheme,
                &self.transport,
                &shared.malice,
            ),
            ConsensusMessageKind::Prepare(_) => {
                shared.consensus.on_prepare(from, view, m, &self.transport, &shared.malice)
            }
            ConsensusMessageKind::Commit(_) => {
                let service = &mut shared.service;
                let app_state = &mut shared.app_state;
                shared
                    .consensus
                    .on_commit(view, m, from, move |op| service.update(app_state, op.clone()))
            }
        };
        self.handle_status(shared, status);
    }

    /// Common tail of every handler that may cause a sequence number
    /// to commit: delivers the reply, cancels the request timer, and
    /// checks whether a new checkpoint should now be proposed.
    fn handle_status(&self, shared: &mut Shared<S>, status: ConsensusStatus<Reply<S>>) {
        if let ConsensusStatus::Decided { seq, client_id, timestamp, reply } = status {
            if let Some(timer) = shared.request_timers.remove(&(client_id, timestamp)) {
                timer.cancel();
            }
            self.transport.send(
                self.id,
                client_id,
                SystemMessage::Reply(ReplyMessage::new(shared.view, timestamp, self.id, reply)),
            );
            self.maybe_checkpoint(shared, seq);
        }
    }

    fn maybe_checkpoint(&self, shared: &mut Shared<S>, _committed_seq: SeqNo) {
        if let Info::BeginCheckpoint { seq } = shared.consensus.should_checkpoint() {
            let digest = shared.service.fingerprint(&shared.app_state);
            shared.consensus.log_mut().record_checkpoint(seq, self.id, digest);

            let message = SystemMessage::Checkpoint(CheckpointMessage::new(seq, digest));
            malice::broadcast(&shared.malice, MessageKind::Checkpoint, &self.transport, self.id, message, |_| {
                SystemMessage::Checkpoint(CheckpointMessage::new(
                    seq,
                    crate::bft::crypto::hash::Digest::from_data(b"castellan-malice-sentinel"),
                ))
            });
        }
    }

    fn handle_checkpoint(&self, shared: &mut Shared<S>, from: NodeId, m: CheckpointMessage) {
        let seq = m.sequence_number();
        let digest = *m.digest();
        shared.consensus.log_mut().on_checkpoint_vote(seq, from, digest);
    }

    fn handle_view_change(&self, shared: &mut Shared<S>, m: ViewChangeMessage<Request<S>>) {
        let view = shared.view;
        let is_prospective_primary = {
            let log = shared.consensus.log();
            shared.synchronizer.on_view_change(view, log, m)
        };
        if !is_prospective_primary {
            return;
        }

        let next_view = view.next_view();
        if let Some(nv) = shared.synchronizer.try_new_view(next_view) {
            let message = SystemMessage::NewView(nv);
            malice::broadcast(&shared.malice, MessageKind::NewView, &self.transport, self.id, message, |_| {
                SystemMessage::NewView(NewViewMessage::new(next_view, vec![], vec![]))
            });
        }
    }

    fn handle_new_view(&self, shared: &mut Shared<S>, m: NewViewMessage<Request<S>>) {
        let view = shared.view;
        match shared.synchronizer.on_new_view(view, m) {
            SynchronizerStatus::NewViewInstalled { view: new_view, preprepares } => {
                log::info!("replica {:?} installing view {}", self.id, new_view.number());
                shared.view = new_view;
                let primary = NodeId::from(new_view.leader());

                for (seq, pp) in preprepares {
                    shared.consensus.log_mut().discard(seq);
                    let status = shared.consensus.on_pre_prepare(
                        primary,
                        new_view,
                        pp,
                        &self.digest_scheme,
                        &self.transport,
                        &shared.malice,
                    );
                    self.handle_status(shared, status);
                }

                // requests still pending under the old view keep their
                // timer running, but against the new primary's deadline
                let pending: Vec<(NodeId, u64)> = shared.request_timers.keys().copied().collect();
                for (client_id, timestamp) in pending {
                    self.arm_timer(shared, client_id, timestamp);
                }
            }
            SynchronizerStatus::Nil => {}
        }
    }

    fn on_request_timeout(&self, client_id: NodeId, timestamp: u64) {
        let mut shared = self.shared.lock();
        // the request may have committed in the window between the
        // timer firing and this handler acquiring the lock
        if shared.request_timers.remove(&(client_id, timestamp)).is_none() {
            return;
        }

        let view = shared.view;
        let vc = shared.synchronizer.initiate_view_change(view, shared.consensus.log());
        let next_view = view.next_view();
        log::warn!(
            "replica {:?} timed out waiting on client {:?} timestamp {}, proposing view {}",
            self.id, client_id, timestamp, next_view.number()
        );

        let message = SystemMessage::ViewChange(vc);
        malice::broadcast(&shared.malice, MessageKind::ViewChange, &self.transport, self.id, message, |_| {
            SystemMessage::ViewChange(ViewChangeMessage::new(next_view, self.id, SeqNo::ZERO, None, vec![]))
        });
    }

    /// Arms (or rearms, cancelling whatever was running) the request
    /// timer for `(client_id, timestamp)`.
    fn arm_timer(&self, shared: &mut Shared<S>, client_id: NodeId, timestamp: u64) {
        if let Some(old) = shared.request_timers.remove(&(client_id, timestamp)) {
            old.cancel();
        }
        let handle = self
            .timeouts
            .schedule(self.request_timeout, TimeoutKind::Request { client_id, timestamp });
        shared.request_timers.insert((client_id, timestamp), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::message::Header;
    use crate::bft::communication::serialize::SharedData;
    use crate::bft::crypto::hash::{Digest, DefaultDigestScheme};

    struct KvStoreData;

    impl SharedData for KvStoreData {
        type State = String;
        type Request = String;
        type Reply = String;
    }

    struct EchoApp;

    impl Application for EchoApp {
        type Data = KvStoreData;

        fn initial_state(&mut self) -> Result<String> {
            Ok(String::new())
        }

        fn update(&mut self, state: &mut String, request: String) -> String {
            state.push_str(&request);
            request
        }

        fn fingerprint(&self, state: &String) -> Digest {
            Digest::from_data(state.as_bytes())
        }
    }

    struct NullTransport;

    impl Transport<String, String> for NullTransport {
        fn targets(&self) -> &[NodeId] {
            &[]
        }

        fn send(&self, _from: NodeId, _target: NodeId, _message: SystemMessage<String, String>) {}
    }

    fn config(id: u32) -> ReplicaConfig<EchoApp, NullTransport, DefaultDigestScheme> {
        ReplicaConfig {
            id: NodeId::from(id),
            n: 4,
            f: 1,
            request_timeout: Duration::from_secs(5),
            service: EchoApp,
            transport: NullTransport,
            digest_scheme: DefaultDigestScheme,
            initial_malice: MaliceTable::new(),
        }
    }

    #[test]
    fn primary_allocates_sequence_on_submit() {
        let (replica, _rx) = Replica::new(config(0)).unwrap();
        replica.submit(RequestMessage::new(NodeId::from(10), 1, "op".to_string()));

        let shared = replica.shared.lock();
        assert_eq!(
            shared.consensus.log().entry(SeqNo::from(1)).unwrap().phase(),
            crate::bft::log::Phase::PrePrepared,
        );
    }

    #[test]
    fn backup_forwards_request_to_primary_without_logging_it() {
        let (replica, _rx) = Replica::new(config(1)).unwrap();
        replica.submit(RequestMessage::new(NodeId::from(10), 1, "op".to_string()));

        let shared = replica.shared.lock();
        assert!(shared.consensus.log().entry(SeqNo::from(1)).is_none());
    }

    #[test]
    fn checkpoint_vote_is_recorded_on_receipt() {
        let (replica, _rx) = Replica::new(config(0)).unwrap();
        let digest = Digest::from_data(b"state");
        let header = Header::new(NodeId::from(1), NodeId::from(0));
        replica.on_system_message(
            header,
            SystemMessage::Checkpoint(CheckpointMessage::new(SeqNo::from(10), digest)),
        );
        // recording alone, without a quorum, must not stabilize a checkpoint
        let shared = replica.shared.lock();
        assert!(shared.consensus.log().last_stable_checkpoint().is_none());
    }
}
