//! Shared test harness: a small synchronous network simulation driving
//! several replicas' `Consensus`/`Synchronizer` engines directly,
//! cross-feeding messages through a shared queue exactly as the
//! `consensus` and `sync` modules' own unit tests cross-feed a handful
//! of instances by hand. Scaling that pattern up to a full N-replica
//! group, with a FIFO queue standing in for the network, gives
//! deterministic, round-by-round control over delivery order — the
//! property every scenario test below relies on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use castellan::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, CheckpointMessage, NewViewMessage, ReplyMessage,
    RequestMessage, SystemMessage, ViewChangeMessage,
};
use castellan::bft::communication::{NodeId, Transport};
use castellan::bft::consensus::{Consensus, ConsensusStatus};
use castellan::bft::crypto::hash::DefaultDigestScheme;
use castellan::bft::log::Log;
use castellan::bft::malice::{MaliceMode, MaliceTable, MessageKind};
use castellan::bft::ordering::{Orderable, SeqNo, View};
use castellan::bft::sync::{Synchronizer, SynchronizerStatus};

pub const CLIENT_ID: u32 = 100;

type Envelope = (NodeId, NodeId, SystemMessage<String, String>);

/// A [`Transport`] backed by a plain FIFO queue, shared by every node
/// in the simulated group. Every send is recorded in delivery order;
/// nothing is actually asynchronous.
#[derive(Clone)]
pub struct QueueTransport {
    targets: Vec<NodeId>,
    queue: Arc<Mutex<VecDeque<Envelope>>>,
}

impl Transport<String, String> for QueueTransport {
    fn targets(&self) -> &[NodeId] {
        &self.targets[..]
    }

    fn send(&self, from: NodeId, target: NodeId, message: SystemMessage<String, String>) {
        self.queue.lock().unwrap().push_back((from, target, message));
    }
}

/// One simulated replica: its agreement engine, view-change engine,
/// malice table, and the application state the `apply` closures feed
/// into — a plain `Vec<String>`, recording every operation that has
/// committed, in commit order.
pub struct Node {
    pub id: NodeId,
    pub view: View,
    pub consensus: Consensus<String, String>,
    pub synchronizer: Synchronizer<String>,
    pub malice: MaliceTable,
    pub applied: Vec<String>,
}

impl Node {
    fn new(id: NodeId, n: usize, f: usize) -> Self {
        Self {
            id,
            view: View::new(n, f),
            consensus: Consensus::new(id, f),
            synchronizer: Synchronizer::new(id),
            malice: MaliceTable::new(),
            applied: Vec::new(),
        }
    }

    pub fn log(&self) -> &Log<String, String> {
        self.consensus.log()
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    pub transport: QueueTransport,
    pub scheme: DefaultDigestScheme,
    pub client_replies: Vec<(NodeId, ReplyMessage<String>)>,
}

impl Cluster {
    pub fn new(n: usize, f: usize) -> Self {
        let targets: Vec<NodeId> = (0..n as u32).map(NodeId::from).collect();
        let transport = QueueTransport {
            targets,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        };
        let nodes = (0..n as u32).map(|i| Node::new(NodeId::from(i), n, f)).collect();
        Self {
            nodes,
            transport,
            scheme: DefaultDigestScheme,
            client_replies: Vec::new(),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.iter_mut().find(|n| n.id == id).expect("unknown node id")
    }

    /// Submits `message` directly to every replica, as if a client had
    /// broadcast it to the whole group.
    pub fn deliver_to_all(&mut self, from: NodeId, message: SystemMessage<String, String>) {
        let targets: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        for target in targets {
            self.transport.send(from, target, message.clone());
        }
    }

    /// Sends a fresh client request only to the replica this group's
    /// current view elects as primary — the steady-state path a client
    /// takes before any timeout, and the only one that can't leave the
    /// primary holding several sequence numbers for the same logical
    /// request (backups would each re-forward a broadcast submission
    /// to it, once per backup, before it had a chance to commit and
    /// populate its reply cache). A client falls back to broadcasting
    /// only once its retransmission timer fires, by which point any
    /// earlier attempt has either committed (and is served from cache)
    /// or the group has moved past the uncooperative primary via a
    /// view-change.
    pub fn submit(&mut self, client_id: NodeId, request: RequestMessage<String>) {
        let view = self.nodes[0].view;
        let primary = NodeId::from(view.leader());
        self.transport.send(client_id, primary, SystemMessage::Request(request));
    }

    /// Sets replica `id`'s malice mode for `kind` (every kind, if `None`).
    pub fn set_malice(&mut self, id: NodeId, kind: Option<MessageKind>, mode: MaliceMode) {
        let n = self.nodes.len();
        self.node_mut(id).malice.set_mode(kind, mode, n).unwrap();
    }

    fn apply_status(&mut self, id: NodeId, status: ConsensusStatus<String>) {
        if let ConsensusStatus::Decided { client_id, timestamp, reply, .. } = status {
            let view = self.node_mut(id).view;
            self.transport.send(
                id,
                client_id,
                SystemMessage::Reply(ReplyMessage::new(view, timestamp, id, reply)),
            );
        }
    }

    fn dispatch(&mut self, from: NodeId, to: NodeId, message: SystemMessage<String, String>) {
        let is_node = self.nodes.iter().any(|n| n.id == to);
        if !is_node {
            if let SystemMessage::Reply(reply) = message {
                self.client_replies.push((from, reply));
            }
            return;
        }

        match message {
            SystemMessage::Request(request) => {
                let view = self.node_mut(to).view;
                let transport = self.transport.clone();
                let scheme = self.scheme;
                let status = {
                    let node = self.node_mut(to);
                    let malice = std::mem::replace(&mut node.malice, MaliceTable::new());
                    let status = node.consensus.submit_request(view, request, &scheme, &transport, &malice);
                    self.node_mut(to).malice = malice;
                    status
                };
                self.apply_status(to, status);
            }
            SystemMessage::Consensus(m) => {
                let view = self.node_mut(to).view;
                let transport = self.transport.clone();
                let scheme = self.scheme;
                let status = match m.kind() {
                    ConsensusMessageKind::PrePrepare(..) => {
                        let node = self.node_mut(to);
                        let malice = std::mem::replace(&mut node.malice, MaliceTable::new());
                        let status = node.consensus.on_pre_prepare(from, view, m, &scheme, &transport, &malice);
                        self.node_mut(to).malice = malice;
                        status
                    }
                    ConsensusMessageKind::Prepare(_) => {
                        let node = self.node_mut(to);
                        let malice = std::mem::replace(&mut node.malice, MaliceTable::new());
                        let status = node.consensus.on_prepare(from, view, m, &transport, &malice);
                        self.node_mut(to).malice = malice;
                        status
                    }
                    ConsensusMessageKind::Commit(_) => {
                        let node = self.node_mut(to);
                        node.consensus.on_commit(view, m, from, |op| {
                            node_applied_push(&mut node.applied, op.clone());
                            op.clone()
                        })
                    }
                };
                self.apply_status(to, status);
            }
            SystemMessage::Checkpoint(m) => {
                let node = self.node_mut(to);
                let seq = m.sequence_number();
                let digest = *m.digest();
                node.consensus.log_mut().on_checkpoint_vote(seq, from, digest);
            }
            SystemMessage::ViewChange(m) => {
                let view = self.node_mut(to).view;
                let is_prospective_primary = {
                    let node = self.node_mut(to);
                    node.synchronizer.on_view_change(view, node.consensus.log(), m)
                };
                if !is_prospective_primary {
                    return;
                }
                let next_view = view.next_view();
                let maybe_nv = self.node_mut(to).synchronizer.try_new_view(next_view);
                if let Some(nv) = maybe_nv {
                    self.deliver_to_all(to, SystemMessage::NewView(nv));
                }
            }
            SystemMessage::NewView(m) => {
                let view = self.node_mut(to).view;
                let status = self.node_mut(to).synchronizer.on_new_view(view, m);
                if let SynchronizerStatus::NewViewInstalled { view: new_view, preprepares } = status {
                    self.node_mut(to).view = new_view;
                    let primary = NodeId::from(new_view.leader());
                    let transport = self.transport.clone();
                    let scheme = self.scheme;
                    for (seq, pp) in preprepares {
                        self.node_mut(to).consensus.log_mut().discard(seq);
                        let malice = {
                            let node = self.node_mut(to);
                            std::mem::replace(&mut node.malice, MaliceTable::new())
                        };
                        let status = self.node_mut(to).consensus.on_pre_prepare(
                            primary, new_view, pp, &scheme, &transport, &malice,
                        );
                        self.node_mut(to).malice = malice;
                        self.apply_status(to, status);
                    }
                }
            }
            SystemMessage::Reply(reply) => {
                self.client_replies.push((from, reply));
            }
        }
    }

    /// Drains the message queue until empty, dispatching every envelope
    /// to its addressed node (or recording it as a client reply).
    pub fn run_to_quiescence(&mut self) {
        loop {
            let next = self.transport.queue.lock().unwrap().pop_front();
            let Some((from, to, message)) = next else { break };
            self.dispatch(from, to, message);
        }
    }

    /// Drains every client reply collected so far that was addressed
    /// to `client_id`.
    pub fn drain_client_replies(&mut self, _client_id: NodeId) -> Vec<(NodeId, ReplyMessage<String>)> {
        std::mem::take(&mut self.client_replies)
    }
}

fn node_applied_push(applied: &mut Vec<String>, op: String) {
    applied.push(op);
}

pub fn req(client: u32, ts: u64, op: &str) -> RequestMessage<String> {
    RequestMessage::new(NodeId::from(client), ts, op.to_string())
}

pub fn consensus_message(
    view: View,
    seq: u32,
    kind: ConsensusMessageKind<String>,
) -> ConsensusMessage<String> {
    ConsensusMessage::new(view, seq.into(), kind)
}

pub fn checkpoint_message(seq: u32, digest: castellan::bft::crypto::hash::Digest) -> CheckpointMessage {
    CheckpointMessage::new(seq.into(), digest)
}

pub fn view_change_message(
    new_view: View,
    replica_id: NodeId,
) -> ViewChangeMessage<String> {
    ViewChangeMessage::new(new_view, replica_id, 0.into(), None, vec![])
}

pub fn new_view_message(
    view: View,
    view_change_summary: Vec<NodeId>,
    new_preprepares: Vec<(SeqNo, ConsensusMessage<String>)>,
) -> NewViewMessage<String> {
    NewViewMessage::new(view, view_change_summary, new_preprepares)
}
