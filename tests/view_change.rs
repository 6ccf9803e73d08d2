//! S4: a primary that silently drops its pre-prepare broadcast never
//! lets the group commit. Once backups suspect it and assemble a
//! view-change quorum, the new primary installs the next view and the
//! client's retransmitted request commits normally under it.

mod common;

use common::Cluster;

use castellan::bft::communication::message::SystemMessage;
use castellan::bft::communication::NodeId;
use castellan::bft::core::client::{ClientDriver, ClientStatus};
use castellan::bft::log::Phase;
use castellan::bft::malice::{MaliceMode, MessageKind};

#[test]
fn s4_primary_silence_triggers_view_change_and_new_primary_commits() {
    let mut cluster = Cluster::new(4, 1);
    let client_id = NodeId::from(100);
    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, 1);

    cluster.set_malice(NodeId::from(0), Some(MessageKind::PrePrepare), MaliceMode::Silent);

    let request = client.new_request("B".to_string());
    let ts = request.timestamp();
    cluster.submit(client_id, request);
    cluster.run_to_quiescence();

    // the primary pre-prepared the request on its own log but
    // suppressed the broadcast: nobody else ever heard about it
    assert!(cluster.drain_client_replies(client_id).is_empty());
    for id in [1usize, 2, 3] {
        assert!(cluster.nodes[id].log().entry(1.into()).is_none());
    }
    assert_eq!(cluster.nodes[0].log().entry(1.into()).unwrap().phase(), Phase::PrePrepared);

    let view0 = cluster.nodes[0].view;

    // backups 1..3 suspect the primary, as their request timers would
    // have, and each broadcasts a view-change
    for id in [1usize, 2, 3] {
        let vc = {
            let node = &cluster.nodes[id];
            node.synchronizer.initiate_view_change(node.view, node.log())
        };
        let from = cluster.nodes[id].id;
        cluster.deliver_to_all(from, SystemMessage::ViewChange(vc));
    }
    cluster.run_to_quiescence();

    for node in &cluster.nodes {
        assert_eq!(node.view.number(), view0.number() + 1);
    }
    assert_eq!(cluster.nodes[0].view.leader(), 1);

    // the client's retransmission timer fires; it resends every
    // pending request, now landing on the new primary
    for pending in client.retransmit_pending() {
        cluster.submit(client_id, pending);
    }
    cluster.run_to_quiescence();

    let mut accepted = None;
    for (from, reply) in cluster.drain_client_replies(client_id) {
        if reply.timestamp() != ts {
            continue;
        }
        if let ClientStatus::Ready(result) = client.on_reply(from, reply) {
            accepted = Some(result);
        }
    }
    assert_eq!(accepted.as_deref(), Some("B"));

    for node in &cluster.nodes {
        let entry = node.log().entry(1.into()).expect("seq 1 committed under the new view");
        assert_eq!(entry.phase(), Phase::Committed);
    }
}
