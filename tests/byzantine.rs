//! S5/S6: a single faulty replica equivocating on one phase of the
//! agreement protocol must not stop the other `2f + 1` correct
//! replicas from reaching quorum on the real digest.

mod common;

use common::Cluster;

use castellan::bft::communication::NodeId;
use castellan::bft::core::client::{ClientDriver, ClientStatus};
use castellan::bft::log::Phase;
use castellan::bft::malice::{MaliceMode, MessageKind};

#[test]
fn s5_full_fake_prepare_from_one_replica_does_not_block_quorum() {
    let mut cluster = Cluster::new(4, 1);
    let client_id = NodeId::from(100);
    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, 1);

    cluster.set_malice(NodeId::from(3), Some(MessageKind::Prepare), MaliceMode::FullFake);

    let request = client.new_request("A".to_string());
    let ts = request.timestamp();
    cluster.submit(client_id, request);
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
    assert_eq!(accepted.as_deref(), Some("A"));

    for node in &cluster.nodes {
        let entry = node.log().entry(1.into()).expect("sequence 1 logged");
        assert_eq!(entry.phase(), Phase::Committed, "replica {:?} failed to commit", node.id);
    }
}

#[test]
fn s6_partial_fake_commit_to_one_recipient_still_leaves_a_real_quorum() {
    let mut cluster = Cluster::new(4, 1);
    let client_id = NodeId::from(100);
    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, 1);

    cluster.set_malice(NodeId::from(2), Some(MessageKind::Commit), MaliceMode::PartialFake(1));

    let request = client.new_request("A".to_string());
    let ts = request.timestamp();
    cluster.submit(client_id, request);
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
    assert_eq!(accepted.as_deref(), Some("A"));

    for node in &cluster.nodes {
        let entry = node.log().entry(1.into()).expect("sequence 1 logged");
        assert_eq!(entry.phase(), Phase::Committed, "replica {:?} failed to commit", node.id);
    }
}
