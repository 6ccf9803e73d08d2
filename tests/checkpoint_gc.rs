//! S3: after `CHECKPOINT_INTERVAL` committed requests, a matching
//! quorum of `Checkpoint` votes must stabilize the checkpoint and slide
//! every replica's low watermark forward.

mod common;

use common::Cluster;

use castellan::bft::communication::message::SystemMessage;
use castellan::bft::communication::NodeId;
use castellan::bft::core::client::ClientDriver;
use castellan::bft::log::CHECKPOINT_INTERVAL;
use castellan::bft::ordering::{Orderable, SeqNo};

#[test]
fn s3_checkpoint_quorum_stabilizes_and_slides_low_water() {
    let mut cluster = Cluster::new(4, 1);
    let client_id = NodeId::from(100);
    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, 1);

    for i in 0..CHECKPOINT_INTERVAL {
        let request = client.new_request(format!("op-{i}"));
        cluster.submit(client_id, request);
        cluster.run_to_quiescence();
        cluster.drain_client_replies(client_id);
    }

    let boundary = SeqNo::from(CHECKPOINT_INTERVAL);
    for node in &cluster.nodes {
        assert!(node.log().entry(boundary).expect("boundary seq logged").phase()
            == castellan::bft::log::Phase::Committed);
        assert!(matches!(node.consensus.should_checkpoint(), castellan::bft::log::Info::BeginCheckpoint { seq } if seq == boundary));
    }

    // every replica proposes its own checkpoint at the boundary, each
    // agreeing on the digest already carried by the log entry there
    let votes: Vec<(NodeId, castellan::bft::crypto::hash::Digest)> = cluster
        .nodes
        .iter()
        .map(|node| (node.id, *node.log().entry(boundary).unwrap().digest()))
        .collect();

    for (from, digest) in votes {
        let message = common::checkpoint_message(CHECKPOINT_INTERVAL, digest);
        cluster.deliver_to_all(from, SystemMessage::Checkpoint(message));
    }
    cluster.run_to_quiescence();

    for node in &cluster.nodes {
        assert_eq!(node.log().low_water(), boundary);
        let stable = node.log().last_stable_checkpoint().expect("checkpoint stabilized");
        assert_eq!(stable.sequence_number(), boundary);
    }
}

#[test]
fn s3b_sub_quorum_checkpoint_votes_do_not_stabilize() {
    let mut cluster = Cluster::new(4, 1);
    let client_id = NodeId::from(100);
    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, 1);

    for i in 0..CHECKPOINT_INTERVAL {
        let request = client.new_request(format!("op-{i}"));
        cluster.submit(client_id, request);
        cluster.run_to_quiescence();
        cluster.drain_client_replies(client_id);
    }

    let boundary = SeqNo::from(CHECKPOINT_INTERVAL);
    let digest = *cluster.nodes[0].log().entry(boundary).unwrap().digest();

    // only two of four replicas vote: short of the 2f+1 = 3 quorum
    for id in [NodeId::from(0), NodeId::from(1)] {
        let message = common::checkpoint_message(CHECKPOINT_INTERVAL, digest);
        cluster.deliver_to_all(id, SystemMessage::Checkpoint(message));
    }
    cluster.run_to_quiescence();

    for node in &cluster.nodes {
        assert!(node.log().last_stable_checkpoint().is_none());
        assert_eq!(node.log().low_water(), SeqNo::ZERO);
    }
}
