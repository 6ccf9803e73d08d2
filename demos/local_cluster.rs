//! Runs a 4-replica, `f = 1` castellan cluster entirely in one process,
//! wired together with `InProcessTransport`, and drives a handful of
//! client requests against an in-memory key-value store through them.
//!
//! Renamed from the teacher's `examples/bootstrap-local.rs` +
//! `examples/client-local.rs` pair into one file, since `examples/` is
//! reserved in this workspace for the read-only retrieval pack.

use std::time::Duration;

use castellan::bft::collections::HashMap;
use castellan::bft::communication::channel::new_message_channel;
use castellan::bft::communication::message::{Message, SystemMessage};
use castellan::bft::communication::serialize::SharedData;
use castellan::bft::communication::{InProcessTransport, NodeId, Transport};
use castellan::bft::core::client::{ClientDriver, ClientStatus};
use castellan::bft::core::server::{Replica, ReplicaConfig};
use castellan::bft::crypto::hash::{Digest, DefaultDigestScheme};
use castellan::bft::error::Result;
use castellan::bft::executable::Application;
use castellan::bft::{init, InitConfig};

struct KvStoreData;

impl SharedData for KvStoreData {
    type State = HashMap<String, String>;
    type Request = String;
    type Reply = String;
}

/// A trivial `SET key value` / `GET key` store. Operations are encoded
/// as plain strings so the consensus core can digest them via
/// `AsRef<[u8]>` without a serialization dependency of its own.
struct KvStore;

impl Application for KvStore {
    type Data = KvStoreData;

    fn initial_state(&mut self) -> Result<HashMap<String, String>> {
        Ok(HashMap::default())
    }

    fn update(&mut self, state: &mut HashMap<String, String>, request: String) -> String {
        let mut parts = request.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                state.insert(key.to_string(), value.to_string());
                "OK".to_string()
            }
            (Some("GET"), Some(key), None) => state.get(key).cloned().unwrap_or_default(),
            _ => "ERR".to_string(),
        }
    }

    fn fingerprint(&self, state: &HashMap<String, String>) -> Digest {
        let mut entries: Vec<(&String, &String)> = state.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut bytes = Vec::new();
        for (k, v) in entries {
            bytes.extend_from_slice(k.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(v.as_bytes());
            bytes.push(0);
        }
        Digest::from_data(&bytes)
    }
}

const N: usize = 4;
const F: usize = 1;
const CLIENT_ID: u32 = 100;

fn main() {
    env_logger::init();

    // every replica's timers and in-process sends route through the
    // global async runtime; it must come up before any replica runs.
    let _guard =
        unsafe { init(InitConfig { async_threads: num_cpus::get() }).expect("async runtime init") };

    castellan::bft::async_runtime::block_on(run_cluster());
}

async fn run_cluster() {
    let ids: Vec<NodeId> = (0..N as u32).map(NodeId::from).collect();
    let client_id = NodeId::from(CLIENT_ID);

    // every channel in the topology is created up front, so each
    // replica's transport can be wired with every peer's sender before
    // any replica has finished constructing.
    let mut senders = HashMap::default();
    let mut receivers = HashMap::default();
    for &id in &ids {
        let (tx, rx) = new_message_channel(1024);
        senders.insert(id, tx);
        receivers.insert(id, rx);
    }
    let (client_tx, mut client_rx) = new_message_channel(1024);
    senders.insert(client_id, client_tx);

    let mut replicas = Vec::new();
    for &id in &ids {
        let transport = InProcessTransport::new(senders.clone());
        let config = ReplicaConfig {
            id,
            n: N,
            f: F,
            request_timeout: Duration::from_secs(5),
            service: KvStore,
            transport,
            digest_scheme: DefaultDigestScheme,
            initial_malice: castellan::bft::malice::MaliceTable::new(),
        };
        let tx = senders.get(&id).cloned().expect("sender registered above");
        let replica = Replica::with_channel(config, tx).expect("replica construction");
        let rx = receivers.remove(&id).expect("receiver registered above");
        castellan::bft::async_runtime::spawn(replica.clone().run(rx));
        replicas.push(replica);
    }

    let mut client: ClientDriver<String, String> = ClientDriver::new(client_id, F);
    let client_transport = InProcessTransport::new(senders);

    // sent straight to the current primary (view 0's leader, replica 0):
    // broadcasting a fresh request here would have every backup forward
    // its own copy to the primary, which has no pre-commit dedup and
    // would burn a distinct sequence number per forwarded copy.
    let primary = ids[0];

    for op in ["SET alpha 1", "GET alpha", "SET alpha 1"] {
        let request = client.new_request(op.to_string());
        log::info!("client submitting {:?} as timestamp {}", op, request.timestamp());
        client_transport.send(client_id, primary, SystemMessage::Request(request));

        loop {
            let message = client_rx.recv().await.expect("client channel closed");
            let Message::System(header, SystemMessage::Reply(reply)) = message else {
                continue;
            };
            match client.on_reply(header.from(), reply) {
                ClientStatus::Ready(result) => {
                    println!("{op} -> {result}");
                    break;
                }
                ClientStatus::Waiting | ClientStatus::Nil => continue,
            }
        }
    }

    for replica in &replicas {
        let status = replica.status();
        println!(
            "replica {:?}: view={} seq={:?} n={}",
            status.id, status.view, status.seq, status.n
        );
    }
}
