//! Three replicas in one zone order a write and a read of the same key.

use std::collections::VecDeque;
use std::str;
use std::time::Instant;

use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use paxos::message::Action;
use paxos::{ClientId, Command, Config, InMemoryStore, Message, NodeId, Replica, Request, Topology};

enum Envelope {
    Message(Message),
    Request(Request),
}

fn main() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();

    let config = Config::new(Topology::uniform(1, 3));
    let mut replicas = config
        .topology
        .nodes()
        .map(|id| {
            let seed = u64::from(id.node);
            Replica::new(id, config.clone(), InMemoryStore::new(), ChaChaRng::seed_from_u64(seed))
        })
        .collect::<Vec<_>>();
    let ids: Vec<NodeId> = replicas.iter().map(|replica| replica.id()).collect();
    let index = |id: NodeId| usize::from(id.node) - 1;

    // Deliver reliably and instantly; election retries are never needed.
    let mut inboxes: Vec<VecDeque<Envelope>> = (0..replicas.len()).map(|_| VecDeque::new()).collect();
    let client = ClientId::new(1, 1);
    let write = Request::new(1, client, Command::put(42, "Hello world!"));
    let read = Request::new(2, client, Command::get(42));
    inboxes[0].push_back(Envelope::Request(write));

    let mut answered = 0;
    while answered < 2 {
        for position in 0..replicas.len() {
            while let Some(envelope) = inboxes[position].pop_front() {
                let now = Instant::now();
                let replica = &mut replicas[position];
                let from = replica.id();
                let actions = match envelope {
                    Envelope::Message(message) => replica.receive(message, now),
                    Envelope::Request(request) => replica.handle_request(request, now),
                };
                for action in actions {
                    match action {
                        Action::Send(sendable) => {
                            println!("replica {} sends {}", from, sendable);
                            for &to in &ids {
                                if sendable.dest.includes(from, to) {
                                    inboxes[index(to)].push_back(Envelope::Message(sendable.message.clone()));
                                }
                            }
                        }
                        Action::Forward { to, request } => {
                            println!("replica {} forwards request {} to {}", from, request.id, to);
                            inboxes[index(to)].push_back(Envelope::Request(request));
                        }
                        Action::Reply(reply) => {
                            let value = reply.value.as_deref().map(str::from_utf8);
                            println!("replica {} answers {} at slot {}: {:?}", from, reply.command, reply.slot, value);
                            answered += 1;
                            if reply.request == 1 {
                                // Read back through a replica that does not lead the key.
                                inboxes[2].push_back(Envelope::Request(read.clone()));
                            }
                        }
                        Action::Schedule { .. } | Action::Cancel(_) => {}
                    }
                }
            }
        }
    }

    for replica in &replicas {
        let value = replica.store().get(42).map(|value| str::from_utf8(value));
        println!("replica {} holds {:?}", replica.id(), value);
    }
}
