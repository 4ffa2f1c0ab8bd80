use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{unbounded, Receiver};
use log::{error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use paxos::{ClientId, InMemoryStore, NodeId};

use crate::client::Client;
use crate::config::ClusterConfig;
use crate::error::{ClientError, StartError};
use crate::node::{Address, Bus, Envelope, Node};

/// A replica group running in this process, one event loop per replica on a dedicated thread pool.
pub struct Cluster {
    config: ClusterConfig,
    nodes: Vec<NodeId>,
    bus: Bus,
    #[allow(dead_code)]
    pool: ThreadPool,
    stopped: Receiver<(NodeId, InMemoryStore)>,
    next_client: AtomicU32,
    running: bool,
}

impl Cluster {
    /// Validates `config` and starts every replica of its topology.
    pub fn start(config: ClusterConfig) -> Result<Self, StartError> {
        config.validate()?;
        let nodes: Vec<NodeId> = config.paxos.topology.nodes().collect();
        let names = nodes.clone();
        let pool = ThreadPoolBuilder::new()
            .thread_name(move |index| match names.get(index) {
                Some(id) => format!("replica {}", id),
                None => format!("replica #{}", index),
            })
            .num_threads(nodes.len())
            .panic_handler(|_| error!("replica event loop panicked"))
            .build()?;

        let bus = Bus::new();
        let (tx, rx) = unbounded();
        for &id in &nodes {
            let node = Node::new(id, config.paxos.clone(), bus.clone());
            let tx = tx.clone();
            pool.spawn(move || {
                let store = node.run();
                let _ = tx.send((id, store));
            });
        }
        info!(
            "cluster of {} replicas in {} zones started, fz={} policy={}",
            nodes.len(),
            config.paxos.topology.z(),
            config.paxos.fz,
            config.paxos.policy
        );

        Ok(Cluster {
            config,
            nodes,
            bus,
            pool,
            stopped: rx,
            next_client: AtomicU32::new(1),
            running: true,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// A new client issuing requests from `zone`.
    pub fn client(&self, zone: u16) -> Result<Client, ClientError> {
        let local: Vec<NodeId> = self.nodes.iter().copied().filter(|id| id.zone == zone).collect();
        if local.is_empty() {
            return Err(ClientError::UnknownZone(zone));
        }
        let id = ClientId::new(zone, self.next_client.fetch_add(1, Ordering::Relaxed));
        Ok(Client::new(
            id,
            self.bus.clone(),
            local,
            self.config.request_timeout,
            self.config.retries,
        ))
    }

    /// Stops every replica and returns their stores.
    pub fn shutdown(mut self) -> BTreeMap<NodeId, InMemoryStore> {
        self.stop()
    }

    fn stop(&mut self) -> BTreeMap<NodeId, InMemoryStore> {
        let mut stores = BTreeMap::new();
        if !self.running {
            return stores;
        }
        self.running = false;
        self.bus
            .multicast(|address| matches!(address, Address::Node(_)), Envelope::Stop);
        while stores.len() < self.nodes.len() {
            match self.stopped.recv() {
                Ok((id, store)) => {
                    stores.insert(id, store);
                }
                Err(_) => {
                    warn!("{} of {} replicas did not stop cleanly", self.nodes.len() - stores.len(), self.nodes.len());
                    break;
                }
            }
        }
        info!("cluster stopped");
        stores
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
