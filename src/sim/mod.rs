//! In-process simulated cluster.
//!
//! Each node is a thread reading [`Packet`](node::Packet)s from a crossbeam
//! channel and answering real protocol frames, so the client is exercised
//! through the same codec it uses over TCP. Node beliefs about the master
//! are set directly by the test; there is no election.
//!
//! Provides:
//! - master beliefs per node (`set_master`, `set_belief`)
//! - crash and restart (`kill`, `revive`); a revived node keeps its stale store
//! - injected send failures (`fail_next_sends`)
//! - per-node counters (`node_stats`)
//!
//! # Invariants
//! - Writes are accepted only by a node that believes itself master.
//! - A committed write reaches every live node before it is acknowledged.
//! - Dirty reads are answered from the receiving node's own store.

mod connector;
mod node;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Sender};

use crate::config::{ClusterConfig, ClusterConfigBuilder, NodeId};
use crate::wire::Statistics;

pub use connector::{SimConnection, SimConnector, REPLY_TIMEOUT};
pub use node::{Store, SIM_VERSION};

use node::{ClusterState, NodeControl, NodeRunner, Packet};

/// Host every simulated node advertises in its configuration.
pub const SIM_HOST: &str = "sim.local";
/// Port of the first node; the rest follow in order.
pub const SIM_BASE_PORT: u16 = 4000;

/// Snapshot of one node's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// `WhoMaster` requests answered.
    pub who_master_probes: u64,
    /// Request frames received, of any kind.
    pub requests: u64,
    /// Connections that completed the handshake.
    pub connections_opened: u64,
    /// Connections closed by the client.
    pub connections_closed: u64,
}

/// A running simulated cluster. Dropping it stops every node thread.
pub struct SimCluster {
    state: Arc<ClusterState>,
    inboxes: BTreeMap<NodeId, Sender<Packet>>,
    handles: Vec<JoinHandle<()>>,
}

impl SimCluster {
    /// Start one thread per node. No node believes in a master yet.
    pub fn new(cluster_id: &str, nodes: &[&str]) -> Self {
        let controls: BTreeMap<NodeId, Arc<NodeControl>> = nodes
            .iter()
            .map(|n| (NodeId::from(*n), Arc::new(NodeControl::default())))
            .collect();
        let stores = controls
            .keys()
            .map(|n| (n.clone(), Store::new()))
            .collect();
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let state = Arc::new(ClusterState {
            cluster_id: cluster_id.to_string(),
            controls,
            stores: Mutex::new(stores),
            stats: Mutex::new(Statistics {
                start,
                last: start,
                ..Statistics::default()
            }),
        });

        let mut inboxes = BTreeMap::new();
        let mut handles = Vec::with_capacity(nodes.len());
        for (node_id, control) in &state.controls {
            let (tx, rx) = unbounded();
            let runner = NodeRunner {
                node_id: node_id.clone(),
                control: control.clone(),
                cluster: state.clone(),
            };
            handles.push(thread::spawn(move || runner.run(rx)));
            inboxes.insert(node_id.clone(), tx);
        }

        SimCluster {
            state,
            inboxes,
            handles,
        }
    }

    /// Configuration listing every node, ready for further tuning.
    pub fn config_builder(&self) -> ClusterConfigBuilder {
        self.state
            .controls
            .keys()
            .enumerate()
            .fold(
                ClusterConfig::builder(self.state.cluster_id.clone()),
                |builder, (i, node)| {
                    builder.node(node.clone(), SIM_HOST, SIM_BASE_PORT + i as u16)
                },
            )
    }

    /// Configuration with default tuning.
    pub fn config(&self) -> ClusterConfig {
        // A cluster built from at least one valid node id always validates.
        self.config_builder()
            .build()
            .expect("simulated cluster config is valid")
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            nodes: self
                .inboxes
                .iter()
                .map(|(id, tx)| (id.clone(), (tx.clone(), self.control(id.as_str()).clone())))
                .collect(),
        }
    }

    /// Make every node believe `master` leads (or that nobody does).
    pub fn set_master(&self, master: Option<&str>) {
        for control in self.state.controls.values() {
            control.set_belief(master.map(NodeId::from));
        }
    }

    /// Set what a single node answers to `WhoMaster`.
    pub fn set_belief(&self, node: &str, master: Option<&str>) {
        self.control(node).set_belief(master.map(NodeId::from));
    }

    /// Crash a node: new connections are refused and open ones fail.
    pub fn kill(&self, node: &str) {
        self.control(node).set_alive(false);
    }

    pub fn revive(&self, node: &str) {
        self.control(node).set_alive(true);
    }

    /// Fail the next `count` sends to `node`, on any connection.
    pub fn fail_next_sends(&self, node: &str, count: u32) {
        self.control(node).fail_next_sends(count);
    }

    pub fn node_stats(&self, node: &str) -> NodeStats {
        let control = self.control(node);
        NodeStats {
            who_master_probes: control.who_master_probes.load(Ordering::SeqCst),
            requests: control.requests.load(Ordering::SeqCst),
            connections_opened: control.connections_opened.load(Ordering::SeqCst),
            connections_closed: control.connections_closed.load(Ordering::SeqCst),
        }
    }

    /// Copy of a node's store.
    pub fn node_store(&self, node: &str) -> Store {
        self.state
            .stores
            .lock()
            .unwrap()
            .get(&NodeId::from(node))
            .cloned()
            .unwrap_or_default()
    }

    fn control(&self, node: &str) -> &Arc<NodeControl> {
        self.state
            .controls
            .get(&NodeId::from(node))
            .unwrap_or_else(|| panic!("no simulated node {}", node))
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        for tx in self.inboxes.values() {
            let _ = tx.send(Packet::Stop);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Connector;
    use crate::wire::{decode_opt_string, decode_unit, Request};

    #[test]
    fn test_config_lists_every_node() {
        let cluster = SimCluster::new("ricky", &["a", "b", "c"]);
        let config = cluster.config();
        assert_eq!(config.cluster_id(), "ricky");
        assert_eq!(config.nodes().len(), 3);
        assert_eq!(config.location(&"b".into()).unwrap().port, SIM_BASE_PORT + 1);
    }

    #[test]
    fn test_connection_answers_who_master() {
        let cluster = SimCluster::new("ricky", &["a", "b"]);
        cluster.set_belief("a", Some("b"));
        let config = cluster.config();
        let node = NodeId::from("a");

        let mut conn = cluster
            .connector()
            .connect(&node, config.location(&node).unwrap(), "ricky")
            .unwrap();
        conn.send(&Request::WhoMaster.encode()).unwrap();
        assert_eq!(decode_opt_string(&mut conn).unwrap().as_deref(), Some("b"));
        assert_eq!(cluster.node_stats("a").who_master_probes, 1);
        assert_eq!(cluster.node_stats("a").connections_opened, 1);

        conn.close();
        conn.close();
        assert_eq!(cluster.node_stats("a").connections_closed, 1);
    }

    #[test]
    fn test_wrong_cluster_is_refused() {
        let cluster = SimCluster::new("ricky", &["a"]);
        let config = cluster.config();
        let node = NodeId::from("a");

        let err = cluster
            .connector()
            .connect(&node, config.location(&node).unwrap(), "other")
            .err()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        assert_eq!(cluster.node_stats("a").connections_opened, 0);
    }

    #[test]
    fn test_killed_node_fails_open_connections() {
        let cluster = SimCluster::new("ricky", &["a"]);
        let config = cluster.config();
        let node = NodeId::from("a");
        let connector = cluster.connector();

        let mut conn = connector
            .connect(&node, config.location(&node).unwrap(), "ricky")
            .unwrap();
        cluster.kill("a");
        assert!(conn.send(&Request::WhoMaster.encode()).is_err());
        assert!(connector
            .connect(&node, config.location(&node).unwrap(), "ricky")
            .is_err());

        cluster.revive("a");
        let mut conn = connector
            .connect(&node, config.location(&node).unwrap(), "ricky")
            .unwrap();
        conn.send(&Request::Statistics.encode()).unwrap();
    }

    #[test]
    fn test_writes_replicate_to_live_nodes_only() {
        let cluster = SimCluster::new("ricky", &["a", "b", "c"]);
        cluster.set_master(Some("a"));
        cluster.kill("c");
        let config = cluster.config();
        let node = NodeId::from("a");

        let mut conn = cluster
            .connector()
            .connect(&node, config.location(&node).unwrap(), "ricky")
            .unwrap();
        let set = Request::Set {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        conn.send(&set.encode()).unwrap();
        decode_unit(&mut conn).unwrap();

        assert_eq!(cluster.node_store("a").get(&b"k"[..]), Some(&b"v".to_vec()));
        assert_eq!(cluster.node_store("b").get(&b"k"[..]), Some(&b"v".to_vec()));
        assert!(cluster.node_store("c").is_empty());
    }
}
