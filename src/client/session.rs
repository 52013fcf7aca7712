//! Session state and the connection manager.
//!
//! # Invariants
//!
//! 1. **Single Lock**: the cached master, the connection table, the
//!    dirty-read node and the randomness source live in one `SessionState`
//!    reachable only through `Session::lock`.
//! 2. **One Channel per Node**: the connection table holds at most one entry
//!    per node id.
//! 3. **Evict on Failure**: a connection that failed to send, or produced a
//!    transport/integrity error while decoding, is closed and removed before
//!    the error leaves `dispatch`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ClusterConfig, NodeId, NodeLocation};
use crate::error::{ClientError, Result};
use crate::transport::{Connection, Connector};
use crate::wire::WireError;

/// Mutable state shared by every thread using one client.
struct SessionState {
    master: Option<NodeId>,
    connections: HashMap<NodeId, Box<dyn Connection>>,
    dirty_read_node: NodeId,
    rng: StdRng,
}

impl SessionState {
    /// Cached channel for `node`, opened on first use.
    fn connection(
        &mut self,
        node: &NodeId,
        location: &NodeLocation,
        cluster_id: &str,
        connector: &dyn Connector,
    ) -> io::Result<&mut Box<dyn Connection>> {
        match self.connections.entry(node.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let conn = connector.connect(node, location, cluster_id)?;
                debug!(node = %node, location = %location, "opened connection");
                Ok(entry.insert(conn))
            }
        }
    }

    /// Close and forget the channel for `node`, if any.
    fn evict(&mut self, node: &NodeId) {
        if let Some(mut conn) = self.connections.remove(node) {
            conn.close();
            debug!(node = %node, "evicted connection");
        }
    }

    /// Uniform jitter in `[0, ceiling]`.
    fn jitter(&mut self, ceiling: Duration) -> Duration {
        let nanos = ceiling.as_nanos().min(u64::MAX as u128) as u64;
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(0..=nanos))
    }
}

/// Connection manager and cached cluster view for one client.
pub(crate) struct Session {
    config: Arc<ClusterConfig>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        config: Arc<ClusterConfig>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        mut rng: StdRng,
    ) -> Result<Self> {
        let dirty_read_node = config
            .node_ids()
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| ClientError::InvalidConfig("node list empty".into()))?;

        Ok(Session {
            config,
            connector,
            clock,
            state: Mutex::new(SessionState {
                master: None,
                connections: HashMap::new(),
                dirty_read_node,
                rng,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // State stays consistent across a panicking holder: every mutation
        // is a single assignment or map operation.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn master(&self) -> Option<NodeId> {
        self.lock().master.clone()
    }

    pub(crate) fn set_master(&self, node: NodeId) {
        self.lock().master = Some(node);
    }

    pub(crate) fn invalidate_master(&self) {
        self.lock().master = None;
    }

    /// All configured node ids in a fresh random order.
    pub(crate) fn shuffled_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.config.node_ids();
        nodes.shuffle(&mut self.lock().rng);
        nodes
    }

    pub(crate) fn dirty_read_node(&self) -> NodeId {
        self.lock().dirty_read_node.clone()
    }

    pub(crate) fn set_dirty_read_node(&self, node: NodeId) -> Result<()> {
        if !self.config.contains(&node) {
            return Err(ClientError::UnknownNode(node));
        }
        self.lock().dirty_read_node = node;
        Ok(())
    }

    /// Node ids with an open channel, sorted.
    pub(crate) fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.lock().connections.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Close every open channel. A second call finds nothing to close.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.lock();
        for (node, mut conn) in state.connections.drain() {
            conn.close();
            debug!(node = %node, "closed connection");
        }
    }

    /// Send `frame` to `node` and decode its response.
    ///
    /// Holds the session lock for the whole attempt sequence. Attempt `i > 0`
    /// first sleeps a random jitter in `[0, i * backoff_scale]`. A failed send
    /// evicts the node's channel and forgets the cached master. Once a send
    /// succeeds, `decode` reads the response from the same channel.
    pub(crate) fn dispatch<T>(
        &self,
        node: &NodeId,
        frame: &[u8],
        max_attempts: u32,
        decode: impl FnOnce(&mut dyn Connection) -> std::result::Result<T, WireError>,
    ) -> Result<T> {
        let location = self.config.location(node)?;
        if max_attempts == 0 {
            return Err(ClientError::InvalidConfig(
                "dispatch needs at least one attempt".into(),
            ));
        }

        let mut state = self.lock();
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let pause = state.jitter(self.config.backoff_scale().saturating_mul(attempt));
                self.clock.sleep(pause);
            }

            let sent = state
                .connection(node, location, self.config.cluster_id(), self.connector.as_ref())
                .and_then(|conn| conn.send(frame));
            match sent {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        node = %node,
                        attempt,
                        error = %e,
                        "attempt to exchange message failed"
                    );
                    state.evict(node);
                    state.master = None;
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(ClientError::transport(node, e));
                    }
                }
            }
        }

        let conn = match state.connections.get_mut(node) {
            Some(conn) => conn,
            None => return Err(ClientError::NotConnected(node.clone())),
        };
        let err = match decode(conn.as_mut()) {
            Ok(value) => return Ok(value),
            Err(WireError::Server { code, message }) => ClientError::from_server(code, message),
            Err(WireError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                ClientError::Protocol(format!("node {}: {}", node, e))
            }
            Err(WireError::Io(e)) => ClientError::transport(node, e),
        };
        if err.poisons_connection() {
            warn!(node = %node, error = %err, "failed to read response");
            state.evict(node);
            state.master = None;
        }
        Err(err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.drop_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    use crate::clock::ManualClock;
    use crate::sim::SimCluster;
    use crate::wire::{self, Request};

    fn session(cluster: &SimCluster, attempts: u32, clock: Arc<ManualClock>) -> Session {
        let config = cluster
            .config_builder()
            .max_attempts(attempts)
            .backoff_scale(Duration::from_millis(100))
            .build()
            .unwrap();
        Session::new(
            Arc::new(config),
            Arc::new(cluster.connector()),
            clock,
            StdRng::seed_from_u64(7),
        )
        .unwrap()
    }

    fn who_master(session: &Session, node: &NodeId) -> Result<Option<String>> {
        session.dispatch(node, &Request::WhoMaster.encode(), 3, |c| {
            wire::decode_opt_string(c)
        })
    }

    #[test]
    fn test_dispatch_recovers_on_last_attempt() {
        let cluster = SimCluster::new("ricky", &["n0", "n1", "n2"]);
        cluster.set_master(Some("n0"));
        let clock = Arc::new(ManualClock::new());
        let session = session(&cluster, 3, clock.clone());
        let n0 = NodeId::from("n0");
        session.set_master(n0.clone());

        cluster.fail_next_sends("n0", 2);
        let answer = who_master(&session, &n0).unwrap();
        assert_eq!(answer.as_deref(), Some("n0"));

        let stats = cluster.node_stats("n0");
        assert_eq!(stats.connections_opened, 3);
        assert_eq!(stats.connections_closed, 2);
        assert_eq!(session.connected_nodes(), vec![n0]);
        // Failed attempts forget the master.
        assert_eq!(session.master(), None);

        // Two jitter pauses, bounded by attempt * scale.
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] <= Duration::from_millis(100));
        assert!(sleeps[1] <= Duration::from_millis(200));
    }

    #[test]
    fn test_dispatch_gives_up_after_max_attempts() {
        let cluster = SimCluster::new("ricky", &["n0", "n1"]);
        cluster.set_master(Some("n0"));
        let session = session(&cluster, 2, Arc::new(ManualClock::new()));

        cluster.fail_next_sends("n1", 5);
        let err = session
            .dispatch(&"n1".into(), &Request::WhoMaster.encode(), 2, |c| {
                wire::decode_opt_string(c)
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { ref node, .. } if node.as_str() == "n1"));
        assert!(session.connected_nodes().is_empty());
        assert_eq!(cluster.node_stats("n1").connections_closed, 2);
    }

    #[test]
    fn test_dispatch_unknown_node_is_configuration_error() {
        let cluster = SimCluster::new("ricky", &["n0"]);
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));

        let err = who_master(&session, &"n7".into()).unwrap_err();
        assert!(matches!(err, ClientError::UnknownNode(_)));
        assert_eq!(cluster.node_stats("n0").connections_opened, 0);
    }

    #[test]
    fn test_dispatch_zero_attempts_is_configuration_error() {
        let cluster = SimCluster::new("ricky", &["n0"]);
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));

        let err = session
            .dispatch(&"n0".into(), &Request::WhoMaster.encode(), 0, |c| {
                wire::decode_opt_string(c)
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_connection_reused_across_dispatches() {
        let cluster = SimCluster::new("ricky", &["n0", "n1"]);
        cluster.set_master(Some("n1"));
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));

        for _ in 0..5 {
            who_master(&session, &"n1".into()).unwrap();
        }
        assert_eq!(cluster.node_stats("n1").connections_opened, 1);
        assert_eq!(session.connected_nodes(), vec![NodeId::from("n1")]);
    }

    #[test]
    fn test_drop_connections_is_idempotent() {
        let cluster = SimCluster::new("ricky", &["n0", "n1", "n2"]);
        cluster.set_master(Some("n0"));
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));
        for node in ["n0", "n1", "n2"] {
            who_master(&session, &node.into()).unwrap();
        }
        assert_eq!(session.connected_nodes().len(), 3);

        session.drop_connections();
        session.drop_connections();
        assert!(session.connected_nodes().is_empty());
        for node in ["n0", "n1", "n2"] {
            assert_eq!(cluster.node_stats(node).connections_closed, 1);
        }

        // Dropping the session finds nothing left to close.
        drop(session);
        for node in ["n0", "n1", "n2"] {
            assert_eq!(cluster.node_stats(node).connections_closed, 1);
        }
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let cluster = SimCluster::new("ricky", &["n0", "n1"]);
        cluster.set_master(Some("n0"));
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));

        let get = Request::Get {
            key: b"missing".to_vec(),
            allow_dirty: false,
        };
        let err = session
            .dispatch(&"n0".into(), &get.encode(), 1, |c| wire::decode_bytes(c))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
        assert_eq!(session.connected_nodes(), vec![NodeId::from("n0")]);
    }

    #[test]
    fn test_dirty_read_node_override() {
        let cluster = SimCluster::new("ricky", &["n0", "n1"]);
        let session = session(&cluster, 1, Arc::new(ManualClock::new()));

        session.set_dirty_read_node("n1".into()).unwrap();
        assert_eq!(session.dirty_read_node(), NodeId::from("n1"));
        let err = session.set_dirty_read_node("n5".into()).unwrap_err();
        assert!(matches!(err, ClientError::UnknownNode(_)));
        assert_eq!(session.dirty_read_node(), NodeId::from("n1"));
    }
}
