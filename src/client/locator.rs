//! Master discovery.
//!
//! A master is only cached after the node itself confirms it: either the
//! probed node names itself, or it names another node which, asked in turn,
//! names itself too.

use tracing::{debug, error, warn};

use crate::config::NodeId;
use crate::error::{ClientError, Result};
use crate::wire::{self, Request};

use super::session::Session;

impl Session {
    /// Return the cached master, discovering it first if unknown.
    ///
    /// Probes every configured node at most once, in random order.
    pub(crate) fn resolve_master(&self) -> Result<NodeId> {
        if let Some(master) = self.master() {
            return Ok(master);
        }

        for node in self.shuffled_nodes() {
            match self.ask_master(&node) {
                Ok(Some(claimed)) if claimed == node => {
                    debug!(master = %node, "node reports itself as master");
                    self.set_master(node.clone());
                    return Ok(node);
                }
                Ok(Some(claimed)) => match self.ask_master(&claimed) {
                    Ok(Some(confirmed)) if confirmed == claimed => {
                        debug!(master = %claimed, via = %node, "master cross-validated");
                        self.set_master(claimed.clone());
                        return Ok(claimed);
                    }
                    Ok(other) => {
                        warn!(
                            node = %node,
                            claimed = %claimed,
                            answer = ?other,
                            "claimed master does not confirm"
                        );
                    }
                    Err(e) => {
                        warn!(claimed = %claimed, error = %e, "could not validate master");
                    }
                },
                Ok(None) => {
                    warn!(node = %node, "node does not know who the master is");
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "could not query node for master");
                }
            }
        }

        error!("could not determine master");
        Err(ClientError::NoMaster)
    }

    /// Ask `node` who it believes the master is.
    fn ask_master(&self, node: &NodeId) -> Result<Option<NodeId>> {
        let answer = self.dispatch(
            node,
            &Request::WhoMaster.encode(),
            self.config().max_attempts(),
            |c| wire::decode_opt_string(c),
        )?;
        Ok(answer.map(NodeId::from))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::SimCluster;

    const NODES: [&str; 3] = ["n0", "n1", "n2"];

    fn session(cluster: &SimCluster, seed: u64) -> Session {
        Session::new(
            Arc::new(cluster.config_builder().build().unwrap()),
            Arc::new(cluster.connector()),
            Arc::new(ManualClock::new()),
            StdRng::seed_from_u64(seed),
        )
        .unwrap()
    }

    fn total_probes(cluster: &SimCluster) -> u64 {
        NODES.iter().map(|n| cluster.node_stats(n).who_master_probes).sum()
    }

    #[test]
    fn test_resolves_self_reported_master() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(Some("n2"));

        for seed in 0..8 {
            let session = session(&cluster, seed);
            assert_eq!(session.resolve_master().unwrap(), NodeId::from("n2"));
            assert_eq!(session.master(), Some(NodeId::from("n2")));
        }
    }

    #[test]
    fn test_cached_master_skips_probing() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(Some("n0"));
        let session = session(&cluster, 1);

        session.resolve_master().unwrap();
        let probes = total_probes(&cluster);
        session.resolve_master().unwrap();
        session.resolve_master().unwrap();
        assert_eq!(total_probes(&cluster), probes);
    }

    #[test]
    fn test_cross_validation_accepts_confirmed_claim() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(Some("n1"));
        // n0 and n2 point at n1, which confirms.
        for seed in 0..8 {
            let session = session(&cluster, seed);
            assert_eq!(session.resolve_master().unwrap(), NodeId::from("n1"));
        }
    }

    #[test]
    fn test_cross_validation_discards_denied_claim() {
        let cluster = SimCluster::new("ricky", &NODES);
        // n0 claims n1 leads, but n1 says n2; n2 confirms itself.
        cluster.set_belief("n0", Some("n1"));
        cluster.set_belief("n1", Some("n2"));
        cluster.set_belief("n2", Some("n2"));

        for seed in 0..8 {
            let session = session(&cluster, seed);
            assert_eq!(session.resolve_master().unwrap(), NodeId::from("n2"));
        }
    }

    #[test]
    fn test_no_master_probes_each_node_once() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(None);
        let session = session(&cluster, 3);

        let err = session.resolve_master().unwrap_err();
        assert!(matches!(err, ClientError::NoMaster));
        for node in NODES {
            assert_eq!(cluster.node_stats(node).who_master_probes, 1);
        }
        assert_eq!(session.master(), None);
    }

    #[test]
    fn test_unreachable_nodes_are_skipped() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(Some("n2"));
        cluster.kill("n0");
        cluster.kill("n1");

        let session = session(&cluster, 5);
        assert_eq!(session.resolve_master().unwrap(), NodeId::from("n2"));
    }

    #[test]
    fn test_claim_of_unknown_node_is_discarded() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_belief("n0", Some("n9"));
        cluster.set_belief("n1", Some("n9"));
        cluster.set_belief("n2", Some("n9"));

        let session = session(&cluster, 2);
        assert!(matches!(session.resolve_master().unwrap_err(), ClientError::NoMaster));
    }

    #[test]
    fn test_all_nodes_down() {
        let cluster = SimCluster::new("ricky", &NODES);
        cluster.set_master(Some("n0"));
        for node in NODES {
            cluster.kill(node);
        }
        let session = session(&cluster, 9);
        assert!(matches!(session.resolve_master().unwrap_err(), ClientError::NoMaster));
    }
}
