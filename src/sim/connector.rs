//! In-process transport to a [`SimCluster`](super::SimCluster).

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use super::node::{NodeControl, Packet};
use crate::config::{NodeId, NodeLocation};
use crate::transport::{Connection, Connector};
use crate::wire::{decode_unit, encode_prologue};

/// How long a connection waits for a node thread to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to simulated nodes by id; the location is ignored.
#[derive(Clone)]
pub struct SimConnector {
    pub(crate) nodes: BTreeMap<NodeId, (Sender<Packet>, Arc<NodeControl>)>,
}

impl Connector for SimConnector {
    fn connect(
        &self,
        node: &NodeId,
        _location: &NodeLocation,
        cluster_id: &str,
    ) -> io::Result<Box<dyn Connection>> {
        let (inbox, control) = self.nodes.get(node).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no simulated node {}", node))
        })?;
        if !control.is_alive() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("node {} is down", node),
            ));
        }

        let reply = exchange(node, inbox, |reply| Packet::Hello {
            frame: encode_prologue(cluster_id),
            reply,
        })?;
        decode_unit(&reply[..])
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

        control.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimConnection {
            node: node.clone(),
            inbox: inbox.clone(),
            control: control.clone(),
            pending: VecDeque::new(),
            closed: false,
        }))
    }
}

fn exchange(
    node: &NodeId,
    inbox: &Sender<Packet>,
    packet: impl FnOnce(Sender<Vec<u8>>) -> Packet,
) -> io::Result<Vec<u8>> {
    let (reply_tx, reply_rx) = bounded(1);
    inbox.send(packet(reply_tx)).map_err(|_| {
        io::Error::new(
            io::ErrorKind::ConnectionAborted,
            format!("node {} stopped", node),
        )
    })?;
    reply_rx.recv_timeout(REPLY_TIMEOUT).map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("node {} did not answer", node),
        )
    })
}

/// One client connection to a simulated node.
pub struct SimConnection {
    node: NodeId,
    inbox: Sender<Packet>,
    control: Arc<NodeControl>,
    pending: VecDeque<u8>,
    closed: bool,
}

impl SimConnection {
    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        if !self.control.is_alive() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("node {} is down", self.node),
            ));
        }
        Ok(())
    }
}

impl Read for SimConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.pending.read(buf)
    }
}

impl Connection for SimConnection {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.check_open()?;
        if self.control.take_send_failure() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("injected send failure to {}", self.node),
            ));
        }
        let reply = exchange(&self.node, &self.inbox, |reply| Packet::Request {
            frame: frame.to_vec(),
            reply,
        })?;
        self.pending.extend(reply);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.control.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.close();
    }
}
