//! Transport seam between the client and the network.
//!
//! A [`Connector`] opens one [`Connection`] per node. A connection is a
//! reliable ordered byte stream: requests go out through `send`, responses
//! are read back through `Read` on the same object.

use std::io::{self, Read};

use crate::config::{NodeId, NodeLocation};

pub mod tcp;

pub use tcp::{TcpConnection, TcpConnector};

/// An open channel to one node.
pub trait Connection: Read + Send {
    /// Write a complete request frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Release the underlying resources. Further use fails.
    fn close(&mut self);
}

/// Opens connections to nodes.
pub trait Connector: Send + Sync {
    /// Connect to `node` at `location` and perform the cluster handshake.
    fn connect(
        &self,
        node: &NodeId,
        location: &NodeLocation,
        cluster_id: &str,
    ) -> io::Result<Box<dyn Connection>>;
}
