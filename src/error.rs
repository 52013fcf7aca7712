//! Client error taxonomy.

use std::io;

use thiserror::Error;

use crate::config::NodeId;
use crate::wire::ErrorCode;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Every failure a client operation can surface.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configuration is empty or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node id that is not part of the configuration.
    #[error("unknown node '{0}'")]
    UnknownNode(NodeId),

    /// Caller supplied an argument the protocol cannot carry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No node could be validated as master.
    #[error("could not determine master")]
    NoMaster,

    /// A node refused the request because it is not (or no longer) master.
    #[error("node is not master: {0}")]
    NotMaster(String),

    /// Socket-level failure talking to a node.
    #[error("transport failure with node '{node}': {source}")]
    Transport {
        node: NodeId,
        #[source]
        source: io::Error,
    },

    /// The connection to a node is gone.
    #[error("not connected to node '{0}'")]
    NotConnected(NodeId),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// Any other definitive server verdict.
    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    /// Malformed or corrupted frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Failures that mean the master is unknown, lost or unreachable.
    ///
    /// These are the only errors the master retry policy recovers from.
    pub fn is_master_loss(&self) -> bool {
        matches!(
            self,
            ClientError::NoMaster
                | ClientError::NotMaster(_)
                | ClientError::Transport { .. }
                | ClientError::NotConnected(_)
        )
    }

    /// Failures after which the connection that produced them can't be reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Transport { .. } | ClientError::NotConnected(_) | ClientError::Protocol(_)
        )
    }

    pub(crate) fn transport(node: &NodeId, source: io::Error) -> Self {
        ClientError::Transport {
            node: node.clone(),
            source,
        }
    }

    /// Map a server status code and message to the matching variant.
    pub(crate) fn from_server(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotMaster | ErrorCode::NoLongerMaster => ClientError::NotMaster(message),
            ErrorCode::NotFound => ClientError::NotFound(message),
            ErrorCode::AssertionFailed => ClientError::AssertionFailed(message),
            code => ClientError::Server { code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_loss_classification() {
        let node = NodeId::from("n0");
        assert!(ClientError::NoMaster.is_master_loss());
        assert!(ClientError::NotMaster("n1".into()).is_master_loss());
        assert!(ClientError::NotConnected(node.clone()).is_master_loss());
        assert!(ClientError::transport(&node, io::ErrorKind::BrokenPipe.into()).is_master_loss());

        assert!(!ClientError::NotFound("k".into()).is_master_loss());
        assert!(!ClientError::AssertionFailed("k".into()).is_master_loss());
        assert!(!ClientError::InvalidConfig("empty".into()).is_master_loss());
        assert!(!ClientError::UnknownNode(node).is_master_loss());
        assert!(!ClientError::Protocol("bad crc".into()).is_master_loss());
    }

    #[test]
    fn test_connection_poisoning() {
        let node = NodeId::from("n0");
        assert!(ClientError::Protocol("bad crc".into()).poisons_connection());
        assert!(ClientError::transport(&node, io::ErrorKind::TimedOut.into()).poisons_connection());
        assert!(!ClientError::NotFound("k".into()).poisons_connection());
        assert!(!ClientError::NotMaster("n1".into()).poisons_connection());
    }

    #[test]
    fn test_server_code_mapping() {
        assert!(matches!(
            ClientError::from_server(ErrorCode::NoLongerMaster, "x".into()),
            ClientError::NotMaster(_)
        ));
        assert!(matches!(
            ClientError::from_server(ErrorCode::NotFound, "k".into()),
            ClientError::NotFound(m) if m == "k"
        ));
        assert!(matches!(
            ClientError::from_server(ErrorCode::GoingDown, "bye".into()),
            ClientError::Server { code: ErrorCode::GoingDown, .. }
        ));
    }
}
