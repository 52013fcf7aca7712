//! Dirty-read routing.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::NodeId;

use super::session::Session;

/// Decides whether a read may bypass the master.
///
/// The target node itself is kept in the session; this only holds the
/// runtime toggle.
#[derive(Debug, Default)]
pub(crate) struct DirtyReadRouter {
    enabled: AtomicBool,
}

impl DirtyReadRouter {
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Node to read from directly, or `None` to go through the master.
    pub(crate) fn target(&self, session: &Session) -> Option<NodeId> {
        if self.is_enabled() {
            Some(session.dirty_read_node())
        } else {
            None
        }
    }
}
