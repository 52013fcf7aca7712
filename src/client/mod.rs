//! Master-aware client for the replicated key-value store.
//!
//! Provides:
//! - Lazy master discovery with cross-validation (`locator`)
//! - Bounded linear backoff across master changes (`retry`)
//! - One lazily opened connection per node, guarded by a single lock (`session`)
//! - Optional dirty reads from a fixed node (`dirty`)
//!
//! A `Client` is `Send + Sync`; threads may share one instance. Every call
//! blocks until it returns a value or an error.

mod dirty;
mod locator;
mod retry;
mod session;


use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::{ClusterConfig, NodeId};
use crate::error::{ClientError, Result};
use crate::transport::{Connection, Connector, TcpConnector};
use crate::wire::{self, KeyRange, Request, Sequence, Statistics, Version, WireError, MAX_FRAME_SIZE};

pub use retry::RetryPolicy;

use dirty::DirtyReadRouter;
use session::Session;

/// Largest accepted key.
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Largest accepted value.
pub const MAX_VALUE_SIZE: usize = 8 * 1024 * 1024;

/// Largest number of keys in a multi-get or updates in a sequence.
pub const MAX_BATCH_KEYS: usize = 10_000;

/// Builder for [`Client`], used to inject the transport, the clock and the
/// randomness seed.
pub struct ClientBuilder {
    config: ClusterConfig,
    connector: Option<Arc<dyn Connector>>,
    clock: Option<Arc<dyn Clock>>,
    seed: Option<u64>,
}

impl ClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Seed for discovery order, jitter and the dirty-read node choice.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Client> {
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(self.config.connect_timeout())),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let retry = RetryPolicy::from_config(&self.config);
        let session = Session::new(Arc::new(self.config), connector, clock, rng)?;
        Ok(Client {
            session,
            retry,
            dirty: DirtyReadRouter::default(),
        })
    }
}

/// Client for one cluster.
pub struct Client {
    session: Session,
    retry: RetryPolicy,
    dirty: DirtyReadRouter,
}

impl Client {
    /// Client over TCP with the wall clock and an entropy-seeded RNG.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Client::builder(config).build()
    }

    pub fn builder(config: ClusterConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: None,
            clock: None,
            seed: None,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        self.session.config()
    }

    // =========================================================================
    // SESSION CONTROL
    // =========================================================================

    /// Allow reads from the dirty-read node. Reads may return stale values.
    pub fn allow_dirty_reads(&self) {
        self.dirty.set_enabled(true);
    }

    /// Route every read through the master again.
    pub fn disallow_dirty_reads(&self) {
        self.dirty.set_enabled(false);
    }

    pub fn dirty_reads_allowed(&self) -> bool {
        self.dirty.is_enabled()
    }

    /// Node serving dirty reads. Chosen at random when the client is built.
    pub fn dirty_read_node(&self) -> NodeId {
        self.session.dirty_read_node()
    }

    pub fn set_dirty_read_node(&self, node: impl Into<NodeId>) -> Result<()> {
        self.session.set_dirty_read_node(node.into())
    }

    /// Resolve and return the current master.
    pub fn who_master(&self) -> Result<NodeId> {
        self.session.resolve_master()
    }

    /// The cached master, without any network traffic.
    pub fn cached_master(&self) -> Option<NodeId> {
        self.session.master()
    }

    /// Nodes this client currently holds a connection to.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.session.connected_nodes()
    }

    /// Close every open connection. Idempotent.
    pub fn drop_connections(&self) {
        self.session.drop_connections();
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Greet the master. Returns its identification string.
    pub fn ping(&self, client_id: &str) -> Result<String> {
        if client_id.is_empty() {
            return Err(ClientError::InvalidArgument("client id is empty".into()));
        }
        let request = Request::Ping {
            client_id: client_id.to_string(),
            cluster_id: self.config().cluster_id().to_string(),
        };
        self.write("ping", &request, |c| wire::decode_string(c))
    }

    /// Number of keys held by the master.
    pub fn get_key_count(&self) -> Result<u64> {
        self.write("get_key_count", &Request::GetKeyCount, |c| wire::decode_u64(c))
    }

    pub fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = check_key(key.as_ref())?;
        self.read(
            "exists",
            |allow_dirty| Request::Exists {
                key: key.to_vec(),
                allow_dirty,
            },
            |c| wire::decode_bool(c),
        )
    }

    /// Value for `key`; `NotFound` if absent.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let key = check_key(key.as_ref())?;
        self.read(
            "get",
            |allow_dirty| Request::Get {
                key: key.to_vec(),
                allow_dirty,
            },
            |c| wire::decode_bytes(c),
        )
    }

    /// Values for every key, in order. Fails with `NotFound` if any is absent.
    pub fn multi_get<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Vec<u8>>> {
        check_batch(keys.len())?;
        let keys = keys
            .iter()
            .map(|k| check_key(k.as_ref()).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        self.read(
            "multi_get",
            |allow_dirty| Request::MultiGet {
                keys: keys.clone(),
                allow_dirty,
            },
            |c| wire::decode_bytes_list(c),
        )
    }

    /// Succeeds if the value of `key` equals `value` (`None`: key absent).
    pub fn assert(&self, key: impl AsRef<[u8]>, value: Option<&[u8]>) -> Result<()> {
        let key = check_key(key.as_ref())?;
        if let Some(v) = value {
            check_value(v)?;
        }
        self.read(
            "assert",
            |allow_dirty| Request::Assert {
                key: key.to_vec(),
                value: value.map(<[u8]>::to_vec),
                allow_dirty,
            },
            |c| wire::decode_unit(c),
        )
    }

    /// Succeeds if `key` has a value.
    pub fn assert_exists(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = check_key(key.as_ref())?;
        self.read(
            "assert_exists",
            |allow_dirty| Request::AssertExists {
                key: key.to_vec(),
                allow_dirty,
            },
            |c| wire::decode_unit(c),
        )
    }

    /// Keys within `range`, ascending.
    pub fn range(&self, range: &KeyRange) -> Result<Vec<Vec<u8>>> {
        check_range(range)?;
        self.read(
            "range",
            |allow_dirty| Request::Range {
                range: range.clone(),
                allow_dirty,
            },
            |c| wire::decode_bytes_list(c),
        )
    }

    /// Key-value pairs within `range`, ascending.
    pub fn range_entries(&self, range: &KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        check_range(range)?;
        self.read(
            "range_entries",
            |allow_dirty| Request::RangeEntries {
                range: range.clone(),
                allow_dirty,
            },
            |c| wire::decode_pairs(c),
        )
    }

    /// Key-value pairs within `range`, descending. `range.begin` is the
    /// upper bound.
    pub fn rev_range_entries(&self, range: &KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        check_range(range)?;
        self.read(
            "rev_range_entries",
            |allow_dirty| Request::RevRangeEntries {
                range: range.clone(),
                allow_dirty,
            },
            |c| wire::decode_pairs(c),
        )
    }

    /// Keys starting with `prefix`, ascending.
    pub fn prefix(&self, prefix: impl AsRef<[u8]>, max_elements: Option<u32>) -> Result<Vec<Vec<u8>>> {
        let prefix = check_key(prefix.as_ref())?;
        check_limit(max_elements)?;
        self.read(
            "prefix",
            |allow_dirty| Request::Prefix {
                prefix: prefix.to_vec(),
                max_elements,
                allow_dirty,
            },
            |c| wire::decode_bytes_list(c),
        )
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let request = Request::Set {
            key: check_key(key.as_ref())?.to_vec(),
            value: check_value(value.as_ref())?.to_vec(),
        };
        self.write("set", &request, |c| wire::decode_unit(c))
    }

    /// Like `set`, but a no-op when the stored value already equals `value`.
    pub fn confirm(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let request = Request::Confirm {
            key: check_key(key.as_ref())?.to_vec(),
            value: check_value(value.as_ref())?.to_vec(),
        };
        self.write("confirm", &request, |c| wire::decode_unit(c))
    }

    /// Remove `key`; `NotFound` if absent.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let request = Request::Delete {
            key: check_key(key.as_ref())?.to_vec(),
        };
        self.write("delete", &request, |c| wire::decode_unit(c))
    }

    /// Set `key` to `wanted` (`None` deletes) if its current value equals
    /// `expected` (`None`: absent). Returns the value before the call.
    pub fn test_and_set(
        &self,
        key: impl AsRef<[u8]>,
        expected: Option<&[u8]>,
        wanted: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let key = check_key(key.as_ref())?;
        for v in expected.iter().chain(wanted.iter()) {
            check_value(v)?;
        }
        let request = Request::TestAndSet {
            key: key.to_vec(),
            expected: expected.map(<[u8]>::to_vec),
            wanted: wanted.map(<[u8]>::to_vec),
        };
        self.write("test_and_set", &request, |c| wire::decode_opt_bytes(c))
    }

    /// Apply every update in `sequence` atomically on the master.
    pub fn sequence(&self, sequence: &Sequence) -> Result<()> {
        self.submit_sequence("sequence", sequence, false)
    }

    /// Like `sequence`, and the master syncs its store to disk before replying.
    pub fn synced_sequence(&self, sequence: &Sequence) -> Result<()> {
        self.submit_sequence("synced_sequence", sequence, true)
    }

    fn submit_sequence(&self, op: &'static str, sequence: &Sequence, sync: bool) -> Result<()> {
        check_batch(sequence.len())?;
        for update in sequence.updates() {
            check_key(update.key())?;
            if let Some(value) = update.value() {
                check_value(value)?;
            }
        }
        let request = Request::Sequence {
            sequence: sequence.clone(),
            sync,
        };
        self.write(op, &request, |c| wire::decode_unit(c))
    }

    /// Invoke a server-side user function.
    pub fn user_function(&self, name: &str, argument: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if name.is_empty() {
            return Err(ClientError::InvalidArgument("user function name is empty".into()));
        }
        if let Some(arg) = argument {
            check_value(arg)?;
        }
        let request = Request::UserFunction {
            name: name.to_string(),
            argument: argument.map(<[u8]>::to_vec),
        };
        self.write("user_function", &request, |c| wire::decode_opt_bytes(c))
    }

    // =========================================================================
    // ADMINISTRATION (no retry)
    // =========================================================================

    /// Whether the master believes it can make progress. `false` when no
    /// master can be found.
    pub fn expect_progress_possible(&self) -> Result<bool> {
        match self.to_master(&Request::ExpectProgressPossible.encode(), |c| {
            wire::decode_bool(c)
        }) {
            Err(ClientError::NoMaster) => Ok(false),
            other => other,
        }
    }

    pub fn statistics(&self) -> Result<Statistics> {
        self.to_master(&Request::Statistics.encode(), |c| wire::decode_statistics(c))
    }

    /// Server version of `node`, or of the master when `None`.
    pub fn get_version(&self, node: Option<&NodeId>) -> Result<Version> {
        let frame = Request::Version.encode();
        match node {
            Some(node) => self.session.dispatch(
                node,
                &frame,
                self.config().max_attempts(),
                |c| wire::decode_version(c),
            ),
            None => self.to_master(&frame, |c| wire::decode_version(c)),
        }
    }

    // =========================================================================
    // ROUTING
    // =========================================================================

    /// Send a pre-encoded frame to the master, discovering it if needed.
    fn to_master<T>(
        &self,
        frame: &[u8],
        decode: impl FnOnce(&mut dyn Connection) -> std::result::Result<T, WireError>,
    ) -> Result<T> {
        let master = self.session.resolve_master()?;
        self.session
            .dispatch(&master, frame, self.config().max_attempts(), decode)
    }

    /// Master-routed call under the retry policy.
    fn write<T>(
        &self,
        op: &'static str,
        request: &Request,
        decode: impl Fn(&mut dyn Connection) -> std::result::Result<T, WireError>,
    ) -> Result<T> {
        let frame = encode_checked(request)?;
        debug!(op, "master request");
        self.retry.run(&self.session, op, || self.to_master(&frame, &decode))
    }

    /// Read from the dirty-read node when dirty reads are allowed, without
    /// master discovery. Retries stay pinned to that node. Otherwise a
    /// master-routed call like `write`.
    fn read<T>(
        &self,
        op: &'static str,
        request: impl Fn(bool) -> Request,
        decode: impl Fn(&mut dyn Connection) -> std::result::Result<T, WireError>,
    ) -> Result<T> {
        match self.dirty.target(&self.session) {
            Some(node) => {
                let frame = encode_checked(&request(true))?;
                debug!(op, node = %node, "dirty read");
                self.retry.run(&self.session, op, || {
                    self.session
                        .dispatch(&node, &frame, self.config().max_attempts(), &decode)
                })
            }
            None => self.write(op, &request(false), decode),
        }
    }
}

// =============================================================================
// ARGUMENT VALIDATION
// =============================================================================

fn check_key(key: &[u8]) -> Result<&[u8]> {
    if key.len() > MAX_KEY_SIZE {
        return Err(ClientError::InvalidArgument(format!(
            "key of {} bytes exceeds {} bytes",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(key)
}

fn check_value(value: &[u8]) -> Result<&[u8]> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(ClientError::InvalidArgument(format!(
            "value of {} bytes exceeds {} bytes",
            value.len(),
            MAX_VALUE_SIZE
        )));
    }
    Ok(value)
}

fn check_limit(max_elements: Option<u32>) -> Result<()> {
    match max_elements {
        Some(max) if max > i32::MAX as u32 => Err(ClientError::InvalidArgument(format!(
            "max_elements {} exceeds {}",
            max,
            i32::MAX
        ))),
        _ => Ok(()),
    }
}

fn check_range(range: &KeyRange) -> Result<()> {
    for key in range.begin.iter().chain(range.end.iter()) {
        check_key(key)?;
    }
    check_limit(range.max_elements)
}

fn check_batch(len: usize) -> Result<()> {
    if len > MAX_BATCH_KEYS {
        return Err(ClientError::InvalidArgument(format!(
            "batch of {} exceeds {} entries",
            len, MAX_BATCH_KEYS
        )));
    }
    Ok(())
}

fn encode_checked(request: &Request) -> Result<Vec<u8>> {
    let frame = request.encode();
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ClientError::InvalidArgument(format!(
            "{:?} request of {} bytes exceeds frame limit",
            request.opcode(),
            frame.len()
        )));
    }
    Ok(frame)
}
