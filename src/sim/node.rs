//! Simulated node: a thread answering protocol frames from its inbox.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};

use crate::config::NodeId;
use crate::wire::{
    decode_prologue, encode_error, encode_ok, encode_statistics, encode_version, ErrorCode,
    KeyRange, Request, Sequence, Statistics, Update, Version,
};

/// Key-value contents of one node.
pub type Store = BTreeMap<Vec<u8>, Vec<u8>>;

/// Version every simulated node reports.
pub const SIM_VERSION: (i32, i32, i32) = (1, 0, 0);

/// Message delivered to a node thread.
pub(crate) enum Packet {
    /// Connection prologue; answered with a unit response or `WrongCluster`.
    Hello { frame: Vec<u8>, reply: Sender<Vec<u8>> },
    /// One request frame; answered with one response frame.
    Request { frame: Vec<u8>, reply: Sender<Vec<u8>> },
    /// Stop the node thread.
    Stop,
}

/// Fault switches and counters for one node, shared with its connections.
#[derive(Debug, Default)]
pub(crate) struct NodeControl {
    killed: AtomicBool,
    fail_sends: AtomicU32,
    belief: Mutex<Option<NodeId>>,
    pub(crate) who_master_probes: AtomicU64,
    pub(crate) requests: AtomicU64,
    pub(crate) connections_opened: AtomicU64,
    pub(crate) connections_closed: AtomicU64,
}

impl NodeControl {
    pub(crate) fn is_alive(&self) -> bool {
        !self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.killed.store(!alive, Ordering::SeqCst);
    }

    pub(crate) fn belief(&self) -> Option<NodeId> {
        self.belief.lock().unwrap().clone()
    }

    pub(crate) fn set_belief(&self, master: Option<NodeId>) {
        *self.belief.lock().unwrap() = master;
    }

    pub(crate) fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Consume one injected send failure, if any is pending.
    pub(crate) fn take_send_failure(&self) -> bool {
        self.fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// State shared by every node of one simulated cluster.
pub(crate) struct ClusterState {
    pub(crate) cluster_id: String,
    pub(crate) controls: BTreeMap<NodeId, Arc<NodeControl>>,
    pub(crate) stores: Mutex<BTreeMap<NodeId, Store>>,
    pub(crate) stats: Mutex<Statistics>,
}

impl ClusterState {
    fn is_alive(&self, node: &NodeId) -> bool {
        self.controls.get(node).map(|c| c.is_alive()).unwrap_or(false)
    }
}

enum Mutation {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

type Verdict<T> = Result<T, (ErrorCode, String)>;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn lossy(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// The loop run by each node thread.
pub(crate) struct NodeRunner {
    pub(crate) node_id: NodeId,
    pub(crate) control: Arc<NodeControl>,
    pub(crate) cluster: Arc<ClusterState>,
}

impl NodeRunner {
    pub(crate) fn run(self, inbox: Receiver<Packet>) {
        while let Ok(packet) = inbox.recv() {
            match packet {
                Packet::Hello { frame, reply } => {
                    let _ = reply.send(self.hello(&frame));
                }
                Packet::Request { frame, reply } => {
                    self.control.requests.fetch_add(1, Ordering::SeqCst);
                    let response = match Request::decode(&frame[..]) {
                        Ok(request) => self.handle(request),
                        Err(e) => encode_error(ErrorCode::Unknown, &e.to_string()),
                    };
                    let _ = reply.send(response);
                }
                Packet::Stop => break,
            }
        }
    }

    fn hello(&self, frame: &[u8]) -> Vec<u8> {
        match decode_prologue(frame) {
            Ok(cluster_id) if cluster_id == self.cluster.cluster_id => encode_ok(|_| {}),
            Ok(cluster_id) => encode_error(
                ErrorCode::WrongCluster,
                &format!("expected cluster {}, got {}", self.cluster.cluster_id, cluster_id),
            ),
            Err(e) => encode_error(ErrorCode::NoMagic, &e.to_string()),
        }
    }

    fn is_master(&self) -> bool {
        self.control.belief().as_ref() == Some(&self.node_id)
    }

    fn handle(&self, request: Request) -> Vec<u8> {
        match &request {
            Request::WhoMaster => {
                self.control.who_master_probes.fetch_add(1, Ordering::SeqCst);
                let belief = self.control.belief();
                return encode_ok(|enc| {
                    enc.put_opt_str(belief.as_ref().map(NodeId::as_str));
                });
            }
            Request::Version => {
                let (major, minor, patch) = SIM_VERSION;
                let version = Version {
                    major,
                    minor,
                    patch,
                    info: format!("sim node {}", self.node_id),
                };
                return encode_ok(|enc| encode_version(enc, &version));
            }
            _ => {}
        }

        let dirty_ok = request.is_read_only() && request.allows_dirty();
        if !dirty_ok && !self.is_master() {
            let belief = self
                .control
                .belief()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return encode_error(ErrorCode::NotMaster, &belief);
        }

        let mut stores = self.cluster.stores.lock().unwrap();
        let own = stores.entry(self.node_id.clone()).or_default();
        let response = if request.is_read_only() {
            self.read(own, &request)
        } else {
            match self.write(own, request) {
                Ok((mutations, response)) => {
                    self.replicate(&mut stores, mutations);
                    response
                }
                Err(response) => response,
            }
        };
        self.cluster.stats.lock().unwrap().last = now_secs();
        response
    }

    fn read(&self, store: &Store, request: &Request) -> Vec<u8> {
        let mut stats = self.cluster.stats.lock().unwrap();
        let verdict: Verdict<Vec<u8>> = match request {
            Request::Exists { key, .. } => {
                let found = store.contains_key(key);
                Ok(encode_ok(|enc| {
                    enc.put_bool(found);
                }))
            }
            Request::Get { key, .. } => {
                stats.n_gets += 1;
                store
                    .get(key)
                    .map(|v| {
                        encode_ok(|enc| {
                            enc.put_bytes(v);
                        })
                    })
                    .ok_or_else(|| (ErrorCode::NotFound, lossy(key)))
            }
            Request::MultiGet { keys, .. } => {
                stats.n_multigets += 1;
                keys.iter()
                    .map(|k| store.get(k).ok_or_else(|| (ErrorCode::NotFound, lossy(k))))
                    .collect::<Verdict<Vec<_>>>()
                    .map(|values| {
                        encode_ok(|enc| {
                            enc.put_bytes_list(&values);
                        })
                    })
            }
            Request::Assert { key, value, .. } => check_assert(store, key, value.as_deref())
                .map(|()| encode_ok(|_| {})),
            Request::AssertExists { key, .. } => {
                check_assert_exists(store, key).map(|()| encode_ok(|_| {}))
            }
            Request::Range { range, .. } => {
                let keys: Vec<&Vec<u8>> = select(store, range, false).map(|(k, _)| k).collect();
                Ok(encode_ok(|enc| {
                    enc.put_bytes_list(&keys);
                }))
            }
            Request::RangeEntries { range, .. } | Request::RevRangeEntries { range, .. } => {
                let reverse = matches!(request, Request::RevRangeEntries { .. });
                let pairs: Vec<_> = select(store, range, reverse).collect();
                Ok(encode_ok(|enc| {
                    enc.put_u32(pairs.len() as u32);
                    for (k, v) in pairs {
                        enc.put_bytes(k).put_bytes(v);
                    }
                }))
            }
            Request::Prefix {
                prefix,
                max_elements,
                ..
            } => {
                let keys: Vec<&Vec<u8>> = store
                    .range(prefix.clone()..)
                    .map(|(k, _)| k)
                    .take_while(|k| k.starts_with(prefix))
                    .take(limit(*max_elements))
                    .collect();
                Ok(encode_ok(|enc| {
                    enc.put_bytes_list(&keys);
                }))
            }
            other => Err((
                ErrorCode::NotSupported,
                format!("{:?} is not a read", other.opcode()),
            )),
        };
        verdict.unwrap_or_else(|(code, msg)| encode_error(code, &msg))
    }

    /// Evaluate a master-only request against the master's store. Returns
    /// the mutations to replicate and the response frame.
    fn write(&self, store: &Store, request: Request) -> Result<(Vec<Mutation>, Vec<u8>), Vec<u8>> {
        let mut stats = self.cluster.stats.lock().unwrap();
        let verdict: Verdict<(Vec<Mutation>, Vec<u8>)> = match request {
            Request::Ping {
                client_id,
                cluster_id,
            } => {
                if cluster_id != self.cluster.cluster_id {
                    Err((ErrorCode::WrongCluster, cluster_id))
                } else {
                    let greeting = format!(
                        "chr sim node {} greets {} (version {}.{}.{})",
                        self.node_id, client_id, SIM_VERSION.0, SIM_VERSION.1, SIM_VERSION.2
                    );
                    Ok((Vec::new(), encode_ok(|enc| {
                        enc.put_str(&greeting);
                    })))
                }
            }
            Request::Set { key, value } => {
                stats.n_sets += 1;
                Ok((vec![Mutation::Put(key, value)], encode_ok(|_| {})))
            }
            Request::Confirm { key, value } => {
                stats.n_sets += 1;
                let mutations = if store.get(&key) == Some(&value) {
                    Vec::new()
                } else {
                    vec![Mutation::Put(key, value)]
                };
                Ok((mutations, encode_ok(|_| {})))
            }
            Request::Delete { key } => {
                stats.n_deletes += 1;
                if store.contains_key(&key) {
                    Ok((vec![Mutation::Remove(key)], encode_ok(|_| {})))
                } else {
                    Err((ErrorCode::NotFound, lossy(&key)))
                }
            }
            Request::TestAndSet {
                key,
                expected,
                wanted,
            } => {
                let old = store.get(&key).cloned();
                let mutations = if old == expected {
                    match wanted {
                        Some(value) => vec![Mutation::Put(key, value)],
                        None => vec![Mutation::Remove(key)],
                    }
                } else {
                    Vec::new()
                };
                Ok((mutations, encode_ok(|enc| {
                    enc.put_opt_bytes(old.as_deref());
                })))
            }
            Request::Sequence { sequence, .. } => {
                stats.n_sequences += 1;
                apply_sequence(store, &sequence).map(|m| (m, encode_ok(|_| {})))
            }
            Request::UserFunction { name, argument } => match name.as_str() {
                "echo" => Ok((Vec::new(), encode_ok(|enc| {
                    enc.put_opt_bytes(argument.as_deref());
                }))),
                _ => Err((
                    ErrorCode::UserFunctionFailure,
                    format!("unknown user function {}", name),
                )),
            },
            Request::GetKeyCount => {
                let count = store.len() as u64;
                Ok((Vec::new(), encode_ok(|enc| {
                    enc.put_u64(count);
                })))
            }
            Request::ExpectProgressPossible => {
                let alive = self
                    .cluster
                    .controls
                    .values()
                    .filter(|c| c.is_alive())
                    .count();
                let possible = alive * 2 > self.cluster.controls.len();
                Ok((Vec::new(), encode_ok(|enc| {
                    enc.put_bool(possible);
                })))
            }
            Request::Statistics => {
                let snapshot = stats.clone();
                Ok((Vec::new(), encode_ok(|enc| encode_statistics(enc, &snapshot))))
            }
            other => Err((
                ErrorCode::NotSupported,
                format!("{:?} is not a write", other.opcode()),
            )),
        };
        if let Ok((mutations, _)) = &verdict {
            stats.n_entries += mutations.len() as u64;
        }
        verdict.map_err(|(code, msg)| encode_error(code, &msg))
    }

    /// Apply `mutations` on the master and on every live node.
    fn replicate(&self, stores: &mut BTreeMap<NodeId, Store>, mutations: Vec<Mutation>) {
        if mutations.is_empty() {
            return;
        }
        let mut stats = self.cluster.stats.lock().unwrap();
        for (node, store) in stores.iter_mut() {
            if *node != self.node_id && !self.cluster.is_alive(node) {
                continue;
            }
            for mutation in &mutations {
                match mutation {
                    Mutation::Put(k, v) => {
                        store.insert(k.clone(), v.clone());
                    }
                    Mutation::Remove(k) => {
                        store.remove(k);
                    }
                }
            }
            *stats.node_is.entry(node.to_string()).or_default() += mutations.len() as u64;
        }
    }
}

fn check_assert(store: &Store, key: &[u8], value: Option<&[u8]>) -> Verdict<()> {
    if store.get(key).map(Vec::as_slice) == value {
        Ok(())
    } else {
        Err((ErrorCode::AssertionFailed, lossy(key)))
    }
}

fn check_assert_exists(store: &Store, key: &[u8]) -> Verdict<()> {
    if store.contains_key(key) {
        Ok(())
    } else {
        Err((ErrorCode::AssertionFailed, lossy(key)))
    }
}

/// Evaluate a sequence on a scratch copy; nothing is returned unless every
/// update succeeds.
fn apply_sequence(store: &Store, sequence: &Sequence) -> Verdict<Vec<Mutation>> {
    let mut scratch = store.clone();
    let mut mutations = Vec::with_capacity(sequence.len());
    for update in sequence.updates() {
        match update {
            Update::Set { key, value } => {
                scratch.insert(key.clone(), value.clone());
                mutations.push(Mutation::Put(key.clone(), value.clone()));
            }
            Update::Delete { key } => {
                if scratch.remove(key).is_none() {
                    return Err((ErrorCode::NotFound, lossy(key)));
                }
                mutations.push(Mutation::Remove(key.clone()));
            }
            Update::Assert { key, value } => check_assert(&scratch, key, value.as_deref())?,
            Update::AssertExists { key } => check_assert_exists(&scratch, key)?,
        }
    }
    Ok(mutations)
}

fn limit(max_elements: Option<u32>) -> usize {
    max_elements.map(|m| m as usize).unwrap_or(usize::MAX)
}

/// Entries of `store` inside `range`, ascending (or descending when
/// `reverse`, with `begin` as the upper bound).
fn select<'a>(
    store: &'a Store,
    range: &'a KeyRange,
    reverse: bool,
) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> {
    let past_begin = move |k: &Vec<u8>| match &range.begin {
        None => true,
        Some(b) if reverse => {
            if range.begin_inclusive {
                k <= b
            } else {
                k < b
            }
        }
        Some(b) => {
            if range.begin_inclusive {
                k >= b
            } else {
                k > b
            }
        }
    };
    let before_end = move |k: &Vec<u8>| match &range.end {
        None => true,
        Some(e) if reverse => {
            if range.end_inclusive {
                k >= e
            } else {
                k > e
            }
        }
        Some(e) => {
            if range.end_inclusive {
                k <= e
            } else {
                k < e
            }
        }
    };
    let iter: Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> = if reverse {
        Box::new(store.iter().rev())
    } else {
        Box::new(store.iter())
    };
    Box::new(
        iter.filter(move |&(k, _)| past_begin(k) && before_end(k))
            .take(limit(range.max_elements)),
    )
}
