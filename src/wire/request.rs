//! Request messages and their encoding.

use std::io::{self, Read};

use super::format::{invalid, Decoder, Encoder, Opcode};

/// Key-range selection for range, range-entries and reverse range reads.
///
/// For reverse reads `begin` is the upper bound and `end` the lower bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: Option<Vec<u8>>,
    pub begin_inclusive: bool,
    pub end: Option<Vec<u8>>,
    pub end_inclusive: bool,
    /// `None` returns every match.
    pub max_elements: Option<u32>,
}

impl KeyRange {
    /// Unbounded on both ends, no element limit.
    pub fn all() -> Self {
        KeyRange::default()
    }

    pub fn begin(mut self, key: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.begin = Some(key.into());
        self.begin_inclusive = inclusive;
        self
    }

    pub fn end(mut self, key: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.end = Some(key.into());
        self.end_inclusive = inclusive;
        self
    }

    pub fn limit(mut self, max_elements: u32) -> Self {
        self.max_elements = Some(max_elements);
        self
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.put_opt_bytes(self.begin.as_deref())
            .put_bool(self.begin_inclusive)
            .put_opt_bytes(self.end.as_deref())
            .put_bool(self.end_inclusive)
            .put_i32(encode_limit(self.max_elements));
    }

    fn decode<R: Read>(dec: &mut Decoder<R>) -> io::Result<Self> {
        Ok(KeyRange {
            begin: dec.opt_bytes()?,
            begin_inclusive: dec.bool()?,
            end: dec.opt_bytes()?,
            end_inclusive: dec.bool()?,
            max_elements: decode_limit(dec.i32()?),
        })
    }
}

// -1 means "no limit" on the wire. Callers validate `max <= i32::MAX`.
fn encode_limit(max: Option<u32>) -> i32 {
    max.map(|m| m.min(i32::MAX as u32) as i32).unwrap_or(-1)
}

fn decode_limit(raw: i32) -> Option<u32> {
    if raw < 0 {
        None
    } else {
        Some(raw as u32)
    }
}

/// A single update inside a [`Sequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Assert { key: Vec<u8>, value: Option<Vec<u8>> },
    AssertExists { key: Vec<u8> },
}

const UPDATE_SET: u32 = 1;
const UPDATE_DELETE: u32 = 2;
const UPDATE_ASSERT: u32 = 8;
const UPDATE_ASSERT_EXISTS: u32 = 15;

impl Update {
    /// The key this update touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Update::Set { key, .. }
            | Update::Delete { key }
            | Update::Assert { key, .. }
            | Update::AssertExists { key } => key,
        }
    }

    /// The value carried by a set or a value assertion.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Update::Set { value, .. } => Some(value),
            Update::Assert { value, .. } => value.as_deref(),
            Update::Delete { .. } | Update::AssertExists { .. } => None,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        match self {
            Update::Set { key, value } => {
                enc.put_u32(UPDATE_SET).put_bytes(key).put_bytes(value);
            }
            Update::Delete { key } => {
                enc.put_u32(UPDATE_DELETE).put_bytes(key);
            }
            Update::Assert { key, value } => {
                enc.put_u32(UPDATE_ASSERT)
                    .put_bytes(key)
                    .put_opt_bytes(value.as_deref());
            }
            Update::AssertExists { key } => {
                enc.put_u32(UPDATE_ASSERT_EXISTS).put_bytes(key);
            }
        }
    }

    fn decode<R: Read>(dec: &mut Decoder<R>) -> io::Result<Self> {
        match dec.u32()? {
            UPDATE_SET => Ok(Update::Set {
                key: dec.bytes()?,
                value: dec.bytes()?,
            }),
            UPDATE_DELETE => Ok(Update::Delete { key: dec.bytes()? }),
            UPDATE_ASSERT => Ok(Update::Assert {
                key: dec.bytes()?,
                value: dec.opt_bytes()?,
            }),
            UPDATE_ASSERT_EXISTS => Ok(Update::AssertExists { key: dec.bytes()? }),
            tag => Err(invalid(format!("unknown update tag {}", tag))),
        }
    }
}

/// Ordered batch of updates the server applies all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    updates: Vec<Update>,
}

impl Sequence {
    pub fn new() -> Self {
        Sequence::default()
    }

    pub fn add_set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.updates.push(Update::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn add_delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.updates.push(Update::Delete { key: key.into() });
        self
    }

    pub fn add_assert(&mut self, key: impl Into<Vec<u8>>, value: Option<Vec<u8>>) -> &mut Self {
        self.updates.push(Update::Assert {
            key: key.into(),
            value,
        });
        self
    }

    pub fn add_assert_exists(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.updates.push(Update::AssertExists { key: key.into() });
        self
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// A client request. Read requests carry the `allow_dirty` flag so that a
/// non-master node knows the caller accepts stale data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping { client_id: String, cluster_id: String },
    WhoMaster,
    Exists { key: Vec<u8>, allow_dirty: bool },
    Get { key: Vec<u8>, allow_dirty: bool },
    MultiGet { keys: Vec<Vec<u8>>, allow_dirty: bool },
    Set { key: Vec<u8>, value: Vec<u8> },
    Confirm { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    TestAndSet { key: Vec<u8>, expected: Option<Vec<u8>>, wanted: Option<Vec<u8>> },
    Assert { key: Vec<u8>, value: Option<Vec<u8>>, allow_dirty: bool },
    AssertExists { key: Vec<u8>, allow_dirty: bool },
    Range { range: KeyRange, allow_dirty: bool },
    RangeEntries { range: KeyRange, allow_dirty: bool },
    RevRangeEntries { range: KeyRange, allow_dirty: bool },
    Prefix { prefix: Vec<u8>, max_elements: Option<u32>, allow_dirty: bool },
    Sequence { sequence: Sequence, sync: bool },
    UserFunction { name: String, argument: Option<Vec<u8>> },
    GetKeyCount,
    ExpectProgressPossible,
    Statistics,
    Version,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Ping { .. } => Opcode::Ping,
            Request::WhoMaster => Opcode::WhoMaster,
            Request::Exists { .. } => Opcode::Exists,
            Request::Get { .. } => Opcode::Get,
            Request::MultiGet { .. } => Opcode::MultiGet,
            Request::Set { .. } => Opcode::Set,
            Request::Confirm { .. } => Opcode::Confirm,
            Request::Delete { .. } => Opcode::Delete,
            Request::TestAndSet { .. } => Opcode::TestAndSet,
            Request::Assert { .. } => Opcode::Assert,
            Request::AssertExists { .. } => Opcode::AssertExists,
            Request::Range { .. } => Opcode::Range,
            Request::RangeEntries { .. } => Opcode::RangeEntries,
            Request::RevRangeEntries { .. } => Opcode::RevRangeEntries,
            Request::Prefix { .. } => Opcode::Prefix,
            Request::Sequence { sync: false, .. } => Opcode::Sequence,
            Request::Sequence { sync: true, .. } => Opcode::SyncedSequence,
            Request::UserFunction { .. } => Opcode::UserFunction,
            Request::GetKeyCount => Opcode::GetKeyCount,
            Request::ExpectProgressPossible => Opcode::ExpectProgressPossible,
            Request::Statistics => Opcode::Statistics,
            Request::Version => Opcode::Version,
        }
    }

    /// Whether the request only reads state.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Request::Exists { .. }
                | Request::Get { .. }
                | Request::MultiGet { .. }
                | Request::Assert { .. }
                | Request::AssertExists { .. }
                | Request::Range { .. }
                | Request::RangeEntries { .. }
                | Request::RevRangeEntries { .. }
                | Request::Prefix { .. }
        )
    }

    /// Whether the caller accepts a stale answer from a non-master node.
    pub fn allows_dirty(&self) -> bool {
        match self {
            Request::Exists { allow_dirty, .. }
            | Request::Get { allow_dirty, .. }
            | Request::MultiGet { allow_dirty, .. }
            | Request::Assert { allow_dirty, .. }
            | Request::AssertExists { allow_dirty, .. }
            | Request::Range { allow_dirty, .. }
            | Request::RangeEntries { allow_dirty, .. }
            | Request::RevRangeEntries { allow_dirty, .. }
            | Request::Prefix { allow_dirty, .. } => *allow_dirty,
            _ => false,
        }
    }

    /// Encode into a complete frame (opcode word, arguments, footer).
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_u32(self.opcode().word());
        match self {
            Request::Ping {
                client_id,
                cluster_id,
            } => {
                enc.put_str(client_id).put_str(cluster_id);
            }
            Request::WhoMaster
            | Request::GetKeyCount
            | Request::ExpectProgressPossible
            | Request::Statistics
            | Request::Version => {}
            Request::Exists { key, allow_dirty }
            | Request::Get { key, allow_dirty }
            | Request::AssertExists { key, allow_dirty } => {
                enc.put_bool(*allow_dirty).put_bytes(key);
            }
            Request::MultiGet { keys, allow_dirty } => {
                enc.put_bool(*allow_dirty).put_bytes_list(keys);
            }
            Request::Set { key, value } | Request::Confirm { key, value } => {
                enc.put_bytes(key).put_bytes(value);
            }
            Request::Delete { key } => {
                enc.put_bytes(key);
            }
            Request::TestAndSet {
                key,
                expected,
                wanted,
            } => {
                enc.put_bytes(key)
                    .put_opt_bytes(expected.as_deref())
                    .put_opt_bytes(wanted.as_deref());
            }
            Request::Assert {
                key,
                value,
                allow_dirty,
            } => {
                enc.put_bool(*allow_dirty)
                    .put_bytes(key)
                    .put_opt_bytes(value.as_deref());
            }
            Request::Range { range, allow_dirty }
            | Request::RangeEntries { range, allow_dirty }
            | Request::RevRangeEntries { range, allow_dirty } => {
                enc.put_bool(*allow_dirty);
                range.encode(&mut enc);
            }
            Request::Prefix {
                prefix,
                max_elements,
                allow_dirty,
            } => {
                enc.put_bool(*allow_dirty)
                    .put_bytes(prefix)
                    .put_i32(encode_limit(*max_elements));
            }
            Request::Sequence { sequence, .. } => {
                enc.put_u32(sequence.updates.len() as u32);
                for update in &sequence.updates {
                    update.encode(&mut enc);
                }
            }
            Request::UserFunction { name, argument } => {
                enc.put_str(name).put_opt_bytes(argument.as_deref());
            }
        }
        enc.finish()
    }

    /// Decode one request frame from a stream (server side).
    pub fn decode(reader: impl Read) -> io::Result<Request> {
        let mut dec = Decoder::new(reader);
        let op = Opcode::from_word(dec.u32()?)?;
        let request = match op {
            Opcode::Ping => Request::Ping {
                client_id: dec.string()?,
                cluster_id: dec.string()?,
            },
            Opcode::WhoMaster => Request::WhoMaster,
            Opcode::GetKeyCount => Request::GetKeyCount,
            Opcode::ExpectProgressPossible => Request::ExpectProgressPossible,
            Opcode::Statistics => Request::Statistics,
            Opcode::Version => Request::Version,
            Opcode::Exists => {
                let allow_dirty = dec.bool()?;
                Request::Exists {
                    key: dec.bytes()?,
                    allow_dirty,
                }
            }
            Opcode::Get => {
                let allow_dirty = dec.bool()?;
                Request::Get {
                    key: dec.bytes()?,
                    allow_dirty,
                }
            }
            Opcode::AssertExists => {
                let allow_dirty = dec.bool()?;
                Request::AssertExists {
                    key: dec.bytes()?,
                    allow_dirty,
                }
            }
            Opcode::MultiGet => {
                let allow_dirty = dec.bool()?;
                Request::MultiGet {
                    keys: dec.bytes_list()?,
                    allow_dirty,
                }
            }
            Opcode::Set => Request::Set {
                key: dec.bytes()?,
                value: dec.bytes()?,
            },
            Opcode::Confirm => Request::Confirm {
                key: dec.bytes()?,
                value: dec.bytes()?,
            },
            Opcode::Delete => Request::Delete { key: dec.bytes()? },
            Opcode::TestAndSet => Request::TestAndSet {
                key: dec.bytes()?,
                expected: dec.opt_bytes()?,
                wanted: dec.opt_bytes()?,
            },
            Opcode::Assert => {
                let allow_dirty = dec.bool()?;
                Request::Assert {
                    key: dec.bytes()?,
                    value: dec.opt_bytes()?,
                    allow_dirty,
                }
            }
            Opcode::Range => {
                let allow_dirty = dec.bool()?;
                Request::Range {
                    range: KeyRange::decode(&mut dec)?,
                    allow_dirty,
                }
            }
            Opcode::RangeEntries => {
                let allow_dirty = dec.bool()?;
                Request::RangeEntries {
                    range: KeyRange::decode(&mut dec)?,
                    allow_dirty,
                }
            }
            Opcode::RevRangeEntries => {
                let allow_dirty = dec.bool()?;
                Request::RevRangeEntries {
                    range: KeyRange::decode(&mut dec)?,
                    allow_dirty,
                }
            }
            Opcode::Prefix => {
                let allow_dirty = dec.bool()?;
                Request::Prefix {
                    prefix: dec.bytes()?,
                    max_elements: decode_limit(dec.i32()?),
                    allow_dirty,
                }
            }
            Opcode::Sequence | Opcode::SyncedSequence => Request::Sequence {
                sequence: Sequence {
                    updates: dec.list(Update::decode)?,
                },
                sync: op == Opcode::SyncedSequence,
            },
            Opcode::UserFunction => Request::UserFunction {
                name: dec.string()?,
                argument: dec.opt_bytes()?,
            },
        };
        dec.finish()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_request_roundtrip() {
        let request = Request::RevRangeEntries {
            range: KeyRange::all().begin("z", true).end("a", false).limit(10),
            allow_dirty: true,
        };
        let frame = request.encode();
        assert_eq!(Request::decode(&frame[..]).unwrap(), request);
    }

    #[test]
    fn test_sequence_roundtrip() {
        let mut seq = Sequence::new();
        seq.add_set("a", "1")
            .add_delete("b")
            .add_assert("c", None)
            .add_assert_exists("d");
        let request = Request::Sequence {
            sequence: seq.clone(),
            sync: true,
        };
        assert_eq!(request.opcode(), Opcode::SyncedSequence);

        let decoded = Request::decode(&request.encode()[..]).unwrap();
        match decoded {
            Request::Sequence { sequence, sync } => {
                assert!(sync);
                assert_eq!(sequence, seq);
                assert_eq!(sequence.updates()[1].key(), b"b");
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_unlimited_prefix_encodes_minus_one() {
        let request = Request::Prefix {
            prefix: b"user/".to_vec(),
            max_elements: None,
            allow_dirty: false,
        };
        let frame = request.encode();
        // opcode(4) + bool(1) + len(4) + "user/"(5) then the i32 limit
        let limit = i32::from_le_bytes(frame[14..18].try_into().unwrap());
        assert_eq!(limit, -1);
        assert_eq!(Request::decode(&frame[..]).unwrap(), request);
    }

    #[test]
    fn test_read_only_classification() {
        assert!(Request::Get { key: vec![], allow_dirty: false }.is_read_only());
        assert!(Request::Prefix { prefix: vec![], max_elements: None, allow_dirty: true }.allows_dirty());
        assert!(!Request::Set { key: vec![], value: vec![] }.is_read_only());
        assert!(!Request::Sequence { sequence: Sequence::new(), sync: false }.is_read_only());
        assert!(!Request::WhoMaster.allows_dirty());
    }

    #[test]
    fn test_decode_rejects_trailing_corruption() {
        let mut frame = Request::Delete { key: b"k".to_vec() }.encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = Request::decode(&frame[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
