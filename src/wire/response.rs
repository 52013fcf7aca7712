//! Response frames: server-side encoding and typed client-side decoding.

use std::collections::BTreeMap;
use std::io::{self, Read};

use thiserror::Error;

use super::format::{Decoder, Encoder, ErrorCode};

/// Failure while reading a response.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket failure or malformed frame (`InvalidData`).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Well-formed frame carrying a non-success status.
    #[error("{code:?}: {message}")]
    Server { code: ErrorCode, message: String },
}

/// Server version as reported by the `Version` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub info: String,
}

/// Counters reported by the master.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    /// Unix time (seconds) the counters were reset.
    pub start: f64,
    /// Unix time (seconds) of the last update.
    pub last: f64,
    pub n_sets: u64,
    pub n_gets: u64,
    pub n_deletes: u64,
    pub n_multigets: u64,
    pub n_sequences: u64,
    pub n_entries: u64,
    /// Last applied log index per node, as seen by the master.
    pub node_is: BTreeMap<String, u64>,
}

/// Build a success frame whose payload is written by `body`.
pub fn encode_ok(body: impl FnOnce(&mut Encoder)) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u32(ErrorCode::Success as u32);
    body(&mut enc);
    enc.finish()
}

/// Build an error frame.
pub fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u32(code as u32).put_str(message);
    enc.finish()
}

pub fn encode_version(enc: &mut Encoder, version: &Version) {
    enc.put_i32(version.major)
        .put_i32(version.minor)
        .put_i32(version.patch)
        .put_str(&version.info);
}

pub fn encode_statistics(enc: &mut Encoder, stats: &Statistics) {
    enc.put_f64(stats.start)
        .put_f64(stats.last)
        .put_u64(stats.n_sets)
        .put_u64(stats.n_gets)
        .put_u64(stats.n_deletes)
        .put_u64(stats.n_multigets)
        .put_u64(stats.n_sequences)
        .put_u64(stats.n_entries)
        .put_u32(stats.node_is.len() as u32);
    for (node, index) in &stats.node_is {
        enc.put_str(node).put_u64(*index);
    }
}

/// Read one response frame: status word, then either the payload (read by
/// `body`) or an error message, then the footer.
pub fn read_response<R: Read, T>(
    reader: R,
    body: impl FnOnce(&mut Decoder<R>) -> io::Result<T>,
) -> Result<T, WireError> {
    let mut dec = Decoder::new(reader);
    let status = dec.u32()?;
    if status == ErrorCode::Success as u32 {
        let value = body(&mut dec)?;
        dec.finish()?;
        Ok(value)
    } else {
        let message = dec.string()?;
        dec.finish()?;
        Err(WireError::Server {
            code: ErrorCode::from_u32(status),
            message,
        })
    }
}

pub fn decode_unit(reader: impl Read) -> Result<(), WireError> {
    read_response(reader, |_| Ok(()))
}

pub fn decode_bool(reader: impl Read) -> Result<bool, WireError> {
    read_response(reader, |d| d.bool())
}

pub fn decode_u64(reader: impl Read) -> Result<u64, WireError> {
    read_response(reader, |d| d.u64())
}

pub fn decode_bytes(reader: impl Read) -> Result<Vec<u8>, WireError> {
    read_response(reader, |d| d.bytes())
}

pub fn decode_string(reader: impl Read) -> Result<String, WireError> {
    read_response(reader, |d| d.string())
}

pub fn decode_opt_bytes(reader: impl Read) -> Result<Option<Vec<u8>>, WireError> {
    read_response(reader, |d| d.opt_bytes())
}

pub fn decode_opt_string(reader: impl Read) -> Result<Option<String>, WireError> {
    read_response(reader, |d| d.opt_string())
}

pub fn decode_bytes_list(reader: impl Read) -> Result<Vec<Vec<u8>>, WireError> {
    read_response(reader, |d| d.bytes_list())
}

pub fn decode_pairs(reader: impl Read) -> Result<Vec<(Vec<u8>, Vec<u8>)>, WireError> {
    read_response(reader, |d| d.list(|d| Ok((d.bytes()?, d.bytes()?))))
}

pub fn decode_version(reader: impl Read) -> Result<Version, WireError> {
    read_response(reader, |d| {
        Ok(Version {
            major: d.i32()?,
            minor: d.i32()?,
            patch: d.i32()?,
            info: d.string()?,
        })
    })
}

pub fn decode_statistics(reader: impl Read) -> Result<Statistics, WireError> {
    read_response(reader, |d| {
        let mut stats = Statistics {
            start: d.f64()?,
            last: d.f64()?,
            n_sets: d.u64()?,
            n_gets: d.u64()?,
            n_deletes: d.u64()?,
            n_multigets: d.u64()?,
            n_sequences: d.u64()?,
            n_entries: d.u64()?,
            node_is: BTreeMap::new(),
        };
        for (node, index) in d.list(|d| Ok((d.string()?, d.u64()?)))? {
            stats.node_is.insert(node, index);
        }
        Ok(stats)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_surfaces_code_and_message() {
        let frame = encode_error(ErrorCode::NotMaster, "n1");
        match decode_bytes(&frame[..]) {
            Err(WireError::Server { code, message }) => {
                assert_eq!(code, ErrorCode::NotMaster);
                assert_eq!(message, "n1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pairs_and_statistics() {
        let frame = encode_ok(|enc| {
            enc.put_u32(2)
                .put_bytes(b"a")
                .put_bytes(b"1")
                .put_bytes(b"b")
                .put_bytes(b"2");
        });
        assert_eq!(
            decode_pairs(&frame[..]).unwrap(),
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );

        let mut stats = Statistics {
            n_sets: 3,
            n_entries: 7,
            ..Statistics::default()
        };
        stats.node_is.insert("n0".into(), 7);
        let frame = encode_ok(|enc| encode_statistics(enc, &stats));
        assert_eq!(decode_statistics(&frame[..]).unwrap(), stats);
    }

    #[test]
    fn test_wrong_payload_shape_fails_checksum_or_eof() {
        // A bool payload read as a byte string cannot produce a valid frame.
        let frame = encode_ok(|enc| {
            enc.put_bool(true);
        });
        assert!(matches!(decode_bytes(&frame[..]), Err(WireError::Io(_))));
    }
}
