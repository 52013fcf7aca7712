//! Binary wire codec.
//!
//! Requests and responses are self-delimiting frames of length-prefixed
//! primitives closed by a CRC32C footer. The routing layer only needs
//! [`Request::encode`] and the typed `decode_*` functions; the server side
//! (used by the simulated cluster) needs [`Request::decode`] and
//! [`encode_ok`]/[`encode_error`].

pub mod format;
pub mod request;
pub mod response;

pub use format::{
    decode_prologue, encode_prologue, Decoder, Encoder, ErrorCode, Opcode, MAGIC, MAX_FRAME_SIZE,
    VERSION,
};
pub use request::{KeyRange, Request, Sequence, Update};
pub use response::{
    decode_bool, decode_bytes, decode_bytes_list, decode_opt_bytes, decode_opt_string,
    decode_pairs, decode_statistics, decode_string, decode_u64, decode_unit, decode_version,
    encode_error, encode_ok, encode_statistics, encode_version, read_response, Statistics,
    Version, WireError,
};
