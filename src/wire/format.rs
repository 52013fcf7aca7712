//! Frame layout and primitive encoding.
//!
//! Every frame is a sequence of little-endian primitives followed by a
//! 4-byte CRC32C footer computed over all preceding bytes of the frame.
//!
//! | Primitive  | Encoding                           |
//! |------------|------------------------------------|
//! | `u32/i32`  | 4 bytes LE                         |
//! | `u64`      | 8 bytes LE                         |
//! | `f64`      | 8 bytes LE (IEEE-754 bits)         |
//! | `bool`     | 1 byte, 0 or 1                     |
//! | bytes      | `u32` length + raw bytes           |
//! | option     | `bool` present flag + value        |
//! | list       | `u32` count + items                |

use std::io::{self, Read};

/// Magic OR-ed into every request opcode word and sent in the prologue.
pub const MAGIC: u32 = 0xb1ff_0000;

/// Protocol version sent in the prologue.
pub const VERSION: u32 = 1;

/// Maximum accepted frame size: 64 MB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the CRC32C footer.
pub const FOOTER_SIZE: usize = 4;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Ping = 0x01,
    WhoMaster = 0x02,
    Exists = 0x07,
    Get = 0x08,
    Set = 0x09,
    Delete = 0x0a,
    Range = 0x0b,
    Prefix = 0x0c,
    TestAndSet = 0x0d,
    RangeEntries = 0x0f,
    Sequence = 0x10,
    MultiGet = 0x11,
    ExpectProgressPossible = 0x12,
    Statistics = 0x13,
    UserFunction = 0x15,
    Assert = 0x16,
    GetKeyCount = 0x1a,
    Confirm = 0x1c,
    RevRangeEntries = 0x23,
    SyncedSequence = 0x24,
    Version = 0x28,
    AssertExists = 0x29,
}

impl Opcode {
    /// Opcode word as sent on the wire.
    pub fn word(self) -> u32 {
        MAGIC | self as u32
    }

    /// Parse an opcode word, checking the magic.
    pub fn from_word(word: u32) -> io::Result<Opcode> {
        if word & 0xffff_0000 != MAGIC {
            return Err(invalid(format!("bad magic in opcode word {:#010x}", word)));
        }
        let op = match word & 0x0000_ffff {
            0x01 => Opcode::Ping,
            0x02 => Opcode::WhoMaster,
            0x07 => Opcode::Exists,
            0x08 => Opcode::Get,
            0x09 => Opcode::Set,
            0x0a => Opcode::Delete,
            0x0b => Opcode::Range,
            0x0c => Opcode::Prefix,
            0x0d => Opcode::TestAndSet,
            0x0f => Opcode::RangeEntries,
            0x10 => Opcode::Sequence,
            0x11 => Opcode::MultiGet,
            0x12 => Opcode::ExpectProgressPossible,
            0x13 => Opcode::Statistics,
            0x15 => Opcode::UserFunction,
            0x16 => Opcode::Assert,
            0x1a => Opcode::GetKeyCount,
            0x1c => Opcode::Confirm,
            0x23 => Opcode::RevRangeEntries,
            0x24 => Opcode::SyncedSequence,
            0x28 => Opcode::Version,
            0x29 => Opcode::AssertExists,
            other => return Err(invalid(format!("unknown opcode {:#06x}", other))),
        };
        Ok(op)
    }
}

/// Response status codes. `Success` is 0; everything else carries a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0x00,
    NoMagic = 0x01,
    TooManyDeadNodes = 0x02,
    NoHello = 0x03,
    NotMaster = 0x04,
    NotFound = 0x05,
    WrongCluster = 0x06,
    AssertionFailed = 0x07,
    ReadOnly = 0x08,
    OutsideInterval = 0x09,
    GoingDown = 0x10,
    NotSupported = 0x20,
    NoLongerMaster = 0x21,
    InconsistentRead = 0x80,
    UserFunctionFailure = 0x81,
    Unknown = 0xff,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> ErrorCode {
        match code {
            0x00 => ErrorCode::Success,
            0x01 => ErrorCode::NoMagic,
            0x02 => ErrorCode::TooManyDeadNodes,
            0x03 => ErrorCode::NoHello,
            0x04 => ErrorCode::NotMaster,
            0x05 => ErrorCode::NotFound,
            0x06 => ErrorCode::WrongCluster,
            0x07 => ErrorCode::AssertionFailed,
            0x08 => ErrorCode::ReadOnly,
            0x09 => ErrorCode::OutsideInterval,
            0x10 => ErrorCode::GoingDown,
            0x20 => ErrorCode::NotSupported,
            0x21 => ErrorCode::NoLongerMaster,
            0x80 => ErrorCode::InconsistentRead,
            0x81 => ErrorCode::UserFunctionFailure,
            _ => ErrorCode::Unknown,
        }
    }
}

pub(crate) fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

// =============================================================================
// ENCODER
// =============================================================================

/// Builds a single frame.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_opt_bytes(&mut self, v: Option<&[u8]>) -> &mut Self {
        match v {
            Some(bytes) => self.put_bool(true).put_bytes(bytes),
            None => self.put_bool(false),
        }
    }

    pub fn put_opt_str(&mut self, v: Option<&str>) -> &mut Self {
        self.put_opt_bytes(v.map(str::as_bytes))
    }

    pub fn put_bytes_list<B: AsRef<[u8]>>(&mut self, items: &[B]) -> &mut Self {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_bytes(item.as_ref());
        }
        self
    }

    /// Bytes written so far, without footer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the CRC32C footer and return the finished frame.
    pub fn finish(mut self) -> Vec<u8> {
        let crc = crc32c::crc32c(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

// =============================================================================
// DECODER
// =============================================================================

/// Reads a single frame from a byte stream, tracking the running checksum.
///
/// Callers read the primitives in order and then call [`Decoder::finish`],
/// which consumes the footer and verifies it.
pub struct Decoder<R> {
    inner: R,
    crc: u32,
    consumed: usize,
}

impl<R: Read> Decoder<R> {
    pub fn new(inner: R) -> Self {
        Decoder {
            inner,
            crc: 0,
            consumed: 0,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.consumed + buf.len() > MAX_FRAME_SIZE {
            return Err(invalid(format!(
                "frame exceeds maximum size {}",
                MAX_FRAME_SIZE
            )));
        }
        self.inner.read_exact(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, buf);
        self.consumed += buf.len();
        Ok(())
    }

    pub fn u32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn i32(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn u64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn f64(&mut self) -> io::Result<f64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(f64::from_bits(u64::from_le_bytes(b)))
    }

    pub fn bool(&mut self) -> io::Result<bool> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        match b[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("invalid bool byte {}", other))),
        }
    }

    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(invalid(format!("byte string length {} too large", len)));
        }
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    pub fn string(&mut self) -> io::Result<String> {
        String::from_utf8(self.bytes()?).map_err(|e| invalid(e.to_string()))
    }

    pub fn opt_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.bool()? {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_string(&mut self) -> io::Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    /// Read a `u32` count followed by that many items.
    pub fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> io::Result<T>) -> io::Result<Vec<T>> {
        let count = self.u32()? as usize;
        // Each item takes at least 4 bytes; bound the preallocation.
        let mut out = Vec::with_capacity(count.min(MAX_FRAME_SIZE / 4).min(1024));
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }

    pub fn bytes_list(&mut self) -> io::Result<Vec<Vec<u8>>> {
        self.list(|d| d.bytes())
    }

    /// Read and verify the CRC32C footer.
    pub fn finish(mut self) -> io::Result<()> {
        let expected = self.crc;
        let mut b = [0u8; FOOTER_SIZE];
        self.inner.read_exact(&mut b)?;
        let found = u32::from_le_bytes(b);
        if found != expected {
            return Err(invalid(format!(
                "checksum mismatch: expected {:#010x}, found {:#010x}",
                expected, found
            )));
        }
        Ok(())
    }
}

// =============================================================================
// PROLOGUE
// =============================================================================

/// Connection prologue: magic, version, cluster id. Sent once per connection.
pub fn encode_prologue(cluster_id: &str) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u32(MAGIC).put_u32(VERSION).put_str(cluster_id);
    enc.finish()
}

/// Parse a prologue and return the cluster id it names.
pub fn decode_prologue(reader: impl Read) -> io::Result<String> {
    let mut dec = Decoder::new(reader);
    if dec.u32()? != MAGIC {
        return Err(invalid("prologue without magic"));
    }
    let version = dec.u32()?;
    if version != VERSION {
        return Err(invalid(format!("unsupported protocol version {}", version)));
    }
    let cluster_id = dec.string()?;
    dec.finish()?;
    Ok(cluster_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_word_roundtrip() {
        for op in [Opcode::Ping, Opcode::WhoMaster, Opcode::RevRangeEntries, Opcode::AssertExists] {
            assert_eq!(Opcode::from_word(op.word()).unwrap(), op);
        }
    }

    #[test]
    fn test_opcode_rejects_bad_magic() {
        let err = Opcode::from_word(0x1234_0008).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = Opcode::from_word(MAGIC | 0x7777).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_frame_checksum_detects_corruption() {
        let mut enc = Encoder::new();
        enc.put_str("hello").put_u64(42).put_opt_bytes(None);
        let mut frame = enc.finish();

        let mut dec = Decoder::new(&frame[..]);
        assert_eq!(dec.string().unwrap(), "hello");
        assert_eq!(dec.u64().unwrap(), 42);
        assert_eq!(dec.opt_bytes().unwrap(), None);
        dec.finish().unwrap();

        // Flip a payload bit.
        frame[5] ^= 0x01;
        let mut dec = Decoder::new(&frame[..]);
        let _ = dec.string().unwrap();
        let _ = dec.u64().unwrap();
        let _ = dec.opt_bytes().unwrap();
        assert_eq!(dec.finish().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let mut enc = Encoder::new();
        enc.put_bytes(b"abcdef");
        let frame = enc.finish();

        let mut dec = Decoder::new(&frame[..6]);
        assert_eq!(dec.bytes().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32(u32::MAX);
        let frame = enc.finish();

        let mut dec = Decoder::new(&frame[..]);
        assert_eq!(dec.bytes().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_prologue() {
        let bytes = encode_prologue("ricky");
        assert_eq!(decode_prologue(&bytes[..]).unwrap(), "ricky");
    }

    #[test]
    fn test_unknown_error_code() {
        assert_eq!(ErrorCode::from_u32(0x05), ErrorCode::NotFound);
        assert_eq!(ErrorCode::from_u32(0x4242), ErrorCode::Unknown);
    }
}
