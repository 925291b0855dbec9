//! Bitcoin P2P wire codec: varint, primitives, and message framing (4-byte
//! magic, 12-byte ASCII command, 4-byte length, 4-byte double-SHA256
//! checksum prefix).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chain::header::Hash256;

pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD_LEN: u32 = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("unexpected end of buffer reading {0}")]
    Eof(&'static str),
    #[error("payload length {0} exceeds maximum {1}")]
    PayloadTooLarge(u32, u32),
    #[error("magic mismatch: expected {expected:08x}, got {got:08x}")]
    MagicMismatch { expected: u32, got: u32 },
    #[error("checksum mismatch for command {0:?}")]
    ChecksumMismatch(String),
    #[error("command is not valid ASCII/NUL-padded")]
    InvalidCommand,
    #[error("unrecognised inventory kind code {0:#x}")]
    UnknownInventoryKind(u32),
    #[error("varint is not in canonical minimal form")]
    NonCanonicalVarint,
    #[error("string exceeds maximum length")]
    StringTooLong,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// A byte cursor over a decode buffer, tracking how many bytes primitives
/// have consumed so callers can validate "decoding consumed exactly the
/// input" where that matters (PMT, messages with trailing data forbidden).
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Eof(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8, "u64")?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8, "i64")?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_hash256(&mut self) -> Result<Hash256> {
        let b = self.take(32, "hash256")?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(Hash256::from_bytes(arr))
    }

    /// Bitcoin's variable-length integer: a length prefix byte selects a
    /// 1/3/5/9-byte encoding. Rejects non-minimal encodings (a value that
    /// fits a shorter form but was sent in a longer one).
    pub fn read_varint(&mut self) -> Result<u64> {
        let prefix = self.read_u8()?;
        match prefix {
            0..=0xfc => Ok(prefix as u64),
            0xfd => {
                let v = u16::from_le_bytes(self.take(2, "varint16")?.try_into().unwrap()) as u64;
                if v <= 0xfc {
                    return Err(WireError::NonCanonicalVarint);
                }
                Ok(v)
            }
            0xfe => {
                let v = u32::from_le_bytes(self.take(4, "varint32")?.try_into().unwrap()) as u64;
                if v <= 0xffff {
                    return Err(WireError::NonCanonicalVarint);
                }
                Ok(v)
            }
            0xff => {
                let v = u64::from_le_bytes(self.take(8, "varint64")?.try_into().unwrap());
                if v <= 0xffff_ffff {
                    return Err(WireError::NonCanonicalVarint);
                }
                Ok(v)
            }
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()?;
        if len > MAX_PAYLOAD_LEN as u64 {
            return Err(WireError::StringTooLong);
        }
        Ok(self.take(len as usize, "var_bytes")?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidCommand)
    }
}

pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_var_str(out: &mut Vec<u8>, s: &str) {
    write_var_bytes(out, s.as_bytes());
}

pub fn write_hash256(out: &mut Vec<u8>, hash: &Hash256) {
    out.extend_from_slice(hash.as_bytes());
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Hash256::hash(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[0..4]);
    out
}

fn command_bytes(command: &str) -> Result<[u8; 12]> {
    let b = command.as_bytes();
    if b.len() > 12 || !b.iter().all(|c| c.is_ascii_graphic()) {
        return Err(WireError::InvalidCommand);
    }
    let mut out = [0u8; 12];
    out[..b.len()].copy_from_slice(b);
    Ok(out)
}

fn command_str(raw: &[u8; 12]) -> Result<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(12);
    if raw[end..].iter().any(|b| *b != 0) {
        return Err(WireError::InvalidCommand);
    }
    String::from_utf8(raw[..end].to_vec()).map_err(|_| WireError::InvalidCommand)
}

/// Build the full framed message: 24-byte header followed by payload.
pub fn encode_message(magic: u32, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() as u32 > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len() as u32, MAX_PAYLOAD_LEN));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&command_bytes(command)?);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read one framed message from an async stream: the 24-byte header, then
/// exactly `length` payload bytes, verifying magic and checksum.
pub async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected_magic: u32,
) -> Result<(String, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;

    let magic = u32::from_le_bytes(header_buf[0..4].try_into().unwrap());
    if magic != expected_magic {
        return Err(WireError::MagicMismatch {
            expected: expected_magic,
            got: magic,
        });
    }
    let mut command_raw = [0u8; 12];
    command_raw.copy_from_slice(&header_buf[4..16]);
    let command = command_str(&command_raw)?;
    let length = u32::from_le_bytes(header_buf[16..20].try_into().unwrap());
    if length > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(length, MAX_PAYLOAD_LEN));
    }
    let mut expected_checksum = [0u8; 4];
    expected_checksum.copy_from_slice(&header_buf[20..24]);

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    if checksum(&payload) != expected_checksum {
        return Err(WireError::ChecksumMismatch(command));
    }

    Ok((command, payload))
}

pub async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: u32,
    command: &str,
    payload: &[u8],
) -> Result<()> {
    let framed = encode_message(magic, command, payload)?;
    writer.write_all(&framed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_all_size_classes() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut out = Vec::new();
            write_varint(&mut out, n);
            let mut r = Reader::new(&out);
            assert_eq!(r.read_varint().unwrap(), n);
        }
    }

    #[test]
    fn varint_rejects_non_minimal_encoding() {
        // 0x00fc encoded with the 0xfd (3-byte) prefix instead of 1 byte.
        let bytes = [0xfdu8, 0xfc, 0x00];
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_varint(), Err(WireError::NonCanonicalVarint)));
    }

    #[test]
    fn message_round_trips_through_framing() {
        let payload = b"hello world".to_vec();
        let framed = encode_message(0xD9B4BEF9, "ping", &payload).unwrap();

        let mut cursor = std::io::Cursor::new(framed);
        let (command, decoded) =
            tokio_test::block_on(read_framed(&mut cursor, 0xD9B4BEF9)).unwrap();
        assert_eq!(command, "ping");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let framed = encode_message(0xD9B4BEF9, "ping", b"x").unwrap();
        let mut cursor = std::io::Cursor::new(framed);
        let result = tokio_test::block_on(read_framed(&mut cursor, 0x0709110B));
        assert!(matches!(result, Err(WireError::MagicMismatch { .. })));
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let mut framed = encode_message(0xD9B4BEF9, "ping", b"hello").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        let mut cursor = std::io::Cursor::new(framed);
        let result = tokio_test::block_on(read_framed(&mut cursor, 0xD9B4BEF9));
        assert!(matches!(result, Err(WireError::ChecksumMismatch(_))));
    }

    #[test]
    fn command_round_trips_with_nul_padding() {
        let bytes = command_bytes("verack").unwrap();
        assert_eq!(command_str(&bytes).unwrap(), "verack");
    }
}
