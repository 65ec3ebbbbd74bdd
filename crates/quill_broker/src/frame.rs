//! Length-prefixed, CRC-checked frames.
//!
//! Layout: `[u32 BE payload len][u32 BE crc32(payload)][payload]`. The record
//! log stores one frame per record; control-plane connections send one frame
//! per request and expect a single `ACK` byte back.

use std::io::{self, Write};

use crc32fast::Hasher;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes preceding every payload.
pub const FRAME_HEADER_LEN: usize = 8;
/// Upper bound on a single payload; larger lengths are treated as damage.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// Byte written by a control-plane peer after it accepted a frame.
pub const ACK: u8 = 0x01;

pub fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Encode one payload into a standalone frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Append one frame to a writer.
pub fn write_frame<W: Write>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(&checksum(payload).to_be_bytes())?;
    out.write_all(payload)
}

/// Split a header into `(payload_len, expected_crc)`.
pub fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> (usize, u32) {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

/// Read one frame from an async stream.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let (len, expected) = parse_header(&header);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let actual = checksum(&payload);
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame checksum mismatch (expected={expected}, actual={actual})"),
        ));
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_frame_returns_payloads_then_none_at_eof() {
        let mut wire = encode(b"first");
        wire.extend_from_slice(&encode(b""));
        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_rejects_flipped_payload_bit() {
        let mut wire = encode(b"leader-and-isr");
        let last = wire.len() - 1;
        wire[last] ^= 0x40;
        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn write_frame_matches_encode() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc").unwrap();
        assert_eq!(out, encode(b"abc"));
        let header: [u8; FRAME_HEADER_LEN] = out[..FRAME_HEADER_LEN].try_into().unwrap();
        assert_eq!(parse_header(&header), (3, checksum(b"abc")));
    }
}
