//! On-disk frame format for log records
//!
//! Each record is stored as:
//! - 4-byte little-endian length of the body
//! - 4-byte little-endian CRC32 of the body
//! - body: the bincode-encoded [`LogRecord`]

use crc32fast::Hasher;

use super::log::LogRecord;
use crate::error::{GraniteError, Result};

/// Length prefix plus checksum
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single encoded record. A length prefix above this is
/// treated as corruption rather than an allocation request.
pub const MAX_RECORD_LEN: usize = 64 << 20;

/// Computes the CRC32 checksum of a frame body
pub fn checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// Encodes a record into a complete frame
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)?;
    if body.len() > MAX_RECORD_LEN {
        return Err(GraniteError::Codec(format!(
            "record of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_RECORD_LEN
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Splits a frame header into (body length, expected checksum).
/// `offset` is the frame's position in the log, used for error reporting.
pub fn decode_header(offset: u64, header: &[u8; FRAME_HEADER_LEN]) -> Result<(usize, u32)> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(GraniteError::corruption(
            offset,
            format!("implausible record length {}", len),
        ));
    }
    Ok((len, crc))
}

/// Verifies and decodes a frame body
pub fn decode_body(offset: u64, expected_crc: u32, body: &[u8]) -> Result<LogRecord> {
    let actual = checksum(body);
    if actual != expected_crc {
        return Err(GraniteError::corruption(
            offset,
            format!("checksum mismatch (expected {:08x}, found {:08x})", expected_crc, actual),
        ));
    }
    bincode::deserialize(body)
        .map_err(|e| GraniteError::corruption(offset, format!("undecodable record: {}", e)))
}
