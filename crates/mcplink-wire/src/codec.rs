use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::error::{Result, WireError};

/// Default maximum line size: 16 MiB.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

/// Configuration for the line codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum serialized line size in bytes. Default: 16 MiB.
    pub max_line: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

/// Encode one message into the wire format: one JSON document plus `\n`.
///
/// serde_json escapes control characters inside strings, so the payload
/// itself can never contain a raw newline.
pub fn encode<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<()> {
    let json = serde_json::to_vec(value)?;
    dst.reserve(json.len() + 1);
    dst.extend_from_slice(&json);
    dst.extend_from_slice(b"\n");
    Ok(())
}

/// Decode one complete line from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a terminated line yet.
/// Blank lines are consumed and skipped. A trailing `\r` is stripped so
/// `\r\n` servers work too. On success, consumes the line bytes from the
/// buffer. Buffered data growing past `max_line` without a terminator is
/// an error — the stream cannot resynchronize.
pub fn decode_line(src: &mut BytesMut, max_line: usize) -> Result<Option<Bytes>> {
    loop {
        match src.iter().position(|&byte| byte == b'\n') {
            Some(pos) => {
                if pos > max_line {
                    return Err(WireError::LineTooLong {
                        size: pos,
                        max: max_line,
                    });
                }
                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                if line.is_empty() {
                    continue; // Blank keep-alive line
                }
                return Ok(Some(line.freeze()));
            }
            None => {
                if src.len() > max_line {
                    return Err(WireError::LineTooLong {
                        size: src.len(),
                        max: max_line,
                    });
                }
                return Ok(None); // Need more data
            }
        }
    }
}
