use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};

use crate::codec::decode_line;
use crate::error::{Result, WireError};
use crate::message::Message;
use crate::WireConfig;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete wire lines from any `Read` stream.
///
/// Handles partial reads internally — callers always get whole lines with
/// the terminator stripped.
pub struct LineReader<T> {
    inner: T,
    buf: BytesMut,
    config: WireConfig,
}

impl<T: Read> LineReader<T> {
    /// Create a new line reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    /// Create a new line reader with explicit configuration.
    pub fn with_config(inner: T, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete line (blocking).
    ///
    /// Returns `Err(WireError::ConnectionClosed)` when EOF is reached,
    /// including EOF with a dangling unterminated fragment.
    pub fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(line) = decode_line(&mut self.buf, self.config.max_line)? {
                return Ok(line);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };

            if read == 0 {
                return Err(WireError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read and classify the next message (blocking).
    pub fn read_message(&mut self) -> Result<Message> {
        let line = self.read_line()?;
        Message::from_line(&line)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &WireConfig {
        &self.config
    }
}
