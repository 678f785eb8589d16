use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use serde::Serialize;

use crate::codec::encode;
use crate::error::{Result, WireError};
use crate::WireConfig;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete wire lines to any `Write` stream.
///
/// Each message is serialized, written in full, and flushed before the call
/// returns — one call, one line on the wire. Callers that share a writer
/// across threads must provide their own exclusion around whole calls.
pub struct LineWriter<T> {
    inner: T,
    buf: BytesMut,
    config: WireConfig,
}

impl<T: Write> LineWriter<T> {
    /// Create a new line writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    /// Create a new line writer with explicit configuration.
    pub fn with_config(inner: T, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Serialize, write, and flush one message (blocking).
    pub fn write_message<M: Serialize>(&mut self, message: &M) -> Result<()> {
        self.buf.clear();
        encode(message, &mut self.buf)?;

        if self.buf.len() > self.config.max_line {
            return Err(WireError::LineTooLong {
                size: self.buf.len(),
                max: self.config.max_line,
            });
        }

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(WireError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(WireError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current writer configuration.
    pub fn config(&self) -> &WireConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::message::Request;

    #[test]
    fn writes_one_terminated_line() {
        let mut writer = LineWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_message(&Request::new(1, "initialize", None))
            .unwrap();

        let wire = writer.into_inner().into_inner();
        assert_eq!(
            wire,
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n"
        );
    }

    #[test]
    fn consecutive_messages_stay_separate_lines() {
        let mut writer = LineWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.write_message(&json!({"id": 1})).unwrap();
        writer.write_message(&json!({"id": 2})).unwrap();

        let wire = writer.into_inner().into_inner();
        let lines: Vec<&[u8]> = wire.split(|&byte| byte == b'\n').collect();
        assert_eq!(lines.len(), 3); // Two lines plus trailing empty split
        assert_eq!(lines[0], br#"{"id":1}"#);
        assert_eq!(lines[1], br#"{"id":2}"#);
    }

    #[test]
    fn oversized_message_rejected_before_writing() {
        let cfg = WireConfig { max_line: 16 };
        let mut writer = LineWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer
            .write_message(&json!({"blob": "x".repeat(64)}))
            .unwrap_err();
        assert!(matches!(err, WireError::LineTooLong { .. }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn flush_is_called() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = LineWriter::new(sink);

        writer.write_message(&json!({"id": 1})).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn handles_interrupted_write_and_flush() {
        let mut writer = LineWriter::new(InterruptedWriteThenFlush {
            wrote_once: false,
            flush_interrupted: false,
            data: Vec::new(),
        });

        writer.write_message(&json!({"id": 5})).unwrap();
        assert_eq!(writer.into_inner().data, b"{\"id\":5}\n");
    }

    #[test]
    fn handles_short_writes() {
        let mut writer = LineWriter::new(OneByteWriter { data: Vec::new() });
        writer.write_message(&json!({"id": 6})).unwrap();
        assert_eq!(writer.into_inner().data, b"{\"id\":6}\n");
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = LineWriter::new(ZeroWriter);
        let err = writer.write_message(&json!({"id": 1})).unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[test]
    fn accessors_and_into_inner() {
        let writer = LineWriter::new(Cursor::new(Vec::<u8>::new()));
        let _ = writer.get_ref();
        assert_eq!(writer.config().max_line, crate::DEFAULT_MAX_LINE);
        let _inner = writer.into_inner();
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InterruptedWriteThenFlush {
        wrote_once: bool,
        flush_interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedWriteThenFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.wrote_once {
                self.wrote_once = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if !self.flush_interrupted {
                self.flush_interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            Ok(())
        }
    }

    struct OneByteWriter {
        data: Vec<u8>,
    }

    impl Write for OneByteWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.data.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
