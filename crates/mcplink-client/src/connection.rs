use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mcplink_wire::{
    LineReader, LineWriter, Message, Notification, Request, RequestId, ResponseOutcome, WireConfig,
    WireError,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::correlate::{CallHandle, Correlator};
use crate::error::{ClientError, Result};
use crate::state::ConnectionState;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

type BoxedWriter = LineWriter<Box<dyn Write + Send>>;

struct Inner {
    correlator: Correlator,
    writer: Mutex<Option<BoxedWriter>>,
    state: Mutex<ConnectionState>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Compare-and-set state transition. Returns false if the connection
    /// was not in `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn write(&self, message: &impl serde::Serialize) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_mut() {
            Some(writer) => writer.write_message(message).map_err(Into::into),
            None => Err(ClientError::TransportClosed("writer closed".to_string())),
        }
    }

    fn close_writer(&self) {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Stream ended or broke: everything still pending fails, and the
    /// connection is unusable from here on.
    fn on_stream_end(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Failed;
            }
        }
        self.close_writer();
        self.correlator.fail_all(reason);
    }
}

/// One bidirectional stream pair with its background reader.
///
/// The connection is protocol-mechanics only: it correlates replies and
/// serializes writes. Handshake gating lives in
/// [`McpClient`](crate::client::McpClient).
pub struct Connection {
    inner: Arc<Inner>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start a connection over an arbitrary stream pair.
    ///
    /// Spawns the dedicated reader thread immediately. This is also the
    /// test seam: any `Read`/`Write` pair works, not just child pipes.
    pub fn start<R, W>(read_stream: R, write_stream: W, config: WireConfig) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let inner = Arc::new(Inner {
            correlator: Correlator::new(),
            writer: Mutex::new(Some(LineWriter::with_config(
                Box::new(write_stream) as Box<dyn Write + Send>,
                config.clone(),
            ))),
            state: Mutex::new(ConnectionState::Unstarted),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = std::thread::Builder::new()
            .name("mcplink-reader".to_string())
            .spawn(move || read_loop(LineReader::with_config(read_stream, config), &reader_inner))
            .ok();
        if reader.is_none() {
            inner.on_stream_end("reader thread failed to start");
        }

        Self { inner, reader }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.inner.set_state(next);
    }

    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner.transition(from, to)
    }

    /// Send a request and block for its reply.
    pub fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        self.request_detached(method, params)?.wait(timeout)
    }

    /// Send a request and return a handle to await later.
    ///
    /// Registration happens before the write so the reply cannot race past
    /// the pending entry; a failed write unregisters again.
    pub fn request_detached(&self, method: &str, params: Option<Value>) -> Result<CallHandle> {
        let (id, handle) = self.inner.correlator.register();
        let request = Request::new(id, method, params);
        if let Err(err) = self.inner.write(&request) {
            self.inner.correlator.abandon(id);
            return Err(err);
        }
        Ok(handle)
    }

    /// Send a one-way notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.write(&Notification::new(method, params))
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_calls()
    }

    /// Begin an orderly shutdown: refuse new calls, give in-flight calls
    /// up to `drain` to resolve, fail the stragglers, and close the write
    /// side (EOF on the peer's stdin).
    pub(crate) fn begin_close(&self, drain: Duration) {
        self.inner.set_state(ConnectionState::Closed);

        let deadline = Instant::now() + drain;
        while self.inner.correlator.pending_calls() > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        self.inner.correlator.fail_all("connection closed");
        self.inner.close_writer();
    }

    /// Join the reader thread. Callers must first ensure the read stream
    /// will reach EOF (peer stopped or write side closed).
    pub(crate) fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best effort: unblock every waiter and detach the reader, which
        // exits on its own once the stream reaches EOF.
        self.inner.on_stream_end("connection dropped");
    }
}

fn read_loop<R: Read>(mut reader: LineReader<R>, inner: &Inner) {
    let reason = loop {
        let line = match reader.read_line() {
            Ok(line) => line,
            Err(WireError::ConnectionClosed) => break "stream ended".to_string(),
            Err(err) => break format!("read failed: {err}"),
        };

        match Message::from_line(&line) {
            Ok(Message::Response(response)) => match response.id {
                RequestId::Number(id) => {
                    let outcome = match response.outcome {
                        ResponseOutcome::Result(value) => Ok(value),
                        ResponseOutcome::Error(err) => Err(ClientError::Tool(err)),
                    };
                    if !inner.correlator.resolve(id, outcome) {
                        warn!(id, "dropping response with no pending call");
                    }
                }
                RequestId::Text(id) => {
                    warn!(id = %id, "dropping response with unknown string id");
                }
            },
            Ok(Message::Request(request)) => {
                debug!(method = %request.method, "ignoring server-initiated request");
            }
            Ok(Message::Notification(notification)) => {
                debug!(method = %notification.method, "ignoring server notification");
            }
            // Malformed input is logged and skipped, never fatal.
            Err(err) => warn!(error = %err, "skipping malformed line"),
        }
    };

    debug!(%reason, "reader loop ended");
    inner.on_stream_end(&reason);
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use mcplink_wire::Response;
    use serde_json::json;

    use super::*;

    /// A scripted peer: answers exactly `count` requests with the provided
    /// function, then hangs up.
    fn scripted_peer(
        stream: UnixStream,
        count: usize,
        reply: impl Fn(&Request) -> Response + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut reader = LineReader::new(stream.try_clone().expect("clone peer stream"));
            let mut writer = LineWriter::new(stream);
            let mut answered = 0;
            while answered < count {
                match reader.read_message() {
                    Ok(Message::Request(request)) => {
                        writer.write_message(&reply(&request)).unwrap();
                        answered += 1;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
    }

    fn start_over(stream: UnixStream) -> Connection {
        let read = stream.try_clone().expect("clone local stream");
        Connection::start(read, stream, WireConfig::default())
    }

    #[test]
    fn request_resolves_with_matching_reply() {
        let (local, remote) = UnixStream::pair().unwrap();
        let peer = scripted_peer(remote, 1, |request| {
            Response::result(request.id.clone(), json!({"echo": request.method}))
        });

        let connection = start_over(local);
        let result = connection
            .request("ping", None, Duration::from_secs(2))
            .unwrap();
        assert_eq!(result, json!({"echo": "ping"}));

        peer.join().unwrap();
        drop(connection);
    }

    #[test]
    fn out_of_order_replies_route_by_id() {
        let (local, remote) = UnixStream::pair().unwrap();

        // Collect a batch of requests, then answer them newest-first.
        let peer = thread::spawn(move || {
            let mut reader = LineReader::new(remote.try_clone().unwrap());
            let mut writer = LineWriter::new(remote);
            let mut batch = Vec::new();
            for _ in 0..4 {
                if let Ok(Message::Request(request)) = reader.read_message() {
                    batch.push(request);
                }
            }
            for request in batch.into_iter().rev() {
                let method = request.method.clone();
                writer
                    .write_message(&Response::result(request.id, json!({ "method": method })))
                    .unwrap();
            }
        });

        let connection = start_over(local);
        let handles: Vec<_> = (0..4)
            .map(|call| {
                let method = format!("call-{call}");
                (
                    method.clone(),
                    connection.request_detached(&method, None).unwrap(),
                )
            })
            .collect();

        for (method, handle) in handles {
            let result = handle.wait(Duration::from_secs(2)).unwrap();
            assert_eq!(result, json!({ "method": method }));
        }

        peer.join().unwrap();
        drop(connection);
    }

    #[test]
    fn silent_peer_times_out_without_leaking() {
        let (local, remote) = UnixStream::pair().unwrap();

        let connection = start_over(local);
        let err = connection
            .request("never-answered", None, Duration::from_millis(50))
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(connection.pending_calls(), 0);

        drop(connection);
        drop(remote);
    }

    #[test]
    fn error_reply_surfaces_as_tool_error() {
        let (local, remote) = UnixStream::pair().unwrap();
        let peer = scripted_peer(remote, 1, |request| {
            Response::error(request.id.clone(), -32000, "collection does not exist")
        });

        let connection = start_over(local);
        let err = connection
            .request("tools/call", None, Duration::from_secs(2))
            .unwrap_err();

        match err {
            ClientError::Tool(rpc) => assert_eq!(rpc.code, -32000),
            other => panic!("expected tool error, got {other:?}"),
        }

        peer.join().unwrap();
        drop(connection);
    }

    #[test]
    fn peer_hangup_fails_all_pending_calls() {
        let (local, remote) = UnixStream::pair().unwrap();

        let connection = start_over(local);
        let first = connection.request_detached("a", None).unwrap();
        let second = connection.request_detached("b", None).unwrap();

        drop(remote); // EOF

        let err = first.wait(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed(_)));
        let err = second.wait(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed(_)));

        assert_eq!(connection.state(), ConnectionState::Failed);
        let err = connection.request_detached("c", None).unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed(_)));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let (local, remote) = UnixStream::pair().unwrap();

        let peer = thread::spawn(move || {
            use std::io::Write as _;
            let mut reader = LineReader::new(remote.try_clone().unwrap());
            if let Ok(Message::Request(request)) = reader.read_message() {
                // Garbage, an unmatched reply, then the real one.
                let mut raw = reader.into_inner();
                raw.write_all(b"this is not json\n").unwrap();
                raw.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":424242,\"result\":0}\n")
                    .unwrap();
                let reply =
                    serde_json::to_vec(&Response::result(request.id, json!("real"))).unwrap();
                raw.write_all(&reply).unwrap();
                raw.write_all(b"\n").unwrap();
            }
        });

        let connection = start_over(local);
        let result = connection
            .request("fragile", None, Duration::from_secs(2))
            .unwrap();
        assert_eq!(result, json!("real"));

        drop(connection);
        peer.join().unwrap();
    }

    #[test]
    fn late_reply_after_timeout_does_not_disturb_later_calls() {
        let (local, remote) = UnixStream::pair().unwrap();

        let peer = thread::spawn(move || {
            let mut reader = LineReader::new(remote.try_clone().unwrap());
            let mut writer = LineWriter::new(remote);

            // First request: sit on it until the second arrives, then
            // answer both, stale one first.
            let first = match reader.read_message() {
                Ok(Message::Request(request)) => request,
                other => panic!("expected request, got {other:?}"),
            };
            let second = match reader.read_message() {
                Ok(Message::Request(request)) => request,
                other => panic!("expected request, got {other:?}"),
            };
            writer
                .write_message(&Response::result(first.id, json!("stale")))
                .unwrap();
            writer
                .write_message(&Response::result(second.id, json!("fresh")))
                .unwrap();
        });

        let connection = start_over(local);
        let err = connection
            .request("slow", None, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        let result = connection
            .request("fast", None, Duration::from_secs(2))
            .unwrap();
        assert_eq!(result, json!("fresh"));

        peer.join().unwrap();
        drop(connection);
    }

    #[test]
    fn begin_close_refuses_new_calls_and_closes_writer() {
        let (local, remote) = UnixStream::pair().unwrap();

        let connection = start_over(local);
        connection.begin_close(Duration::from_millis(100));

        assert_eq!(connection.state(), ConnectionState::Closed);
        let err = connection.request_detached("post-close", None).unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed(_)));

        drop(connection);
        drop(remote);
    }

    #[test]
    fn concurrent_callers_share_one_stream_safely() {
        let (local, remote) = UnixStream::pair().unwrap();
        let peer = scripted_peer(remote, 16, |request| {
            Response::result(request.id.clone(), json!(request.params))
        });

        let connection = Arc::new(start_over(local));
        let callers: Vec<_> = (0..16)
            .map(|caller| {
                let connection = Arc::clone(&connection);
                thread::spawn(move || {
                    connection.request(
                        "echo",
                        Some(json!({ "caller": caller })),
                        Duration::from_secs(5),
                    )
                })
            })
            .collect();

        for (caller, thread) in callers.into_iter().enumerate() {
            let result = thread.join().unwrap().unwrap();
            assert_eq!(result, json!({ "caller": caller }));
        }

        drop(connection);
        peer.join().unwrap();
    }
}
