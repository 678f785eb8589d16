use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::{ClientError, Result};

/// Resolution of one in-flight call: the result payload or a per-call
/// failure.
pub type CallOutcome = Result<Value>;

/// The pending-call table shared between the correlator and outstanding
/// handles.
///
/// Every mutation happens inside the table mutex, which is what makes the
/// resolve/timeout race well defined: whichever side removes an id's entry
/// owns that call's outcome, exactly once.
#[derive(Default)]
pub(crate) struct PendingTable {
    slots: Mutex<HashMap<u64, SyncSender<CallOutcome>>>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SyncSender<CallOutcome>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, id: u64, sender: SyncSender<CallOutcome>) {
        self.lock().insert(id, sender);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<SyncSender<CallOutcome>> {
        self.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Matches asynchronously arriving replies to the request that originated
/// them.
///
/// Ids are strictly increasing and never reused within one connection, so
/// a late reply for a timed-out call can never be mistaken for a newer
/// one.
pub struct Correlator {
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and register a pending call under it.
    ///
    /// The returned [`CallHandle`] is the only way to observe the call's
    /// outcome.
    pub fn register(&self) -> (u64, CallHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::sync_channel(1);
        self.pending.insert(id, sender);
        let handle = CallHandle {
            id,
            receiver,
            pending: Arc::clone(&self.pending),
        };
        (id, handle)
    }

    /// Resolve the pending call with this id, delivering `outcome` to its
    /// waiting caller.
    ///
    /// Remove-and-signal happens inside the table's critical section, so
    /// it is atomic with respect to a concurrent timeout: exactly one side
    /// wins. Returns `false` when no call with this id is pending (late
    /// reply after timeout, or a server bug) — the outcome is dropped.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let mut slots = self.pending.lock();
        match slots.remove(&id) {
            Some(sender) => {
                // Capacity-one channel with a single send: never blocks. A
                // send error means the caller abandoned its handle.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a registration whose request was never written (send failure).
    pub fn abandon(&self, id: u64) {
        self.pending.remove(id);
    }

    /// Fail every pending call. Used when the transport dies.
    pub fn fail_all(&self, reason: &str) {
        let mut slots = self.pending.lock();
        let failed = slots.len();
        for (_, sender) in slots.drain() {
            let _ = sender.send(Err(ClientError::TransportClosed(reason.to_string())));
        }
        if failed > 0 {
            warn!(failed, reason, "failed all pending calls");
        }
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Whether an id is still awaiting a reply (diagnostics).
    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-flight call, owned by its caller.
///
/// Dropping the handle without waiting unregisters the call, so an
/// abandoned detached call cannot leak pending state.
pub struct CallHandle {
    id: u64,
    receiver: Receiver<CallOutcome>,
    pending: Arc<PendingTable>,
}

impl CallHandle {
    /// The request id this handle is waiting on.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the call resolves or the deadline passes.
    ///
    /// On timeout the pending entry is removed by this side, so any reply
    /// arriving later finds nothing to resolve and is dropped.
    pub fn wait(self, timeout: Duration) -> CallOutcome {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.pending.remove(self.id).is_some() {
                    Err(ClientError::Timeout(timeout))
                } else {
                    // The resolver won the race inside the table's critical
                    // section, which includes the send: the outcome is
                    // already buffered.
                    match self.receiver.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ClientError::Timeout(timeout)),
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ClientError::TransportClosed("pending call dropped".to_string()))
            }
        }
    }

    /// Non-blocking poll. Returns `None` while the call is still pending.
    pub fn try_wait(&self) -> Option<CallOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ClientError::TransportClosed(
                "pending call dropped".to_string(),
            ))),
        }
    }
}

// The receiver and table fields carry no useful diagnostics, so a derive
// is both impossible and unwanted.
impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        // No-op if the call already resolved or timed out.
        self.pending.remove(self.id);
    }
}
