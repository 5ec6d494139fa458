//! Ops, sequencers, completion handles and the submit throttle.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Completion callback invoked with the op's outcome.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A registered completion that must fire exactly once.
///
/// Dropping an uncompleted handle fires it with [`Error::Fatal`]; the
/// pipeline never lets a registered completion vanish silently.
pub struct CompletionHandle {
    inner: Option<Callback>,
}

impl CompletionHandle {
    /// Wrap a callback.
    pub fn new(callback: Callback) -> Self {
        Self {
            inner: Some(callback),
        }
    }

    /// A handle that does nothing.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Build from an optional callback.
    pub fn from_option(callback: Option<Callback>) -> Self {
        Self { inner: callback }
    }

    /// Fire the completion.
    pub fn complete(mut self, result: Result<()>) {
        if let Some(callback) = self.inner.take() {
            callback(result);
        }
    }

    /// Take the raw callback out, leaving an empty handle.
    pub fn take(&mut self) -> Option<Callback> {
        self.inner.take()
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if let Some(callback) = self.inner.take() {
            warn!("completion handle dropped without a result");
            callback(Err(Error::Fatal(
                "completion abandoned by pipeline".to_string(),
            )));
        }
    }
}

/// One queued batch of transactions.
pub struct Op {
    /// Monotone submission sequence number (also the journal seq).
    pub op_seq: u64,
    /// The transactions to apply.
    pub txs: Vec<Transaction>,
    /// Throttle bytes accounted to this op.
    pub bytes: u64,
    /// Submission time, for slow-op accounting.
    pub queued_at: Instant,
    /// Fires inline after apply, before the next op on the sequencer.
    pub on_readable_sync: Mutex<CompletionHandle>,
    /// Fires on the finisher after apply.
    pub on_readable: Mutex<CompletionHandle>,
    /// Fires once the mode's durability gate is satisfied.
    pub on_commit: Mutex<CompletionHandle>,
    /// Set once the apply finished.
    pub applied: AtomicBool,
    /// Set once the journal entry is durable.
    pub durable: AtomicBool,
    /// Guards single-shot commit firing.
    pub commit_fired: AtomicBool,
}

impl Op {
    /// Abort every remaining completion with a fatal error.
    pub fn abort(&self, message: &str) {
        for slot in [&self.on_readable_sync, &self.on_readable, &self.on_commit] {
            if let Some(callback) = slot.lock().take() {
                callback(Err(Error::Fatal(message.to_string())));
            }
        }
    }
}

/// Queues owned by one sequencer, guarded by its qlock.
#[derive(Default)]
pub struct SeqQueues {
    /// Ops waiting for (or in) apply, submission order.
    pub q: VecDeque<Arc<Op>>,
    /// Seqs waiting for journal durability, submission order.
    pub jq: VecDeque<u64>,
}

/// An ordering domain: all ops queued against one sequencer apply in
/// submission order; distinct sequencers proceed independently.
pub struct OpSequencer {
    /// Registry id inside the pipeline.
    pub id: u64,
    /// Submitter-chosen name, for logs.
    pub name: String,
    /// Queue state.
    pub queues: Mutex<SeqQueues>,
    /// Signaled whenever either queue shrinks.
    pub cv: Condvar,
    /// Held for the duration of each apply.
    pub apply_lock: Mutex<()>,
}

impl OpSequencer {
    /// New, empty sequencer.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            queues: Mutex::new(SeqQueues::default()),
            cv: Condvar::new(),
            apply_lock: Mutex::new(()),
        }
    }

    /// Enqueue an op and its journal marker.
    pub fn enqueue(&self, op: Arc<Op>) {
        let mut queues = self.queues.lock();
        queues.jq.push_back(op.op_seq);
        queues.q.push_back(op);
    }

    /// Mark a seq durable, dropping it from the journal queue.
    pub fn dequeue_journal(&self, seq: u64) {
        let mut queues = self.queues.lock();
        if let Some(at) = queues.jq.iter().position(|s| *s == seq) {
            queues.jq.remove(at);
        }
        self.cv.notify_all();
    }

    /// Remove the front op after apply.
    pub fn pop_applied(&self, seq: u64) {
        let mut queues = self.queues.lock();
        if queues.q.front().map(|op| op.op_seq) == Some(seq) {
            queues.q.pop_front();
        }
        self.cv.notify_all();
    }

    /// Block until every op queued before the call has applied and its
    /// journal entry is durable.
    pub fn flush(&self) {
        let mut queues = self.queues.lock();
        let mut target = 0u64;
        if let Some(op) = queues.q.back() {
            target = op.op_seq;
        }
        if let Some(seq) = queues.jq.back() {
            target = target.max(*seq);
        }
        if target == 0 {
            return;
        }
        loop {
            let pending_apply = queues.q.front().map(|op| op.op_seq <= target).unwrap_or(false);
            let pending_journal = queues.jq.front().map(|seq| *seq <= target).unwrap_or(false);
            if !pending_apply && !pending_journal {
                return;
            }
            self.cv.wait(&mut queues);
        }
    }

    /// Whether both queues are empty.
    pub fn is_idle(&self) -> bool {
        let queues = self.queues.lock();
        queues.q.is_empty() && queues.jq.is_empty()
    }
}

/// Bounded in-flight ops and bytes; submitters block when either cap is
/// reached. A single oversized op is still admitted when nothing else is
/// in flight, so it cannot deadlock.
pub struct Throttle {
    max_ops: u64,
    max_bytes: u64,
    state: Mutex<(u64, u64)>,
    cv: Condvar,
}

impl Throttle {
    /// Build with caps.
    pub fn new(max_ops: u64, max_bytes: u64) -> Self {
        Self {
            max_ops: max_ops.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new((0, 0)),
            cv: Condvar::new(),
        }
    }

    /// Reserve one op of `bytes`; blocks while over either cap.
    pub fn reserve(&self, bytes: u64) {
        let mut state = self.state.lock();
        loop {
            let (ops, in_bytes) = *state;
            if ops == 0 || (ops < self.max_ops && in_bytes + bytes <= self.max_bytes) {
                break;
            }
            self.cv.wait(&mut state);
        }
        state.0 += 1;
        state.1 += bytes;
    }

    /// Release a reservation.
    pub fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.0 = state.0.saturating_sub(1);
        state.1 = state.1.saturating_sub(bytes);
        self.cv.notify_all();
    }

    /// Current (ops, bytes) in flight.
    pub fn in_flight(&self) -> (u64, u64) {
        *self.state.lock()
    }
}
