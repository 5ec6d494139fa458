//! Ring-file journal with a dedicated writer thread.
//!
//! Entries occupy block-aligned spans inside a fixed ring; logical
//! positions grow monotonically and wrap physically. The writer thread
//! drains a submission queue, writes and fdatasyncs batches, and advances
//! the durable frontier strictly in sequence order. In async I/O mode
//! writes fan out to a small completion pool and the frontier advances
//! only once every lower sequence number is durable.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::journal::format::{entry_span, EntryHeader, JournalHeader, HEADER_BLOCK};
use crate::journal::{JournalConfig, JournalIoMode, JournalStats, StreamItem};
use crate::utility::{pad_alignment, AlignedBuffer};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Callback invoked once an entry is durable (or the journal has failed).
pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Debug)]
struct EntryMeta {
    seq: u64,
    pos: u64,
    span: u64,
    len: u32,
}

#[derive(Debug)]
struct RingState {
    start_pos: u64,
    write_pos: u64,
    start_seq: u64,
    next_seq: u64,
    committed_seq: u64,
    entries: VecDeque<EntryMeta>,
    holds: BTreeMap<u64, u64>,
    next_hold: u64,
    failed: Option<String>,
    stopping: bool,
}

#[derive(Debug)]
struct JournalShared {
    file: File,
    uuid: Uuid,
    block_size: u32,
    capacity: u64,
    direct: bool,
    state: Mutex<RingState>,
    space_cv: Condvar,
    commit_cv: Condvar,
}

impl JournalShared {
    fn phys(&self, logical: u64) -> u64 {
        HEADER_BLOCK as u64 + logical % self.capacity
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        if self.direct {
            // O_DIRECT writes must cover whole blocks. Header and entry
            // spans are already block multiples, so the pad is normally
            // zero bytes of trailing slack inside the reserved span.
            let align = self.block_size as usize;
            let padded = pad_alignment(data.len(), align);
            let mut buf = AlignedBuffer::zeroed(align, padded)
                .ok_or_else(|| std::io::Error::other("aligned buffer allocation failed"))?;
            buf.as_mut_slice()[..data.len()].copy_from_slice(data);
            self.file.write_all_at(buf.as_slice(), offset)
        } else {
            self.file.write_all_at(data, offset)
        }
    }

    /// Write a block-aligned span at a logical ring position, splitting at
    /// the physical wrap point.
    fn write_ring(&self, logical: u64, data: &[u8]) -> std::io::Result<()> {
        let offset = logical % self.capacity;
        let until_wrap = (self.capacity - offset) as usize;
        if data.len() <= until_wrap {
            self.write_at(self.phys(logical), data)
        } else {
            self.write_at(self.phys(logical), &data[..until_wrap])?;
            self.write_at(HEADER_BLOCK as u64, &data[until_wrap..])
        }
    }

    fn read_ring(&self, reader: &File, logical: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let offset = logical % self.capacity;
        let until_wrap = (self.capacity - offset) as usize;
        if buf.len() <= until_wrap {
            reader.read_exact_at(buf, self.phys(logical))
        } else {
            let (head, tail) = buf.split_at_mut(until_wrap);
            reader.read_exact_at(head, self.phys(logical))?;
            reader.read_exact_at(tail, HEADER_BLOCK as u64)
        }
    }

    fn persist_header(&self, start_pos: u64, start_seq: u64) -> std::io::Result<()> {
        let mut header = JournalHeader::new(self.uuid, self.block_size, self.capacity);
        header.start_pos = start_pos;
        header.start_seq = start_seq;
        let mut buf = vec![0u8; HEADER_BLOCK];
        header
            .encode(&mut buf)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.write_at(0, &buf)?;
        self.file.sync_data()
    }

    fn fail(&self, message: String) {
        warn!(error = %message, "journal entering failed state");
        let mut state = self.state.lock();
        if state.failed.is_none() {
            state.failed = Some(message);
        }
        self.commit_cv.notify_all();
        self.space_cv.notify_all();
    }
}

enum WriteRequest {
    Entry(PendingWrite),
    Shutdown,
}

struct PendingWrite {
    seq: u64,
    pos: u64,
    bytes: Vec<u8>,
    completion: CommitCallback,
}

/// Append-only ring journal over a single file.
#[derive(Debug)]
pub struct FileJournal {
    shared: Arc<JournalShared>,
    reader: File,
    submit_tx: Sender<WriteRequest>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
    aio_workers: Mutex<Vec<thread::JoinHandle<()>>>,
    completer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FileJournal {
    /// Format a fresh journal file at `path`.
    pub fn create(path: impl AsRef<Path>, uuid: Uuid, config: &JournalConfig) -> Result<()> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(HEADER_BLOCK as u64 + config.capacity)?;

        let header = JournalHeader::new(uuid, config.block_size, config.capacity);
        let mut buf = vec![0u8; HEADER_BLOCK];
        header
            .encode(&mut buf)
            .map_err(|e| Error::Corruption(e.to_string()))?;
        file.write_all_at(&buf, 0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Open an existing journal, replaying retained entries.
    ///
    /// Entries with `seq <= applied_watermark` are retained for trim
    /// accounting but not returned. The scan stops at the first torn or
    /// stale entry; appends resume immediately after the last good one.
    pub fn open(
        path: impl AsRef<Path>,
        uuid: Uuid,
        config: &JournalConfig,
        applied_watermark: u64,
    ) -> Result<(Self, Vec<(u64, Vec<u8>)>)> {
        config.validate()?;
        let path = path.as_ref();
        let reader = OpenOptions::new().read(true).open(path)?;

        let mut header_buf = vec![0u8; HEADER_BLOCK];
        reader.read_exact_at(&mut header_buf, 0)?;
        let header =
            JournalHeader::decode(&header_buf).map_err(|e| Error::Corruption(e.to_string()))?;
        if header.uuid != uuid {
            return Err(Error::InvalidArgument(format!(
                "journal belongs to {}, store is {}",
                header.uuid, uuid
            )));
        }
        if header.block_size != config.block_size || header.capacity != config.capacity {
            return Err(Error::InvalidArgument(
                "journal geometry does not match configuration".to_string(),
            ));
        }

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true);
        #[cfg(target_os = "linux")]
        if config.io_mode.is_direct() {
            use std::os::unix::fs::OpenOptionsExt;
            open_opts.custom_flags(libc::O_DIRECT);
        }
        let file = open_opts.open(path)?;

        let shared = Arc::new(JournalShared {
            file,
            uuid,
            block_size: config.block_size,
            capacity: config.capacity,
            direct: config.io_mode.is_direct(),
            state: Mutex::new(RingState {
                start_pos: header.start_pos,
                write_pos: header.start_pos,
                start_seq: header.start_seq,
                next_seq: header.start_seq,
                committed_seq: header.start_seq.saturating_sub(1),
                entries: VecDeque::new(),
                holds: BTreeMap::new(),
                next_hold: 1,
                failed: None,
                stopping: false,
            }),
            space_cv: Condvar::new(),
            commit_cv: Condvar::new(),
        });

        let replayed = Self::scan(&shared, &reader, &header, applied_watermark)?;

        let (submit_tx, submit_rx) = unbounded::<WriteRequest>();
        let mut journal = Self {
            shared: Arc::clone(&shared),
            reader,
            submit_tx,
            writer: Mutex::new(None),
            aio_workers: Mutex::new(Vec::new()),
            completer: Mutex::new(None),
        };
        journal.start_workers(submit_rx, config)?;
        Ok((journal, replayed))
    }

    fn scan(
        shared: &Arc<JournalShared>,
        reader: &File,
        header: &JournalHeader,
        watermark: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut pos = header.start_pos;
        let mut expected_seq = header.start_seq;
        let mut entries = VecDeque::new();
        let mut last_seq = None;

        loop {
            if pos - header.start_pos >= header.capacity {
                break;
            }
            let mut head_buf = [0u8; EntryHeader::SIZE];
            if shared.read_ring(reader, pos, &mut head_buf).is_err() {
                break;
            }
            let entry = match EntryHeader::decode(&head_buf, shared.phys(pos), &shared.uuid) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            if entry.seq != expected_seq {
                break;
            }
            let span = entry_span(entry.len as usize, header.block_size);
            if span > header.capacity || pos - header.start_pos + span > header.capacity {
                break;
            }

            let mut body = vec![0u8; EntryHeader::SIZE + entry.len as usize + EntryHeader::TRAILER_SIZE];
            if shared.read_ring(reader, pos, &mut body).is_err() {
                break;
            }
            let payload = &body[EntryHeader::SIZE..EntryHeader::SIZE + entry.len as usize];
            let trailer = &body[EntryHeader::SIZE + entry.len as usize..];
            let torn = entry.check_trailer(trailer).is_err() || entry.check_payload(payload).is_err();
            if torn {
                debug!(seq = entry.seq, "journal scan stopped at torn entry");
                break;
            }

            entries.push_back(EntryMeta {
                seq: entry.seq,
                pos,
                span,
                len: entry.len,
            });
            if entry.seq > watermark {
                out.push((entry.seq, payload.to_vec()));
            }
            pos += span;
            last_seq = Some(entry.seq);
            expected_seq = entry.seq + 1;
        }

        let mut state = shared.state.lock();
        state.write_pos = pos;
        state.entries = entries;
        if let Some(last) = last_seq {
            state.next_seq = last + 1;
            state.committed_seq = last;
        }
        Ok(out)
    }

    fn start_workers(&mut self, submit_rx: Receiver<WriteRequest>, config: &JournalConfig) -> Result<()> {
        if config.io_mode == JournalIoMode::DirectAio {
            let (aio_tx, aio_rx) = unbounded::<PendingWrite>();
            let (done_tx, done_rx) = unbounded::<(u64, std::io::Result<()>, CommitCallback)>();

            let mut workers = Vec::new();
            for _ in 0..config.aio_workers.max(1) {
                let shared = Arc::clone(&self.shared);
                let aio_rx = aio_rx.clone();
                let done_tx = done_tx.clone();
                workers.push(thread::spawn(move || aio_worker_loop(shared, aio_rx, done_tx)));
            }
            drop(done_tx);
            *self.aio_workers.lock() = workers;

            let shared = Arc::clone(&self.shared);
            *self.completer.lock() = Some(thread::spawn(move || completer_loop(shared, done_rx)));

            let shared = Arc::clone(&self.shared);
            *self.writer.lock() = Some(thread::spawn(move || {
                dispatch_loop(shared, submit_rx, aio_tx);
            }));
        } else {
            let shared = Arc::clone(&self.shared);
            let max_batch = config.max_entries_per_event.max(1);
            *self.writer.lock() =
                Some(thread::spawn(move || writer_loop(shared, submit_rx, max_batch)));
        }
        Ok(())
    }

    /// Append a payload; returns the assigned sequence number.
    ///
    /// Blocks while the ring lacks space for the entry. `completion` runs
    /// exactly once, after the entry is durable or the journal fails.
    pub fn submit_entry(&self, payload: Vec<u8>, completion: CommitCallback) -> Result<u64> {
        let span = entry_span(payload.len(), self.shared.block_size);
        if span > self.shared.capacity {
            return Err(Error::InvalidArgument(format!(
                "entry of {} bytes exceeds journal capacity",
                payload.len()
            )));
        }

        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = &state.failed {
                return Err(Error::Fatal(msg.clone()));
            }
            if state.stopping {
                return Err(Error::Fatal("journal is shutting down".to_string()));
            }
            if state.write_pos + span - state.start_pos <= self.shared.capacity {
                break;
            }
            self.shared.space_cv.wait(&mut state);
        }

        let seq = state.next_seq;
        let pos = state.write_pos;
        state.next_seq += 1;
        state.write_pos += span;
        state.entries.push_back(EntryMeta {
            seq,
            pos,
            span,
            len: payload.len() as u32,
        });

        let mut bytes = vec![0u8; span as usize];
        let entry = EntryHeader::new(seq, &payload, self.shared.phys(pos), &self.shared.uuid);
        entry
            .encode(&mut bytes[..EntryHeader::SIZE])
            .map_err(|e| Error::Corruption(e.to_string()))?;
        bytes[EntryHeader::SIZE..EntryHeader::SIZE + payload.len()].copy_from_slice(&payload);
        bytes[EntryHeader::SIZE + payload.len()..EntryHeader::SIZE + payload.len() + EntryHeader::TRAILER_SIZE]
            .copy_from_slice(&entry.trailer());

        // Send while holding the lock so the writer sees sequence order.
        self.submit_tx
            .send(WriteRequest::Entry(PendingWrite {
                seq,
                pos,
                bytes,
                completion,
            }))
            .map_err(|_| Error::Fatal("journal writer is gone".to_string()))?;
        Ok(seq)
    }

    /// Block until every entry up to `seq` is durable.
    pub fn wait_for_commit(&self, seq: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.committed_seq >= seq {
                return Ok(());
            }
            if let Some(msg) = &state.failed {
                return Err(Error::Fatal(msg.clone()));
            }
            self.shared.commit_cv.wait(&mut state);
        }
    }

    /// The durable frontier: every entry up to this seq is on disk.
    pub fn committed_seq(&self) -> u64 {
        self.shared.state.lock().committed_seq
    }

    /// Next sequence number that will be assigned.
    pub fn next_seq(&self) -> u64 {
        self.shared.state.lock().next_seq
    }

    /// Drop entries with `seq <= thru`, bounded by the durable frontier and
    /// any live trim holds, then persist the new ring start.
    pub fn committed_thru(&self, thru: u64) -> Result<()> {
        let (start_pos, start_seq) = {
            let mut state = self.shared.state.lock();
            let mut effective = thru.min(state.committed_seq);
            if let Some(min_hold) = state.holds.values().min() {
                effective = effective.min(min_hold.saturating_sub(1));
            }
            let mut advanced = false;
            while let Some(front) = state.entries.front() {
                if front.seq > effective {
                    break;
                }
                let (pos_end, next_seq) = (front.pos + front.span, front.seq + 1);
                state.entries.pop_front();
                state.start_pos = pos_end;
                state.start_seq = next_seq;
                advanced = true;
            }
            if !advanced {
                return Ok(());
            }
            (state.start_pos, state.start_seq)
        };

        self.shared
            .persist_header(start_pos, start_seq)
            .map_err(Error::from_io)?;
        self.shared.space_cv.notify_all();
        Ok(())
    }

    /// Prevent trimming of entries at or after `seq` until the returned
    /// hold is dropped. Denied with [`Error::Busy`] if already trimmed.
    pub fn hold_trim(&self, seq: u64) -> Result<TrimHold> {
        let mut state = self.shared.state.lock();
        if seq < state.start_seq {
            return Err(Error::Busy(format!(
                "entries up to {} are already trimmed",
                state.start_seq.saturating_sub(1)
            )));
        }
        let id = state.next_hold;
        state.next_hold += 1;
        state.holds.insert(id, seq);
        Ok(TrimHold {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stream retained entries starting at `from`.
    ///
    /// When `from` precedes the first retained entry, one synthetic
    /// [`StreamItem::Skipped`] marker leads the stream.
    pub fn stream_entries(&self, from: u64) -> Result<Vec<StreamItem>> {
        let state = self.shared.state.lock();
        let mut out = Vec::new();
        let first_retained = state.entries.front().map(|e| e.seq).unwrap_or(state.start_seq);
        if from < first_retained {
            out.push(StreamItem::Skipped {
                from,
                to: first_retained,
            });
        }
        for meta in state.entries.iter().filter(|e| e.seq >= from) {
            let mut body =
                vec![0u8; EntryHeader::SIZE + meta.len as usize + EntryHeader::TRAILER_SIZE];
            self.shared
                .read_ring(&self.reader, meta.pos, &mut body)
                .map_err(Error::from_io)?;
            let payload = body[EntryHeader::SIZE..EntryHeader::SIZE + meta.len as usize].to_vec();
            out.push(StreamItem::Entry {
                seq: meta.seq,
                payload,
            });
        }
        Ok(out)
    }

    /// Summaries of the retained entries, oldest first.
    pub fn dump(&self) -> Vec<(u64, u32)> {
        let state = self.shared.state.lock();
        state.entries.iter().map(|e| (e.seq, e.len)).collect()
    }

    /// Ring occupancy and frontier counters.
    pub fn stats(&self) -> JournalStats {
        let state = self.shared.state.lock();
        JournalStats {
            start_seq: state.start_seq,
            next_seq: state.next_seq,
            committed_seq: state.committed_seq,
            used_bytes: state.write_pos - state.start_pos,
            capacity: self.shared.capacity,
        }
    }

    /// Stop the writer machinery. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.space_cv.notify_all();
        self.shared.commit_cv.notify_all();
        let _ = self.submit_tx.send(WriteRequest::Shutdown);
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
        for worker in self.aio_workers.lock().drain(..) {
            let _ = worker.join();
        }
        if let Some(completer) = self.completer.lock().take() {
            let _ = completer.join();
        }
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Guard preventing journal trim past a subscriber's position.
#[derive(Debug)]
pub struct TrimHold {
    id: u64,
    shared: Arc<JournalShared>,
}

impl TrimHold {
    /// Move the hold forward to `seq`; moving backwards is rejected.
    pub fn renew(&self, seq: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.holds.get_mut(&self.id) {
            Some(held) if *held <= seq => {
                *held = seq;
                Ok(())
            }
            Some(held) => Err(Error::InvalidArgument(format!(
                "hold at {held} cannot move back to {seq}"
            ))),
            None => Err(Error::NotFound("hold was released".to_string())),
        }
    }
}

impl Drop for TrimHold {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.holds.remove(&self.id);
    }
}

fn complete_batch(batch: Vec<PendingWrite>, error: Option<&str>) {
    for pending in batch {
        let result = match error {
            None => Ok(()),
            Some(msg) => Err(Error::Fatal(msg.to_string())),
        };
        (pending.completion)(result);
    }
}

fn writer_loop(shared: Arc<JournalShared>, rx: Receiver<WriteRequest>, max_batch: usize) {
    while let Ok(req) = rx.recv() {
        let first = match req {
            WriteRequest::Entry(entry) => entry,
            WriteRequest::Shutdown => break,
        };
        let mut batch = vec![first];
        let mut shutdown = false;
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(WriteRequest::Entry(entry)) => batch.push(entry),
                Ok(WriteRequest::Shutdown) => {
                    shutdown = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let mut failure = None;
        for pending in &batch {
            if let Err(err) = shared.write_ring(pending.pos, &pending.bytes) {
                failure = Some(format!("journal write failed: {err}"));
                break;
            }
        }
        if failure.is_none() {
            if let Err(err) = shared.file.sync_data() {
                failure = Some(format!("journal sync failed: {err}"));
            }
        }

        match failure {
            None => {
                if let Some(last) = batch.last() {
                    let mut state = shared.state.lock();
                    state.committed_seq = state.committed_seq.max(last.seq);
                }
                shared.commit_cv.notify_all();
                complete_batch(batch, None);
            }
            Some(msg) => {
                shared.fail(msg.clone());
                complete_batch(batch, Some(&msg));
            }
        }
        if shutdown {
            break;
        }
    }
}

fn dispatch_loop(
    shared: Arc<JournalShared>,
    rx: Receiver<WriteRequest>,
    aio_tx: Sender<PendingWrite>,
) {
    let _ = shared;
    while let Ok(req) = rx.recv() {
        match req {
            WriteRequest::Entry(entry) => {
                if aio_tx.send(entry).is_err() {
                    break;
                }
            }
            WriteRequest::Shutdown => break,
        }
    }
}

fn aio_worker_loop(
    shared: Arc<JournalShared>,
    rx: Receiver<PendingWrite>,
    done_tx: Sender<(u64, std::io::Result<()>, CommitCallback)>,
) {
    while let Ok(pending) = rx.recv() {
        let result = shared
            .write_ring(pending.pos, &pending.bytes)
            .and_then(|_| shared.file.sync_data());
        if done_tx.send((pending.seq, result, pending.completion)).is_err() {
            break;
        }
    }
}

fn completer_loop(
    shared: Arc<JournalShared>,
    rx: Receiver<(u64, std::io::Result<()>, CommitCallback)>,
) {
    let mut pending: BTreeMap<u64, CommitCallback> = BTreeMap::new();
    while let Ok((seq, result, completion)) = rx.recv() {
        match result {
            Err(err) => {
                let msg = format!("journal async write of seq {seq} failed: {err}");
                shared.fail(msg.clone());
                completion(Err(Error::Fatal(msg.clone())));
                for (_, stuck) in std::mem::take(&mut pending) {
                    stuck(Err(Error::Fatal(msg.clone())));
                }
            }
            Ok(()) => {
                let failed_msg = shared.state.lock().failed.clone();
                if let Some(msg) = failed_msg {
                    completion(Err(Error::Fatal(msg)));
                    continue;
                }
                pending.insert(seq, completion);
                let mut runnable = Vec::new();
                {
                    let mut state = shared.state.lock();
                    while let Some(entry) = pending.first_entry() {
                        if *entry.key() == state.committed_seq + 1 {
                            state.committed_seq += 1;
                            runnable.push(entry.remove());
                        } else {
                            break;
                        }
                    }
                }
                if !runnable.is_empty() {
                    shared.commit_cv.notify_all();
                    for callback in runnable {
                        callback(Ok(()));
                    }
                }
            }
        }
    }
    // Anything still pending at teardown is aborted, never dropped silently.
    for (_, stuck) in pending {
        stuck(Err(Error::Fatal("journal closed".to_string())));
    }
}
