//! The ordered operation pipeline and the public store facade.
//!
//! Submitters queue transaction batches against a sequencer; the pipeline
//! journals them, applies them to the object store with per-sequencer
//! ordering, and fires the readable and commit callbacks. A sync thread
//! periodically runs the commit cycle and lets the journal trim.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{StoreConfig, TunableCell, Tunables};
use crate::error::{Error, Result};
use crate::journal::{FileJournal, JournalMode};
use crate::kvstore::PrefixIter;
use crate::store::{ObjectStat, ObjectStore};
use crate::transaction::{decode_batch, encode_batch, Transaction};
use crate::types::{CollectionId, ObjectId};

mod sequencer;

pub use sequencer::{Callback, CompletionHandle, Op, OpSequencer, Throttle};

enum WorkItem {
    Run(u64),
    Shutdown,
}

enum FinishItem {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

struct Registry {
    sequencers: HashMap<u64, Arc<OpSequencer>>,
    next_id: u64,
}

struct ApplyTracker {
    frontier: u64,
    done: BTreeSet<u64>,
}

impl ApplyTracker {
    fn note(&mut self, seq: u64) {
        self.done.insert(seq);
        while self.done.remove(&(self.frontier + 1)) {
            self.frontier += 1;
        }
    }
}

struct SyncState {
    requested: bool,
    stopping: bool,
    last_synced: u64,
}

struct PipelineInner {
    store: Arc<ObjectStore>,
    journal: Arc<FileJournal>,
    mode: JournalMode,
    tunables: TunableCell,
    registry: Mutex<Registry>,
    submit_lock: Mutex<()>,
    throttle: Throttle,
    work_tx: Sender<WorkItem>,
    finish_tx: Sender<FinishItem>,
    tracker: Mutex<ApplyTracker>,
    sync_state: Mutex<SyncState>,
    sync_cv: Condvar,
    accepting: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl PipelineInner {
    fn check_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::Acquire) {
            return Ok(());
        }
        let message = self
            .fatal
            .lock()
            .clone()
            .unwrap_or_else(|| "store is shutting down".to_string());
        Err(Error::Fatal(message))
    }

    fn sequencer_by_id(&self, id: u64) -> Option<Arc<OpSequencer>> {
        self.registry.lock().sequencers.get(&id).cloned()
    }

    fn run_on_finisher(&self, callback: Callback, result: Result<()>) {
        let item = FinishItem::Run(Box::new(move || callback(result)));
        if let Err(returned) = self.finish_tx.send(item) {
            // Finisher already gone (late shutdown); the completion still
            // must fire.
            if let FinishItem::Run(run) = returned.0 {
                run();
            }
        }
    }

    fn maybe_fire_commit(&self, op: &Arc<Op>) {
        let ready = op.durable.load(Ordering::Acquire)
            && (self.mode != JournalMode::Parallel || op.applied.load(Ordering::Acquire));
        if !ready || op.commit_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = op.on_commit.lock().take() {
            self.run_on_finisher(callback, Ok(()));
        }
    }

    /// Continuation run by the journal once an entry is durable.
    fn journaled_ahead(self: &Arc<Self>, osr: &Arc<OpSequencer>, op: &Arc<Op>, result: Result<()>) {
        if let Err(err) = result {
            self.fail(format!("journal commit failed: {err}"));
            return;
        }
        op.durable.store(true, Ordering::Release);
        osr.dequeue_journal(op.op_seq);
        self.maybe_fire_commit(op);
        if self.mode == JournalMode::Writeahead {
            let _ = self.work_tx.send(WorkItem::Run(osr.id));
        }
    }

    fn note_applied(&self, seq: u64) {
        self.tracker.lock().note(seq);
    }

    fn applied_frontier(&self) -> u64 {
        self.tracker.lock().frontier
    }

    /// Apply everything currently runnable on one sequencer.
    fn drain_sequencer(&self, osr: &Arc<OpSequencer>) {
        let _apply = osr.apply_lock.lock();
        loop {
            let op = {
                let queues = osr.queues.lock();
                match queues.q.front() {
                    Some(op)
                        if self.mode != JournalMode::Writeahead
                            || op.durable.load(Ordering::Acquire) =>
                    {
                        Arc::clone(op)
                    }
                    _ => break,
                }
            };

            if let Err(err) = self.store.do_transactions(&op.txs, op.op_seq) {
                self.fail(format!("apply of op {} failed: {err}", op.op_seq));
                return;
            }
            let tunables = self.tunables.load();
            let elapsed = op.queued_at.elapsed();
            if elapsed > tunables.apply_warn_threshold {
                warn!(
                    op_seq = op.op_seq,
                    sequencer = %osr.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow op apply"
                );
            }
            op.applied.store(true, Ordering::Release);

            if let Some(callback) = op.on_readable_sync.lock().take() {
                callback(Ok(()));
            }
            osr.pop_applied(op.op_seq);
            if let Some(callback) = op.on_readable.lock().take() {
                self.run_on_finisher(callback, Ok(()));
            }
            self.maybe_fire_commit(&op);
            self.note_applied(op.op_seq);
            self.throttle.release(op.bytes);
        }
    }

    /// Stop intake and abort every queued completion.
    fn fail(&self, message: String) {
        warn!(error = %message, "pipeline entering failed state");
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(message.clone());
            }
        }
        self.accepting.store(false, Ordering::Release);

        let sequencers: Vec<Arc<OpSequencer>> = {
            let registry = self.registry.lock();
            registry.sequencers.values().cloned().collect()
        };
        for osr in sequencers {
            let drained: Vec<Arc<Op>> = {
                let mut queues = osr.queues.lock();
                queues.jq.clear();
                queues.q.drain(..).collect()
            };
            for op in drained {
                op.abort(&message);
                self.throttle.release(op.bytes);
            }
            osr.cv.notify_all();
        }
        self.sync_cv.notify_all();
    }

    fn remove_op(&self, osr: &OpSequencer, op_seq: u64) -> Option<Arc<Op>> {
        let mut queues = osr.queues.lock();
        if let Some(at) = queues.jq.iter().position(|s| *s == op_seq) {
            queues.jq.remove(at);
        }
        let at = queues.q.iter().position(|op| op.op_seq == op_seq)?;
        queues.q.remove(at)
    }
}

fn worker_loop(inner: Arc<PipelineInner>, rx: Receiver<WorkItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Run(id) => {
                if let Some(osr) = inner.sequencer_by_id(id) {
                    inner.drain_sequencer(&osr);
                }
            }
            WorkItem::Shutdown => break,
        }
    }
}

fn finisher_loop(rx: Receiver<FinishItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            FinishItem::Run(callback) => callback(),
            FinishItem::Shutdown => break,
        }
    }
}

fn sync_loop(inner: Arc<PipelineInner>) {
    let mut last_cycle = Instant::now();
    loop {
        let tunables = inner.tunables.load();
        let stopping = {
            let mut state = inner.sync_state.lock();
            if !state.stopping && !state.requested {
                inner
                    .sync_cv
                    .wait_for(&mut state, tunables.max_sync_interval);
            }
            state.requested = false;
            state.stopping
        };

        let since = last_cycle.elapsed();
        if !stopping && since < tunables.min_sync_interval {
            thread::sleep(tunables.min_sync_interval - since);
        }

        let target = inner.applied_frontier();
        if target > inner.store.applied_seq() {
            match inner.store.commit_cycle(target) {
                Ok(synced) => {
                    if let Err(err) = inner.journal.committed_thru(synced) {
                        warn!(error = %err, "journal trim failed");
                    }
                    let mut state = inner.sync_state.lock();
                    state.last_synced = synced;
                    inner.sync_cv.notify_all();
                }
                Err(err) => {
                    inner.fail(format!("commit cycle failed: {err}"));
                    return;
                }
            }
        } else {
            let mut state = inner.sync_state.lock();
            state.last_synced = state.last_synced.max(target);
            inner.sync_cv.notify_all();
        }
        last_cycle = Instant::now();
        if stopping {
            return;
        }
    }
}

/// Handle to an ordering domain.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<OpSequencer>,
}

impl Sequencer {
    /// Block until every previously queued op has applied and journaled.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// The submitter-chosen name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// The embedded object store engine: journal, pipeline and object store
/// behind one mount point.
pub struct Store {
    inner: Arc<PipelineInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    finisher: Mutex<Option<thread::JoinHandle<()>>>,
    syncer: Mutex<Option<thread::JoinHandle<()>>>,
    default_sequencer: Sequencer,
    stopped: AtomicBool,
}

impl Store {
    /// Initialize a store directory and its journal.
    pub fn mkfs(
        dir: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
        fsid: Uuid,
        config: &StoreConfig,
    ) -> Result<()> {
        ObjectStore::mkfs(dir, fsid)?;
        FileJournal::create(journal_path, fsid, &config.journal_config())?;
        Ok(())
    }

    /// Mount a store: open, replay the journal, start the pipeline.
    pub fn mount(
        dir: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self> {
        let store = Arc::new(ObjectStore::open(dir, config.clone())?);
        let watermark = store.applied_seq();
        let (journal, replayed) = FileJournal::open(
            journal_path,
            store.fsid(),
            &config.journal_config(),
            watermark,
        )?;

        store.set_replaying(true);
        let mut replay_count = 0u64;
        for (seq, payload) in replayed {
            let txs = decode_batch(&payload)?;
            store.do_transactions(&txs, seq)?;
            replay_count += 1;
        }
        store.set_replaying(false);
        if replay_count > 0 {
            info!(replay_count, "journal replay complete");
        }

        let frontier = journal.next_seq().saturating_sub(1).max(watermark);
        let (work_tx, work_rx) = unbounded();
        let (finish_tx, finish_rx) = unbounded();

        let inner = Arc::new(PipelineInner {
            throttle: Throttle::new(config.queue_max_ops, config.queue_max_bytes),
            tunables: TunableCell::new(config.tunables()),
            mode: config.journal_mode,
            store,
            journal: Arc::new(journal),
            registry: Mutex::new(Registry {
                sequencers: HashMap::new(),
                next_id: 1,
            }),
            submit_lock: Mutex::new(()),
            work_tx,
            finish_tx,
            tracker: Mutex::new(ApplyTracker {
                frontier,
                done: BTreeSet::new(),
            }),
            sync_state: Mutex::new(SyncState {
                requested: false,
                stopping: false,
                last_synced: watermark,
            }),
            sync_cv: Condvar::new(),
            accepting: AtomicBool::new(true),
            fatal: Mutex::new(None),
        });

        let mut workers = Vec::new();
        for _ in 0..config.apply_workers.max(1) {
            let inner_clone = Arc::clone(&inner);
            let rx = work_rx.clone();
            workers.push(thread::spawn(move || worker_loop(inner_clone, rx)));
        }
        let finisher = thread::spawn(move || finisher_loop(finish_rx));
        let inner_clone = Arc::clone(&inner);
        let syncer = thread::spawn(move || sync_loop(inner_clone));

        let store = Self {
            inner,
            workers: Mutex::new(workers),
            finisher: Mutex::new(Some(finisher)),
            syncer: Mutex::new(Some(syncer)),
            default_sequencer: Sequencer {
                inner: Arc::new(OpSequencer::new(0, "default")),
            },
            stopped: AtomicBool::new(false),
        };
        store
            .inner
            .registry
            .lock()
            .sequencers
            .insert(0, Arc::clone(&store.default_sequencer.inner));
        Ok(store)
    }

    /// Create a new ordering domain.
    pub fn create_sequencer(&self, name: impl Into<String>) -> Sequencer {
        let mut registry = self.inner.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        let osr = Arc::new(OpSequencer::new(id, name));
        registry.sequencers.insert(id, Arc::clone(&osr));
        Sequencer { inner: osr }
    }

    /// Queue a batch of transactions on a sequencer.
    ///
    /// `on_readable_sync` fires inline after apply, `on_readable` on the
    /// finisher after apply, `on_commit` once the journal mode's
    /// durability gate is satisfied. Blocks on the in-flight throttle.
    pub fn queue_transactions(
        &self,
        sequencer: &Sequencer,
        txs: Vec<Transaction>,
        on_readable: Option<Callback>,
        on_commit: Option<Callback>,
        on_readable_sync: Option<Callback>,
    ) -> Result<u64> {
        self.inner.check_accepting()?;
        let bytes = txs.iter().map(Transaction::byte_size).sum::<u64>() + 64;
        self.inner.throttle.reserve(bytes);

        let submitted = (|| {
            let payload = encode_batch(&txs);
            let _submit = self.inner.submit_lock.lock();
            self.inner.check_accepting()?;

            let op_seq = self.inner.journal.next_seq();
            let op = Arc::new(Op {
                op_seq,
                txs,
                bytes,
                queued_at: Instant::now(),
                on_readable_sync: Mutex::new(CompletionHandle::from_option(on_readable_sync)),
                on_readable: Mutex::new(CompletionHandle::from_option(on_readable)),
                on_commit: Mutex::new(CompletionHandle::from_option(on_commit)),
                applied: AtomicBool::new(false),
                durable: AtomicBool::new(false),
                commit_fired: AtomicBool::new(false),
            });
            sequencer.inner.enqueue(Arc::clone(&op));

            let inner = Arc::clone(&self.inner);
            let osr = Arc::clone(&sequencer.inner);
            let continuation_op = Arc::clone(&op);
            let result = self.inner.journal.submit_entry(
                payload,
                Box::new(move |result| {
                    inner.journaled_ahead(&osr, &continuation_op, result);
                }),
            );
            match result {
                Ok(assigned) => {
                    debug_assert_eq!(assigned, op_seq);
                    if self.inner.mode != JournalMode::Writeahead {
                        let _ = self.inner.work_tx.send(WorkItem::Run(sequencer.inner.id));
                    }
                    Ok(op_seq)
                }
                Err(err) => {
                    if let Some(op) = self.inner.remove_op(&sequencer.inner, op_seq) {
                        op.abort(&err.to_string());
                    }
                    Err(err)
                }
            }
        })();

        if submitted.is_err() {
            self.inner.throttle.release(bytes);
        }
        submitted
    }

    /// Queue on the built-in sequencer and wait for readable and commit.
    pub fn apply_transactions(&self, txs: Vec<Transaction>) -> Result<u64> {
        let (readable_tx, readable_rx) = crossbeam_channel::bounded(1);
        let (commit_tx, commit_rx) = crossbeam_channel::bounded(1);
        let seq = self.queue_transactions(
            &self.default_sequencer.clone(),
            txs,
            Some(Box::new(move |result| {
                let _ = readable_tx.send(result);
            })),
            Some(Box::new(move |result| {
                let _ = commit_tx.send(result);
            })),
            None,
        )?;
        readable_rx
            .recv()
            .map_err(|_| Error::Fatal("pipeline dropped readable callback".to_string()))??;
        commit_rx
            .recv()
            .map_err(|_| Error::Fatal("pipeline dropped commit callback".to_string()))??;
        Ok(seq)
    }

    /// The built-in sequencer used by [`Store::apply_transactions`].
    pub fn default_sequencer(&self) -> &Sequencer {
        &self.default_sequencer
    }

    /// Request a commit cycle and wait for it to cover everything applied
    /// so far.
    pub fn sync(&self) -> Result<()> {
        let target = self.inner.applied_frontier();
        let mut state = self.inner.sync_state.lock();
        state.requested = true;
        self.inner.sync_cv.notify_all();
        loop {
            if state.last_synced >= target {
                return Ok(());
            }
            if let Some(message) = self.inner.fatal.lock().clone() {
                return Err(Error::Fatal(message));
            }
            self.inner.sync_cv.wait(&mut state);
        }
    }

    /// Flush every sequencer, then run a commit cycle.
    pub fn sync_and_flush(&self) -> Result<()> {
        let sequencers: Vec<Arc<OpSequencer>> = {
            let registry = self.inner.registry.lock();
            registry.sequencers.values().cloned().collect()
        };
        for osr in sequencers {
            osr.flush();
        }
        self.sync()
    }

    /// Stop the pipeline: drain, final commit cycle, close the journal.
    pub fn umount(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.accepting.store(false, Ordering::Release);

        let healthy = self.inner.fatal.lock().is_none();
        if healthy {
            let sequencers: Vec<Arc<OpSequencer>> = {
                let registry = self.inner.registry.lock();
                registry.sequencers.values().cloned().collect()
            };
            for osr in sequencers {
                osr.flush();
            }
        }

        {
            let mut state = self.inner.sync_state.lock();
            state.stopping = true;
        }
        self.inner.sync_cv.notify_all();
        if let Some(syncer) = self.syncer.lock().take() {
            let _ = syncer.join();
        }

        let worker_count = self.workers.lock().len();
        for _ in 0..worker_count {
            let _ = self.inner.work_tx.send(WorkItem::Shutdown);
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        let _ = self.inner.finish_tx.send(FinishItem::Shutdown);
        if let Some(finisher) = self.finisher.lock().take() {
            let _ = finisher.join();
        }

        if healthy {
            let target = self.inner.applied_frontier();
            let synced = self.inner.store.commit_cycle(target)?;
            self.inner.journal.committed_thru(synced)?;
        }
        self.inner.journal.close();
        info!("store unmounted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // read side

    /// Store identity.
    pub fn fsid(&self) -> Uuid {
        self.inner.store.fsid()
    }

    /// Direct access to the object store's read side.
    pub fn object_store(&self) -> &ObjectStore {
        &self.inner.store
    }

    /// Direct access to the journal (streaming, dump, trim holds).
    pub fn journal(&self) -> &FileJournal {
        &self.inner.journal
    }

    /// Whether the object exists.
    pub fn exists(&self, cid: &CollectionId, oid: &ObjectId) -> Result<bool> {
        self.inner.store.exists(cid, oid)
    }

    /// Object metadata.
    pub fn stat(&self, cid: &CollectionId, oid: &ObjectId) -> Result<ObjectStat> {
        self.inner.store.stat(cid, oid)
    }

    /// Read object bytes; `len == 0` reads to the end.
    pub fn read(&self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.inner.store.read(cid, oid, offset, len)
    }

    /// One attribute.
    pub fn getattr(&self, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<Vec<u8>> {
        self.inner.store.getattr(cid, oid, name)
    }

    /// Every attribute.
    pub fn getattrs(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.inner.store.getattrs(cid, oid)
    }

    /// Omap header and keys.
    pub fn omap_get(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        self.inner.store.omap_get(cid, oid)
    }

    /// Omap header blob.
    pub fn omap_get_header(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.inner.store.omap_get_header(cid, oid)
    }

    /// All omap keys.
    pub fn omap_get_keys(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeSet<String>> {
        self.inner.store.omap_get_keys(cid, oid)
    }

    /// Values of the requested omap keys.
    pub fn omap_get_values(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        self.inner.store.omap_get_values(cid, oid, keys)
    }

    /// Which of the requested omap keys exist.
    pub fn omap_check_keys(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeSet<String>> {
        self.inner.store.omap_check_keys(cid, oid, keys)
    }

    /// Live cursor over an object's omap.
    pub fn get_omap_iterator(&self, cid: &CollectionId, oid: &ObjectId) -> Result<PrefixIter<'_>> {
        self.inner.store.get_omap_iterator(cid, oid)
    }

    /// All collections.
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        self.inner.store.list_collections()
    }

    /// Whether the collection exists.
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.inner.store.collection_exists(cid)
    }

    /// Whether the collection is empty.
    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        self.inner.store.collection_empty(cid)
    }

    /// Every object of a collection.
    pub fn collection_list(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        self.inner.store.collection_list(cid)
    }

    /// Page through a collection.
    pub fn collection_list_partial(
        &self,
        cid: &CollectionId,
        start: Option<&ObjectId>,
        min: usize,
        max: usize,
        snap: u64,
    ) -> Result<(Vec<ObjectId>, Option<ObjectId>)> {
        self.inner
            .store
            .collection_list_partial(cid, start, min, max, snap)
    }

    /// Replace the runtime-tunable values.
    pub fn set_tunables(&self, tunables: Tunables) {
        self.inner.tunables.store(tunables);
        self.inner.sync_cv.notify_all();
    }

    /// Current in-flight throttle usage.
    pub fn throttle_usage(&self) -> (u64, u64) {
        self.inner.throttle.in_flight()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "shutdown during drop failed");
            }
        }
    }
}
