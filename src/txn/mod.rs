//! # Multi-Index Transactional Façade
//!
//! [`TransactionManager`] layers naming, access modes, and transaction
//! bookkeeping over a set of [`KvStore`] indexes sharing one persistent
//! heap.
//!
//! ## Model
//!
//! ```text
//!   begin() ───────────► tid (monotonic from 1)
//!       │
//!   create_index(tid, "orders")        one tree per name, shared heap
//!       │
//!   open_index(tid, "orders", mode) ─► IndexHandle
//!       │
//!   insert/update/remove_item          write-mode checked
//!   scan_item / get_next_item          per-handle cursor
//!       │
//!   commit(tid) ──────► releases handles and cursors
//!   abort(tid)  ──────► best-effort: same release, writes may remain
//! ```
//!
//! Writes are applied directly to the shared indexes as they happen;
//! commit releases per-transaction resources and reports success. There
//! is no undo log, so `abort` is best-effort and may leave partial
//! writes behind. Isolation is read-committed at the granularity of
//! individual index operations: every call observes the latest linked
//! value.
//!
//! ## Access Modes
//!
//! A handle opened `ReadOnly` rejects `insert_item` / `update_item` /
//! `remove_item` with `PERMISSION_DENIED`; scans are allowed on any
//! handle. Unknown tids and handles fail with `NOT_VALID`.
//!
//! ## Lifecycle
//!
//! The manager is process-scoped state with an explicit lifecycle:
//! construct with [`TransactionManager::new`] (or install one process-wide
//! via [`TransactionManager::init_global`]), and [`reset`] between test
//! runs — it restores the tid counter to 1 and forgets all named indexes.
//! The name → tree registry lives in process memory; a restarted process
//! re-creates its registrations against the persisted heap.
//!
//! ## Thread Safety
//!
//! The registry and transaction tables sit behind mutexes that are not
//! held across index operations, so concurrent transactions on different
//! threads proceed in parallel and serialize only inside the trees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::epoch::EpochManager;
use crate::fam::Gptr;
use crate::heap::Heap;
use crate::kvs::{IterHandle, KvStore};
use crate::status::{Error, Result, StatusCode};
use crate::tree::Mode;

/// Transaction identifier, monotonically assigned from 1.
pub type Tid = u64;

/// Handle naming an index opened under a transaction.
pub type IndexHandle = u64;

/// Access mode of an opened index handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
struct OpenIndex {
    store: Arc<KvStore>,
    mode: AccessMode,
    cursor: Option<IterHandle>,
}

#[derive(Debug, Default)]
struct TxnState {
    open: HashMap<IndexHandle, OpenIndex>,
}

static GLOBAL: OnceLock<TransactionManager> = OnceLock::new();

/// Named indexes plus per-transaction bookkeeping over one shared heap.
#[derive(Debug)]
pub struct TransactionManager {
    heap: Arc<Heap>,
    indexes: Mutex<HashMap<String, Arc<KvStore>>>,
    txns: Mutex<HashMap<Tid, TxnState>>,
    next_tid: AtomicU64,
    next_handle: AtomicU64,
}

impl TransactionManager {
    /// Open (or create) the shared heap and an empty registry.
    pub fn new(config: &HeapConfig) -> Result<Self> {
        let emgr = Arc::new(EpochManager::new());
        let heap = Heap::open_or_create(config, emgr).map_err(Error::not_initialized)?;

        Ok(Self {
            heap,
            indexes: Mutex::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
            next_tid: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Install the process-wide manager. Later calls return the already
    /// installed instance; the config of the first call wins.
    pub fn init_global(config: &HeapConfig) -> Result<&'static TransactionManager> {
        if let Some(mgr) = GLOBAL.get() {
            return Ok(mgr);
        }
        let mgr = Self::new(config)?;
        Ok(GLOBAL.get_or_init(|| mgr))
    }

    /// The process-wide manager, if one was installed.
    pub fn global() -> Option<&'static TransactionManager> {
        GLOBAL.get()
    }

    /// Forget all transactions and named indexes and restart tids at 1.
    pub fn reset(&self) {
        let mut txns = self.txns.lock();
        for (_, state) in txns.drain() {
            release_cursors(state);
        }
        drop(txns);

        self.indexes.lock().clear();
        self.next_tid.store(1, Ordering::SeqCst);
        self.next_handle.store(1, Ordering::SeqCst);
    }

    // ==================================================================
    // Transaction lifecycle
    // ==================================================================

    /// Start a transaction and return its tid.
    pub fn begin(&self) -> Tid {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        self.txns.lock().insert(tid, TxnState::default());
        tid
    }

    /// Commit: writes are already applied, so this releases the
    /// transaction's handles and cursors. Returns whether the commit took
    /// effect.
    pub fn commit(&self, tid: Tid) -> Result<bool> {
        let state = self
            .txns
            .lock()
            .remove(&tid)
            .ok_or_else(|| Error::not_valid(format!("unknown transaction {tid}")))?;

        release_cursors(state);
        Ok(true)
    }

    /// Best-effort abort: releases resources; writes already applied to
    /// the shared indexes remain.
    pub fn abort(&self, tid: Tid) -> Result<()> {
        let state = self
            .txns
            .lock()
            .remove(&tid)
            .ok_or_else(|| Error::not_valid(format!("unknown transaction {tid}")))?;

        release_cursors(state);
        Ok(())
    }

    // ==================================================================
    // Index naming
    // ==================================================================

    /// Create a fresh single-value index under `name`.
    /// `ALREADY_EXISTS` when the name is taken.
    pub fn create_index(&self, tid: Tid, name: &str) -> Result<()> {
        self.check_tid(tid)?;

        let mut indexes = self.indexes.lock();
        if indexes.contains_key(name) {
            return Err(Error::already_exists(format!("index '{name}' exists")));
        }

        let store = KvStore::attach(&self.heap, Gptr::NULL, Mode::Single)?;
        indexes.insert(name.to_string(), Arc::new(store));
        Ok(())
    }

    /// Open `name` under `tid` with the given access mode.
    pub fn open_index(&self, tid: Tid, name: &str, mode: AccessMode) -> Result<IndexHandle> {
        let store = self
            .indexes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(StatusCode::NotFound, format!("no index '{name}'")))?;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);

        let mut txns = self.txns.lock();
        let state = txns
            .get_mut(&tid)
            .ok_or_else(|| Error::not_valid(format!("unknown transaction {tid}")))?;
        state.open.insert(
            handle,
            OpenIndex {
                store,
                mode,
                cursor: None,
            },
        );

        Ok(handle)
    }

    // ==================================================================
    // Item operations
    // ==================================================================

    pub fn insert_item(&self, handle: IndexHandle, tid: Tid, key: &[u8], val: &[u8]) -> Result<()> {
        let store = self.writable(tid, handle)?;
        store.put(key, val)
    }

    pub fn update_item(&self, handle: IndexHandle, tid: Tid, key: &[u8], val: &[u8]) -> Result<()> {
        let store = self.writable(tid, handle)?;
        store.update(key, val)
    }

    pub fn remove_item(&self, handle: IndexHandle, tid: Tid, key: &[u8]) -> Result<()> {
        let store = self.writable(tid, handle)?;
        store.del(key)
    }

    /// Position the handle's cursor at the smallest key in range and copy
    /// the first hit out. Any previous cursor on this handle is released.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_item(
        &self,
        key_buf: &mut [u8],
        val_buf: &mut [u8],
        handle: IndexHandle,
        tid: Tid,
        begin: &[u8],
        begin_inclusive: bool,
        end: &[u8],
        end_inclusive: bool,
    ) -> Result<(usize, usize)> {
        let (store, previous) = {
            let mut txns = self.txns.lock();
            let open = resolve_mut(&mut txns, tid, handle)?;
            (Arc::clone(&open.store), open.cursor.take())
        };

        if let Some(cursor) = previous {
            let _ = store.end_scan(cursor);
        }

        let (cursor, key_len, val_len) =
            store.scan(key_buf, val_buf, begin, begin_inclusive, end, end_inclusive)?;

        let mut txns = self.txns.lock();
        if let Ok(open) = resolve_mut(&mut txns, tid, handle) {
            open.cursor = Some(cursor);
        } else {
            // The transaction ended while scanning.
            let _ = store.end_scan(cursor);
        }

        Ok((key_len, val_len))
    }

    /// Advance the handle's cursor. `END_OF_DATA` at range end.
    pub fn get_next_item(
        &self,
        handle: IndexHandle,
        tid: Tid,
        key_buf: &mut [u8],
        val_buf: &mut [u8],
    ) -> Result<(usize, usize)> {
        let (store, cursor) = {
            let mut txns = self.txns.lock();
            let open = resolve_mut(&mut txns, tid, handle)?;
            let cursor = open
                .cursor
                .ok_or_else(|| Error::not_valid("no open scan on this handle"))?;
            (Arc::clone(&open.store), cursor)
        };

        store.get_next(cursor, key_buf, val_buf)
    }

    // ==================================================================
    // Lookup helpers
    // ==================================================================

    fn check_tid(&self, tid: Tid) -> Result<()> {
        if self.txns.lock().contains_key(&tid) {
            Ok(())
        } else {
            Err(Error::not_valid(format!("unknown transaction {tid}")))
        }
    }

    fn writable(&self, tid: Tid, handle: IndexHandle) -> Result<Arc<KvStore>> {
        let mut txns = self.txns.lock();
        let open = resolve_mut(&mut txns, tid, handle)?;

        if open.mode != AccessMode::ReadWrite {
            return Err(Error::permission_denied(
                "write operation on a read-only index handle",
            ));
        }
        Ok(Arc::clone(&open.store))
    }
}

fn resolve_mut<'a>(
    txns: &'a mut HashMap<Tid, TxnState>,
    tid: Tid,
    handle: IndexHandle,
) -> Result<&'a mut OpenIndex> {
    txns.get_mut(&tid)
        .ok_or_else(|| Error::not_valid(format!("unknown transaction {tid}")))?
        .open
        .get_mut(&handle)
        .ok_or_else(|| Error::not_valid(format!("bad index handle {handle}")))
}

fn release_cursors(state: TxnState) {
    for (_, open) in state.open {
        if let Some(cursor) = open.cursor {
            let _ = open.store.end_scan(cursor);
        }
    }
}
