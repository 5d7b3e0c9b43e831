//! # Buffer-Copy KVS Façade
//!
//! [`KvStore`] translates between caller-owned byte buffers and the
//! tree's tagged global pointers. It owns the heap, the epoch manager,
//! the tree, and a handle-indexed registry of live range iterators.
//!
//! ## Write Path
//!
//! `put` allocates a value block (`{size, bytes}`), writes and persists
//! it while unreachable, installs its address through the tree (a single
//! persisted word store), and defer-frees the displaced block under the
//! operation's scope. A crash between persist and install leaks a block;
//! it never exposes a torn value.
//!
//! ## Read Path
//!
//! Reads follow the fabric protocol: invalidate the value header, check
//! the caller's capacity (reporting the required length and `FAILED` when
//! short — a recoverable, `trace!`-logged signal), then invalidate and
//! copy the payload.
//!
//! ## Scan Handles
//!
//! `scan` positions an iterator and parks it in a mutex-guarded registry,
//! returning an integer handle; `get_next` resolves the handle and
//! advances. Handles are process-local. `end_scan` releases a handle
//! early; dropping the store releases the rest. Each call opens its own
//! operation scope, so a parked handle costs nothing and never delays
//! reclamation.
//!
//! Scan and get_next reject a declared caller value-buffer capacity above
//! `MAX_VAL_LEN` before performing any read; callers declare honest
//! capacities.
//!
//! ## Cached-Pointer Overloads
//!
//! The `*_cached` / `*_at` overloads forward to the tree's cached-pointer
//! variants and add the buffer protocol on top. [`KvStore::refresh`]
//! implements the reader-side staleness check: equal tags mean the cached
//! payload is still current and no copy happens. These calls never free a
//! block except the displaced one on a successful replacement.
//!
//! ## Modes
//!
//! A store opened in multi-value mode exposes `insert` / `remove` /
//! `remove_value` instead of `put` / `del`; mismatched calls fail with
//! `FAILED_PRECONDITION` from the tree.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{HeapConfig, MAX_KEY_LEN, MAX_VAL_LEN, OPEN_BOUNDARY};
use crate::epoch::{EpochGuard, EpochManager};
use crate::fam::{Gptr, TagGptr};
use crate::heap::Heap;
use crate::status::{Error, Result};
use crate::tree::{Mode, PutPolicy, RadixTree, TreeIter};

/// Outcome of [`KvStore::find_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOrCreate {
    /// The key already had a value; `len` bytes of it were copied out and
    /// the caller's candidate value was released.
    Found(usize),
    /// The candidate value was installed.
    Inserted,
}

/// Outcome of [`KvStore::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The cached snapshot is still current; nothing was copied.
    Unchanged,
    /// The slot changed (or a copy was forced). `len` is `None` when the
    /// key currently has no value.
    Updated { ptr: TagGptr, len: Option<usize> },
}

/// Result of a cached-pointer point lookup.
///
/// `key_node` is invalid when the key has never existed; `val` may be
/// invalid while `key_node` is valid (key known, currently no value).
#[derive(Debug, Clone, Copy)]
pub struct CachedGet {
    pub key_node: Gptr,
    pub val: TagGptr,
    pub len: Option<usize>,
}

/// Handle naming a live iterator in the store's registry.
pub type IterHandle = usize;

/// Buffer-copy key-value store over a persistent radix tree.
#[derive(Debug)]
pub struct KvStore {
    heap: Arc<Heap>,
    emgr: Arc<EpochManager>,
    tree: RadixTree,
    iters: Mutex<Vec<Option<TreeIter>>>,
}

impl KvStore {
    /// Open (or create) the heap named by `config` and the tree rooted in
    /// its superblock slot. A fresh tree's root is persisted there, so a
    /// later `open` against the same file resumes the same index.
    pub fn open(config: &HeapConfig, mode: Mode) -> Result<Self> {
        let emgr = Arc::new(EpochManager::new());
        let heap = Heap::open_or_create(config, Arc::clone(&emgr)).map_err(Error::not_initialized)?;

        let existing = heap.root();
        let tree = RadixTree::open_or_create(&heap, existing, mode)?;
        if !existing.is_valid() {
            heap.set_root(tree.root()).map_err(Error::internal)?;
        }

        Ok(Self {
            heap,
            emgr,
            tree,
            iters: Mutex::new(Vec::new()),
        })
    }

    /// Attach a store to an already-open heap, e.g. one index among many
    /// sharing a region. The superblock root slot is left alone; the
    /// caller owns root bookkeeping. A null `root` creates a fresh tree.
    pub fn attach(heap: &Arc<Heap>, root: Gptr, mode: Mode) -> Result<Self> {
        let tree = RadixTree::open_or_create(heap, root, mode)?;

        Ok(Self {
            heap: Arc::clone(heap),
            emgr: Arc::clone(heap.epoch_manager()),
            tree,
            iters: Mutex::new(Vec::new()),
        })
    }

    /// The tree root; persist it to reopen this index later.
    pub fn root(&self) -> Gptr {
        self.tree.root()
    }

    /// Sweep the heap's deferred frees.
    pub fn maintenance(&self) -> usize {
        self.heap.offline_reclaim()
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    // ==================================================================
    // Point operations (single-value mode)
    // ==================================================================

    /// Store `val` under `key`, replacing any previous value.
    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();
        let val_gptr = self.write_valbuf(&scope, val)?;

        let old = self.tree.put(&scope, key, val_gptr, PutPolicy::Update)?;
        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }
        Ok(())
    }

    /// Copy `key`'s value into `buf`, returning the copied length.
    ///
    /// `NOT_FOUND` when absent; `FAILED` with a `needed()` hint when
    /// `buf` is too small.
    pub fn get(&self, key: &[u8], buf: &mut [u8]) -> Result<usize> {
        self.check_key(key)?;

        let scope = self.emgr.pin();
        let val = self.tree.get(&scope, key);
        if !val.is_valid() {
            return Err(Error::not_found());
        }

        self.read_valbuf(val.gptr(), buf)
    }

    /// Replace the value of an existing key. `NOT_FOUND` when absent.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();
        if !self.tree.get(&scope, key).is_valid() {
            return Err(Error::not_found());
        }

        let val_gptr = self.write_valbuf(&scope, val)?;
        let old = self.tree.put(&scope, key, val_gptr, PutPolicy::Update)?;
        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }
        Ok(())
    }

    /// Remove `key`, releasing its value block. `NOT_FOUND` when absent.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;

        let scope = self.emgr.pin();
        let old = self.tree.destroy(&scope, key)?;
        if !old.is_valid() {
            return Err(Error::not_found());
        }

        self.heap.free(&scope, old.gptr());
        Ok(())
    }

    /// Atomically fetch `key`'s value or install `val` when absent.
    ///
    /// On a hit the incumbent is copied into `out` and the candidate is
    /// released; on a miss the candidate is installed.
    pub fn find_or_create(&self, key: &[u8], val: &[u8], out: &mut [u8]) -> Result<FindOrCreate> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();
        let candidate = self.write_valbuf(&scope, val)?;

        let incumbent = self
            .tree
            .put(&scope, key, candidate, PutPolicy::FindOrCreate)?;
        if incumbent.is_valid() {
            trace!("find_or_create: returning the found entry");
            self.heap.free(&scope, candidate);

            let len = self.read_valbuf(incumbent.gptr(), out)?;
            return Ok(FindOrCreate::Found(len));
        }

        Ok(FindOrCreate::Inserted)
    }

    // ==================================================================
    // Multi-value operations
    // ==================================================================

    /// Add `val` to `key`'s chain (most recent first).
    pub fn insert(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();

        // Chain element block: {next, size, bytes}. The link word is
        // written by the tree at publish time.
        let elem = self
            .heap
            .alloc(&scope, 16 + val.len())
            .ok_or_else(|| Error::resource_exhausted("heap exhausted allocating value"))?;
        self.heap
            .region()
            .write_u64(elem.offset() + crate::tree::ELEM_VBUF, val.len() as u64);
        self.heap
            .region()
            .copy_in(elem.offset() + crate::tree::ELEM_VBUF + 8, val);
        self.heap
            .region()
            .persist(elem.offset(), 16 + val.len() as u64)
            .map_err(Error::internal)?;

        self.tree.insert_value(&scope, key, elem)
    }

    /// Remove `key`'s whole chain. `NOT_FOUND` when absent.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;

        let scope = self.emgr.pin();
        let elems = self.tree.remove_all(&scope, key)?;
        if elems.is_empty() {
            return Err(Error::not_found());
        }

        for elem in elems {
            self.heap.free(&scope, elem);
        }
        Ok(())
    }

    /// Remove the first chain element equal to `val`. `NOT_FOUND` when no
    /// element matches.
    pub fn remove_value(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();
        match self.tree.remove_value(&scope, key, val)? {
            Some(elem) => {
                self.heap.free(&scope, elem);
                Ok(())
            }
            None => Err(Error::not_found()),
        }
    }

    // ==================================================================
    // Range scans
    // ==================================================================

    /// Position a new iterator at the smallest key in range, copy that
    /// key and its value out, and return `(handle, key_len, val_len)`.
    ///
    /// `END_OF_DATA` when the range is empty (no handle is allocated).
    /// The boundary sentinel [`OPEN_BOUNDARY`] with `inclusive = false`
    /// opens the corresponding end of the range.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        key_buf: &mut [u8],
        val_buf: &mut [u8],
        begin: &[u8],
        begin_inclusive: bool,
        end: &[u8],
        end_inclusive: bool,
    ) -> Result<(IterHandle, usize, usize)> {
        self.check_key(begin)?;
        self.check_key(end)?;
        self.check_scan_bufs(key_buf, val_buf)?;

        let begin = scan_bound(begin, begin_inclusive);
        let end = scan_bound(end, end_inclusive);

        let scope = self.emgr.pin();
        let (iter, key, val) = self.tree.scan(&scope, begin, end)?;

        let key_len = copy_key(&key, key_buf)?;
        let val_len = self.read_valbuf(val.gptr(), val_buf)?;

        let handle = self.register_iter(iter);
        Ok((handle, key_len, val_len))
    }

    /// Advance the iterator named by `handle`, copying the next key and
    /// value out. `END_OF_DATA` at range end, permanently.
    pub fn get_next(
        &self,
        handle: IterHandle,
        key_buf: &mut [u8],
        val_buf: &mut [u8],
    ) -> Result<(usize, usize)> {
        self.check_scan_bufs(key_buf, val_buf)?;

        let scope = self.emgr.pin();
        let mut iter = self.take_iter(handle)?;
        let advanced = self.tree.get_next(&scope, &mut iter);
        self.put_back_iter(handle, iter);

        let (key, val) = advanced?;
        let key_len = copy_key(&key, key_buf)?;
        let val_len = self.read_valbuf(val.gptr(), val_buf)?;

        Ok((key_len, val_len))
    }

    /// Release an iterator handle early.
    pub fn end_scan(&self, handle: IterHandle) -> Result<()> {
        let mut iters = self.iters.lock();
        match iters.get_mut(handle) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::not_valid(format!("bad iterator handle {handle}"))),
        }
    }

    // ==================================================================
    // Cached-pointer overloads
    // ==================================================================

    /// `put` that also returns the terminal key-node address and the new
    /// value snapshot for caller-side caching.
    pub fn put_cached(&self, key: &[u8], val: &[u8]) -> Result<(Gptr, TagGptr)> {
        self.check_key(key)?;
        self.check_val(val)?;

        let scope = self.emgr.pin();
        let val_gptr = self.write_valbuf(&scope, val)?;

        let (key_node, new, old) = self.tree.put_cached(&scope, key, val_gptr)?;
        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }
        Ok((key_node, new))
    }

    /// Replace the value through a cached key-node address, skipping the
    /// descent. Returns the new value snapshot.
    pub fn put_at(&self, key_node: Gptr, val: &[u8]) -> Result<TagGptr> {
        self.check_val(val)?;

        let scope = self.emgr.pin();
        let val_gptr = self.write_valbuf(&scope, val)?;

        let (new, old) = self.tree.put_at(&scope, key_node, val_gptr)?;
        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }
        Ok(new)
    }

    /// Point lookup returning the cacheable addresses alongside the
    /// copied value.
    ///
    /// An absent key is not an error here: the result carries invalid
    /// pointers and no length.
    pub fn get_cached(&self, key: &[u8], buf: &mut [u8]) -> Result<CachedGet> {
        self.check_key(key)?;

        let scope = self.emgr.pin();
        let (key_node, val) = self.tree.get_cached(&scope, key);

        if !key_node.is_valid() {
            return Ok(CachedGet {
                key_node,
                val,
                len: None,
            });
        }

        let len = if val.is_valid() {
            Some(self.read_valbuf(val.gptr(), buf)?)
        } else {
            None
        };

        Ok(CachedGet { key_node, val, len })
    }

    /// Revalidate a cached value snapshot through its key node.
    ///
    /// Equal tags mean the cached payload is current and nothing is
    /// copied (unless `force` requests a copy regardless).
    pub fn refresh(
        &self,
        key_node: Gptr,
        cached: TagGptr,
        buf: &mut [u8],
        force: bool,
    ) -> Result<Refresh> {
        let scope = self.emgr.pin();
        let current = self.tree.get_at(&scope, key_node);

        if current == cached && !force {
            return Ok(Refresh::Unchanged);
        }

        let len = if current.is_valid() {
            Some(self.read_valbuf(current.gptr(), buf)?)
        } else {
            None
        };

        Ok(Refresh::Updated { ptr: current, len })
    }

    /// `del` variant that keeps the key node alive for cached callers.
    /// Returns the key-node address and the cleared slot snapshot.
    pub fn del_cached(&self, key: &[u8]) -> Result<(Gptr, TagGptr)> {
        self.check_key(key)?;

        let scope = self.emgr.pin();
        let (key_node, old) = self.tree.destroy_cached(&scope, key)?;

        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }

        let cleared = if key_node.is_valid() {
            self.tree.get_at(&scope, key_node)
        } else {
            TagGptr::NULL
        };
        Ok((key_node, cleared))
    }

    /// Clear the value through a cached key-node address. Returns the
    /// cleared slot snapshot.
    pub fn del_at(&self, key_node: Gptr) -> Result<TagGptr> {
        let scope = self.emgr.pin();
        let old = self.tree.destroy_at(&scope, key_node)?;

        if old.is_valid() {
            self.heap.free(&scope, old.gptr());
        }
        Ok(self.tree.get_at(&scope, key_node))
    }

    // ==================================================================
    // Value blocks
    // ==================================================================

    /// Allocate, fill, and persist a `{size, bytes}` value block.
    fn write_valbuf(&self, scope: &EpochGuard, val: &[u8]) -> Result<Gptr> {
        let gptr = self
            .heap
            .alloc(scope, 8 + val.len())
            .ok_or_else(|| Error::resource_exhausted("heap exhausted allocating value"))?;

        let region = self.heap.region();
        region.write_u64(gptr.offset(), val.len() as u64);
        region.copy_in(gptr.offset() + 8, val);
        region
            .persist(gptr.offset(), 8 + val.len() as u64)
            .map_err(Error::internal)?;

        Ok(gptr)
    }

    /// Copy a value block's payload into `buf` per the fabric read
    /// protocol: invalidate header, capacity check, invalidate payload,
    /// copy.
    fn read_valbuf(&self, vbuf: Gptr, buf: &mut [u8]) -> Result<usize> {
        let region = self.heap.region();

        region.invalidate(vbuf.offset(), 8);
        let size = region.read_u64(vbuf.offset()) as usize;

        if buf.len() < size {
            trace!(have = buf.len(), needed = size, "value buffer too small");
            return Err(Error::buffer_too_small(size, buf.len()));
        }

        region.invalidate(vbuf.offset() + 8, size as u64);
        region.copy_out(vbuf.offset() + 8, &mut buf[..size]);
        Ok(size)
    }

    // ==================================================================
    // Iterator registry
    // ==================================================================

    fn register_iter(&self, iter: TreeIter) -> IterHandle {
        let mut iters = self.iters.lock();

        for (handle, slot) in iters.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(iter);
                return handle;
            }
        }
        iters.push(Some(iter));
        iters.len() - 1
    }

    fn take_iter(&self, handle: IterHandle) -> Result<TreeIter> {
        let mut iters = self.iters.lock();
        iters
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or_else(|| Error::not_valid(format!("bad iterator handle {handle}")))
    }

    fn put_back_iter(&self, handle: IterHandle, iter: TreeIter) {
        let mut iters = self.iters.lock();
        if let Some(slot) = iters.get_mut(handle) {
            *slot = Some(iter);
        }
    }

    // ==================================================================
    // Argument checks
    // ==================================================================

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::invalid_argument(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    fn check_val(&self, val: &[u8]) -> Result<()> {
        if val.len() > MAX_VAL_LEN {
            return Err(Error::invalid_argument(format!(
                "value length {} exceeds maximum {}",
                val.len(),
                MAX_VAL_LEN
            )));
        }
        Ok(())
    }

    /// Declared scan buffer capacities are bounded like the data they
    /// receive.
    fn check_scan_bufs(&self, key_buf: &[u8], val_buf: &[u8]) -> Result<()> {
        if key_buf.len() > MAX_KEY_LEN {
            return Err(Error::invalid_argument(format!(
                "key buffer capacity {} exceeds maximum {}",
                key_buf.len(),
                MAX_KEY_LEN
            )));
        }
        if val_buf.len() > MAX_VAL_LEN {
            return Err(Error::invalid_argument(format!(
                "value buffer capacity {} exceeds maximum {}",
                val_buf.len(),
                MAX_VAL_LEN
            )));
        }
        Ok(())
    }
}

/// Interpret a scan endpoint: the reserved sentinel with
/// `inclusive = false` opens the range end.
fn scan_bound(key: &[u8], inclusive: bool) -> Bound<&[u8]> {
    if !inclusive && key == OPEN_BOUNDARY {
        Bound::Unbounded
    } else if inclusive {
        Bound::Included(key)
    } else {
        Bound::Excluded(key)
    }
}

fn copy_key(key: &[u8], buf: &mut [u8]) -> Result<usize> {
    if buf.len() < key.len() {
        trace!(have = buf.len(), needed = key.len(), "key buffer too small");
        return Err(Error::buffer_too_small(key.len(), buf.len()));
    }
    buf[..key.len()].copy_from_slice(key);
    Ok(key.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use tempfile::tempdir;

    fn open_store(mode: Mode) -> (tempfile::TempDir, KvStore) {
        let dir = tempdir().unwrap();
        let cfg = HeapConfig::new(dir.path()).capacity(8 << 20);
        let store = KvStore::open(&cfg, mode).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_del_round_trip() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 64];

        store.put(b"name", b"value-bytes").unwrap();
        let len = store.get(b"name", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"value-bytes");

        store.del(b"name").unwrap();
        assert_eq!(store.get(b"name", &mut buf).unwrap_err().code(), StatusCode::NotFound);
        assert_eq!(store.del(b"name").unwrap_err().code(), StatusCode::NotFound);
    }

    #[test]
    fn put_replaces_previous_value() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 64];

        store.put(b"k", b"first").unwrap();
        store.put(b"k", b"second-value").unwrap();

        let len = store.get(b"k", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"second-value");
    }

    #[test]
    fn get_reports_required_length_when_buffer_is_short() {
        let (_dir, store) = open_store(Mode::Single);

        store.put(b"k", b"twelve bytes").unwrap();

        let mut tiny = [0u8; 4];
        let err = store.get(b"k", &mut tiny).unwrap_err();

        assert_eq!(err.code(), StatusCode::Failed);
        assert_eq!(err.needed(), Some(12));

        // Resize and retry: the documented recovery.
        let mut buf = vec![0u8; err.needed().unwrap()];
        let len = store.get(b"k", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"twelve bytes");
    }

    #[test]
    fn bounds_are_enforced() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 8];

        let long_key = vec![1u8; MAX_KEY_LEN + 1];
        let long_val = vec![1u8; MAX_VAL_LEN + 1];

        assert_eq!(
            store.put(&long_key, b"v").unwrap_err().code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(
            store.put(b"k", &long_val).unwrap_err().code(),
            StatusCode::InvalidArgument
        );
        assert_eq!(
            store.get(&long_key, &mut buf).unwrap_err().code(),
            StatusCode::InvalidArgument
        );

        // Maximum sizes succeed.
        let max_key = vec![2u8; MAX_KEY_LEN];
        let max_val = vec![3u8; MAX_VAL_LEN];
        store.put(&max_key, &max_val).unwrap();

        let mut big = vec![0u8; MAX_VAL_LEN];
        assert_eq!(store.get(&max_key, &mut big).unwrap(), MAX_VAL_LEN);
    }

    #[test]
    fn find_or_create_is_tri_valued() {
        let (_dir, store) = open_store(Mode::Single);
        let mut out = [0u8; 64];

        let first = store.find_or_create(b"k", b"mine", &mut out).unwrap();
        assert_eq!(first, FindOrCreate::Inserted);

        let second = store.find_or_create(b"k", b"other", &mut out).unwrap();
        assert_eq!(second, FindOrCreate::Found(4));
        assert_eq!(&out[..4], b"mine");

        let err = store
            .find_or_create(&vec![0u8; MAX_KEY_LEN + 1], b"v", &mut out)
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn scan_with_open_boundaries_walks_everything() {
        let (_dir, store) = open_store(Mode::Single);
        for key in [b"b".as_slice(), b"a", b"c"] {
            store.put(key, key).unwrap();
        }

        let mut kbuf = [0u8; 64];
        let mut vbuf = [0u8; 64];

        let (handle, klen, _) = store
            .scan(&mut kbuf, &mut vbuf, OPEN_BOUNDARY, false, OPEN_BOUNDARY, false)
            .unwrap();
        assert_eq!(&kbuf[..klen], b"a");

        let (klen, _) = store.get_next(handle, &mut kbuf, &mut vbuf).unwrap();
        assert_eq!(&kbuf[..klen], b"b");

        let (klen, vlen) = store.get_next(handle, &mut kbuf, &mut vbuf).unwrap();
        assert_eq!(&kbuf[..klen], b"c");
        assert_eq!(&vbuf[..vlen], b"c");

        let err = store.get_next(handle, &mut kbuf, &mut vbuf).unwrap_err();
        assert!(err.is_end_of_data());
    }

    #[test]
    fn scan_rejects_oversized_declared_capacity() {
        let (_dir, store) = open_store(Mode::Single);
        store.put(b"k", b"v").unwrap();

        let mut kbuf = [0u8; 16];
        let mut huge = vec![0u8; MAX_VAL_LEN + 1];

        let err = store
            .scan(&mut kbuf, &mut huge, OPEN_BOUNDARY, false, OPEN_BOUNDARY, false)
            .unwrap_err();

        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn empty_range_scan_allocates_no_handle() {
        let (_dir, store) = open_store(Mode::Single);
        let mut kbuf = [0u8; 16];
        let mut vbuf = [0u8; 16];

        let err = store
            .scan(&mut kbuf, &mut vbuf, OPEN_BOUNDARY, false, OPEN_BOUNDARY, false)
            .unwrap_err();
        assert!(err.is_end_of_data());

        assert_eq!(
            store.get_next(0, &mut kbuf, &mut vbuf).unwrap_err().code(),
            StatusCode::NotValid
        );
    }

    #[test]
    fn end_scan_releases_the_handle() {
        let (_dir, store) = open_store(Mode::Single);
        store.put(b"k", b"v").unwrap();

        let mut kbuf = [0u8; 16];
        let mut vbuf = [0u8; 16];
        let (handle, _, _) = store
            .scan(&mut kbuf, &mut vbuf, OPEN_BOUNDARY, false, OPEN_BOUNDARY, false)
            .unwrap();

        store.end_scan(handle).unwrap();

        assert_eq!(
            store.get_next(handle, &mut kbuf, &mut vbuf).unwrap_err().code(),
            StatusCode::NotValid
        );
        assert_eq!(store.end_scan(handle).unwrap_err().code(), StatusCode::NotValid);
    }

    #[test]
    fn cached_get_reports_absent_keys_without_error() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 16];

        let miss = store.get_cached(b"nope", &mut buf).unwrap();
        assert!(!miss.key_node.is_valid());
        assert!(!miss.val.is_valid());
        assert_eq!(miss.len, None);
    }

    #[test]
    fn refresh_skips_copy_while_tag_is_fresh() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 64];

        let (key_node, cached) = store.put_cached(b"hot", b"one").unwrap();

        assert_eq!(
            store.refresh(key_node, cached, &mut buf, false).unwrap(),
            Refresh::Unchanged
        );

        let newer = store.put_at(key_node, b"two").unwrap();
        match store.refresh(key_node, cached, &mut buf, false).unwrap() {
            Refresh::Updated { ptr, len } => {
                assert_eq!(ptr, newer);
                assert_eq!(&buf[..len.unwrap()], b"two");
            }
            other => panic!("stale tag SHOULD force a copy, got {other:?}"),
        }
    }

    #[test]
    fn del_cached_clears_but_keeps_the_key_node() {
        let (_dir, store) = open_store(Mode::Single);
        let mut buf = [0u8; 64];

        let (key_node, first) = store.put_cached(b"hot", b"one").unwrap();
        let (same, cleared) = store.del_cached(b"hot").unwrap();

        assert_eq!(same, key_node);
        assert!(!cleared.is_valid());
        assert_eq!(cleared.tag(), first.tag() + 1);

        match store.refresh(key_node, first, &mut buf, false).unwrap() {
            Refresh::Updated { ptr, len } => {
                assert_eq!(ptr, cleared);
                assert_eq!(len, None);
            }
            other => panic!("cleared slot SHOULD report Updated, got {other:?}"),
        }
    }

    #[test]
    fn multi_store_round_trips_chains() {
        let (_dir, store) = open_store(Mode::Multi);
        let mut kbuf = [0u8; 16];
        let mut vbuf = [0u8; 64];

        for val in [b"v0".as_slice(), b"v1", b"v2"] {
            store.insert(b"k", val).unwrap();
        }

        let (handle, _, vlen) = store
            .scan(&mut kbuf, &mut vbuf, b"k", true, b"k", true)
            .unwrap();
        assert_eq!(&vbuf[..vlen], b"v0", "oldest element SHOULD come first");

        let (_, vlen) = store.get_next(handle, &mut kbuf, &mut vbuf).unwrap();
        assert_eq!(&vbuf[..vlen], b"v2");

        let (_, vlen) = store.get_next(handle, &mut kbuf, &mut vbuf).unwrap();
        assert_eq!(&vbuf[..vlen], b"v1");

        store.remove_value(b"k", b"v1").unwrap();
        assert_eq!(
            store.remove_value(b"k", b"v1").unwrap_err().code(),
            StatusCode::NotFound
        );

        store.remove(b"k").unwrap();
        assert_eq!(store.remove(b"k").unwrap_err().code(), StatusCode::NotFound);
    }
}
