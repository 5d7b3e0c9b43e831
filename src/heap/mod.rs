//! # Persistent Block Heap
//!
//! This module implements the block allocator over a [`FamRegion`]: stable
//! global addresses, size-classed reuse, and the deferred-free protocol
//! that makes concurrent reclamation safe.
//!
//! ## Region Layout
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  -----------------------------------------------
//! 0       64     Superblock (magic, version, capacity, cursor, root)
//! 64      ...    Blocks, each: [len header: 8 bytes][payload]
//! ```
//!
//! A [`Gptr`] returned by [`Heap::alloc`] points at the payload; the block
//! header just ahead of it records the block's size class so `free` does
//! not need a size argument.
//!
//! ## Allocation Strategy
//!
//! Power-of-two size classes. Allocation pops the class freelist when a
//! reclaimed block is available, otherwise bumps the cursor. The cursor is
//! persisted in the superblock on every advance, so a reopened heap
//! continues allocating past all previously handed-out blocks.
//!
//! ## Deferred Free
//!
//! `free` never reuses a block immediately. The block is stamped with a
//! retire epoch from the shared [`EpochManager`] and parked on a pending
//! queue; [`Heap::offline_reclaim`] moves entries to the freelists once
//! every operation scope active at stamp time has ended. Until then, a
//! reader holding the old address inside its scope can still dereference
//! the payload safely.
//!
//! Pending entries live in process memory: a crash loses them and leaks
//! the blocks. Offline space recovery is outside this layer.
//!
//! ## Root Slot
//!
//! The superblock carries one well-known pointer slot, the tree root. It
//! is the only address a surrounding program needs to reopen an index.
//!
//! ## Thread Safety
//!
//! The allocator state and the pending queue are independently mutex
//! guarded; `alloc`/`free`/`offline_reclaim` may be called from any
//! thread.

mod superblock;

pub use superblock::{Superblock, HEAP_MAGIC, HEAP_VERSION, SUPERBLOCK_SIZE};

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use zerocopy::IntoBytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::HeapConfig;
use crate::epoch::{EpochGuard, EpochManager};
use crate::fam::{FamRegion, Gptr};

/// Bytes of bookkeeping ahead of every payload.
const BLOCK_HEADER: u64 = 8;

/// Smallest block size class.
const MIN_BLOCK: u64 = 32;

/// First allocatable offset.
const HEAP_BASE: u64 = SUPERBLOCK_SIZE as u64;

#[derive(Debug)]
struct AllocState {
    cursor: u64,
    capacity: u64,
    freelists: HashMap<u64, Vec<Gptr>>,
}

#[derive(Debug, Clone, Copy)]
struct PendingFree {
    gptr: Gptr,
    class: u64,
    retired: u64,
}

/// Block heap over a persistent region.
#[derive(Debug)]
pub struct Heap {
    region: Arc<FamRegion>,
    emgr: Arc<EpochManager>,
    alloc: Mutex<AllocState>,
    pending: Mutex<Vec<PendingFree>>,
}

impl Heap {
    /// Initialize a fresh heap over `region`.
    pub fn create(region: Arc<FamRegion>, emgr: Arc<EpochManager>) -> Result<Arc<Self>> {
        let capacity = region.len();
        let sb = Superblock::new(capacity, HEAP_BASE);

        region.copy_in(0, sb.as_bytes());
        region
            .persist(0, SUPERBLOCK_SIZE as u64)
            .wrap_err("failed to persist new heap superblock")?;

        debug!(capacity, path = %region.path().display(), "created heap");

        Ok(Arc::new(Self {
            region,
            emgr,
            alloc: Mutex::new(AllocState {
                cursor: HEAP_BASE,
                capacity,
                freelists: HashMap::new(),
            }),
            pending: Mutex::new(Vec::new()),
        }))
    }

    /// Open an existing heap, verifying its superblock.
    pub fn open(region: Arc<FamRegion>, emgr: Arc<EpochManager>) -> Result<Arc<Self>> {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        region.invalidate(0, SUPERBLOCK_SIZE as u64);
        region.copy_out(0, &mut bytes);

        let sb = Superblock::parse(&bytes)
            .wrap_err_with(|| format!("invalid heap at '{}'", region.path().display()))?;

        ensure!(
            sb.capacity() == region.len(),
            "heap capacity {} does not match region size {}",
            sb.capacity(),
            region.len()
        );

        debug!(
            cursor = sb.cursor(),
            root = %sb.root(),
            path = %region.path().display(),
            "opened heap"
        );

        Ok(Arc::new(Self {
            alloc: Mutex::new(AllocState {
                cursor: sb.cursor(),
                capacity: sb.capacity(),
                freelists: HashMap::new(),
            }),
            region,
            emgr,
            pending: Mutex::new(Vec::new()),
        }))
    }

    /// Open the heap named by `config`, creating it if the file does not
    /// exist yet.
    pub fn open_or_create(config: &HeapConfig, emgr: Arc<EpochManager>) -> Result<Arc<Self>> {
        let path = config.heap_path();

        if Path::new(&path).exists() {
            let region = Arc::new(FamRegion::open(&path)?);
            Self::open(region, emgr)
        } else {
            let region = Arc::new(FamRegion::create(&path, config.heap_capacity())?);
            Self::create(region, emgr)
        }
    }

    pub fn region(&self) -> &Arc<FamRegion> {
        &self.region
    }

    pub fn epoch_manager(&self) -> &Arc<EpochManager> {
        &self.emgr
    }

    /// Allocate a block of at least `nbytes`, returning its payload
    /// address, or `None` when the heap is exhausted.
    pub fn alloc(&self, _scope: &EpochGuard, nbytes: usize) -> Option<Gptr> {
        let class = size_class(nbytes as u64);
        let mut state = self.alloc.lock();

        if let Some(list) = state.freelists.get_mut(&class) {
            if let Some(gptr) = list.pop() {
                return Some(gptr);
            }
        }

        let start = state.cursor;
        if start + class > state.capacity {
            return None;
        }
        state.cursor = start + class;

        // The header and the advanced cursor are persisted before the
        // payload address escapes, so a reopened heap never re-hands-out
        // this block.
        self.region.write_u64(start, class);
        let _ = self.region.persist(start, BLOCK_HEADER);
        self.persist_cursor(state.cursor);

        Some(Gptr::new(start + BLOCK_HEADER))
    }

    /// Schedule a block for reuse once all scopes active now have ended.
    ///
    /// Never fails for a pointer produced by [`alloc`](Self::alloc).
    pub fn free(&self, _scope: &EpochGuard, gptr: Gptr) {
        debug_assert!(gptr.is_valid());

        let start = gptr.offset() - BLOCK_HEADER;
        self.region.invalidate(start, BLOCK_HEADER);
        let class = self.region.read_u64(start);

        let retired = self.emgr.retire_epoch();
        self.pending.lock().push(PendingFree {
            gptr,
            class,
            retired,
        });
    }

    /// Sweep the pending queue, returning quiesced blocks to the
    /// freelists. Returns how many blocks became reusable.
    pub fn offline_reclaim(&self) -> usize {
        let min_active = self.emgr.min_active();
        let quiesced = |retired: u64| min_active.map_or(true, |m| m > retired);

        let mut pending = self.pending.lock();
        let before = pending.len();
        if before == 0 {
            return 0;
        }

        let mut state = self.alloc.lock();
        pending.retain(|entry| {
            if quiesced(entry.retired) {
                state
                    .freelists
                    .entry(entry.class)
                    .or_default()
                    .push(entry.gptr);
                false
            } else {
                true
            }
        });

        let reclaimed = before - pending.len();
        if reclaimed > 0 {
            debug!(reclaimed, pending = pending.len(), "heap reclaim sweep");
        }
        reclaimed
    }

    /// Blocks waiting for their grace window to close.
    pub fn pending_free(&self) -> usize {
        self.pending.lock().len()
    }

    /// The persisted tree root slot.
    pub fn root(&self) -> Gptr {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        self.region.invalidate(0, SUPERBLOCK_SIZE as u64);
        self.region.copy_out(0, &mut bytes);

        match Superblock::parse(&bytes) {
            Ok(sb) => sb.root(),
            Err(_) => Gptr::NULL,
        }
    }

    /// Persist a new tree root into the superblock slot.
    pub fn set_root(&self, root: Gptr) -> Result<()> {
        let state = self.alloc.lock();
        self.write_superblock(state.cursor, Some(root))
    }

    /// Flush all region contents.
    pub fn sync(&self) -> Result<()> {
        self.region.sync()
    }

    fn persist_cursor(&self, cursor: u64) {
        let _ = self.write_superblock(cursor, None);
    }

    fn write_superblock(&self, cursor: u64, root: Option<Gptr>) -> Result<()> {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        self.region.copy_out(0, &mut bytes);

        let mut sb = Superblock::parse(&bytes)?;
        sb.set_cursor(cursor);
        if let Some(root) = root {
            sb.set_root(root);
        }
        sb.seal();

        self.region.copy_in(0, sb.as_bytes());
        self.region.persist(0, SUPERBLOCK_SIZE as u64)
    }
}

fn size_class(nbytes: u64) -> u64 {
    (nbytes + BLOCK_HEADER).next_power_of_two().max(MIN_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_heap(capacity: u64) -> (tempfile::TempDir, Arc<Heap>, Arc<EpochManager>) {
        let dir = tempdir().unwrap();
        let emgr = Arc::new(EpochManager::new());
        let region = Arc::new(FamRegion::create(dir.path().join("heap"), capacity).unwrap());
        let heap = Heap::create(region, Arc::clone(&emgr)).unwrap();
        (dir, heap, emgr)
    }

    #[test]
    fn size_classes_are_powers_of_two() {
        assert_eq!(size_class(1), 32);
        assert_eq!(size_class(24), 32);
        assert_eq!(size_class(25), 64);
        assert_eq!(size_class(100), 128);
    }

    #[test]
    fn alloc_returns_distinct_payload_addresses() {
        let (_dir, heap, emgr) = test_heap(1 << 20);
        let scope = emgr.pin();

        let a = heap.alloc(&scope, 100).unwrap();
        let b = heap.alloc(&scope, 100).unwrap();

        assert_ne!(a, b);
        assert!(a.offset() >= HEAP_BASE + BLOCK_HEADER);
    }

    #[test]
    fn alloc_fails_recoverably_on_exhaustion() {
        let (_dir, heap, emgr) = test_heap(4096);
        let scope = emgr.pin();

        // Drain the heap.
        while heap.alloc(&scope, 1024).is_some() {}

        assert!(heap.alloc(&scope, 1024).is_none());
        // Smaller blocks may still fit.
        let _ = heap.alloc(&scope, 16);
    }

    #[test]
    fn freed_block_is_reused_only_after_reclaim() {
        let (_dir, heap, emgr) = test_heap(1 << 20);

        let a = {
            let scope = emgr.pin();
            let a = heap.alloc(&scope, 100).unwrap();
            heap.free(&scope, a);
            a
        };

        assert_eq!(heap.pending_free(), 1);
        assert_eq!(heap.offline_reclaim(), 1);

        let scope = emgr.pin();
        let b = heap.alloc(&scope, 100).unwrap();
        assert_eq!(a, b, "reclaimed block SHOULD be reused for its class");
    }

    #[test]
    fn active_scope_defers_reclaim() {
        let (_dir, heap, emgr) = test_heap(1 << 20);

        let reader = emgr.pin();
        let writer = emgr.pin();
        let a = heap.alloc(&writer, 100).unwrap();
        heap.free(&writer, a);
        drop(writer);

        // The reader scope was active when the block was retired.
        assert_eq!(heap.offline_reclaim(), 0);

        drop(reader);
        assert_eq!(heap.offline_reclaim(), 1);
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap");
        let emgr = Arc::new(EpochManager::new());

        let first = {
            let region = Arc::new(FamRegion::create(&path, 1 << 20).unwrap());
            let heap = Heap::create(region, Arc::clone(&emgr)).unwrap();
            let scope = emgr.pin();
            heap.alloc(&scope, 100).unwrap()
        };

        let region = Arc::new(FamRegion::open(&path).unwrap());
        let heap = Heap::open(region, emgr.clone()).unwrap();
        let scope = emgr.pin();
        let second = heap.alloc(&scope, 100).unwrap();

        assert!(second.offset() > first.offset());
    }

    #[test]
    fn root_slot_round_trips_through_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heap");
        let emgr = Arc::new(EpochManager::new());

        {
            let region = Arc::new(FamRegion::create(&path, 1 << 20).unwrap());
            let heap = Heap::create(region, Arc::clone(&emgr)).unwrap();
            heap.set_root(Gptr::new(0x1000)).unwrap();
        }

        let region = Arc::new(FamRegion::open(&path).unwrap());
        let heap = Heap::open(region, emgr).unwrap();

        assert_eq!(heap.root(), Gptr::new(0x1000));
    }
}
