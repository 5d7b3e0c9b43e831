//! # Fabric-Attached Memory Contract
//!
//! This module implements `FamRegion`, the byte-addressable persistent
//! region every other component allocates into, plus the global-pointer
//! types ([`Gptr`], [`TagGptr`]) used to name locations inside it.
//!
//! ## Memory Model
//!
//! The region behaves like fabric-attached memory: a flat, persistent,
//! byte-addressable space shared by cooperating processes. Three primitives
//! form the contract, and they are treated as mandatory barriers rather
//! than hints:
//!
//! - [`FamRegion::persist`]: make a written range durable and globally
//!   visible. Payloads are persisted *before* the pointer that publishes
//!   them is stored, and the pointer store is persisted before the mutating
//!   call returns.
//! - [`FamRegion::invalidate`]: discard any locally cached view so the next
//!   read observes the latest globally visible bytes. Every read of a
//!   pointed-to payload invalidates the payload range first.
//! - [`FamRegion::copy_out`] / [`FamRegion::copy_in`]: copies that respect
//!   the visibility rules on both sides.
//!
//! The backing store here is a shared memory-mapped file. CPU caches over
//! such a mapping are coherent, so `invalidate` reduces to a compiler
//! fence; the call sites mark exactly where a non-coherent fabric would
//! need a cache-line invalidate, and `persist` maps to an `msync` of the
//! range.
//!
//! ## Why a Raw Mapping
//!
//! A `page(&self)` / `page_mut(&mut self)` storage API leans on the borrow
//! checker to forbid aliasing, which is exactly wrong for this structure:
//! readers and writers *must* alias the region concurrently, and the safety
//! story is the radix tree's publication protocol (atomic word-sized slot
//! stores, persist-before-link, epoch-deferred free), not exclusive
//! borrows. `MmapRaw` gives a stable base pointer and leaves aliasing
//! discipline to the callers, which access shared words through atomics and
//! immutable-after-publish payloads through plain copies.
//!
//! ## Error Handling
//!
//! Region lifecycle operations return `eyre::Result` with file-path
//! context; the index layers above translate failures into status codes at
//! their boundary.

mod gptr;

pub use gptr::{Gptr, TagGptr};

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapRaw;

/// Minimum region size: room for the heap superblock plus one block.
pub const MIN_REGION_SIZE: u64 = 4096;

/// A byte-addressable persistent memory region backed by a shared file
/// mapping.
///
/// All offsets are region-relative; offset 0 is reserved so that a zero
/// [`Gptr`] can serve as null.
#[derive(Debug)]
pub struct FamRegion {
    map: MmapRaw,
    len: u64,
    path: PathBuf,
}

// SAFETY: the raw mapping is a stable base pointer for the lifetime of the
// region. Concurrent access goes through `AtomicU64` words for shared slots
// and through copies of payload ranges that are immutable between publish
// and deferred free; both disciplines are enforced by the callers (tree,
// heap), not by this type.
unsafe impl Send for FamRegion {}
unsafe impl Sync for FamRegion {}

impl FamRegion {
    /// Create a new region file of `capacity` bytes and map it.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            capacity >= MIN_REGION_SIZE,
            "region capacity {} below minimum {}",
            capacity,
            MIN_REGION_SIZE
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create region file '{}'", path.display()))?;

        file.set_len(capacity)
            .wrap_err_with(|| format!("failed to size region to {} bytes", capacity))?;

        let map = MmapRaw::map_raw(&file)
            .wrap_err_with(|| format!("failed to map region '{}'", path.display()))?;

        Ok(Self {
            map,
            len: capacity,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing region file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open region file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            len >= MIN_REGION_SIZE,
            "region file '{}' is {} bytes, below minimum {}",
            path.display(),
            len,
            MIN_REGION_SIZE
        );

        let map = MmapRaw::map_raw(&file)
            .wrap_err_with(|| format!("failed to map region '{}'", path.display()))?;

        Ok(Self {
            map,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translate a region offset to a local pointer (global-to-local).
    ///
    /// The returned pointer is valid for the lifetime of the region. Bounds
    /// are debug-checked; callers pass offsets produced by the heap
    /// allocator, which stay inside the mapping by construction.
    #[inline]
    pub fn ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.len, "offset {offset} outside region");

        // SAFETY: offset < len, and the mapping is len bytes long.
        unsafe { self.map.as_mut_ptr().add(offset as usize) }
    }

    /// Borrow the word at `offset` as an atomic.
    ///
    /// # Safety
    ///
    /// `offset` must be 8-aligned and `offset + 8` must lie inside the
    /// region. All concurrent accesses to this word must also be atomic.
    #[inline]
    pub unsafe fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0, "unaligned atomic access at {offset}");
        debug_assert!(offset + 8 <= self.len);

        AtomicU64::from_ptr(self.ptr(offset).cast::<u64>())
    }

    /// Copy bytes out of the region into a caller buffer.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() as u64 <= self.len);

        // SAFETY: range is inside the mapping and `dst` is exclusively
        // ours. The source range is immutable between publish and deferred
        // free, which the caller's epoch guard pins.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy bytes from a caller buffer into the region.
    ///
    /// The write is not durable until [`persist`](Self::persist) covers the
    /// range.
    pub fn copy_in(&self, offset: u64, src: &[u8]) {
        debug_assert!(offset + src.len() as u64 <= self.len);

        // SAFETY: range is inside the mapping; the destination block is
        // owned by the caller (freshly allocated, not yet published).
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr(offset), src.len());
        }
    }

    /// Read one u64 stored little-endian at `offset`.
    pub fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.copy_out(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Write one u64 little-endian at `offset`.
    pub fn write_u64(&self, offset: u64, value: u64) {
        self.copy_in(offset, &value.to_le_bytes());
    }

    /// Make `[offset, offset + len)` durable and globally visible.
    pub fn persist(&self, offset: u64, len: u64) -> Result<()> {
        debug_assert!(offset + len <= self.len);

        self.map
            .flush_range(offset as usize, len as usize)
            .wrap_err_with(|| {
                format!(
                    "failed to persist {} bytes at {:#x} in '{}'",
                    len,
                    offset,
                    self.path.display()
                )
            })
    }

    /// Discard locally cached bytes of `[offset, offset + len)` so the next
    /// read observes the latest globally visible value.
    ///
    /// The file mapping is cache-coherent, so this is a compiler fence; on
    /// a non-coherent fabric this is where the cache-line invalidate goes.
    #[inline]
    pub fn invalidate(&self, _offset: u64, _len: u64) {
        compiler_fence(Ordering::Acquire);
    }

    /// Flush the whole region.
    pub fn sync(&self) -> Result<()> {
        self.map
            .flush()
            .wrap_err_with(|| format!("failed to sync region '{}'", self.path.display()))
    }
}
