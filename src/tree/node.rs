//! In-fabric node layout and access.
//!
//! A node occupies one heap block and is shared between lock-free readers
//! and the (serialized) writer, so every field that readers consult is an
//! atomic. The layout:
//!
//! ```text
//! Offset  Size   Field
//! ------  -----  ----------------------------------------------
//! 0       8      value_slot   packed TagGptr (single-value mode)
//! 8       8      chain_head   packed TagGptr (multi-value mode)
//! 16      2      child_count  writer-maintained fan-out
//! 18      1      prefix_len
//! 19      5      (pad)
//! 24      24     prefix       compressed edge bytes
//! 48      2048   children     256 × packed Gptr, byte-indexed
//! ```
//!
//! `value_slot`, `chain_head` and each child pointer update with a single
//! atomic word store, so readers never observe torn pointers. The prefix
//! bytes are only rewritten during restructures, which the tree brackets
//! with its structure seqlock; prefix loads and stores are relaxed
//! per-byte atomics and the seqlock supplies the ordering.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};

use crate::config::MAX_PREFIX;
use crate::fam::{FamRegion, Gptr, TagGptr};

/// Fan-out of every node.
pub(crate) const FANOUT: usize = 256;

#[repr(C, align(8))]
pub(crate) struct Node {
    value_slot: AtomicU64,
    chain_head: AtomicU64,
    child_count: AtomicU16,
    prefix_len: AtomicU8,
    _pad: [u8; 5],
    prefix: [AtomicU8; MAX_PREFIX],
    children: [AtomicU64; FANOUT],
}

pub(crate) const NODE_SIZE: usize = std::mem::size_of::<Node>();

const VALUE_OFF: u64 = offset_of!(Node, value_slot) as u64;
const CHAIN_OFF: u64 = offset_of!(Node, chain_head) as u64;
const META_OFF: u64 = offset_of!(Node, child_count) as u64;
const CHILDREN_OFF: u64 = offset_of!(Node, children) as u64;

/// A node address paired with its mapped view.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    region: &'a FamRegion,
    gptr: Gptr,
    node: &'a Node,
}

impl<'a> NodeRef<'a> {
    /// Map the node at `gptr`.
    ///
    /// # Safety
    ///
    /// `gptr` must name a node block that is live, or unlinked but still
    /// inside the caller's operation scope (deferred free pins it).
    pub unsafe fn at(region: &'a FamRegion, gptr: Gptr) -> Self {
        debug_assert!(gptr.is_valid());
        debug_assert!(gptr.offset() % 8 == 0);

        // SAFETY: per the function contract the block is alive for the
        // scope's duration, properly aligned, and NODE_SIZE bytes long.
        let node = unsafe { &*(region.ptr(gptr.offset()).cast::<Node>()) };

        Self { region, gptr, node }
    }

    /// Zero and initialize a freshly allocated node block, then persist
    /// it. The node is not yet linked anywhere, so plain writes suffice.
    pub fn init(region: &FamRegion, gptr: Gptr, prefix: &[u8]) -> eyre::Result<()> {
        debug_assert!(prefix.len() <= MAX_PREFIX);

        let zeros = [0u8; NODE_SIZE];
        region.copy_in(gptr.offset(), &zeros);

        let mut meta = [0u8; 3];
        meta[2] = prefix.len() as u8;
        region.copy_in(gptr.offset() + META_OFF, &meta);
        region.copy_in(gptr.offset() + META_OFF + 8, prefix);

        region.persist(gptr.offset(), NODE_SIZE as u64)
    }

    pub fn gptr(&self) -> Gptr {
        self.gptr
    }

    // ------------------------------------------------------------------
    // Prefix
    // ------------------------------------------------------------------

    /// Copy the compressed prefix into `buf`, returning its length.
    pub fn prefix_into(&self, buf: &mut [u8; MAX_PREFIX]) -> usize {
        let len = self.node.prefix_len.load(Ordering::Relaxed) as usize;
        let len = len.min(MAX_PREFIX);

        for (i, slot) in self.node.prefix.iter().take(len).enumerate() {
            buf[i] = slot.load(Ordering::Relaxed);
        }
        len
    }

    /// Rewrite the compressed prefix.
    ///
    /// Only the writer calls this, inside a structure-seqlock window; the
    /// seqlock orders the byte stores for any concurrent reader.
    pub fn set_prefix(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_PREFIX);

        for (i, b) in bytes.iter().enumerate() {
            self.node.prefix[i].store(*b, Ordering::Relaxed);
        }
        self.node
            .prefix_len
            .store(bytes.len() as u8, Ordering::Relaxed);
    }

    pub fn persist_prefix(&self) -> eyre::Result<()> {
        self.region
            .persist(self.gptr.offset() + META_OFF, 8 + MAX_PREFIX as u64)
    }

    // ------------------------------------------------------------------
    // Value slot and chain head
    // ------------------------------------------------------------------

    pub fn value(&self) -> TagGptr {
        TagGptr::from_raw(self.node.value_slot.load(Ordering::Acquire))
    }

    /// Store `new` into the value slot under the next generation tag and
    /// persist the word. Returns the displaced snapshot.
    pub fn swap_value(&self, new: Gptr) -> eyre::Result<(TagGptr, TagGptr)> {
        let old = self.value();
        let next = old.next_generation(new);

        self.node.value_slot.store(next.raw(), Ordering::Release);
        self.region.persist(self.gptr.offset() + VALUE_OFF, 8)?;

        Ok((old, next))
    }

    pub fn chain(&self) -> TagGptr {
        TagGptr::from_raw(self.node.chain_head.load(Ordering::Acquire))
    }

    /// Store `new` as the chain head under the next generation tag and
    /// persist the word. Returns the displaced snapshot.
    pub fn swap_chain(&self, new: Gptr) -> eyre::Result<(TagGptr, TagGptr)> {
        let old = self.chain();
        let next = old.next_generation(new);

        self.node.chain_head.store(next.raw(), Ordering::Release);
        self.region.persist(self.gptr.offset() + CHAIN_OFF, 8)?;

        Ok((old, next))
    }

    /// True when this node terminates a key (holds a value or a chain).
    pub fn occupied(&self) -> bool {
        self.value().is_valid() || self.chain().is_valid()
    }

    // ------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------

    pub fn child(&self, byte: u8) -> Gptr {
        Gptr::new(self.node.children[byte as usize].load(Ordering::Acquire))
    }

    /// Publish a child pointer and persist the word. The child must be
    /// fully persisted before it is linked here.
    pub fn set_child(&self, byte: u8, child: Gptr) -> eyre::Result<()> {
        self.node.children[byte as usize].store(child.offset(), Ordering::Release);
        self.region
            .persist(self.gptr.offset() + CHILDREN_OFF + 8 * byte as u64, 8)
    }

    pub fn child_count(&self) -> u16 {
        self.node.child_count.load(Ordering::Relaxed)
    }

    pub fn add_child_count(&self, delta: i16) {
        let cur = self.node.child_count.load(Ordering::Relaxed);
        self.node
            .child_count
            .store(cur.wrapping_add_signed(delta), Ordering::Relaxed);
    }

    /// Smallest child at or after `from`, in byte order.
    pub fn first_child_from(&self, from: usize) -> Option<(u8, Gptr)> {
        for byte in from..FANOUT {
            let child = self.child(byte as u8);
            if child.is_valid() {
                return Some((byte as u8, child));
            }
        }
        None
    }

    /// The single child, when exactly one is linked.
    pub fn only_child(&self) -> Option<(u8, Gptr)> {
        let mut found = None;

        for byte in 0..FANOUT {
            let child = self.child(byte as u8);
            if child.is_valid() {
                if found.is_some() {
                    return None;
                }
                found = Some((byte as u8, child));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fam::FamRegion;
    use tempfile::tempdir;

    fn region() -> (tempfile::TempDir, FamRegion) {
        let dir = tempdir().unwrap();
        let r = FamRegion::create(dir.path().join("region"), 1 << 20).unwrap();
        (dir, r)
    }

    #[test]
    fn node_layout_is_stable() {
        assert_eq!(NODE_SIZE, 2096);
        assert_eq!(VALUE_OFF, 0);
        assert_eq!(CHAIN_OFF, 8);
        assert_eq!(META_OFF, 16);
        assert_eq!(CHILDREN_OFF, 48);
    }

    #[test]
    fn init_sets_prefix_and_clears_slots() {
        let (_dir, region) = region();
        let g = Gptr::new(1024);

        NodeRef::init(&region, g, b"compressed").unwrap();

        // SAFETY: just initialized at g.
        let node = unsafe { NodeRef::at(&region, g) };
        let mut buf = [0u8; MAX_PREFIX];
        let len = node.prefix_into(&mut buf);

        assert_eq!(&buf[..len], b"compressed");
        assert!(!node.value().is_valid());
        assert!(!node.chain().is_valid());
        assert_eq!(node.child_count(), 0);
        assert_eq!(node.first_child_from(0), None);
    }

    #[test]
    fn swap_value_bumps_tag_every_store() {
        let (_dir, region) = region();
        let g = Gptr::new(1024);
        NodeRef::init(&region, g, b"").unwrap();

        // SAFETY: just initialized at g.
        let node = unsafe { NodeRef::at(&region, g) };

        let (old, first) = node.swap_value(Gptr::new(4096)).unwrap();
        assert!(!old.is_valid());
        assert_eq!(first.tag(), 1);
        assert_eq!(first.gptr(), Gptr::new(4096));

        let (old, second) = node.swap_value(Gptr::NULL).unwrap();
        assert_eq!(old, first);
        assert_eq!(second.tag(), 2);
        assert!(!second.is_valid());
    }

    #[test]
    fn children_are_byte_ordered() {
        let (_dir, region) = region();
        let g = Gptr::new(1024);
        NodeRef::init(&region, g, b"").unwrap();

        // SAFETY: just initialized at g.
        let node = unsafe { NodeRef::at(&region, g) };
        node.set_child(9, Gptr::new(8192)).unwrap();
        node.set_child(200, Gptr::new(12288)).unwrap();

        assert_eq!(node.first_child_from(0), Some((9, Gptr::new(8192))));
        assert_eq!(node.first_child_from(10), Some((200, Gptr::new(12288))));
        assert_eq!(node.first_child_from(201), None);
        assert_eq!(node.only_child(), None);
    }

    #[test]
    fn only_child_requires_exactly_one() {
        let (_dir, region) = region();
        let g = Gptr::new(1024);
        NodeRef::init(&region, g, b"").unwrap();

        // SAFETY: just initialized at g.
        let node = unsafe { NodeRef::at(&region, g) };

        node.set_child(42, Gptr::new(8192)).unwrap();
        assert_eq!(node.only_child(), Some((42, Gptr::new(8192))));

        node.set_child(43, Gptr::new(12288)).unwrap();
        assert_eq!(node.only_child(), None);
    }
}
