//! # Persistent Radix Tree
//!
//! Ordered byte-keyed index over heap blocks: 256-way nodes with path
//! compression, value slots published as tagged global pointers, and an
//! iterator that walks keys in lexicographic order.
//!
//! ## Structure
//!
//! Every node compresses a run of edge bytes into its prefix (up to
//! [`MAX_PREFIX`]); longer compressed runs become chains of nodes and are
//! merged back on delete when the combined prefix fits again. The
//! concatenation of prefixes and edge bytes along a root-to-node path
//! spells that node's key. A node terminates a key when its value slot
//! (single-value mode) or chain head (multi-value mode) is populated.
//!
//! ```text
//!            [root ""]
//!            /        \
//!       a: [pple]   b: [anana]     put("apricot") splits "pple":
//!                                      a: [p] ── p: [le]
//!                                            └── r: [icot]
//! ```
//!
//! ## Mutation Protocol
//!
//! Writers serialize on a tree-wide mutex. Every mutation follows
//! persist-before-link: a new node or subtree is fully written and
//! persisted while unreachable, then published with a single atomic child
//! or slot store, which is itself persisted before the call returns.
//! Displaced blocks go to the heap's deferred-free queue under the
//! caller's operation scope.
//!
//! ## Reader Protocol
//!
//! Readers take no lock. Three mechanisms make that safe:
//!
//! 1. Child pointers and value slots are single atomic words; a reader
//!    sees the pre- or post-state of a store, never a torn pointer.
//! 2. Unlinked blocks are deferred-freed, so a pointer loaded inside an
//!    operation scope stays dereferenceable for the scope's lifetime.
//! 3. Restructures that rewrite a node prefix or splice a node in or out
//!    (splits, merges) run inside a tree-wide even/odd generation window;
//!    a traversal re-validates the generation afterwards and retries on
//!    interference, the version-validate pattern of optimistic index
//!    reads. Slot-only updates do not perturb the generation.
//!
//! ## Cached-Pointer Variants
//!
//! The `*_cached` / `*_at` operations expose the terminal key node's
//! address so callers can skip the descent on hot keys. A key node stays
//! valid until its key is destroyed: `destroy_cached` / `destroy_at`
//! clear the slot but defer structural merges, so the cached address keeps
//! resolving (to an invalid value snapshot once cleared). Plain `destroy`
//! compresses eagerly.
//!
//! ## Modes
//!
//! `Mode::Single`: one value per key; `put` replaces under
//! [`PutPolicy`]. `Mode::Multi`: a most-recent-first chain of values per
//! key with whole-chain and by-value removal. The mode is fixed at
//! construction and mismatched calls fail with `FAILED_PRECONDITION`.

mod iter;
mod node;

pub use iter::TreeIter;

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::{MAX_KEY_LEN, MAX_PREFIX};
use crate::epoch::EpochGuard;
use crate::fam::{FamRegion, Gptr, TagGptr};
use crate::heap::Heap;
use crate::status::{Error, Result, StatusCode};

use node::{NodeRef, NODE_SIZE};

/// Offset of the `next` link inside a chain element block.
pub(crate) const ELEM_NEXT: u64 = 0;

/// Offset of the value payload (`{size, bytes}`) inside a chain element.
pub(crate) const ELEM_VBUF: u64 = 8;

/// Value multiplicity of a tree, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One value per key; stores replace.
    Single,
    /// A chain of values per key, most recent first.
    Multi,
}

/// Conflict policy for [`RadixTree::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutPolicy {
    /// Replace any existing value, returning the displaced snapshot.
    Update,
    /// Keep an existing value and return it; install only into an empty
    /// slot (the caller releases its freshly allocated block on a hit).
    FindOrCreate,
}

/// Ordered byte-keyed index over a persistent heap.
#[derive(Debug)]
pub struct RadixTree {
    region: Arc<FamRegion>,
    heap: Arc<Heap>,
    root: Gptr,
    mode: Mode,
    write_lock: Mutex<()>,
    struct_gen: AtomicU64,
}

struct ChainAlloc {
    top: Gptr,
    terminal: Gptr,
}

impl RadixTree {
    /// Allocate and persist a fresh root node.
    pub fn create(heap: &Arc<Heap>, mode: Mode) -> Result<Self> {
        let scope = heap.epoch_manager().pin();
        let region = Arc::clone(heap.region());

        let root = heap
            .alloc(&scope, NODE_SIZE)
            .ok_or_else(|| Error::resource_exhausted("heap exhausted allocating tree root"))?;
        NodeRef::init(&region, root, b"").map_err(Error::internal)?;

        Ok(Self {
            region,
            heap: Arc::clone(heap),
            root,
            mode,
            write_lock: Mutex::new(()),
            struct_gen: AtomicU64::new(0),
        })
    }

    /// Reattach to the tree rooted at `root`.
    pub fn open(heap: &Arc<Heap>, root: Gptr, mode: Mode) -> Result<Self> {
        if !root.is_valid() {
            return Err(Error::not_valid("tree root pointer is null"));
        }

        Ok(Self {
            region: Arc::clone(heap.region()),
            heap: Arc::clone(heap),
            root,
            mode,
            write_lock: Mutex::new(()),
            struct_gen: AtomicU64::new(0),
        })
    }

    /// Open when `root` is valid, otherwise create a fresh tree.
    pub fn open_or_create(heap: &Arc<Heap>, root: Gptr, mode: Mode) -> Result<Self> {
        if root.is_valid() {
            Self::open(heap, root, mode)
        } else {
            Self::create(heap, mode)
        }
    }

    /// The root address; persisting it is what lets the tree be reopened.
    pub fn root(&self) -> Gptr {
        self.root
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub(crate) fn region(&self) -> &Arc<FamRegion> {
        &self.region
    }

    // ==================================================================
    // Point reads
    // ==================================================================

    /// Value snapshot for `key`, invalid if the key is absent.
    ///
    /// Lock-free; the scope pins any block the snapshot may reference.
    pub fn get(&self, _scope: &EpochGuard, key: &[u8]) -> TagGptr {
        match self.locate(key) {
            // SAFETY: located within the caller's scope.
            Some(term) => unsafe { NodeRef::at(&self.region, term) }.value(),
            None => TagGptr::NULL,
        }
    }

    /// Key-node address plus value snapshot; both may be invalid.
    pub fn get_cached(&self, _scope: &EpochGuard, key: &[u8]) -> (Gptr, TagGptr) {
        match self.locate(key) {
            // SAFETY: located within the caller's scope.
            Some(term) => (term, unsafe { NodeRef::at(&self.region, term) }.value()),
            None => (Gptr::NULL, TagGptr::NULL),
        }
    }

    /// O(1) value snapshot through a cached key-node address.
    ///
    /// `key_node` must have been returned by a `*_cached` operation and
    /// the key not destroyed outside the caller's scope since.
    pub fn get_at(&self, _scope: &EpochGuard, key_node: Gptr) -> TagGptr {
        // SAFETY: key-node contract above; deferred free pins the block
        // within the scope even if the key was just removed.
        unsafe { NodeRef::at(&self.region, key_node) }.value()
    }

    // ==================================================================
    // Writes (single-value mode)
    // ==================================================================

    /// Install `val` at `key`, returning the displaced (or, under
    /// `FindOrCreate`, the incumbent) value snapshot.
    pub fn put(
        &self,
        scope: &EpochGuard,
        key: &[u8],
        val: Gptr,
        policy: PutPolicy,
    ) -> Result<TagGptr> {
        self.check_key(key)?;
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        let term = self.ensure_node(scope, key)?;
        // SAFETY: terminal node is live; the writer lock is held.
        let node = unsafe { NodeRef::at(&self.region, term) };

        self.store_value(node, val, policy)
    }

    /// `put` variant also returning the terminal key-node address.
    pub fn put_cached(
        &self,
        scope: &EpochGuard,
        key: &[u8],
        val: Gptr,
    ) -> Result<(Gptr, TagGptr, TagGptr)> {
        self.check_key(key)?;
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        let term = self.ensure_node(scope, key)?;
        // SAFETY: terminal node is live; the writer lock is held.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let (old, new) = node.swap_value(val).map_err(Error::internal)?;
        Ok((term, new, old))
    }

    /// Replace the value through a cached key-node address.
    pub fn put_at(
        &self,
        _scope: &EpochGuard,
        key_node: Gptr,
        val: Gptr,
    ) -> Result<(TagGptr, TagGptr)> {
        if !key_node.is_valid() {
            return Err(Error::not_valid("null key-node pointer"));
        }
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        // SAFETY: key-node contract; writer lock held.
        let node = unsafe { NodeRef::at(&self.region, key_node) };

        let (old, new) = node.swap_value(val).map_err(Error::internal)?;
        Ok((new, old))
    }

    /// Clear `key`'s value slot and path-compress, returning the unlinked
    /// value snapshot (invalid if the key was absent).
    pub fn destroy(&self, scope: &EpochGuard, key: &[u8]) -> Result<TagGptr> {
        self.check_key(key)?;
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        let Some((term, path)) = self.locate_with_path(key) else {
            return Ok(TagGptr::NULL);
        };
        // SAFETY: located under the writer lock.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let old = node.value();
        if !old.is_valid() {
            return Ok(TagGptr::NULL);
        }

        node.swap_value(Gptr::NULL).map_err(Error::internal)?;
        self.compress(scope, term, &path)?;

        Ok(old)
    }

    /// `destroy` variant that keeps the key node in place so cached
    /// addresses stay valid; merges are deferred.
    pub fn destroy_cached(&self, _scope: &EpochGuard, key: &[u8]) -> Result<(Gptr, TagGptr)> {
        self.check_key(key)?;
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        let Some(term) = self.locate(key) else {
            return Ok((Gptr::NULL, TagGptr::NULL));
        };
        // SAFETY: located under the writer lock.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let old = node.value();
        if old.is_valid() {
            node.swap_value(Gptr::NULL).map_err(Error::internal)?;
        }

        Ok((term, old))
    }

    /// Clear the value through a cached key-node address; no merges.
    pub fn destroy_at(&self, _scope: &EpochGuard, key_node: Gptr) -> Result<TagGptr> {
        if !key_node.is_valid() {
            return Err(Error::not_valid("null key-node pointer"));
        }
        self.require_mode(Mode::Single)?;

        let _w = self.write_lock.lock();
        // SAFETY: key-node contract; writer lock held.
        let node = unsafe { NodeRef::at(&self.region, key_node) };

        let old = node.value();
        if old.is_valid() {
            node.swap_value(Gptr::NULL).map_err(Error::internal)?;
        }

        Ok(old)
    }

    // ==================================================================
    // Writes (multi-value mode)
    // ==================================================================

    /// Prepend a chain element at `key`. `elem` is a chain element block
    /// (`{next, size, bytes}`) whose payload is already persisted; the
    /// tree links it and publishes the new head.
    pub fn insert_value(&self, scope: &EpochGuard, key: &[u8], elem: Gptr) -> Result<()> {
        self.check_key(key)?;
        self.require_mode(Mode::Multi)?;

        let _w = self.write_lock.lock();
        let term = self.ensure_node(scope, key)?;
        // SAFETY: terminal node is live; writer lock held.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let head = node.chain();
        // Link before publish: the element is unreachable until the head
        // swap below.
        self.region
            .write_u64(elem.offset() + ELEM_NEXT, head.gptr().offset());
        self.region
            .persist(elem.offset() + ELEM_NEXT, 8)
            .map_err(Error::internal)?;

        node.swap_chain(elem).map_err(Error::internal)?;
        Ok(())
    }

    /// Unlink `key`'s whole chain, returning the element blocks for the
    /// caller to release.
    pub fn remove_all(&self, scope: &EpochGuard, key: &[u8]) -> Result<SmallVec<[Gptr; 8]>> {
        self.check_key(key)?;
        self.require_mode(Mode::Multi)?;

        let _w = self.write_lock.lock();
        let Some((term, path)) = self.locate_with_path(key) else {
            return Ok(SmallVec::new());
        };
        // SAFETY: located under the writer lock.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let (_, elems) = self.chain_elements(node);
        if elems.is_empty() {
            return Ok(SmallVec::new());
        }

        node.swap_chain(Gptr::NULL).map_err(Error::internal)?;
        self.compress(scope, term, &path)?;

        Ok(elems)
    }

    /// Unlink the first chain element at `key` whose payload equals
    /// `bytes`, returning its block.
    pub fn remove_value(
        &self,
        scope: &EpochGuard,
        key: &[u8],
        bytes: &[u8],
    ) -> Result<Option<Gptr>> {
        self.check_key(key)?;
        self.require_mode(Mode::Multi)?;

        let _w = self.write_lock.lock();
        let Some((term, path)) = self.locate_with_path(key) else {
            return Ok(None);
        };
        // SAFETY: located under the writer lock.
        let node = unsafe { NodeRef::at(&self.region, term) };

        let mut prev: Option<Gptr> = None;
        let mut cur = node.chain().gptr();

        while cur.is_valid() {
            let next = self.chain_next(cur);

            if self.element_matches(cur, bytes) {
                match prev {
                    None => {
                        node.swap_chain(next).map_err(Error::internal)?;
                    }
                    Some(p) => {
                        // SAFETY: element links are 8-aligned words inside
                        // live chain blocks.
                        unsafe { self.region.atomic_u64(p.offset() + ELEM_NEXT) }
                            .store(next.offset(), Ordering::Release);
                        self.region
                            .persist(p.offset() + ELEM_NEXT, 8)
                            .map_err(Error::internal)?;
                    }
                }

                if !node.chain().is_valid() {
                    self.compress(scope, term, &path)?;
                }
                return Ok(Some(cur));
            }

            prev = Some(cur);
            cur = next;
        }

        Ok(None)
    }

    // ==================================================================
    // Descent
    // ==================================================================

    /// Exact lock-free descent with structure-generation validation.
    fn locate(&self, key: &[u8]) -> Option<Gptr> {
        loop {
            let gen = self.read_gen();
            let found = self.locate_once(key);
            if self.gen_unchanged(gen) {
                return found;
            }
        }
    }

    fn locate_once(&self, key: &[u8]) -> Option<Gptr> {
        let mut cur = self.root;
        let mut depth = 0usize;

        loop {
            // SAFETY: nodes reached from the root are live or scope-pinned.
            let node = unsafe { NodeRef::at(&self.region, cur) };
            let mut pfx = [0u8; MAX_PREFIX];
            let plen = node.prefix_into(&mut pfx);

            let rem = &key[depth..];
            if rem.len() < plen || rem[..plen] != pfx[..plen] {
                return None;
            }
            depth += plen;

            if depth == key.len() {
                return Some(cur);
            }

            let child = node.child(key[depth]);
            if !child.is_valid() {
                return None;
            }
            cur = child;
            depth += 1;
        }
    }

    /// Exact descent recording `(parent, edge byte)` pairs. Writer-side
    /// only: the held writer lock keeps the structure stable.
    #[allow(clippy::type_complexity)]
    fn locate_with_path(&self, key: &[u8]) -> Option<(Gptr, SmallVec<[(Gptr, u8); 16]>)> {
        let mut path: SmallVec<[(Gptr, u8); 16]> = SmallVec::new();
        let mut cur = self.root;
        let mut depth = 0usize;

        loop {
            // SAFETY: structure is stable under the writer lock.
            let node = unsafe { NodeRef::at(&self.region, cur) };
            let mut pfx = [0u8; MAX_PREFIX];
            let plen = node.prefix_into(&mut pfx);

            let rem = &key[depth..];
            if rem.len() < plen || rem[..plen] != pfx[..plen] {
                return None;
            }
            depth += plen;

            if depth == key.len() {
                return Some((cur, path));
            }

            let child = node.child(key[depth]);
            if !child.is_valid() {
                return None;
            }
            path.push((cur, key[depth]));
            cur = child;
            depth += 1;
        }
    }

    /// Descend to the terminal node for `key`, creating and publishing
    /// whatever structure is missing. Writer lock must be held.
    fn ensure_node(&self, scope: &EpochGuard, key: &[u8]) -> Result<Gptr> {
        let mut parent: Option<(Gptr, u8)> = None;
        let mut cur = self.root;
        let mut depth = 0usize;

        loop {
            // SAFETY: structure is stable under the writer lock.
            let node = unsafe { NodeRef::at(&self.region, cur) };
            let mut pfx = [0u8; MAX_PREFIX];
            let plen = node.prefix_into(&mut pfx);

            let rem = &key[depth..];
            let common = lcp(&pfx[..plen], rem);

            if common < plen {
                // Key diverges inside this node's compressed prefix: a new
                // interior node takes the shared part, the old node keeps
                // the tail.
                return self.split_prefix(scope, parent, cur, &pfx[..plen], common, rem);
            }
            depth += common;

            if depth == key.len() {
                return Ok(cur);
            }

            let b = key[depth];
            let child = node.child(b);
            if !child.is_valid() {
                let chain = self.make_chain(scope, &key[depth + 1..])?;
                node.set_child(b, chain.top).map_err(Error::internal)?;
                node.add_child_count(1);
                node.persist_prefix().map_err(Error::internal)?;
                return Ok(chain.terminal);
            }

            parent = Some((cur, b));
            cur = child;
            depth += 1;
        }
    }

    fn split_prefix(
        &self,
        scope: &EpochGuard,
        parent: Option<(Gptr, u8)>,
        old: Gptr,
        old_pfx: &[u8],
        common: usize,
        rem: &[u8],
    ) -> Result<Gptr> {
        let Some((parent_g, parent_byte)) = parent else {
            // The root's prefix is permanently empty, so a split below it
            // always has a parent.
            return Err(Error::new(
                StatusCode::Internal,
                "prefix split reached the root",
            ));
        };

        let split = self.alloc_node(scope, &old_pfx[..common])?;
        // SAFETY: freshly allocated, unpublished.
        let snode = unsafe { NodeRef::at(&self.region, split) };

        snode
            .set_child(old_pfx[common], old)
            .map_err(Error::internal)?;
        snode.add_child_count(1);

        let terminal = if common == rem.len() {
            split
        } else {
            let branch = self.make_chain(scope, &rem[common + 1..])?;
            snode
                .set_child(rem[common], branch.top)
                .map_err(Error::internal)?;
            snode.add_child_count(1);
            branch.terminal
        };
        snode.persist_prefix().map_err(Error::internal)?;

        // SAFETY: live nodes under the writer lock.
        let old_ref = unsafe { NodeRef::at(&self.region, old) };
        let parent_ref = unsafe { NodeRef::at(&self.region, parent_g) };

        // Shortening the old prefix and repointing the parent both happen
        // inside one structure-generation window so concurrent descents
        // retry instead of mixing old and new routing.
        self.begin_restructure();
        old_ref.set_prefix(&old_pfx[common + 1..]);
        old_ref.persist_prefix().map_err(Error::internal)?;
        parent_ref
            .set_child(parent_byte, split)
            .map_err(Error::internal)?;
        self.end_restructure();

        Ok(terminal)
    }

    /// Build the node chain spelling `suffix`, fully persisted and still
    /// unpublished. Returns the chain top (to link) and the terminal node.
    fn make_chain(&self, scope: &EpochGuard, suffix: &[u8]) -> Result<ChainAlloc> {
        // Segment the suffix: each node consumes MAX_PREFIX compressed
        // bytes plus one edge byte, the last takes the remainder.
        let mut spans: SmallVec<[(usize, usize); 8]> = SmallVec::new();
        let mut i = 0usize;
        while suffix.len() - i > MAX_PREFIX {
            spans.push((i, i + MAX_PREFIX));
            i += MAX_PREFIX + 1;
        }

        let terminal = self.alloc_node(scope, &suffix[i..])?;
        let mut top = terminal;

        for (start, end) in spans.into_iter().rev() {
            let upper = self.alloc_node(scope, &suffix[start..end])?;
            // SAFETY: freshly allocated, unpublished.
            let node = unsafe { NodeRef::at(&self.region, upper) };
            node.set_child(suffix[end], top).map_err(Error::internal)?;
            node.add_child_count(1);
            node.persist_prefix().map_err(Error::internal)?;
            top = upper;
        }

        Ok(ChainAlloc { top, terminal })
    }

    fn alloc_node(&self, scope: &EpochGuard, prefix: &[u8]) -> Result<Gptr> {
        let g = self
            .heap
            .alloc(scope, NODE_SIZE)
            .ok_or_else(|| Error::resource_exhausted("heap exhausted allocating tree node"))?;
        NodeRef::init(&self.region, g, prefix).map_err(Error::internal)?;
        Ok(g)
    }

    fn store_value(&self, node: NodeRef<'_>, val: Gptr, policy: PutPolicy) -> Result<TagGptr> {
        match policy {
            PutPolicy::Update => {
                let (old, _) = node.swap_value(val).map_err(Error::internal)?;
                Ok(old)
            }
            PutPolicy::FindOrCreate => {
                let incumbent = node.value();
                if incumbent.is_valid() {
                    return Ok(incumbent);
                }
                node.swap_value(val).map_err(Error::internal)?;
                Ok(TagGptr::NULL)
            }
        }
    }

    // ==================================================================
    // Path compression after deletes
    // ==================================================================

    /// Restore path compression upward from a just-emptied terminal.
    ///
    /// A node with no value and no children is unlinked and freed; a node
    /// with no value and one child merges into that child when the
    /// combined prefix fits. Value-holding nodes and the root are never
    /// removed.
    fn compress(&self, scope: &EpochGuard, terminal: Gptr, path: &[(Gptr, u8)]) -> Result<()> {
        let mut cur = terminal;
        let mut idx = path.len();

        loop {
            if cur == self.root {
                return Ok(());
            }
            // SAFETY: live nodes under the writer lock.
            let node = unsafe { NodeRef::at(&self.region, cur) };
            if node.occupied() {
                return Ok(());
            }

            match node.child_count() {
                0 => {
                    let (parent_g, edge) = path[idx - 1];
                    // SAFETY: parent is on the held descent path.
                    let parent = unsafe { NodeRef::at(&self.region, parent_g) };

                    parent.set_child(edge, Gptr::NULL).map_err(Error::internal)?;
                    parent.add_child_count(-1);
                    parent.persist_prefix().map_err(Error::internal)?;
                    self.heap.free(scope, cur);

                    idx -= 1;
                    cur = parent_g;
                }
                1 => {
                    self.merge_with_only_child(scope, node, path[idx - 1])?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    /// Collapse a pass-through node into its only child if the combined
    /// prefix still fits a node.
    fn merge_with_only_child(
        &self,
        scope: &EpochGuard,
        node: NodeRef<'_>,
        parent: (Gptr, u8),
    ) -> Result<()> {
        let Some((edge, child_g)) = node.only_child() else {
            return Ok(());
        };
        // SAFETY: live child under the writer lock.
        let child = unsafe { NodeRef::at(&self.region, child_g) };

        let mut node_pfx = [0u8; MAX_PREFIX];
        let node_len = node.prefix_into(&mut node_pfx);
        let mut child_pfx = [0u8; MAX_PREFIX];
        let child_len = child.prefix_into(&mut child_pfx);

        if node_len + 1 + child_len > MAX_PREFIX {
            return Ok(());
        }

        let mut combined: SmallVec<[u8; MAX_PREFIX]> = SmallVec::new();
        combined.extend_from_slice(&node_pfx[..node_len]);
        combined.push(edge);
        combined.extend_from_slice(&child_pfx[..child_len]);

        let (parent_g, parent_edge) = parent;
        // SAFETY: parent is on the held descent path.
        let parent_ref = unsafe { NodeRef::at(&self.region, parent_g) };

        // The child's prefix grows and the parent repoints past the
        // pass-through node; one generation window covers both.
        self.begin_restructure();
        child.set_prefix(&combined);
        child.persist_prefix().map_err(Error::internal)?;
        parent_ref
            .set_child(parent_edge, child_g)
            .map_err(Error::internal)?;
        self.end_restructure();

        self.heap.free(scope, node.gptr());
        Ok(())
    }

    // ==================================================================
    // Chains
    // ==================================================================

    fn chain_next(&self, elem: Gptr) -> Gptr {
        self.region.invalidate(elem.offset() + ELEM_NEXT, 8);
        // SAFETY: element links are 8-aligned words in live chain blocks.
        let raw = unsafe { self.region.atomic_u64(elem.offset() + ELEM_NEXT) }.load(Ordering::Acquire);
        Gptr::new(raw)
    }

    /// Snapshot a chain head-first. The caller's scope keeps every
    /// element dereferenceable even if concurrently unlinked.
    pub(crate) fn chain_elements(&self, node: NodeRef<'_>) -> (TagGptr, SmallVec<[Gptr; 8]>) {
        let head = node.chain();
        let mut elems: SmallVec<[Gptr; 8]> = SmallVec::new();

        let mut cur = head.gptr();
        while cur.is_valid() {
            elems.push(cur);
            cur = self.chain_next(cur);
        }
        (head, elems)
    }

    fn element_matches(&self, elem: Gptr, bytes: &[u8]) -> bool {
        let vbuf = elem.offset() + ELEM_VBUF;
        self.region.invalidate(vbuf, 8);
        let size = self.region.read_u64(vbuf);

        if size as usize != bytes.len() {
            return false;
        }

        self.region.invalidate(vbuf + 8, size);
        let mut payload = vec![0u8; size as usize];
        self.region.copy_out(vbuf + 8, &mut payload);
        payload == bytes
    }

    // ==================================================================
    // Structure seqlock
    // ==================================================================

    fn read_gen(&self) -> u64 {
        loop {
            let gen = self.struct_gen.load(Ordering::Acquire);
            if gen & 1 == 0 {
                return gen;
            }
            std::hint::spin_loop();
        }
    }

    fn gen_unchanged(&self, gen: u64) -> bool {
        self.struct_gen.load(Ordering::Acquire) == gen
    }

    fn begin_restructure(&self) {
        let prev = self.struct_gen.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev & 1 == 0, "nested restructure window");
    }

    fn end_restructure(&self) {
        let prev = self.struct_gen.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev & 1 == 1, "unpaired restructure window");
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

    fn require_mode(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            return Err(Error::failed_precondition(match mode {
                Mode::Single => "operation requires a single-value tree",
                Mode::Multi => "operation requires a multi-value tree",
            }));
        }
        Ok(())
    }

    /// Smallest in-range key per `begin`, or `None`.
    pub(crate) fn seek_bound(&self, begin: &Bound<Vec<u8>>) -> Option<(Vec<u8>, Gptr)> {
        match begin {
            Bound::Unbounded => self.seek(None, true),
            Bound::Included(k) => self.seek(Some(k), true),
            Bound::Excluded(k) => self.seek(Some(k), false),
        }
    }

    /// Smallest key `>= lb` (or `> lb` when `allow_equal` is false);
    /// `None` seeks the tree minimum.
    pub(crate) fn seek(&self, lb: Option<&[u8]>, allow_equal: bool) -> Option<(Vec<u8>, Gptr)> {
        loop {
            let gen = self.read_gen();
            let found = match lb {
                None => self.subtree_min(self.root, Vec::new()),
                Some(lb) => self.seek_in(self.root, Vec::new(), lb, allow_equal),
            };
            if self.gen_unchanged(gen) {
                return found;
            }
        }
    }

    /// Smallest key in the subtree at `node_g`; `acc` holds the key bytes
    /// spelled so far, excluding this node's prefix.
    fn subtree_min(&self, node_g: Gptr, mut acc: Vec<u8>) -> Option<(Vec<u8>, Gptr)> {
        // SAFETY: reachable node, validated by the seek generation check.
        let node = unsafe { NodeRef::at(&self.region, node_g) };
        let mut pfx = [0u8; MAX_PREFIX];
        let plen = node.prefix_into(&mut pfx);
        acc.extend_from_slice(&pfx[..plen]);

        if node.occupied() {
            return Some((acc, node_g));
        }

        let (byte, child) = node.first_child_from(0)?;
        acc.push(byte);
        self.subtree_min(child, acc)
    }

    /// Recursive lower-bound walk. A node's own key orders before all of
    /// its descendants, and children order by edge byte.
    fn seek_in(
        &self,
        node_g: Gptr,
        mut acc: Vec<u8>,
        lb: &[u8],
        allow_equal: bool,
    ) -> Option<(Vec<u8>, Gptr)> {
        // SAFETY: reachable node, validated by the seek generation check.
        let node = unsafe { NodeRef::at(&self.region, node_g) };
        let mut pfx = [0u8; MAX_PREFIX];
        let plen = node.prefix_into(&mut pfx);
        acc.extend_from_slice(&pfx[..plen]);

        let k = acc.len().min(lb.len());
        match acc[..k].cmp(&lb[..k]) {
            std::cmp::Ordering::Greater => {
                // Everything below spells a key greater than lb.
                if node.occupied() {
                    return Some((acc, node_g));
                }
                let (byte, child) = node.first_child_from(0)?;
                acc.push(byte);
                self.subtree_min(child, acc)
            }
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Equal if acc.len() >= lb.len() => {
                // This node spells lb exactly (or extends past it).
                let qualifies = acc.len() > lb.len() || allow_equal;
                if qualifies && node.occupied() {
                    return Some((acc, node_g));
                }
                let (byte, child) = node.first_child_from(0)?;
                acc.push(byte);
                self.subtree_min(child, acc)
            }
            std::cmp::Ordering::Equal => {
                // acc is a proper prefix of lb; this node's own key is
                // below the bound. Try the on-path child first, then the
                // next sibling edge.
                let target = lb[acc.len()];

                let on_path = node.child(target);
                if on_path.is_valid() {
                    let mut down = acc.clone();
                    down.push(target);
                    if let Some(hit) = self.seek_in(on_path, down, lb, allow_equal) {
                        return Some(hit);
                    }
                }

                let (byte, child) = node.first_child_from(target as usize + 1)?;
                acc.push(byte);
                self.subtree_min(child, acc)
            }
        }
    }
}

/// Longest common prefix length of two byte slices.
fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
