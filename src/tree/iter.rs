//! Range iteration over the tree.
//!
//! A [`TreeIter`] is a purely logical cursor: the last key it emitted,
//! how far through that key's value chain it is (multi-value mode), and
//! the range end. Each advance re-seeks the smallest strictly greater
//! key under the caller's operation scope. Re-seeking instead of caching
//! node positions keeps the iterator immune to concurrent splits and
//! merges: it can never follow a pointer into a restructured path, and a
//! key present for the iterator's whole lifetime is emitted exactly once
//! because the cursor only moves forward.
//!
//! Every call takes the caller's [`EpochGuard`]; the returned key bytes
//! are owned, and the returned value snapshot is dereferenceable for
//! that scope's lifetime. The cursor itself pins nothing between calls,
//! so parked iterators never delay reclamation.
//!
//! Within one key of a multi-value tree the emission order is: oldest
//! element first, then the remaining elements newest to oldest. The
//! chain is re-read on every call; elements added or removed mid-key may
//! or may not be observed, like keys under concurrent mutation.
//!
//! After a range is drained every further call reports `END_OF_DATA`.

use std::ops::Bound;

use crate::epoch::EpochGuard;
use crate::fam::{Gptr, TagGptr};
use crate::status::{Error, Result};

use super::node::NodeRef;
use super::{Mode, RadixTree, ELEM_VBUF};

/// Stateful range cursor produced by [`RadixTree::scan`].
#[derive(Debug)]
pub struct TreeIter {
    end: Bound<Vec<u8>>,
    cursor: Vec<u8>,
    /// Number of chain elements already emitted for `cursor`.
    chain_pos: usize,
    exhausted: bool,
}

impl RadixTree {
    /// Position a new iterator at the smallest key inside
    /// `[begin, end]` (openness per the bounds) and return it together
    /// with that key and its value snapshot.
    ///
    /// Fails with `END_OF_DATA` when no key falls inside the range.
    pub fn scan(
        &self,
        scope: &EpochGuard,
        begin: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Result<(TreeIter, Vec<u8>, TagGptr)> {
        let begin = own_bound(begin);
        let end = own_bound(end);

        let mut iter = TreeIter {
            end,
            cursor: Vec::new(),
            chain_pos: 0,
            exhausted: false,
        };

        let first = self.seek_bound(&begin);
        let (key, val) = self.settle(scope, &mut iter, first)?;
        Ok((iter, key, val))
    }

    /// Advance `iter`, returning the next key/value pair in order.
    ///
    /// `END_OF_DATA` at range end, and on every call thereafter.
    pub fn get_next(&self, scope: &EpochGuard, iter: &mut TreeIter) -> Result<(Vec<u8>, TagGptr)> {
        if iter.exhausted {
            return Err(Error::end_of_data());
        }

        // Remaining chain elements of the current key come first.
        if self.mode() == Mode::Multi {
            if let Some(found) = self.locate_occupied(&iter.cursor) {
                if let Some(val) = self.chain_emission(found, iter.chain_pos) {
                    iter.chain_pos += 1;
                    return Ok((iter.cursor.clone(), val));
                }
            }
        }

        let next = self.seek(Some(&iter.cursor), false);
        self.settle(scope, iter, next)
    }

    /// Land the cursor on `found` (skipping keys whose slot emptied
    /// between seek and read) and produce the first emission.
    fn settle(
        &self,
        _scope: &EpochGuard,
        iter: &mut TreeIter,
        mut found: Option<(Vec<u8>, Gptr)>,
    ) -> Result<(Vec<u8>, TagGptr)> {
        loop {
            let Some((key, node_g)) = found else {
                iter.exhausted = true;
                return Err(Error::end_of_data());
            };
            if !within_end(&key, &iter.end) {
                iter.exhausted = true;
                return Err(Error::end_of_data());
            }

            if let Some(val) = self.first_emission(node_g) {
                iter.cursor = key.clone();
                iter.chain_pos = 1;
                return Ok((key, val));
            }

            found = self.seek(Some(&key), false);
        }
    }

    /// First value to emit for a key: the slot snapshot (single mode) or
    /// the oldest chain element. `None` when the slot emptied under a
    /// concurrent delete.
    fn first_emission(&self, node_g: Gptr) -> Option<TagGptr> {
        // SAFETY: the caller's scope pins the node.
        let node = unsafe { NodeRef::at(self.region(), node_g) };

        match self.mode() {
            Mode::Single => {
                let val = node.value();
                val.is_valid().then_some(val)
            }
            Mode::Multi => {
                let (head, elems) = self.chain_elements(node);
                let last = elems.last()?;
                Some(element_value(*last, head.tag()))
            }
        }
    }

    /// Emission number `pos` (0-based) within a key's chain, re-reading
    /// the chain: 0 is the tail (oldest), then head to tail-1.
    fn chain_emission(&self, node_g: Gptr, pos: usize) -> Option<TagGptr> {
        // SAFETY: the caller's scope pins the node.
        let node = unsafe { NodeRef::at(self.region(), node_g) };

        let (head, elems) = self.chain_elements(node);
        if pos >= elems.len() {
            return None;
        }

        let elem = if pos == 0 {
            elems[elems.len() - 1]
        } else {
            elems[pos - 1]
        };
        Some(element_value(elem, head.tag()))
    }

    /// Exact descent that also requires the terminal to be occupied.
    fn locate_occupied(&self, key: &[u8]) -> Option<Gptr> {
        let node_g = self.locate(key)?;
        // SAFETY: the caller's scope pins the node.
        let node = unsafe { NodeRef::at(self.region(), node_g) };
        node.occupied().then_some(node_g)
    }
}

/// Value address inside a chain element, tagged with the chain head's
/// generation.
fn element_value(elem: Gptr, tag: u16) -> TagGptr {
    TagGptr::new(Gptr::new(elem.offset() + ELEM_VBUF), tag)
}

fn own_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(k.to_vec()),
        Bound::Excluded(k) => Bound::Excluded(k.to_vec()),
    }
}

fn within_end(key: &[u8], end: &Bound<Vec<u8>>) -> bool {
    match end {
        Bound::Unbounded => true,
        Bound::Included(e) => key <= e.as_slice(),
        Bound::Excluded(e) => key < e.as_slice(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::epoch::EpochManager;
    use crate::heap::Heap;
    use crate::tree::PutPolicy;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_tree(mode: Mode) -> (tempfile::TempDir, Arc<Heap>, RadixTree) {
        let dir = tempdir().unwrap();
        let emgr = Arc::new(EpochManager::new());
        let cfg = HeapConfig::new(dir.path()).capacity(8 << 20);
        let heap = Heap::open_or_create(&cfg, emgr).unwrap();
        let tree = RadixTree::create(&heap, mode).unwrap();
        (dir, heap, tree)
    }

    fn load(heap: &Arc<Heap>, tree: &RadixTree, keys: &[&[u8]]) {
        let scope = heap.epoch_manager().pin();
        for (i, key) in keys.iter().enumerate() {
            let v = heap.alloc(&scope, 16).unwrap();
            heap.region().write_u64(v.offset(), i as u64);
            tree.put(&scope, key, v, PutPolicy::Update).unwrap();
        }
    }

    fn collect_keys(heap: &Arc<Heap>, tree: &RadixTree) -> Vec<Vec<u8>> {
        let scope = heap.epoch_manager().pin();
        let mut out = Vec::new();
        match tree.scan(&scope, Bound::Unbounded, Bound::Unbounded) {
            Err(e) => assert!(e.is_end_of_data()),
            Ok((mut iter, key, _)) => {
                out.push(key);
                loop {
                    match tree.get_next(&scope, &mut iter) {
                        Ok((key, _)) => out.push(key),
                        Err(e) => {
                            assert!(e.is_end_of_data());
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    #[test]
    fn empty_tree_scan_is_end_of_data() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        let scope = heap.epoch_manager().pin();

        let err = tree
            .scan(&scope, Bound::Unbounded, Bound::Unbounded)
            .unwrap_err();

        assert!(err.is_end_of_data());
    }

    #[test]
    fn full_scan_yields_strictly_increasing_keys() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        let keys: &[&[u8]] = &[
            b"delta", b"alpha", b"echo", b"beta", b"alphabet", b"charlie", b"",
        ];
        load(&heap, &tree, keys);

        let seen = collect_keys(&heap, &tree);

        let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn inclusive_scan_starts_at_the_bound() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        load(&heap, &tree, &[b"aa", b"bb", b"cc"]);
        let scope = heap.epoch_manager().pin();

        let (_iter, key, _) = tree
            .scan(&scope, Bound::Included(b"bb".as_slice()), Bound::Unbounded)
            .unwrap();

        assert_eq!(key, b"bb");
    }

    #[test]
    fn exclusive_scan_starts_past_the_bound() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        load(&heap, &tree, &[b"aa", b"bb", b"cc"]);
        let scope = heap.epoch_manager().pin();

        let (_iter, key, _) = tree
            .scan(&scope, Bound::Excluded(b"bb".as_slice()), Bound::Unbounded)
            .unwrap();

        assert_eq!(key, b"cc");
    }

    #[test]
    fn end_bound_caps_the_range() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        load(&heap, &tree, &[b"aa", b"bb", b"cc", b"dd"]);
        let scope = heap.epoch_manager().pin();

        let (mut iter, key, _) = tree
            .scan(
                &scope,
                Bound::Included(b"aa".as_slice()),
                Bound::Included(b"bb".as_slice()),
            )
            .unwrap();
        assert_eq!(key, b"aa");

        let (key, _) = tree.get_next(&scope, &mut iter).unwrap();
        assert_eq!(key, b"bb");

        let err = tree.get_next(&scope, &mut iter).unwrap_err();
        assert!(err.is_end_of_data());

        // Exhaustion is sticky.
        assert!(tree.get_next(&scope, &mut iter).unwrap_err().is_end_of_data());
    }

    #[test]
    fn point_scan_hits_single_key() {
        let (_dir, heap, tree) = open_tree(Mode::Single);
        load(&heap, &tree, &[b"aa", b"ab", b"ac"]);
        let scope = heap.epoch_manager().pin();

        let (mut iter, key, _) = tree
            .scan(
                &scope,
                Bound::Included(b"ab".as_slice()),
                Bound::Included(b"ab".as_slice()),
            )
            .unwrap();

        assert_eq!(key, b"ab");
        assert!(tree.get_next(&scope, &mut iter).unwrap_err().is_end_of_data());
    }

    #[test]
    fn multi_value_chain_emits_oldest_then_reverse_insertion() {
        let (_dir, heap, tree) = open_tree(Mode::Multi);
        let scope = heap.epoch_manager().pin();

        // Insert v0..v4; the chain head ends up at v4.
        for i in 0u64..5 {
            let elem = heap.alloc(&scope, 32).unwrap();
            heap.region().write_u64(elem.offset() + ELEM_VBUF, 8);
            heap.region().write_u64(elem.offset() + ELEM_VBUF + 8, i);
            tree.insert_value(&scope, b"k", elem).unwrap();
        }

        let (mut iter, key, first) = tree
            .scan(
                &scope,
                Bound::Included(b"k".as_slice()),
                Bound::Included(b"k".as_slice()),
            )
            .unwrap();
        assert_eq!(key, b"k");

        let value_of = |val: TagGptr| heap.region().read_u64(val.gptr().offset() + 8);

        // Oldest first.
        assert_eq!(value_of(first), 0);

        // Then newest to oldest.
        let mut rest = Vec::new();
        while let Ok((key, val)) = tree.get_next(&scope, &mut iter) {
            assert_eq!(key, b"k");
            rest.push(value_of(val));
        }
        assert_eq!(rest, vec![4, 3, 2, 1]);
    }

    #[test]
    fn multi_value_scan_advances_to_next_key_after_chain() {
        let (_dir, heap, tree) = open_tree(Mode::Multi);
        let scope = heap.epoch_manager().pin();

        for key in [b"a".as_slice(), b"b".as_slice()] {
            for i in 0u64..2 {
                let elem = heap.alloc(&scope, 32).unwrap();
                heap.region().write_u64(elem.offset() + ELEM_VBUF, 8);
                heap.region().write_u64(elem.offset() + ELEM_VBUF + 8, i);
                tree.insert_value(&scope, key, elem).unwrap();
            }
        }

        let (mut iter, key, _) = tree
            .scan(&scope, Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        assert_eq!(key, b"a");

        let (key, _) = tree.get_next(&scope, &mut iter).unwrap();
        assert_eq!(key, b"a");

        let (key, _) = tree.get_next(&scope, &mut iter).unwrap();
        assert_eq!(key, b"b", "chain drained, cursor SHOULD move to next key");
    }
}
