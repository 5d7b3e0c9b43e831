//! # Epoch Manager and Operation Scopes
//!
//! Deferred reclamation needs a clock: a freed block may only be reused
//! once no reader that could still hold its address remains active. This
//! module provides that clock.
//!
//! ## Protocol
//!
//! 1. Before touching any shared pointer, a caller pins itself with
//!    [`EpochManager::pin`], which records the current global epoch in a
//!    slot of a bounded table and returns an [`EpochGuard`].
//! 2. A writer that unlinks a block stamps it with
//!    [`EpochManager::retire_epoch`], which advances the global epoch.
//! 3. [`offline reclamation`](crate::heap::Heap::offline_reclaim) frees a
//!    stamped block once [`EpochManager::min_active`] has moved past its
//!    stamp — every scope that could have observed the block has ended.
//!
//! The ordering argument: a guard records epoch `e` *before* loading any
//! pointer. A block it can observe is unlinked no earlier than that load,
//! and its retire stamp `r` is taken from a monotonically advancing
//! counter, so `r >= e`. The block is only reclaimed when every active
//! slot's epoch exceeds `r`, so never while this guard lives.
//!
//! ## Scope Properties
//!
//! - Pinning is cheap: one atomic load plus one CAS, no syscalls.
//! - Guards are independent, so a thread may hold several (re-entrancy).
//! - Guards are `Send`: a long-lived iterator can carry its scope across
//!   calls and threads.
//! - The guard releases its slot on every exit path via `Drop`.
//!
//! The slot table is bounded; when all slots are taken, `pin` spins. The
//! table is sized far above any realistic number of simultaneous scopes.
//!
//! ## Validity Windows
//!
//! The guard bounds the validity of every [`TagGptr`](crate::TagGptr) the
//! holder keeps: once the guard drops, a snapshotted address may be
//! reclaimed and must not be dereferenced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of simultaneously active operation scopes supported.
const SCOPE_SLOTS: usize = 128;

/// Slot encoding: 0 = free, otherwise `(epoch << 1) | 1`.
#[inline]
fn encode(epoch: u64) -> u64 {
    (epoch << 1) | 1
}

#[inline]
fn decode(slot: u64) -> u64 {
    slot >> 1
}

/// Process-wide reclamation clock shared by the heap and its trees.
#[derive(Debug)]
pub struct EpochManager {
    epoch: AtomicU64,
    slots: Box<[AtomicU64]>,
}

impl EpochManager {
    pub fn new() -> Self {
        let slots = (0..SCOPE_SLOTS).map(|_| AtomicU64::new(0)).collect();

        Self {
            // Start at 1 so stamps are strictly positive.
            epoch: AtomicU64::new(1),
            slots,
        }
    }

    /// Open an operation scope at the current epoch.
    ///
    /// Spins if every slot is taken (the table is sized so this does not
    /// happen in practice).
    pub fn pin(self: &Arc<Self>) -> EpochGuard {
        loop {
            // The epoch must be read before the slot is published; if a
            // retirement slips between the read and the CAS, the recorded
            // epoch is merely older, which delays reclamation but never
            // unblocks it early.
            let epoch = self.epoch.load(Ordering::Acquire);

            for (idx, slot) in self.slots.iter().enumerate() {
                if slot
                    .compare_exchange(0, encode(epoch), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return EpochGuard {
                        mgr: Arc::clone(self),
                        slot: idx,
                        epoch,
                    };
                }
            }

            std::hint::spin_loop();
        }
    }

    /// Advance the clock and return the stamp for a block retired now.
    pub fn retire_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel)
    }

    /// Smallest epoch recorded by any live scope, or `None` when idle.
    pub fn min_active(&self) -> Option<u64> {
        let mut min = None;

        for slot in self.slots.iter() {
            let raw = slot.load(Ordering::Acquire);
            if raw != 0 {
                let e = decode(raw);
                min = Some(min.map_or(e, |m: u64| m.min(e)));
            }
        }

        min
    }

    /// True iff a block stamped `retired` can be physically reused.
    pub fn quiesced(&self, retired: u64) -> bool {
        match self.min_active() {
            None => true,
            Some(min) => min > retired,
        }
    }

    fn release(&self, slot: usize) {
        self.slots[slot].store(0, Ordering::Release);
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An open operation scope. Dropping it retires the scope.
#[derive(Debug)]
pub struct EpochGuard {
    mgr: Arc<EpochManager>,
    slot: usize,
    epoch: u64,
}

impl EpochGuard {
    /// The epoch this scope was opened at.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.mgr.release(self.slot);
    }
}
