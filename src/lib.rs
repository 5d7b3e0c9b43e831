//! # famkv — Persistent Ordered Key-Value Index
//!
//! famkv is a persistent, ordered key-value index: an adaptive radix tree
//! over a byte-addressable persistent heap ("fabric-attached memory"),
//! with a buffer-copy store façade and a multi-index transactional layer.
//!
//! - Data structures live in a persistent shared-memory region and
//!   survive process restart; a stored root pointer reopens the index.
//! - Readers run concurrently with writers without locks; freed blocks
//!   are reclaimed only after every operation scope that could observe
//!   them has ended.
//! - Callers may cache resolved key/value locations as tagged global
//!   pointers and revalidate them with a cheap generation-tag compare.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      Transactions (named indexes, modes)      │
//! ├──────────────────────────────────────────────┤
//! │       KvStore (buffer-copy façade, scans)     │
//! ├──────────────────────────────────────────────┤
//! │   RadixTree (ordered index, tagged slots)     │
//! ├──────────────────────┬───────────────────────┤
//! │  Heap (blocks,       │  EpochManager          │
//! │  deferred free)      │  (operation scopes)    │
//! ├──────────────────────┴───────────────────────┤
//! │  FamRegion (persist / invalidate / Gptr)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use famkv::{HeapConfig, KvStore, Mode};
//!
//! let cfg = HeapConfig::new("/mnt/fam").user("svc").capacity(1 << 30);
//! let store = KvStore::open(&cfg, Mode::Single)?;
//!
//! store.put(b"answer", b"42")?;
//!
//! let mut buf = [0u8; 64];
//! let len = store.get(b"answer", &mut buf)?;
//! assert_eq!(&buf[..len], b"42");
//! ```
//!
//! ## Durability Contract
//!
//! Every payload is persisted before the pointer that publishes it, and
//! every publishing pointer store is persisted before the mutating call
//! returns. Reopening a heap file and following its root pointer yields
//! every value whose store call returned. The transactional layer
//! persists writes individually; it does not add an undo log.
//!
//! ## Module Overview
//!
//! - [`fam`]: persistent region, persist/invalidate barriers, [`Gptr`] /
//!   [`TagGptr`]
//! - [`epoch`]: operation scopes gating deferred reclamation
//! - [`heap`]: block allocation, deferred free, the root slot
//! - [`tree`]: the radix tree, its mutation protocol and iterator
//! - [`kvs`]: buffer-copy store with scan handles and cached-pointer
//!   overloads
//! - [`txn`]: named indexes, access modes, commit/abort
//! - [`status`]: status codes and the crate error type

pub mod config;
pub mod epoch;
pub mod fam;
pub mod heap;
pub mod kvs;
pub mod status;
pub mod tree;
pub mod txn;

pub use config::{HeapConfig, MAX_KEY_LEN, MAX_VAL_LEN, OPEN_BOUNDARY};
pub use epoch::{EpochGuard, EpochManager};
pub use fam::{FamRegion, Gptr, TagGptr};
pub use heap::Heap;
pub use kvs::{CachedGet, FindOrCreate, IterHandle, KvStore, Refresh};
pub use status::{Error, Result, StatusCode};
pub use tree::{Mode, PutPolicy, RadixTree, TreeIter};
pub use txn::{AccessMode, IndexHandle, Tid, TransactionManager};
