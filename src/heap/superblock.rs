//! Persisted heap superblock.
//!
//! The first 64 bytes of a heap region hold the superblock: magic bytes,
//! format version, capacity, the bump-allocation cursor, and the tree root
//! slot — the one externally meaningful address in the heap. A crc32 over
//! the meaningful fields catches torn or foreign superblocks on open.
//!
//! All multi-byte fields are little-endian via the zerocopy wrapper types,
//! so the struct can be copied directly to and from region bytes.

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::fam::Gptr;

pub const SUPERBLOCK_SIZE: usize = 64;

pub const HEAP_MAGIC: &[u8; 8] = b"FAMKVHP\x00";
pub const HEAP_VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Number of leading bytes covered by the checksum (everything up to and
/// including `root`).
const CRC_COVERED: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Superblock {
    magic: [u8; 8],
    version: U32,
    _reserved: U32,
    capacity: U64,
    cursor: U64,
    root: U64,
    crc: U32,
    _pad: [u8; 20],
}

impl Superblock {
    pub fn new(capacity: u64, first_block: u64) -> Self {
        let mut sb = Self {
            magic: *HEAP_MAGIC,
            version: U32::new(HEAP_VERSION),
            _reserved: U32::new(0),
            capacity: U64::new(capacity),
            cursor: U64::new(first_block),
            root: U64::new(0),
            crc: U32::new(0),
            _pad: [0; 20],
        };
        sb.seal();
        sb
    }

    /// Parse and verify a superblock read back from the region.
    pub fn parse(bytes: &[u8; SUPERBLOCK_SIZE]) -> Result<Self> {
        let sb = Superblock::read_from_bytes(bytes.as_slice())
            .expect("superblock layout matches SUPERBLOCK_SIZE");

        ensure!(
            sb.magic == *HEAP_MAGIC,
            "bad heap magic {:02x?}",
            &sb.magic[..]
        );
        ensure!(
            sb.version.get() == HEAP_VERSION,
            "unsupported heap version {}",
            sb.version.get()
        );

        let expected = CRC32.checksum(&bytes[..CRC_COVERED]);
        ensure!(
            sb.crc.get() == expected,
            "heap superblock checksum mismatch ({:#x} != {:#x})",
            sb.crc.get(),
            expected
        );

        Ok(sb)
    }

    /// Recompute the checksum after a field update.
    pub fn seal(&mut self) {
        self.crc = U32::new(0);
        let sum = CRC32.checksum(&self.as_bytes()[..CRC_COVERED]);
        self.crc = U32::new(sum);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.get()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.get()
    }

    pub fn set_cursor(&mut self, cursor: u64) {
        self.cursor = U64::new(cursor);
    }

    pub fn root(&self) -> Gptr {
        Gptr::new(self.root.get())
    }

    pub fn set_root(&mut self, root: Gptr) {
        self.root = U64::new(root.offset());
    }
}
