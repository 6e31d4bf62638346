use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use byteorder::{ByteOrder, LittleEndian};

pub const BUCKETS: usize = 256;
const HEADER_LEN: usize = 8;
const MAGIC: u32 = 0x4648_5431;

/// Bytes the table needs in the arena.
pub const TABLE_LEN: usize = HEADER_LEN + BUCKETS * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First job to use this file.
    Added,
    /// Another job registered it already.
    Shared,
    /// No bucket left; the file is not tracked.
    Full,
}

/// The file-sharing side table in the arena, after the record slots. Jobs
/// register the files they use so a file opened by several jobs shows up as
/// shared.
///
/// Layout: `magic: u32, count: u32`, then [`BUCKETS`] little-endian `u64`
/// name hashes with open addressing. Zero marks an empty bucket.
pub struct FileHashTable<'a> {
    bytes: &'a mut [u8],
}

impl<'a> FileHashTable<'a> {
    /// Zero the table region and stamp it.
    pub fn init(bytes: &'a mut [u8]) -> Self {
        let bytes = &mut bytes[..TABLE_LEN];
        bytes.fill(0);
        LittleEndian::write_u32(&mut bytes[0..4], MAGIC);
        FileHashTable { bytes }
    }

    /// Use a table set up earlier by [`FileHashTable::init`].
    pub fn attach(bytes: &'a mut [u8]) -> Self {
        let bytes = &mut bytes[..TABLE_LEN];
        debug_assert_eq!(LittleEndian::read_u32(&bytes[0..4]), MAGIC);
        FileHashTable { bytes }
    }

    pub fn len(&self) -> usize {
        LittleEndian::read_u32(&self.bytes[4..8]) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, i: usize) -> u64 {
        let off = HEADER_LEN + i * 8;
        LittleEndian::read_u64(&self.bytes[off..off + 8])
    }

    fn set_bucket(&mut self, i: usize, v: u64) {
        let off = HEADER_LEN + i * 8;
        LittleEndian::write_u64(&mut self.bytes[off..off + 8], v);
    }

    fn probe(&self, h: u64) -> Option<(usize, bool)> {
        let start = (h % BUCKETS as u64) as usize;
        (0..BUCKETS)
            .map(|i| (start + i) % BUCKETS)
            .find_map(|i| match self.bucket(i) {
                0 => Some((i, false)),
                v if v == h => Some((i, true)),
                _ => None,
            })
    }

    pub fn register(&mut self, name: &str) -> Registration {
        let h = name_hash(name);
        match self.probe(h) {
            Some((_, true)) => Registration::Shared,
            Some((i, false)) => {
                self.set_bucket(i, h);
                let count = self.len() as u32 + 1;
                LittleEndian::write_u32(&mut self.bytes[4..8], count);
                Registration::Added
            }
            None => Registration::Full,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.probe(name_hash(name)), Some((_, true)))
    }
}

fn name_hash(name: &str) -> u64 {
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish().max(1)
}
