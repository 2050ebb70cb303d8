// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Raw-data sections: slab allocation for small entries.
//!
//! A section is a contiguous run of pages owned by one table: a header page
//! followed by data pages. Entries are appended within a data page behind a
//! 4-byte size header; freed space is not reused in place but reclaimed by
//! compacting the whole section once its density drops far enough.
//!
//! On-page layout:
//!
//! Header page:
//! `[OWNER_HASH: 8][TABLE_TYPE: 1][_: 1][NUMBER_OF_PAGES: 2][NUMBER_OF_ENTRIES: 4]`
//! `[LIVE_BYTES: 8][MIN_COMPRESSION_RATIO: 4][DICTIONARY_HASH: 32]`
//!
//! Data page:
//! `[NEXT_ALLOCATION: 2][NUMBER_OF_ENTRIES: 2]` then entries back to back.
//!
//! Entry:
//! `[ALLOCATED: 2][USED: 2][PAYLOAD: USED & SIZE_MASK]`
//! `USED` bit 15 flags a compressed payload, bit 14 a freed entry.

use crate::env::{page_flags, PageNumber, Transaction, PAGE_SIZE};
use crate::hash::{DictionaryHash, DICTIONARY_HASH_SIZE};
use crate::slice::Slice;
use crate::storage_id::{offset_of, page_of, storage_id};
use crate::{Error, Result};

/// Entries of this size or larger (including their header) go to overflow
/// page runs instead of sections.
pub const MAX_ITEM_SIZE: usize = 4064;

/// Per-entry size header.
pub const ENTRY_HEADER_SIZE: usize = 4;

const DATA_PAGE_HEADER_SIZE: usize = 4;

/// Largest number of pages (header included) a section may span.
#[cfg(target_pointer_width = "32")]
pub const MAX_SECTION_PAGES: u64 = 256; // 1 MiB

/// Largest number of pages (header included) a section may span.
#[cfg(not(target_pointer_width = "32"))]
pub const MAX_SECTION_PAGES: u64 = 8192; // 32 MiB

/// Page count (header included) of a table's first section.
pub const INITIAL_SECTION_PAGES: u64 = 16;

/// Compression ratio recorded before any compressed entry was observed.
/// Worse than "no compression at all", so it can never win a comparison.
pub const RATIO_UNSET: i32 = 101;

const USED_COMPRESSED_BIT: u16 = 1 << 15;
const USED_FREED_BIT: u16 = 1 << 14;
const USED_SIZE_MASK: u16 = USED_FREED_BIT - 1;

// header page field offsets
const OWNER_HASH: usize = 0;
const TABLE_TYPE: usize = 8;
const NUMBER_OF_PAGES: usize = 10;
const NUMBER_OF_ENTRIES: usize = 12;
const LIVE_BYTES: usize = 16;
const MIN_COMPRESSION_RATIO: usize = 24;
const DICT_HASH: usize = 28;

fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn write_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn write_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Whether an entry of `size` bytes may live in a section at all.
#[must_use]
pub fn fits_in_section(size: usize) -> bool {
    size < MAX_ITEM_SIZE - ENTRY_HEADER_SIZE
}

/// A raw-data section opened within a transaction.
///
/// The handle carries no state beyond the section's first page number; every
/// operation reads through the transaction, so any number of handles to the
/// same section may coexist.
pub struct RawDataSection<'tx, 'env> {
    tx: &'tx Transaction<'env>,
    start: PageNumber,
}

impl<'tx, 'env> RawDataSection<'tx, 'env> {
    /// Allocates and formats a fresh section spanning `total_pages` pages.
    pub fn create(
        tx: &'tx Transaction<'env>,
        owner_hash: u64,
        table_type: u8,
        total_pages: u64,
        dictionary_hash: &DictionaryHash,
    ) -> Result<Self> {
        debug_assert!(total_pages >= 2);
        debug_assert!(total_pages <= MAX_SECTION_PAGES);

        let start = tx.allocate_run(total_pages, page_flags::RAW_DATA)?;
        let data_pages = total_pages - 1;

        tx.modify_run(start, |_, bytes| {
            write_u64(bytes, OWNER_HASH, owner_hash);
            bytes[TABLE_TYPE] = table_type;
            write_u16(bytes, NUMBER_OF_PAGES, data_pages as u16);
            write_u32(bytes, NUMBER_OF_ENTRIES, 0);
            write_u64(bytes, LIVE_BYTES, 0);
            write_u32(bytes, MIN_COMPRESSION_RATIO, RATIO_UNSET as u32);
            bytes[DICT_HASH..DICT_HASH + DICTIONARY_HASH_SIZE].copy_from_slice(dictionary_hash);

            for page in 1..=data_pages {
                let base = page as usize * PAGE_SIZE;
                write_u16(bytes, base, DATA_PAGE_HEADER_SIZE as u16);
                write_u16(bytes, base + 2, 0);
            }
        })?;

        log::debug!(
            "created raw data section at page {start} spanning {total_pages} pages (owner={owner_hash:x})",
        );

        Ok(Self { tx, start })
    }

    /// Opens the section whose header page is `start`.
    pub fn open(tx: &'tx Transaction<'env>, start: PageNumber) -> Result<Self> {
        let run = tx.run_containing(start)?;
        if run.start != start || run.flags & page_flags::RAW_DATA == 0 {
            return Err(Error::PageNotFound(start));
        }
        Ok(Self { tx, start })
    }

    /// First page number (the header page).
    #[must_use]
    pub fn start(&self) -> PageNumber {
        self.start
    }

    fn header<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let run = self.tx.run_containing(self.start)?;
        Ok(f(run.bytes()))
    }

    /// Hash of the table owning this section.
    pub fn owner_hash(&self) -> Result<u64> {
        self.header(|b| read_u64(b, OWNER_HASH))
    }

    /// Table-type byte recorded at creation.
    pub fn table_type(&self) -> Result<u8> {
        self.header(|b| b[TABLE_TYPE])
    }

    /// Number of data pages (excluding the header page).
    pub fn data_pages(&self) -> Result<u64> {
        self.header(|b| u64::from(read_u16(b, NUMBER_OF_PAGES)))
    }

    /// Number of pages the section spans, header included.
    pub fn total_pages(&self) -> Result<u64> {
        Ok(self.data_pages()? + 1)
    }

    /// Number of live entries.
    pub fn number_of_entries(&self) -> Result<u64> {
        self.header(|b| u64::from(read_u32(b, NUMBER_OF_ENTRIES)))
    }

    /// Bytes occupied by live entries, headers included.
    pub fn live_bytes(&self) -> Result<u64> {
        self.header(|b| read_u64(b, LIVE_BYTES))
    }

    /// `live_bytes / capacity`, in `[0, 1]`.
    pub fn density(&self) -> Result<f32> {
        self.header(|b| {
            let capacity = u64::from(read_u16(b, NUMBER_OF_PAGES)) * PAGE_SIZE as u64;
            read_u64(b, LIVE_BYTES) as f32 / capacity as f32
        })
    }

    /// The 32-byte hash of the dictionary this section's compressed entries
    /// were encoded with; all-zero for an uncompressed section.
    pub fn compression_dictionary_hash(&self) -> Result<DictionaryHash> {
        self.header(|b| {
            let mut hash = [0; DICTIONARY_HASH_SIZE];
            hash.copy_from_slice(&b[DICT_HASH..DICT_HASH + DICTIONARY_HASH_SIZE]);
            hash
        })
    }

    /// Best (lowest) compression ratio observed in this section.
    pub fn min_compression_ratio(&self) -> Result<i32> {
        self.header(|b| read_u32(b, MIN_COMPRESSION_RATIO) as i32)
    }

    /// Records a compression ratio observation.
    pub fn set_compression_rate(&self, ratio: i32) -> Result<()> {
        self.tx.modify_run(self.start, |_, bytes| {
            let current = read_u32(bytes, MIN_COMPRESSION_RATIO) as i32;
            if ratio < current {
                write_u32(bytes, MIN_COMPRESSION_RATIO, ratio as u32);
            }
        })
    }

    /// Whether `id` points into this section's data pages.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        let page = page_of(id);
        offset_of(id) != 0
            && page > self.start
            && self
                .data_pages()
                .is_ok_and(|data_pages| page <= self.start + data_pages)
    }

    /// Whether this section belongs to the table identified by `owner_hash`.
    pub fn is_owned(&self, owner_hash: u64) -> Result<bool> {
        Ok(self.owner_hash()? == owner_hash)
    }

    /// Tries to reserve space for an entry of `size` bytes. Returns the new
    /// entry's storage id, or `None` if no data page has room.
    ///
    /// The reservation counts as live immediately; the caller must follow up
    /// with [`RawDataSection::try_write_direct`].
    pub fn try_allocate(&self, size: usize) -> Result<Option<u64>> {
        if !fits_in_section(size) {
            return Ok(None);
        }

        let needed = ENTRY_HEADER_SIZE + size;

        let found = self.header(|bytes| {
            let data_pages = u64::from(read_u16(bytes, NUMBER_OF_PAGES));
            (1..=data_pages).find_map(|page| {
                let base = page as usize * PAGE_SIZE;
                let next = read_u16(bytes, base) as usize;
                (next + needed <= PAGE_SIZE).then_some((page, next))
            })
        })?;

        let Some((page, offset)) = found else {
            return Ok(None);
        };

        self.tx.modify_run(self.start, |_, bytes| {
            let base = page as usize * PAGE_SIZE;
            let entry = base + offset;

            write_u16(bytes, entry, size as u16);
            write_u16(bytes, entry + 2, USED_FREED_BIT);

            write_u16(bytes, base, (offset + needed) as u16);
            write_u16(bytes, base + 2, read_u16(bytes, base + 2) + 1);

            write_u32(bytes, NUMBER_OF_ENTRIES, read_u32(bytes, NUMBER_OF_ENTRIES) + 1);
            write_u64(bytes, LIVE_BYTES, read_u64(bytes, LIVE_BYTES) + needed as u64);
        })?;

        Ok(Some(storage_id(self.start + page, offset)))
    }

    /// Writes an entry's payload in place. Fails (returns `false`) when the
    /// entry's reserved space is smaller than `data`.
    pub fn try_write_direct(&self, id: u64, data: &[u8], compressed: bool) -> Result<bool> {
        debug_assert!(self.contains(id), "id {id} is outside this section");

        self.tx.modify_run(self.start, |start, bytes| {
            let entry = Self::entry_offset(start, id);
            let allocated = read_u16(bytes, entry) as usize;
            if data.len() > allocated {
                return false;
            }

            let mut used = data.len() as u16;
            if compressed {
                used |= USED_COMPRESSED_BIT;
            }
            write_u16(bytes, entry + 2, used);
            bytes[entry + ENTRY_HEADER_SIZE..entry + ENTRY_HEADER_SIZE + data.len()]
                .copy_from_slice(data);

            true
        })
    }

    fn entry_offset(run_start: PageNumber, id: u64) -> usize {
        (page_of(id) - run_start) as usize * PAGE_SIZE + offset_of(id)
    }

    /// Reads the entry `id` points at, given only a transaction.
    ///
    /// This is deliberately independent of any section handle: an id remains
    /// readable while its section is being compacted away, and ids from
    /// different sections decode the same way.
    pub fn direct_read(tx: &Transaction<'_>, id: u64) -> Result<(Slice, bool)> {
        let run = tx.run_containing(page_of(id))?;
        let bytes = run.bytes();
        let entry = Self::entry_offset(run.start, id);

        let used = read_u16(bytes, entry + 2);
        if used & USED_FREED_BIT != 0 {
            return Err(Error::PageNotFound(page_of(id)));
        }

        let size = (used & USED_SIZE_MASK) as usize;
        let payload = Slice::new(&bytes[entry + ENTRY_HEADER_SIZE..entry + ENTRY_HEADER_SIZE + size]);

        Ok((payload, used & USED_COMPRESSED_BIT != 0))
    }

    /// The dictionary hash of the section containing the small entry `id`.
    pub fn dictionary_hash_of(tx: &Transaction<'_>, id: u64) -> Result<DictionaryHash> {
        let run = tx.run_containing(page_of(id))?;
        let bytes = run.bytes();

        let mut hash = [0; DICTIONARY_HASH_SIZE];
        hash.copy_from_slice(&bytes[DICT_HASH..DICT_HASH + DICTIONARY_HASH_SIZE]);
        Ok(hash)
    }

    /// Frees the entry at `id` and returns the section's density afterwards.
    pub fn free(&self, id: u64) -> Result<f32> {
        debug_assert!(self.contains(id), "id {id} is outside this section");

        self.tx.modify_run(self.start, |start, bytes| {
            let entry = Self::entry_offset(start, id);
            let allocated = read_u16(bytes, entry) as usize;
            let used = read_u16(bytes, entry + 2);
            debug_assert_eq!(0, used & USED_FREED_BIT, "double free of {id}");

            write_u16(bytes, entry + 2, USED_FREED_BIT);

            let page_base = (page_of(id) - start) as usize * PAGE_SIZE;
            let page_entries = read_u16(bytes, page_base + 2) - 1;
            write_u16(bytes, page_base + 2, page_entries);

            // an emptied page can be rewound wholesale; no live id points
            // into it anymore
            if page_entries == 0 {
                write_u16(bytes, page_base, DATA_PAGE_HEADER_SIZE as u16);
            }

            write_u32(bytes, NUMBER_OF_ENTRIES, read_u32(bytes, NUMBER_OF_ENTRIES) - 1);

            let live = read_u64(bytes, LIVE_BYTES) - (allocated + ENTRY_HEADER_SIZE) as u64;
            write_u64(bytes, LIVE_BYTES, live);

            let capacity = u64::from(read_u16(bytes, NUMBER_OF_PAGES)) * PAGE_SIZE as u64;
            live as f32 / capacity as f32
        })
    }

    /// Storage ids of every live entry, in layout order.
    pub fn all_ids(&self) -> Result<Vec<u64>> {
        self.header(|bytes| {
            let data_pages = u64::from(read_u16(bytes, NUMBER_OF_PAGES));
            let mut ids = vec![];

            for page in 1..=data_pages {
                let base = page as usize * PAGE_SIZE;
                let next = read_u16(bytes, base) as usize;

                let mut offset = DATA_PAGE_HEADER_SIZE;
                while offset < next {
                    let allocated = read_u16(bytes, base + offset) as usize;
                    let used = read_u16(bytes, base + offset + 2);
                    if used & USED_FREED_BIT == 0 {
                        ids.push(storage_id(self.start + page, offset));
                    }
                    offset += ENTRY_HEADER_SIZE + allocated;
                }
            }

            ids
        })
    }

    /// Releases the section's pages. The handle is consumed; every id that
    /// pointed into the section becomes invalid.
    pub fn destroy(self) -> Result<()> {
        log::debug!("freeing raw data section at page {}", self.start);
        self.tx.free_run(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::EMPTY_DICTIONARY_HASH;
    use crate::Environment;

    fn section<'tx, 'env>(tx: &'tx Transaction<'env>) -> RawDataSection<'tx, 'env> {
        RawDataSection::create(tx, 0xFEED, 7, 4, &EMPTY_DICTIONARY_HASH).expect("create section")
    }

    #[test]
    fn allocate_write_read_round_trip() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        let id = section.try_allocate(11)?.expect("fits");
        assert!(section.try_write_direct(id, b"hello world", false)?);

        let (payload, compressed) = RawDataSection::direct_read(&tx, id)?;
        assert_eq!(b"hello world", &*payload);
        assert!(!compressed);

        assert!(section.contains(id));
        assert_eq!(1, section.number_of_entries()?);
        assert_eq!(0xFEED, section.owner_hash()?);
        assert_eq!(7, section.table_type()?);

        Ok(())
    }

    #[test]
    fn write_direct_rejects_larger_payload() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        let id = section.try_allocate(4)?.expect("fits");
        assert!(!section.try_write_direct(id, b"too large", false)?);
        assert!(section.try_write_direct(id, b"ok!!", false)?);

        Ok(())
    }

    #[test]
    fn allocation_failure_when_full() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        // 3 data pages, ~2 entries of 4000 bytes fit per page
        let mut count = 0;
        while section.try_allocate(4000)?.is_some() {
            count += 1;
        }
        assert_eq!(6, count);

        // smaller entries still fit into the tail space
        assert!(section.try_allocate(64)?.is_some());

        Ok(())
    }

    #[test]
    fn oversized_entries_are_rejected() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        assert!(fits_in_section(MAX_ITEM_SIZE - ENTRY_HEADER_SIZE - 1));
        assert!(!fits_in_section(MAX_ITEM_SIZE - ENTRY_HEADER_SIZE));

        assert!(section
            .try_allocate(MAX_ITEM_SIZE - ENTRY_HEADER_SIZE - 1)?
            .is_some());
        assert!(section
            .try_allocate(MAX_ITEM_SIZE - ENTRY_HEADER_SIZE)?
            .is_none());

        Ok(())
    }

    #[test]
    fn free_updates_density_and_live_set() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        let a = section.try_allocate(100)?.expect("fits");
        let b = section.try_allocate(100)?.expect("fits");
        section.try_write_direct(a, &[1; 100], false)?;
        section.try_write_direct(b, &[2; 100], false)?;

        assert_eq!(vec![a, b], section.all_ids()?);

        let density = section.free(a)?;
        assert!(density > 0.0);
        assert!(density < 0.01);
        assert_eq!(vec![b], section.all_ids()?);

        // the freed entry is no longer readable
        assert!(RawDataSection::direct_read(&tx, a).is_err());
        assert!(RawDataSection::direct_read(&tx, b).is_ok());

        Ok(())
    }

    #[test]
    fn direct_read_works_across_sections() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();

        let first = section(&tx);
        let second =
            RawDataSection::create(&tx, 0xBEEF, 7, 4, &EMPTY_DICTIONARY_HASH)?;

        let id1 = first.try_allocate(3)?.expect("fits");
        first.try_write_direct(id1, b"one", false)?;
        let id2 = second.try_allocate(3)?.expect("fits");
        second.try_write_direct(id2, b"two", true)?;

        // reads only need a transaction, not the owning handle
        assert_eq!(b"one", &*RawDataSection::direct_read(&tx, id1)?.0);
        let (payload, compressed) = RawDataSection::direct_read(&tx, id2)?;
        assert_eq!(b"two", &*payload);
        assert!(compressed);

        Ok(())
    }

    #[test]
    fn compression_rate_tracks_minimum() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let section = section(&tx);

        assert_eq!(RATIO_UNSET, section.min_compression_ratio()?);

        section.set_compression_rate(60)?;
        section.set_compression_rate(80)?;
        section.set_compression_rate(40)?;
        assert_eq!(40, section.min_compression_ratio()?);

        Ok(())
    }
}
