// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The table orchestrator.
//!
//! A [`Table`] routes writes between raw-data sections (small entries) and
//! overflow page runs (large entries), keeps every declared index consistent
//! with the entry heap, triggers section compaction from the delete path and
//! drives the dictionary-compression lifecycle.

pub mod report;
pub mod seek;

use crate::builder::{TableValueBuilder, TableValueReader};
use crate::coding::{DecodeError, Encode};
use crate::dictionary::{
    compression_ratio, train, CompressionDictionary, CompressionDictionaryInfo,
};
use crate::env::{
    page_flags, FixedTree, PageNumber, Transaction, Tree, TreeId, PAGE_SIZE,
};
use crate::hash::{
    dictionary_hash, hash64, DictionaryHash, DICTIONARY_HASH_SIZE, EMPTY_DICTIONARY_HASH,
};
use crate::schema::{FixedIndexDef, IndexDef, TableSchema};
use crate::section::{fits_in_section, RawDataSection, INITIAL_SECTION_PAGES, MAX_SECTION_PAGES};
use crate::slice::Slice;
use crate::storage_id::{is_overflow, page_of, storage_id};
use crate::{Error, Result};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::Arc;

const STATS_SLOT: &[u8] = b"stats";
const SCHEMA_SLOT: &[u8] = b"schema";
const ACTIVE_SECTION_SLOT: &[u8] = b"active-section";
const INACTIVE_SECTIONS_SLOT: &[u8] = b"inactive-sections";
const CANDIDATE_SECTIONS_SLOT: &[u8] = b"active-candidate-sections";
const DICTIONARIES_SLOT: &[u8] = b"dictionaries";

// overflow header: [OWNER_HASH: 8][TABLE_TYPE: 1][_: 3][OVERFLOW_SIZE: 4]
const OVERFLOW_OWNER: usize = 0;
const OVERFLOW_TABLE_TYPE: usize = 8;
const OVERFLOW_SIZE: usize = 12;
const OVERFLOW_HEADER_SIZE: usize = 16;

// a section freed below this density gets compacted away; above it but below
// the keep threshold it becomes an allocation candidate
const DENSITY_CANDIDATE: f32 = 0.15;
const DENSITY_KEEP: f32 = 0.5;

// a dictionary is retrained only when the section's best observed ratio
// undercuts the dictionary's expected ratio by more than this margin
const TRAINING_MARGIN: i32 = 10;

fn index_slot(name: &str) -> Vec<u8> {
    [b"index/", name.as_bytes()].concat()
}

fn fixed_index_slot(name: &str) -> Vec<u8> {
    [b"fixed-index/", name.as_bytes()].concat()
}

fn id_from_bytes(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DecodeError::InvalidHeader("storage id"))?;
    Ok(u64::from_le_bytes(bytes))
}

/// An entry located by a read or seek: its storage id plus a reader over the
/// (decompressed) value.
pub struct TableEntry {
    /// Storage id of the entry.
    pub id: u64,
    /// Reader over the entry's columns.
    pub reader: TableValueReader,
}

struct TableState {
    number_of_entries: u64,
    overflow_pages: u64,
    stats_dirty: bool,
    active_section: PageNumber,
    active_dirty: bool,
    decompressed: FxHashMap<u64, Slice>,
    tree_ids: FxHashMap<Vec<u8>, TreeId>,
}

/// A table opened within a transaction.
///
/// At most one `Table` instance per table name should live per transaction;
/// stats and the active-section pointer are cached in memory and flushed by
/// [`Table::prepare_for_commit`].
pub struct Table<'tx, 'env> {
    tx: &'tx Transaction<'env>,
    schema: TableSchema,
    owner_hash: u64,
    root: TreeId,
    for_global_reads: bool,
    state: RefCell<TableState>,
}

impl<'tx, 'env> std::fmt::Debug for Table<'tx, 'env> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("owner_hash", &self.owner_hash)
            .field("root", &self.root)
            .field("for_global_reads", &self.for_global_reads)
            .finish_non_exhaustive()
    }
}

impl<'tx, 'env> Table<'tx, 'env> {
    /// Opens the table, creating it on first use (write transactions only).
    /// The requested schema is validated against the stored one.
    pub fn open(tx: &'tx Transaction<'env>, schema: &TableSchema) -> Result<Self> {
        Self::open_inner(tx, schema, false)
    }

    /// Opens a read-only view used to resolve entries through a *global*
    /// index. Every mutation through this handle fails with
    /// [`Error::ReadOnlyTable`].
    pub fn open_for_global_reads(tx: &'tx Transaction<'env>, schema: &TableSchema) -> Result<Self> {
        Self::open_inner(tx, schema, true)
    }

    fn open_inner(
        tx: &'tx Transaction<'env>,
        schema: &TableSchema,
        for_global_reads: bool,
    ) -> Result<Self> {
        let encoded_schema = schema.encode_into_vec();

        let root = match tx.open_tree(schema.name()) {
            Some(root) => {
                let stored = root
                    .get(SCHEMA_SLOT)?
                    .ok_or(Error::MissingStructure("schema slot"))?;
                if *stored != *encoded_schema {
                    return Err(Error::SchemaMismatch {
                        table: schema.name().to_owned(),
                    });
                }
                root
            }
            None => {
                if !tx.is_writable() {
                    return Err(Error::MissingStructure("table root"));
                }
                Self::create(tx, schema, &encoded_schema)?
            }
        };

        let stats = root
            .get(STATS_SLOT)?
            .ok_or(Error::MissingStructure("stats slot"))?;
        if stats.len() != 16 {
            return Err(DecodeError::InvalidHeader("stats slot").into());
        }
        let number_of_entries = id_from_bytes(&stats[0..8])?;
        let overflow_pages = id_from_bytes(&stats[8..16])?;

        let active_section = root
            .get(ACTIVE_SECTION_SLOT)?
            .ok_or(Error::MissingStructure("active-section slot"))?;
        let active_section = id_from_bytes(&active_section)?;

        Ok(Self {
            tx,
            schema: schema.clone(),
            owner_hash: hash64(schema.name().as_bytes()),
            root: root.id(),
            for_global_reads,
            state: RefCell::new(TableState {
                number_of_entries,
                overflow_pages,
                stats_dirty: false,
                active_section,
                active_dirty: false,
                decompressed: FxHashMap::default(),
                tree_ids: FxHashMap::default(),
            }),
        })
    }

    fn create(
        tx: &'tx Transaction<'env>,
        schema: &TableSchema,
        encoded_schema: &[u8],
    ) -> Result<Tree<'tx, 'env>> {
        log::debug!("creating table {:?}", schema.name());

        let root = tx.create_tree(schema.name())?;

        root.insert(SCHEMA_SLOT, encoded_schema)?;
        root.insert(STATS_SLOT, &[0; 16])?;
        root.insert(ACTIVE_SECTION_SLOT, &0u64.to_le_bytes())?;

        let inactive = tx.create_anonymous_fixed_tree(0)?;
        root.insert(INACTIVE_SECTIONS_SLOT, &inactive.to_le_bytes())?;

        let candidates = tx.create_anonymous_fixed_tree(0)?;
        root.insert(CANDIDATE_SECTIONS_SLOT, &candidates.to_le_bytes())?;

        let dictionaries = tx.create_anonymous_tree()?;
        root.insert(DICTIONARIES_SLOT, &dictionaries.to_le_bytes())?;

        let primary = schema.primary_index()?;
        for index in std::iter::once(primary).chain(schema.indexes()) {
            if index.is_global() {
                tx.create_tree(index.name())?;
            } else {
                let id = tx.create_anonymous_tree()?;
                root.insert(&index_slot(index.name()), &id.to_le_bytes())?;
            }
        }

        for index in schema.fixed_indexes() {
            if index.is_global() {
                tx.create_fixed_tree(index.name(), 8)?;
            } else {
                let id = tx.create_anonymous_fixed_tree(8)?;
                root.insert(&fixed_index_slot(index.name()), &id.to_le_bytes())?;
            }
        }

        Ok(root)
    }

    /// The table's schema.
    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The table's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// 64-bit hash identifying this table as the owner of its sections and
    /// overflow runs.
    #[must_use]
    pub fn owner_hash(&self) -> u64 {
        self.owner_hash
    }

    /// Number of entries currently stored.
    #[must_use]
    pub fn number_of_entries(&self) -> u64 {
        self.state.borrow().number_of_entries
    }

    /// Number of pages held by overflow runs.
    #[must_use]
    pub fn overflow_pages(&self) -> u64 {
        self.state.borrow().overflow_pages
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.for_global_reads {
            return Err(Error::ReadOnlyTable);
        }
        if !self.tx.is_writable() {
            return Err(Error::ReadOnlyTransaction);
        }
        Ok(())
    }

    // --- tree plumbing ---

    fn root_tree(&self) -> Tree<'tx, 'env> {
        self.tx.tree(self.root)
    }

    fn slot_tree_id(&self, slot: &[u8]) -> Result<TreeId> {
        if let Some(id) = self.state.borrow().tree_ids.get(slot) {
            return Ok(*id);
        }

        let bytes = self
            .root_tree()
            .get(slot)?
            .ok_or(Error::MissingStructure("tree slot"))?;
        let id = id_from_bytes(&bytes)?;

        self.state.borrow_mut().tree_ids.insert(slot.to_vec(), id);
        Ok(id)
    }

    fn dictionaries_tree(&self) -> Result<Tree<'tx, 'env>> {
        Ok(self.tx.tree(self.slot_tree_id(DICTIONARIES_SLOT)?))
    }

    fn inactive_sections(&self) -> Result<FixedTree<'tx, 'env>> {
        Ok(self.tx.fixed_tree(self.slot_tree_id(INACTIVE_SECTIONS_SLOT)?))
    }

    fn candidate_sections(&self) -> Result<FixedTree<'tx, 'env>> {
        Ok(self.tx.fixed_tree(self.slot_tree_id(CANDIDATE_SECTIONS_SLOT)?))
    }

    pub(crate) fn index_tree(&self, index: &IndexDef) -> Result<Tree<'tx, 'env>> {
        if index.is_global() {
            self.tx
                .open_tree(index.name())
                .ok_or(Error::MissingStructure("global index tree"))
        } else {
            Ok(self.tx.tree(self.slot_tree_id(&index_slot(index.name()))?))
        }
    }

    pub(crate) fn fixed_index_tree(&self, index: &FixedIndexDef) -> Result<FixedTree<'tx, 'env>> {
        if index.is_global() {
            self.tx
                .open_fixed_tree(index.name())
                .ok_or(Error::MissingStructure("global index tree"))
        } else {
            Ok(self
                .tx
                .fixed_tree(self.slot_tree_id(&fixed_index_slot(index.name()))?))
        }
    }

    pub(crate) fn primary_tree(&self) -> Result<Tree<'tx, 'env>> {
        self.index_tree(self.schema.primary_index()?)
    }

    // --- sections & dictionaries ---

    fn active_section(&self) -> Result<Option<RawDataSection<'tx, 'env>>> {
        let page = self.state.borrow().active_section;
        if page == 0 {
            return Ok(None);
        }
        Ok(Some(RawDataSection::open(self.tx, page)?))
    }

    fn set_active_section(&self, page: PageNumber) {
        let mut state = self.state.borrow_mut();
        state.active_section = page;
        state.active_dirty = true;
    }

    fn ensure_active_section(&self) -> Result<RawDataSection<'tx, 'env>> {
        if let Some(section) = self.active_section()? {
            return Ok(section);
        }

        let section = RawDataSection::create(
            self.tx,
            self.owner_hash,
            self.schema.table_type(),
            INITIAL_SECTION_PAGES,
            &EMPTY_DICTIONARY_HASH,
        )?;
        self.set_active_section(section.start());
        Ok(section)
    }

    fn resolve_dictionary(&self, hash: &DictionaryHash) -> Result<Arc<CompressionDictionary>> {
        self.tx.dictionaries().get(&self.dictionaries_tree()?, hash)
    }

    fn section_dictionary(
        &self,
        section: &RawDataSection<'_, '_>,
    ) -> Result<Arc<CompressionDictionary>> {
        self.resolve_dictionary(&section.compression_dictionary_hash()?)
    }

    /// The dictionary new entries are compressed against: the active
    /// section's, or the sentinel when no section exists yet.
    fn current_dictionary(&self) -> Result<Arc<CompressionDictionary>> {
        match self.active_section()? {
            Some(section) => self.section_dictionary(&section),
            None => self.resolve_dictionary(&EMPTY_DICTIONARY_HASH),
        }
    }

    /// Whether `id` points into a section or overflow run owned by this
    /// table.
    pub fn is_owned(&self, id: u64) -> Result<bool> {
        let run = self.tx.run_containing(page_of(id))?;

        let owner = if run.flags & page_flags::OVERFLOW == 0 {
            RawDataSection::open(self.tx, run.start)?.owner_hash()?
        } else {
            id_from_bytes(&run.bytes()[OVERFLOW_OWNER..OVERFLOW_OWNER + 8])?
        };

        Ok(owner == self.owner_hash)
    }

    // --- read paths ---

    /// Reads the stored bytes of `id` without decompressing.
    pub fn direct_read(&self, id: u64) -> Result<(Slice, bool)> {
        if is_overflow(id) {
            self.read_overflow(id)
        } else {
            RawDataSection::direct_read(self.tx, id)
        }
    }

    /// Reads `id` and decompresses if needed. Decompressed buffers are
    /// memoized per id until the id is mutated or the table is dropped.
    pub fn direct_read_decompress(&self, id: u64) -> Result<Slice> {
        if let Some(cached) = self.state.borrow().decompressed.get(&id) {
            return Ok(cached.clone());
        }

        let (payload, compressed) = self.direct_read(id)?;
        if !compressed {
            return Ok(payload);
        }

        let raw = if is_overflow(id) {
            // large entries carry their dictionary hash in front of the stream
            if payload.len() < DICTIONARY_HASH_SIZE {
                return Err(DecodeError::InvalidHeader("overflow payload").into());
            }
            let mut hash = EMPTY_DICTIONARY_HASH;
            hash.copy_from_slice(&payload[..DICTIONARY_HASH_SIZE]);

            let dict = self.resolve_dictionary(&hash)?;
            dict.decompress(&payload[DICTIONARY_HASH_SIZE..])?
        } else {
            // the containing section's hash is authoritative
            let hash = RawDataSection::dictionary_hash_of(self.tx, id)?;
            let dict = self.resolve_dictionary(&hash)?;
            dict.decompress(&payload)?
        };

        self.state.borrow_mut().decompressed.insert(id, raw.clone());
        Ok(raw)
    }

    fn evict(&self, id: u64) {
        self.state.borrow_mut().decompressed.remove(&id);
    }

    /// A reader over the (decompressed) value at `id`.
    pub fn value_reader(&self, id: u64) -> Result<TableValueReader> {
        Ok(TableValueReader::new(self.direct_read_decompress(id)?))
    }

    /// Looks up an entry by its primary key.
    pub fn read_by_key(&self, key: &[u8]) -> Result<Option<TableEntry>> {
        let Some(id_bytes) = self.primary_tree()?.get(key)? else {
            return Ok(None);
        };
        let id = id_from_bytes(&id_bytes)?;

        Ok(Some(TableEntry {
            id,
            reader: self.value_reader(id)?,
        }))
    }

    /// Looks up an entry through a fixed-size index.
    pub fn read_by_fixed_index(&self, index: &str, value: u64) -> Result<Option<TableEntry>> {
        let index = self.schema.fixed_index(index)?;
        let Some(id_bytes) = self.fixed_index_tree(index)?.get(value)? else {
            return Ok(None);
        };
        let id = id_from_bytes(&id_bytes)?;

        Ok(Some(TableEntry {
            id,
            reader: self.value_reader(id)?,
        }))
    }

    // --- overflow runs ---

    fn write_overflow(&self, payload: &[u8], compressed: bool) -> Result<u64> {
        let pages = ((OVERFLOW_HEADER_SIZE + payload.len()).div_ceil(PAGE_SIZE)) as u64;

        let mut flags = page_flags::OVERFLOW | page_flags::RAW_DATA;
        if compressed {
            flags |= page_flags::COMPRESSED;
        }

        let start = self.tx.allocate_run(pages, flags)?;
        self.tx.modify_run(start, |_, bytes| {
            bytes[OVERFLOW_OWNER..OVERFLOW_OWNER + 8]
                .copy_from_slice(&self.owner_hash.to_le_bytes());
            bytes[OVERFLOW_TABLE_TYPE] = self.schema.table_type();
            bytes[OVERFLOW_SIZE..OVERFLOW_SIZE + 4]
                .copy_from_slice(&(payload.len() as u32).to_le_bytes());
            bytes[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + payload.len()]
                .copy_from_slice(payload);
        })?;

        let mut state = self.state.borrow_mut();
        state.overflow_pages += pages;
        state.stats_dirty = true;

        Ok(storage_id(start, 0))
    }

    fn read_overflow(&self, id: u64) -> Result<(Slice, bool)> {
        let run = self.tx.run_containing(page_of(id))?;
        if run.flags & page_flags::OVERFLOW == 0 {
            return Err(Error::PageNotFound(page_of(id)));
        }

        let bytes = run.bytes();
        let size = u32::from_le_bytes([
            bytes[OVERFLOW_SIZE],
            bytes[OVERFLOW_SIZE + 1],
            bytes[OVERFLOW_SIZE + 2],
            bytes[OVERFLOW_SIZE + 3],
        ]) as usize;

        let payload = Slice::new(&bytes[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + size]);
        Ok((payload, run.flags & page_flags::COMPRESSED != 0))
    }

    fn free_overflow(&self, id: u64) -> Result<()> {
        let run = self.tx.run_containing(page_of(id))?;
        let pages = run.pages;
        self.tx.free_run(run.start)?;

        let mut state = self.state.borrow_mut();
        state.overflow_pages -= pages;
        state.stats_dirty = true;

        Ok(())
    }

    // --- write paths ---

    /// Inserts a new entry, returning its storage id.
    pub fn insert(&self, builder: &mut TableValueBuilder) -> Result<u64> {
        self.ensure_writable()?;

        if self.schema.is_compressed() {
            let dict = self.current_dictionary()?;
            builder.try_compression(&dict)?;
        }

        let id = if fits_in_section(builder.size()) {
            self.insert_small(builder)?
        } else {
            self.write_overflow(&builder.large_form(), builder.is_compressed())?
        };

        self.insert_indexes(id, &builder.reader())?;

        let mut state = self.state.borrow_mut();
        state.number_of_entries += 1;
        state.stats_dirty = true;

        Ok(id)
    }

    fn insert_small(&self, builder: &mut TableValueBuilder) -> Result<u64> {
        let section = self.ensure_active_section()?;

        let id = match section.try_allocate(builder.size())? {
            Some(id) => id,
            None => {
                let required = builder.is_compressed().then(|| builder.dictionary_hash());
                let size = builder.size();
                self.allocate_from_another_section(size, required, Some(&mut *builder))?
            }
        };

        // the active section may have changed under us
        let section = self
            .active_section()?
            .ok_or(Error::MissingStructure("active section"))?;

        if !section.try_write_direct(id, &builder.small_form(), builder.is_compressed())? {
            return Err(Error::AllocationFailure);
        }
        if let Some(ratio) = builder.current_ratio() {
            section.set_compression_rate(ratio)?;
        }

        Ok(id)
    }

    /// Retires the active section and finds (or creates) a new one that can
    /// hold an allocation of `size` bytes.
    ///
    /// When a builder is supplied and the table compresses, this is also the
    /// point where a fresh dictionary may be trained; that can shrink the
    /// builder's rendering, so `size` is re-read afterwards.
    fn allocate_from_another_section(
        &self,
        size: usize,
        required_hash: Option<DictionaryHash>,
        builder: Option<&mut TableValueBuilder>,
    ) -> Result<u64> {
        let previous = self
            .active_section()?
            .ok_or(Error::MissingStructure("active section"))?;

        self.inactive_sections()?.try_insert(previous.start(), &[])?;
        log::trace!(
            "section {} is full, retiring it from table {:?}",
            previous.start(),
            self.name(),
        );

        // candidates in ascending page order; a compressed request only fits
        // sections tagged with the same dictionary
        let candidates = self.candidate_sections()?;
        for item in candidates.iter() {
            let (page, _) = item?;
            let candidate = RawDataSection::open(self.tx, page)?;

            if let Some(required) = &required_hash {
                if candidate.compression_dictionary_hash()? != *required {
                    continue;
                }
            }

            if let Some(id) = candidate.try_allocate(size)? {
                candidates.delete(page)?;
                self.set_active_section(page);
                log::trace!("promoted candidate section {page} to active");
                return Ok(id);
            }
        }

        // no candidate matched; create a bigger section, possibly with a
        // freshly trained dictionary
        let mut new_hash = EMPTY_DICTIONARY_HASH;
        let mut size = size;

        if self.schema.is_compressed() {
            let current = self.section_dictionary(&previous)?;
            new_hash = *current.hash();

            if let Some(builder) = builder {
                if let Some(trained) = self.maybe_train_dictionary(&previous, &current, builder)? {
                    new_hash = trained;
                }
                size = builder.size();
            }
        }

        let pages = (previous.total_pages()? * 2).min(MAX_SECTION_PAGES);
        let section = RawDataSection::create(
            self.tx,
            self.owner_hash,
            self.schema.table_type(),
            pages,
            &new_hash,
        )?;
        self.set_active_section(section.start());

        section.try_allocate(size)?.ok_or(Error::AllocationFailure)
    }

    /// Considers training a dictionary from the previous section's live
    /// entries. Returns the new dictionary's hash if one was trained *and*
    /// beat the current dictionary on the entry at hand.
    fn maybe_train_dictionary(
        &self,
        previous: &RawDataSection<'_, '_>,
        current: &Arc<CompressionDictionary>,
        builder: &mut TableValueBuilder,
    ) -> Result<Option<DictionaryHash>> {
        // the current dictionary still performs close to its expectation
        if previous.min_compression_ratio()? + TRAINING_MARGIN >= current.expected_ratio() {
            return Ok(None);
        }

        let mut samples = Vec::new();
        for id in previous.all_ids()? {
            let (payload, compressed) = RawDataSection::direct_read(self.tx, id)?;
            samples.push(if compressed {
                current.decompress(&payload)?
            } else {
                payload
            });
        }

        let Some(bytes) = train(&samples) else {
            return Ok(None);
        };

        let hash = dictionary_hash(&bytes, self.name().as_bytes());

        let raw_len = builder.raw_bytes().len();
        let probe = CompressionDictionary::new(hash, 0, bytes.clone());
        let expected = compression_ratio(probe.compress(builder.raw_bytes())?.len(), raw_len);

        let mut row = CompressionDictionaryInfo {
            expected_ratio: expected,
        }
        .encode_into_vec();
        row.extend_from_slice(&bytes);

        let candidate = Arc::new(CompressionDictionary::new(hash, expected, bytes));
        if !builder.should_replace_dictionary(&candidate)? {
            log::trace!("trained dictionary did not beat the current one, discarding");
            return Ok(None);
        }

        self.dictionaries_tree()?.insert(&hash, &row)?;
        self.tx.dictionaries().publish(candidate);

        log::debug!(
            "table {:?} adopted a new compression dictionary (expected ratio {expected})",
            self.name(),
        );
        Ok(Some(hash))
    }

    /// Updates the entry at `id` in place when possible; otherwise deletes
    /// and reinserts, returning the (possibly different) resulting id.
    ///
    /// `force` rewrites index entries even when the indexed slices compare
    /// equal.
    pub fn update(&self, id: u64, builder: &mut TableValueBuilder, force: bool) -> Result<u64> {
        self.ensure_writable()?;

        let old_reader = self.value_reader(id)?;
        self.evict(id);

        if is_overflow(id) {
            if self.schema.is_compressed() {
                let dict = self.current_dictionary()?;
                builder.try_compression(&dict)?;
            }

            if !fits_in_section(builder.size()) {
                let large = builder.large_form();
                let run = self.tx.run_containing(page_of(id))?;
                let pages = ((OVERFLOW_HEADER_SIZE + large.len()).div_ceil(PAGE_SIZE)) as u64;

                if pages == run.pages {
                    let mut flags = page_flags::OVERFLOW | page_flags::RAW_DATA;
                    if builder.is_compressed() {
                        flags |= page_flags::COMPRESSED;
                    }
                    self.tx.set_run_flags(run.start, flags)?;

                    self.tx.modify_run(run.start, |_, bytes| {
                        bytes[OVERFLOW_SIZE..OVERFLOW_SIZE + 4]
                            .copy_from_slice(&(large.len() as u32).to_le_bytes());
                        bytes[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + large.len()]
                            .copy_from_slice(&large);
                    })?;

                    self.update_indexes(&old_reader, &builder.reader(), id, id, force)?;
                    return Ok(id);
                }
            }
        } else {
            let run = self.tx.run_containing(page_of(id))?;
            let section = RawDataSection::open(self.tx, run.start)?;
            debug_assert!(
                section.is_owned(self.owner_hash)?,
                "updating an entry of a foreign table",
            );

            if self.schema.is_compressed() {
                // in-place rewrites stay in the old section, so they must be
                // encoded with that section's dictionary
                let dict = self.section_dictionary(&section)?;
                builder.try_compression(&dict)?;
            }

            if fits_in_section(builder.size())
                && section.try_write_direct(id, &builder.small_form(), builder.is_compressed())?
            {
                self.update_indexes(&old_reader, &builder.reader(), id, id, force)?;
                if let Some(ratio) = builder.current_ratio() {
                    section.set_compression_rate(ratio)?;
                }
                return Ok(id);
            }
        }

        // size class changed; fall back to delete + insert
        self.delete_at(id, &old_reader)?;
        self.insert(builder)
    }

    /// Inserts the entry, or updates it if its primary key already exists.
    /// Returns whether an insert happened.
    pub fn set(&self, builder: &mut TableValueBuilder) -> Result<bool> {
        self.ensure_writable()?;

        let key = self.schema.primary_index()?.extract(&builder.reader())?;

        match self.primary_tree()?.get(&key)? {
            Some(id_bytes) => {
                self.update(id_from_bytes(&id_bytes)?, builder, false)?;
                Ok(false)
            }
            None => {
                self.insert(builder)?;
                Ok(true)
            }
        }
    }

    /// Deletes the entry at `id`.
    pub fn delete(&self, id: u64) -> Result<()> {
        self.ensure_writable()?;

        let reader = self.value_reader(id)?;
        self.evict(id);
        self.delete_at(id, &reader)
    }

    fn delete_at(&self, id: u64, reader: &TableValueReader) -> Result<()> {
        self.delete_indexes(id, reader)?;

        if is_overflow(id) {
            self.free_overflow(id)?;
        } else {
            let run = self.tx.run_containing(page_of(id))?;
            let section = RawDataSection::open(self.tx, run.start)?;

            let density = section.free(id)?;
            let is_active = self.state.borrow().active_section == section.start();

            // the active section never compacts into itself
            if !is_active && density <= DENSITY_KEEP {
                if density > DENSITY_CANDIDATE {
                    // the tracked sets are disjoint
                    self.inactive_sections()?.delete(section.start())?;
                    self.candidate_sections()?.try_insert(section.start(), &[])?;
                } else {
                    self.compact_section(section)?;
                }
            }
        }

        let mut state = self.state.borrow_mut();
        state.number_of_entries -= 1;
        state.stats_dirty = true;

        Ok(())
    }

    /// Relocates every live entry out of `doomed` and frees it.
    ///
    /// Entries compressed with a dictionary other than the active section's
    /// are recompressed (or stored raw when recompression does not shrink
    /// them); entries that stop fitting a section move to overflow runs.
    fn compact_section(&self, doomed: RawDataSection<'tx, 'env>) -> Result<()> {
        let doomed_page = doomed.start();
        log::debug!(
            "compacting section {doomed_page} of table {:?} away",
            self.name(),
        );

        self.candidate_sections()?.delete(doomed_page)?;
        self.inactive_sections()?.delete(doomed_page)?;

        let doomed_hash = doomed.compression_dictionary_hash()?;

        for id in doomed.all_ids()? {
            let raw = self.direct_read_decompress(id)?;
            let (payload, was_compressed) = RawDataSection::direct_read(self.tx, id)?;
            self.evict(id);

            let active = self.ensure_active_section()?;
            let active_hash = active.compression_dictionary_hash()?;

            let (data, compressed, encoded_with, ratio) =
                if was_compressed && doomed_hash != active_hash {
                    let dict = self.resolve_dictionary(&active_hash)?;
                    let framed = dict.compress(&raw)?;
                    if framed.len() < raw.len() {
                        let ratio = compression_ratio(framed.len(), raw.len());
                        (Slice::from(framed), true, active_hash, Some(ratio))
                    } else {
                        (raw.clone(), false, EMPTY_DICTIONARY_HASH, None)
                    }
                } else {
                    (payload.clone(), was_compressed, doomed_hash, None)
                };

            let new_id = if fits_in_section(data.len()) {
                let id = match active.try_allocate(data.len())? {
                    Some(id) => id,
                    None => self.allocate_from_another_section(
                        data.len(),
                        compressed.then_some(encoded_with),
                        None,
                    )?,
                };

                let destination = self
                    .active_section()?
                    .ok_or(Error::MissingStructure("active section"))?;
                if !destination.try_write_direct(id, &data, compressed)? {
                    return Err(Error::AllocationFailure);
                }
                if let Some(ratio) = ratio {
                    destination.set_compression_rate(ratio)?;
                }

                id
            } else {
                let large = if compressed {
                    Slice::fused(&encoded_with, &data)
                } else {
                    data.clone()
                };
                self.write_overflow(&large, compressed)?
            };

            self.data_moved(id, new_id, &TableValueReader::new(raw))?;
        }

        doomed.destroy()
    }

    /// Relocation observer: rewrites every index entry of `previous_id` to
    /// point at `new_id`. Failing here is unrecoverable, so errors propagate
    /// as index corruption.
    fn data_moved(&self, previous_id: u64, new_id: u64, reader: &TableValueReader) -> Result<()> {
        log::trace!("entry moved {previous_id} -> {new_id}");
        self.delete_indexes(previous_id, reader)?;
        self.insert_indexes(new_id, reader)
    }

    // --- index maintenance ---

    fn nested_ids_tree(
        &self,
        index_tree: &Tree<'tx, 'env>,
        key: &[u8],
        create: bool,
    ) -> Result<Option<FixedTree<'tx, 'env>>> {
        if let Some(bytes) = index_tree.get(key)? {
            return Ok(Some(self.tx.fixed_tree(id_from_bytes(&bytes)?)));
        }
        if !create {
            return Ok(None);
        }

        let nested = self.tx.create_anonymous_fixed_tree(0)?;
        index_tree.insert(key, &nested.to_le_bytes())?;
        Ok(Some(self.tx.fixed_tree(nested)))
    }

    fn insert_indexes(&self, id: u64, reader: &TableValueReader) -> Result<()> {
        let id_bytes = id.to_le_bytes();

        let primary = self.schema.primary_index()?;
        let key = primary.extract(reader)?;
        if !self.index_tree(primary)?.try_insert(&key, &id_bytes)? {
            return Err(Error::DuplicateKey {
                index: primary.name().to_owned(),
            });
        }

        for index in self.schema.indexes() {
            let key = index.extract(reader)?;
            let tree = self.index_tree(index)?;
            let nested = self
                .nested_ids_tree(&tree, &key, true)?
                .ok_or(Error::MissingStructure("nested index tree"))?;
            nested.try_insert(id, &[])?;
        }

        for index in self.schema.fixed_indexes() {
            let key = index.key_of(reader)?;
            if !self.fixed_index_tree(index)?.try_insert(key, &id_bytes)? {
                return Err(Error::DuplicateKey {
                    index: index.name().to_owned(),
                });
            }
        }

        Ok(())
    }

    fn delete_indexes(&self, id: u64, reader: &TableValueReader) -> Result<()> {
        let primary = self.schema.primary_index()?;
        let key = primary.extract(reader)?;
        if !self.index_tree(primary)?.delete(&key)? {
            return Err(Error::IndexInconsistency {
                index: primary.name().to_owned(),
                id,
            });
        }

        for index in self.schema.indexes() {
            let key = index.extract(reader)?;
            let tree = self.index_tree(index)?;

            let Some(nested) = self.nested_ids_tree(&tree, &key, false)? else {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id,
                });
            };
            if !nested.delete(id)? {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id,
                });
            }

            if nested.is_empty()? {
                self.tx.delete_tree(nested.id())?;
                tree.delete(&key)?;
            }
        }

        for index in self.schema.fixed_indexes() {
            let key = index.key_of(reader)?;
            if !self.fixed_index_tree(index)?.delete(key)? {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id,
                });
            }
        }

        Ok(())
    }

    fn update_indexes(
        &self,
        old: &TableValueReader,
        new: &TableValueReader,
        old_id: u64,
        new_id: u64,
        force: bool,
    ) -> Result<()> {
        let id_bytes = new_id.to_le_bytes();

        let primary = self.schema.primary_index()?;
        let old_key = primary.extract(old)?;
        let new_key = primary.extract(new)?;
        if old_key != new_key {
            if !self.index_tree(primary)?.delete(&old_key)? {
                return Err(Error::IndexInconsistency {
                    index: primary.name().to_owned(),
                    id: old_id,
                });
            }
            if !self.index_tree(primary)?.try_insert(&new_key, &id_bytes)? {
                return Err(Error::DuplicateKey {
                    index: primary.name().to_owned(),
                });
            }
        } else if old_id != new_id || force {
            self.index_tree(primary)?.insert(&new_key, &id_bytes)?;
        }

        for index in self.schema.indexes() {
            let old_key = index.extract(old)?;
            let new_key = index.extract(new)?;
            if old_key == new_key && old_id == new_id && !force {
                continue;
            }

            let tree = self.index_tree(index)?;

            let Some(nested) = self.nested_ids_tree(&tree, &old_key, false)? else {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id: old_id,
                });
            };
            if !nested.delete(old_id)? {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id: old_id,
                });
            }
            if nested.is_empty()? {
                self.tx.delete_tree(nested.id())?;
                tree.delete(&old_key)?;
            }

            let nested = self
                .nested_ids_tree(&tree, &new_key, true)?
                .ok_or(Error::MissingStructure("nested index tree"))?;
            nested.try_insert(new_id, &[])?;
        }

        for index in self.schema.fixed_indexes() {
            let old_key = index.key_of(old)?;
            let new_key = index.key_of(new)?;
            if old_key != new_key {
                if !self.fixed_index_tree(index)?.delete(old_key)? {
                    return Err(Error::IndexInconsistency {
                        index: index.name().to_owned(),
                        id: old_id,
                    });
                }
                if !self.fixed_index_tree(index)?.try_insert(new_key, &id_bytes)? {
                    return Err(Error::DuplicateKey {
                        index: index.name().to_owned(),
                    });
                }
            } else if old_id != new_id || force {
                self.fixed_index_tree(index)?.insert(new_key, &id_bytes)?;
            }
        }

        Ok(())
    }

    // --- delete-many operations ---

    /// Deletes the entry with the given primary key. Returns whether an
    /// entry existed.
    pub fn delete_by_key(&self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;

        let Some(id_bytes) = self.primary_tree()?.get(key)? else {
            return Ok(false);
        };

        self.delete(id_from_bytes(&id_bytes)?)?;
        Ok(true)
    }

    /// Deletes every entry whose primary key starts with `prefix`.
    ///
    /// `before_delete` observes each entry right before it is removed;
    /// `should_abort` can stop the scan, in which case `false` is returned
    /// and the remaining entries survive.
    pub fn delete_by_primary_prefix(
        &self,
        prefix: &[u8],
        mut before_delete: Option<&mut dyn FnMut(&TableEntry) -> Result<()>>,
        mut should_abort: Option<&mut dyn FnMut(&TableEntry) -> bool>,
    ) -> Result<bool> {
        self.ensure_writable()?;

        loop {
            // deletes shift tree state arbitrarily, so re-seek every round
            let Some(item) = self.primary_tree()?.prefix(prefix).next() else {
                return Ok(true);
            };
            let (_, id_bytes) = item?;
            let id = id_from_bytes(&id_bytes)?;

            let entry = TableEntry {
                id,
                reader: self.value_reader(id)?,
            };

            if let Some(should_abort) = &mut should_abort {
                if should_abort(&entry) {
                    return Ok(false);
                }
            }
            if let Some(before_delete) = &mut before_delete {
                before_delete(&entry)?;
            }

            self.evict(id);
            self.delete_at(id, &entry.reader)?;
        }
    }

    /// Deletes up to `limit` entries scanning a secondary index forward from
    /// `value`. With `starts_with`, the scan is bounded to keys prefixed by
    /// `value`. Returns the number of entries deleted.
    pub fn delete_forward_from(
        &self,
        index: &str,
        value: &[u8],
        starts_with: bool,
        limit: usize,
    ) -> Result<usize> {
        self.ensure_writable()?;
        let index = self.schema.index(index)?.clone();

        let mut deleted = 0;
        while deleted < limit {
            let tree = self.index_tree(&index)?;
            let mut cursor = tree.seek(value, false, false);
            if starts_with {
                cursor = cursor.with_prefix(value);
            }

            let Some(item) = cursor.next() else {
                break;
            };
            let (key, _) = item?;

            let nested = self
                .nested_ids_tree(&tree, &key, false)?
                .ok_or(Error::MissingStructure("nested index tree"))?;
            let Some((id, _)) = nested.first()? else {
                return Err(Error::IndexInconsistency {
                    index: index.name().to_owned(),
                    id: 0,
                });
            };

            self.delete(id)?;
            deleted += 1;
        }

        Ok(deleted)
    }

    /// Deletes up to `limit` entries scanning a fixed-size index backward
    /// from `value`. Returns the number of entries deleted.
    pub fn delete_backward_from(&self, index: &str, value: u64, limit: usize) -> Result<usize> {
        self.ensure_writable()?;
        let index = self.schema.fixed_index(index)?.clone();

        let mut deleted = 0;
        while deleted < limit {
            let tree = self.fixed_index_tree(&index)?;
            let Some(item) = tree.seek(value, true, false).next() else {
                break;
            };
            let (_, id_bytes) = item?;

            self.delete(id_from_bytes(&id_bytes)?)?;
            deleted += 1;
        }

        Ok(deleted)
    }

    /// Deletes the entry a fixed-size index maps `value` to. Returns whether
    /// an entry existed.
    pub fn delete_by_index(&self, index: &str, value: u64) -> Result<bool> {
        self.ensure_writable()?;

        let index = self.schema.fixed_index(index)?;
        let Some(id_bytes) = self.fixed_index_tree(index)?.get(value)? else {
            return Ok(false);
        };

        self.delete(id_from_bytes(&id_bytes)?)?;
        Ok(true)
    }

    // --- commit ---

    /// Flushes cached stats and the active-section pointer back into the
    /// table root. Call this before committing the transaction.
    pub fn prepare_for_commit(&self) -> Result<()> {
        let (stats_dirty, active_dirty, entries, overflow, active) = {
            let state = self.state.borrow();
            (
                state.stats_dirty,
                state.active_dirty,
                state.number_of_entries,
                state.overflow_pages,
                state.active_section,
            )
        };

        if stats_dirty {
            let mut stats = [0u8; 16];
            stats[0..8].copy_from_slice(&entries.to_le_bytes());
            stats[8..16].copy_from_slice(&overflow.to_le_bytes());
            self.root_tree().insert(STATS_SLOT, &stats)?;
        }

        if active_dirty {
            self.root_tree()
                .insert(ACTIVE_SECTION_SLOT, &active.to_le_bytes())?;
        }

        let mut state = self.state.borrow_mut();
        state.stats_dirty = false;
        state.active_dirty = false;
        drop(state);

        #[cfg(debug_assertions)]
        self.validate_index_counts()?;

        Ok(())
    }

    /// Every local index must agree with the entry count.
    #[cfg(debug_assertions)]
    fn validate_index_counts(&self) -> Result<()> {
        if self.for_global_reads {
            return Ok(());
        }

        let entries = self.number_of_entries();

        let primary = self.schema.primary_index()?;
        if !primary.is_global() {
            debug_assert_eq!(entries, self.index_tree(primary)?.len()?);
        }

        for index in self.schema.fixed_indexes() {
            if !index.is_global() {
                debug_assert_eq!(entries, self.fixed_index_tree(index)?.len()?);
            }
        }

        Ok(())
    }
}
