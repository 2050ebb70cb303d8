// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Building and reading table entries.
//!
//! An entry is a list of columns packed as
//! `[COUNT: 1][END_OFFSET: 4 * COUNT][DATA]` with end offsets relative to
//! the data region. The builder optionally holds a compressed rendering of
//! the packed bytes next to the raw one; which of the two gets persisted is
//! the table's routing decision.

use crate::coding::DecodeError;
use crate::dictionary::{compression_ratio, CompressionDictionary};
use crate::hash::{DictionaryHash, EMPTY_DICTIONARY_HASH};
use crate::slice::Slice;
use crate::Result;
use std::sync::Arc;

/// Staging buffer for an entry's columns.
pub struct TableValueBuilder {
    columns: Vec<Slice>,
    raw: Option<Slice>,
    compressed: Option<Vec<u8>>,
    dictionary: Option<Arc<CompressionDictionary>>,
}

impl Default for TableValueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableValueBuilder {
    /// Starts an empty entry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            raw: None,
            compressed: None,
            dictionary: None,
        }
    }

    /// Appends a column.
    pub fn add(&mut self, column: impl Into<Slice>) {
        debug_assert!(self.columns.len() < usize::from(u8::MAX));
        self.columns.push(column.into());

        // any staged rendering is stale now
        self.raw = None;
        self.compressed = None;
        self.dictionary = None;
    }

    /// Number of columns staged so far.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The packed (uncompressed) entry bytes.
    pub fn raw_bytes(&mut self) -> &Slice {
        if self.raw.is_none() {
            let data_len = self.columns.iter().map(|c| c.len()).sum::<usize>();
            let mut out = Vec::with_capacity(1 + 4 * self.columns.len() + data_len);

            out.push(self.columns.len() as u8);
            let mut end = 0u32;
            for column in &self.columns {
                end += column.len() as u32;
                out.extend_from_slice(&end.to_le_bytes());
            }
            for column in &self.columns {
                out.extend_from_slice(column);
            }

            self.raw = Some(Slice::from(out));
        }

        self.raw.as_ref().expect("just built")
    }

    /// Size of the bytes that would be persisted (compressed if accepted).
    pub fn size(&mut self) -> usize {
        let raw_len = self.raw_bytes().len();
        self.compressed.as_ref().map_or(raw_len, Vec::len)
    }

    /// Whether a compressed rendering was accepted.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    /// Compresses the entry against `dictionary`, keeping the compressed
    /// rendering only if it is actually smaller than the raw form.
    pub fn try_compression(&mut self, dictionary: &Arc<CompressionDictionary>) -> Result<()> {
        let raw = self.raw_bytes().clone();
        let framed = dictionary.compress(&raw)?;

        if framed.len() < raw.len() {
            self.compressed = Some(framed);
            self.dictionary = Some(dictionary.clone());
        } else {
            self.compressed = None;
            self.dictionary = None;
        }

        Ok(())
    }

    /// Evaluates a candidate dictionary against the current rendering. The
    /// candidate wins only by compressing this entry at least 10% smaller;
    /// when it does, the builder switches to the candidate's rendering.
    pub fn should_replace_dictionary(
        &mut self,
        candidate: &Arc<CompressionDictionary>,
    ) -> Result<bool> {
        let raw = self.raw_bytes().clone();
        let challenger = candidate.compress(&raw)?;

        let current_len = self.compressed.as_ref().map_or(raw.len(), Vec::len);
        if challenger.len() * 100 > current_len * 90 {
            return Ok(false);
        }

        self.compressed = Some(challenger);
        self.dictionary = Some(candidate.clone());
        Ok(true)
    }

    /// Ratio of the accepted compressed rendering, if any.
    pub fn current_ratio(&mut self) -> Option<i32> {
        let raw_len = self.raw_bytes().len();
        self.compressed
            .as_ref()
            .map(|c| compression_ratio(c.len(), raw_len))
    }

    /// The dictionary the accepted rendering was encoded with.
    #[must_use]
    pub fn dictionary(&self) -> Option<&Arc<CompressionDictionary>> {
        self.dictionary.as_ref()
    }

    /// Hash tag for the accepted rendering (all-zero when uncompressed or
    /// compressed without a trained dictionary).
    #[must_use]
    pub fn dictionary_hash(&self) -> DictionaryHash {
        self.dictionary
            .as_ref()
            .map_or(EMPTY_DICTIONARY_HASH, |d| *d.hash())
    }

    /// The bytes persisted for a small entry: the compressed rendering when
    /// accepted, the raw form otherwise.
    pub fn small_form(&mut self) -> Slice {
        if let Some(compressed) = &self.compressed {
            Slice::new(compressed)
        } else {
            self.raw_bytes().clone()
        }
    }

    /// The bytes persisted for a large (overflow) entry; a compressed
    /// rendering is prefixed with its dictionary hash so the entry stays
    /// self-describing.
    pub fn large_form(&mut self) -> Slice {
        let hash = self.dictionary_hash();
        if let Some(compressed) = &self.compressed {
            Slice::fused(&hash, compressed)
        } else {
            self.raw_bytes().clone()
        }
    }

    /// A reader over the raw (uncompressed) entry, for index extraction.
    pub fn reader(&mut self) -> TableValueReader {
        TableValueReader::new(self.raw_bytes().clone())
    }
}

/// Read-only view over a packed entry.
#[derive(Clone)]
pub struct TableValueReader {
    data: Slice,
}

impl TableValueReader {
    /// Wraps packed entry bytes.
    #[must_use]
    pub fn new(data: Slice) -> Self {
        Self { data }
    }

    /// Number of columns.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.first().copied().map_or(0, usize::from)
    }

    fn data_start(&self) -> usize {
        1 + 4 * self.count()
    }

    fn column_end(&self, i: usize) -> Result<usize> {
        let off = 1 + 4 * i;
        let bytes = self
            .data
            .get(off..off + 4)
            .ok_or(DecodeError::InvalidHeader("table value offsets"))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    }

    /// The contiguous slice covering columns `[first, first + count)`.
    pub fn column_range(&self, first: usize, count: usize) -> Result<Slice> {
        if count == 0 || first + count > self.count() {
            return Err(DecodeError::InvalidHeader("column range").into());
        }

        let start = if first == 0 {
            0
        } else {
            self.column_end(first - 1)?
        };
        let end = self.column_end(first + count - 1)?;

        let data_start = self.data_start();
        if data_start + end > self.data.len() || start > end {
            return Err(DecodeError::InvalidHeader("column range").into());
        }

        Ok(self.data.slice(data_start + start..data_start + end))
    }

    /// A single column's bytes.
    pub fn column(&self, i: usize) -> Result<Slice> {
        self.column_range(i, 1)
    }

    /// A column interpreted as a little-endian integer of up to 8 bytes.
    pub fn column_u64(&self, i: usize) -> Result<u64> {
        let column = self.column(i)?;
        if column.len() > 8 {
            return Err(DecodeError::InvalidHeader("u64 column").into());
        }

        let mut buf = [0u8; 8];
        buf[..column.len()].copy_from_slice(&column);
        Ok(u64::from_le_bytes(buf))
    }

    /// The packed entry bytes.
    #[must_use]
    pub fn bytes(&self) -> &Slice {
        &self.data
    }
}
