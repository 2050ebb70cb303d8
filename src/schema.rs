// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table schemas: primary key, secondary indexes, table type, compression.
//!
//! A schema is validated against the canonical encoding stored in the table
//! root, so two transactions can never open the same table with diverging
//! definitions.

use crate::builder::TableValueReader;
use crate::coding::{Encode, EncodeError};
use crate::slice::Slice;
use crate::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Extraction rule of a variable-key index.
#[derive(Clone, Copy)]
pub enum IndexExtractor {
    /// The contiguous slice covering `count` columns starting at `first`.
    ColumnRange {
        /// First column of the indexed range.
        first: usize,
        /// Number of columns in the indexed range.
        count: usize,
    },

    /// A caller-supplied extraction function.
    Custom(fn(&TableValueReader) -> Result<Slice>),
}

/// A variable-key index definition (primary or secondary).
#[derive(Clone)]
pub struct IndexDef {
    name: String,
    extractor: IndexExtractor,
    global: bool,
}

impl IndexDef {
    /// An index over a contiguous range of columns.
    #[must_use]
    pub fn by_column_range(name: &str, first: usize, count: usize) -> Self {
        Self {
            name: name.to_owned(),
            extractor: IndexExtractor::ColumnRange { first, count },
            global: false,
        }
    }

    /// An index with a custom extraction function.
    #[must_use]
    pub fn custom(name: &str, extractor: fn(&TableValueReader) -> Result<Slice>) -> Self {
        Self {
            name: name.to_owned(),
            extractor: IndexExtractor::Custom(extractor),
            global: false,
        }
    }

    /// Stores the index under the transaction root instead of the table
    /// root, sharing it across tables of compatible schema.
    #[must_use]
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// The index's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the index lives under the transaction root.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Extracts this index's key slice from an entry.
    pub fn extract(&self, reader: &TableValueReader) -> Result<Slice> {
        match self.extractor {
            IndexExtractor::ColumnRange { first, count } => reader.column_range(first, count),
            IndexExtractor::Custom(f) => f(reader),
        }
    }
}

impl Encode for IndexDef {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_all(self.name.as_bytes())?;

        match self.extractor {
            IndexExtractor::ColumnRange { first, count } => {
                writer.write_u8(1)?;
                writer.write_u16::<LittleEndian>(first as u16)?;
                writer.write_u16::<LittleEndian>(count as u16)?;
            }
            // the function itself has no canonical form; the name pins it
            IndexExtractor::Custom(_) => writer.write_u8(2)?,
        }

        writer.write_u8(u8::from(self.global))?;
        Ok(())
    }
}

/// A fixed-size (64-bit key) index definition. Keys are unique.
#[derive(Clone)]
pub struct FixedIndexDef {
    name: String,
    column: usize,
    global: bool,
}

impl FixedIndexDef {
    /// An index over one column interpreted as a little-endian 64-bit key.
    #[must_use]
    pub fn by_column(name: &str, column: usize) -> Self {
        Self {
            name: name.to_owned(),
            column,
            global: false,
        }
    }

    /// Stores the index under the transaction root instead of the table root.
    #[must_use]
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// The index's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the index lives under the transaction root.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Extracts this index's 64-bit key from an entry.
    pub fn key_of(&self, reader: &TableValueReader) -> Result<u64> {
        reader.column_u64(self.column)
    }
}

impl Encode for FixedIndexDef {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_u16::<LittleEndian>(self.column as u16)?;
        writer.write_u8(u8::from(self.global))?;
        Ok(())
    }
}

/// Declarative description of a table.
#[derive(Clone)]
pub struct TableSchema {
    name: String,
    table_type: u8,
    compressed: bool,
    primary: Option<IndexDef>,
    indexes: Vec<IndexDef>,
    fixed_indexes: Vec<FixedIndexDef>,
}

impl TableSchema {
    /// Starts a schema for the named table.
    #[must_use]
    pub fn new(name: &str, table_type: u8) -> Self {
        Self {
            name: name.to_owned(),
            table_type,
            compressed: false,
            primary: None,
            indexes: Vec::new(),
            fixed_indexes: Vec::new(),
        }
    }

    /// Enables per-section dictionary compression for this table.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Sets the primary (unique, variable-key) index.
    #[must_use]
    pub fn primary(mut self, index: IndexDef) -> Self {
        self.primary = Some(index);
        self
    }

    /// Adds a secondary variable-key index (duplicates allowed).
    #[must_use]
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a fixed-size-key secondary index (keys unique).
    #[must_use]
    pub fn with_fixed_index(mut self, index: FixedIndexDef) -> Self {
        self.fixed_indexes.push(index);
        self
    }

    /// The table's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table-type byte stamped into sections and overflow headers.
    #[must_use]
    pub fn table_type(&self) -> u8 {
        self.table_type
    }

    /// Whether entries are dictionary-compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The primary index; every table of this engine declares one.
    pub fn primary_index(&self) -> Result<&IndexDef> {
        self.primary
            .as_ref()
            .ok_or(Error::MissingStructure("primary index"))
    }

    /// Declared secondary variable-key indexes.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Declared fixed-size-key indexes.
    #[must_use]
    pub fn fixed_indexes(&self) -> &[FixedIndexDef] {
        &self.fixed_indexes
    }

    /// Looks up a secondary variable-key index by name.
    pub fn index(&self, name: &str) -> Result<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.name() == name)
            .ok_or(Error::MissingStructure("secondary index"))
    }

    /// Looks up a fixed-size-key index by name.
    pub fn fixed_index(&self, name: &str) -> Result<&FixedIndexDef> {
        self.fixed_indexes
            .iter()
            .find(|i| i.name() == name)
            .ok_or(Error::MissingStructure("fixed-size index"))
    }
}

impl Encode for TableSchema {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(1)?; // format version

        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_u8(self.table_type)?;
        writer.write_u8(u8::from(self.compressed))?;

        match &self.primary {
            Some(primary) => {
                writer.write_u8(1)?;
                primary.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }

        writer.write_u16::<LittleEndian>(self.indexes.len() as u16)?;
        for index in &self.indexes {
            index.encode_into(writer)?;
        }

        writer.write_u16::<LittleEndian>(self.fixed_indexes.len() as u16)?;
        for index in &self.fixed_indexes {
            index.encode_into(writer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::Encode;

    fn sample() -> TableSchema {
        TableSchema::new("docs", 3)
            .compressed(true)
            .primary(IndexDef::by_column_range("by-key", 0, 1))
            .with_index(IndexDef::by_column_range("by-collection", 1, 2))
            .with_fixed_index(FixedIndexDef::by_column("by-etag", 3))
    }

    #[test]
    fn canonical_encoding_is_stable() {
        assert_eq!(sample().encode_into_vec(), sample().encode_into_vec());
    }

    #[test]
    fn encoding_distinguishes_schemas() {
        let other = sample().compressed(false);
        assert_ne!(sample().encode_into_vec(), other.encode_into_vec());

        let renamed = TableSchema::new("docs2", 3)
            .compressed(true)
            .primary(IndexDef::by_column_range("by-key", 0, 1));
        assert_ne!(sample().encode_into_vec(), renamed.encode_into_vec());
    }
}
