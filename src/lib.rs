// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A transactional table engine layered on a paged storage environment.
//!
//! ##### About
//!
//! This crate exports a [`Table`] that stores variably-sized entries keyed by
//! a primary key and zero or more secondary indexes. Small entries are packed
//! into multi-page slabs ("raw data sections") that are compacted by
//! relocation; large entries get their own overflow page runs. Tables may
//! enable per-section Zstandard dictionary compression: dictionaries are
//! trained from live data when a section fills up, and every entry remains
//! decodable with the dictionary that encoded it.
//!
//! All access happens inside a [`Transaction`] obtained from an
//! [`Environment`]: one writer at a time, any number of concurrent snapshot
//! readers.
//!
//! # Example usage
//!
//! ```
//! use heap_table::{Environment, IndexDef, Table, TableSchema, TableValueBuilder};
//!
//! let env = Environment::new();
//!
//! let schema = TableSchema::new("people", 1)
//!     .primary(IndexDef::by_column_range("by-name", 0, 1));
//!
//! let tx = env.write_txn();
//! {
//!     let table = Table::open(&tx, &schema)?;
//!
//!     let mut builder = TableValueBuilder::new();
//!     builder.add("alice");
//!     builder.add("engineering");
//!     table.insert(&mut builder)?;
//!
//!     let entry = table.read_by_key(b"alice")?.expect("just inserted");
//!     assert_eq!(b"engineering", &*entry.reader.column(1)?);
//!
//!     table.prepare_for_commit()?;
//! }
//! tx.commit()?;
//! #
//! # Ok::<(), heap_table::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery, clippy::cargo)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod builder;
mod coding;

#[doc(hidden)]
pub mod dictionary;

mod env;
mod error;

#[doc(hidden)]
pub mod hash;

mod schema;

#[doc(hidden)]
pub mod section;

mod slice;

#[doc(hidden)]
pub mod storage_id;

mod table;

pub use {
    builder::{TableValueBuilder, TableValueReader},
    dictionary::{CompressionDictionary, DictionaryHolder},
    env::{
        btree::{Tree, TreeCursor},
        fixed_tree::{FixedTree, FixedTreeCursor},
        Environment, PageNumber, Transaction, TreeId, PAGE_SIZE,
    },
    error::{Error, Result},
    schema::{FixedIndexDef, IndexDef, IndexExtractor, TableSchema},
    section::MAX_ITEM_SIZE,
    slice::Slice,
    table::{
        report::{IndexReport, SectionReport, TableReport},
        seek::{FixedIndexIter, PrimaryIter, SecondaryIndexIter},
        Table, TableEntry,
    },
};
