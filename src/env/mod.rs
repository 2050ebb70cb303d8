// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The paged storage environment the table engine runs on.
//!
//! Storage is organized as *page runs*: contiguous spans of fixed-size pages
//! allocated and freed as a unit. On top of the runs live named and anonymous
//! trees (variable-key B-trees and fixed-size trees) holding table roots and
//! indexes.
//!
//! Concurrency model: single writer, many readers. The committed state is an
//! immutable snapshot behind an `Arc`; a write transaction works on a private
//! copy (values are `Arc`-shared, so the copy is cheap and copy-on-write) and
//! publishes it atomically on commit. Dropping a write transaction without
//! committing discards every mutation.

pub mod btree;
pub mod fixed_tree;

use crate::{dictionary::DictionaryHolder, slice::Slice, Error, Result};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use btree::Tree;
pub use fixed_tree::FixedTree;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Identifies a page within the environment.
pub type PageNumber = u64;

/// Identifies a tree within the environment.
pub type TreeId = u64;

/// Flags carried by a page run.
pub mod page_flags {
    /// The run is a multi-page overflow allocation.
    pub const OVERFLOW: u8 = 1;
    /// The run holds raw table data (section or overflow entry).
    pub const RAW_DATA: u8 = 2;
    /// The run's payload is compressed.
    pub const COMPRESSED: u8 = 4;
}

/// A contiguous allocation of one or more pages.
#[derive(Clone)]
pub(crate) struct PageRun {
    pub flags: u8,
    pub pages: u64,
    pub data: Arc<Vec<u8>>,
}

/// Read-only view of a page run.
pub(crate) struct RunRef {
    pub start: PageNumber,
    pub flags: u8,
    pub pages: u64,
    pub data: Arc<Vec<u8>>,
}

impl RunRef {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Clone)]
pub(crate) enum TreeData {
    Variable(BTreeMap<Slice, Slice>),
    Fixed {
        value_size: usize,
        entries: BTreeMap<u64, Slice>,
    },
}

#[derive(Clone)]
pub(crate) struct EnvState {
    pub runs: BTreeMap<PageNumber, PageRun>,
    pub free_runs: BTreeMap<PageNumber, u64>,
    pub next_page: PageNumber,
    pub trees: BTreeMap<TreeId, Arc<TreeData>>,
    pub catalog: BTreeMap<String, TreeId>,
    pub next_tree: TreeId,
}

impl EnvState {
    fn initial() -> Self {
        // page 0 and tree 0 stay unused so that neither a storage id of 0
        // nor a tree id of 0 can name real data
        Self {
            runs: BTreeMap::new(),
            free_runs: BTreeMap::new(),
            next_page: 1,
            trees: BTreeMap::new(),
            catalog: BTreeMap::new(),
            next_tree: 1,
        }
    }
}

/// A storage environment holding committed state and serializing writers.
pub struct Environment {
    state: parking_lot::RwLock<Arc<EnvState>>,
    writer: parking_lot::Mutex<()>,
    dictionaries: DictionaryHolder,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(Arc::new(EnvState::initial())),
            writer: parking_lot::Mutex::new(()),
            dictionaries: DictionaryHolder::new(),
        }
    }

    /// Begins a read-only snapshot transaction.
    #[must_use]
    pub fn read_txn(&self) -> Transaction<'_> {
        let snapshot = self.state.read().clone();
        Transaction {
            env: self,
            state: RefCell::new((*snapshot).clone()),
            writable: false,
            _writer: None,
        }
    }

    /// Begins a read-write transaction, blocking until any other writer
    /// finishes.
    #[must_use]
    pub fn write_txn(&self) -> Transaction<'_> {
        let guard = self.writer.lock();
        let snapshot = self.state.read().clone();
        Transaction {
            env: self,
            state: RefCell::new((*snapshot).clone()),
            writable: true,
            _writer: Some(guard),
        }
    }

    /// The process-wide dictionary cache.
    #[must_use]
    pub fn dictionaries(&self) -> &DictionaryHolder {
        &self.dictionaries
    }
}

/// A transaction over the environment.
///
/// Obtained from [`Environment::read_txn`] or [`Environment::write_txn`].
/// All mutation is buffered privately; [`Transaction::commit`] publishes it.
pub struct Transaction<'env> {
    env: &'env Environment,
    state: RefCell<EnvState>,
    writable: bool,
    _writer: Option<parking_lot::MutexGuard<'env, ()>>,
}

impl<'env> Transaction<'env> {
    /// Whether this transaction may mutate the environment.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The process-wide dictionary cache.
    #[must_use]
    pub fn dictionaries(&self) -> &'env DictionaryHolder {
        &self.env.dictionaries
    }

    /// Publishes this transaction's state as the new committed state.
    pub fn commit(self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnlyTransaction);
        }

        *self.env.state.write() = Arc::new(self.state.into_inner());
        Ok(())
    }

    pub(crate) fn state(&self) -> Ref<'_, EnvState> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> Result<RefMut<'_, EnvState>> {
        if !self.writable {
            return Err(Error::ReadOnlyTransaction);
        }
        Ok(self.state.borrow_mut())
    }

    // --- page runs ---

    /// Allocates `pages` contiguous zeroed pages, returning the first page
    /// number. Freed runs of the exact same length are reused.
    pub fn allocate_run(&self, pages: u64, flags: u8) -> Result<PageNumber> {
        debug_assert!(pages > 0);

        let mut state = self.state_mut()?;

        let reusable = state
            .free_runs
            .iter()
            .find(|(_, len)| **len == pages)
            .map(|(start, _)| *start);

        let start = if let Some(start) = reusable {
            state.free_runs.remove(&start);
            start
        } else {
            let start = state.next_page;
            state.next_page += pages;
            start
        };

        state.runs.insert(
            start,
            PageRun {
                flags,
                pages,
                data: Arc::new(vec![0; pages as usize * PAGE_SIZE]),
            },
        );

        Ok(start)
    }

    /// Frees the run starting at `start`.
    pub fn free_run(&self, start: PageNumber) -> Result<()> {
        let mut state = self.state_mut()?;

        let Some(run) = state.runs.remove(&start) else {
            return Err(Error::PageNotFound(start));
        };
        state.free_runs.insert(start, run.pages);

        Ok(())
    }

    /// Replaces the flags of the run starting at `start`.
    pub(crate) fn set_run_flags(&self, start: PageNumber, flags: u8) -> Result<()> {
        let mut state = self.state_mut()?;

        let Some(run) = state.runs.get_mut(&start) else {
            return Err(Error::PageNotFound(start));
        };
        run.flags = flags;

        Ok(())
    }

    /// Resolves the run containing `page` (not necessarily its first page).
    pub(crate) fn run_containing(&self, page: PageNumber) -> Result<RunRef> {
        let state = self.state();

        let Some((start, run)) = state.runs.range(..=page).next_back() else {
            return Err(Error::PageNotFound(page));
        };
        if start + run.pages <= page {
            return Err(Error::PageNotFound(page));
        }

        Ok(RunRef {
            start: *start,
            flags: run.flags,
            pages: run.pages,
            data: run.data.clone(),
        })
    }

    /// Mutable access to the bytes of the run containing `page`. The closure
    /// receives the run's first page number and its full byte span.
    pub(crate) fn modify_run<R>(
        &self,
        page: PageNumber,
        f: impl FnOnce(PageNumber, &mut [u8]) -> R,
    ) -> Result<R> {
        let mut state = self.state_mut()?;

        let start = {
            let Some((start, run)) = state.runs.range(..=page).next_back() else {
                return Err(Error::PageNotFound(page));
            };
            if start + run.pages <= page {
                return Err(Error::PageNotFound(page));
            }
            *start
        };

        let run = state
            .runs
            .get_mut(&start)
            .ok_or(Error::PageNotFound(page))?;

        let bytes = Arc::make_mut(&mut run.data);
        Ok(f(start, bytes))
    }

    // --- trees ---

    fn register_tree(state: &mut EnvState, data: TreeData) -> TreeId {
        let id = state.next_tree;
        state.next_tree += 1;
        state.trees.insert(id, Arc::new(data));
        id
    }

    /// Opens the named variable-key tree, creating it if missing.
    pub fn create_tree(&self, name: &str) -> Result<Tree<'_, 'env>> {
        if let Some(tree) = self.open_tree(name) {
            return Ok(tree);
        }

        let mut state = self.state_mut()?;
        let id = Self::register_tree(&mut state, TreeData::Variable(BTreeMap::new()));
        state.catalog.insert(name.to_owned(), id);

        Ok(Tree { tx: self, id })
    }

    /// Opens the named variable-key tree if it exists.
    #[must_use]
    pub fn open_tree(&self, name: &str) -> Option<Tree<'_, 'env>> {
        let id = *self.state().catalog.get(name)?;
        Some(Tree { tx: self, id })
    }

    /// Opens the named fixed-size tree, creating it if missing.
    pub fn create_fixed_tree(&self, name: &str, value_size: usize) -> Result<FixedTree<'_, 'env>> {
        if let Some(tree) = self.open_fixed_tree(name) {
            return Ok(tree);
        }

        let mut state = self.state_mut()?;
        let id = Self::register_tree(
            &mut state,
            TreeData::Fixed {
                value_size,
                entries: BTreeMap::new(),
            },
        );
        state.catalog.insert(name.to_owned(), id);

        Ok(FixedTree { tx: self, id })
    }

    /// Opens the named fixed-size tree if it exists.
    #[must_use]
    pub fn open_fixed_tree(&self, name: &str) -> Option<FixedTree<'_, 'env>> {
        let id = *self.state().catalog.get(name)?;
        Some(FixedTree { tx: self, id })
    }

    /// Creates an anonymous variable-key tree, returning its id.
    pub fn create_anonymous_tree(&self) -> Result<TreeId> {
        let mut state = self.state_mut()?;
        Ok(Self::register_tree(
            &mut state,
            TreeData::Variable(BTreeMap::new()),
        ))
    }

    /// Creates an anonymous fixed-size tree, returning its id.
    pub fn create_anonymous_fixed_tree(&self, value_size: usize) -> Result<TreeId> {
        let mut state = self.state_mut()?;
        Ok(Self::register_tree(
            &mut state,
            TreeData::Fixed {
                value_size,
                entries: BTreeMap::new(),
            },
        ))
    }

    /// A handle to the variable-key tree with the given id.
    #[must_use]
    pub fn tree(&self, id: TreeId) -> Tree<'_, 'env> {
        Tree { tx: self, id }
    }

    /// A handle to the fixed-size tree with the given id.
    #[must_use]
    pub fn fixed_tree(&self, id: TreeId) -> FixedTree<'_, 'env> {
        FixedTree { tx: self, id }
    }

    /// Removes a (typically anonymous) tree from the environment.
    pub fn delete_tree(&self, id: TreeId) -> Result<()> {
        let mut state = self.state_mut()?;

        if state.trees.remove(&id).is_none() {
            return Err(Error::MissingStructure("tree"));
        }

        Ok(())
    }
}
