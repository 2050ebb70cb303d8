// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Seek families over primary, secondary and fixed-size indexes.
//!
//! Iterators hold no locks beyond the enclosing transaction and re-seek the
//! underlying trees on every step, so they stay correct when the caller
//! mutates the table between steps.

use super::{id_from_bytes, Table, TableEntry};
use crate::env::btree::TreeCursor;
use crate::env::fixed_tree::FixedTreeCursor;
use crate::Result;

/// Iterator over entries in primary-key order.
pub struct PrimaryIter<'a, 'tx, 'env> {
    table: &'a Table<'tx, 'env>,
    cursor: TreeCursor<'tx, 'env>,
    skip: usize,
}

impl Iterator for PrimaryIter<'_, '_, '_> {
    type Item = Result<TableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, id_bytes) = match self.cursor.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e)),
            };

            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }

            let id = match id_from_bytes(&id_bytes) {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };

            return Some(self.table.value_reader(id).map(|reader| TableEntry { id, reader }));
        }
    }
}

/// Iterator over entries grouped by a secondary index's value; within one
/// value, ids ascend (or descend for backward scans).
pub struct SecondaryIndexIter<'a, 'tx, 'env> {
    table: &'a Table<'tx, 'env>,
    outer: TreeCursor<'tx, 'env>,
    inner: Option<FixedTreeCursor<'tx, 'env>>,
    backward: bool,
    skip: usize,
}

impl Iterator for SecondaryIndexIter<'_, '_, '_> {
    type Item = Result<TableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inner) = &mut self.inner {
                match inner.next() {
                    Some(Ok((id, _))) => {
                        if self.skip > 0 {
                            self.skip -= 1;
                            continue;
                        }
                        return Some(
                            self.table.value_reader(id).map(|reader| TableEntry { id, reader }),
                        );
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.inner = None,
                }
                continue;
            }

            let (_, nested_id) = match self.outer.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e)),
            };
            let nested_id = match id_from_bytes(&nested_id) {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };

            let nested = self.table.tx.fixed_tree(nested_id);
            self.inner = Some(if self.backward {
                nested.iter_backward()
            } else {
                nested.iter()
            });
        }
    }
}

/// Iterator over entries in fixed-size-index key order.
pub struct FixedIndexIter<'a, 'tx, 'env> {
    table: &'a Table<'tx, 'env>,
    cursor: FixedTreeCursor<'tx, 'env>,
    skip: usize,
}

impl Iterator for FixedIndexIter<'_, '_, '_> {
    type Item = Result<TableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, id_bytes) = match self.cursor.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e)),
            };

            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }

            let id = match id_from_bytes(&id_bytes) {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };

            return Some(self.table.value_reader(id).map(|reader| TableEntry { id, reader }));
        }
    }
}

impl<'tx, 'env> Table<'tx, 'env> {
    /// Scans the primary index forward from `from` (inclusive). With
    /// `starts_with`, the scan is bounded to keys prefixed by `from`.
    pub fn seek_by_primary<'a>(
        &'a self,
        from: &[u8],
        starts_with: bool,
        skip: usize,
    ) -> Result<PrimaryIter<'a, 'tx, 'env>> {
        let tree = self.primary_tree()?;
        let mut cursor = tree.seek(from, false, false);
        if starts_with {
            cursor = cursor.with_prefix(from);
        }

        Ok(PrimaryIter {
            table: self,
            cursor,
            skip,
        })
    }

    /// Scans the primary index backward, starting at `from` (or the last key
    /// when `None`). `exclude_value` drops the starting key itself, for
    /// upper-bounded scans.
    pub fn seek_backward_by_primary<'a>(
        &'a self,
        from: Option<&[u8]>,
        exclude_value: bool,
    ) -> Result<PrimaryIter<'a, 'tx, 'env>> {
        let tree = self.primary_tree()?;
        let cursor = match from {
            Some(from) => tree.seek(from, true, exclude_value),
            None => tree.iter_backward(),
        };

        Ok(PrimaryIter {
            table: self,
            cursor,
            skip: 0,
        })
    }

    /// The first entry at or after `from` in primary-key order.
    pub fn seek_one_by_primary(&self, from: &[u8]) -> Result<Option<TableEntry>> {
        self.seek_by_primary(from, false, 0)?.next().transpose()
    }

    /// Scans a secondary index forward from `value` (inclusive). With
    /// `starts_with`, only index keys prefixed by `value` are visited.
    pub fn seek_forward_from<'a>(
        &'a self,
        index: &str,
        value: &[u8],
        starts_with: bool,
        skip: usize,
    ) -> Result<SecondaryIndexIter<'a, 'tx, 'env>> {
        let index = self.schema.index(index)?;
        let tree = self.index_tree(index)?;

        let mut cursor = tree.seek(value, false, false);
        if starts_with {
            cursor = cursor.with_prefix(value);
        }

        Ok(SecondaryIndexIter {
            table: self,
            outer: cursor,
            inner: None,
            backward: false,
            skip,
        })
    }

    /// Scans a secondary index backward, starting at `value` (or the last
    /// key when `None`). `exclude_value` drops the starting key's group.
    pub fn seek_backward_from<'a>(
        &'a self,
        index: &str,
        value: Option<&[u8]>,
        exclude_value: bool,
    ) -> Result<SecondaryIndexIter<'a, 'tx, 'env>> {
        let index = self.schema.index(index)?;
        let tree = self.index_tree(index)?;

        let cursor = match value {
            Some(value) => tree.seek(value, true, exclude_value),
            None => tree.iter_backward(),
        };

        Ok(SecondaryIndexIter {
            table: self,
            outer: cursor,
            inner: None,
            backward: true,
            skip: 0,
        })
    }

    /// The first entry whose index key is at or after `value`.
    pub fn seek_one_forward_from(&self, index: &str, value: &[u8]) -> Result<Option<TableEntry>> {
        self.seek_forward_from(index, value, false, 0)?
            .next()
            .transpose()
    }

    /// Scans a fixed-size index forward from `from` (inclusive).
    pub fn seek_forward_by_fixed<'a>(
        &'a self,
        index: &str,
        from: u64,
        skip: usize,
    ) -> Result<FixedIndexIter<'a, 'tx, 'env>> {
        let index = self.schema.fixed_index(index)?;
        let tree = self.fixed_index_tree(index)?;

        Ok(FixedIndexIter {
            table: self,
            cursor: tree.seek(from, false, false),
            skip,
        })
    }

    /// Scans a fixed-size index backward, starting at `from` (or the largest
    /// key when `None`). `exclude_value` drops the starting key itself.
    pub fn seek_backward_by_fixed<'a>(
        &'a self,
        index: &str,
        from: Option<u64>,
        exclude_value: bool,
    ) -> Result<FixedIndexIter<'a, 'tx, 'env>> {
        let index = self.schema.fixed_index(index)?;
        let tree = self.fixed_index_tree(index)?;

        let cursor = match from {
            Some(from) => tree.seek(from, true, exclude_value),
            None => tree.iter_backward(),
        };

        Ok(FixedIndexIter {
            table: self,
            cursor,
            skip: 0,
        })
    }

    /// Collects the storage ids a secondary index maps `value` to, in
    /// ascending order. Mostly useful for diagnostics and tests.
    pub fn ids_for_index_value(&self, index: &str, value: &[u8]) -> Result<Vec<u64>> {
        let index = self.schema.index(index)?;
        let tree = self.index_tree(index)?;

        let Some(nested) = self.nested_ids_tree(&tree, value, false)? else {
            return Ok(Vec::new());
        };

        nested.iter().map(|kv| kv.map(|(id, _)| id)).collect()
    }
}
