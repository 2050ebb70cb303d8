// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Transaction, TreeData, TreeId};
use crate::{slice::Slice, Error, Result};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

/// An ordered tree with 64-bit keys and fixed-width payloads.
///
/// The payload width is set at creation (0 for set semantics, 8 for storage
/// ids here) and enforced on every insert.
#[derive(Clone, Copy)]
pub struct FixedTree<'tx, 'env> {
    pub(crate) tx: &'tx Transaction<'env>,
    pub(crate) id: TreeId,
}

impl<'tx, 'env> FixedTree<'tx, 'env> {
    /// This tree's id.
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.id
    }

    fn with_map<R>(&self, f: impl FnOnce(&BTreeMap<u64, Slice>) -> R) -> Result<R> {
        let state = self.tx.state();

        match state.trees.get(&self.id).map(Arc::as_ref) {
            Some(TreeData::Fixed { entries, .. }) => Ok(f(entries)),
            Some(TreeData::Variable(_)) => Err(Error::MissingStructure("fixed-size tree")),
            None => Err(Error::MissingStructure("tree")),
        }
    }

    fn with_map_mut<R>(
        &self,
        value_len: Option<usize>,
        f: impl FnOnce(&mut BTreeMap<u64, Slice>) -> R,
    ) -> Result<R> {
        let mut state = self.tx.state_mut()?;

        let Some(data) = state.trees.get_mut(&self.id) else {
            return Err(Error::MissingStructure("tree"));
        };

        match Arc::make_mut(data) {
            TreeData::Fixed {
                value_size,
                entries,
            } => {
                if let Some(len) = value_len {
                    debug_assert_eq!(*value_size, len, "fixed tree payload width violated");
                }
                Ok(f(entries))
            }
            TreeData::Variable(_) => Err(Error::MissingStructure("fixed-size tree")),
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: u64) -> Result<Option<Slice>> {
        self.with_map(|map| map.get(&key).cloned())
    }

    /// Whether the key is present.
    pub fn contains(&self, key: u64) -> Result<bool> {
        self.with_map(|map| map.contains_key(&key))
    }

    /// Inserts a key, overwriting any existing payload.
    pub fn insert(&self, key: u64, value: &[u8]) -> Result<()> {
        self.with_map_mut(Some(value.len()), |map| {
            map.insert(key, Slice::new(value));
        })
    }

    /// Inserts a key only if it is absent. Returns whether it was inserted.
    pub fn try_insert(&self, key: u64, value: &[u8]) -> Result<bool> {
        self.with_map_mut(Some(value.len()), |map| {
            if map.contains_key(&key) {
                false
            } else {
                map.insert(key, Slice::new(value));
                true
            }
        })
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: u64) -> Result<bool> {
        self.with_map_mut(None, |map| map.remove(&key).is_some())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u64> {
        self.with_map(|map| map.len() as u64)
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        self.with_map(BTreeMap::is_empty)
    }

    /// The smallest key.
    pub fn first(&self) -> Result<Option<(u64, Slice)>> {
        self.with_map(|map| map.iter().next().map(|(k, v)| (*k, v.clone())))
    }

    /// The largest key.
    pub fn last(&self) -> Result<Option<(u64, Slice)>> {
        self.with_map(|map| map.iter().next_back().map(|(k, v)| (*k, v.clone())))
    }

    /// Forward iteration from the smallest key.
    #[must_use]
    pub fn iter(&self) -> FixedTreeCursor<'tx, 'env> {
        FixedTreeCursor {
            tree: *self,
            backward: false,
            exclude_start: false,
            start: None,
            pos: None,
            done: false,
        }
    }

    /// Backward iteration from the largest key.
    #[must_use]
    pub fn iter_backward(&self) -> FixedTreeCursor<'tx, 'env> {
        FixedTreeCursor {
            tree: *self,
            backward: true,
            exclude_start: false,
            start: None,
            pos: None,
            done: false,
        }
    }

    /// Iteration starting at `key` (inclusive unless `exclude_start`),
    /// forward or backward.
    #[must_use]
    pub fn seek(&self, key: u64, backward: bool, exclude_start: bool) -> FixedTreeCursor<'tx, 'env> {
        FixedTreeCursor {
            tree: *self,
            backward,
            exclude_start,
            start: Some(key),
            pos: None,
            done: false,
        }
    }
}

/// Cursor over a [`FixedTree`]; re-seeks from the last yielded key on every
/// step, so mutation during iteration is well-defined.
pub struct FixedTreeCursor<'tx, 'env> {
    tree: FixedTree<'tx, 'env>,
    backward: bool,
    exclude_start: bool,
    start: Option<u64>,
    pos: Option<u64>,
    done: bool,
}

impl FixedTreeCursor<'_, '_> {
    fn step(&self) -> Result<Option<(u64, Slice)>> {
        self.tree.with_map(|map| {
            let found = if let Some(pos) = self.pos {
                if self.backward {
                    map.range((Unbounded, Excluded(pos))).next_back()
                } else {
                    map.range((Excluded(pos), Unbounded)).next()
                }
            } else {
                match (self.start, self.backward) {
                    (None, false) => map.iter().next(),
                    (None, true) => map.iter().next_back(),
                    (Some(start), false) => {
                        let lower = if self.exclude_start {
                            Excluded(start)
                        } else {
                            Included(start)
                        };
                        map.range((lower, Unbounded)).next()
                    }
                    (Some(start), true) => {
                        let upper = if self.exclude_start {
                            Excluded(start)
                        } else {
                            Included(start)
                        };
                        map.range((Unbounded, upper)).next_back()
                    }
                }
            };

            found.map(|(k, v)| (*k, v.clone()))
        })
    }
}

impl Iterator for FixedTreeCursor<'_, '_> {
    type Item = Result<(u64, Slice)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some((key, value))) => {
                self.pos = Some(key);
                Some(Ok((key, value)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Environment, Result};

    #[test]
    fn keys_iterate_in_numeric_order() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();

        let id = tx.create_anonymous_fixed_tree(0)?;
        let tree = tx.fixed_tree(id);

        tree.insert(300, b"")?;
        tree.insert(2, b"")?;
        tree.insert(1000, b"")?;

        let keys = tree
            .iter()
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(vec![2, 300, 1000], keys);

        Ok(())
    }

    #[test]
    fn backward_seek_excluding_upper_bound() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();

        let id = tx.create_anonymous_fixed_tree(8)?;
        let tree = tx.fixed_tree(id);

        for k in [10u64, 20, 30] {
            tree.insert(k, &k.to_le_bytes())?;
        }

        let keys = tree
            .seek(30, true, true)
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(vec![20, 10], keys);

        Ok(())
    }

    #[test]
    fn try_insert_enforces_uniqueness() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();

        let id = tx.create_anonymous_fixed_tree(8)?;
        let tree = tx.fixed_tree(id);

        assert!(tree.try_insert(7, &1u64.to_le_bytes())?);
        assert!(!tree.try_insert(7, &2u64.to_le_bytes())?);
        assert_eq!(1u64.to_le_bytes(), &*tree.get(7)?.expect("present"));

        Ok(())
    }
}
