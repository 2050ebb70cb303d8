// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Transaction, TreeData, TreeId};
use crate::{slice::Slice, Error, Result};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

/// A variable-key ordered tree mapping byte strings to byte strings.
///
/// Handles are cheap; all state lives in the transaction.
#[derive(Clone, Copy)]
pub struct Tree<'tx, 'env> {
    pub(crate) tx: &'tx Transaction<'env>,
    pub(crate) id: TreeId,
}

impl<'tx, 'env> Tree<'tx, 'env> {
    /// This tree's id.
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.id
    }

    fn with_map<R>(&self, f: impl FnOnce(&BTreeMap<Slice, Slice>) -> R) -> Result<R> {
        let state = self.tx.state();

        match state.trees.get(&self.id).map(Arc::as_ref) {
            Some(TreeData::Variable(map)) => Ok(f(map)),
            Some(TreeData::Fixed { .. }) => Err(Error::MissingStructure("variable tree")),
            None => Err(Error::MissingStructure("tree")),
        }
    }

    fn with_map_mut<R>(&self, f: impl FnOnce(&mut BTreeMap<Slice, Slice>) -> R) -> Result<R> {
        let mut state = self.tx.state_mut()?;

        let Some(data) = state.trees.get_mut(&self.id) else {
            return Err(Error::MissingStructure("tree"));
        };

        match Arc::make_mut(data) {
            TreeData::Variable(map) => Ok(f(map)),
            TreeData::Fixed { .. } => Err(Error::MissingStructure("variable tree")),
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Slice>> {
        self.with_map(|map| map.get(key).cloned())
    }

    /// Inserts a key, overwriting any existing value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_map_mut(|map| {
            map.insert(Slice::new(key), Slice::new(value));
        })
    }

    /// Inserts a key only if it is absent. Returns whether it was inserted;
    /// an existing value is left untouched.
    pub fn try_insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.with_map_mut(|map| {
            if map.contains_key(key) {
                false
            } else {
                map.insert(Slice::new(key), Slice::new(value));
                true
            }
        })
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.with_map_mut(|map| map.remove(key).is_some())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u64> {
        self.with_map(|map| map.len() as u64)
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        self.with_map(BTreeMap::is_empty)
    }

    /// The lexicographically first entry.
    pub fn first(&self) -> Result<Option<(Slice, Slice)>> {
        self.with_map(|map| map.iter().next().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// The lexicographically last entry.
    pub fn last(&self) -> Result<Option<(Slice, Slice)>> {
        self.with_map(|map| map.iter().next_back().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Forward iteration over the whole tree.
    #[must_use]
    pub fn iter(&self) -> TreeCursor<'tx, 'env> {
        TreeCursor {
            tree: *self,
            backward: false,
            exclude_start: false,
            start: None,
            prefix: None,
            pos: None,
            done: false,
        }
    }

    /// Iteration starting at `key` (inclusive unless `exclude_start`),
    /// forward or backward.
    #[must_use]
    pub fn seek(&self, key: &[u8], backward: bool, exclude_start: bool) -> TreeCursor<'tx, 'env> {
        TreeCursor {
            tree: *self,
            backward,
            exclude_start,
            start: Some(Slice::new(key)),
            prefix: None,
            pos: None,
            done: false,
        }
    }

    /// Backward iteration from the last entry.
    #[must_use]
    pub fn iter_backward(&self) -> TreeCursor<'tx, 'env> {
        TreeCursor {
            tree: *self,
            backward: true,
            exclude_start: false,
            start: None,
            prefix: None,
            pos: None,
            done: false,
        }
    }

    /// Forward iteration over all keys starting with `prefix`.
    #[must_use]
    pub fn prefix(&self, prefix: &[u8]) -> TreeCursor<'tx, 'env> {
        TreeCursor {
            tree: *self,
            backward: false,
            exclude_start: false,
            start: Some(Slice::new(prefix)),
            prefix: Some(Slice::new(prefix)),
            pos: None,
            done: false,
        }
    }
}

/// Cursor over a [`Tree`].
///
/// Every step re-seeks from the last yielded key, so interleaving deletes
/// (or any other mutation) with iteration is well-defined.
pub struct TreeCursor<'tx, 'env> {
    tree: Tree<'tx, 'env>,
    backward: bool,
    exclude_start: bool,
    start: Option<Slice>,
    prefix: Option<Slice>,
    pos: Option<Slice>,
    done: bool,
}

impl TreeCursor<'_, '_> {
    /// Restricts iteration to keys starting with `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = Some(Slice::new(prefix));
        self
    }

    fn step(&self) -> Result<Option<(Slice, Slice)>> {
        self.tree.with_map(|map| {
            let found = if let Some(pos) = &self.pos {
                if self.backward {
                    map.range::<[u8], _>((Unbounded, Excluded(&**pos))).next_back()
                } else {
                    map.range::<[u8], _>((Excluded(&**pos), Unbounded)).next()
                }
            } else {
                match (&self.start, self.backward) {
                    (None, false) => map.iter().next(),
                    (None, true) => map.iter().next_back(),
                    (Some(start), false) => {
                        let lower = if self.exclude_start {
                            Excluded(&**start)
                        } else {
                            Included(&**start)
                        };
                        map.range::<[u8], _>((lower, Unbounded)).next()
                    }
                    (Some(start), true) => {
                        let upper = if self.exclude_start {
                            Excluded(&**start)
                        } else {
                            Included(&**start)
                        };
                        map.range::<[u8], _>((Unbounded, upper)).next_back()
                    }
                }
            };

            found.map(|(k, v)| (k.clone(), v.clone()))
        })
    }
}

impl Iterator for TreeCursor<'_, '_> {
    type Item = Result<(Slice, Slice)>;

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
                if let Some(prefix) = &self.prefix {
                    if !key.starts_with(prefix) {
                        self.done = true;
                        return None;
                    }
                }
                self.pos = Some(key.clone());
                Some(Ok((key, value)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Environment, Result};

    #[test]
    fn insert_get_delete() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("t")?;

        tree.insert(b"b", b"2")?;
        tree.insert(b"a", b"1")?;
        assert_eq!(2, tree.len()?);
        assert_eq!(b"1", &*tree.get(b"a")?.expect("present"));

        assert!(tree.delete(b"a")?);
        assert!(!tree.delete(b"a")?);
        assert_eq!(1, tree.len()?);

        Ok(())
    }

    #[test]
    fn try_insert_does_not_overwrite() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("t")?;

        assert!(tree.try_insert(b"k", b"old")?);
        assert!(!tree.try_insert(b"k", b"new")?);
        assert_eq!(b"old", &*tree.get(b"k")?.expect("present"));

        Ok(())
    }

    #[test]
    fn cursor_survives_interleaved_deletes() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("t")?;

        for i in 0..10u8 {
            tree.insert(&[i], &[i])?;
        }

        let mut seen = vec![];
        let mut cursor = tree.iter();
        while let Some(item) = cursor.next() {
            let (key, _) = item?;
            seen.push(key[0]);
            // delete the entry we just saw plus the one after it
            tree.delete(&key)?;
            tree.delete(&[key[0] + 1])?;
        }

        assert_eq!(vec![0, 2, 4, 6, 8], seen);
        assert!(tree.is_empty()?);

        Ok(())
    }

    #[test]
    fn prefix_scan_stops_at_boundary() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("t")?;

        tree.insert(b"a/1", b"")?;
        tree.insert(b"a/2", b"")?;
        tree.insert(b"b/1", b"")?;

        let keys = tree
            .prefix(b"a/")
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(2, keys.len());
        assert_eq!(b"a/1", &*keys[0]);
        assert_eq!(b"a/2", &*keys[1]);

        Ok(())
    }

    #[test]
    fn backward_seek_with_exclusion() -> Result<()> {
        let env = Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("t")?;

        tree.insert(b"a", b"")?;
        tree.insert(b"b", b"")?;
        tree.insert(b"c", b"")?;

        let keys = tree
            .seek(b"b", true, true)
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(1, keys.len());
        assert_eq!(b"a", &*keys[0]);

        Ok(())
    }
}
