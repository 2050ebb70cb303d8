// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compression dictionaries and the process-wide dictionary cache.
//!
//! Compressed entries are rendered as `[RAW_LEN: 4][ZSTD FRAME]`; the
//! explicit length lets a reader verify the decode and size its output
//! buffer without trusting the frame header.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::env::Tree;
use crate::hash::{format_dictionary_hash, DictionaryHash, EMPTY_DICTIONARY_HASH};
use crate::slice::Slice;
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Target size of a trained dictionary in bytes.
pub const DICTIONARY_TARGET_SIZE: usize = 4 * 1024;

/// Upper bound on the total size of a training corpus.
pub const TRAINING_CORPUS_CAP: usize = 512 * 1024;

/// Expected ratio advertised by the "no dictionary" sentinel. Ratios are
/// `compressed * 100 / raw` (lower is better), so 101 loses against any
/// observed ratio.
pub const EMPTY_DICTIONARY_RATIO: i32 = 101;

const COMPRESSION_LEVEL: i32 = 3;

const RAW_LEN_PREFIX: usize = 4;

/// `compressed * 100 / raw`; lower is better.
#[must_use]
pub fn compression_ratio(compressed: usize, raw: usize) -> i32 {
    debug_assert!(raw > 0);
    (compressed * 100 / raw) as i32
}

/// Metadata stored in front of the dictionary bytes in the dictionaries tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompressionDictionaryInfo {
    /// Compression ratio the dictionary achieved when it was adopted.
    pub expected_ratio: i32,
}

impl Encode for CompressionDictionaryInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_i32::<LittleEndian>(self.expected_ratio)?;
        Ok(())
    }
}

impl Decode for CompressionDictionaryInfo {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let expected_ratio = reader.read_i32::<LittleEndian>()?;
        Ok(Self { expected_ratio })
    }
}

/// A decoded compression dictionary.
///
/// The all-zero hash maps to the sentinel dictionary, which compresses
/// without any trained dictionary at all.
#[derive(Debug)]
pub struct CompressionDictionary {
    hash: DictionaryHash,
    expected_ratio: i32,
    bytes: Option<Vec<u8>>,
}

impl CompressionDictionary {
    /// The "no dictionary" sentinel.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            hash: EMPTY_DICTIONARY_HASH,
            expected_ratio: EMPTY_DICTIONARY_RATIO,
            bytes: None,
        }
    }

    /// Wraps trained dictionary bytes.
    #[must_use]
    pub fn new(hash: DictionaryHash, expected_ratio: i32, bytes: Vec<u8>) -> Self {
        Self {
            hash,
            expected_ratio,
            bytes: Some(bytes),
        }
    }

    /// Whether this is the sentinel (no trained dictionary).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_none()
    }

    /// The dictionary's 32-byte hash (all-zero for the sentinel).
    #[must_use]
    pub fn hash(&self) -> &DictionaryHash {
        &self.hash
    }

    /// Compression ratio this dictionary achieved when adopted.
    #[must_use]
    pub fn expected_ratio(&self) -> i32 {
        self.expected_ratio
    }

    /// Compresses `raw` into the framed rendering.
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = match &self.bytes {
            Some(dict) => zstd::bulk::Compressor::with_dictionary(COMPRESSION_LEVEL, dict)?,
            None => zstd::bulk::Compressor::new(COMPRESSION_LEVEL)?,
        };
        let frame = compressor.compress(raw)?;

        let mut out = Vec::with_capacity(RAW_LEN_PREFIX + frame.len());
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame);
        Ok(out)
    }

    /// Decompresses a framed rendering, verifying the recorded length.
    pub fn decompress(&self, framed: &[u8]) -> Result<Slice> {
        if framed.len() < RAW_LEN_PREFIX {
            return Err(DecodeError::InvalidHeader("compressed entry").into());
        }

        let raw_len =
            u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;

        let mut decompressor = match &self.bytes {
            Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict)?,
            None => zstd::bulk::Decompressor::new()?,
        };
        let raw = decompressor.decompress(&framed[RAW_LEN_PREFIX..], raw_len)?;

        if raw.len() != raw_len {
            return Err(Error::DecompressionSizeMismatch {
                expected: raw_len as u32,
                got: raw.len() as u32,
            });
        }

        Ok(Slice::from(raw))
    }
}

/// Trains a dictionary over `samples`, respecting [`TRAINING_CORPUS_CAP`].
///
/// Returns `None` when the codec cannot produce a dictionary (e.g. too few
/// or too uniform samples); that is not an error, the caller just keeps the
/// dictionary it has.
pub fn train(samples: &[Slice]) -> Option<Vec<u8>> {
    let mut corpus = Vec::new();
    let mut sizes = Vec::new();

    for sample in samples {
        if corpus.len() + sample.len() > TRAINING_CORPUS_CAP {
            break;
        }
        corpus.extend_from_slice(sample);
        sizes.push(sample.len());
    }

    if sizes.len() < 8 {
        return None;
    }

    match zstd::dict::from_continuous(&corpus, &sizes, DICTIONARY_TARGET_SIZE) {
        Ok(dict) => Some(dict),
        Err(e) => {
            log::debug!("dictionary training failed over {} samples: {e}", sizes.len());
            None
        }
    }
}

/// Process-wide cache of dictionary hash to decoded dictionary.
///
/// Entries live for the process; handles are shared. Materialization from
/// the dictionaries tree happens at most once per hash, under a short
/// exclusive lock.
pub struct DictionaryHolder {
    cache: parking_lot::RwLock<FxHashMap<DictionaryHash, Arc<CompressionDictionary>>>,
}

impl Default for DictionaryHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl DictionaryHolder {
    /// Creates an empty holder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: parking_lot::RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolves `hash` to a dictionary handle, reading the dictionaries tree
    /// on first use. A non-zero hash that is absent from the tree is a fatal
    /// data-integrity error.
    pub fn get(
        &self,
        dictionaries: &Tree<'_, '_>,
        hash: &DictionaryHash,
    ) -> Result<Arc<CompressionDictionary>> {
        if let Some(dict) = self.cache.read().get(hash) {
            return Ok(dict.clone());
        }

        if *hash == EMPTY_DICTIONARY_HASH {
            let dict = Arc::new(CompressionDictionary::empty());
            self.cache.write().insert(*hash, dict.clone());
            return Ok(dict);
        }

        let Some(row) = dictionaries.get(hash)? else {
            return Err(Error::DictionaryNotFound(format_dictionary_hash(hash)));
        };

        let mut reader = &row[..];
        let info = CompressionDictionaryInfo::decode_from(&mut reader)?;
        let dict = Arc::new(CompressionDictionary::new(
            *hash,
            info.expected_ratio,
            reader.to_vec(),
        ));

        self.cache.write().insert(*hash, dict.clone());
        Ok(dict)
    }

    /// Publishes a freshly trained dictionary so later readers skip the tree
    /// lookup.
    pub fn publish(&self, dict: Arc<CompressionDictionary>) {
        self.cache.write().insert(*dict.hash(), dict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_round_trip_without_dictionary() -> Result<()> {
        let dict = CompressionDictionary::empty();

        let raw = b"aaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb".repeat(10);
        let framed = dict.compress(&raw)?;
        assert!(framed.len() < raw.len());

        let decoded = dict.decompress(&framed)?;
        assert_eq!(&raw[..], &*decoded);

        Ok(())
    }

    #[test]
    fn length_mismatch_is_detected() -> Result<()> {
        let dict = CompressionDictionary::empty();

        let mut framed = dict.compress(b"some payload bytes")?;
        // corrupt the recorded length
        framed[0] ^= 0x01;

        assert!(matches!(
            dict.decompress(&framed),
            Err(Error::DecompressionSizeMismatch { .. } | Error::Io(_))
        ));

        Ok(())
    }

    #[test]
    fn training_needs_enough_samples() {
        let samples = vec![Slice::from(b"tiny"); 3];
        assert!(train(&samples).is_none());
    }

    #[test]
    fn trained_dictionary_round_trips() -> Result<()> {
        let samples = (0..64)
            .map(|i| Slice::from(format!("{{\"user\":\"user-{i}\",\"role\":\"editor\",\"active\":true}}")))
            .collect::<Vec<_>>();

        let Some(bytes) = train(&samples) else {
            // zstd may refuse tiny corpora; nothing further to check then
            return Ok(());
        };

        let dict = CompressionDictionary::new([1; 32], 50, bytes);
        let framed = dict.compress(&samples[0])?;
        assert_eq!(&*samples[0], &*dict.decompress(&framed)?);

        Ok(())
    }

    #[test]
    fn missing_dictionary_is_fatal() -> Result<()> {
        let env = crate::Environment::new();
        let tx = env.write_txn();
        let tree = tx.create_tree("dicts")?;

        let holder = DictionaryHolder::new();
        let err = holder.get(&tree, &[9; 32]).expect_err("must fail");
        assert!(matches!(err, Error::DictionaryNotFound(_)));

        // the zero hash resolves to the sentinel instead
        let dict = holder.get(&tree, &EMPTY_DICTIONARY_HASH)?;
        assert!(dict.is_empty());
        assert_eq!(EMPTY_DICTIONARY_RATIO, dict.expected_ratio());

        Ok(())
    }
}
