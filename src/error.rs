// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the table engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// The requested schema does not match the schema stored in the table root
    SchemaMismatch {
        /// Table name
        table: String,
    },

    /// A well-known record (stats slot, active-section slot, index tree, ...)
    /// is absent from a table root
    MissingStructure(&'static str),

    /// A page number does not resolve to any allocated page run
    PageNotFound(u64),

    /// Insert attempted with a key that already exists in a unique index
    DuplicateKey {
        /// Name of the violated index
        index: String,
    },

    /// Deletion attempted but the index entry is missing.
    ///
    /// This must never happen; it indicates an engine bug or external page
    /// damage and is not recoverable.
    IndexInconsistency {
        /// Name of the corrupted index
        index: String,
        /// Storage id whose index entry is missing
        id: u64,
    },

    /// A storage id belongs to a section or overflow run owned by a
    /// different table
    OwnerMismatch {
        /// The offending storage id
        id: u64,
    },

    /// A non-zero dictionary hash could not be resolved through the
    /// dictionaries tree (base64 of the hash)
    DictionaryNotFound(String),

    /// Decompressed length differs from the recorded length
    DecompressionSizeMismatch {
        /// Length recorded alongside the compressed stream
        expected: u32,
        /// Length the codec produced
        got: u32,
    },

    /// Allocation still failed after switching the active section
    AllocationFailure,

    /// Mutation attempted through a table opened for global-index reads
    ReadOnlyTable,

    /// Mutation attempted inside a read-only transaction
    ReadOnlyTransaction,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapTableError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Table engine result
pub type Result<T> = std::result::Result<T, Error>;
