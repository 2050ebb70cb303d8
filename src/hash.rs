// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Owner hashes and dictionary hashes.

/// Width of a dictionary hash in bytes.
pub const DICTIONARY_HASH_SIZE: usize = 32;

/// Keyed 32-byte hash identifying a compression dictionary.
pub type DictionaryHash = [u8; DICTIONARY_HASH_SIZE];

/// The all-zero hash, denoting "no dictionary".
pub const EMPTY_DICTIONARY_HASH: DictionaryHash = [0; DICTIONARY_HASH_SIZE];

/// 64-bit hash used for section/overflow ownership checks.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Keyed BLAKE2b-256 over `data`; the key is the owning table's name, so the
/// same dictionary bytes hash differently per table.
#[must_use]
pub fn dictionary_hash(data: &[u8], key: &[u8]) -> DictionaryHash {
    let mut state = blake2_rfc::blake2b::Blake2b::with_key(DICTIONARY_HASH_SIZE, key);
    state.update(data);

    let mut out = EMPTY_DICTIONARY_HASH;
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

/// Base64 rendering of a dictionary hash, for diagnostics.
#[must_use]
pub fn format_dictionary_hash(hash: &DictionaryHash) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_hash_is_keyed() {
        let a = dictionary_hash(b"some dictionary bytes", b"table-a");
        let b = dictionary_hash(b"some dictionary bytes", b"table-b");
        assert_ne!(a, b);
        assert_ne!(a, EMPTY_DICTIONARY_HASH);
    }

    #[test]
    fn dictionary_hash_is_stable() {
        let a = dictionary_hash(b"dict", b"t");
        let b = dictionary_hash(b"dict", b"t");
        assert_eq!(a, b);
    }
}
