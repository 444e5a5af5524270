//! Deterministic mapping from a blockchain identity to a storage seed
//! phrase, without relying on per-session signatures (spec.md §4.1).

mod wordlist;

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Versioned domain tag mixed into every derivation so that a future format
/// change cannot collide with phrases produced by this version.
const DOMAIN_TAG: &str = "infermesh-seed-v1";

const ENTROPY_BYTES: usize = 16;
const WORD_COUNT: usize = 15;
const MAIN_WORD_COUNT: usize = 13;
const CHECKSUM_WORD_COUNT: usize = 2;

/// A 15-word deterministic phrase over the fixed 1024-word dictionary,
/// encoding 128 bits of entropy plus two checksum words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPhrase(pub Vec<String>);

impl SeedPhrase {
    pub fn as_words(&self) -> &[String] {
        &self.0
    }

    pub fn to_string_space_separated(&self) -> String {
        self.0.join(" ")
    }
}

impl std::fmt::Display for SeedPhrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_space_separated())
    }
}

/// Accumulates bits MSB-first and packs them into bytes once 8 bits are
/// available.
struct BitWriter {
    buffer: u32,
    bits_in_buffer: u32,
    out: Vec<u8>,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            buffer: 0,
            bits_in_buffer: 0,
            out: Vec::new(),
        }
    }

    fn push(&mut self, value: u16, width: u32) {
        self.buffer = (self.buffer << width) | (value as u32);
        self.bits_in_buffer += width;
        while self.bits_in_buffer >= 8 {
            let shift = self.bits_in_buffer - 8;
            let byte = ((self.buffer >> shift) & 0xFF) as u8;
            self.out.push(byte);
            self.bits_in_buffer -= 8;
            self.buffer &= (1 << self.bits_in_buffer) - 1;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits_in_buffer > 0 {
            let byte = ((self.buffer << (8 - self.bits_in_buffer)) & 0xFF) as u8;
            self.out.push(byte);
        }
        self.out
    }
}

/// Reads bits MSB-first out of a byte slice.
struct BitReader<'a> {
    bytes: &'a [u8],
    bit_offset: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            bit_offset: 0,
        }
    }

    fn read(&mut self, width: u32) -> u16 {
        let mut value: u32 = 0;
        for _ in 0..width {
            let byte_idx = self.bit_offset / 8;
            let bit_idx = 7 - (self.bit_offset % 8);
            let bit = (self.bytes[byte_idx] >> bit_idx) & 1;
            value = (value << 1) | bit as u32;
            self.bit_offset += 1;
        }
        value as u16
    }
}

/// Splits 128 bits of entropy into 13 dictionary words (12 x 10 bits + 1 x 8
/// bits), appends 2 Blake3-derived checksum words, and renders all 15 as a
/// phrase.
pub fn entropy_to_phrase(entropy: &[u8; ENTROPY_BYTES]) -> SeedPhrase {
    let mut writer = BitWriter::new();
    let mut words = Vec::with_capacity(WORD_COUNT);

    let mut reader = BitReader::new(entropy);
    for i in 0..MAIN_WORD_COUNT {
        let width = if i < MAIN_WORD_COUNT - 1 { 10 } else { 8 };
        let value = reader.read(width);
        words.push(wordlist::word_at(value as usize).to_string());
        writer.push(value, width);
    }
    debug_assert_eq!(writer.finish().len(), ENTROPY_BYTES);

    let checksum_bits = checksum_bits(entropy);
    let mut checksum_reader = BitReader::new(&checksum_bits);
    for _ in 0..CHECKSUM_WORD_COUNT {
        let value = checksum_reader.read(10);
        words.push(wordlist::word_at(value as usize).to_string());
    }

    SeedPhrase(words)
}

/// Inverse of `entropy_to_phrase`: recovers the original 16 bytes of
/// entropy from the first 13 words of a phrase. Does not require the
/// checksum words to validate (see `verify_checksum` for that).
pub fn phrase_to_entropy(phrase: &SeedPhrase) -> Result<[u8; ENTROPY_BYTES]> {
    if phrase.0.len() != WORD_COUNT {
        return Err(CoreError::InvalidEntropyLength {
            expected: WORD_COUNT,
            actual: phrase.0.len(),
        });
    }

    let mut writer = BitWriter::new();
    for (i, word) in phrase.0.iter().take(MAIN_WORD_COUNT).enumerate() {
        let width = if i < MAIN_WORD_COUNT - 1 { 10 } else { 8 };
        let index = wordlist::index_of(word).ok_or_else(|| CoreError::InvalidKey {
            reason: format!("word '{word}' is not in the dictionary"),
        })?;
        writer.push(index as u16, width);
    }
    let bytes = writer.finish();
    let mut entropy = [0u8; ENTROPY_BYTES];
    entropy.copy_from_slice(&bytes[..ENTROPY_BYTES]);
    Ok(entropy)
}

/// Whether the two checksum words at the end of `phrase` match what
/// `entropy_to_phrase` would have produced for its own main 13 words.
pub fn verify_checksum(phrase: &SeedPhrase) -> Result<bool> {
    let entropy = phrase_to_entropy(phrase)?;
    let expected = entropy_to_phrase(&entropy);
    Ok(expected.0[MAIN_WORD_COUNT..] == phrase.0[MAIN_WORD_COUNT..])
}

fn checksum_bits(entropy: &[u8; ENTROPY_BYTES]) -> [u8; 3] {
    let digest = blake3::hash(entropy);
    let bytes = digest.as_bytes();
    // 20 bits (2 x 10-bit words) fit comfortably in the first 3 bytes.
    [bytes[0], bytes[1], bytes[2]]
}

/// Deterministic mapping from a blockchain identity to a storage seed
/// phrase. Memoizes per `(address, chain_id)` in-process; the algorithm is
/// correct without the cache.
pub struct IdentityKeyDerivation {
    cache: Mutex<HashMap<(String, u64), SeedPhrase>>,
}

impl Default for IdentityKeyDerivation {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityKeyDerivation {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `deriveSeedFromAddress`: concatenates the versioned domain tag with
    /// the lowercased address and chain id, hashes with SHA-256, truncates
    /// to 16 bytes of entropy.
    pub fn derive_seed_from_address(&self, address: &str, chain_id: u64) -> SeedPhrase {
        let key = (address.to_lowercase(), chain_id);
        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG.as_bytes());
        hasher.update(key.0.as_bytes());
        hasher.update(chain_id.to_be_bytes());
        let digest = hasher.finalize();

        let mut entropy = [0u8; ENTROPY_BYTES];
        entropy.copy_from_slice(&digest[..ENTROPY_BYTES]);
        let phrase = entropy_to_phrase(&entropy);

        self.cache.lock().insert(key, phrase.clone());
        phrase
    }

    /// `deriveSeedFromPrivateKey`: hashes the normalized 32-byte private key
    /// directly, with no address/chain mixed in (a private key has no
    /// notion of chain).
    pub fn derive_seed_from_private_key(&self, private_key: &[u8]) -> Result<SeedPhrase> {
        if private_key.len() != 32 {
            return Err(CoreError::InvalidKey {
                reason: format!(
                    "expected a 32-byte private key, got {} bytes",
                    private_key.len()
                ),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG.as_bytes());
        hasher.update(b"privkey");
        hasher.update(private_key);
        let digest = hasher.finalize();

        let mut entropy = [0u8; ENTROPY_BYTES];
        entropy.copy_from_slice(&digest[..ENTROPY_BYTES]);
        Ok(entropy_to_phrase(&entropy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let d = IdentityKeyDerivation::new();
        let a = d.derive_seed_from_address("0xAAAA", 84532);
        let b = d.derive_seed_from_address("0xAAAA", 84532);
        assert_eq!(a, b);
    }

    #[test]
    fn chain_id_provides_cross_chain_isolation() {
        let d = IdentityKeyDerivation::new();
        let base_sepolia = d.derive_seed_from_address("0xAAAA", 84532);
        let opbnb_testnet = d.derive_seed_from_address("0xAAAA", 5611);
        assert_ne!(base_sepolia, opbnb_testnet);
    }

    #[test]
    fn entropy_round_trips_through_phrase() {
        let entropy: [u8; 16] = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
        ];
        let phrase = entropy_to_phrase(&entropy);
        assert_eq!(phrase.0.len(), WORD_COUNT);
        let recovered = phrase_to_entropy(&phrase).unwrap();
        assert_eq!(recovered, entropy);
        assert!(verify_checksum(&phrase).unwrap());
    }

    #[test]
    fn tampered_checksum_is_detected() {
        let entropy = [0u8; 16];
        let mut phrase = entropy_to_phrase(&entropy);
        phrase.0[13] = phrase.0[14].clone();
        assert!(!verify_checksum(&phrase).unwrap());
    }

    #[test]
    fn invalid_private_key_length_is_rejected() {
        let d = IdentityKeyDerivation::new();
        let err = d.derive_seed_from_private_key(&[0u8; 31]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey { .. }));
    }
}
