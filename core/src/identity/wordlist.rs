//! The 1024-word dictionary used by `entropy_to_phrase`/`phrase_to_entropy`.
//!
//! Generated combinatorially from 32 adjectives x 32 nouns rather than
//! hand-typed or copied from a real BIP-39 list: the exact words are not
//! semantically load-bearing, only their count (1024 = 2^10, so each word
//! carries exactly 10 bits) and a fixed, stable ordering.

use std::sync::OnceLock;

const ADJECTIVES: [&str; 32] = [
    "amber", "brave", "calm", "dusty", "eager", "faint", "giant", "hollow",
    "icy", "jolly", "keen", "lucid", "misty", "noble", "odd", "pale",
    "quick", "rigid", "sharp", "tidy", "umber", "vivid", "warm", "xenial",
    "young", "zesty", "ashen", "bold", "crisp", "dim", "even", "fond",
];

const NOUNS: [&str; 32] = [
    "anchor", "badger", "canyon", "delta", "ember", "falcon", "glacier", "harbor",
    "island", "jasper", "kernel", "lantern", "meadow", "nebula", "oasis", "pebble",
    "quarry", "river", "summit", "thicket", "utopia", "valley", "willow", "xylophone",
    "yonder", "zephyr", "arbor", "basin", "cinder", "dune", "thistle", "forge",
];

/// Number of words in the dictionary. Fixed; every index in `0..DICTIONARY_LEN`
/// maps to exactly one word and vice versa.
pub const DICTIONARY_LEN: usize = 1024;

fn dictionary() -> &'static Vec<String> {
    static DICT: OnceLock<Vec<String>> = OnceLock::new();
    DICT.get_or_init(|| {
        let mut words = Vec::with_capacity(DICTIONARY_LEN);
        for adj in ADJECTIVES.iter() {
            for noun in NOUNS.iter() {
                words.push(format!("{adj}{noun}"));
            }
        }
        words
    })
}

/// Word at a given 10-bit index. Panics if `index >= DICTIONARY_LEN`; callers
/// only ever derive indices from a fixed bit width, so this never happens on
/// the encode path.
pub fn word_at(index: usize) -> &'static str {
    &dictionary()[index]
}

/// Reverse lookup used when parsing a phrase back into entropy.
pub fn index_of(word: &str) -> Option<usize> {
    dictionary().iter().position(|w| w == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_has_1024_unique_words() {
        let dict = dictionary();
        assert_eq!(dict.len(), DICTIONARY_LEN);
        let unique: std::collections::HashSet<_> = dict.iter().collect();
        assert_eq!(unique.len(), DICTIONARY_LEN);
    }

    #[test]
    fn word_at_and_index_of_round_trip() {
        for idx in [0usize, 1, 500, 1023] {
            let word = word_at(idx);
            assert_eq!(index_of(word), Some(idx));
        }
    }
}
