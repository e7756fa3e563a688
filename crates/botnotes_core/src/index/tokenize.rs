//! Tokenizer shared by indexing and querying.
//!
//! Terms are maximal runs of alphanumeric characters, lowercased.

use std::collections::BTreeMap;

/// Splits text into lowercase alphanumeric terms, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term frequencies for `text`, keyed by term in sorted order.
pub fn term_frequencies(text: &str) -> BTreeMap<String, u32> {
    let mut frequencies = BTreeMap::new();
    for term in tokenize(text) {
        *frequencies.entry(term).or_insert(0) += 1;
    }
    frequencies
}
