// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Blind search index over encrypted fields.
//!
//! Plaintext is tokenized into words; each word is keyed-hashed with a
//! field-scoped MAC and the encrypted-field reference is appended to that
//! hash's bucket. Equality search recomputes the hash and returns the
//! bucket; the index never stores or learns plaintext.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::crypto::keyed_hash;
use crate::storage::{CoreStorage, StorageResult};

/// Words shorter than this are too common to index.
const MIN_WORD_LEN: usize = 2;

/// Persisted bucket file for one field.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FieldBuckets {
    /// blind token → encrypted-field references.
    buckets: HashMap<String, Vec<String>>,
}

/// The blind index service. Buckets are cached in memory and written
/// through to storage on every update.
pub struct BlindIndex {
    key: [u8; 32],
    storage: Arc<CoreStorage>,
    cache: RwLock<HashMap<String, FieldBuckets>>,
}

impl BlindIndex {
    pub fn new(key: [u8; 32], storage: Arc<CoreStorage>) -> Self {
        Self {
            key,
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Index a plaintext value under its encrypted-field reference.
    pub fn index(&self, field: &str, plaintext: &str, reference: &str) -> StorageResult<()> {
        let tokens: Vec<String> = tokenize(plaintext)
            .map(|word| keyed_hash::blind_token(&self.key, field, word))
            .collect();
        if tokens.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.write().expect("blind index lock poisoned");
        self.load_if_absent(&mut cache, field)?;
        let buckets = cache.entry(field.to_string()).or_default();

        for token in tokens {
            let bucket = buckets.buckets.entry(token).or_default();
            if !bucket.iter().any(|r| r == reference) {
                bucket.push(reference.to_string());
            }
        }

        self.storage
            .write_json(self.storage.paths().field_index(field), &*buckets)
    }

    /// Return the references whose plaintext contained `term`.
    ///
    /// Non-matching entries are never touched: the search hashes the term
    /// and reads one bucket.
    pub fn search(&self, field: &str, term: &str) -> StorageResult<Vec<String>> {
        let token = keyed_hash::blind_token(&self.key, field, term.trim());

        {
            let cache = self.cache.read().expect("blind index lock poisoned");
            if let Some(buckets) = cache.get(field) {
                return Ok(buckets.buckets.get(&token).cloned().unwrap_or_default());
            }
        }

        let mut cache = self.cache.write().expect("blind index lock poisoned");
        self.load_if_absent(&mut cache, field)?;
        Ok(cache
            .get(field)
            .and_then(|b| b.buckets.get(&token))
            .cloned()
            .unwrap_or_default())
    }

    fn load_if_absent(
        &self,
        cache: &mut HashMap<String, FieldBuckets>,
        field: &str,
    ) -> StorageResult<()> {
        if cache.contains_key(field) {
            return Ok(());
        }
        let path = self.storage.paths().field_index(field);
        let buckets = if self.storage.exists(&path) {
            self.storage.read_json(&path)?
        } else {
            FieldBuckets::default()
        };
        cache.insert(field.to_string(), buckets);
        Ok(())
    }
}

/// Split text into indexable words. Normalization (NFKC, lowercasing)
/// happens inside the blind-token MAC so search terms and indexed words
/// take the identical path.
fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoragePaths;
    use tempfile::TempDir;

    fn test_index() -> (TempDir, BlindIndex) {
        let temp = TempDir::new().unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), [6u8; 32]);
        storage.initialize().unwrap();
        (temp, BlindIndex::new([7u8; 32], Arc::new(storage)))
    }

    #[test]
    fn indexed_words_are_searchable() {
        let (_temp, index) = test_index();
        index
            .index("journal_entry", "anxiety journal", "fld_1")
            .unwrap();

        assert_eq!(index.search("journal_entry", "anxiety").unwrap(), vec!["fld_1"]);
        assert_eq!(index.search("journal_entry", "journal").unwrap(), vec!["fld_1"]);
        assert!(index.search("journal_entry", "joyful").unwrap().is_empty());
    }

    #[test]
    fn search_is_case_insensitive() {
        let (_temp, index) = test_index();
        index.index("journal_entry", "Sleep Hygiene", "fld_2").unwrap();
        assert_eq!(index.search("journal_entry", "sleep").unwrap(), vec!["fld_2"]);
        assert_eq!(index.search("journal_entry", "SLEEP").unwrap(), vec!["fld_2"]);
    }

    #[test]
    fn fields_are_isolated() {
        let (_temp, index) = test_index();
        index.index("journal_entry", "anxiety", "fld_3").unwrap();
        assert!(index.search("therapy_notes", "anxiety").unwrap().is_empty());
    }

    #[test]
    fn duplicate_references_collapse() {
        let (_temp, index) = test_index();
        index.index("journal_entry", "calm calm calm", "fld_4").unwrap();
        assert_eq!(index.search("journal_entry", "calm").unwrap(), vec!["fld_4"]);
    }

    #[test]
    fn buckets_survive_reload() {
        let temp = TempDir::new().unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), [6u8; 32]);
        storage.initialize().unwrap();
        let storage = Arc::new(storage);

        {
            let index = BlindIndex::new([7u8; 32], storage.clone());
            index.index("journal_entry", "resilience", "fld_5").unwrap();
        }

        let reopened = BlindIndex::new([7u8; 32], storage);
        assert_eq!(
            reopened.search("journal_entry", "resilience").unwrap(),
            vec!["fld_5"]
        );
    }

    #[test]
    fn short_words_are_not_indexed() {
        let (_temp, index) = test_index();
        index.index("journal_entry", "a be sea", "fld_6").unwrap();
        assert!(index.search("journal_entry", "a").unwrap().is_empty());
        assert_eq!(index.search("journal_entry", "be").unwrap(), vec!["fld_6"]);
    }
}
