//! Read-only passage store.
//!
//! Maps passage ids to text. The store is loaded once at startup and shared
//! across queries behind an `Arc`; nothing mutates it afterwards.
//!
//! Accepted JSON layouts:
//!
//! ```json
//! ["first passage", "second passage"]
//! [{"id": 0, "text": "first passage"}, {"id": 4, "text": "another"}]
//! {"0": "first passage", "4": "another"}
//! ```
//!
//! In the plain array form the array index is the passage id.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::models::Passage;

#[derive(Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Texts(Vec<String>),
    Records(Vec<PassageRecord>),
    Map(BTreeMap<String, String>),
}

#[derive(Deserialize)]
struct PassageRecord {
    id: i64,
    text: String,
}

/// Immutable id → text mapping loaded from a JSON file.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    /// Sorted by id, ids unique.
    passages: Vec<Passage>,
    fingerprint: [u8; 32],
}

impl DocumentStore {
    /// Load a store file.
    ///
    /// # Errors
    ///
    /// [`RagError::StoreLoad`] if the file is missing, not valid JSON in
    /// one of the accepted layouts, or contains negative or duplicate ids.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| store_err(path, e.to_string()))?;
        let fingerprint = fingerprint_bytes(&bytes);
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| store_err(path, format!("invalid JSON: {}", e)))?;

        let passages = match file {
            StoreFile::Texts(texts) => texts
                .into_iter()
                .enumerate()
                .map(|(i, text)| Passage { id: i as i64, text })
                .collect(),
            StoreFile::Records(records) => records
                .into_iter()
                .map(|r| Passage {
                    id: r.id,
                    text: r.text,
                })
                .collect(),
            StoreFile::Map(map) => map
                .into_iter()
                .map(|(key, text)| {
                    key.trim()
                        .parse::<i64>()
                        .map(|id| Passage { id, text })
                        .map_err(|_| store_err(path, format!("key '{}' is not an integer id", key)))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Self::build(passages, fingerprint).map_err(|message| store_err(path, message))
    }

    /// Build a store from in-memory passages.
    pub fn from_passages(passages: Vec<Passage>) -> Result<Self> {
        Self::build(passages, [0u8; 32]).map_err(RagError::InvalidArgument)
    }

    /// Build a store whose ids are the positions of `texts`.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let passages = texts
            .into_iter()
            .enumerate()
            .map(|(i, t)| Passage {
                id: i as i64,
                text: t.into(),
            })
            .collect();
        Self {
            passages,
            fingerprint: [0u8; 32],
        }
    }

    fn build(mut passages: Vec<Passage>, fingerprint: [u8; 32]) -> std::result::Result<Self, String> {
        if let Some(p) = passages.iter().find(|p| p.id < 0) {
            return Err(format!("negative passage id {}", p.id));
        }
        passages.sort_by_key(|p| p.id);
        if let Some(w) = passages.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(format!("duplicate passage id {}", w[0].id));
        }
        Ok(Self {
            passages,
            fingerprint,
        })
    }

    /// Text of passage `id`.
    ///
    /// # Errors
    ///
    /// [`RagError::OutOfRange`] if `id` is negative or unknown.
    pub fn get(&self, id: i64) -> Result<&str> {
        let out_of_range = || RagError::OutOfRange {
            id,
            len: self.passages.len(),
        };
        if id < 0 {
            return Err(out_of_range());
        }
        // Dense stores hit on the first lookup.
        if let Some(p) = self.passages.get(id as usize) {
            if p.id == id {
                return Ok(&p.text);
            }
        }
        self.passages
            .binary_search_by_key(&id, |p| p.id)
            .map(|pos| self.passages[pos].text.as_str())
            .map_err(|_| out_of_range())
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Largest passage id, if any.
    pub fn max_id(&self) -> Option<i64> {
        self.passages.last().map(|p| p.id)
    }

    /// SHA-256 of the file bytes the store was loaded from (zero for in-memory stores).
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }
}

/// SHA-256 fingerprint of raw store file bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn store_err(path: &Path, message: String) -> RagError {
    RagError::StoreLoad {
        path: PathBuf::from(path),
        message,
    }
}
