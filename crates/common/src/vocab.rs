//! Token vocabulary descriptor.
//!
//! JSON layout (as written by `charrnn-preprocess`):
//!
//! ```text
//! {
//!   "idx_to_token": { "1": "\n", "2": " ", ... },
//!   "token_to_idx": { "\n": 1, " ": 2, ... }
//! }
//! ```
//!
//! Indices start at 1; index 0 is never assigned, so `vocab_size` is
//! `max index + 1`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct VocabFile {
    idx_to_token: BTreeMap<String, String>,
    token_to_idx: BTreeMap<String, u32>,
}

/// Bidirectional token ↔ index mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenVocab {
    idx_to_token: BTreeMap<u32, String>,
    token_to_idx: HashMap<String, u32>,
}

impl TokenVocab {
    /// Load the descriptor. Fails on malformed JSON, non-integer indices or
    /// when the two maps disagree.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read vocabulary {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("parse vocabulary {}", path.display()))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: VocabFile = serde_json::from_str(json)?;
        let mut idx_to_token = BTreeMap::new();
        for (idx, token) in raw.idx_to_token {
            let idx: u32 = idx
                .parse()
                .with_context(|| format!("index `{idx}` is not an unsigned integer"))?;
            idx_to_token.insert(idx, token);
        }
        if idx_to_token.is_empty() {
            bail!("vocabulary is empty");
        }
        if idx_to_token.len() != raw.token_to_idx.len() {
            bail!(
                "idx_to_token has {} entries but token_to_idx has {}",
                idx_to_token.len(),
                raw.token_to_idx.len()
            );
        }
        for (token, idx) in &raw.token_to_idx {
            match idx_to_token.get(idx) {
                Some(t) if t == token => {}
                _ => bail!("token {token:?} maps to {idx}, which does not map back"),
            }
        }
        Ok(Self {
            idx_to_token,
            token_to_idx: raw.token_to_idx.into_iter().collect(),
        })
    }

    /// Character vocabulary of `text`: sorted unique chars, indices from 1.
    pub fn from_text(text: &str) -> Self {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        let mut idx_to_token = BTreeMap::new();
        let mut token_to_idx = HashMap::new();
        for (i, ch) in chars.into_iter().enumerate() {
            let idx = i as u32 + 1;
            idx_to_token.insert(idx, ch.to_string());
            token_to_idx.insert(ch.to_string(), idx);
        }
        Self {
            idx_to_token,
            token_to_idx,
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = VocabFile {
            idx_to_token: self
                .idx_to_token
                .iter()
                .map(|(i, t)| (i.to_string(), t.clone()))
                .collect(),
            token_to_idx: self
                .token_to_idx
                .iter()
                .map(|(t, i)| (t.clone(), *i))
                .collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&raw)?)
            .with_context(|| format!("write vocabulary {}", path.display()))?;
        Ok(())
    }

    /// Embedding rows needed to cover every index.
    pub fn vocab_size(&self) -> usize {
        self.idx_to_token
            .keys()
            .next_back()
            .map_or(0, |&max| max as usize + 1)
    }

    pub fn len(&self) -> usize {
        self.idx_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_to_token.is_empty()
    }

    /// Encode text one character at a time.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let mut buf = [0u8; 4];
        text.chars()
            .map(|ch| {
                let key: &str = ch.encode_utf8(&mut buf);
                self.token_to_idx
                    .get(key)
                    .copied()
                    .with_context(|| format!("character {ch:?} is not in the vocabulary"))
            })
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|id| self.idx_to_token.get(id))
            .map(String::as_str)
            .collect()
    }
}
