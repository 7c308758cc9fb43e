//! Document tokenization to fixed-length id/mask rows.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{TrainError, TrainResult};

/// One tokenized document, padded or truncated to `max_length`.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub mask: Vec<f32>,
}

impl Encoded {
    /// Truncate `ids` to `max_length` and pad with `pad_id`.
    fn fit(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Self {
        ids.truncate(max_length);
        let real = ids.len();
        ids.resize(max_length, pad_id);
        let mut mask = vec![0.0; max_length];
        mask[..real].fill(1.0);
        Self { ids, mask }
    }

    /// Number of real (non-padding) tokens.
    pub fn len(&self) -> usize {
        self.mask.iter().filter(|&&m| m > 0.0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns document text into token ids.
pub trait Tokenize {
    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str, max_length: usize) -> TrainResult<Encoded>;
}

// ============================================================================
// Corpus vocabulary
// ============================================================================

pub const PAD_TOKEN: &str = "[PAD]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const UNK_TOKEN: &str = "[UNK]";

/// Whitespace tokenizer over a vocabulary built from the corpus itself.
///
/// Ids 0..4 are reserved for `[PAD] [CLS] [SEP] [UNK]`; words follow in
/// lexicographic order so the same corpus always yields the same ids.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    vocab: HashMap<String, u32>,
}

impl VocabTokenizer {
    pub fn from_corpus<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let words: BTreeSet<String> = texts
            .into_iter()
            .flat_map(|text| text.split_whitespace())
            .map(|word| word.to_lowercase())
            .collect();

        let vocab = [PAD_TOKEN, CLS_TOKEN, SEP_TOKEN, UNK_TOKEN]
            .into_iter()
            .map(String::from)
            .chain(words)
            .enumerate()
            .map(|(id, token)| (token, id as u32))
            .collect();
        Self { vocab }
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn special(&self, token: &str) -> u32 {
        self.vocab.get(token).copied().unwrap_or_default()
    }
}

impl Tokenize for VocabTokenizer {
    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn encode(&self, text: &str, max_length: usize) -> TrainResult<Encoded> {
        if max_length < 2 {
            return Err(TrainError::Tokenizer(format!(
                "max_length {} leaves no room for [CLS] and [SEP]",
                max_length
            )));
        }
        let unk = self.special(UNK_TOKEN);
        let mut ids = vec![self.special(CLS_TOKEN)];
        ids.extend(
            text.split_whitespace()
                .take(max_length - 2)
                .map(|word| self.vocab.get(&word.to_lowercase()).copied().unwrap_or(unk)),
        );
        ids.push(self.special(SEP_TOKEN));
        Ok(Encoded::fit(ids, max_length, self.special(PAD_TOKEN)))
    }
}

// ============================================================================
// HuggingFace tokenizer
// ============================================================================

/// A `tokenizer.json` loaded with the `tokenizers` crate.
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> TrainResult<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            TrainError::Tokenizer(format!(
                "failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        let pad_id = ["[PAD]", "<pad>"]
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .unwrap_or(0);
        Ok(Self { inner, pad_id })
    }
}

impl Tokenize for HfTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, text: &str, max_length: usize) -> TrainResult<Encoded> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TrainError::Tokenizer(format!("tokenization failed: {}", e)))?;
        Ok(Encoded::fit(encoding.get_ids().to_vec(), max_length, self.pad_id))
    }
}
