//! Dataset loading and tokenization.
//!
//! - [`dataset`]: JSON graph description → `GraphStore`
//! - [`tokenizer`]: corpus vocabulary or HuggingFace `tokenizer.json`

pub mod dataset;
pub mod tokenizer;

pub use dataset::{build_graph, DatasetFile, NodeRecord};
pub use tokenizer::{Encoded, HfTokenizer, Tokenize, VocabTokenizer};

use tracing::info;

use crate::error::TrainResult;
use crate::DataConfig;

/// The configured tokenizer: `tokenizer.json` when a path is set, otherwise a
/// vocabulary built from the dataset's documents.
pub fn load_tokenizer(config: &DataConfig, dataset: &DatasetFile) -> TrainResult<Box<dyn Tokenize>> {
    match &config.tokenizer_path {
        Some(path) => {
            let tokenizer = HfTokenizer::from_file(path)?;
            info!(path = %path.display(), vocab = tokenizer.vocab_size(), "Loaded tokenizer");
            Ok(Box::new(tokenizer))
        }
        None => {
            let docs: Vec<String> = dataset.documents().collect();
            let tokenizer = VocabTokenizer::from_corpus(docs.iter().map(String::as_str));
            info!(vocab = tokenizer.vocab_size(), "Built corpus vocabulary");
            Ok(Box::new(tokenizer))
        }
    }
}
